//! Enrutado de mensajes pub/sub.
//!
//! Una vez que una conexion se suscribe a un canal, el servidor le envia
//! mensajes push que no corresponden a ninguna peticion pendiente. El
//! `Router` es el componente de la conexion que recibe esos mensajes y los
//! reparte a los suscriptores registrados.
//!
//! Cada suscriptor tiene un canal `mpsc` acotado. El bucle de lectura nunca
//! espera a un suscriptor lento: si su cola esta llena el mensaje se
//! descarta y se contabiliza, y el suscriptor recibe un
//! `Error::SubscriberOverflow` la proxima vez que consulte su cola.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::futures::Notified;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tracing::{debug, warn};

use crate::parse::Parse;
use crate::{Error, Frame};

/// Forma de casar una suscripcion con los mensajes publicados.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Nombre de canal exacto (`SUBSCRIBE`).
    Exact,
    /// Patron glob evaluado por el servidor (`PSUBSCRIBE`).
    Pattern,
}

impl Mode {
    pub(crate) fn subscribe_command(self) -> &'static str {
        match self {
            Mode::Exact => "SUBSCRIBE",
            Mode::Pattern => "PSUBSCRIBE",
        }
    }

    pub(crate) fn unsubscribe_command(self) -> &'static str {
        match self {
            Mode::Exact => "UNSUBSCRIBE",
            Mode::Pattern => "PUNSUBSCRIBE",
        }
    }
}

/// Mensaje publicado en un canal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Canal en el que se publico el mensaje.
    pub channel: Bytes,
    /// Patron que ha casado, solo para suscripciones por patron.
    pub pattern: Option<Bytes>,
    pub payload: Bytes,
}

/// Stream de mensajes de una suscripcion.
pub type Messages = Pin<Box<dyn Stream<Item = crate::Result<Message>> + Send>>;

/// Extremo del router hacia un suscriptor.
#[derive(Clone, Debug)]
struct Sink {
    tx: mpsc::Sender<Message>,
    dropped: Arc<AtomicU64>,
}

type Key = (Mode, Bytes);
type Confirm = oneshot::Sender<crate::Result<()>>;

/// Resultado de enrutar un mensaje push.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Routed {
    /// Mensaje entregado (o descartado) a los suscriptores.
    Delivered,
    /// Confirmacion de (un)subscribe. `push_context` indica si la conexion
    /// sigue teniendo suscripciones activas o en curso.
    Confirmed { push_context: bool },
    /// Push que no es de pub/sub (RESP3); se ignora.
    Ignored,
}

#[derive(Debug)]
pub(crate) struct Router {
    state: Mutex<RouterState>,
    backlog: usize,

    /// Se notifica cuando un objetivo activo puede haberse quedado sin
    /// suscriptores.
    abandoned: Arc<Notify>,
}

#[derive(Debug, Default)]
struct RouterState {
    /// Suscripciones confirmadas por el servidor.
    active: HashMap<Key, Vec<Sink>>,
    /// Suscripciones enviadas y pendientes de confirmacion, en orden.
    subscribing: HashMap<Key, VecDeque<(Sink, Confirm)>>,
    /// Bajas enviadas y pendientes de confirmacion.
    unsubscribing: HashMap<Key, VecDeque<Confirm>>,
    closed: bool,
}

impl RouterState {
    fn push_context(&self) -> bool {
        !self.active.is_empty() || !self.subscribing.is_empty() || !self.unsubscribing.is_empty()
    }
}

const PUSH_MARKERS: [&[u8]; 5] = [
    b"message",
    b"subscribe",
    b"unsubscribe",
    b"psubscribe",
    b"punsubscribe",
];

/// `true` si el array tiene la forma de un mensaje push de pub/sub: 3 o 4
/// elementos cuyo primer elemento es uno de los marcadores reservados.
pub(crate) fn is_push(items: &[Frame]) -> bool {
    let marker = match items.first().and_then(Frame::as_bytes) {
        Some(marker) => marker,
        None => return false,
    };

    match items.len() {
        3 => PUSH_MARKERS.iter().any(|m| marker.eq_ignore_ascii_case(m)),
        4 => marker.eq_ignore_ascii_case(b"pmessage"),
        _ => false,
    }
}

impl Router {
    pub(crate) fn new(backlog: usize) -> Router {
        Router {
            state: Mutex::new(RouterState::default()),
            backlog,
            abandoned: Arc::new(Notify::new()),
        }
    }

    /// Se completa cuando algun suscriptor se ha descartado.
    pub(crate) fn abandoned(&self) -> Notified<'_> {
        self.abandoned.notified()
    }

    /// `true` mientras haya suscripciones activas o confirmaciones
    /// pendientes. Solo en ese contexto un array con forma de push se
    /// desvia al router.
    pub(crate) fn is_push_context(&self) -> bool {
        self.state.lock().unwrap().push_context()
    }

    /// Registra una suscripcion a `targets` antes de escribir el comando.
    /// Retorna el handle del suscriptor y un receptor de confirmacion por
    /// cada objetivo.
    pub(crate) fn register_subscribe(
        &self,
        mode: Mode,
        targets: &[Bytes],
    ) -> crate::Result<(Subscription, Vec<oneshot::Receiver<crate::Result<()>>>)> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(Error::ConnectionClosed);
        }

        let (tx, rx) = mpsc::channel(self.backlog);
        let dropped = Arc::new(AtomicU64::new(0));
        let sink = Sink {
            tx,
            dropped: dropped.clone(),
        };

        let mut confirmations = Vec::with_capacity(targets.len());
        for target in targets {
            let (confirm_tx, confirm_rx) = oneshot::channel();
            state
                .subscribing
                .entry((mode, target.clone()))
                .or_default()
                .push_back((sink.clone(), confirm_tx));
            confirmations.push(confirm_rx);
        }

        let subscription = Subscription {
            mode,
            targets: targets.to_vec(),
            rx,
            dropped,
            reported: 0,
            abandoned: self.abandoned.clone(),
        };

        Ok((subscription, confirmations))
    }

    /// Registra la baja de los objetivos que tienen una suscripcion activa.
    /// Los que no la tienen se omiten: darse de baja de algo no suscrito no
    /// hace nada.
    pub(crate) fn register_unsubscribe(
        &self,
        mode: Mode,
        targets: &[Bytes],
    ) -> crate::Result<(Vec<Bytes>, Vec<oneshot::Receiver<crate::Result<()>>>)> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Ok((vec![], vec![]));
        }

        let mut active = vec![];
        let mut confirmations = vec![];
        for target in targets {
            let key = (mode, target.clone());
            if !state.active.contains_key(&key) {
                continue;
            }

            let (confirm_tx, confirm_rx) = oneshot::channel();
            state.unsubscribing.entry(key).or_default().push_back(confirm_tx);
            active.push(target.clone());
            confirmations.push(confirm_rx);
        }

        Ok((active, confirmations))
    }

    /// Retira los objetivos activos que ya no tienen ningun suscriptor y
    /// registra su baja. Retorna los objetivos retirados agrupados por modo.
    ///
    /// Las suscripciones aun sin confirmar no se tocan: su confirmacion
    /// llega como push y se retiran entonces.
    pub(crate) fn reap(&self) -> Vec<(Mode, Vec<Bytes>)> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return vec![];
        }

        let mut stale = vec![];
        state.active.retain(|key, sinks| {
            sinks.retain(|sink| !sink.tx.is_closed());
            if sinks.is_empty() {
                stale.push(key.clone());
                return false;
            }
            true
        });

        let mut released: Vec<(Mode, Vec<Bytes>)> = vec![];
        for (mode, target) in stale {
            // Nadie espera la confirmacion de estas bajas.
            let (confirm_tx, _) = oneshot::channel();
            state
                .unsubscribing
                .entry((mode, target.clone()))
                .or_default()
                .push_back(confirm_tx);

            match released.iter_mut().find(|(m, _)| *m == mode) {
                Some((_, targets)) => targets.push(target),
                None => released.push((mode, vec![target])),
            }
        }

        released
    }

    /// Objetivos con suscripcion activa en el modo indicado.
    pub(crate) fn active_targets(&self, mode: Mode) -> Vec<Bytes> {
        let state = self.state.lock().unwrap();
        state
            .active
            .keys()
            .filter(|(m, _)| *m == mode)
            .map(|(_, target)| target.clone())
            .collect()
    }

    /// Procesa un mensaje push ya decodificado.
    pub(crate) fn route(&self, frame: Frame) -> crate::Result<Routed> {
        let resp3 = matches!(frame, Frame::Push(_));
        let mut parse = Parse::new(frame)?;
        let kind = parse.next_string()?.to_ascii_lowercase();

        match &kind[..] {
            "message" => {
                let channel = parse.next_bytes()?;
                let payload = parse.next_bytes()?;
                parse.finish()?;

                let message = Message {
                    channel: channel.clone(),
                    pattern: None,
                    payload,
                };
                self.deliver((Mode::Exact, channel), message);
                Ok(Routed::Delivered)
            }
            "pmessage" => {
                let pattern = parse.next_bytes()?;
                let channel = parse.next_bytes()?;
                let payload = parse.next_bytes()?;
                parse.finish()?;

                let message = Message {
                    channel,
                    pattern: Some(pattern.clone()),
                    payload,
                };
                self.deliver((Mode::Pattern, pattern), message);
                Ok(Routed::Delivered)
            }
            "subscribe" | "psubscribe" => {
                let mode = if kind == "subscribe" { Mode::Exact } else { Mode::Pattern };
                let target = parse.next_bytes()?;
                let count = parse.next_int()?;
                parse.finish()?;

                debug!(?mode, ?target, count, "subscription confirmed");
                Ok(self.confirm_subscribe((mode, target)))
            }
            "unsubscribe" | "punsubscribe" => {
                let mode = if kind == "unsubscribe" { Mode::Exact } else { Mode::Pattern };
                let target = parse.next_bytes()?;
                let count = parse.next_int()?;
                parse.finish()?;

                debug!(?mode, ?target, count, "unsubscription confirmed");
                Ok(self.confirm_unsubscribe((mode, target)))
            }
            other if resp3 => {
                debug!(kind = other, "ignoring push message");
                Ok(Routed::Ignored)
            }
            other => Err(Error::Protocol(format!("unexpected push message `{}`", other))),
        }
    }

    fn deliver(&self, key: Key, message: Message) {
        let mut state = self.state.lock().unwrap();
        let sinks = match state.active.get_mut(&key) {
            Some(sinks) => sinks,
            None => {
                debug!(target = ?key.1, "message for an inactive subscription");
                return;
            }
        };

        sinks.retain(|sink| match sink.tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = sink.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(channel = ?message.channel, dropped, "subscriber backlog full; message dropped");
                true
            }
            // El handle de la suscripcion se ha descartado.
            Err(TrySendError::Closed(_)) => false,
        });

        if sinks.is_empty() {
            self.abandoned.notify_one();
        }
    }

    fn confirm_subscribe(&self, key: Key) -> Routed {
        let mut state = self.state.lock().unwrap();

        let waiter = match state.subscribing.get_mut(&key) {
            Some(queue) => {
                let waiter = queue.pop_front();
                if queue.is_empty() {
                    state.subscribing.remove(&key);
                }
                waiter
            }
            None => None,
        };

        let sinks = state.active.entry(key).or_default();
        if let Some((sink, confirm)) = waiter {
            // El llamador puede haber dejado de esperar (timeout) y
            // descartado su `Subscription`.
            if !sink.tx.is_closed() {
                sinks.push(sink);
            }
            let _ = confirm.send(Ok(()));
        }
        if sinks.is_empty() {
            self.abandoned.notify_one();
        }

        Routed::Confirmed {
            push_context: state.push_context(),
        }
    }

    fn confirm_unsubscribe(&self, key: Key) -> Routed {
        let mut state = self.state.lock().unwrap();

        // Al soltar los `Sink` el stream del suscriptor termina cuando no
        // quedan otros canales que lo alimenten.
        state.active.remove(&key);

        if let Some(queue) = state.unsubscribing.get_mut(&key) {
            if let Some(confirm) = queue.pop_front() {
                let _ = confirm.send(Ok(()));
            }
            if queue.is_empty() {
                state.unsubscribing.remove(&key);
            }
        }

        Routed::Confirmed {
            push_context: state.push_context(),
        }
    }

    /// Destruye todas las suscripciones al cerrarse la conexion.
    pub(crate) fn teardown(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.active.clear();

        for (_, queue) in state.subscribing.drain() {
            for (_, confirm) in queue {
                let _ = confirm.send(Err(Error::ConnectionClosed));
            }
        }

        // Sin conexion no queda ninguna suscripcion de la que darse de baja.
        for (_, queue) in state.unsubscribing.drain() {
            for confirm in queue {
                let _ = confirm.send(Ok(()));
            }
        }
    }
}

/// Handle de un suscriptor.
///
/// Los mensajes se consumen con `next_message` o convirtiendo el handle en
/// un stream. Cuando la conexion se cierra, o se da de baja de todos sus
/// canales, el handle deja de producir mensajes.
#[derive(Debug)]
pub struct Subscription {
    mode: Mode,
    targets: Vec<Bytes>,
    rx: mpsc::Receiver<Message>,
    dropped: Arc<AtomicU64>,
    reported: u64,
    abandoned: Arc<Notify>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.rx.close();
        self.abandoned.notify_one();
    }
}

impl Subscription {
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Canales (o patrones) solicitados al suscribirse.
    pub fn targets(&self) -> &[Bytes] {
        &self.targets
    }

    /// Espera el siguiente mensaje.
    ///
    /// Retorna `Ok(None)` cuando la suscripcion ha terminado y
    /// `Err(Error::SubscriberOverflow)` si se han descartado mensajes desde
    /// la ultima llamada; la siguiente llamada continua con los mensajes
    /// que si se encolaron.
    pub async fn next_message(&mut self) -> crate::Result<Option<Message>> {
        if let Some(err) = self.take_overflow() {
            return Err(err);
        }

        Ok(self.rx.recv().await)
    }

    fn take_overflow(&mut self) -> Option<Error> {
        let dropped = self.dropped.load(Ordering::Relaxed);
        if dropped == self.reported {
            return None;
        }

        let lost = dropped - self.reported;
        self.reported = dropped;
        let channel = self
            .targets
            .iter()
            .map(|t| String::from_utf8_lossy(t).into_owned())
            .collect::<Vec<_>>()
            .join(",");

        Some(Error::SubscriberOverflow {
            channel,
            dropped: lost,
        })
    }

    /// Convierte el handle en un `Stream` de mensajes.
    pub fn into_stream(mut self) -> Messages {
        Box::pin(async_stream::stream! {
            loop {
                match self.next_message().await {
                    Ok(Some(msg)) => yield Ok(msg),
                    Ok(None) => break,
                    Err(err) => yield Err(err),
                }
            }
        })
    }
}

/// Ejecuta `handler` por cada mensaje en una tarea independiente del bucle
/// de lectura de la conexion.
pub(crate) fn spawn_handler<F>(mut subscription: Subscription, mut handler: F) -> JoinHandle<()>
where
    F: FnMut(Message) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match subscription.next_message().await {
                Ok(Some(msg)) => handler(msg),
                Ok(None) => break,
                Err(err) => warn!(%err, "subscriber handler is lagging"),
            }
        }
    })
}
