//! Conexion con pipelining sobre un transporte full-duplex.
//!
//! Una `Connection` admite cualquier numero de comandos en vuelo. Cada
//! comando escrito encola una peticion pendiente y el servidor responde en
//! el mismo orden en que los recibio, de forma que la respuesta N se
//! entrega siempre al llamador que escribio el comando N.
//!
//! Existe un unico escritor (protegido por un mutex de Tokio que se retiene
//! mientras se codifica, se encola y se escribe) y una unica tarea de
//! lectura por conexion, que decodifica los frames y los reparte entre la
//! cola de peticiones pendientes y el router de pub/sub.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Notify};
use tokio::{select, time};
use tracing::{debug, info, instrument, warn};
use tracing_futures::Instrument;

use crate::cmd::Kind;
use crate::decoder::Decoder;
use crate::pubsub::{self, Mode, Routed, Router, Subscription};
use crate::{Command, Config, Error, Frame};

/// Transporte de bytes sobre el que se monta una conexion: un socket TCP en
/// produccion o un `DuplexStream` en los tests.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxTransport = Box<dyn Transport>;

/// Fabrica de transportes. El pool la utiliza para abrir y reabrir
/// conexiones.
pub trait Connector: Send + Sync + 'static {
    fn open(&self) -> Pin<Box<dyn Future<Output = io::Result<BoxTransport>> + Send + '_>>;
}

/// Abre conexiones TCP a una direccion `host:port`.
#[derive(Clone, Debug)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> TcpConnector {
        TcpConnector { addr: addr.into() }
    }
}

impl Connector for TcpConnector {
    fn open(&self) -> Pin<Box<dyn Future<Output = io::Result<BoxTransport>> + Send + '_>> {
        Box::pin(async move {
            let socket = TcpStream::connect(&self.addr[..]).await?;
            socket.set_nodelay(true)?;
            Ok(Box::new(socket) as BoxTransport)
        })
    }
}

/// Ciclo de vida de una conexion.
///
/// `Disconnected -> Connecting -> Ready <-> Subscribed -> Closing -> Closed`.
/// Desde `Closing` solo se puede pasar a `Closed`, y `Closed` es terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Subscribed,
    Closing,
    Closed,
}

/// Handle de una conexion. Se puede clonar; todas las copias comparten el
/// mismo transporte. Cuando se descarta la ultima copia la conexion se
/// cierra.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,

    /// Cuando se descarta la ultima copia del guard se desmonta la conexion
    /// y termina la tarea de lectura, que mantiene su propia referencia a
    /// `Shared`.
    _guard: Arc<DropGuard>,
}

struct DropGuard {
    shared: Arc<Shared>,
}

/// Estado compartido entre los handles y la tarea de lectura.
struct Shared {
    id: u64,

    /// Unico escritor. Es un mutex de Tokio porque se retiene mientras se
    /// escribe en el socket (`.await`).
    writer: tokio::sync::Mutex<Writer>,

    /// Cola FIFO de peticiones pendientes. Es un `std::sync::Mutex`: nunca
    /// se retiene durante un `.await` y la seccion critica es minima.
    pending: Mutex<PendingQueue>,

    state: watch::Sender<ConnectionState>,

    router: Router,

    /// Despierta a la tarea de lectura para que termine.
    shutdown: Notify,

    command_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
}

struct Writer {
    /// `None` una vez cerrado el transporte.
    half: Option<WriteHalf<BoxTransport>>,
    buffer: BytesMut,
}

impl Writer {
    /// Codifica los comandos en el buffer. Si alguno no se puede codificar
    /// el buffer queda vacio.
    fn encode<'a>(&mut self, cmds: impl IntoIterator<Item = &'a Command>) -> crate::Result<()> {
        self.buffer.clear();
        for cmd in cmds {
            if let Err(err) = cmd.encode(&mut self.buffer) {
                self.buffer.clear();
                return Err(err);
            }
        }
        Ok(())
    }
}

type ReplyTx = oneshot::Sender<crate::Result<Frame>>;

#[derive(Default)]
struct PendingQueue {
    entries: VecDeque<ReplyTx>,
    /// Una vez cerrada no se admiten mas entradas.
    closed: bool,
}

/// Respuesta a un comando ya escrito en el transporte.
///
/// Si el llamador descarta el future (por ejemplo por un timeout) la
/// peticion sigue en la cola y su respuesta se consume y se descarta al
/// llegar, de forma que el resto de respuestas siguen alineadas.
#[derive(Debug)]
pub struct PendingReply {
    rx: oneshot::Receiver<crate::Result<Frame>>,
}

impl Future for PendingReply {
    type Output = crate::Result<Frame>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(res)) => Poll::Ready(res),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::ConnectionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

impl Connection {
    /// Abre un transporte con `connector` y establece la conexion sobre el.
    #[instrument(level = "debug", skip_all)]
    pub async fn connect(connector: &dyn Connector, config: &Config) -> crate::Result<Connection> {
        let open = connector.open();
        let res = match config.connect_timeout {
            Some(limit) => match time::timeout(limit, open).await {
                Ok(res) => res,
                Err(_) => return Err(Error::Connect("timed out opening transport".into())),
            },
            None => open.await,
        };

        let transport = res.map_err(|err| Error::Connect(err.to_string()))?;
        Connection::establish(transport, config).await
    }

    /// Establece una conexion sobre un transporte ya abierto: lanza la
    /// tarea de lectura y ejecuta el handshake (`AUTH` y `SELECT`).
    #[instrument(level = "debug", skip_all)]
    pub async fn establish<T: Transport>(transport: T, config: &Config) -> crate::Result<Connection> {
        let transport: BoxTransport = Box::new(transport);
        let (reader, writer) = tokio::io::split(transport);

        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let (state, _) = watch::channel(ConnectionState::Connecting);

        let shared = Arc::new(Shared {
            id,
            writer: tokio::sync::Mutex::new(Writer {
                half: Some(writer),
                buffer: BytesMut::with_capacity(4 * 1024),
            }),
            pending: Mutex::new(PendingQueue::default()),
            state,
            router: Router::new(config.subscriber_backlog_limit),
            shutdown: Notify::new(),
            command_timeout: config.command_timeout,
            idle_timeout: config.idle_timeout,
        });

        info!(connection = id, "connecting");

        let span = tracing::debug_span!("read_loop", connection = id);
        tokio::spawn(read_loop(shared.clone(), reader).instrument(span));

        let connection = Connection {
            _guard: Arc::new(DropGuard {
                shared: shared.clone(),
            }),
            shared,
        };

        if let Err(err) = connection.handshake(config).await {
            connection.close().await;
            return Err(err);
        }

        connection.shared.set_state(ConnectionState::Ready);
        Ok(connection)
    }

    #[instrument(level = "debug", skip_all, fields(connection = self.shared.id))]
    async fn handshake(&self, config: &Config) -> crate::Result<()> {
        if let Some(auth) = &config.auth {
            let mut cmd = Command::new("AUTH");
            if let Some(username) = &auth.username {
                cmd = cmd.arg(username);
            }
            cmd = cmd.arg(&auth.password);

            match self.handshake_command(cmd).await {
                Ok(_) => debug!("authenticated"),
                Err(Error::Server(msg)) => return Err(Error::Auth(msg)),
                Err(err) => return Err(err),
            }
        }

        if let Some(database) = config.database {
            match self.handshake_command(Command::new("SELECT").arg(database)).await {
                Ok(_) => debug!(database, "database selected"),
                Err(Error::Server(msg)) => {
                    return Err(Error::Connect(format!("SELECT {} failed; {}", database, msg)))
                }
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    async fn handshake_command(&self, cmd: Command) -> crate::Result<Frame> {
        let reply = self.enqueue(vec![cmd], true).await?.remove(0);
        self.shared.wait(reply).await
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Receptor de los cambios de estado de la conexion.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Numero de peticiones escritas que aun esperan respuesta.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().unwrap().entries.len()
    }

    /// Escribe el comando y retorna un future con su respuesta, sin
    /// esperarla.
    pub async fn send(&self, cmd: Command) -> crate::Result<PendingReply> {
        let mut replies = self.enqueue(vec![cmd], false).await?;
        Ok(replies.remove(0))
    }

    /// Escribe el comando y espera su respuesta.
    ///
    /// Una respuesta de error del servidor se retorna como `Error::Server`
    /// y la conexion sigue siendo utilizable.
    pub async fn submit(&self, cmd: Command) -> crate::Result<Frame> {
        let reply = self.send(cmd).await?;
        self.shared.wait(reply).await
    }

    /// Escribe un lote de comandos con una unica escritura. Las respuestas
    /// se retornan en el mismo orden que los comandos.
    pub async fn send_batch(&self, cmds: Vec<Command>) -> crate::Result<Vec<PendingReply>> {
        if cmds.is_empty() {
            return Ok(vec![]);
        }
        self.enqueue(cmds, false).await
    }

    /// Espera una respuesta aplicando el timeout de comando configurado.
    pub async fn wait(&self, reply: PendingReply) -> crate::Result<Frame> {
        self.shared.wait(reply).await
    }

    /// Codifica, encola y escribe. Las tres operaciones se realizan con el
    /// escritor bloqueado, de forma que el orden de la cola coincide con el
    /// orden de los bytes en el transporte.
    async fn enqueue(&self, cmds: Vec<Command>, handshake: bool) -> crate::Result<Vec<PendingReply>> {
        let mut writer = self.shared.writer.lock().await;

        for cmd in &cmds {
            self.shared.check_state(cmd, handshake)?;
        }

        writer.encode(&cmds)?;

        if writer.half.is_none() {
            return Err(Error::ConnectionClosed);
        }

        let replies = {
            let mut pending = self.shared.pending.lock().unwrap();
            if pending.closed {
                return Err(Error::ConnectionClosed);
            }

            cmds.iter()
                .map(|_| {
                    let (tx, rx) = oneshot::channel();
                    pending.entries.push_back(tx);
                    PendingReply { rx }
                })
                .collect::<Vec<_>>()
        };

        self.shared.flush(&mut writer).await?;

        debug!(
            connection = self.shared.id,
            commands = cmds.len(),
            first = %cmds[0].get_name(),
            "commands written"
        );

        Ok(replies)
    }

    /// Suscribe la conexion a los canales (o patrones) indicados y espera
    /// la confirmacion del servidor para cada uno.
    ///
    /// A partir de este momento la conexion esta en modo suscrito y solo
    /// admite comandos de control hasta que se da de baja de todo.
    pub async fn subscribe(&self, mode: Mode, targets: &[Bytes]) -> crate::Result<Subscription> {
        if targets.is_empty() {
            return Err(Error::InvalidCommand(format!(
                "{} requires at least one target",
                mode.subscribe_command()
            )));
        }

        let (subscription, confirmations) = {
            let mut writer = self.shared.writer.lock().await;

            match self.state() {
                ConnectionState::Ready | ConnectionState::Subscribed => {}
                _ => return Err(Error::ConnectionClosed),
            }

            let cmd = Command::new(mode.subscribe_command()).args(targets);
            writer.encode([&cmd])?;

            let registered = self.shared.router.register_subscribe(mode, targets)?;
            self.shared.set_state(ConnectionState::Subscribed);
            self.shared.flush(&mut writer).await?;

            registered
        };

        // Si se deja de esperar, el `Subscription` se descarta y el router
        // da de baja los objetivos cuando el servidor los confirme.
        for confirmation in confirmations {
            let res = match self.shared.command_timeout {
                Some(limit) => time::timeout(limit, confirmation)
                    .await
                    .map_err(|_| Error::Timeout)?,
                None => confirmation.await,
            };

            match res {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(err),
                Err(_) => return Err(Error::ConnectionClosed),
            }
        }

        Ok(subscription)
    }

    /// Da de baja los canales (o patrones) indicados; sin objetivos, todos
    /// los del modo. Darse de baja de algo no suscrito no hace nada.
    pub async fn unsubscribe(&self, mode: Mode, targets: &[Bytes]) -> crate::Result<()> {
        let confirmations = {
            let mut writer = self.shared.writer.lock().await;

            let targets = if targets.is_empty() {
                self.shared.router.active_targets(mode)
            } else {
                targets.to_vec()
            };

            let (active, confirmations) = self.shared.router.register_unsubscribe(mode, &targets)?;
            if active.is_empty() {
                return Ok(());
            }

            let cmd = Command::new(mode.unsubscribe_command()).args(&active);
            writer.encode([&cmd])?;
            self.shared.flush(&mut writer).await?;

            confirmations
        };

        for confirmation in confirmations {
            // Si la conexion se cierra la suscripcion tambien desaparece.
            if let Ok(Err(err)) = confirmation.await {
                return Err(err);
            }
        }

        if !self.shared.router.is_push_context() {
            self.shared.leave_subscribed();
        }

        Ok(())
    }

    /// Cierra la conexion. Las peticiones pendientes fallan con
    /// `Error::ConnectionClosed`. Una escritura bloqueada en el transporte
    /// se abandona.
    pub async fn close(&self) {
        self.shared.teardown("closed by client");

        let mut writer = self.shared.writer.lock().await;
        if let Some(mut half) = writer.half.take() {
            let _ = half.shutdown().await;
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for DropGuard {
    fn drop(&mut self) {
        self.shared.teardown("connection dropped");
    }
}

impl Shared {
    fn check_state(&self, cmd: &Command, handshake: bool) -> crate::Result<()> {
        if cmd.kind() == Kind::PubSub {
            return Err(Error::InvalidCommand(format!(
                "`{}` must be issued with subscribe/unsubscribe",
                cmd.get_name()
            )));
        }

        match *self.state.borrow() {
            ConnectionState::Ready => Ok(()),
            ConnectionState::Connecting if handshake => Ok(()),
            ConnectionState::Subscribed if cmd.kind() == Kind::Control => Ok(()),
            ConnectionState::Subscribed => Err(Error::Subscribed(cmd.get_name())),
            _ => Err(Error::ConnectionClosed),
        }
    }

    /// Escribe el contenido del buffer del escritor. Un fallo de escritura
    /// desmonta la conexion. Si la conexion se desmonta mientras la
    /// escritura esta bloqueada, se abandona.
    async fn flush(&self, writer: &mut Writer) -> crate::Result<()> {
        let Writer { half, buffer } = writer;

        let stream = match half.as_mut() {
            Some(stream) => stream,
            None => {
                buffer.clear();
                return Err(Error::ConnectionClosed);
            }
        };

        let mut states = self.state.subscribe();
        let res = select! {
            res = async {
                match stream.write_all(&buffer[..]).await {
                    Ok(()) => stream.flush().await,
                    Err(err) => Err(err),
                }
            } => res,
            _ = closed(&mut states) => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection closed during write",
            )),
        };
        buffer.clear();

        if let Err(err) = res {
            *half = None;
            self.teardown(&format!("write failed; {}", err));
            return Err(err.into());
        }

        Ok(())
    }

    async fn wait(&self, reply: PendingReply) -> crate::Result<Frame> {
        match self.command_timeout {
            Some(limit) => match time::timeout(limit, reply).await {
                Ok(res) => res,
                Err(_) => Err(Error::Timeout),
            },
            None => reply.await,
        }
    }

    /// Aplica una transicion de estado. `Closed` es terminal y desde
    /// `Closing` solo se admite `Closed`.
    fn set_state(&self, next: ConnectionState) {
        let mut prev = None;

        self.state.send_if_modified(|state| {
            let allowed = match *state {
                current if current == next => false,
                ConnectionState::Closed => false,
                ConnectionState::Closing => next == ConnectionState::Closed,
                _ => true,
            };
            if allowed {
                prev = Some(*state);
                *state = next;
            }
            allowed
        });

        if let Some(prev) = prev {
            info!(connection = self.id, from = ?prev, to = ?next, "connection state changed");
        }
    }

    /// Vuelve a `Ready` tras darse de baja de todas las suscripciones.
    fn leave_subscribed(&self) {
        if *self.state.borrow() == ConnectionState::Subscribed {
            self.set_state(ConnectionState::Ready);
        }
    }

    /// Reparte un frame decodificado.
    ///
    /// Los push RESP3 y, mientras haya suscripciones, los arrays con forma
    /// de mensaje pub/sub van al router sin consumir ninguna peticion
    /// pendiente. El resto resuelve la peticion pendiente mas antigua.
    fn dispatch(&self, frame: Frame) -> crate::Result<()> {
        let divert = match &frame {
            Frame::Push(_) => true,
            Frame::Array(items) => pubsub::is_push(items) && self.router.is_push_context(),
            _ => false,
        };

        if divert {
            if let Routed::Confirmed { push_context: false } = self.router.route(frame)? {
                self.leave_subscribed();
            }
            return Ok(());
        }

        let entry = self.pending.lock().unwrap().entries.pop_front();
        match entry {
            Some(tx) => {
                debug!(connection = self.id, ?frame, "reply received");
                // Si el llamador ya no espera la respuesta, se descarta.
                let _ = tx.send(frame.into_result());
                Ok(())
            }
            None => {
                warn!(connection = self.id, ?frame, "reply without a pending request");
                Err(Error::Protocol("reply without a pending request".into()))
            }
        }
    }

    /// Tiempo de inactividad restante, si corresponde aplicarlo: solo
    /// cuando no hay peticiones pendientes ni suscripciones.
    fn idle_limit(&self) -> Option<Duration> {
        let limit = self.idle_timeout?;
        if !self.pending.lock().unwrap().entries.is_empty() || self.router.is_push_context() {
            return None;
        }
        Some(limit)
    }

    /// Desmonta la conexion: todas las peticiones pendientes fallan con
    /// `Error::ConnectionClosed`, se destruyen las suscripciones y termina
    /// la tarea de lectura. Es idempotente.
    fn teardown(&self, reason: &str) {
        let drained = {
            let mut pending = self.pending.lock().unwrap();
            if pending.closed {
                return;
            }
            pending.closed = true;
            std::mem::take(&mut pending.entries)
        };

        self.set_state(ConnectionState::Closing);
        info!(connection = self.id, reason, pending = drained.len(), "connection torn down");

        for tx in drained {
            let _ = tx.send(Err(Error::ConnectionClosed));
        }

        self.router.teardown();
        self.shutdown.notify_one();
        self.set_state(ConnectionState::Closed);
    }
}

/// Espera a que la conexion llegue a `Closed`.
async fn closed(states: &mut watch::Receiver<ConnectionState>) {
    loop {
        let closed = *states.borrow_and_update() == ConnectionState::Closed;
        if closed || states.changed().await.is_err() {
            return;
        }
    }
}

/// Da de baja los objetivos que ya no tienen ningun suscriptor.
async fn release_abandoned(shared: Arc<Shared>) {
    let mut writer = shared.writer.lock().await;

    let cmds: Vec<Command> = shared
        .router
        .reap()
        .into_iter()
        .map(|(mode, targets)| {
            debug!(connection = shared.id, ?mode, count = targets.len(), "releasing abandoned subscriptions");
            Command::new(mode.unsubscribe_command()).args(&targets)
        })
        .collect();

    if cmds.is_empty() {
        if !shared.router.is_push_context() {
            shared.leave_subscribed();
        }
        return;
    }

    if writer.encode(&cmds).is_ok() {
        // Un fallo de escritura ya desmonta la conexion.
        let _ = shared.flush(&mut writer).await;
    }
}

/// Evento que despierta a la tarea de lectura.
enum Event {
    Read(io::Result<usize>),
    Abandoned,
    Shutdown,
    Idle,
}

/// Tarea de lectura: decodifica frames a medida que llegan bytes y los
/// reparte. Termina con EOF, con un error de transporte o de protocolo, por
/// inactividad o al cerrarse la conexion; en todos los casos desmonta la
/// conexion.
async fn read_loop(shared: Arc<Shared>, mut reader: ReadHalf<BoxTransport>) {
    let mut buffer = BytesMut::with_capacity(4 * 1024);
    let mut decoder = Decoder::new();

    let reason = 'read: loop {
        // Se procesan todos los frames completos del buffer antes de leer
        // mas bytes.
        loop {
            match decoder.decode(&mut buffer) {
                Ok(Some(frame)) => {
                    if let Err(err) = shared.dispatch(frame) {
                        break 'read err.to_string();
                    }
                }
                Ok(None) => break,
                Err(err) => break 'read err.to_string(),
            }
        }

        let idle = shared.idle_limit();

        let event = select! {
            res = reader.read_buf(&mut buffer) => Event::Read(res),
            _ = shared.router.abandoned() => Event::Abandoned,
            _ = shared.shutdown.notified() => Event::Shutdown,
            _ = time::sleep(idle.unwrap_or_default()), if idle.is_some() => Event::Idle,
        };

        match event {
            Event::Read(Ok(0)) => {
                if decoder.is_idle() && buffer.is_empty() {
                    break "connection closed by peer".to_string();
                }
                break "connection reset by peer".to_string();
            }
            Event::Read(Ok(_)) => {}
            Event::Abandoned => {
                // El escritor puede estar esperando a que se lea.
                tokio::spawn(release_abandoned(shared.clone()).in_current_span());
            }
            Event::Read(Err(err)) => break err.to_string(),
            Event::Shutdown => break "shutdown".to_string(),
            Event::Idle => {
                // El temporizador se armo antes de que se escribiera algo.
                if shared.idle_limit().is_some() {
                    break "idle timeout".to_string();
                }
            }
        }
    };

    debug!(reason = %reason, "read loop finished");
    shared.teardown(&reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn reply(server: &mut tokio::io::DuplexStream, frame: Frame) {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        server.write_all(&buf).await.unwrap();
    }

    #[tokio::test]
    async fn replies_resolve_in_write_order() {
        let (client, mut server) = duplex(1024);
        let conn = Connection::establish(client, &Config::default()).await.unwrap();
        assert!(conn.is_ready());

        let first = conn.send(Command::new("GET").arg("a")).await.unwrap();
        let second = conn.send(Command::new("GET").arg("b")).await.unwrap();
        assert_eq!(conn.pending_count(), 2);

        reply(&mut server, Frame::Bulk(Bytes::from_static(b"1"))).await;
        reply(&mut server, Frame::Null).await;

        assert_eq!(first.await.unwrap(), Frame::Bulk(Bytes::from_static(b"1")));
        assert_eq!(second.await.unwrap(), Frame::Null);
    }

    #[tokio::test]
    async fn pubsub_commands_are_rejected_by_send() {
        let (client, _server) = duplex(1024);
        let conn = Connection::establish(client, &Config::default()).await.unwrap();

        let err = conn.send(Command::new("SUBSCRIBE").arg("a")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidCommand(_)));
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn close_fails_pending_requests() {
        let (client, _server) = duplex(1024);
        let conn = Connection::establish(client, &Config::default()).await.unwrap();

        let pending = conn.send(Command::new("GET").arg("a")).await.unwrap();
        conn.close().await;

        assert!(matches!(pending.await, Err(Error::ConnectionClosed)));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(
            conn.send(Command::new("PING")).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn orphan_reply_tears_down_the_connection() {
        let (client, mut server) = duplex(1024);
        let conn = Connection::establish(client, &Config::default()).await.unwrap();
        let mut states = conn.state_changes();

        reply(&mut server, Frame::Simple("OK".into())).await;

        while *states.borrow_and_update() != ConnectionState::Closed {
            states.changed().await.unwrap();
        }
    }
}
