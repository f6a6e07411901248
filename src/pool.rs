//! Pool de conexiones con reconexion.
//!
//! El pool mantiene un numero fijo de huecos (`pool_size`), cada uno con a
//! lo sumo una conexion. Las conexiones se abren bajo demanda y se reabren
//! cuando caen, aplicando un backoff exponencial. Si se agotan los intentos
//! el pool queda degradado y falla inmediatamente hasta que se llama a
//! `recover`.
//!
//! Las suscripciones pub/sub usan una conexion propia, de forma que los
//! comandos de datos nunca llegan a una conexion en modo suscrito.
//!
//! `Pool::dedicated` retira una conexion del reparto mientras se use, por
//! ejemplo para una transaccion `WATCH`/`MULTI`/`EXEC`.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time;
use tracing::{debug, info, instrument, warn};

use crate::connection::PendingReply;
use crate::pubsub::{Mode, Subscription};
use crate::{Command, Config, Connection, ConnectionState, Connector, Error, Frame};

/// Handle del pool. Se puede clonar; todas las copias comparten las mismas
/// conexiones.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    connector: Arc<dyn Connector>,
    config: Config,
    slots: Vec<Slot>,

    /// Siguiente hueco para el reparto round-robin.
    next: AtomicUsize,

    /// Se han agotado los intentos de reconexion.
    degraded: AtomicBool,
    closed: AtomicBool,

    /// Conexion dedicada a pub/sub, abierta con la primera suscripcion.
    subscriber: tokio::sync::Mutex<Option<Connection>>,

    /// Se notifica al liberar un hueco fijado o al cerrar el pool.
    released: Notify,
}

struct Slot {
    conn: Mutex<Option<Connection>>,

    /// Solo una tarea reconecta cada hueco; las demas esperan su resultado.
    reconnect: tokio::sync::Mutex<()>,

    /// Retirado del reparto por un `Dedicated`.
    pinned: AtomicBool,
}

/// Situacion de un hueco vista desde `checkout`.
enum SlotStatus {
    Ready(Connection),
    /// Nunca se ha abierto o se cerro el pool.
    Empty,
    /// Tuvo una conexion que ya no esta `Ready`.
    Failed,
}

impl Slot {
    fn ready(&self) -> Option<Connection> {
        let conn = self.conn.lock().unwrap();
        conn.as_ref().filter(|conn| conn.is_ready()).cloned()
    }

    fn status(&self) -> SlotStatus {
        match &*self.conn.lock().unwrap() {
            Some(conn) if conn.is_ready() => SlotStatus::Ready(conn.clone()),
            Some(_) => SlotStatus::Failed,
            None => SlotStatus::Empty,
        }
    }

    fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::Acquire)
    }

    fn try_pin(&self) -> bool {
        self.pinned
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn state(&self) -> ConnectionState {
        match &*self.conn.lock().unwrap() {
            Some(conn) => conn.state(),
            None => ConnectionState::Disconnected,
        }
    }
}

impl Pool {
    /// Crea el pool sin abrir ninguna conexion.
    pub fn new(connector: impl Connector, config: Config) -> crate::Result<Pool> {
        config.validate()?;

        let slots = (0..config.pool_size)
            .map(|_| Slot {
                conn: Mutex::new(None),
                reconnect: tokio::sync::Mutex::new(()),
                pinned: AtomicBool::new(false),
            })
            .collect();

        Ok(Pool {
            shared: Arc::new(PoolShared {
                connector: Arc::new(connector),
                config,
                slots,
                next: AtomicUsize::new(0),
                degraded: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                subscriber: tokio::sync::Mutex::new(None),
                released: Notify::new(),
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn size(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn is_degraded(&self) -> bool {
        self.shared.degraded.load(Ordering::Acquire)
    }

    /// Estado de cada hueco del pool. Un hueco vacio se reporta como
    /// `Disconnected`.
    pub fn states(&self) -> Vec<ConnectionState> {
        self.shared.slots.iter().map(Slot::state).collect()
    }

    /// Abre todas las conexiones del pool.
    #[instrument(level = "debug", skip(self))]
    pub async fn warm_up(&self) -> crate::Result<()> {
        for index in 0..self.shared.slots.len() {
            self.reconnect(index).await?;
        }
        Ok(())
    }

    /// Sale del estado degradado y vuelve a abrir las conexiones.
    pub async fn recover(&self) -> crate::Result<()> {
        if self.shared.degraded.swap(false, Ordering::AcqRel) {
            info!("leaving degraded state");
        }
        self.warm_up().await
    }

    /// Envia un comando y espera su respuesta.
    ///
    /// Si el comando no llega a escribirse porque la conexion estaba
    /// cerrada, se reintenta en otra. Si la conexion cae con el comando en
    /// vuelo, solo se reintenta cuando el comando es `retry_safe`. Los
    /// timeouts y los errores del servidor nunca se reintentan.
    pub async fn submit(&self, cmd: Command) -> crate::Result<Frame> {
        let max_attempts = self.shared.config.reconnect.max_attempts;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let (_, conn) = self.checkout(false).await?;

            let reply = match conn.send(cmd.clone()).await {
                Ok(reply) => reply,
                Err(Error::ConnectionClosed) if attempt < max_attempts => {
                    debug!(connection = conn.id(), "connection closed before write; retrying");
                    continue;
                }
                Err(err) if err.is_disconnect() && cmd.is_retry_safe() && attempt < max_attempts => {
                    warn!(connection = conn.id(), %err, "write failed; retrying");
                    continue;
                }
                Err(err) => return Err(err),
            };

            match conn.wait(reply).await {
                Err(err) if err.is_disconnect() && cmd.is_retry_safe() && attempt < max_attempts => {
                    warn!(
                        connection = conn.id(),
                        command = %cmd.get_name(),
                        %err,
                        "connection lost with command in flight; retrying"
                    );
                }
                res => return res,
            }
        }
    }

    /// Escribe un lote de comandos en una unica conexion y con una unica
    /// escritura. Un lote nunca se reintenta.
    pub async fn submit_batch(&self, cmds: Vec<Command>) -> crate::Result<Vec<crate::Result<Frame>>> {
        if cmds.is_empty() {
            return Ok(vec![]);
        }

        let (_, conn) = self.checkout(false).await?;
        let replies: Vec<PendingReply> = conn.send_batch(cmds).await?;

        let mut results = Vec::with_capacity(replies.len());
        for reply in replies {
            results.push(conn.wait(reply).await);
        }
        Ok(results)
    }

    /// Retira una conexion `Ready` del reparto hasta que se descarte el
    /// `Dedicated`. Mientras tanto ningun otro comando del pool la usa.
    ///
    /// Si todas las conexiones estan retiradas, espera a que se libere una.
    pub async fn dedicated(&self) -> crate::Result<Dedicated> {
        let (index, conn) = self.checkout(true).await?;
        debug!(slot = index, connection = conn.id(), "connection pinned");

        Ok(Dedicated {
            pool: self.clone(),
            index,
            conn,
        })
    }

    fn release(&self, index: usize) {
        self.shared.slots[index].pinned.store(false, Ordering::Release);
        self.shared.released.notify_waiters();
        debug!(slot = index, "connection released");
    }

    /// Suscribe la conexion pub/sub del pool a los objetivos indicados.
    pub async fn subscribe(&self, mode: Mode, targets: &[Bytes]) -> crate::Result<Subscription> {
        let conn = self.subscriber().await?;
        conn.subscribe(mode, targets).await
    }

    /// Da de baja los objetivos indicados (todos los del modo si no se
    /// indica ninguno).
    pub async fn unsubscribe(&self, mode: Mode, targets: &[Bytes]) -> crate::Result<()> {
        let conn = self.shared.subscriber.lock().await.clone();
        match conn {
            Some(conn) => conn.unsubscribe(mode, targets).await,
            None => Ok(()),
        }
    }

    /// Cierra todas las conexiones. Las peticiones pendientes fallan con
    /// `Error::ConnectionClosed` y el pool deja de admitir comandos.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut conns: Vec<Connection> = self
            .shared
            .slots
            .iter()
            .filter_map(|slot| slot.conn.lock().unwrap().take())
            .collect();
        conns.extend(self.shared.subscriber.lock().await.take());

        for conn in conns {
            conn.close().await;
        }

        self.shared.released.notify_waiters();
        info!("pool closed");
    }

    fn check_open(&self) -> crate::Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }
        if self.is_degraded() {
            return Err(Error::PoolExhausted {
                attempts: self.shared.config.reconnect.max_attempts,
            });
        }
        Ok(())
    }

    /// Selecciona un hueco en round-robin, saltando los fijados.
    ///
    /// Un hueco que nunca se ha abierto se conecta en ese momento. Si el
    /// hueco ha perdido su conexion se usa otro `Ready` y el hueco se
    /// reabre en segundo plano; sin ninguno `Ready` se reabre antes de
    /// retornar. Con `pin` el hueco elegido queda fijado.
    async fn checkout(&self, pin: bool) -> crate::Result<(usize, Connection)> {
        let slots = &self.shared.slots;

        loop {
            // Se crea antes de revisar los huecos para no perder una
            // liberacion.
            let released = self.shared.released.notified();
            self.check_open()?;

            let start = self.shared.next.fetch_add(1, Ordering::Relaxed) % slots.len();
            let mut failed = None;

            for offset in 0..slots.len() {
                let index = (start + offset) % slots.len();
                let slot = &slots[index];
                if slot.is_pinned() {
                    continue;
                }

                match slot.status() {
                    SlotStatus::Ready(conn) => {
                        if pin && !slot.try_pin() {
                            continue;
                        }
                        if let Some(failed) = failed {
                            self.reopen_in_background(failed);
                        }
                        return Ok((index, conn));
                    }
                    SlotStatus::Empty => {
                        failed = Some(index);
                        break;
                    }
                    SlotStatus::Failed => {
                        if failed.is_none() {
                            failed = Some(index);
                        }
                    }
                }
            }

            if let Some(index) = failed {
                let conn = self.reconnect(index).await?;
                if !pin || slots[index].try_pin() {
                    return Ok((index, conn));
                }
                continue;
            }

            released.await;
        }
    }

    fn reopen_in_background(&self, index: usize) {
        // Ya hay una tarea reabriendo este hueco.
        if self.shared.slots[index].reconnect.try_lock().is_err() {
            return;
        }

        let pool = self.clone();
        tokio::spawn(async move {
            if let Err(err) = pool.reconnect(index).await {
                warn!(slot = index, %err, "background reconnect failed");
            }
        });
    }

    async fn reconnect(&self, index: usize) -> crate::Result<Connection> {
        let slot = &self.shared.slots[index];
        let _guard = slot.reconnect.lock().await;

        // Otra tarea puede haber reconectado el hueco mientras se esperaba.
        if let Some(conn) = slot.ready() {
            return Ok(conn);
        }

        self.check_open()?;
        let conn = self.establish().await?;
        debug!(slot = index, connection = conn.id(), "slot connected");

        *slot.conn.lock().unwrap() = Some(conn.clone());
        Ok(conn)
    }

    async fn subscriber(&self) -> crate::Result<Connection> {
        self.check_open()?;

        let mut subscriber = self.shared.subscriber.lock().await;
        if let Some(conn) = &*subscriber {
            match conn.state() {
                ConnectionState::Ready | ConnectionState::Subscribed => return Ok(conn.clone()),
                _ => {}
            }
        }

        let conn = self.establish().await?;
        *subscriber = Some(conn.clone());
        Ok(conn)
    }

    /// Abre una conexion aplicando la politica de reconexion. Un rechazo de
    /// credenciales no se reintenta.
    async fn establish(&self) -> crate::Result<Connection> {
        let policy = &self.shared.config.reconnect;
        let mut attempt = 0;

        loop {
            attempt += 1;

            match Connection::connect(&*self.shared.connector, &self.shared.config).await {
                Ok(conn) => {
                    if attempt > 1 {
                        info!(attempt, connection = conn.id(), "reconnected");
                    }
                    return Ok(conn);
                }
                Err(err @ Error::Auth(_)) => return Err(err),
                Err(err) if attempt >= policy.max_attempts => {
                    self.shared.degraded.store(true, Ordering::Release);
                    warn!(attempt, %err, "reconnect attempts exhausted; pool degraded");
                    return Err(Error::PoolExhausted { attempts: attempt });
                }
                Err(err) => {
                    let delay = policy.delay(attempt);
                    warn!(attempt, ?delay, %err, "connect failed; retrying");
                    time::sleep(delay).await;
                }
            }
        }
    }
}

/// Conexion del pool retirada del reparto. Vuelve al reparto al
/// descartarse.
pub struct Dedicated {
    pool: Pool,
    index: usize,
    conn: Connection,
}

impl Dedicated {
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for Dedicated {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

impl fmt::Debug for Dedicated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dedicated")
            .field("slot", &self.index)
            .field("connection", &self.conn)
            .finish()
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("size", &self.size())
            .field("states", &self.states())
            .field("degraded", &self.is_degraded())
            .finish()
    }
}
