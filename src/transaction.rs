//! Transacciones `MULTI`/`EXEC`.
//!
//! Una `Transaction` retira una conexion del pool mientras existe, de forma
//! que `WATCH`, las lecturas intermedias y el `EXEC` final van por la misma
//! conexion. Los comandos se acumulan en el cliente y se escriben junto a
//! `MULTI` y `EXEC` con una unica escritura.

use tracing::debug;

use crate::pool::Dedicated;
use crate::{Command, Connection, Error, Frame, ToArg};

/// Transaccion sobre una conexion fija del pool.
///
/// Creada con `Client::transaction`. Al descartarla sin `exec` ni
/// `discard` mientras vigila claves, se envia `UNWATCH` antes de devolver
/// la conexion al pool.
#[derive(Debug)]
pub struct Transaction {
    conn: Connection,

    /// Se toma en `Drop` para liberar el hueco despues del `UNWATCH`.
    pinned: Option<Dedicated>,

    cmds: Vec<Command>,

    /// Hay claves vigiladas en el servidor.
    watching: bool,
}

impl Transaction {
    pub(crate) fn new(pinned: Dedicated) -> Transaction {
        Transaction {
            conn: pinned.connection().clone(),
            pinned: Some(pinned),
            cmds: vec![],
            watching: false,
        }
    }

    /// Vigila `keys`. Si alguna cambia antes de `exec`, la transaccion se
    /// aborta con `Error::TransactionAborted`.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use pipelined_redis::{Client, Config};
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     let client = Client::connect("localhost:6379", Config::default()).await.unwrap();
    ///
    ///     let mut tx = client.transaction().await.unwrap();
    ///     tx.watch(["balance"]).await.unwrap();
    ///     let balance = tx.submit("GET", ["balance"]).await.unwrap();
    ///     println!("balance = {}", balance);
    ///
    ///     tx.cmd("DECRBY", ["balance", "10"]);
    ///     let results = tx.exec().await.unwrap();
    ///     println!("results = {:?}", results);
    /// }
    /// ```
    pub async fn watch<I, A>(&mut self, keys: I) -> crate::Result<()>
    where
        I: IntoIterator<Item = A>,
        A: ToArg,
    {
        self.watching = true;
        self.conn.submit(Command::new("WATCH").args(keys)).await?;
        Ok(())
    }

    /// Deja de vigilar todas las claves.
    pub async fn unwatch(&mut self) -> crate::Result<()> {
        self.conn.submit(Command::new("UNWATCH")).await?;
        self.watching = false;
        Ok(())
    }

    /// Envia un comando fuera de la transaccion, sobre su misma conexion.
    pub async fn submit<I, A>(&self, name: &str, args: I) -> crate::Result<Frame>
    where
        I: IntoIterator<Item = A>,
        A: ToArg,
    {
        self.conn.submit(Command::new(name).args(args)).await
    }

    /// Incorpora un comando a la transaccion.
    pub fn add(&mut self, cmd: Command) -> &mut Transaction {
        self.cmds.push(cmd);
        self
    }

    pub fn cmd<I, A>(&mut self, name: &str, args: I) -> &mut Transaction
    where
        I: IntoIterator<Item = A>,
        A: ToArg,
    {
        self.add(Command::new(name).args(args))
    }

    pub fn len(&self) -> usize {
        self.cmds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cmds.is_empty()
    }

    /// Ejecuta la transaccion. Retorna un resultado por comando, en el
    /// mismo orden en que se incorporaron.
    pub async fn exec(mut self) -> crate::Result<Vec<crate::Result<Frame>>> {
        // El servidor deja de vigilar las claves con `EXEC`, se ejecute o no.
        self.watching = false;

        let queued = self.cmds.len();
        let mut batch = Vec::with_capacity(queued + 2);
        batch.push(Command::new("MULTI"));
        batch.append(&mut self.cmds);
        batch.push(Command::new("EXEC"));

        let replies = self.conn.send_batch(batch).await?;

        let mut exec = None;
        for (i, reply) in replies.into_iter().enumerate() {
            let res = self.conn.wait(reply).await;
            if i == 0 {
                res?;
            } else if i == queued + 1 {
                exec = Some(res);
            } else if let Err(err) = res {
                // El servidor lo rechaza al encolar y responde `EXECABORT`.
                debug!(connection = self.conn.id(), %err, "command rejected by MULTI");
            }
        }

        match exec {
            Some(Ok(Frame::Array(items))) => Ok(items.into_iter().map(Frame::into_result).collect()),
            Some(Ok(Frame::NullArray)) | Some(Ok(Frame::Null)) => Err(Error::TransactionAborted),
            Some(Ok(frame)) => Err(Error::Protocol(format!("unexpected EXEC reply `{}`", frame))),
            Some(Err(err)) => Err(err),
            None => Err(Error::ConnectionClosed),
        }
    }

    /// Descarta los comandos acumulados y deja de vigilar las claves.
    pub async fn discard(mut self) -> crate::Result<()> {
        self.cmds.clear();
        if self.watching {
            self.unwatch().await?;
        }
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let pinned = match self.pinned.take() {
            Some(pinned) => pinned,
            None => return,
        };

        if !self.watching {
            return;
        }

        let conn = self.conn.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = conn.submit(Command::new("UNWATCH")).await {
                    debug!(connection = conn.id(), %err, "UNWATCH failed");
                }
                drop(pinned);
            });
        }
    }
}
