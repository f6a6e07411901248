//! Cliente asincrono.
//!
//! Fachada sobre el `Pool`: envia comandos arbitrarios, agrupa comandos en
//! pipelines y gestiona las suscripciones pub/sub.

use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::pubsub::{self, Message, Mode, Subscription};
use crate::{Command, Config, Connector, Frame, Pool, TcpConnector, ToArg, Transaction};

/// Conexion establecida con un servidor compatible con Redis.
///
/// `Client` se puede clonar y compartir entre tareas; todas las copias usan
/// el mismo pool de conexiones.
#[derive(Clone, Debug)]
pub struct Client {
    pool: Pool,
}

/// Lote de comandos que se escriben con una unica escritura sobre una
/// misma conexion.
///
/// Creado con `Client::pipeline`.
#[derive(Debug)]
pub struct Pipeline {
    client: Client,
    cmds: Vec<Command>,
}

impl Client {
    /// Establece la conexion con el servidor en `addr` (`host:port`).
    ///
    /// Se abren todas las conexiones del pool antes de retornar, de forma
    /// que un error de conexion o de autenticacion se detecta aqui.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use pipelined_redis::{Client, Config};
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     let client = match Client::connect("localhost:6379", Config::default()).await {
    ///         Ok(client) => client,
    ///         Err(_) => panic!("failed to establish connection"),
    ///     };
    /// # drop(client);
    /// }
    /// ```
    #[instrument(level = "debug", skip(addr, config))]
    pub async fn connect(addr: impl Into<String>, config: Config) -> crate::Result<Client> {
        let client = Client::with_connector(TcpConnector::new(addr), config)?;
        client.pool.warm_up().await?;
        Ok(client)
    }

    /// Crea un cliente sobre un `Connector` arbitrario. No abre ninguna
    /// conexion hasta el primer comando.
    pub fn with_connector(connector: impl Connector, config: Config) -> crate::Result<Client> {
        Ok(Client {
            pool: Pool::new(connector, config)?,
        })
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Envia el comando `name` con los argumentos `args` y espera la
    /// respuesta.
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
    ///     client.submit("SET", ["foo", "bar"]).await.unwrap();
    ///     let val = client.submit("GET", ["foo"]).await.unwrap();
    ///     println!("Got = {:?}", val);
    /// }
    /// ```
    pub async fn submit<I, A>(&self, name: &str, args: I) -> crate::Result<Frame>
    where
        I: IntoIterator<Item = A>,
        A: ToArg,
    {
        self.send(Command::new(name).args(args)).await
    }

    /// Envia un `Command` ya construido y espera la respuesta.
    pub async fn send(&self, cmd: Command) -> crate::Result<Frame> {
        self.pool.submit(cmd).await
    }

    /// Crea un pipeline vacio.
    pub fn pipeline(&self) -> Pipeline {
        Pipeline {
            client: self.clone(),
            cmds: vec![],
        }
    }

    /// Inicia una transaccion. La conexion que usa queda fuera del reparto
    /// del pool hasta que la transaccion termina o se descarta.
    pub async fn transaction(&self) -> crate::Result<Transaction> {
        Ok(Transaction::new(self.pool.dedicated().await?))
    }

    /// Suscribe el cliente a los canales indicados.
    ///
    /// Retorna cuando el servidor ha confirmado todas las suscripciones.
    pub async fn subscribe<I, A>(&self, channels: I) -> crate::Result<Subscription>
    where
        I: IntoIterator<Item = A>,
        A: ToArg,
    {
        self.pool.subscribe(Mode::Exact, &targets(channels)).await
    }

    /// Suscribe el cliente a los patrones indicados. El servidor decide
    /// que canales casan con cada patron.
    pub async fn psubscribe<I, A>(&self, patterns: I) -> crate::Result<Subscription>
    where
        I: IntoIterator<Item = A>,
        A: ToArg,
    {
        self.pool.subscribe(Mode::Pattern, &targets(patterns)).await
    }

    /// Suscribe `handler` a `channel`. El handler se ejecuta en su propia
    /// tarea, de forma que un handler lento nunca bloquea la lectura de la
    /// conexion.
    pub async fn subscribe_with<F>(&self, channel: impl ToArg, handler: F) -> crate::Result<JoinHandle<()>>
    where
        F: FnMut(Message) + Send + 'static,
    {
        let subscription = self.pool.subscribe(Mode::Exact, &[channel.to_arg()]).await?;
        Ok(pubsub::spawn_handler(subscription, handler))
    }

    /// Da de baja los canales indicados; sin canales, todos. Es idempotente.
    pub async fn unsubscribe<I, A>(&self, channels: I) -> crate::Result<()>
    where
        I: IntoIterator<Item = A>,
        A: ToArg,
    {
        self.pool.unsubscribe(Mode::Exact, &targets(channels)).await
    }

    /// Da de baja los patrones indicados; sin patrones, todos.
    pub async fn punsubscribe<I, A>(&self, patterns: I) -> crate::Result<()>
    where
        I: IntoIterator<Item = A>,
        A: ToArg,
    {
        self.pool.unsubscribe(Mode::Pattern, &targets(patterns)).await
    }

    /// Cierra todas las conexiones del cliente.
    pub async fn close(&self) {
        self.pool.close().await
    }
}

fn targets<I, A>(items: I) -> Vec<Bytes>
where
    I: IntoIterator<Item = A>,
    A: ToArg,
{
    items.into_iter().map(ToArg::to_arg).collect()
}

impl Pipeline {
    /// Incorpora un comando al lote.
    pub fn add(&mut self, cmd: Command) -> &mut Pipeline {
        self.cmds.push(cmd);
        self
    }

    /// Incorpora el comando `name` con sus argumentos.
    pub fn cmd<I, A>(&mut self, name: &str, args: I) -> &mut Pipeline
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

    /// Escribe todos los comandos y espera sus respuestas. Retorna un
    /// resultado por comando, en el mismo orden; un error del servidor en
    /// uno de ellos no afecta al resto.
    pub async fn execute(self) -> crate::Result<Vec<crate::Result<Frame>>> {
        self.client.pool.submit_batch(self.cmds).await
    }
}
