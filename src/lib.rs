//! Cliente asincrono para servidores compatibles con Redis, construido con
//! Tokio.
//!
//! El cliente trata los comandos como listas opacas de argumentos binarios
//! y las respuestas como valores `Frame`. Su trabajo es el transporte:
//! pipelining de comandos sobre conexiones compartidas, reconexion y
//! reparto de mensajes pub/sub.
//!
//! # Layout
//!
//! Los componentes principales son:
//!
//! * `frame`: representa una respuesta del protocolo Redis (RESP2 y las
//!   extensiones RESP3 mas comunes) y su serializacion.
//!
//! * `decoder`: decodificador incremental que convierte un stream de bytes
//!   troceado de forma arbitraria en una secuencia de frames.
//!
//! * `cmd`: el tipo `Command` y su codificacion.
//!
//! * `connection`: una conexion con pipelining. Correlaciona cada respuesta
//!   con la peticion pendiente mas antigua y desvia los mensajes push al
//!   router de pub/sub.
//!
//! * `pubsub`: router de mensajes push y handles de suscripcion.
//!
//! * `pool`: pool de conexiones con reconexion y backoff exponencial.
//!
//! * `transaction`: transacciones `MULTI`/`EXEC` sobre una conexion fija.
//!
//! * `client`: la fachada publica.

pub mod client;
pub use client::{Client, Pipeline};

pub mod cmd;
pub use cmd::{Command, ToArg};

pub mod config;
pub use config::{Config, Credentials, ReconnectPolicy};

pub mod connection;
pub use connection::{
    BoxTransport, Connection, ConnectionState, Connector, PendingReply, TcpConnector, Transport,
};

pub mod decoder;
pub use decoder::Decoder;

mod error;
pub use error::{Error, Result};

pub mod frame;
pub use frame::Frame;

mod parse;

pub mod pool;
pub use pool::{Dedicated, Pool};

pub mod pubsub;
pub use pubsub::{Message, Messages, Mode, Subscription};

pub mod transaction;
pub use transaction::Transaction;

/// Puerto por defecto de los servidores Redis.
pub const DEFAULT_PORT: u16 = 6379;
