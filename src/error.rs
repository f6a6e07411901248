//! Taxonomia de errores del cliente.
//!
//! Todos los fallos visibles por el llamador se representan con la
//! enumeracion `Error`. Los errores de protocolo y de transporte son fatales
//! para la conexion que los produce; `Server` es una respuesta de error del
//! servidor y nunca provoca el cierre de la conexion.

use std::io;

use thiserror::Error;

/// Error retornado por la mayoria de funciones del crate.
#[derive(Debug, Error)]
pub enum Error {
    /// El comando no puede codificarse (por ejemplo, no tiene argumentos).
    #[error("invalid command; {0}")]
    InvalidCommand(String),

    /// Fallo al abrir el transporte o durante el handshake.
    #[error("connect error; {0}")]
    Connect(String),

    /// El servidor ha rechazado las credenciales.
    #[error("authentication failed; {0}")]
    Auth(String),

    /// Bytes mal formados en el stream. La conexion deja de ser fiable.
    #[error("protocol error; {0}")]
    Protocol(String),

    /// Respuesta de error decodificada (`-ERR ...`).
    #[error("{0}")]
    Server(String),

    /// El llamador ha dejado de esperar la respuesta.
    #[error("command timed out")]
    Timeout,

    /// La conexion esta cerrada o se ha cerrado con el comando en vuelo.
    #[error("connection closed")]
    ConnectionClosed,

    /// Se han agotado los intentos de reconexion.
    #[error("connection pool exhausted after {attempts} attempts")]
    PoolExhausted { attempts: u32 },

    /// El suscriptor no consume a tiempo y se han descartado mensajes.
    #[error("subscriber overflow on `{channel}`; {dropped} messages dropped")]
    SubscriberOverflow { channel: String, dropped: u64 },

    /// Comando de datos enviado a una conexion en modo suscrito.
    #[error("command `{0}` not allowed while subscribed")]
    Subscribed(String),

    /// `EXEC` no se ejecuto porque cambio una clave vigilada con `WATCH`.
    #[error("transaction aborted; a watched key changed")]
    TransactionAborted,

    /// Configuracion invalida.
    #[error("invalid configuration; {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// `true` cuando el error implica que la conexion ya no existe, de forma
    /// que el pool puede decidir reconectar.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed | Error::Io(_) | Error::Protocol(_) | Error::Connect(_)
        )
    }
}

/// Un `Result` especializado para las operaciones del crate.
pub type Result<T> = std::result::Result<T, Error>;
