//! Comandos enviados al servidor.
//!
//! Un `Command` es una lista ordenada de argumentos binarios: el nombre del
//! comando seguido de sus parametros. El cliente no interpreta la semantica
//! de ningun comando; solo reconoce los de control pub/sub porque cambian
//! el modo de la conexion.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Error, Frame};

/// Comando a enviar. Inmutable una vez enviado.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Command {
    args: Vec<Bytes>,

    /// El comando puede reenviarse si la conexion cae antes de recibir la
    /// respuesta.
    retry_safe: bool,
}

/// Clasificacion de un comando segun como afecta al modo de la conexion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Kind {
    /// Comando ordinario con una unica respuesta.
    Data,
    /// SUBSCRIBE, PSUBSCRIBE, UNSUBSCRIBE, PUNSUBSCRIBE. Sus respuestas son
    /// mensajes push, no respuestas correlacionadas.
    PubSub,
    /// PING, QUIT y RESET: admitidos tambien en modo suscrito.
    Control,
}

/// Conversion de un valor a un argumento binario.
pub trait ToArg {
    fn to_arg(self) -> Bytes;
}

impl Command {
    /// Crea un comando con su nombre como primer argumento.
    pub fn new(name: impl ToArg) -> Command {
        Command {
            args: vec![name.to_arg()],
            retry_safe: false,
        }
    }

    /// Crea un comando a partir de una lista completa de argumentos.
    pub fn from_args<I, A>(args: I) -> Command
    where
        I: IntoIterator<Item = A>,
        A: ToArg,
    {
        Command {
            args: args.into_iter().map(ToArg::to_arg).collect(),
            retry_safe: false,
        }
    }

    /// Incorpora un argumento.
    pub fn arg(mut self, arg: impl ToArg) -> Command {
        self.args.push(arg.to_arg());
        self
    }

    /// Incorpora varios argumentos.
    pub fn args<I, A>(mut self, args: I) -> Command
    where
        I: IntoIterator<Item = A>,
        A: ToArg,
    {
        self.args.extend(args.into_iter().map(ToArg::to_arg));
        self
    }

    /// Marca el comando como idempotente: el pool puede reenviarlo a una
    /// conexion nueva si la anterior cae con el comando en vuelo.
    pub fn retry_safe(mut self, retry_safe: bool) -> Command {
        self.retry_safe = retry_safe;
        self
    }

    pub fn is_retry_safe(&self) -> bool {
        self.retry_safe
    }

    /// Nombre del comando (primer argumento).
    pub fn name(&self) -> Option<&[u8]> {
        self.args.first().map(|name| &name[..])
    }

    pub fn get_args(&self) -> &[Bytes] {
        &self.args
    }

    /// Nombre del comando como texto, para mensajes de error y logs.
    pub(crate) fn get_name(&self) -> String {
        self.name()
            .map(|name| String::from_utf8_lossy(name).to_uppercase())
            .unwrap_or_default()
    }

    pub(crate) fn kind(&self) -> Kind {
        let name = match self.name() {
            Some(name) => name,
            None => return Kind::Data,
        };

        const PUBSUB: [&[u8]; 4] = [b"subscribe", b"psubscribe", b"unsubscribe", b"punsubscribe"];
        const CONTROL: [&[u8]; 3] = [b"ping", b"quit", b"reset"];

        if PUBSUB.iter().any(|cmd| name.eq_ignore_ascii_case(cmd)) {
            Kind::PubSub
        } else if CONTROL.iter().any(|cmd| name.eq_ignore_ascii_case(cmd)) {
            Kind::Control
        } else {
            Kind::Data
        }
    }

    /// Serializa el comando como un array de bulk strings.
    ///
    /// Un comando sin argumentos no es valido.
    pub fn encode(&self, dst: &mut BytesMut) -> crate::Result<()> {
        if self.args.is_empty() {
            return Err(Error::InvalidCommand("command has no arguments".into()));
        }

        let size: usize = self.args.iter().map(|arg| arg.len() + 16).sum();
        dst.reserve(size + 16);

        dst.put_u8(b'*');
        dst.put_slice(self.args.len().to_string().as_bytes());
        dst.put_slice(b"\r\n");
        for arg in &self.args {
            dst.put_u8(b'$');
            dst.put_slice(arg.len().to_string().as_bytes());
            dst.put_slice(b"\r\n");
            dst.put_slice(arg);
            dst.put_slice(b"\r\n");
        }

        Ok(())
    }

    /// Convierte este comando en su representacion en un Frame.
    pub fn into_frame(self) -> crate::Result<Frame> {
        if self.args.is_empty() {
            return Err(Error::InvalidCommand("command has no arguments".into()));
        }

        let mut frame = Frame::array();
        for arg in self.args {
            frame.push_bulk(arg);
        }
        Ok(frame)
    }
}

impl ToArg for Bytes {
    fn to_arg(self) -> Bytes {
        self
    }
}

impl ToArg for &Bytes {
    fn to_arg(self) -> Bytes {
        self.clone()
    }
}

impl ToArg for &str {
    fn to_arg(self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for String {
    fn to_arg(self) -> Bytes {
        Bytes::from(self.into_bytes())
    }
}

impl ToArg for &String {
    fn to_arg(self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for &[u8] {
    fn to_arg(self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl<const N: usize> ToArg for &[u8; N] {
    fn to_arg(self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl ToArg for Vec<u8> {
    fn to_arg(self) -> Bytes {
        Bytes::from(self)
    }
}

macro_rules! numeric_arg {
    ($($ty:ty),*) => {
        $(
            impl ToArg for $ty {
                fn to_arg(self) -> Bytes {
                    Bytes::from(self.to_string().into_bytes())
                }
            }
        )*
    };
}

numeric_arg!(i32, i64, u32, u64, usize, f64);
