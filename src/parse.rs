use crate::{Error, Frame};

use bytes::Bytes;
use std::{fmt, str, vec};

/// Utilidad para recorrer un frame de tipo array.
///
/// Los mensajes push del servidor (`message`, `pmessage`, `subscribe`...)
/// son arrays donde cada entrada es un "token". Una instancia de `Parse`
/// se inicializa con un array de frames y proporciona una API del estilo
/// de un cursor.
#[derive(Debug)]
pub(crate) struct Parse {
    /// Iterador para recorrer un Frame::Array.
    parts: vec::IntoIter<Frame>,
}

/// Error encontrado mientras se parsea un frame.
///
/// Unicamente el error `EndOfStream` es gestionado en runtime. Todos los
/// otros errores terminan con el cierre de la conexion.
#[derive(Debug)]
pub(crate) enum ParseError {
    /// El intento de extraer un frame ha fallado porque se han consumido todos los frames.
    EndOfStream,

    /// Todos los otros errores
    Other(String),
}

impl Parse {
    /// Crea un nuevo `Parse` para parsear el contenido de un `frame`.
    ///
    /// Retorna un `Err` si el frame no es un array (o un push RESP3).
    pub(crate) fn new(frame: Frame) -> Result<Parse, ParseError> {
        let array = match frame {
            Frame::Array(array) | Frame::Push(array) => array,
            frame => {
                return Err(format!("protocol error; expected array, got {:?}", frame).into())
            }
        };

        Ok(Parse {
            parts: array.into_iter(),
        })
    }

    /// Retorna la siguiente entrada del iterador o un error si no quedan mas.
    fn next(&mut self) -> Result<Frame, ParseError> {
        self.parts.next().ok_or(ParseError::EndOfStream)
    }

    /// Retorna la siguiente entrada como una string.
    ///
    /// Si la siguiente entrada no puede ser representada como una string
    /// entonces un error sera retornado.
    pub(crate) fn next_string(&mut self) -> Result<String, ParseError> {
        match self.next()? {
            // Ambos `Simple` y `Bulk` pueden ser representados por una String.
            Frame::Simple(s) => Ok(s),
            Frame::Bulk(data) => str::from_utf8(&data[..])
                .map(|s| s.to_string())
                .map_err(|_| "protocol error; invalid string".into()),
            frame => Err(format!(
                "protocol error; expected simple frame or bulk frame, got {:?}",
                frame
            )
            .into()),
        }
    }

    /// Return the next entry as raw bytes.
    ///
    /// If the next entry cannot be represented as raw bytes, an error is
    /// returned.
    pub(crate) fn next_bytes(&mut self) -> Result<Bytes, ParseError> {
        match self.next()? {
            // Both `Simple` and `Bulk` representation may be raw bytes.
            //
            // Although errors are stored as strings and could be represented as
            // raw bytes, they are considered separate types.
            Frame::Simple(s) => Ok(Bytes::from(s.into_bytes())),
            Frame::Bulk(data) => Ok(data),
            frame => Err(format!(
                "protocol error; expected simple frame or bulk frame, got {:?}",
                frame
            )
            .into()),
        }
    }

    /// Return the next entry as an integer.
    ///
    /// This includes `Simple`, `Bulk`, and `Integer` frame types. `Simple` and
    /// `Bulk` frame types are parsed.
    pub(crate) fn next_int(&mut self) -> Result<i64, ParseError> {
        use atoi::atoi;

        const MSG: &str = "protocol error; invalid number";

        match self.next()? {
            Frame::Integer(v) => Ok(v),
            Frame::Simple(data) => atoi::<i64>(data.as_bytes()).ok_or_else(|| MSG.into()),
            Frame::Bulk(data) => atoi::<i64>(&data).ok_or_else(|| MSG.into()),
            frame => Err(format!("protocol error; expected int frame but got {:?}", frame).into()),
        }
    }

    /// Ensure there are no more entries in the array
    pub(crate) fn finish(&mut self) -> Result<(), ParseError> {
        if self.parts.next().is_none() {
            Ok(())
        } else {
            Err("protocol error; expected end of frame, but there was more".into())
        }
    }
}

impl From<String> for ParseError {
    fn from(src: String) -> ParseError {
        ParseError::Other(src)
    }
}

impl From<&str> for ParseError {
    fn from(src: &str) -> ParseError {
        src.to_string().into()
    }
}

impl From<ParseError> for Error {
    fn from(src: ParseError) -> Error {
        match src {
            ParseError::EndOfStream => {
                Error::Protocol("unexpected end of push message".to_string())
            }
            ParseError::Other(msg) => Error::Protocol(msg),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::EndOfStream => "protocol error; unexpected end of stream".fmt(f),
            ParseError::Other(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for ParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_a_message_push() {
        let mut frame = Frame::array();
        frame.push_bulk(Bytes::from_static(b"message"));
        frame.push_bulk(Bytes::from_static(b"news"));
        frame.push_bulk(Bytes::from_static(b"hello"));

        let mut parse = Parse::new(frame).unwrap();
        assert_eq!(parse.next_string().unwrap(), "message");
        assert_eq!(parse.next_bytes().unwrap(), Bytes::from_static(b"news"));
        assert_eq!(parse.next_bytes().unwrap(), Bytes::from_static(b"hello"));
        parse.finish().unwrap();
        assert!(matches!(parse.next_int(), Err(ParseError::EndOfStream)));
    }

    #[test]
    fn rejects_non_array_frames() {
        assert!(Parse::new(Frame::Integer(1)).is_err());
    }

    #[test]
    fn reads_counts_from_integers_or_bulks() {
        let frame = Frame::Array(vec![Frame::Integer(-2), Frame::Bulk(Bytes::from_static(b"7"))]);
        let mut parse = Parse::new(frame).unwrap();
        assert_eq!(parse.next_int().unwrap(), -2);
        assert_eq!(parse.next_int().unwrap(), 7);
        assert!(parse.finish().is_ok());
    }
}
