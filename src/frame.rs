//! Proporciona una representacion de tipos de las tramas del protocolo Redis
//! asi como la serializacion de estos frames a bytes.
//!
//! La decodificacion incremental vive en `decoder`.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

use crate::Error;

/// Un frame (respuesta) en el protocolo Redis.
///
/// Las variantes `Double`, `Boolean`, `Map` y `Push` solo aparecen cuando el
/// servidor habla las extensiones RESP3.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    /// `$-1\r\n` (o `_\r\n` en RESP3).
    Null,
    Array(Vec<Frame>),
    /// `*-1\r\n`. Distinto de un array vacio.
    NullArray,
    Double(f64),
    Boolean(bool),
    Map(Vec<(Frame, Frame)>),
    Push(Vec<Frame>),
}

impl Frame {
    /// Retorna un `Frame::Array` vacio al que se le pueden incorporar
    /// elementos con `push_bulk` y `push_int`.
    pub fn array() -> Frame {
        Frame::Array(vec![])
    }

    /// Incorpora un "bulk" en el array.
    ///
    /// # Panics
    /// Se emitira un panic si `self` no es un array.
    pub fn push_bulk(&mut self, bytes: Bytes) {
        match self {
            Frame::Array(vec) | Frame::Push(vec) => vec.push(Frame::Bulk(bytes)),
            _ => panic!("not an array frame"),
        }
    }

    /// Incorpora un "integer" en el array.
    ///
    /// # Panics
    /// Se emitira un panic si `self` no es un array.
    pub fn push_int(&mut self, value: i64) {
        match self {
            Frame::Array(vec) | Frame::Push(vec) => vec.push(Frame::Integer(value)),
            _ => panic!("not an array frame"),
        }
    }

    /// Convierte un frame de error en `Error::Server`; el resto se retorna
    /// tal cual.
    pub fn into_result(self) -> crate::Result<Frame> {
        match self {
            Frame::Error(msg) => Err(Error::Server(msg)),
            frame => Ok(frame),
        }
    }

    /// Retorna los bytes de un `Simple` o `Bulk`.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Frame::Simple(s) => Some(s.as_bytes()),
            Frame::Bulk(data) => Some(&data[..]),
            _ => None,
        }
    }

    /// Serializa el frame en `dst` con el formato de linea del protocolo.
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Frame::Simple(val) => write_line(dst, b'+', val.as_bytes()),
            Frame::Error(val) => write_line(dst, b'-', val.as_bytes()),
            Frame::Integer(val) => write_line(dst, b':', val.to_string().as_bytes()),
            Frame::Bulk(val) => {
                write_line(dst, b'$', val.len().to_string().as_bytes());
                dst.put_slice(val);
                dst.put_slice(b"\r\n");
            }
            Frame::Null => dst.put_slice(b"$-1\r\n"),
            Frame::NullArray => dst.put_slice(b"*-1\r\n"),
            Frame::Array(items) | Frame::Push(items) => {
                let kind = if matches!(self, Frame::Push(_)) { b'>' } else { b'*' };
                write_line(dst, kind, items.len().to_string().as_bytes());
                for item in items {
                    item.encode(dst);
                }
            }
            Frame::Double(val) => write_line(dst, b',', format_double(*val).as_bytes()),
            Frame::Boolean(val) => write_line(dst, b'#', if *val { b"t" } else { b"f" }),
            Frame::Map(pairs) => {
                write_line(dst, b'%', pairs.len().to_string().as_bytes());
                for (key, value) in pairs {
                    key.encode(dst);
                    value.encode(dst);
                }
            }
        }
    }
}

fn write_line(dst: &mut BytesMut, kind: u8, body: &[u8]) {
    dst.reserve(body.len() + 3);
    dst.put_u8(kind);
    dst.put_slice(body);
    dst.put_slice(b"\r\n");
}

fn format_double(val: f64) -> String {
    if val.is_nan() {
        "nan".to_string()
    } else if val.is_infinite() {
        if val > 0.0 { "inf" } else { "-inf" }.to_string()
    } else {
        val.to_string()
    }
}

impl PartialEq<&str> for Frame {
    fn eq(&self, other: &&str) -> bool {
        match self {
            Frame::Simple(s) => s.eq(other),
            Frame::Bulk(s) => s.eq(other),
            _ => false,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use std::str;

        match self {
            Frame::Simple(response) => response.fmt(fmt),
            Frame::Error(msg) => write!(fmt, "error: {}", msg),
            Frame::Integer(num) => num.fmt(fmt),
            Frame::Bulk(msg) => match str::from_utf8(msg) {
                Ok(string) => string.fmt(fmt),
                Err(_) => write!(fmt, "{:?}", msg),
            },
            Frame::Null | Frame::NullArray => "(nil)".fmt(fmt),
            Frame::Double(num) => num.fmt(fmt),
            Frame::Boolean(val) => val.fmt(fmt),
            Frame::Array(parts) | Frame::Push(parts) => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(fmt, " ")?;
                    }
                    part.fmt(fmt)?;
                }

                Ok(())
            }
            Frame::Map(pairs) => {
                for (i, (key, value)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(fmt, " ")?;
                    }
                    write!(fmt, "{} => {}", key, value)?;
                }

                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(frame: &Frame) -> Vec<u8> {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        buf.to_vec()
    }

    #[test]
    fn encodes_null_variants_differently() {
        assert_eq!(encoded(&Frame::Null), b"$-1\r\n");
        assert_eq!(encoded(&Frame::NullArray), b"*-1\r\n");
        assert_eq!(encoded(&Frame::array()), b"*0\r\n");
    }

    #[test]
    fn encodes_subscribe_confirmation() {
        let mut frame = Frame::array();
        frame.push_bulk(Bytes::from_static(b"subscribe"));
        frame.push_bulk(Bytes::from_static(b"news"));
        frame.push_int(1);
        assert_eq!(encoded(&frame), b"*3\r\n$9\r\nsubscribe\r\n$4\r\nnews\r\n:1\r\n");
    }

    #[test]
    fn error_frame_becomes_server_error() {
        let err = Frame::Error("ERR bad".into()).into_result().unwrap_err();
        assert!(matches!(err, Error::Server(ref msg) if msg == "ERR bad"));
        assert_eq!(Frame::Integer(3).into_result().unwrap(), Frame::Integer(3));
    }

    #[test]
    fn display_joins_array_parts() {
        let frame = Frame::Array(vec![
            Frame::Simple("a".into()),
            Frame::Integer(2),
            Frame::Null,
        ]);
        assert_eq!(frame.to_string(), "a 2 (nil)");
    }
}
