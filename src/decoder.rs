//! Decodificador incremental de respuestas.
//!
//! El `Decoder` consume bytes de un `BytesMut` a medida que llegan del
//! transporte y produce frames completos. Todo el estado parcial (bytes de
//! una linea sin terminar, bytes de un bulk a medio leer, la pila de arrays
//! abiertos) se guarda entre llamadas, de forma que un limite de lectura
//! puede caer en cualquier byte sin que se pierda nada ni se vuelva a
//! escanear lo ya consumido.

use bytes::{Buf, BytesMut};
use std::str;

use atoi::FromRadix10SignedChecked;

use crate::{Error, Frame};

/// Tipo de las lineas terminadas en `\r\n`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Line {
    Simple,
    Error,
    Integer,
    Double,
    Boolean,
    Null,
}

/// Tipos agregados cuyo cuerpo son `n` frames anidados.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Aggregate {
    Array,
    Map,
    Push,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// Esperando el byte que indica el tipo del siguiente frame.
    AwaitingType,
    /// Leyendo el cuerpo de una linea (status, error, entero...).
    LineBody(Line),
    /// Leyendo la longitud de un bulk.
    BulkLength,
    /// Leyendo `len` bytes de datos mas el terminador.
    BulkBody { len: usize },
    /// Leyendo la longitud de un agregado.
    AggregateLength(Aggregate),
}

/// Nivel de anidamiento abierto: cuantos elementos faltan y los ya leidos.
#[derive(Debug)]
struct Level {
    kind: Aggregate,
    remaining: usize,
    items: Vec<Frame>,
}

/// Maquina de estados que convierte un stream de bytes troceado de forma
/// arbitraria en una secuencia de frames.
#[derive(Debug)]
pub struct Decoder {
    state: State,
    stack: Vec<Level>,
    line: BytesMut,
    bulk: BytesMut,
}

impl Default for Decoder {
    fn default() -> Decoder {
        Decoder::new()
    }
}

impl Decoder {
    pub fn new() -> Decoder {
        Decoder {
            state: State::AwaitingType,
            stack: Vec::new(),
            line: BytesMut::new(),
            bulk: BytesMut::new(),
        }
    }

    /// `true` si no hay ningun frame a medio decodificar.
    pub fn is_idle(&self) -> bool {
        self.state == State::AwaitingType && self.stack.is_empty()
    }

    /// Consume bytes de `src` hasta completar un frame.
    ///
    /// Retorna `Ok(None)` si `src` se agota antes de completarlo; los bytes
    /// consumidos quedan guardados en el estado interno y la siguiente
    /// llamada continua donde se quedo esta. Tras un error de protocolo el
    /// decodificador no debe volver a usarse.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        loop {
            match self.state {
                State::AwaitingType => {
                    if !src.has_remaining() {
                        return Ok(None);
                    }

                    self.state = match src.get_u8() {
                        b'+' => State::LineBody(Line::Simple),
                        b'-' => State::LineBody(Line::Error),
                        b':' => State::LineBody(Line::Integer),
                        b',' => State::LineBody(Line::Double),
                        b'#' => State::LineBody(Line::Boolean),
                        b'_' => State::LineBody(Line::Null),
                        b'$' => State::BulkLength,
                        b'*' => State::AggregateLength(Aggregate::Array),
                        b'%' => State::AggregateLength(Aggregate::Map),
                        b'>' => State::AggregateLength(Aggregate::Push),
                        actual => {
                            return Err(Error::Protocol(format!(
                                "invalid frame type byte `{}`",
                                actual
                            )))
                        }
                    };
                }
                State::LineBody(kind) => {
                    let line = match self.take_line(src)? {
                        Some(line) => line,
                        None => return Ok(None),
                    };

                    let frame = line_frame(kind, line)?;
                    if let Some(frame) = self.complete(frame) {
                        return Ok(Some(frame));
                    }
                }
                State::BulkLength => {
                    let line = match self.take_line(src)? {
                        Some(line) => line,
                        None => return Ok(None),
                    };

                    match get_length(&line)? {
                        None => {
                            if let Some(frame) = self.complete(Frame::Null) {
                                return Ok(Some(frame));
                            }
                        }
                        Some(len) => self.state = State::BulkBody { len },
                    }
                }
                State::BulkBody { len } => {
                    // Se necesitan los datos mas `\r\n`.
                    let total = len + 2;

                    if self.bulk.is_empty() && src.len() >= total {
                        // Todo el cuerpo esta disponible: sin copias intermedias.
                        let mut body = src.split_to(total);
                        check_terminator(&body[len..])?;
                        body.truncate(len);
                        if let Some(frame) = self.complete(Frame::Bulk(body.freeze())) {
                            return Ok(Some(frame));
                        }
                        continue;
                    }

                    let missing = total - self.bulk.len();
                    let n = missing.min(src.len());
                    self.bulk.extend_from_slice(&src[..n]);
                    src.advance(n);

                    if self.bulk.len() < total {
                        return Ok(None);
                    }

                    let mut body = self.bulk.split();
                    check_terminator(&body[len..])?;
                    body.truncate(len);
                    if let Some(frame) = self.complete(Frame::Bulk(body.freeze())) {
                        return Ok(Some(frame));
                    }
                }
                State::AggregateLength(kind) => {
                    let line = match self.take_line(src)? {
                        Some(line) => line,
                        None => return Ok(None),
                    };

                    let len = get_length(&line)?;
                    let frame = match (kind, len) {
                        (Aggregate::Array, None) => Some(Frame::NullArray),
                        (_, None) => {
                            return Err(Error::Protocol(
                                "null length on map or push frame".into(),
                            ))
                        }
                        (_, Some(0)) => Some(build(kind, Vec::new())),
                        (_, Some(n)) => {
                            let remaining = if kind == Aggregate::Map { n * 2 } else { n };
                            self.stack.push(Level {
                                kind,
                                remaining,
                                items: Vec::with_capacity(remaining.min(1024)),
                            });
                            self.state = State::AwaitingType;
                            None
                        }
                    };

                    if let Some(frame) = frame {
                        if let Some(frame) = self.complete(frame) {
                            return Ok(Some(frame));
                        }
                    }
                }
            }
        }
    }

    /// Registra un frame terminado. Si hay un agregado abierto el frame se
    /// incorpora a el; cuando el agregado se completa se cierra y se
    /// continua hacia arriba en la pila.
    fn complete(&mut self, mut frame: Frame) -> Option<Frame> {
        self.state = State::AwaitingType;

        loop {
            let level = match self.stack.last_mut() {
                Some(level) => level,
                None => return Some(frame),
            };

            level.items.push(frame);
            level.remaining -= 1;
            if level.remaining > 0 {
                return None;
            }

            let level = self.stack.pop()?;
            frame = build(level.kind, level.items);
        }
    }

    /// Lee una linea terminada en `\r\n`. Los bytes de una linea incompleta
    /// se acumulan en `self.line`.
    fn take_line(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, Error> {
        let newline = match src.iter().position(|b| *b == b'\n') {
            Some(pos) => pos,
            None => {
                self.line.extend_from_slice(&src[..]);
                src.clear();
                return Ok(None);
            }
        };

        self.line.extend_from_slice(&src[..=newline]);
        src.advance(newline + 1);

        let mut line = self.line.split();
        let end = line.len() - 1;
        if end == 0 || line[end - 1] != b'\r' {
            return Err(Error::Protocol("line terminated by a lone newline".into()));
        }
        line.truncate(end - 1);
        if line.contains(&b'\r') {
            return Err(Error::Protocol("carriage return inside a line".into()));
        }

        Ok(Some(line))
    }
}

fn line_frame(kind: Line, line: BytesMut) -> Result<Frame, Error> {
    let frame = match kind {
        Line::Simple => Frame::Simple(get_string(line)?),
        Line::Error => Frame::Error(get_string(line)?),
        Line::Integer => Frame::Integer(get_integer(&line)?),
        Line::Double => {
            let text = str::from_utf8(&line)
                .map_err(|_| Error::Protocol("invalid double".into()))?;
            let value = match text {
                "inf" => f64::INFINITY,
                "-inf" => f64::NEG_INFINITY,
                other => other
                    .parse::<f64>()
                    .map_err(|_| Error::Protocol(format!("invalid double `{}`", other)))?,
            };
            Frame::Double(value)
        }
        Line::Boolean => match &line[..] {
            b"t" => Frame::Boolean(true),
            b"f" => Frame::Boolean(false),
            _ => return Err(Error::Protocol("invalid boolean".into())),
        },
        Line::Null => {
            if !line.is_empty() {
                return Err(Error::Protocol("invalid null frame".into()));
            }
            Frame::Null
        }
    };

    Ok(frame)
}

fn build(kind: Aggregate, items: Vec<Frame>) -> Frame {
    match kind {
        Aggregate::Array => Frame::Array(items),
        Aggregate::Push => Frame::Push(items),
        Aggregate::Map => {
            let mut pairs = Vec::with_capacity(items.len() / 2);
            let mut items = items.into_iter();
            while let (Some(key), Some(value)) = (items.next(), items.next()) {
                pairs.push((key, value));
            }
            Frame::Map(pairs)
        }
    }
}

fn get_string(line: BytesMut) -> Result<String, Error> {
    String::from_utf8(line.to_vec())
        .map_err(|_| Error::Protocol("invalid frame format".into()))
}

/// Lee un entero con signo. Toda la linea debe ser numerica.
fn get_integer(line: &[u8]) -> Result<i64, Error> {
    match i64::from_radix_10_signed_checked(line) {
        (Some(value), used) if used == line.len() && !line.is_empty() => Ok(value),
        _ => Err(Error::Protocol(format!(
            "invalid integer `{}`",
            String::from_utf8_lossy(line)
        ))),
    }
}

/// Longitud de un bulk o agregado. `-1` es el marcador de nulo.
fn get_length(line: &[u8]) -> Result<Option<usize>, Error> {
    match get_integer(line)? {
        -1 => Ok(None),
        len if len < 0 => Err(Error::Protocol(format!("invalid length {}", len))),
        len => usize::try_from(len)
            .map(Some)
            .map_err(|_| Error::Protocol("length overflow".into())),
    }
}

fn check_terminator(tail: &[u8]) -> Result<(), Error> {
    if tail != b"\r\n" {
        return Err(Error::Protocol("bulk string not terminated by CRLF".into()));
    }
    Ok(())
}
