#![allow(dead_code)]

//! Servidor simulado sobre `tokio::io::duplex` para los tests de
//! integracion.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use pipelined_redis::{BoxTransport, Config, Connection, Connector, Decoder, Frame};
use tokio::io::{duplex, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::mpsc;

pub const NO_ARGS: [&str; 0] = [];

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn bulk(data: &str) -> Frame {
    Frame::Bulk(Bytes::copy_from_slice(data.as_bytes()))
}

/// Array de bulks, con la forma de un mensaje push RESP2.
pub fn push(parts: &[&str]) -> Frame {
    Frame::Array(parts.iter().map(|part| bulk(part)).collect())
}

pub fn confirmation(kind: &str, target: &str, count: i64) -> Frame {
    Frame::Array(vec![bulk(kind), bulk(target), Frame::Integer(count)])
}

/// Extremo servidor de un transporte en memoria.
pub struct FakeServer {
    stream: DuplexStream,
    buffer: BytesMut,
    decoder: Decoder,
    /// Escrituras realizadas por el cliente sobre este transporte.
    client_writes: Arc<AtomicUsize>,
}

impl FakeServer {
    fn new(stream: DuplexStream, client_writes: Arc<AtomicUsize>) -> FakeServer {
        FakeServer {
            stream,
            buffer: BytesMut::new(),
            decoder: Decoder::new(),
            client_writes,
        }
    }

    /// Lee el siguiente comando enviado por el cliente.
    pub async fn read_command(&mut self) -> Vec<String> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.buffer).unwrap() {
                let parts = match frame {
                    Frame::Array(parts) => parts,
                    frame => panic!("expected a command array, got {:?}", frame),
                };

                return parts
                    .into_iter()
                    .map(|part| match part {
                        Frame::Bulk(data) => String::from_utf8(data.to_vec()).unwrap(),
                        part => panic!("expected a bulk argument, got {:?}", part),
                    })
                    .collect();
            }

            let n = self.stream.read_buf(&mut self.buffer).await.unwrap();
            assert!(n > 0, "client closed the connection");
        }
    }

    pub async fn expect(&mut self, expected: &[&str]) {
        assert_eq!(self.read_command().await, expected);
    }

    pub async fn reply(&mut self, frame: Frame) {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        self.stream.write_all(&buf).await.unwrap();
    }

    /// Escribe los frames byte a byte, cediendo el control entre bytes para
    /// que el cliente lea cada uno por separado.
    pub async fn reply_bytewise(&mut self, frames: &[Frame]) {
        let mut buf = BytesMut::new();
        for frame in frames {
            frame.encode(&mut buf);
        }

        for byte in buf.iter() {
            self.stream.write_all(&[*byte]).await.unwrap();
            tokio::task::yield_now().await;
        }
    }

    pub async fn send_raw(&mut self, data: &[u8]) {
        self.stream.write_all(data).await.unwrap();
    }

    pub fn client_writes(&self) -> usize {
        self.client_writes.load(Ordering::SeqCst)
    }
}

/// Envuelve el extremo servidor de un `duplex` creado por el test.
pub fn fake_server(stream: DuplexStream) -> FakeServer {
    FakeServer::new(stream, Arc::new(AtomicUsize::new(0)))
}

/// Establece una conexion sobre un transporte en memoria. Sin credenciales
/// ni base de datos, el handshake no envia nada.
pub async fn connect(config: &Config) -> (Connection, FakeServer) {
    let (client, server) = duplex(64 * 1024);
    let writes = Arc::new(AtomicUsize::new(0));
    let transport = CountingStream {
        inner: client,
        writes: writes.clone(),
    };

    let conn = Connection::establish(transport, config).await.unwrap();
    (conn, FakeServer::new(server, writes))
}

/// Transporte que cuenta las escrituras del cliente.
pub struct CountingStream {
    inner: DuplexStream,
    writes: Arc<AtomicUsize>,
}

impl AsyncRead for CountingStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for CountingStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let res = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &res {
            if *n > 0 {
                self.writes.fetch_add(1, Ordering::SeqCst);
            }
        }
        res
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// `Connector` en memoria. Cada apertura aceptada entrega el extremo
/// servidor por el canal retornado en el constructor.
#[derive(Clone)]
pub struct TestConnector {
    inner: Arc<Inner>,
}

struct Inner {
    /// Aperturas que se rechazaran antes de aceptar. `None` rechaza
    /// siempre.
    refusals: Mutex<Option<usize>>,
    attempts: AtomicUsize,
    servers: mpsc::UnboundedSender<FakeServer>,
}

impl TestConnector {
    pub fn new() -> (TestConnector, mpsc::UnboundedReceiver<FakeServer>) {
        TestConnector::with_refusals(Some(0))
    }

    /// Rechaza las `n` primeras aperturas.
    pub fn refusing(n: usize) -> (TestConnector, mpsc::UnboundedReceiver<FakeServer>) {
        TestConnector::with_refusals(Some(n))
    }

    pub fn refusing_all() -> (TestConnector, mpsc::UnboundedReceiver<FakeServer>) {
        TestConnector::with_refusals(None)
    }

    fn with_refusals(
        refusals: Option<usize>,
    ) -> (TestConnector, mpsc::UnboundedReceiver<FakeServer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = TestConnector {
            inner: Arc::new(Inner {
                refusals: Mutex::new(refusals),
                attempts: AtomicUsize::new(0),
                servers: tx,
            }),
        };
        (connector, rx)
    }

    /// Numero de aperturas solicitadas, aceptadas o no.
    pub fn attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for TestConnector {
    fn open(&self) -> Pin<Box<dyn Future<Output = io::Result<BoxTransport>> + Send + '_>> {
        Box::pin(async move {
            self.inner.attempts.fetch_add(1, Ordering::SeqCst);

            {
                let mut refusals = self.inner.refusals.lock().unwrap();
                match &mut *refusals {
                    None => return Err(io::ErrorKind::ConnectionRefused.into()),
                    Some(0) => {}
                    Some(n) => {
                        *n -= 1;
                        return Err(io::ErrorKind::ConnectionRefused.into());
                    }
                }
            }

            let (client, server) = duplex(64 * 1024);
            let writes = Arc::new(AtomicUsize::new(0));
            let _ = self.inner.servers.send(FakeServer::new(server, writes.clone()));

            Ok(Box::new(CountingStream {
                inner: client,
                writes,
            }) as BoxTransport)
        })
    }
}
