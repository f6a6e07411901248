mod support;

use std::future::{self, Future};
use std::io;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use pipelined_redis::{
    BoxTransport, Command, Config, Connection, ConnectionState, Connector, Credentials, Error, Frame, Mode,
};
use support::{bulk, confirmation, push, FakeServer};
use tokio::io::duplex;
use tokio::time::{self, Instant};

fn get(key: &str) -> Command {
    Command::new("GET").arg(key)
}

async fn wait_closed(conn: &Connection) {
    let mut states = conn.state_changes();
    while *states.borrow_and_update() != ConnectionState::Closed {
        states.changed().await.unwrap();
    }
}

/// Suscribe la conexion a `channel` respondiendo la confirmacion desde el
/// servidor simulado.
async fn subscribe(conn: &Connection, server: &mut FakeServer, channel: &str) -> pipelined_redis::Subscription {
    let target = [Bytes::copy_from_slice(channel.as_bytes())];
    let (sub, _) = tokio::join!(conn.subscribe(Mode::Exact, &target), async {
        server.expect(&["SUBSCRIBE", channel]).await;
        server.reply(confirmation("subscribe", channel, 1)).await;
    });
    sub.unwrap()
}

#[tokio::test]
async fn replies_resolve_in_order_when_delivered_one_byte_at_a_time() {
    support::init_tracing();
    let (conn, mut server) = support::connect(&Config::default()).await;

    let a = conn.send(get("a")).await.unwrap();
    let b = conn.send(get("b")).await.unwrap();
    let c = conn.send(get("c")).await.unwrap();

    for key in ["a", "b", "c"] {
        server.expect(&["GET", key]).await;
    }

    server
        .reply_bytewise(&[
            bulk("first"),
            Frame::Null,
            Frame::Array(vec![Frame::Integer(1), Frame::NullArray]),
        ])
        .await;

    assert_eq!(a.await.unwrap(), bulk("first"));
    assert_eq!(b.await.unwrap(), Frame::Null);
    assert_eq!(
        c.await.unwrap(),
        Frame::Array(vec![Frame::Integer(1), Frame::NullArray])
    );
    assert_eq!(conn.pending_count(), 0);
}

#[tokio::test]
async fn concurrent_submissions_are_never_interleaved() {
    let (conn, mut server) = support::connect(&Config::default()).await;

    let mut tasks = vec![];
    for i in 0..20 {
        let conn = conn.clone();
        tasks.push(tokio::spawn(async move {
            let key = format!("key-{}", i);
            let reply = conn.send(Command::new("ECHO").arg(&key)).await.unwrap();
            (key, reply)
        }));
    }

    let mut replies = vec![];
    for task in tasks {
        replies.push(task.await.unwrap());
    }

    // El servidor responde con el argumento de cada comando en el orden en
    // que los recibio; cada llamador debe recibir su propio argumento.
    for _ in 0..20 {
        let cmd = server.read_command().await;
        assert_eq!(cmd.len(), 2);
        server.reply(bulk(&cmd[1])).await;
    }

    for (key, reply) in replies {
        assert_eq!(reply.await.unwrap(), bulk(&key));
    }
}

#[tokio::test]
async fn server_error_is_delivered_and_connection_survives() {
    let (conn, mut server) = support::connect(&Config::default()).await;

    let (res, _) = tokio::join!(conn.submit(get("a")), async {
        server.expect(&["GET", "a"]).await;
        server.reply(Frame::Error("ERR bad".into())).await;
    });
    match res {
        Err(Error::Server(msg)) => assert_eq!(msg, "ERR bad"),
        other => panic!("unexpected {:?}", other),
    }

    let (res, _) = tokio::join!(conn.submit(get("b")), async {
        server.expect(&["GET", "b"]).await;
        server.reply(bulk("ok")).await;
    });
    assert_eq!(res.unwrap(), "ok");
    assert!(conn.is_ready());
}

#[tokio::test]
async fn resp3_push_does_not_consume_a_pending_request() {
    let (conn, mut server) = support::connect(&Config::default()).await;

    let reply = conn.send(get("a")).await.unwrap();
    server.expect(&["GET", "a"]).await;
    server
        .reply(Frame::Push(vec![bulk("message"), bulk("news"), bulk("hi")]))
        .await;
    server.reply(bulk("value")).await;

    assert_eq!(reply.await.unwrap(), "value");
}

#[tokio::test]
async fn push_shaped_array_outside_pubsub_is_an_ordinary_reply() {
    let (conn, mut server) = support::connect(&Config::default()).await;

    let (res, _) = tokio::join!(conn.submit(Command::new("LRANGE").args(["l", "0", "-1"])), async {
        server.expect(&["LRANGE", "l", "0", "-1"]).await;
        server.reply(push(&["message", "a", "b"])).await;
    });

    assert_eq!(res.unwrap(), push(&["message", "a", "b"]));
}

#[tokio::test]
async fn push_message_while_subscribed_leaves_the_queue_aligned() {
    let (conn, mut server) = support::connect(&Config::default()).await;
    let mut sub = subscribe(&conn, &mut server, "news").await;
    assert_eq!(conn.state(), ConnectionState::Subscribed);

    let (pong, _) = tokio::join!(conn.submit(Command::new("PING")), async {
        server.expect(&["PING"]).await;
        server.reply(push(&["message", "news", "hello"])).await;
        server.reply(push(&["pong", ""])).await;
    });

    assert_eq!(pong.unwrap(), push(&["pong", ""]));
    let msg = sub.next_message().await.unwrap().unwrap();
    assert_eq!(msg.payload, "hello");
}

#[tokio::test]
async fn data_commands_are_rejected_while_subscribed() {
    let (conn, mut server) = support::connect(&Config::default()).await;
    let _sub = subscribe(&conn, &mut server, "news").await;

    match conn.submit(get("a")).await {
        Err(Error::Subscribed(name)) => assert_eq!(name, "GET"),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(conn.pending_count(), 0);
}

#[tokio::test]
async fn unsubscribing_from_everything_returns_to_ready() {
    let (conn, mut server) = support::connect(&Config::default()).await;
    let mut sub = subscribe(&conn, &mut server, "news").await;

    let (res, _) = tokio::join!(conn.unsubscribe(Mode::Exact, &[]), async {
        server.expect(&["UNSUBSCRIBE", "news"]).await;
        server.reply(confirmation("unsubscribe", "news", 0)).await;
    });
    res.unwrap();

    assert_eq!(conn.state(), ConnectionState::Ready);
    assert_eq!(sub.next_message().await.unwrap(), None);
}

#[tokio::test]
async fn dropped_transport_fails_every_pending_request() {
    let (conn, server) = support::connect(&Config::default()).await;

    let mut replies = vec![];
    for i in 0..5 {
        replies.push(conn.send(get(&i.to_string())).await.unwrap());
    }
    drop(server);

    for reply in replies {
        assert!(matches!(reply.await, Err(Error::ConnectionClosed)));
    }
    wait_closed(&conn).await;
    assert_eq!(conn.pending_count(), 0);
}

#[tokio::test]
async fn close_fails_pending_requests_and_rejects_new_ones() {
    let (conn, _server) = support::connect(&Config::default()).await;

    let a = conn.send(get("a")).await.unwrap();
    let b = conn.send(get("b")).await.unwrap();
    conn.close().await;

    assert!(matches!(a.await, Err(Error::ConnectionClosed)));
    assert!(matches!(b.await, Err(Error::ConnectionClosed)));
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(matches!(conn.submit(get("c")).await, Err(Error::ConnectionClosed)));
}

#[tokio::test]
async fn malformed_reply_tears_down_the_connection() {
    let (conn, mut server) = support::connect(&Config::default()).await;

    let reply = conn.send(get("a")).await.unwrap();
    server.expect(&["GET", "a"]).await;
    server.send_raw(b"?oops\r\n").await;

    assert!(matches!(reply.await, Err(Error::ConnectionClosed)));
    wait_closed(&conn).await;
}

#[tokio::test(start_paused = true)]
async fn timed_out_request_keeps_later_replies_aligned() {
    let config = Config::default().with_command_timeout(Duration::from_millis(50));
    let (conn, mut server) = support::connect(&config).await;

    assert!(matches!(conn.submit(get("a")).await, Err(Error::Timeout)));
    assert_eq!(conn.pending_count(), 1);

    let b = conn.send(get("b")).await.unwrap();
    server.expect(&["GET", "a"]).await;
    server.expect(&["GET", "b"]).await;
    server.reply(bulk("A")).await;
    server.reply(bulk("B")).await;

    assert_eq!(conn.wait(b).await.unwrap(), "B");
    assert_eq!(conn.pending_count(), 0);
}

#[tokio::test]
async fn handshake_authenticates_and_selects_database() {
    let config = Config::default()
        .with_auth(Credentials::user("app", "secret"))
        .with_database(2);
    let (client, server) = duplex(64 * 1024);
    let mut server = support::fake_server(server);

    let (conn, _) = tokio::join!(Connection::establish(client, &config), async {
        server.expect(&["AUTH", "app", "secret"]).await;
        server.reply(Frame::Simple("OK".into())).await;
        server.expect(&["SELECT", "2"]).await;
        server.reply(Frame::Simple("OK".into())).await;
    });

    assert!(conn.unwrap().is_ready());
}

#[tokio::test]
async fn rejected_credentials_fail_with_auth_error() {
    let config = Config::default().with_auth(Credentials::password("wrong"));
    let (client, server) = duplex(64 * 1024);
    let mut server = support::fake_server(server);

    let (conn, _) = tokio::join!(Connection::establish(client, &config), async {
        server.expect(&["AUTH", "wrong"]).await;
        server
            .reply(Frame::Error("WRONGPASS invalid username-password pair".into()))
            .await;
    });

    match conn {
        Err(Error::Auth(msg)) => assert!(msg.starts_with("WRONGPASS")),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn rejected_batch_leaves_nothing_behind() {
    let (conn, mut server) = support::connect(&Config::default()).await;

    let err = conn
        .send_batch(vec![get("a"), Command::default()])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidCommand(_)));
    assert_eq!(conn.pending_count(), 0);

    // El siguiente comando escrito es el SUBSCRIBE, sin restos del lote.
    let _sub = subscribe(&conn, &mut server, "news").await;
    assert_eq!(conn.state(), ConnectionState::Subscribed);
    assert_eq!(server.client_writes(), 1);
}

#[tokio::test]
async fn close_abandons_a_blocked_write() {
    // El servidor nunca lee y el transporte solo admite 64 bytes.
    let (client, _server) = duplex(64);
    let conn = Connection::establish(client, &Config::default()).await.unwrap();

    let first = conn.send(get("a")).await.unwrap();

    let writer = conn.clone();
    let blocked = tokio::spawn(async move {
        writer
            .send(Command::new("SET").arg("b").arg(vec![b'x'; 4096]))
            .await
    });
    while conn.pending_count() < 2 {
        tokio::task::yield_now().await;
    }

    time::timeout(Duration::from_millis(500), conn.close())
        .await
        .unwrap();

    assert!(matches!(first.await, Err(Error::ConnectionClosed)));
    assert!(blocked.await.unwrap().is_err());
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn idle_timeout_waits_for_pending_replies() {
    let config = Config::default().with_idle_timeout(Duration::from_secs(1));
    let (conn, mut server) = support::connect(&config).await;

    let reply = conn.send(get("a")).await.unwrap();
    server.expect(&["GET", "a"]).await;

    time::sleep(Duration::from_secs(5)).await;
    assert!(conn.is_ready());

    server.reply(bulk("1")).await;
    assert_eq!(reply.await.unwrap(), "1");

    // Sin nada pendiente, la conexion se cierra al cumplirse el plazo.
    let start = Instant::now();
    wait_closed(&conn).await;
    assert!(start.elapsed() >= Duration::from_secs(1));
}

/// `Connector` cuya apertura nunca termina.
struct Stalled;

impl Connector for Stalled {
    fn open(&self) -> Pin<Box<dyn Future<Output = io::Result<BoxTransport>> + Send + '_>> {
        Box::pin(future::pending())
    }
}

#[tokio::test(start_paused = true)]
async fn stalled_open_fails_with_connect_error() {
    let config = Config::default().with_connect_timeout(Duration::from_millis(200));

    let start = Instant::now();
    let err = Connection::connect(&Stalled, &config).await.unwrap_err();

    assert!(matches!(err, Error::Connect(_)));
    assert!(start.elapsed() >= Duration::from_millis(200));
}
