//! Integration tests: secure hosts talking over 127.0.0.1.

use arbor_transport::{
    Keypair, Message, MessageRegistry, Packet, SecureConn, SecureHost, ServerIdentity,
    TransportConfig, TransportError,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Ping {
    seq: u32,
    text: String,
}

impl Message for Ping {
    const NAME: &'static str = "test.Ping";
}

#[derive(Debug, Serialize, Deserialize)]
struct Secret(Vec<u8>);

impl Message for Secret {
    const NAME: &'static str = "test.Secret";
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
}

fn registry() -> Arc<MessageRegistry> {
    let mut reg = MessageRegistry::new();
    reg.register::<Ping>().unwrap();
    Arc::new(reg)
}

type Inbox = mpsc::UnboundedReceiver<Result<Packet, TransportError>>;

/// Bind a host whose connections forward everything they read to the
/// returned inbox, ending with the error that stopped the reader.
async fn listening_host(registry: Arc<MessageRegistry>, config: TransportConfig) -> (Arc<SecureHost>, Inbox) {
    let host = SecureHost::bind(Keypair::generate(), "127.0.0.1:0", registry, config)
        .await
        .unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    host.listen(Arc::new(move |conn: Arc<SecureConn>| {
        let tx = tx.clone();
        tokio::spawn(async move {
            loop {
                let res = conn.receive().await;
                let stop = res.is_err();
                let _ = tx.send(res);
                if stop {
                    break;
                }
            }
        });
    }))
    .unwrap();
    (host, rx)
}

async fn next(inbox: &mut Inbox) -> Result<Packet, TransportError> {
    tokio::time::timeout(Duration::from_secs(10), inbox.recv())
        .await
        .expect("receive timed out")
        .expect("inbox closed")
}

#[tokio::test]
async fn two_hosts_exchange_messages() {
    init_tracing();
    let (a, mut inbox_a) = listening_host(registry(), TransportConfig::new()).await;
    let (b, mut inbox_b) = listening_host(registry(), TransportConfig::new()).await;

    a.send(
        b.identity(),
        &Ping {
            seq: 1,
            text: "hello".into(),
        },
    )
    .await
    .unwrap();

    let packet = next(&mut inbox_b).await.unwrap();
    assert_eq!(packet.from.id(), a.identity().id());
    let (from, ping) = packet.downcast::<Ping>().unwrap();
    assert_eq!(ping.seq, 1);
    assert_eq!(ping.text, "hello");

    // The reply reuses the accepted connection.
    b.send(&from, &Ping { seq: 2, text: "back".into() })
        .await
        .unwrap();
    let reply = next(&mut inbox_a).await.unwrap();
    assert_eq!(reply.msg_ref::<Ping>().map(|p| p.seq), Some(2));
    assert_eq!(a.connection_count().await, 1);
    assert_eq!(b.connection_count().await, 1);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn byte_counters_agree_on_both_ends() {
    init_tracing();
    let (server, mut inbox) = listening_host(registry(), TransportConfig::new()).await;
    let client = SecureHost::dialer(Keypair::generate(), registry(), TransportConfig::new());

    for seq in 0..5 {
        client
            .send(server.identity(), &Ping { seq, text: "x".repeat(seq as usize * 10) })
            .await
            .unwrap();
    }
    for _ in 0..5 {
        next(&mut inbox).await.unwrap();
    }

    assert!(client.tx() > 0);
    assert_eq!(client.tx(), server.rx());
    assert_eq!(client.rx(), server.tx());

    let conn = client.connection(&server.identity().id()).await.unwrap();
    assert_eq!(conn.tx(), client.tx());

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn unknown_message_type_tears_down_connection() {
    init_tracing();
    let (server, mut inbox) = listening_host(registry(), TransportConfig::new()).await;

    let mut reg = MessageRegistry::new();
    reg.register::<Ping>().unwrap();
    reg.register::<Secret>().unwrap();
    let client = SecureHost::dialer(Keypair::generate(), Arc::new(reg), TransportConfig::new());

    client
        .send(server.identity(), &Secret(vec![1, 2, 3]))
        .await
        .unwrap();
    assert!(matches!(
        next(&mut inbox).await,
        Err(TransportError::UnknownMessageType(_))
    ));

    server.close().await.unwrap();
    client.close().await.unwrap();
}

#[tokio::test]
async fn sending_unregistered_type_fails_locally() {
    let client = SecureHost::dialer(Keypair::generate(), registry(), TransportConfig::new());
    let target = ServerIdentity::new(Keypair::generate().public(), vec!["127.0.0.1:1".into()]);
    assert!(matches!(
        client.send(&target, &Secret(vec![])).await,
        Err(TransportError::UnknownMessageType(_))
    ));
}

#[tokio::test]
async fn close_twice_returns_already_closed() {
    init_tracing();
    let (server, _inbox) = listening_host(registry(), TransportConfig::new()).await;
    let client = SecureHost::dialer(Keypair::generate(), registry(), TransportConfig::new());

    let conn = client.open(server.identity()).await.unwrap();
    conn.close().await.unwrap();
    assert!(matches!(conn.close().await, Err(TransportError::AlreadyClosed)));
    assert!(matches!(conn.receive().await, Err(TransportError::Closed)));

    server.close().await.unwrap();
    assert!(matches!(server.close().await, Err(TransportError::AlreadyClosed)));
    assert!(server.close().await.unwrap_err().is_closed());
}

#[tokio::test]
async fn closing_unlistened_host_is_noop() {
    let host = SecureHost::bind(Keypair::generate(), "127.0.0.1:0", registry(), TransportConfig::new())
        .await
        .unwrap();
    host.close().await.unwrap();

    let dialer = SecureHost::dialer(Keypair::generate(), registry(), TransportConfig::new());
    assert!(matches!(
        dialer.listen(Arc::new(|_conn: Arc<SecureConn>| {})),
        Err(TransportError::NoAddress(_))
    ));
    dialer.close().await.unwrap();
}

#[tokio::test]
async fn host_close_unblocks_pending_receive() {
    init_tracing();
    let (server, mut inbox) = listening_host(registry(), TransportConfig::new()).await;
    let client = SecureHost::dialer(Keypair::generate(), registry(), TransportConfig::new());

    client
        .send(server.identity(), &Ping { seq: 0, text: String::new() })
        .await
        .unwrap();
    next(&mut inbox).await.unwrap();

    // The server's reader is now parked in receive().
    server.close().await.unwrap();
    let err = next(&mut inbox).await.unwrap_err();
    assert!(err.is_closed(), "unexpected error: {err}");

    client.close().await.unwrap();
}

#[tokio::test]
async fn dialing_wrong_key_fails_handshake() {
    init_tracing();
    let (server, _inbox) = listening_host(registry(), TransportConfig::new()).await;
    let client = SecureHost::dialer(Keypair::generate(), registry(), TransportConfig::new());

    let impostor = ServerIdentity::new(
        Keypair::generate().public(),
        server.identity().addresses().to_vec(),
    );
    assert!(matches!(
        client.open(&impostor).await,
        Err(TransportError::Handshake { .. })
    ));
    assert_eq!(client.connection_count().await, 0);

    server.close().await.unwrap();
}

#[tokio::test]
async fn open_reuses_live_connection() {
    init_tracing();
    let (server, _inbox) = listening_host(registry(), TransportConfig::new()).await;
    let client = SecureHost::dialer(Keypair::generate(), registry(), TransportConfig::new());

    let first = client.open(server.identity()).await.unwrap();
    let second = client.open(server.identity()).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    client.remove_connection(&server.identity().id()).await;
    assert!(first.is_closed());
    let third = client.open(server.identity()).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &third));

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn oversized_message_is_rejected_without_dropping_connection() {
    init_tracing();
    let (server, mut inbox) = listening_host(registry(), TransportConfig::new()).await;
    let config = TransportConfig::new().max_message_size(256);
    let client = SecureHost::dialer(Keypair::generate(), registry(), config);

    let big = Ping { seq: 1, text: "x".repeat(1024) };
    assert!(matches!(
        client.send(server.identity(), &big).await,
        Err(TransportError::MessageTooLarge { max: 256, .. })
    ));

    client
        .send(server.identity(), &Ping { seq: 2, text: "ok".into() })
        .await
        .unwrap();
    let packet = next(&mut inbox).await.unwrap();
    assert_eq!(packet.msg_ref::<Ping>().map(|p| p.seq), Some(2));

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn dial_to_dead_address_is_connect_error() {
    let client = SecureHost::dialer(Keypair::generate(), registry(), TransportConfig::new());
    let placeholder = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = placeholder.local_addr().unwrap().to_string();
    drop(placeholder);

    let target = ServerIdentity::new(Keypair::generate().public(), vec![addr]);
    assert!(matches!(
        client.open(&target).await,
        Err(TransportError::Connect { .. })
    ));

    let nowhere = ServerIdentity::new(Keypair::generate().public(), vec![]);
    assert!(matches!(
        client.open(&nowhere).await,
        Err(TransportError::NoAddress(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_dial_does_not_stall_other_peers() {
    init_tracing();
    let config = TransportConfig::new().handshake_timeout(Duration::from_secs(3));
    let (a, _inbox_a) = listening_host(registry(), config.clone()).await;
    let (b, mut inbox_b) = listening_host(registry(), config).await;
    a.send(b.identity(), &Ping { seq: 1, text: "warm".into() })
        .await
        .unwrap();
    next(&mut inbox_b).await.unwrap();

    // Accepts TCP but never answers the handshake.
    let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mute = ServerIdentity::new(
        Keypair::generate().public(),
        vec![silent.local_addr().unwrap().to_string()],
    );
    let dialer = Arc::clone(&a);
    let stuck = tokio::spawn(async move { dialer.open(&mute).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = std::time::Instant::now();
    a.send(b.identity(), &Ping { seq: 2, text: "live".into() })
        .await
        .unwrap();
    assert_eq!(a.connection_count().await, 1);
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "send to a connected peer took {:?}",
        started.elapsed()
    );
    let packet = next(&mut inbox_b).await.unwrap();
    assert_eq!(packet.msg_ref::<Ping>().map(|p| p.seq), Some(2));

    assert!(matches!(
        stuck.await.unwrap(),
        Err(TransportError::Handshake { .. })
    ));
    drop(silent);
    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_opens_share_one_connection() {
    init_tracing();
    let (server, _inbox) = listening_host(registry(), TransportConfig::new()).await;
    let client = SecureHost::dialer(Keypair::generate(), registry(), TransportConfig::new());

    let opens: Vec<_> = (0..4)
        .map(|_| {
            let client = Arc::clone(&client);
            let to = server.identity().clone();
            tokio::spawn(async move { client.open(&to).await.unwrap() })
        })
        .collect();
    let mut conns = Vec::new();
    for open in opens {
        conns.push(open.await.unwrap());
    }
    assert!(conns.iter().all(|c| Arc::ptr_eq(c, &conns[0])));
    assert_eq!(client.connection_count().await, 1);

    client.close().await.unwrap();
    server.close().await.unwrap();
}
