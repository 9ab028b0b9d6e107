//! Integration tests: services, clients and the service context.

use arbor_overlay::protocols::CountProtocol;
use arbor_overlay::{
    downcast_protocol, Client, ClientRequest, Context, Host, HostConfig, Keypair, LocalTest,
    Message, OverlayError, ProtocolInstance, Registry, Reply, Service, ServiceProcessor,
    ServerIdentity, ServiceId, TreeNodeInstance,
};
use arbor_transport::Packet;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Echo {
    text: String,
}

impl Message for Echo {
    const NAME: &'static str = "test.Echo";
}

#[derive(Debug, Serialize, Deserialize)]
struct Shout {
    text: String,
}

impl Message for Shout {
    const NAME: &'static str = "test.Shout";
}

/// Protocol without channels, so several instances can be built on one
/// node.
struct Idle {
    node: TreeNodeInstance,
}

#[async_trait]
impl ProtocolInstance for Idle {
    fn node(&self) -> &TreeNodeInstance {
        &self.node
    }

    async fn dispatch(&mut self) -> Result<(), OverlayError> {
        Ok(())
    }
}

struct EchoService {
    processor: ServiceProcessor,
    requests: Arc<AtomicUsize>,
    built: Arc<AtomicUsize>,
}

#[async_trait]
impl Service for EchoService {
    async fn process_client_request(
        &self,
        from: &ServerIdentity,
        req: ClientRequest,
    ) -> Result<Reply, OverlayError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.processor.process_client_request(from, &req)
    }

    fn new_protocol(
        &self,
        node: TreeNodeInstance,
    ) -> Result<Option<Box<dyn ProtocolInstance>>, OverlayError> {
        self.built.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Box::new(CountProtocol::new(node)?)))
    }

    fn status(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(
            "requests".to_string(),
            self.requests.load(Ordering::SeqCst).to_string(),
        )])
    }
}

struct Setup {
    registry: Arc<Registry>,
    contexts: Arc<Mutex<Vec<Context>>>,
    built: Arc<AtomicUsize>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
}

fn setup() -> Setup {
    let contexts: Arc<Mutex<Vec<Context>>> = Arc::default();
    let built = Arc::new(AtomicUsize::new(0));

    let mut registry = Registry::with_builtin_protocols().unwrap();
    registry.register_message::<Echo>().unwrap();
    registry
        .register_protocol("Idle", |node| Ok(Box::new(Idle { node }) as Box<dyn ProtocolInstance>))
        .unwrap();

    let seen = contexts.clone();
    let counter = built.clone();
    registry
        .register_service("echo", move |ctx| {
            seen.lock().unwrap().push(ctx);
            let mut processor = ServiceProcessor::new();
            processor.register_request(|_, req: Echo| Ok(Echo { text: req.text }))?;
            Ok(Arc::new(EchoService {
                processor,
                requests: Arc::new(AtomicUsize::new(0)),
                built: counter.clone(),
            }) as Arc<dyn Service>)
        })
        .unwrap();

    Setup {
        registry: Arc::new(registry),
        contexts,
        built,
    }
}

#[tokio::test]
async fn client_request_reaches_service() {
    init_tracing();
    let setup = setup();
    let mut local = LocalTest::new(setup.registry.clone());
    let host = local.gen_hosts(1).await.unwrap().remove(0);

    let client = Client::new("echo", setup.registry.clone());
    let reply: Echo = client
        .send(host.identity(), &Echo { text: "hello".into() })
        .await
        .unwrap();
    assert_eq!(reply.text, "hello");

    // Same connection, second request.
    let reply: Echo = client
        .send(host.identity(), &Echo { text: "again".into() })
        .await
        .unwrap();
    assert_eq!(reply.text, "again");

    let status = host.status().await;
    assert_eq!(status.services["echo"]["requests"], "2");
    assert!(status.rx_bytes > 0);
    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["services"]["echo"]["requests"], "2");

    client.close().await.unwrap();
    local.close_all().await;
}

#[tokio::test]
async fn unknown_service_is_reported_to_client() {
    init_tracing();
    let setup = setup();
    let mut local = LocalTest::new(setup.registry.clone());
    let host = local.gen_hosts(1).await.unwrap().remove(0);

    let client = Client::new("nope", setup.registry.clone());
    let err = client
        .send::<Echo, Echo>(host.identity(), &Echo { text: "x".into() })
        .await
        .unwrap_err();
    match err {
        OverlayError::Status(msg) => assert!(msg.contains("service not found"), "{msg}"),
        other => panic!("expected status error, got {other:?}"),
    }
    assert!(host.service("echo").is_some());
    assert!(host.service("nope").is_none());
    local.close_all().await;
}

#[tokio::test]
async fn unhandled_request_type_is_reported_to_client() {
    init_tracing();
    let setup = setup();
    let mut local = LocalTest::new(setup.registry.clone());
    let host = local.gen_hosts(1).await.unwrap().remove(0);

    let client = Client::new("echo", setup.registry.clone());
    let err = client
        .send::<Shout, Echo>(host.identity(), &Shout { text: "x".into() })
        .await
        .unwrap_err();
    assert!(matches!(err, OverlayError::Status(_)));
    local.close_all().await;
}

#[tokio::test]
async fn rebinding_a_token_fails() {
    init_tracing();
    let setup = setup();
    let mut local = LocalTest::new(setup.registry.clone());
    let (hosts, tree) = local.gen_tree(1, true).await.unwrap();
    let ctx = setup.contexts.lock().unwrap()[0].clone();
    assert_eq!(ctx.server_identity(), hosts[0].identity());

    let node = ctx.new_tree_node_instance(&tree, "Idle").unwrap();
    let token = node.token();
    assert_eq!(token.service_id, Some(ctx.service_id()));
    assert!(ctx.tree_node_instance(&token).is_some());

    let first = Idle { node: node.clone() };
    ctx.register_protocol_instance(&first).unwrap();
    let second = Idle { node: node.clone() };
    assert!(matches!(
        ctx.register_protocol_instance(&second),
        Err(OverlayError::AlreadyBound(_))
    ));

    ctx.start_protocol(Box::new(first)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(node.is_done());
    assert!(ctx.tree_node_instance(&token).is_none());

    // A finished token cannot be taken again either.
    let third = Idle { node };
    assert!(matches!(
        ctx.register_protocol_instance(&third),
        Err(OverlayError::AlreadyBound(_))
    ));
    local.close_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn service_builds_instances_for_its_tokens() {
    init_tracing();
    let setup = setup();
    let mut local = LocalTest::new(setup.registry.clone());
    let (hosts, tree) = local.gen_tree(3, true).await.unwrap();
    let ctx = setup
        .contexts
        .lock()
        .unwrap()
        .iter()
        .find(|c| c.server_identity() == hosts[0].identity())
        .cloned()
        .unwrap();

    let p = ctx.create_protocol(CountProtocol::NAME, &tree).unwrap();
    assert!(p.node().is_root());
    let mut p = downcast_protocol::<CountProtocol>(p).unwrap();
    let result = p.take_result().unwrap();
    ctx.start_protocol(p).await.unwrap();

    let count = tokio::time::timeout(Duration::from_secs(20), result)
        .await
        .expect("count timed out")
        .unwrap();
    assert_eq!(count, 3);
    // The root was built locally; both children through the service.
    assert_eq!(setup.built.load(Ordering::SeqCst), 2);

    // Runs can be tagged for another service.
    let mut other = ctx.create_protocol_for_service("Idle", &tree, "other").unwrap();
    assert_eq!(other.node().token().service_id, Some(ServiceId::from_name("other")));
    assert_ne!(Some(ctx.service_id()), other.node().token().service_id);
    other.done();
    local.close_all().await;
}

#[tokio::test]
async fn failing_service_aborts_host_start() {
    init_tracing();
    let mut registry = Registry::new().unwrap();
    registry
        .register_service("broken", |_| Err(OverlayError::Protocol("no database".into())))
        .unwrap();
    let err = Host::bind(
        Keypair::generate(),
        "127.0.0.1:0",
        Arc::new(registry),
        HostConfig::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, OverlayError::Protocol(_)));
}

#[tokio::test]
async fn duplicate_service_is_rejected() {
    let mut registry = Registry::new().unwrap();
    let factory = |_: Context| -> Result<Arc<dyn Service>, OverlayError> {
        Err(OverlayError::Protocol("unused".into()))
    };
    registry.register_service("svc", factory).unwrap();
    assert!(matches!(
        registry.register_service("svc", factory),
        Err(OverlayError::DuplicateRegistration { .. })
    ));
}

#[tokio::test]
async fn host_close_is_reported_once() {
    init_tracing();
    let setup = setup();
    let mut local = LocalTest::new(setup.registry.clone());
    let host = local.gen_hosts(1).await.unwrap().remove(0);
    host.close().await.unwrap();
    assert!(host.is_closed());
    assert!(matches!(
        host.close().await,
        Err(OverlayError::Transport(e)) if e.is_closed()
    ));
    assert!(host.status().await.closed);
    local.close_all().await;
}

/// Forwards every `Shout` it is handed by its host.
struct Gossip {
    heard: mpsc::UnboundedSender<(ServerIdentity, String)>,
}

#[async_trait]
impl Service for Gossip {
    async fn process(&self, packet: Packet) {
        if let Some(shout) = packet.msg_ref::<Shout>() {
            let _ = self.heard.send((packet.from.clone(), shout.text.clone()));
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn service_messages_reach_the_peer_service() {
    init_tracing();
    let contexts: Arc<Mutex<Vec<Context>>> = Arc::default();
    let (heard_tx, mut heard) = mpsc::unbounded_channel();
    let mut registry = Registry::with_builtin_protocols().unwrap();
    registry.register_message::<Shout>().unwrap();
    let seen = contexts.clone();
    registry
        .register_service("gossip", move |ctx| {
            seen.lock().unwrap().push(ctx);
            Ok(Arc::new(Gossip {
                heard: heard_tx.clone(),
            }) as Arc<dyn Service>)
        })
        .unwrap();

    let mut local = LocalTest::new(Arc::new(registry));
    let hosts = local.gen_hosts(2).await.unwrap();
    let context_of = |host: &Host| {
        contexts
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.server_identity() == host.identity())
            .cloned()
            .unwrap()
    };
    let (sender, receiver) = (context_of(&hosts[0]), context_of(&hosts[1]));

    receiver.register_processor::<Shout>().unwrap();
    assert!(matches!(
        receiver.register_processor::<Echo>(),
        Err(OverlayError::UnregisteredMessage(_))
    ));

    sender
        .send_raw(hosts[1].identity(), &Shout { text: "hello".into() })
        .await
        .unwrap();
    let (from, text) = tokio::time::timeout(Duration::from_secs(5), heard.recv())
        .await
        .expect("shout lost")
        .unwrap();
    assert_eq!(from.id(), hosts[0].identity().id());
    assert_eq!(text, "hello");

    // The sender claimed no processor, so shouts back are dropped.
    receiver
        .send_raw(hosts[0].identity(), &Shout { text: "back".into() })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(heard.try_recv().is_err());
    local.close_all().await;
}
