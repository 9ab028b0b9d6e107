//! Integration tests: built-in protocols across hosts on 127.0.0.1.

use arbor_overlay::protocols::close_all::{Close, PrepareClose};
use arbor_overlay::protocols::{count_with_retry, CloseAllProtocol, CountProtocol};
use arbor_overlay::{LocalTest, OverlayError, ProtocolInstance, Registry, Roster, TreeNodeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
}

fn builtins() -> Arc<Registry> {
    Arc::new(Registry::with_builtin_protocols().unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn count_on_seven_nodes() {
    init_tracing();
    let mut local = LocalTest::new(builtins());
    let (hosts, tree) = local.gen_tree(7, true).await.unwrap();
    assert_eq!(tree.depth(), 2);

    let mut p = hosts[0]
        .create_protocol_typed::<CountProtocol>(CountProtocol::NAME, &tree)
        .unwrap();
    p.set_timeout(Duration::from_secs(5));
    let result = p.take_result().unwrap();
    hosts[0].start_protocol(p).await.unwrap();

    let count = tokio::time::timeout(Duration::from_secs(20), result)
        .await
        .expect("count timed out")
        .unwrap();
    assert_eq!(count, 7);
    local.close_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn count_fetches_unknown_tree_from_sender() {
    init_tracing();
    let mut local = LocalTest::new(builtins());
    // Only the root knows the tree.
    let (hosts, tree) = local.gen_tree(7, false).await.unwrap();
    assert!(hosts[1].tree(&tree.id()).is_none());

    let count = count_with_retry(&hosts[0], &tree, 7).await.unwrap();
    assert_eq!(count, 7);
    for host in &hosts {
        assert!(host.tree(&tree.id()).is_some());
        assert!(host.roster(&tree.roster().id()).is_some());
    }
    local.close_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn count_with_nodes_sharing_hosts() {
    init_tracing();
    let mut local = LocalTest::new(builtins());
    let hosts = local.gen_hosts(3).await.unwrap();
    let roster = Arc::new(Roster::new(
        hosts.iter().map(|h| h.identity().clone()).collect(),
    ));
    // Seven nodes on three hosts: several nodes talk through loopback.
    let tree = Arc::new(roster.generate_tree(2, 7).unwrap());
    for host in &hosts {
        host.register_tree(tree.clone());
    }

    let count = count_with_retry(&hosts[0], &tree, 7).await.unwrap();
    assert_eq!(count, 7);
    local.close_all().await;
}

#[tokio::test]
async fn count_on_lone_root() {
    init_tracing();
    let mut local = LocalTest::new(builtins());
    let (hosts, tree) = local.gen_tree(1, true).await.unwrap();
    let mut p = hosts[0]
        .create_protocol_typed::<CountProtocol>(CountProtocol::NAME, &tree)
        .unwrap();
    let result = p.take_result().unwrap();
    hosts[0].start_protocol(p).await.unwrap();
    assert_eq!(result.await.unwrap(), 1);

    // The instance finishes on its own.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hosts[0].status().await.instances, 0);
    local.close_all().await;
}

#[tokio::test]
async fn unknown_protocol_is_rejected() {
    init_tracing();
    let mut local = LocalTest::new(builtins());
    let (hosts, tree) = local.gen_tree(2, true).await.unwrap();
    assert!(matches!(
        hosts[0].create_protocol("NoSuchProtocol", &tree),
        Err(OverlayError::UnknownProtocol(_))
    ));
    local.close_all().await;
}

#[tokio::test]
async fn server_outside_tree_cannot_create() {
    init_tracing();
    let mut local = LocalTest::new(builtins());
    let (_hosts, tree) = local.gen_tree(3, true).await.unwrap();
    let outsider = local.gen_hosts(1).await.unwrap().remove(0);
    assert!(matches!(
        outsider.create_protocol(CountProtocol::NAME, &tree),
        Err(OverlayError::NotInTree(_))
    ));
    local.close_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_all_closes_children_before_parents() {
    init_tracing();
    let log: Arc<Mutex<Vec<TreeNodeId>>> = Arc::default();
    let mut registry = Registry::new().unwrap();
    CloseAllProtocol::register_messages(&mut registry).unwrap();
    let observer_log = log.clone();
    registry
        .register_protocol("ObservedCloseAll", move |node| {
            let log = observer_log.clone();
            let observer = Arc::new(move |id: TreeNodeId| log.lock().unwrap().push(id));
            Ok(Box::new(CloseAllProtocol::with_observer(node, observer)?) as Box<dyn ProtocolInstance>)
        })
        .unwrap();
    assert!(registry.messages().is_registered(&arbor_overlay::MessageTypeId::of::<Close>()));
    assert!(registry.messages().is_registered(&arbor_overlay::MessageTypeId::of::<PrepareClose>()));

    let mut local = LocalTest::new(Arc::new(registry));
    let (hosts, tree) = local.gen_tree(15, true).await.unwrap();
    assert_eq!(tree.depth(), 3);
    assert!(tree.uses_roster_fully());

    let mut p = hosts[0]
        .create_protocol_typed::<CloseAllProtocol>("ObservedCloseAll", &tree)
        .unwrap();
    let done = p.take_done().unwrap();
    hosts[0].start_protocol(p).await.unwrap();
    tokio::time::timeout(Duration::from_secs(30), done)
        .await
        .expect("close-all timed out")
        .unwrap();

    let log = log.lock().unwrap().clone();
    assert_eq!(log.len(), 15);
    let position: HashMap<_, _> = log.iter().enumerate().map(|(i, id)| (*id, i)).collect();
    for node in tree.nodes() {
        for child in node.children() {
            assert!(
                position[child] < position[&node.id()],
                "{} closed before its child {}",
                node.id(),
                child
            );
        }
    }
    assert_eq!(log.last(), Some(&tree.root().id()));

    // The root closes its own host before it reports done.
    assert!(hosts[0].is_closed());
    for host in &hosts[1..] {
        tokio::time::timeout(Duration::from_secs(10), host.closed())
            .await
            .expect("host stayed open");
    }
    local.close_all().await;
}
