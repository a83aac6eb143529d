use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use wiring_node::{Message, MemoryStore, WiringNode, WiringSender, HTTP_PROTOCOL};
use wiring_test_utils::{init_test_logging, test_node_config, unique_root, wait_until, EchoReceiver};

/// INTENTION: Export an echo receiver on node A, let node B discover and import
/// it through the shared directory, and check the round trip including the
/// sender identity seen by A.
#[tokio::test]
async fn test_echo_between_two_nodes() {
    init_test_logging();
    let store = Arc::new(MemoryStore::new());
    let root = unique_root();

    let node_a = WiringNode::start(test_node_config("z1", "A", &root), store.clone())
        .await
        .expect("node A starts");
    let node_b = WiringNode::start(test_node_config("z1", "B", &root), store.clone())
        .await
        .expect("node B starts");

    let echo = EchoReceiver::new();
    node_a.register_receiver("echoService", echo.clone()).await;

    let sender = node_b
        .wait_for_sender("z1", "A", "echoService", Duration::from_secs(5))
        .await
        .expect("B imports A's endpoint");
    let reply = timeout(
        Duration::from_secs(5),
        sender.send_message(Message::new("client", "hello")),
    )
    .await
    .expect("send completes")
    .expect("send succeeds");
    assert_eq!(reply.as_deref(), Some("echo: hello"));

    let received = echo.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].from_zone, "z1");
    assert_eq!(received[0].from_node, "B");
    assert_eq!(received[0].service_id, "echoService");
    assert_eq!(received[0].message, "hello");

    // A never discovers its own endpoint
    assert!(node_a
        .discovered_nodes()
        .iter()
        .all(|d| !d.id().is_on("z1", "A")));

    node_b.stop().await.unwrap();
    node_a.stop().await.unwrap();
}

/// INTENTION: Unregistering a receiver withdraws it from the directory and the
/// importing node drops its sender.
#[tokio::test]
async fn test_unregister_withdraws_remote_sender() {
    init_test_logging();
    let store = Arc::new(MemoryStore::new());
    let root = unique_root();
    let node_a = WiringNode::start(test_node_config("z1", "A", &root), store.clone())
        .await
        .unwrap();
    let node_b = WiringNode::start(test_node_config("z1", "B", &root), store.clone())
        .await
        .unwrap();

    node_a.register_receiver("echoService", EchoReceiver::new()).await;
    node_b
        .wait_for_sender("z1", "A", "echoService", Duration::from_secs(5))
        .await
        .unwrap();

    assert!(node_a.unregister_receiver("echoService").await);
    let gone = wait_until(Duration::from_secs(5), || async {
        node_b.sender("z1", "A", "echoService").await.is_none()
    })
    .await;
    assert!(gone, "B still holds a sender for a withdrawn endpoint");
    assert!(node_a.exported_endpoints().await.is_empty());

    node_b.stop().await.unwrap();
    node_a.stop().await.unwrap();
}

/// INTENTION: Stopping a node removes its endpoints from the directory, so peers
/// forget them without waiting for the TTL.
#[tokio::test]
async fn test_stopped_node_disappears_from_peers() {
    init_test_logging();
    let store = Arc::new(MemoryStore::new());
    let root = unique_root();
    let node_a = WiringNode::start(test_node_config("z1", "A", &root), store.clone())
        .await
        .unwrap();
    let node_b = WiringNode::start(test_node_config("z1", "B", &root), store.clone())
        .await
        .unwrap();

    node_a.register_receiver("echoService", EchoReceiver::new()).await;
    node_b
        .wait_for_sender("z1", "A", "echoService", Duration::from_secs(5))
        .await
        .unwrap();

    node_a.stop().await.unwrap();
    assert!(!node_a.is_running());
    let forgotten = wait_until(Duration::from_secs(5), || async {
        node_b.discovered_nodes().is_empty()
    })
    .await;
    assert!(forgotten);
    node_b.stop().await.unwrap();
}

fn discovery_properties(zone: &str, node: &str, root: &str) -> HashMap<String, String> {
    HashMap::from([
        ("zone".to_string(), zone.to_string()),
        ("node".to_string(), node.to_string()),
        ("rootpath".to_string(), root.to_string()),
    ])
}

fn complete_key(root: &str, node: &str, service_id: &str) -> String {
    format!("{root}/z1/{node}/{service_id}/{HTTP_PROTOCOL}/complete")
}

/// INTENTION: Moving a node's discovery to another root path withdraws its
/// endpoints from the old location, publishes them at the new one, and makes
/// them visible only to nodes watching the new root. Invalid properties change
/// nothing; an empty node name switches discovery off.
#[tokio::test]
async fn test_reconfigure_discovery_moves_root_path() {
    init_test_logging();
    let store = Arc::new(MemoryStore::new());
    let old_root = unique_root();
    let new_root = unique_root();
    let node_a = WiringNode::start(test_node_config("z1", "A", &old_root), store.clone())
        .await
        .unwrap();
    let node_b = WiringNode::start(test_node_config("z1", "B", &old_root), store.clone())
        .await
        .unwrap();
    node_a.register_receiver("echoService", EchoReceiver::new()).await;
    node_b
        .wait_for_sender("z1", "A", "echoService", Duration::from_secs(5))
        .await
        .unwrap();

    assert!(!node_a
        .reconfigure_discovery(&discovery_properties("z1", "A", &old_root))
        .await
        .unwrap());
    assert!(node_a
        .reconfigure_discovery(&discovery_properties("z1", "other", &new_root))
        .await
        .is_err());
    let mut bad_url = discovery_properties("z1", "A", &new_root);
    bad_url.insert("connecturl".to_string(), "not a url".to_string());
    assert!(node_a.reconfigure_discovery(&bad_url).await.is_err());
    assert_eq!(node_a.discovery().unwrap().config().root_path, old_root);

    assert!(node_a
        .reconfigure_discovery(&discovery_properties("z1", "A", &new_root))
        .await
        .unwrap());
    assert_eq!(node_a.discovery().unwrap().config().root_path, new_root);
    let new_key = complete_key(&new_root, "A", "echoService");
    let moved = wait_until(Duration::from_secs(5), || async {
        store.value(&new_key).as_deref() == Some("true")
    })
    .await;
    assert!(moved);
    assert!(store.value(&complete_key(&old_root, "A", "echoService")).is_none());

    // B still watches the old root
    let forgotten = wait_until(Duration::from_secs(5), || async {
        node_b.sender("z1", "A", "echoService").await.is_none()
    })
    .await;
    assert!(forgotten);

    assert!(node_b
        .reconfigure_discovery(&discovery_properties("z1", "B", &new_root))
        .await
        .unwrap());
    let sender = node_b
        .wait_for_sender("z1", "A", "echoService", Duration::from_secs(5))
        .await
        .expect("B finds A under the new root");
    let reply = sender
        .send_message(Message::new("client", "moved"))
        .await
        .unwrap();
    assert_eq!(reply.as_deref(), Some("echo: moved"));

    assert!(node_a
        .reconfigure_discovery(&discovery_properties("z1", "", &new_root))
        .await
        .unwrap());
    assert!(node_a.discovery().is_none());
    assert!(node_a.discovered_nodes().is_empty());
    assert!(store.value(&new_key).is_none());

    node_b.stop().await.unwrap();
    node_a.stop().await.unwrap();
}
