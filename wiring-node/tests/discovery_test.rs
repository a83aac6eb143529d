use std::sync::Arc;
use std::time::Duration;
use wiring_common::{Component, Logger};
use wiring_node::config::DiscoveryConfig;
use wiring_node::discovery::DirectoryStore;
use wiring_node::{DirectoryDiscovery, MemoryStore, NodeDescriptor, NodeDiscovery, NodeEvent};
use wiring_test_utils::{http_descriptor, init_test_logging, wait_until, RecordingListener};

const ROOT: &str = "/wiring";

fn discovery_for(node: &str, store: Arc<MemoryStore>) -> Arc<DirectoryDiscovery> {
    let logger = Arc::new(Logger::new_root(Component::Node, &format!("z1/{node}")));
    let config = DiscoveryConfig::new("z1", node)
        .with_root_path(ROOT)
        .with_ttl(Duration::from_secs(2))
        .with_rescan_backoff(Duration::from_millis(20), Duration::from_millis(200));
    DirectoryDiscovery::new(config, store, logger)
}

/// Write an endpoint the way a publishing node does, marker last
async fn write_endpoint(store: &MemoryStore, node: &str, service: &str) {
    let base = format!("{ROOT}/z1/{node}/{service}/{}", wiring_node::HTTP_PROTOCOL);
    store
        .put(&format!("{base}/url"), &format!("http://{node}:8080/w/{service}"), None)
        .await
        .unwrap();
    store.put(&format!("{base}/metadata"), "{}", None).await.unwrap();
    store.put(&format!("{base}/complete"), "true", None).await.unwrap();
}

fn endpoint(node: &str, service: &str) -> NodeDescriptor {
    http_descriptor("z1", node, service, &format!("http://{node}:8080/w/"))
}

/// INTENTION: A peer's published endpoints show up on the other node through
/// the watch, and withdrawing them removes them again.
#[tokio::test]
async fn test_published_endpoint_is_discovered_by_peer() {
    init_test_logging();
    let store = Arc::new(MemoryStore::new());
    let publisher = discovery_for("a", store.clone());
    let observer = discovery_for("b", store.clone());
    let recorder = RecordingListener::<NodeDescriptor>::new();
    observer.subscribe(recorder.clone()).unwrap();

    publisher.start().await.unwrap();
    observer.start().await.unwrap();

    let d = endpoint("a", "echoService");
    publisher.add_published_node(d.clone()).await;
    assert!(recorder.wait_for(1, Duration::from_secs(5)).await);
    assert_eq!(recorder.events(), vec![NodeEvent::Added(d.clone())]);

    publisher.remove_published_node(&d).await;
    assert!(recorder.wait_for(2, Duration::from_secs(5)).await);
    assert_eq!(recorder.events()[1], NodeEvent::Removed(d));

    // the publisher never reports its own endpoint
    assert!(publisher.discovered_nodes().is_empty());

    observer.stop().await.unwrap();
    publisher.stop().await.unwrap();
}

/// INTENTION: Entries that exist before start are found by the initial scan;
/// entries without the complete marker stay invisible until it is written.
#[tokio::test]
async fn test_initial_scan_and_partial_writes() {
    init_test_logging();
    let store = Arc::new(MemoryStore::new());
    write_endpoint(&store, "a", "first").await;
    let partial = format!("{ROOT}/z1/a/second/{}", wiring_node::HTTP_PROTOCOL);
    store
        .put(&format!("{partial}/url"), "http://a:8080/w/second", None)
        .await
        .unwrap();

    let observer = discovery_for("b", store.clone());
    observer.start().await.unwrap();
    assert_eq!(observer.discovered_nodes(), vec![endpoint("a", "first")]);

    store.put(&format!("{partial}/metadata"), "{}", None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(observer.discovered_nodes().len(), 1);

    store.put(&format!("{partial}/complete"), "true", None).await.unwrap();
    let both = wait_until(Duration::from_secs(5), || async {
        observer.discovered_nodes().len() == 2
    })
    .await;
    assert!(both);
    observer.stop().await.unwrap();
}

/// INTENTION: A complete marker at the wrong depth is ignored and the watch
/// keeps delivering later changes.
#[tokio::test]
async fn test_watch_survives_malformed_event() {
    init_test_logging();
    let store = Arc::new(MemoryStore::new());
    let observer = discovery_for("b", store.clone());
    observer.start().await.unwrap();

    store.put(&format!("{ROOT}/z1/a/complete"), "true", None).await.unwrap();
    store.put(&format!("{ROOT}/z1/complete"), "true", None).await.unwrap();
    // marker at the right depth, but no url to build a descriptor from
    store
        .put(&format!("{ROOT}/z1/a/broken/{}/complete", wiring_node::HTTP_PROTOCOL), "true", None)
        .await
        .unwrap();
    write_endpoint(&store, "a", "echoService").await;

    assert!(wait_until(Duration::from_secs(5), || async {
        observer.discovered_nodes() == vec![endpoint("a", "echoService")]
    })
    .await);
    observer.stop().await.unwrap();
}

/// INTENTION: When the watch index is compacted away the discovery rescans,
/// picks up what it missed and announces nothing twice.
#[tokio::test]
async fn test_index_cleared_triggers_converging_rescan() {
    init_test_logging();
    let store = Arc::new(MemoryStore::new());
    write_endpoint(&store, "a", "kept").await;
    write_endpoint(&store, "c", "dropped").await;

    let observer = discovery_for("b", store.clone());
    let recorder = RecordingListener::<NodeDescriptor>::new();
    observer.subscribe(recorder.clone()).unwrap();
    observer.start().await.unwrap();
    assert!(recorder.wait_for(2, Duration::from_secs(5)).await);
    // let the watch settle on the next index
    tokio::time::sleep(Duration::from_millis(50)).await;

    // No await point yields between these writes and the compaction, so the
    // pending watch only ever sees a cleared index.
    store
        .delete_dir(&format!("{ROOT}/z1/c"), true)
        .await
        .unwrap();
    write_endpoint(&store, "d", "added").await;
    store.compact();

    assert!(wait_until(Duration::from_secs(5), || async {
        let mut nodes: Vec<String> = observer
            .discovered_nodes()
            .iter()
            .map(|d| d.node().to_string())
            .collect();
        nodes.sort();
        nodes == vec!["a".to_string(), "d".to_string()]
    })
    .await);
    observer.flush().await;

    let events = recorder.events();
    let added_a = events
        .iter()
        .filter(|e| matches!(e, NodeEvent::Added(d) if d.node() == "a"))
        .count();
    assert_eq!(added_a, 1, "kept endpoint announced twice: {:?}", recorder.kinds());
    assert!(events.contains(&NodeEvent::Removed(endpoint("c", "dropped"))));
    assert!(events.contains(&NodeEvent::Added(endpoint("d", "added"))));
    observer.stop().await.unwrap();
}

/// INTENTION: An unavailable store stops the watch; once it is back the
/// rescan catches up with changes made in between.
#[tokio::test]
async fn test_recovers_after_store_outage() {
    init_test_logging();
    let store = Arc::new(MemoryStore::new());
    let observer = discovery_for("b", store.clone());
    observer.start().await.unwrap();

    store.set_available(false);
    tokio::time::sleep(Duration::from_millis(100)).await;
    store.set_available(true);
    write_endpoint(&store, "a", "late").await;

    assert!(wait_until(Duration::from_secs(5), || async {
        observer.discovered_nodes() == vec![endpoint("a", "late")]
    })
    .await);
    observer.stop().await.unwrap();
}

/// INTENTION: Endpoints that are not refreshed expire from the directory and
/// disappear from every observer.
#[tokio::test]
async fn test_expired_endpoint_is_removed() {
    init_test_logging();
    let store = Arc::new(MemoryStore::new());
    let base = format!("{ROOT}/z1/a/echoService/{}", wiring_node::HTTP_PROTOCOL);
    let ttl = Some(Duration::from_millis(300));
    store.put_dir(&base, ttl, None).await.unwrap();
    store.put(&format!("{base}/url"), "http://a:8080/w/echoService", ttl).await.unwrap();
    store.put(&format!("{base}/complete"), "true", ttl).await.unwrap();

    let observer = discovery_for("b", store.clone());
    observer.start().await.unwrap();
    assert_eq!(observer.discovered_nodes().len(), 1);

    let forgotten = wait_until(Duration::from_secs(5), || async {
        observer.discovered_nodes().is_empty()
    })
    .await;
    assert!(forgotten);
    observer.stop().await.unwrap();
}

/// INTENTION: Stop withdraws everything the node published, including the
/// presence key of a node without endpoints.
#[tokio::test]
async fn test_stop_withdraws_published_entries() {
    init_test_logging();
    let store = Arc::new(MemoryStore::new());
    let publisher = discovery_for("a", store.clone());
    publisher.start().await.unwrap();
    let presence = format!("{ROOT}/z1/a/metadata");
    assert!(store.value(&presence).is_some());

    publisher.add_published_node(endpoint("a", "echoService")).await;
    let complete = format!("{ROOT}/z1/a/echoService/{}/complete", wiring_node::HTTP_PROTOCOL);
    assert_eq!(store.value(&complete).as_deref(), Some("true"));

    publisher.stop().await.unwrap();
    assert!(store.value(&complete).is_none());
    assert!(store.value(&presence).is_none());
}
