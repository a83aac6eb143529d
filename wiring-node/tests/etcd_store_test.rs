use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use url::Url;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};
use wiring_common::{Component, Logger};
use wiring_node::discovery::store::StoreAction;
use wiring_node::{DirectoryStore, EtcdStore, StoreError};
use wiring_test_utils::init_test_logging;

fn store_for(server: &MockServer) -> EtcdStore {
    let url = Url::parse(&server.uri()).unwrap();
    let logger = Arc::new(Logger::new_root(Component::Node, "z1/a"));
    EtcdStore::new(&url, Duration::from_secs(2), logger).unwrap()
}

fn etcd_error(code: u32, cause: &str, index: u64) -> serde_json::Value {
    json!({ "errorCode": code, "message": "etcd says no", "cause": cause, "index": index })
}

/// INTENTION: A recursive get returns the tree and the store index taken from
/// the response header.
#[tokio::test]
async fn test_get_reads_tree_and_index_header() {
    init_test_logging();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/keys/wiring/z1"))
        .and(query_param("recursive", "true"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Etcd-Index", "12")
                .set_body_json(json!({
                    "action": "get",
                    "node": {
                        "key": "/wiring/z1",
                        "dir": true,
                        "modifiedIndex": 3,
                        "createdIndex": 3,
                        "nodes": [{
                            "key": "/wiring/z1/a",
                            "dir": true,
                            "modifiedIndex": 7,
                            "createdIndex": 4
                        }]
                    }
                })),
        )
        .mount(&server)
        .await;

    let response = store_for(&server).get("/wiring/z1", true).await.unwrap();
    assert_eq!(response.action, StoreAction::Get);
    assert_eq!(response.index, Some(12));
    assert!(response.node.dir);
    assert_eq!(response.node.child("a").map(|n| n.modified_index), Some(7));
    assert_eq!(response.node.max_modified_index(), 7);
}

/// INTENTION: Writes go out as form parameters with the TTL in whole seconds.
#[tokio::test]
async fn test_put_sends_form_with_ttl() {
    init_test_logging();
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v2/keys/wiring/z1/a/echoService/http/url"))
        .and(header("content-type", "application/x-www-form-urlencoded"))
        .and(body_string_contains("value=http%3A%2F%2Fa%3A8080%2Fw%2FechoService"))
        .and(body_string_contains("ttl=60"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "action": "set",
            "node": {
                "key": "/wiring/z1/a/echoService/http/url",
                "value": "http://a:8080/w/echoService",
                "modifiedIndex": 20,
                "createdIndex": 20,
                "ttl": 60
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let response = store_for(&server)
        .put(
            "wiring/z1/a/echoService/http/url/",
            "http://a:8080/w/echoService",
            Some(Duration::from_secs(60)),
        )
        .await
        .unwrap();
    assert_eq!(response.action, StoreAction::Set);
    assert_eq!(response.node.value.as_deref(), Some("http://a:8080/w/echoService"));
    assert_eq!(response.node.ttl, Some(60));
}

/// INTENTION: etcd error codes become the matching store errors.
#[tokio::test]
async fn test_error_codes_are_mapped() {
    init_test_logging();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/keys/wiring/missing"))
        .respond_with(
            ResponseTemplate::new(404).set_body_json(etcd_error(100, "/wiring/missing", 9)),
        )
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v2/keys/wiring/z1"))
        .and(body_string_contains("prevExist=false"))
        .and(body_string_contains("dir=true"))
        .respond_with(ResponseTemplate::new(412).set_body_json(etcd_error(105, "/wiring/z1", 9)))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/v2/keys/wiring/z1"))
        .and(query_param("dir", "true"))
        .respond_with(ResponseTemplate::new(403).set_body_json(etcd_error(108, "/wiring/z1", 9)))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/v2/keys/wiring/flaky"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream gone"))
        .mount(&server)
        .await;

    let store = store_for(&server);
    assert_eq!(
        store.get("/wiring/missing", false).await,
        Err(StoreError::NotFound("/wiring/missing".into()))
    );
    assert_eq!(
        store.put_dir("/wiring/z1", None, Some(false)).await,
        Err(StoreError::AlreadyExists("/wiring/z1".into()))
    );
    assert!(matches!(
        store.delete_dir("/wiring/z1", false).await,
        Err(StoreError::Protocol(_))
    ));
    assert!(matches!(
        store.delete("/wiring/flaky").await,
        Err(StoreError::Unavailable(_))
    ));
}

/// INTENTION: Watches long-poll with waitIndex, and a cleared index reports
/// both the requested and the oldest retained index.
#[tokio::test]
async fn test_watch_uses_wait_index() {
    init_test_logging();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/keys/wiring"))
        .and(query_param("wait", "true"))
        .and(query_param("recursive", "true"))
        .and(query_param("waitIndex", "13"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Etcd-Index", "13")
                .set_body_json(json!({
                    "action": "delete",
                    "node": {
                        "key": "/wiring/z1/a/echoService/http", "dir": true,
                        "modifiedIndex": 13, "createdIndex": 5
                    },
                    "prevNode": {
                        "key": "/wiring/z1/a/echoService/http", "dir": true,
                        "modifiedIndex": 5, "createdIndex": 5
                    }
                })),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/keys/wiring"))
        .and(query_param("waitIndex", "2"))
        .respond_with(ResponseTemplate::new(400).set_body_json(etcd_error(
            401,
            "the requested history has been cleared",
            1009,
        )))
        .mount(&server)
        .await;

    let store = store_for(&server);
    let change = store.watch("/wiring", 13, true).await.unwrap();
    assert!(change.action.is_removal());
    assert_eq!(change.node.modified_index, 13);
    assert_eq!(change.prev_node.map(|n| n.created_index), Some(5));

    assert_eq!(
        store.watch("/wiring", 2, true).await,
        Err(StoreError::IndexCleared {
            requested: 2,
            oldest: 1009
        })
    );
}

/// INTENTION: An unreachable etcd is reported as unavailable, not as a
/// protocol problem.
#[tokio::test]
async fn test_unreachable_store_is_unavailable() {
    init_test_logging();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let url = Url::parse(&format!("http://127.0.0.1:{port}")).unwrap();
    let logger = Arc::new(Logger::new_root(Component::Node, "z1/a"));
    let store = EtcdStore::new(&url, Duration::from_millis(500), logger).unwrap();
    assert!(matches!(
        store.get("/wiring", true).await,
        Err(StoreError::Unavailable(_))
    ));
}
