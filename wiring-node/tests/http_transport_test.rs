use parking_lot::Mutex;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use wiring_common::{Component, Logger};
use wiring_node::config::HttpAdminConfig;
use wiring_node::transport::client::ProblemCallback;
use wiring_node::transport::{EndpointHealth, EndpointProblem, HttpServer};
use wiring_node::{
    ClientEndpointPool, Message, ServerEndpointRegistry, TransportError, WiringSender,
};
use wiring_test_utils::{http_descriptor, init_test_logging, EchoReceiver, FailingReceiver};

fn logger() -> Arc<Logger> {
    Arc::new(Logger::new_root(Component::Node, "z1/a"))
}

/// Server for z1/a with `echoService` and `failing` exported under /wiring/
async fn serve() -> (HttpServer, SocketAddr) {
    let registry = Arc::new(ServerEndpointRegistry::new("z1", "a", logger()));
    let base = "http://127.0.0.1:0/wiring/";
    registry.add_endpoint(
        &http_descriptor("z1", "a", "echoService", base),
        EchoReceiver::new(),
    );
    registry.add_endpoint(
        &http_descriptor("z1", "a", "failing", base),
        Arc::new(FailingReceiver {
            reason: "boom".into(),
        }),
    );
    let config = HttpAdminConfig::new("z1", "a")
        .with_host("127.0.0.1")
        .with_port(0)
        .with_path("/wiring/");
    let server = HttpServer::new(config, registry, logger());
    let addr = server.start().await.unwrap();
    (server, addr)
}

fn envelope(from_node: &str, service: &str) -> serde_json::Value {
    json!({
        "localZone": "z1",
        "localNode": from_node,
        "localPath": "client",
        "remoteZone": "z1",
        "remoteNode": "a",
        "remotePath": service,
        "message": "hello",
        "properties": {}
    })
}

/// INTENTION: Check every status the server can answer with, from a plain
/// HTTP client's point of view.
#[tokio::test]
async fn test_server_status_codes() {
    init_test_logging();
    let (server, addr) = serve().await;
    let client = reqwest::Client::new();
    let url = |p: &str| format!("http://{addr}/wiring/{p}");

    let ok = client
        .post(url("echoService"))
        .json(&envelope("b", "echoService"))
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status(), 200);
    let body: serde_json::Value = ok.json().await.unwrap();
    assert_eq!(body, json!({ "r": "echo: hello" }));

    let failed = client
        .post(url("failing"))
        .json(&envelope("b", "failing"))
        .send()
        .await
        .unwrap();
    assert_eq!(failed.status(), 200);
    let body: serde_json::Value = failed.json().await.unwrap();
    assert_eq!(body["e"]["type"], "ReceiverError");
    assert_eq!(body["e"]["msg"], "boom");

    let unknown = client
        .post(url("nobody"))
        .json(&envelope("b", "nobody"))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), 404);

    let nested = client
        .post(url("echoService/extra"))
        .json(&envelope("b", "echoService"))
        .send()
        .await
        .unwrap();
    assert_eq!(nested.status(), 400);

    let garbage = client
        .post(url("echoService"))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(garbage.status(), 400);

    let from_self = client
        .post(url("echoService"))
        .json(&envelope("a", "echoService"))
        .send()
        .await
        .unwrap();
    assert_eq!(from_self.status(), 400);

    let listed: Vec<String> = client
        .get(format!("http://{addr}/wiring/"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed, vec!["echoService".to_string(), "failing".to_string()]);

    server.stop().await.unwrap();
}

fn recording_pool(problems: Arc<Mutex<Vec<EndpointProblem>>>) -> Arc<ClientEndpointPool> {
    let on_problem: ProblemCallback = Arc::new(move |p| problems.lock().push(p));
    Arc::new(
        ClientEndpointPool::new(
            "z1",
            "b",
            Duration::from_millis(500),
            Duration::from_secs(2),
            on_problem,
            Arc::new(Logger::new_root(Component::Node, "z1/b")),
        )
        .unwrap(),
    )
}

/// INTENTION: The client posts an envelope naming itself as the local side
/// and the target as the remote side.
#[tokio::test]
async fn test_client_envelope_names_both_sides() {
    init_test_logging();
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/w/echoService"))
        .and(body_partial_json(json!({
            "localZone": "z1",
            "localNode": "b",
            "localPath": "client",
            "remoteNode": "a",
            "remotePath": "echoService",
            "message": "hi",
            "properties": { "k": "v" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "r": "ok" })))
        .expect(1)
        .mount(&mock)
        .await;

    let pool = recording_pool(Arc::new(Mutex::new(Vec::new())));
    let sender = pool.add_endpoint(&http_descriptor(
        "z1",
        "a",
        "echoService",
        &format!("{}/w/", mock.uri()),
    ));
    let reply = sender
        .send_message(Message::new("client", "hi").with_property("k", "v"))
        .await
        .unwrap();
    assert_eq!(reply.as_deref(), Some("ok"));
}

/// INTENTION: A remote receiver error comes back as an error for the caller
/// but does not count against the endpoint.
#[tokio::test]
async fn test_remote_error_is_not_a_transport_failure() {
    init_test_logging();
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "e": { "type": "ReceiverError", "msg": "boom", "stacktrace": "" }
        })))
        .mount(&mock)
        .await;

    let problems = Arc::new(Mutex::new(Vec::new()));
    let pool = recording_pool(problems.clone());
    let d = http_descriptor("z1", "a", "echoService", &format!("{}/w/", mock.uri()));
    let sender = pool.add_endpoint(&d);

    let result = sender.send_message(Message::new("client", "hi")).await;
    match result {
        Err(TransportError::Remote { kind, msg, .. }) => {
            assert_eq!(kind, "ReceiverError");
            assert_eq!(msg, "boom");
        }
        other => panic!("expected a remote error, got {other:?}"),
    }
    assert_eq!(pool.get_endpoint(d.id()).unwrap().consecutive_failures(), 0);
    assert!(problems.lock().is_empty());
}

/// INTENTION: Six failures in a row report exactly one error; a success
/// resets the count so the next five failures only warn.
#[tokio::test]
async fn test_escalation_resets_after_success() {
    init_test_logging();
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(6)
        .mount(&mock)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "r": null })))
        .up_to_n_times(1)
        .mount(&mock)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock)
        .await;

    let problems = Arc::new(Mutex::new(Vec::new()));
    let pool = recording_pool(problems.clone());
    let d = http_descriptor("z1", "a", "echoService", &format!("{}/w/", mock.uri()));
    let sender = pool.add_endpoint(&d);

    for _ in 0..6 {
        let result = sender.send_message(Message::new("client", "hi")).await;
        assert_eq!(result, Err(TransportError::Http(500)));
    }
    let reply = sender.send_message(Message::new("client", "hi")).await;
    assert_eq!(reply, Ok(None));
    assert_eq!(pool.get_endpoint(d.id()).unwrap().consecutive_failures(), 0);

    for _ in 0..5 {
        let result = sender.send_message(Message::new("client", "hi")).await;
        assert_eq!(result, Err(TransportError::Http(503)));
    }

    let seen = problems.lock().clone();
    let errors = seen
        .iter()
        .filter(|p| p.health == EndpointHealth::Error)
        .count();
    let warnings = seen
        .iter()
        .filter(|p| p.health == EndpointHealth::Warning)
        .count();
    assert_eq!(errors, 1);
    assert_eq!(warnings, 10);
    assert!(seen.iter().all(|p| p.descriptor == d));
}
