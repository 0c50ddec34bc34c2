//! HttpPollClient against a mock HTTP endpoint.

use outpost::config::{Config, StorageBackend};
use outpost::queue::QueueLimits;
use outpost::transport::{HttpPollClient, PollClient};
use outpost::Outpost;
use serde_json::{json, Value};
use std::time::Duration;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> HttpPollClient {
    HttpPollClient::new(format!("{}/events", server.uri()), Duration::from_secs(5))
        .expect("client should build")
}

#[tokio::test]
async fn exchange_posts_events_and_returns_completed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/events"))
        .and(body_json(json!({"events": [[0, 0, "time", 1], [7, 40, "stat", "A"]]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "completed": [[7], [0, "_not", "cast", {"x": 1}]]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let completed = client_for(&server)
        .exchange(vec![json!([0, 0, "time", 1]), json!([7, 40, "stat", "A"])])
        .await
        .unwrap();

    assert_eq!(completed, vec![json!([7]), json!([0, "_not", "cast", {"x": 1}])]);
}

#[tokio::test]
async fn missing_completed_field_is_an_empty_batch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let completed = client_for(&server).exchange(Vec::new()).await.unwrap();
    assert!(completed.is_empty());
}

#[tokio::test]
async fn server_error_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = client_for(&server).exchange(Vec::new()).await.unwrap_err();
    assert!(err.to_string().contains("503"), "unexpected error: {err}");
}

#[tokio::test]
async fn non_json_body_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    assert!(client_for(&server).exchange(Vec::new()).await.is_err());
}

#[tokio::test]
async fn service_delivers_over_http_when_socket_is_disabled() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/events"))
        .respond_with(|request: &wiremock::Request| {
            let body: Value = request.body_json().unwrap_or_default();
            let acks: Vec<Value> = body["events"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|entry| entry[0].as_u64().filter(|id| *id != 0))
                .map(|id| json!([id]))
                .collect();
            ResponseTemplate::new(200).set_body_json(json!({ "completed": acks }))
        })
        .mount(&server)
        .await;

    let mut config = Config::default();
    config.storage.backend = StorageBackend::Memory;
    config.socket.enabled = false;
    config.endpoints.poll_url = format!("{}/events", server.uri());
    config.poller.tick_ms = 20;

    let outpost = Outpost::from_config(config).unwrap();
    let stat = outpost.create_queue("stat", QueueLimits::default()).unwrap();
    stat.enqueue(json!({"event": "boot"})).unwrap();
    outpost.start().unwrap();

    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while outpost.pending("stat") != Some(0) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(drained.is_ok(), "item was never acknowledged");
    outpost.stop().await;

    let requests = server.received_requests().await.unwrap();
    let first: Value = requests[0].body_json().unwrap();
    assert_eq!(first["events"][0][2], json!("time"));
    assert_eq!(first["events"][1][2], json!("stat"));
    assert_eq!(first["events"][1][3], json!({"event": "boot"}));
}
