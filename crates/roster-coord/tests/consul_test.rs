//! Consul backend tests against a mocked agent

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use roster_coord::{
    Children, ConsulConnector, Connector, CoordError, CoordinationBackend, CreateMode,
    SessionState, WatchCallback, WatchEventKind,
};
use serde_json::json;
use tokio::sync::oneshot;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SESSION_ID: &str = "adf4238a-882b-9ddc-4a9d-5b6758e4159e";

async fn mock_session(server: &MockServer) {
    Mock::given(method("PUT"))
        .and(path("/v1/session/create"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ID": SESSION_ID })))
        .mount(server)
        .await;
}

async fn connect(server: &MockServer) -> Arc<dyn CoordinationBackend> {
    mock_session(server).await;
    ConsulConnector::new(&server.uri(), Duration::from_secs(1))
        .unwrap()
        .connect(Duration::from_secs(15))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_connect_creates_deleting_session() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/session/create"))
        .and(body_partial_json(json!({
            "TTL": "15s",
            "Behavior": "delete",
            "LockDelay": "0s"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ID": SESSION_ID })))
        .expect(1)
        .mount(&server)
        .await;

    let session = ConsulConnector::new(&server.uri(), Duration::from_secs(1))
        .unwrap()
        .connect(Duration::from_secs(15))
        .await
        .unwrap();

    assert_eq!(session.session_id(), SESSION_ID);
    assert_eq!(*session.session_state().borrow(), SessionState::Connected);
}

#[tokio::test]
async fn test_session_ttl_is_clamped() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/session/create"))
        .and(body_partial_json(json!({ "TTL": "10s" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ID": SESSION_ID })))
        .expect(1)
        .mount(&server)
        .await;

    ConsulConnector::new(&server.uri(), Duration::from_secs(1))
        .unwrap()
        .connect(Duration::from_millis(500))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_connect_server_error_is_connection_error() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/session/create"))
        .respond_with(ResponseTemplate::new(500).set_body_string("No cluster leader"))
        .mount(&server)
        .await;

    let result = ConsulConnector::new(&server.uri(), Duration::from_secs(1))
        .unwrap()
        .connect(Duration::from_secs(15))
        .await;

    assert!(matches!(result, Err(CoordError::Connection(_))));
}

#[tokio::test]
async fn test_connect_refused_is_connection_error() {
    let result = ConsulConnector::new("127.0.0.1:1", Duration::from_millis(500))
        .unwrap()
        .connect(Duration::from_secs(15))
        .await;

    assert!(matches!(result, Err(CoordError::Connection(_))));
}

#[tokio::test]
async fn test_create_ephemeral_locks_key_with_session() {
    let server = MockServer::start().await;
    let session = connect(&server).await;
    Mock::given(method("PUT"))
        .and(path("/v1/txn"))
        .and(body_partial_json(json!([
            { "KV": { "Verb": "check-not-exists", "Key": "brokers/ids/1" } },
            { "KV": { "Verb": "lock", "Key": "brokers/ids/1", "Session": SESSION_ID } }
        ])))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "Results": [], "Errors": null })))
        .expect(1)
        .mount(&server)
        .await;

    session
        .create("/brokers/ids/1", Bytes::from_static(b"{}"), CreateMode::Ephemeral)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_create_conflict_reports_owner() {
    let server = MockServer::start().await;
    let session = connect(&server).await;
    Mock::given(method("PUT"))
        .and(path("/v1/txn"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "Results": null,
            "Errors": [{ "OpIndex": 0, "What": "key \"brokers/ids/1\" exists" }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/kv/brokers/ids/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "Key": "brokers/ids/1",
            "Value": "e30=",
            "Session": "other-session",
            "Flags": 0
        }])))
        .mount(&server)
        .await;

    let err = session
        .create("/brokers/ids/1", Bytes::new(), CreateMode::Ephemeral)
        .await
        .unwrap_err();

    assert_eq!(
        err,
        CoordError::NodeExists {
            path: "/brokers/ids/1".to_string(),
            owner: Some("other-session".to_string()),
        }
    );
}

#[tokio::test]
async fn test_get_data_decodes_value() {
    let server = MockServer::start().await;
    let session = connect(&server).await;
    Mock::given(method("GET"))
        .and(path("/v1/kv/brokers/ids/2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "Key": "brokers/ids/2",
            "Value": "eyJpZCI6Mn0=",
            "Session": SESSION_ID
        }])))
        .mount(&server)
        .await;

    let data = session.get_data("/brokers/ids/2").await.unwrap();

    assert_eq!(data.payload, Bytes::from_static(br#"{"id":2}"#));
    assert_eq!(data.owner.as_deref(), Some(SESSION_ID));
}

#[tokio::test]
async fn test_get_data_missing_key_is_no_node() {
    let server = MockServer::start().await;
    let session = connect(&server).await;
    Mock::given(method("GET"))
        .and(path("/v1/kv/brokers/ids/9"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let result = session.get_data("/brokers/ids/9").await;

    assert_eq!(result, Err(CoordError::NoNode("/brokers/ids/9".to_string())));
}

#[tokio::test]
async fn test_get_children_lists_direct_children() {
    let server = MockServer::start().await;
    let session = connect(&server).await;
    Mock::given(method("GET"))
        .and(path("/v1/kv/brokers/ids/"))
        .and(query_param("separator", "/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Consul-Index", "42")
                .set_body_json(json!(["brokers/ids/1", "brokers/ids/2", "brokers/ids/sub/"])),
        )
        .mount(&server)
        .await;

    let children = session.get_children("/brokers/ids").await.unwrap();

    let expected: BTreeSet<String> = ["1", "2", "sub"].iter().map(|s| s.to_string()).collect();
    assert_eq!(children.names, expected);
    assert_eq!(children.version, 42);
}

#[tokio::test]
async fn test_get_children_of_missing_prefix_is_empty() {
    let server = MockServer::start().await;
    let session = connect(&server).await;
    Mock::given(method("GET"))
        .and(path("/v1/kv/brokers/ids/"))
        .respond_with(ResponseTemplate::new(404).insert_header("X-Consul-Index", "7"))
        .mount(&server)
        .await;

    let children = session.get_children("/brokers/ids").await.unwrap();

    assert!(children.names.is_empty());
    assert_eq!(children.version, 7);
}

#[tokio::test]
async fn test_watch_fires_when_child_set_differs() {
    let server = MockServer::start().await;
    let session = connect(&server).await;
    Mock::given(method("GET"))
        .and(path("/v1/kv/brokers/ids/"))
        .and(query_param("index", "5"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Consul-Index", "6")
                .set_body_json(json!(["brokers/ids/1"])),
        )
        .mount(&server)
        .await;

    let (tx, rx) = oneshot::channel();
    let callback: WatchCallback = Box::new(move |event| {
        async move {
            let _ = tx.send(event);
        }
        .boxed()
    });
    let observed = Children {
        names: BTreeSet::new(),
        version: 5,
    };
    session
        .watch_children("/brokers/ids", &observed, callback)
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, WatchEventKind::ChildrenChanged);
    assert_eq!(event.path, "/brokers/ids");
}

#[tokio::test]
async fn test_close_destroys_session() {
    let server = MockServer::start().await;
    let session = connect(&server).await;
    Mock::given(method("PUT"))
        .and(path(format!("/v1/session/destroy/{}", SESSION_ID)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(true)))
        .expect(1)
        .mount(&server)
        .await;

    session.close().await.unwrap();
    // second close is a no-op
    session.close().await.unwrap();

    assert_eq!(*session.session_state().borrow(), SessionState::Closed);
    let result = session
        .create("/brokers/ids/1", Bytes::new(), CreateMode::Ephemeral)
        .await;
    assert_eq!(result, Err(CoordError::SessionClosed));
}
