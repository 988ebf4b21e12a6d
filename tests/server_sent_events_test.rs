//! Server-sent events receive path against a wiremock hub.

use std::time::Duration;

use hubrpc::{ConnectionState, HubConnection, HubError, TransportKind};
use serde_json::json;
use tokio::sync::mpsc;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_negotiate(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/hub/negotiate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "connectionId": "sse-1",
            "connectionToken": "tok",
            "negotiateVersion": 1,
            "availableTransports": [
                {"transport": "ServerSentEvents", "transferFormats": ["Text"]}
            ]
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hub"))
        .and(query_param("id", "tok"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

fn sse_connection(server: &MockServer) -> HubConnection {
    HubConnection::builder()
        .with_url(format!("{}/hub", server.uri()))
        .with_transports([TransportKind::ServerSentEvents])
        .with_access_token("sse-token")
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_event_stream_delivers_server_invocation() {
    let server = MockServer::start().await;
    mount_negotiate(&server).await;
    let events = concat!(
        ": stream opened\n\n",
        "data: {}\u{1e}\n\n",
        "data: {\"type\":1,\"target\":\"Notify\",\"arguments\":[\"pushed\"]}\u{1e}\n\n",
    );
    Mock::given(method("GET"))
        .and(path("/hub"))
        .and(query_param("id", "tok"))
        .and(header("Accept", "text/event-stream"))
        .and(header("Authorization", "Bearer sse-token"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "text/event-stream")
                .set_body_string(events),
        )
        .mount(&server)
        .await;

    let connection = sse_connection(&server);
    let (tx, mut rx) = mpsc::unbounded_channel();
    connection.on("Notify", move |(text,): (String,)| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(text);
        }
    });

    // The mock body ends right after the events, so the stream may close
    // before start finishes committing; delivery happens either way.
    let _ = connection.start().await;

    let pushed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pushed, "pushed");

    let mut states = connection.subscribe_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        states.wait_for(|state| *state == ConnectionState::Stopped),
    )
    .await
    .unwrap()
    .unwrap();
}

#[tokio::test]
async fn test_event_stream_rejected_fails_start() {
    let server = MockServer::start().await;
    mount_negotiate(&server).await;
    Mock::given(method("GET"))
        .and(path("/hub"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let connection = sse_connection(&server);
    let err = connection.start().await.unwrap_err();
    assert!(
        matches!(&err, HubError::Transport(message) if message.contains("ServerSentEvents")),
        "unexpected error: {err:?}"
    );
    assert_eq!(connection.state(), ConnectionState::Stopped);
}
