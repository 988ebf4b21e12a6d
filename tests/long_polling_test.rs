//! Negotiation and long polling against a wiremock hub.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use hubrpc::{ConnectionState, HubConnection, HubError, TransportKind};
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn negotiate_body(transport: &str) -> serde_json::Value {
    json!({
        "connectionId": "conn-1",
        "connectionToken": "tok",
        "negotiateVersion": 1,
        "availableTransports": [
            {"transport": transport, "transferFormats": ["Text"]}
        ]
    })
}

async fn mount_negotiate(server: &MockServer, body: serde_json::Value) {
    Mock::given(method("POST"))
        .and(path("/hub/negotiate"))
        .and(query_param("negotiateVersion", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

/// Queue one poll response; earlier-mounted responses are served first.
async fn mount_poll(
    server: &MockServer,
    priority: u8,
    response: ResponseTemplate,
    times: Option<u64>,
) {
    let mock = Mock::given(method("GET"))
        .and(path("/hub"))
        .and(query_param("id", "tok"))
        .respond_with(response)
        .with_priority(priority);
    let mock = match times {
        Some(times) => mock.up_to_n_times(times),
        None => mock,
    };
    mock.mount(server).await;
}

async fn mount_send_and_delete(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/hub"))
        .and(query_param("id", "tok"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/hub"))
        .and(query_param("id", "tok"))
        .respond_with(ResponseTemplate::new(202))
        .mount(server)
        .await;
}

fn long_polling_connection(server: &MockServer) -> HubConnection {
    HubConnection::builder()
        .with_url(format!("{}/hub", server.uri()))
        .with_transports([TransportKind::LongPolling])
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_invoke_over_long_polling() {
    let server = MockServer::start().await;
    mount_negotiate(&server, negotiate_body("LongPolling")).await;
    mount_send_and_delete(&server).await;
    // Initial connect poll, handshake response, the completion, then idle polls.
    mount_poll(&server, 1, ResponseTemplate::new(200), Some(1)).await;
    mount_poll(&server, 2, ResponseTemplate::new(200).set_body_string("{}\u{1e}"), Some(1)).await;
    mount_poll(
        &server,
        3,
        ResponseTemplate::new(200)
            .set_body_string("{\"type\":3,\"invocationId\":\"0\",\"result\":\"hi\"}\u{1e}")
            .set_delay(Duration::from_millis(300)),
        Some(1),
    )
    .await;
    mount_poll(
        &server,
        4,
        ResponseTemplate::new(200).set_delay(Duration::from_millis(200)),
        None,
    )
    .await;

    let connection = long_polling_connection(&server);
    connection.start().await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Connected);
    assert_eq!(connection.connection_id().as_deref(), Some("conn-1"));

    let result: String = connection.invoke("Invoke", ("hi",)).await.unwrap();
    assert_eq!(result, "hi");

    connection.stop().await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Stopped);

    let requests = server.received_requests().await.unwrap();
    let posts: Vec<String> = requests
        .iter()
        .filter(|request| request.method.to_string() == "POST" && request.url.path() == "/hub")
        .map(|request| String::from_utf8_lossy(&request.body).to_string())
        .collect();
    assert_eq!(posts[0], "{\"protocol\":\"json\",\"version\":0}\u{1e}");
    assert!(posts[1].contains("\"target\":\"Invoke\""));
    assert!(requests
        .iter()
        .any(|request| request.method.to_string() == "DELETE"));
}

#[tokio::test]
async fn test_poll_204_closes_connection_cleanly() {
    let server = MockServer::start().await;
    mount_negotiate(&server, negotiate_body("LongPolling")).await;
    mount_send_and_delete(&server).await;
    mount_poll(&server, 1, ResponseTemplate::new(200), Some(1)).await;
    mount_poll(&server, 2, ResponseTemplate::new(200).set_body_string("{}\u{1e}"), Some(1)).await;
    mount_poll(
        &server,
        3,
        ResponseTemplate::new(204).set_delay(Duration::from_millis(100)),
        None,
    )
    .await;

    let connection = long_polling_connection(&server);
    let closes = Arc::new(Mutex::new(Vec::new()));
    {
        let closes = Arc::clone(&closes);
        connection.on_closed(move |error| closes.lock().unwrap().push(error));
    }
    connection.start().await.unwrap();

    let mut states = connection.subscribe_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        states.wait_for(|state| *state == ConnectionState::Stopped),
    )
    .await
    .unwrap()
    .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while closes.lock().unwrap().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "closed handler never ran");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(closes.lock().unwrap().clone(), vec![None]);
}

#[tokio::test]
async fn test_no_common_transport_fails_start() {
    let server = MockServer::start().await;
    mount_negotiate(&server, negotiate_body("ServerSentEvents")).await;

    let connection = long_polling_connection(&server);
    let err = connection.start().await.unwrap_err();
    assert_eq!(
        err,
        HubError::Transport(
            "None of the transports supported by the client are supported by the server."
                .to_string()
        )
    );
    assert_eq!(connection.state(), ConnectionState::Stopped);
}

#[tokio::test]
async fn test_negotiate_redirect_uses_new_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hub/negotiate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "url": format!("{}/other", server.uri()),
            "accessToken": "redirected"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/other/negotiate"))
        .and(header("Authorization", "Bearer redirected"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error": "Hub is full"
        })))
        .mount(&server)
        .await;

    let connection = long_polling_connection(&server);
    let err = connection.start().await.unwrap_err();
    assert_eq!(err, HubError::Transport("Hub is full".to_string()));
}

#[tokio::test]
async fn test_failed_negotiate_status_fails_start() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hub/negotiate"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let connection = long_polling_connection(&server);
    let err = connection.start().await.unwrap_err();
    assert!(matches!(err, HubError::Transport(_)));
}
