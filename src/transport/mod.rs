//! Transport abstraction.
//!
//! A [`Transport`] owns one physical channel to the hub and moves opaque
//! payloads over it. The hub connection creates a fresh transport for every
//! connect attempt through a [`TransportFactory`] and never reuses one.
//!
//! # Architecture
//!
//! ```text
//! HttpConnection (negotiate, pick a transport)
//!     │
//!     ├── WebSocketTransport      persistent socket
//!     ├── ServerSentEventsTransport   server push + HTTP POST sends
//!     └── LongPollingTransport    repeated GET + HTTP POST sends
//! ```
//!
//! # Contract
//!
//! - `connect` returns only once the channel is open; anything that fails
//!   before that is reported by `connect` itself, never by the close handler.
//! - Inbound payloads reach the receive handler one at a time, in arrival order.
//! - The close handler runs exactly once, with the error that ended the
//!   connection (`None` for a clean close).
//! - `stop` is idempotent.

pub mod http;
pub mod long_polling;
pub mod negotiate;
pub mod sse;
pub mod websocket;
pub mod ws;

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use reqwest::header::CONTENT_TYPE;
use reqwest::Url;

use crate::error::HubError;
use crate::protocol::{Payload, TransferFormat};

pub use http::{HttpConnection, HttpTransportFactory};
pub use long_polling::LongPollingTransport;
pub use sse::ServerSentEventsTransport;
pub use websocket::WebSocketTransport;

/// Callback receiving every inbound payload.
pub type ReceiveHandler = Arc<dyn Fn(Payload) -> BoxFuture<'static, ()> + Send + Sync>;

/// Callback receiving the error that closed the transport, if any.
pub type CloseHandler = Arc<dyn Fn(Option<HubError>) -> BoxFuture<'static, ()> + Send + Sync>;

/// One physical channel to the hub.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the channel. Returns once it is ready for sends.
    async fn connect(&self, url: &str, transfer_format: TransferFormat) -> Result<(), HubError>;

    /// Transmit one payload.
    async fn send(&self, payload: Payload) -> Result<(), HubError>;

    /// Close the channel, reporting `error` to the close handler.
    ///
    /// A second call is a no-op.
    async fn stop(&self, error: Option<HubError>) -> Result<(), HubError>;

    /// Register the receive handler. Must be called before `connect`.
    fn on_receive(&self, handler: ReceiveHandler);

    /// Register the close handler. Must be called before `connect`.
    fn on_close(&self, handler: CloseHandler);

    /// Connection id assigned by the server during negotiation.
    fn connection_id(&self) -> Option<String> {
        None
    }

    /// Whether the server agreed to stateful reconnect for this connection.
    fn supports_stateful_reconnect(&self) -> bool {
        false
    }
}

/// Creates a new transport for each connect attempt.
pub trait TransportFactory: Send + Sync + std::fmt::Debug {
    /// Build an unconnected transport.
    fn create(&self) -> Result<Arc<dyn Transport>, HubError>;
}

/// The concrete transports a client may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Persistent WebSocket.
    WebSockets,
    /// Server-sent events for receiving, HTTP POST for sending.
    ServerSentEvents,
    /// Long polling for receiving, HTTP POST for sending.
    LongPolling,
}

impl TransportKind {
    /// Every kind, in order of preference.
    pub const ALL: [Self; 3] = [Self::WebSockets, Self::ServerSentEvents, Self::LongPolling];

    /// Name used in negotiate responses.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebSockets => "WebSockets",
            Self::ServerSentEvents => "ServerSentEvents",
            Self::LongPolling => "LongPolling",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WebSockets" => Ok(Self::WebSockets),
            "ServerSentEvents" => Ok(Self::ServerSentEvents),
            "LongPolling" => Ok(Self::LongPolling),
            other => Err(HubError::InvalidData(format!("Unknown transport '{other}'"))),
        }
    }
}

/// Handler slots shared by the concrete transports.
///
/// Guarantees the close handler runs at most once no matter how many paths
/// (read loop ending, explicit stop) race to report the close.
#[derive(Default)]
pub(crate) struct TransportHandlers {
    receive: Mutex<Option<ReceiveHandler>>,
    close: Mutex<Option<CloseHandler>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for TransportHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandlers")
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl TransportHandlers {
    pub(crate) fn set_receive(&self, handler: ReceiveHandler) {
        *self.receive.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub(crate) fn set_close(&self, handler: CloseHandler) {
        *self.close.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Hand a payload to the receive handler and wait for it to finish.
    pub(crate) async fn deliver(&self, payload: Payload) {
        let handler = self
            .receive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            handler(payload).await;
        }
    }

    /// Run the close handler if this is the first close.
    pub(crate) async fn close(&self, error: Option<HubError>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let handler = self
            .close
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handler) = handler {
            handler(error).await;
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Render a payload for logging, hiding its content unless asked not to.
pub(crate) fn describe_payload(payload: &Payload, log_message_content: bool) -> String {
    match (payload, log_message_content) {
        (Payload::Text(text), true) => format!("'{text}'"),
        (Payload::Binary(data), true) => format!("Binary data {data:02x?}"),
        (Payload::Text(text), false) => format!("String data of length {}", text.len()),
        (Payload::Binary(data), false) => format!("Binary data of length {}", data.len()),
    }
}

/// Add caller headers and the bearer token to an HTTP request.
pub(crate) fn with_headers(
    mut builder: reqwest::RequestBuilder,
    headers: &[(String, String)],
    access_token: Option<&str>,
) -> reqwest::RequestBuilder {
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(token) = access_token {
        builder = builder.bearer_auth(token);
    }
    builder
}

/// POST one payload to the hub, as the HTTP-based transports send.
pub(crate) async fn post_payload(
    request: reqwest::RequestBuilder,
    payload: Payload,
) -> anyhow::Result<()> {
    let request = match payload {
        Payload::Text(text) => request
            .header(CONTENT_TYPE, "text/plain;charset=UTF-8")
            .body(text),
        Payload::Binary(data) => request
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(data),
    };
    let response = request.send().await.context("HTTP send failed")?;
    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("HTTP send failed with status code {status}");
    }
    Ok(())
}

/// Parse a hub URL.
pub(crate) fn parse_url(url: &str) -> Result<Url, HubError> {
    Url::parse(url)
        .map_err(|e| HubError::InvalidOperation(format!("Invalid hub URL '{url}': {e}")))
}

/// Append a form-encoded query parameter, keeping any existing query and fragment.
pub(crate) fn append_query(url: &str, key: &str, value: &str) -> Result<String, HubError> {
    let mut url = parse_url(url)?;
    url.query_pairs_mut().append_pair(key, value);
    Ok(url.into())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures_util::FutureExt;

    use super::*;

    #[test]
    fn test_transport_kind_names_round_trip() {
        for kind in TransportKind::ALL {
            assert_eq!(kind.as_str().parse::<TransportKind>().unwrap(), kind);
        }
        assert!("Carrier pigeon".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_describe_payload_hides_content_by_default() {
        let payload = Payload::from("secret");
        assert_eq!(describe_payload(&payload, false), "String data of length 6");
        assert_eq!(describe_payload(&payload, true), "'secret'");
    }

    #[test]
    fn test_append_query() {
        assert_eq!(
            append_query("http://h/hub", "id", "a b&c").unwrap(),
            "http://h/hub?id=a+b%26c"
        );
        assert_eq!(
            append_query("http://h/hub?x=1", "id", "c").unwrap(),
            "http://h/hub?x=1&id=c"
        );
        assert_eq!(
            append_query("http://h/hub?x=1#section", "id", "c").unwrap(),
            "http://h/hub?x=1&id=c#section"
        );
        assert!(matches!(
            append_query("not a url", "id", "c"),
            Err(HubError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_close_handler_runs_once() {
        let handlers = TransportHandlers::default();
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            handlers.set_close(Arc::new(move |_error| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {}.boxed()
            }));
        }

        handlers.close(None).await;
        handlers.close(Some(HubError::aborted())).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(handlers.is_closed());
    }
}
