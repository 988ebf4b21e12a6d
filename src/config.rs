//! Connection configuration.
//!
//! [`HttpConnectionOptions`] configures how the physical connection is made
//! (negotiation, transports, headers, credentials); [`HubConnectionOptions`]
//! tunes the hub protocol layer on top of it. Both are normally filled in by
//! [`HubConnectionBuilder`](crate::HubConnectionBuilder).

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::constants::{
    DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_KEEP_ALIVE_INTERVAL, DEFAULT_MAX_BUFFER_SIZE,
    DEFAULT_SERVER_TIMEOUT, HTTP_REQUEST_TIMEOUT,
};
use crate::error::HubError;
use crate::transport::TransportKind;

/// Async supplier of the access token sent with every connect and request.
pub type AccessTokenFactory =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Option<String>, HubError>> + Send + Sync>;

/// Wrap a fixed token in an [`AccessTokenFactory`].
pub fn static_access_token(token: impl Into<String>) -> AccessTokenFactory {
    let token = token.into();
    Arc::new(move || futures_util::future::ready(Ok(Some(token.clone()))).boxed())
}

/// Resolve the token from an optional factory.
pub(crate) async fn resolve_access_token(
    factory: Option<&AccessTokenFactory>,
) -> Result<Option<String>, HubError> {
    match factory {
        Some(factory) => factory().await,
        None => Ok(None),
    }
}

/// Options for the HTTP-level connection.
#[derive(Clone)]
pub struct HttpConnectionOptions {
    /// Extra headers sent with negotiate, connect and HTTP transport requests.
    pub headers: Vec<(String, String)>,
    /// Supplies the bearer token, if the hub needs one.
    pub access_token_factory: Option<AccessTokenFactory>,
    /// Transports the client may use, in no particular order.
    pub transports: Vec<TransportKind>,
    /// Connect straight to the WebSocket endpoint without negotiating.
    pub skip_negotiation: bool,
    /// Log payload contents at trace level instead of just their size.
    pub log_message_content: bool,
    /// Ask the server for stateful reconnect during negotiation.
    pub use_stateful_reconnect: bool,
    /// Timeout of negotiate, send and delete requests.
    pub request_timeout: Duration,
}

impl Default for HttpConnectionOptions {
    fn default() -> Self {
        Self {
            headers: Vec::new(),
            access_token_factory: None,
            transports: TransportKind::ALL.to_vec(),
            skip_negotiation: false,
            log_message_content: false,
            use_stateful_reconnect: false,
            request_timeout: HTTP_REQUEST_TIMEOUT,
        }
    }
}

impl std::fmt::Debug for HttpConnectionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConnectionOptions")
            .field("headers", &self.headers.len())
            .field("access_token_factory", &self.access_token_factory.is_some())
            .field("transports", &self.transports)
            .field("skip_negotiation", &self.skip_negotiation)
            .field("log_message_content", &self.log_message_content)
            .field("use_stateful_reconnect", &self.use_stateful_reconnect)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Options for the hub protocol layer.
#[derive(Debug, Clone)]
pub struct HubConnectionOptions {
    /// Silence from the server longer than this drops the connection.
    pub server_timeout: Duration,
    /// A ping is sent after this long without any outbound message.
    pub keep_alive_interval: Duration,
    /// Bound on waiting for the handshake response.
    pub handshake_timeout: Duration,
    /// Buffer and replay messages across reconnects with server acks.
    pub stateful_reconnect: bool,
    /// Outbound buffer budget in bytes before producers are suspended.
    pub max_buffer_size: usize,
}

impl Default for HubConnectionOptions {
    fn default() -> Self {
        Self {
            server_timeout: DEFAULT_SERVER_TIMEOUT,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            stateful_reconnect: false,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
        }
    }
}
