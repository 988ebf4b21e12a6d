//! Builder for [`HubConnection`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;

use super::HubConnection;
use crate::config::{static_access_token, HttpConnectionOptions, HubConnectionOptions};
use crate::error::HubError;
use crate::protocol::{HubProtocol, JsonHubProtocol};
use crate::retry::{DefaultRetryPolicy, RetryPolicy};
use crate::transport::{HttpTransportFactory, TransportFactory, TransportKind};

/// Fluent configuration of a [`HubConnection`].
///
/// Only the URL is required. Without further settings the connection
/// negotiates, may use any transport, speaks JSON and does not reconnect.
#[derive(Debug, Default)]
pub struct HubConnectionBuilder {
    url: Option<String>,
    http: HttpConnectionOptions,
    hub: HubConnectionOptions,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    protocol: Option<Arc<dyn HubProtocol>>,
    transport_factory: Option<Arc<dyn TransportFactory>>,
}

impl HubConnectionBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the hub URL (required).
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Restrict the transports the client may pick during negotiation.
    pub fn with_transports(mut self, transports: impl IntoIterator<Item = TransportKind>) -> Self {
        self.http.transports = transports.into_iter().collect();
        self
    }

    /// Send an extra header with every HTTP request and the WebSocket upgrade.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.http.headers.push((name.into(), value.into()));
        self
    }

    /// Fetch the access token from `factory` before each connect and request.
    pub fn with_access_token_factory<F, Fut>(mut self, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<String>, HubError>> + Send + 'static,
    {
        self.http.access_token_factory = Some(Arc::new(move || factory().boxed()));
        self
    }

    /// Use a fixed access token.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.http.access_token_factory = Some(static_access_token(token));
        self
    }

    /// Connect straight to the WebSocket endpoint without negotiating.
    pub fn skip_negotiation(mut self, skip: bool) -> Self {
        self.http.skip_negotiation = skip;
        self
    }

    /// Log payload contents instead of just their size.
    pub fn log_message_content(mut self, enable: bool) -> Self {
        self.http.log_message_content = enable;
        self
    }

    /// Reconnect after a lost connection with the default delays
    /// (0, 2, 10 and 30 seconds).
    pub fn with_automatic_reconnect(self) -> Self {
        self.with_retry_policy(DefaultRetryPolicy)
    }

    /// Reconnect after a lost connection using `policy`.
    pub fn with_retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry_policy = Some(Arc::new(policy));
        self
    }

    /// How long the server may stay silent before the connection is dropped.
    pub fn server_timeout(mut self, timeout: Duration) -> Self {
        self.hub.server_timeout = timeout;
        self
    }

    /// Idle time after which a keep-alive ping is sent.
    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.hub.keep_alive_interval = interval;
        self
    }

    /// Bound on waiting for the handshake response.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.hub.handshake_timeout = timeout;
        self
    }

    /// Buffer outbound messages and replay them after a reconnect, if the
    /// server agrees.
    pub fn with_stateful_reconnect(mut self) -> Self {
        self.hub.stateful_reconnect = true;
        self
    }

    /// Outbound buffer budget in bytes.
    pub fn max_buffer_size(mut self, bytes: usize) -> Self {
        self.hub.max_buffer_size = bytes;
        self
    }

    /// Use a different hub protocol codec.
    pub fn with_protocol(mut self, protocol: impl HubProtocol + 'static) -> Self {
        self.protocol = Some(Arc::new(protocol));
        self
    }

    /// Supply transports yourself instead of negotiating over HTTP.
    ///
    /// Transport options set on this builder (headers, tokens, transports)
    /// are ignored when a factory is supplied.
    pub fn with_transport_factory(mut self, factory: impl TransportFactory + 'static) -> Self {
        self.transport_factory = Some(Arc::new(factory));
        self
    }

    /// Build the connection. It starts out `Stopped`.
    pub fn build(self) -> Result<HubConnection, HubError> {
        let Some(url) = self.url else {
            return Err(HubError::InvalidOperation(
                "A hub URL is required to build a connection.".to_string(),
            ));
        };

        let mut http = self.http;
        http.use_stateful_reconnect = self.hub.stateful_reconnect;

        let transport_factory = match self.transport_factory {
            Some(factory) => factory,
            None => Arc::new(HttpTransportFactory::new(http)?),
        };
        let protocol = self
            .protocol
            .unwrap_or_else(|| Arc::new(JsonHubProtocol::new()));

        log::debug!(
            "[HubConnection] Built connection to {} using protocol '{}'",
            url,
            protocol.name()
        );
        Ok(HubConnection::from_parts(
            url,
            protocol,
            transport_factory,
            self.retry_policy,
            self.hub,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;

    #[test]
    fn test_build_requires_url() {
        let result = HubConnectionBuilder::new().build();
        assert!(matches!(result, Err(HubError::InvalidOperation(_))));
    }

    #[test]
    fn test_build_starts_stopped() {
        let connection = HubConnection::builder()
            .with_url("http://localhost:5000/hub")
            .with_automatic_reconnect()
            .build()
            .unwrap();
        assert_eq!(connection.state(), ConnectionState::Stopped);
        assert_eq!(connection.url(), "http://localhost:5000/hub");
        assert!(connection.connection_id().is_none());
    }

    #[test]
    fn test_options_are_recorded() {
        let builder = HubConnectionBuilder::new()
            .with_url("http://localhost/hub")
            .with_transports([TransportKind::LongPolling])
            .with_header("X-Test", "1")
            .server_timeout(Duration::from_secs(5))
            .with_stateful_reconnect()
            .max_buffer_size(1024);
        assert_eq!(builder.http.transports, vec![TransportKind::LongPolling]);
        assert_eq!(builder.http.headers.len(), 1);
        assert_eq!(builder.hub.server_timeout, Duration::from_secs(5));
        assert!(builder.hub.stateful_reconnect);
        assert_eq!(builder.hub.max_buffer_size, 1024);
    }
}
