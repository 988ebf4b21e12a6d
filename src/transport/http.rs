//! HTTP connection: negotiation plus transport selection.
//!
//! [`HttpConnection`] is itself a [`Transport`]. On `connect` it negotiates
//! with the hub (following redirects), then tries the transports the server
//! offers, in the server's order, skipping any the caller disabled or that
//! cannot carry the requested transfer format. The first transport that
//! connects is used for the rest of the connection's life.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::FutureExt;

use super::negotiate::{connect_url, send_negotiate, NegotiateResponse};
use super::{
    CloseHandler, LongPollingTransport, ReceiveHandler, ServerSentEventsTransport, Transport,
    TransportFactory, TransportHandlers, TransportKind, WebSocketTransport,
};
use crate::config::{
    resolve_access_token, static_access_token, AccessTokenFactory, HttpConnectionOptions,
};
use crate::constants::MAX_NEGOTIATE_REDIRECTS;
use crate::error::HubError;
use crate::protocol::{Payload, TransferFormat};

/// Negotiating transport that delegates to the selected concrete transport.
pub struct HttpConnection {
    options: HttpConnectionOptions,
    client: reqwest::Client,
    handlers: Arc<TransportHandlers>,
    inner: Mutex<Option<Arc<dyn Transport>>>,
    connection_id: Mutex<Option<String>>,
    stateful_reconnect: AtomicBool,
    stopped: AtomicBool,
}

impl std::fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConnection")
            .field("options", &self.options)
            .field("connection_id", &self.connection_id())
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl HttpConnection {
    /// Create an unconnected connection sharing `client`.
    pub fn new(options: HttpConnectionOptions, client: reqwest::Client) -> Self {
        Self {
            options,
            client,
            handlers: Arc::new(TransportHandlers::default()),
            inner: Mutex::new(None),
            connection_id: Mutex::new(None),
            stateful_reconnect: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    fn inner(&self) -> Option<Arc<dyn Transport>> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_inner(&self, transport: Option<Arc<dyn Transport>>) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = transport;
    }

    fn create_transport(
        &self,
        kind: TransportKind,
        access_token_factory: Option<AccessTokenFactory>,
    ) -> Arc<dyn Transport> {
        let headers = self.options.headers.clone();
        let log_content = self.options.log_message_content;
        let timeout = self.options.request_timeout;
        match kind {
            TransportKind::WebSockets => Arc::new(WebSocketTransport::new(
                headers,
                access_token_factory,
                log_content,
            )),
            TransportKind::ServerSentEvents => Arc::new(ServerSentEventsTransport::new(
                self.client.clone(),
                headers,
                access_token_factory,
                log_content,
                timeout,
            )),
            TransportKind::LongPolling => Arc::new(LongPollingTransport::new(
                self.client.clone(),
                headers,
                access_token_factory,
                log_content,
                timeout,
            )),
        }
    }

    /// Negotiate, following redirects. Updates `url` and the token factory to
    /// the final target.
    async fn negotiate(
        &self,
        url: &mut String,
        access_token_factory: &mut Option<AccessTokenFactory>,
    ) -> Result<NegotiateResponse, HubError> {
        let mut redirects = 0;
        loop {
            let token = resolve_access_token(access_token_factory.as_ref()).await?;
            let response = send_negotiate(
                &self.client,
                url,
                &self.options.headers,
                token.as_deref(),
                self.options.use_stateful_reconnect,
                self.options.request_timeout,
            )
            .await
            .map_err(|e| HubError::transport(&e))?;

            if let Some(error) = response.error {
                return Err(HubError::Transport(error));
            }

            let Some(redirect) = response.url else {
                return Ok(response);
            };

            redirects += 1;
            if redirects >= MAX_NEGOTIATE_REDIRECTS {
                return Err(HubError::Transport(
                    "Negotiate redirection limit exceeded.".to_string(),
                ));
            }
            log::debug!("[HttpConnection] Negotiate redirected to {}", redirect);
            *url = redirect;
            if let Some(token) = response.access_token {
                *access_token_factory = Some(static_access_token(token));
            }
        }
    }

    /// Wire up handlers and connect one concrete transport.
    async fn start_transport(
        &self,
        transport: Arc<dyn Transport>,
        url: &str,
        transfer_format: TransferFormat,
    ) -> Result<(), HubError> {
        let handlers = Arc::clone(&self.handlers);
        transport.on_receive(Arc::new(move |payload| {
            let handlers = Arc::clone(&handlers);
            async move { handlers.deliver(payload).await }.boxed()
        }));
        let handlers = Arc::clone(&self.handlers);
        transport.on_close(Arc::new(move |error| {
            let handlers = Arc::clone(&handlers);
            async move { handlers.close(error).await }.boxed()
        }));

        self.set_inner(Some(Arc::clone(&transport)));
        if let Err(e) = transport.connect(url, transfer_format).await {
            self.set_inner(None);
            return Err(e);
        }

        if self.stopped.load(Ordering::SeqCst) {
            transport.stop(None).await?;
            return Err(HubError::ConnectionAborted(
                "The connection was stopped during negotiation.".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for HttpConnection {
    async fn connect(&self, url: &str, transfer_format: TransferFormat) -> Result<(), HubError> {
        let mut url = url.to_string();
        let mut access_token_factory = self.options.access_token_factory.clone();

        if self.options.skip_negotiation {
            if !self.options.transports.contains(&TransportKind::WebSockets) {
                return Err(HubError::InvalidOperation(
                    "Negotiation can only be skipped when using the WebSocket transport directly."
                        .to_string(),
                ));
            }
            let transport = self.create_transport(TransportKind::WebSockets, access_token_factory);
            return self.start_transport(transport, &url, transfer_format).await;
        }

        let mut negotiation = self.negotiate(&mut url, &mut access_token_factory).await?;
        let mut failures = Vec::new();
        let mut attempted = false;

        for offered in negotiation.available_transports.clone() {
            let Some(kind) = offered.kind() else {
                log::debug!("[HttpConnection] Skipping unknown transport '{}'", offered.transport);
                continue;
            };
            if !self.options.transports.contains(&kind) {
                log::debug!(
                    "[HttpConnection] Skipping transport '{}': disabled by the client.",
                    kind
                );
                continue;
            }
            if !offered.supports(transfer_format) {
                log::debug!(
                    "[HttpConnection] Skipping transport '{}': transfer format '{}' unsupported.",
                    kind,
                    transfer_format
                );
                continue;
            }

            // Connection tokens are single use; a fallback needs a fresh one.
            if attempted {
                negotiation = self.negotiate(&mut url, &mut access_token_factory).await?;
            }
            attempted = true;

            *self
                .connection_id
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = negotiation.connection_id.clone();
            self.stateful_reconnect.store(
                negotiation.use_stateful_reconnect && self.options.use_stateful_reconnect,
                Ordering::SeqCst,
            );

            let transport = self.create_transport(kind, access_token_factory.clone());
            let target = connect_url(&url, &negotiation)?;
            match self.start_transport(transport, &target, transfer_format).await {
                Ok(()) => {
                    log::info!("[HttpConnection] Connected using {}", kind);
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("[HttpConnection] Failed to start the transport '{}': {}", kind, e);
                    failures.push(format!("{kind} failed: {e}"));
                    if self.stopped.load(Ordering::SeqCst) {
                        return Err(e);
                    }
                }
            }
        }

        if failures.is_empty() {
            return Err(HubError::Transport(
                "None of the transports supported by the client are supported by the server."
                    .to_string(),
            ));
        }
        Err(HubError::Transport(format!(
            "Unable to connect to the server with any of the available transports. {}",
            failures.join(" ")
        )))
    }

    async fn send(&self, payload: Payload) -> Result<(), HubError> {
        match self.inner() {
            Some(transport) => transport.send(payload).await,
            None => Err(HubError::InvalidOperation(
                "Cannot send data if the connection is not in the 'Connected' State.".to_string(),
            )),
        }
    }

    async fn stop(&self, error: Option<HubError>) -> Result<(), HubError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match self.inner() {
            Some(transport) => transport.stop(error).await,
            None => {
                self.handlers.close(error).await;
                Ok(())
            }
        }
    }

    fn on_receive(&self, handler: ReceiveHandler) {
        self.handlers.set_receive(handler);
    }

    fn on_close(&self, handler: CloseHandler) {
        self.handlers.set_close(handler);
    }

    fn connection_id(&self) -> Option<String> {
        self.connection_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn supports_stateful_reconnect(&self) -> bool {
        self.stateful_reconnect.load(Ordering::SeqCst)
    }
}

/// Creates an [`HttpConnection`] per connect attempt.
#[derive(Debug, Clone)]
pub struct HttpTransportFactory {
    options: HttpConnectionOptions,
    client: reqwest::Client,
}

impl HttpTransportFactory {
    /// Build the factory and its shared HTTP client.
    pub fn new(options: HttpConnectionOptions) -> Result<Self, HubError> {
        let client = reqwest::Client::builder().build().map_err(|e| {
            HubError::transport(&anyhow::Error::new(e).context("Failed to build HTTP client"))
        })?;
        Ok(Self { options, client })
    }
}

impl TransportFactory for HttpTransportFactory {
    fn create(&self) -> Result<Arc<dyn Transport>, HubError> {
        Ok(Arc::new(HttpConnection::new(
            self.options.clone(),
            self.client.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_skip_negotiation_requires_websockets() {
        let options = HttpConnectionOptions {
            skip_negotiation: true,
            transports: vec![TransportKind::LongPolling],
            ..HttpConnectionOptions::default()
        };
        let connection = HttpConnection::new(options, reqwest::Client::new());
        let result = connection
            .connect("http://127.0.0.1:1/hub", TransferFormat::Text)
            .await;
        assert!(matches!(result, Err(HubError::InvalidOperation(_))));
    }

    #[tokio::test]
    async fn test_negotiate_failure_is_transport_error() {
        let connection =
            HttpConnection::new(HttpConnectionOptions::default(), reqwest::Client::new());
        let result = connection
            .connect("http://127.0.0.1:1/hub", TransferFormat::Text)
            .await;
        assert!(matches!(result, Err(HubError::Transport(_))));
        assert!(connection.connection_id().is_none());
    }

    #[tokio::test]
    async fn test_stop_before_connect_closes_once() {
        use std::sync::atomic::AtomicUsize;

        let connection =
            HttpConnection::new(HttpConnectionOptions::default(), reqwest::Client::new());
        let closes = Arc::new(AtomicUsize::new(0));
        {
            let closes = Arc::clone(&closes);
            connection.on_close(Arc::new(move |_error| {
                closes.fetch_add(1, Ordering::SeqCst);
                async {}.boxed()
            }));
        }

        connection.stop(None).await.unwrap();
        connection.stop(None).await.unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
