//! Long polling transport.
//!
//! Receives by issuing back-to-back GET requests that the server holds open
//! until it has data; sends are HTTP POSTs and stopping issues a DELETE.
//!
//! Poll status codes:
//! - `200`: body (possibly empty) carries messages, poll again
//! - `204` / `404`: the server closed the connection
//! - anything else: the connection failed

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;

use super::{
    describe_payload, post_payload, with_headers, CloseHandler, ReceiveHandler, Transport,
    TransportHandlers,
};
use crate::config::{resolve_access_token, AccessTokenFactory};
use crate::constants::LONG_POLL_TIMEOUT;
use crate::error::HubError;
use crate::protocol::{Payload, TransferFormat};

/// Everything a poll request needs, cloned into the poll task.
#[derive(Debug, Clone)]
struct PollTarget {
    client: reqwest::Client,
    url: String,
    headers: Vec<(String, String)>,
    access_token: Option<String>,
    transfer_format: TransferFormat,
}

impl PollTarget {
    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        with_headers(builder, &self.headers, self.access_token.as_deref())
    }

    async fn poll(&self) -> Result<reqwest::Response, reqwest::Error> {
        self.request(self.client.get(&self.url))
            .timeout(LONG_POLL_TIMEOUT)
            .send()
            .await
    }

    async fn read_body(&self, response: reqwest::Response) -> anyhow::Result<Option<Payload>> {
        let payload = match self.transfer_format {
            TransferFormat::Text => {
                Payload::Text(response.text().await.context("Failed to read poll body")?)
            }
            TransferFormat::Binary => {
                Payload::Binary(response.bytes().await.context("Failed to read poll body")?)
            }
        };
        Ok((!payload.is_empty()).then_some(payload))
    }
}

/// Hub transport over HTTP long polling.
pub struct LongPollingTransport {
    client: reqwest::Client,
    headers: Vec<(String, String)>,
    access_token_factory: Option<AccessTokenFactory>,
    log_message_content: bool,
    request_timeout: Duration,
    handlers: Arc<TransportHandlers>,
    target: Mutex<Option<PollTarget>>,
    cancel: CancellationToken,
    stopped: AtomicBool,
}

impl std::fmt::Debug for LongPollingTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LongPollingTransport")
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl LongPollingTransport {
    /// Create an unconnected transport sharing `client`.
    pub fn new(
        client: reqwest::Client,
        headers: Vec<(String, String)>,
        access_token_factory: Option<AccessTokenFactory>,
        log_message_content: bool,
        request_timeout: Duration,
    ) -> Self {
        Self {
            client,
            headers,
            access_token_factory,
            log_message_content,
            request_timeout,
            handlers: Arc::new(TransportHandlers::default()),
            target: Mutex::new(None),
            cancel: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        }
    }

    fn target(&self) -> Option<PollTarget> {
        self.target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn poll_loop(
        target: PollTarget,
        handlers: Arc<TransportHandlers>,
        cancel: CancellationToken,
        log_message_content: bool,
    ) {
        let error = loop {
            let response = tokio::select! {
                () = cancel.cancelled() => return,
                response = target.poll() => response,
            };

            let response = match response {
                Ok(response) => response,
                Err(e) if e.is_timeout() => {
                    log::trace!("[LongPolling] Poll timed out, reissuing");
                    continue;
                }
                Err(e) => {
                    let err = anyhow::Error::new(e).context("Long poll failed");
                    log::warn!("[LongPolling] {:#}", err);
                    break Some(HubError::transport(&err));
                }
            };

            match response.status() {
                StatusCode::OK => match target.read_body(response).await {
                    Ok(Some(payload)) => {
                        log::trace!(
                            "[LongPolling] data received: {}",
                            describe_payload(&payload, log_message_content)
                        );
                        handlers.deliver(payload).await;
                    }
                    Ok(None) => log::trace!("[LongPolling] Poll timed out on the server"),
                    Err(e) => break Some(HubError::transport(&e)),
                },
                StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => {
                    log::info!("[LongPolling] Poll terminated by server");
                    break None;
                }
                status => {
                    break Some(HubError::Transport(format!(
                        "Unexpected response code: {}.",
                        status.as_u16()
                    )));
                }
            }
        };

        handlers.close(error).await;
    }
}

#[async_trait]
impl Transport for LongPollingTransport {
    async fn connect(&self, url: &str, transfer_format: TransferFormat) -> Result<(), HubError> {
        log::info!("[LongPolling] Connecting to {}", url);

        let target = PollTarget {
            client: self.client.clone(),
            url: url.to_string(),
            headers: self.headers.clone(),
            access_token: resolve_access_token(self.access_token_factory.as_ref()).await?,
            transfer_format,
        };

        // The first poll completes the server-side connection setup.
        let response = target
            .poll()
            .await
            .map_err(|e| {
                HubError::transport(&anyhow::Error::new(e).context("Initial poll failed"))
            })?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(HubError::Transport(format!(
                "Unexpected response code: {}.",
                status.as_u16()
            )));
        }

        if self.stopped.load(Ordering::SeqCst) {
            return Err(HubError::ConnectionAborted(
                "Long polling was stopped while connecting.".to_string(),
            ));
        }

        *self.target.lock().unwrap_or_else(PoisonError::into_inner) = Some(target.clone());
        tokio::spawn(Self::poll_loop(
            target,
            Arc::clone(&self.handlers),
            self.cancel.clone(),
            self.log_message_content,
        ));

        log::info!("[LongPolling] Connected");
        Ok(())
    }

    async fn send(&self, payload: Payload) -> Result<(), HubError> {
        let Some(target) = self.target() else {
            return Err(HubError::InvalidOperation(
                "Cannot send until the transport is connected".to_string(),
            ));
        };
        if self.handlers.is_closed() {
            return Err(HubError::InvalidOperation(
                "Cannot send after the transport closed".to_string(),
            ));
        }

        log::trace!(
            "[LongPolling] sending data: {}",
            describe_payload(&payload, self.log_message_content)
        );
        let request = target
            .request(self.client.post(&target.url))
            .timeout(self.request_timeout);
        post_payload(request, payload)
            .await
            .map_err(|e| HubError::transport(&e))
    }

    async fn stop(&self, error: Option<HubError>) -> Result<(), HubError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();

        if let Some(target) = self.target() {
            log::debug!("[LongPolling] Sending DELETE to {}", target.url);
            let result = target
                .request(self.client.delete(&target.url))
                .timeout(self.request_timeout)
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => {
                    log::debug!("[LongPolling] DELETE returned {}", response.status());
                }
                Err(e) => log::debug!("[LongPolling] DELETE failed: {}", e),
            }
        }

        self.handlers.close(error).await;
        Ok(())
    }

    fn on_receive(&self, handler: ReceiveHandler) {
        self.handlers.set_receive(handler);
    }

    fn on_close(&self, handler: CloseHandler) {
        self.handlers.set_close(handler);
    }
}
