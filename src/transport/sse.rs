//! Server-sent events transport.
//!
//! Receives over a long-lived `text/event-stream` response and sends each
//! payload as its own HTTP POST to the same URL. Text transfer format only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use tokio_util::sync::CancellationToken;

use super::{
    describe_payload, post_payload, with_headers, CloseHandler, ReceiveHandler, Transport,
    TransportHandlers,
};
use crate::config::{resolve_access_token, AccessTokenFactory};
use crate::error::HubError;
use crate::protocol::{Payload, TransferFormat};

/// Hub transport over server-sent events.
pub struct ServerSentEventsTransport {
    client: reqwest::Client,
    headers: Vec<(String, String)>,
    access_token_factory: Option<AccessTokenFactory>,
    log_message_content: bool,
    request_timeout: Duration,
    handlers: Arc<TransportHandlers>,
    /// URL and access token of the open stream, used for sends.
    target: Mutex<Option<(String, Option<String>)>>,
    cancel: CancellationToken,
    stopped: AtomicBool,
}

impl std::fmt::Debug for ServerSentEventsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSentEventsTransport")
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl ServerSentEventsTransport {
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

    async fn open_stream(
        &self,
        url: &str,
        token: Option<&str>,
    ) -> anyhow::Result<reqwest::Response> {
        let request = self
            .client
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        let response = with_headers(request, &self.headers, token)
            .send()
            .await
            .context("EventSource connect failed")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("EventSource failed to connect: status code {status}");
        }
        Ok(response)
    }

    async fn read_loop(
        response: reqwest::Response,
        handlers: Arc<TransportHandlers>,
        cancel: CancellationToken,
        log_message_content: bool,
    ) {
        let mut stream = response.bytes_stream();
        let mut parser = EventStreamParser::default();

        let error = loop {
            let chunk = tokio::select! {
                () = cancel.cancelled() => return,
                chunk = stream.next() => chunk,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    for data in parser.feed(&bytes) {
                        let payload = Payload::Text(data);
                        log::trace!(
                            "[SSE] data received: {}",
                            describe_payload(&payload, log_message_content)
                        );
                        handlers.deliver(payload).await;
                    }
                }
                Some(Err(e)) => {
                    let err = anyhow::Error::new(e).context("EventSource stream failed");
                    log::warn!("[SSE] {:#}", err);
                    break Some(HubError::transport(&err));
                }
                None => {
                    log::info!("[SSE] Event stream ended");
                    break None;
                }
            }
        };

        handlers.close(error).await;
    }
}

#[async_trait]
impl Transport for ServerSentEventsTransport {
    async fn connect(&self, url: &str, transfer_format: TransferFormat) -> Result<(), HubError> {
        if transfer_format != TransferFormat::Text {
            return Err(HubError::InvalidOperation(
                "The Server-Sent Events transport only supports the 'Text' transfer format"
                    .to_string(),
            ));
        }
        log::info!("[SSE] Connecting to {}", url);

        let token = resolve_access_token(self.access_token_factory.as_ref()).await?;
        let response = self
            .open_stream(url, token.as_deref())
            .await
            .map_err(|e| HubError::transport(&e))?;

        if self.stopped.load(Ordering::SeqCst) {
            return Err(HubError::ConnectionAborted(
                "The event stream was stopped while connecting.".to_string(),
            ));
        }

        *self.target.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((url.to_string(), token));
        tokio::spawn(Self::read_loop(
            response,
            Arc::clone(&self.handlers),
            self.cancel.clone(),
            self.log_message_content,
        ));

        log::info!("[SSE] Connected");
        Ok(())
    }

    async fn send(&self, payload: Payload) -> Result<(), HubError> {
        let target = self
            .target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some((url, token)) = target else {
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
            "[SSE] sending data: {}",
            describe_payload(&payload, self.log_message_content)
        );
        let request = with_headers(self.client.post(&url), &self.headers, token.as_deref())
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

/// Incremental `text/event-stream` parser yielding the data of each event.
///
/// Only `data:` fields matter to the hub; comments, `event:`, `id:` and
/// `retry:` lines are ignored.
#[derive(Debug, Default)]
struct EventStreamParser {
    pending: Vec<u8>,
    data: Vec<String>,
}

impl EventStreamParser {
    fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data
                    .push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parser_single_event() {
        let mut parser = EventStreamParser::default();
        let events = parser.feed(b"data: {\"type\":6}\x1e\n\n");
        assert_eq!(events, vec!["{\"type\":6}\u{1e}".to_string()]);
    }

    #[test]
    fn test_parser_event_split_across_chunks() {
        let mut parser = EventStreamParser::default();
        assert!(parser.feed(b"data: hel").is_empty());
        assert!(parser.feed(b"lo\r\n").is_empty());
        assert_eq!(parser.feed(b"\r\n"), vec!["hello".to_string()]);
    }

    #[test]
    fn test_parser_joins_multiline_data_and_skips_comments() {
        let mut parser = EventStreamParser::default();
        let events = parser.feed(b":keepalive\n\nevent: message\ndata: a\ndata: b\n\n");
        assert_eq!(events, vec!["a\nb".to_string()]);
    }

    #[tokio::test]
    async fn test_binary_format_rejected() {
        let transport = ServerSentEventsTransport::new(
            reqwest::Client::new(),
            Vec::new(),
            None,
            false,
            Duration::from_secs(1),
        );
        let result = transport
            .connect("http://127.0.0.1:1/hub", TransferFormat::Binary)
            .await;
        assert!(matches!(result, Err(HubError::InvalidOperation(_))));
    }
}
