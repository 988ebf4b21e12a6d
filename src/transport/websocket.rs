//! WebSocket transport.
//!
//! Rewrites the hub URL to `ws(s)` and passes the access token as the
//! `access_token` query parameter. One read task per connection feeds the
//! receive handler in frame order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::ws::{self, WsFrame, WsReader, WsWriter};
use super::{
    append_query, describe_payload, CloseHandler, ReceiveHandler, Transport, TransportHandlers,
};
use crate::config::{resolve_access_token, AccessTokenFactory};
use crate::constants::ACCESS_TOKEN_QUERY_PARAM;
use crate::error::HubError;
use crate::protocol::{Payload, TransferFormat};

/// Normal closure status code.
const CLOSE_NORMAL: u16 = 1000;

/// Hub transport over a single WebSocket.
pub struct WebSocketTransport {
    headers: Vec<(String, String)>,
    access_token_factory: Option<AccessTokenFactory>,
    log_message_content: bool,
    handlers: Arc<TransportHandlers>,
    writer: Arc<Mutex<Option<WsWriter>>>,
    cancel: CancellationToken,
    stopped: AtomicBool,
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("headers", &self.headers.len())
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl WebSocketTransport {
    /// Create an unconnected transport.
    pub fn new(
        headers: Vec<(String, String)>,
        access_token_factory: Option<AccessTokenFactory>,
        log_message_content: bool,
    ) -> Self {
        Self {
            headers,
            access_token_factory,
            log_message_content,
            handlers: Arc::new(TransportHandlers::default()),
            writer: Arc::new(Mutex::new(None)),
            cancel: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        }
    }

    async fn read_loop(
        mut reader: WsReader,
        handlers: Arc<TransportHandlers>,
        writer: Arc<Mutex<Option<WsWriter>>>,
        cancel: CancellationToken,
        log_message_content: bool,
    ) {
        let error = loop {
            let frame = tokio::select! {
                () = cancel.cancelled() => return,
                frame = reader.recv() => frame,
            };

            match frame {
                Some(Ok(WsFrame::Data(payload))) => {
                    log::trace!(
                        "[WebSocket] data received: {}",
                        describe_payload(&payload, log_message_content)
                    );
                    handlers.deliver(payload).await;
                }
                Some(Ok(WsFrame::Ping(data))) => {
                    if let Some(writer) = writer.lock().await.as_mut() {
                        if let Err(e) = writer.send_pong(data).await {
                            break Some(HubError::transport(&e));
                        }
                    }
                }
                Some(Ok(WsFrame::Close { code, reason })) => {
                    log::info!("[WebSocket] Closed by server ({})", code);
                    break (code != CLOSE_NORMAL).then(|| {
                        HubError::ConnectionAborted(format!(
                            "WebSocket closed with status code: {code} ({reason})."
                        ))
                    });
                }
                Some(Err(e)) => {
                    log::warn!("[WebSocket] {:#}", e);
                    break Some(HubError::transport(&e));
                }
                None => {
                    break Some(HubError::ConnectionAborted(
                        "WebSocket closed without a close frame.".to_string(),
                    ));
                }
            }
        };

        writer.lock().await.take();
        handlers.close(error).await;
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &str, transfer_format: TransferFormat) -> Result<(), HubError> {
        let mut url = ws::http_to_ws_scheme(url);
        log::info!("[WebSocket] Connecting to {} ({})", url, transfer_format);

        if let Some(token) = resolve_access_token(self.access_token_factory.as_ref()).await? {
            url = append_query(&url, ACCESS_TOKEN_QUERY_PARAM, &token)?;
        }

        let (mut writer, reader) = ws::connect(&url, &self.headers)
            .await
            .map_err(|e| HubError::transport(&e))?;

        if self.stopped.load(Ordering::SeqCst) {
            let _ = writer.close().await;
            return Err(HubError::ConnectionAborted(
                "The WebSocket was stopped while connecting.".to_string(),
            ));
        }

        *self.writer.lock().await = Some(writer);
        tokio::spawn(Self::read_loop(
            reader,
            Arc::clone(&self.handlers),
            Arc::clone(&self.writer),
            self.cancel.clone(),
            self.log_message_content,
        ));

        log::info!("[WebSocket] Connected");
        Ok(())
    }

    async fn send(&self, payload: Payload) -> Result<(), HubError> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(HubError::InvalidOperation(
                "WebSocket is not in the OPEN state.".to_string(),
            ));
        };
        log::trace!(
            "[WebSocket] sending data: {}",
            describe_payload(&payload, self.log_message_content)
        );
        writer.send(payload).await.map_err(|e| HubError::transport(&e))
    }

    async fn stop(&self, error: Option<HubError>) -> Result<(), HubError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.close().await {
                log::debug!("[WebSocket] Close frame not delivered: {:#}", e);
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
