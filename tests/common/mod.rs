//! Scriptable in-memory transport shared by the integration tests.
//!
//! The mock answers the handshake by itself (configurable), records every
//! frame the client sends and lets a test push frames or a close from the
//! "server" side. An optional responder maps each sent hub message to reply
//! frames, delivered before `send` returns.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use hubrpc::protocol::TransferFormat;
use hubrpc::transport::{CloseHandler, ReceiveHandler};
use hubrpc::{HubError, Payload, Transport, TransportFactory};
use serde_json::Value;

/// Maps a hub message the client sent to reply messages.
pub type Responder = Arc<dyn Fn(&Value) -> Vec<Value> + Send + Sync>;

/// Poll `condition` until it holds, panicking after a few seconds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Frame one JSON hub message.
pub fn frame(message: &Value) -> String {
    format!("{message}\u{1e}")
}

// ========== Factory ==========

#[derive(Default)]
struct FactoryState {
    created: Mutex<Vec<Arc<MockTransport>>>,
    stateful: AtomicBool,
    failing_connects: AtomicUsize,
    handshake_reply: Mutex<Option<String>>,
    responder: Mutex<Option<Responder>>,
}

/// Creates [`MockTransport`]s and keeps them for inspection.
#[derive(Clone)]
pub struct MockFactory {
    state: Arc<FactoryState>,
}

impl std::fmt::Debug for MockFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockFactory")
            .field("created", &self.created_count())
            .finish_non_exhaustive()
    }
}

impl Default for MockFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFactory {
    pub fn new() -> Self {
        let factory = Self {
            state: Arc::new(FactoryState::default()),
        };
        factory.set_handshake_reply(Some("{}\u{1e}"));
        factory
    }

    /// Report stateful reconnect support from every transport.
    pub fn stateful(self) -> Self {
        self.state.stateful.store(true, Ordering::SeqCst);
        self
    }

    /// Reply frames for sent hub messages.
    pub fn with_responder(
        self,
        responder: impl Fn(&Value) -> Vec<Value> + Send + Sync + 'static,
    ) -> Self {
        *self.state.responder.lock().unwrap() = Some(Arc::new(responder));
        self
    }

    /// What the "server" answers to the handshake request; `None` stays silent.
    pub fn set_handshake_reply(&self, reply: Option<&str>) {
        *self.state.handshake_reply.lock().unwrap() = reply.map(str::to_string);
    }

    /// Make the next `count` connects fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.state.failing_connects.store(count, Ordering::SeqCst);
    }

    pub fn created_count(&self) -> usize {
        self.state.created.lock().unwrap().len()
    }

    /// The `index`-th transport created.
    pub fn transport(&self, index: usize) -> Arc<MockTransport> {
        Arc::clone(&self.state.created.lock().unwrap()[index])
    }

    /// The most recently created transport.
    pub fn latest(&self) -> Arc<MockTransport> {
        Arc::clone(self.state.created.lock().unwrap().last().unwrap())
    }
}

impl TransportFactory for MockFactory {
    fn create(&self) -> Result<Arc<dyn Transport>, HubError> {
        let fail = self
            .state
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let transport = Arc::new_cyclic(|me| MockTransport {
            me: me.clone(),
            index: self.created_count(),
            stateful: self.state.stateful.load(Ordering::SeqCst),
            connect_error: fail.then(|| HubError::Transport("connection refused".to_string())),
            handshake_reply: self.state.handshake_reply.lock().unwrap().clone(),
            responder: self.state.responder.lock().unwrap().clone(),
            receive: Mutex::new(None),
            close: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            deliver: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
        });
        self.state.created.lock().unwrap().push(Arc::clone(&transport));
        Ok(transport)
    }
}

// ========== Transport ==========

/// In-memory transport driven by the test.
pub struct MockTransport {
    me: Weak<MockTransport>,
    pub index: usize,
    stateful: bool,
    connect_error: Option<HubError>,
    handshake_reply: Option<String>,
    responder: Option<Responder>,
    receive: Mutex<Option<ReceiveHandler>>,
    close: Mutex<Option<CloseHandler>>,
    sent: Mutex<Vec<String>>,
    deliver: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    close_count: AtomicUsize,
    stop_calls: AtomicUsize,
}

impl MockTransport {
    /// Raw frames sent by the client, handshake included.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    /// Hub messages sent by the client (everything with a `type`).
    pub fn sent_messages(&self) -> Vec<Value> {
        self.sent()
            .iter()
            .flat_map(|payload| payload.split('\u{1e}').map(str::to_string).collect::<Vec<_>>())
            .filter(|record| !record.is_empty())
            .filter_map(|record| serde_json::from_str::<Value>(&record).ok())
            .filter(|message| message.get("type").is_some())
            .collect()
    }

    /// Sent hub messages of one `type`.
    pub fn sent_of_type(&self, message_type: u64) -> Vec<Value> {
        self.sent_messages()
            .into_iter()
            .filter(|message| message["type"] == message_type)
            .collect()
    }

    /// Push a frame from the server.
    pub async fn receive(&self, text: &str) {
        let _order = self.deliver.lock().await;
        let handler = self.receive.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(Payload::Text(text.to_string())).await;
        }
    }

    /// Push one hub message from the server.
    pub async fn receive_message(&self, message: &Value) {
        self.receive(&frame(message)).await;
    }

    /// Simulate the server dropping the connection.
    pub async fn server_close(&self, error: Option<HubError>) {
        self.close_once(error).await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// How many times the close handler ran.
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    async fn close_once(&self, error: Option<HubError>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_count.fetch_add(1, Ordering::SeqCst);
        let handler = self.close.lock().unwrap().take();
        if let Some(handler) = handler {
            handler(error).await;
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, _url: &str, _transfer_format: TransferFormat) -> Result<(), HubError> {
        match &self.connect_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn send(&self, payload: Payload) -> Result<(), HubError> {
        if self.is_closed() {
            return Err(HubError::Transport("transport is closed".to_string()));
        }
        let text = payload.as_text().unwrap_or_default().to_string();
        let is_handshake = {
            let mut sent = self.sent.lock().unwrap();
            sent.push(text.clone());
            sent.len() == 1
        };

        let Some(me) = self.me.upgrade() else {
            return Ok(());
        };
        if is_handshake {
            if let Some(reply) = &self.handshake_reply {
                me.receive(reply).await;
            }
            return Ok(());
        }
        if let Some(responder) = &self.responder {
            let Ok(message) = serde_json::from_str::<Value>(text.trim_end_matches('\u{1e}')) else {
                return Ok(());
            };
            for reply in responder(&message) {
                me.receive_message(&reply).await;
            }
        }
        Ok(())
    }

    async fn stop(&self, error: Option<HubError>) -> Result<(), HubError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.close_once(error).await;
        Ok(())
    }

    fn on_receive(&self, handler: ReceiveHandler) {
        *self.receive.lock().unwrap() = Some(handler);
    }

    fn on_close(&self, handler: CloseHandler) {
        *self.close.lock().unwrap() = Some(handler);
    }

    fn connection_id(&self) -> Option<String> {
        Some(format!("mock-{}", self.index))
    }

    fn supports_stateful_reconnect(&self) -> bool {
        self.stateful
    }
}
