//! Hub connection: lifecycle, handshake, reconnect and the public API.
//!
//! A [`HubConnection`] drives one logical connection to a hub across any
//! number of physical transports. Each connect attempt gets a fresh transport
//! from the [`TransportFactory`] and a [`Session`] recording that attempt's
//! liveness and handshake state. Once the handshake succeeds the session is
//! committed and two tasks run for it:
//!
//! - the sender loop, draining the [`MessageBuffer`] into the transport
//! - the liveness loop, enforcing the server timeout and sending pings (and
//!   acks when stateful reconnect is on)
//!
//! # State machine
//!
//! ```text
//! Stopped ──start──> Connecting ──handshake ok──> Connected
//!    ^                   │                          │   ^
//!    │            handshake failed           lost   │   │ reconnected
//!    │                   │                          v   │
//!    └───────────────────┴──── gave up / stop ── Reconnecting
//! ```
//!
//! Transport callbacks hold weak references back to the connection, and close
//! handling always runs on its own task so a transport never awaits its own
//! shutdown from inside its read loop.

mod builder;
mod calls;
mod dispatch;
mod stream;

pub use builder::HubConnectionBuilder;
pub use stream::HubStream;

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::buffer::{MessageBuffer, ReceiveSequence};
use crate::config::HubConnectionOptions;
use crate::constants::{LIVENESS_TICK, STOP_FLUSH_TIMEOUT, SUPPORTED_HANDSHAKE_VERSION};
use crate::error::HubError;
use crate::invocation::{FromArguments, HandlerOutput, IntoArguments, InvocationRegistry};
use crate::protocol::handshake::{self, HandshakeRequest};
use crate::protocol::{
    AckMessage, CancelInvocationMessage, HubMessage, HubProtocol, InvocationMessage, Payload,
    SequenceMessage, StreamInvocationMessage,
};
use crate::retry::RetryPolicy;
use crate::transport::{Transport, TransportFactory};
use calls::{PendingCall, PendingCalls};
use dispatch::Dispatcher;

/// Lifecycle state of a [`HubConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not connected. The only state `start` accepts.
    Stopped,
    /// Connecting and handshaking for the first time.
    Connecting,
    /// Handshake done; messages flow.
    Connected,
    /// The transport was lost and the retry policy is trying again.
    Reconnecting,
}

impl ConnectionState {
    /// Human-readable state name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "Stopped",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Reconnecting => "Reconnecting",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

type ErrorHandler = Arc<dyn Fn(Option<HubError>) + Send + Sync>;
type ReconnectedHandler = Arc<dyn Fn(Option<String>) + Send + Sync>;

// ============================================================================
// Session
// ============================================================================

/// One connect attempt: a transport plus what we know about it.
struct Session {
    transport: Arc<dyn Transport>,
    buffer: Arc<MessageBuffer>,
    /// Resolved exactly once with the handshake outcome.
    handshake: Mutex<Option<oneshot::Sender<Result<(), HubError>>>>,
    handshake_done: AtomicBool,
    closed: AtomicBool,
    /// Set when the session must end the connection instead of reconnecting.
    no_reconnect: AtomicBool,
    stateful: AtomicBool,
    cancel: CancellationToken,
    last_received: Mutex<Instant>,
    last_sent: Mutex<Instant>,
    /// Id of the last buffered item this transport accepted.
    transmitted: watch::Sender<i64>,
}

impl Session {
    fn new(
        transport: Arc<dyn Transport>,
        buffer: Arc<MessageBuffer>,
        handshake: oneshot::Sender<Result<(), HubError>>,
    ) -> Self {
        let now = Instant::now();
        Self {
            transport,
            buffer,
            handshake: Mutex::new(Some(handshake)),
            handshake_done: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            no_reconnect: AtomicBool::new(false),
            stateful: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            last_received: Mutex::new(now),
            last_sent: Mutex::new(now),
            transmitted: watch::channel(0).0,
        }
    }

    /// Resolve the handshake. Returns `false` if it was already resolved.
    fn resolve_handshake(&self, outcome: Result<(), HubError>) -> bool {
        let waiter = self
            .handshake
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(outcome);
                true
            }
            None => false,
        }
    }

    fn is_stateful(&self) -> bool {
        self.stateful.load(Ordering::SeqCst)
    }

    fn touch_received(&self) {
        *self.last_received.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn touch_sent(&self) {
        *self.last_sent.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn since_received(&self) -> Duration {
        self.last_received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    fn since_sent(&self) -> Duration {
        self.last_sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Wait until every item buffered so far went out on this transport,
    /// giving up after `timeout` or when the session ends.
    async fn flush(&self, timeout: Duration) {
        let Some(target) = self.buffer.last_pending_id() else {
            return;
        };
        let mut transmitted = self.transmitted.subscribe();
        let flushed = tokio::select! {
            () = self.cancel.cancelled() => false,
            sent = tokio::time::timeout(timeout, transmitted.wait_for(|id| *id >= target)) => {
                matches!(sent, Ok(Ok(_)))
            }
        };
        if !flushed {
            log::warn!("[HubConnection] Stopping with buffered messages not sent");
        }
    }

    /// End the connection for good: no reconnect, `error` reported.
    fn fail(&self, error: HubError) {
        self.no_reconnect.store(true, Ordering::SeqCst);
        self.stop_in_background(Some(error));
    }

    fn stop_in_background(&self, error: Option<HubError>) {
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            if let Err(e) = transport.stop(error).await {
                log::debug!("[HubConnection] Transport stop failed: {}", e);
            }
        });
    }
}

// ============================================================================
// Shared state
// ============================================================================

/// Mutable lifecycle bookkeeping, guarded by one lock.
struct Lifecycle {
    starting: bool,
    stopping: bool,
    /// Flips to `true` when the in-flight `start` finishes either way.
    start_done: Option<watch::Receiver<bool>>,
    /// Session of a connect attempt still handshaking.
    connecting: Option<Arc<Session>>,
    /// Committed session.
    session: Option<Arc<Session>>,
    buffer: Arc<MessageBuffer>,
    reconnect_cancel: CancellationToken,
    connection_id: Option<String>,
}

pub(crate) struct HubInner {
    url: String,
    protocol: Arc<dyn HubProtocol>,
    transport_factory: Arc<dyn TransportFactory>,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    options: HubConnectionOptions,
    registry: Arc<InvocationRegistry>,
    dispatcher: Dispatcher,
    calls: PendingCalls,
    state_tx: watch::Sender<ConnectionState>,
    lifecycle: Mutex<Lifecycle>,
    receive_sequence: Mutex<ReceiveSequence>,
    closed_handlers: Mutex<Vec<ErrorHandler>>,
    reconnecting_handlers: Mutex<Vec<ErrorHandler>>,
    reconnected_handlers: Mutex<Vec<ReconnectedHandler>>,
    invocation_ids: AtomicU64,
}

/// Releases the `starting` flag however `start` ends, including when its
/// future is dropped mid-handshake.
struct StartGuard<'a> {
    inner: &'a HubInner,
    done: watch::Sender<bool>,
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        let mut lc = self.inner.lifecycle();
        lc.starting = false;
        lc.start_done = None;
        if self.inner.state() == ConnectionState::Connecting {
            if let Some(session) = lc.connecting.take() {
                session.cancel.cancel();
                if tokio::runtime::Handle::try_current().is_ok() {
                    session.stop_in_background(None);
                }
            }
            lc.buffer.close();
            self.inner.state_tx.send_replace(ConnectionState::Stopped);
        }
        drop(lc);
        let _ = self.done.send(true);
    }
}

impl HubInner {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn receive_sequence(&self) -> MutexGuard<'_, ReceiveSequence> {
        self.receive_sequence
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn next_invocation_id(&self) -> String {
        self.invocation_ids.fetch_add(1, Ordering::SeqCst).to_string()
    }

    // ========================================================================
    // Start / stop
    // ========================================================================

    async fn start(self: &Arc<Self>) -> Result<(), HubError> {
        let done = {
            let mut lc = self.lifecycle();
            if lc.starting || self.state() != ConnectionState::Stopped {
                return Err(HubError::InvalidOperation(
                    "Start client while not in a stopped state.".to_string(),
                ));
            }
            lc.starting = true;
            lc.stopping = false;
            let (done, start_done) = watch::channel(false);
            lc.start_done = Some(start_done);
            lc.buffer = Arc::new(MessageBuffer::new(self.options.max_buffer_size));
            lc.reconnect_cancel = CancellationToken::new();
            lc.connection_id = None;
            *self.receive_sequence() = ReceiveSequence::new();
            self.state_tx.send_replace(ConnectionState::Connecting);
            done
        };
        let _guard = StartGuard { inner: self, done };

        log::debug!("[HubConnection] Starting connection to {}", self.url);
        match self.connect_and_handshake(false).await {
            Ok(()) => {
                log::info!("[HubConnection] Connected to {}", self.url);
                Ok(())
            }
            Err(e) => {
                log::error!("[HubConnection] Failed to start the connection: {}", e);
                Err(e)
            }
        }
    }

    async fn stop(self: &Arc<Self>) -> Result<(), HubError> {
        let (connecting, session, start_done) = {
            let mut lc = self.lifecycle();
            if self.state() == ConnectionState::Stopped && !lc.starting {
                return Ok(());
            }
            if lc.stopping {
                (None, None, None)
            } else {
                lc.stopping = true;
                lc.reconnect_cancel.cancel();
                (
                    lc.connecting.clone(),
                    lc.session.clone(),
                    lc.start_done.clone(),
                )
            }
        };

        log::info!("[HubConnection] Stopping connection");
        if let Some(attempt) = connecting {
            if let Err(e) = attempt.transport.stop(None).await {
                log::debug!("[HubConnection] Stopping pending transport failed: {}", e);
            }
        }
        if let Some(mut start_done) = start_done {
            let _ = start_done.wait_for(|done| *done).await;
        }
        if let Some(session) = session {
            session.flush(STOP_FLUSH_TIMEOUT).await;
            if let Err(e) = session.transport.stop(None).await {
                log::warn!("[HubConnection] Stopping transport failed: {}", e);
            }
        }

        let mut state = self.state_tx.subscribe();
        let _ = state
            .wait_for(|state| *state == ConnectionState::Stopped)
            .await;
        Ok(())
    }

    // ========================================================================
    // Connect and handshake
    // ========================================================================

    /// Create a transport, connect it and complete the handshake. On success
    /// the session is committed and the connection is `Connected`.
    async fn connect_and_handshake(self: &Arc<Self>, reconnecting: bool) -> Result<(), HubError> {
        let version = self.protocol.version();
        if version != SUPPORTED_HANDSHAKE_VERSION {
            return Err(HubError::UnsupportedHandshakeVersion(version));
        }

        let transport = self.transport_factory.create()?;
        let (handshake_tx, handshake_rx) = oneshot::channel();
        let session = {
            let mut lc = self.lifecycle();
            if lc.stopping {
                return Err(stopped_during_connect());
            }
            let session = Arc::new(Session::new(
                transport,
                Arc::clone(&lc.buffer),
                handshake_tx,
            ));
            lc.connecting = Some(Arc::clone(&session));
            session
        };

        let outcome = self.handshake(&session, reconnecting, handshake_rx).await;

        let committed = {
            let mut lc = self.lifecycle();
            if lc
                .connecting
                .as_ref()
                .is_some_and(|pending| Arc::ptr_eq(pending, &session))
            {
                lc.connecting = None;
            }
            match outcome {
                Ok(()) if lc.stopping || session.closed.load(Ordering::SeqCst) => {
                    Err(stopped_during_connect())
                }
                Ok(()) => {
                    lc.session = Some(Arc::clone(&session));
                    lc.connection_id = session.transport.connection_id();
                    self.state_tx.send_replace(ConnectionState::Connected);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };

        if let Err(e) = committed {
            session.cancel.cancel();
            if let Err(stop_error) = session.transport.stop(None).await {
                log::debug!("[HubConnection] Transport stop failed: {}", stop_error);
            }
            return Err(e);
        }

        tokio::spawn(run_sender(Arc::clone(&session)));
        tokio::spawn(run_liveness(
            Arc::downgrade(self),
            session,
            self.options.server_timeout,
            self.options.keep_alive_interval,
        ));
        Ok(())
    }

    async fn handshake(
        self: &Arc<Self>,
        session: &Arc<Session>,
        reconnecting: bool,
        response: oneshot::Receiver<Result<(), HubError>>,
    ) -> Result<(), HubError> {
        self.attach(session);
        let transport = &session.transport;
        transport
            .connect(&self.url, self.protocol.transfer_format())
            .await?;

        let stateful = self.options.stateful_reconnect && transport.supports_stateful_reconnect();
        session.stateful.store(stateful, Ordering::SeqCst);

        log::debug!("[HubConnection] Sending handshake request");
        let request = handshake::write_request(&HandshakeRequest {
            protocol: self.protocol.name().to_string(),
            version: self.protocol.version(),
        })?;
        transport.send(Payload::Text(request)).await?;
        session.touch_sent();

        let outcome = match tokio::time::timeout(self.options.handshake_timeout, response).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_dropped)) => Err(HubError::aborted()),
            Err(_elapsed) => Err(HubError::Timeout("Handshake timed out.".to_string())),
        };
        if let Err(e) = outcome {
            log::error!("[HubConnection] Handshake failed: {}", e);
            return Err(e);
        }
        log::debug!("[HubConnection] Server handshake complete");

        if reconnecting {
            if stateful {
                let replay_from = session.buffer.replay_start_id();
                log::debug!("[HubConnection] Replaying from sequence id {}", replay_from);
                self.send_direct(
                    session,
                    &HubMessage::Sequence(SequenceMessage {
                        sequence_id: replay_from,
                    }),
                )
                .await?;
            }
            session.buffer.reset_dequeue();
        }
        Ok(())
    }

    /// Route the transport's callbacks to this connection.
    fn attach(self: &Arc<Self>, session: &Arc<Session>) {
        let inner = Arc::downgrade(self);
        let weak_session = Arc::downgrade(session);
        session.transport.on_receive(Arc::new(move |payload| {
            let inner = inner.clone();
            let session = weak_session.clone();
            async move {
                if let (Some(inner), Some(session)) = (inner.upgrade(), session.upgrade()) {
                    inner.handle_receive(&session, &payload);
                }
            }
            .boxed()
        }));

        let inner = Arc::downgrade(self);
        let weak_session = Arc::downgrade(session);
        session.transport.on_close(Arc::new(move |error| {
            let inner = inner.clone();
            let session = weak_session.clone();
            async move {
                if let (Some(inner), Some(session)) = (inner.upgrade(), session.upgrade()) {
                    inner.handle_transport_close(session, error);
                }
            }
            .boxed()
        }));
    }

    // ========================================================================
    // Receive path
    // ========================================================================

    fn handle_receive(self: &Arc<Self>, session: &Arc<Session>, payload: &Payload) {
        session.touch_received();

        if session.handshake_done.load(Ordering::SeqCst) {
            self.process_payload(session, payload);
            return;
        }

        match handshake::parse_response(payload) {
            Err(e) => {
                log::error!("[HubConnection] Error parsing handshake response: {}", e);
                session.resolve_handshake(Err(e));
            }
            Ok((response, _)) if response.error.is_some() => {
                let message = response.error.unwrap_or_default();
                log::error!("[HubConnection] Server returned handshake error: {}", message);
                session.resolve_handshake(Err(HubError::HandshakeError(message)));
            }
            Ok((_, remaining)) => {
                session.handshake_done.store(true, Ordering::SeqCst);
                session.resolve_handshake(Ok(()));
                if let Some(remaining) = remaining {
                    self.process_payload(session, &remaining);
                }
            }
        }
    }

    fn process_payload(self: &Arc<Self>, session: &Arc<Session>, payload: &Payload) {
        let messages = match self.protocol.parse_messages(payload, &*self.registry) {
            Ok(messages) => messages,
            Err(e) => {
                log::error!("[HubConnection] Failed to parse messages: {}", e);
                session.fail(e);
                return;
            }
        };

        for message in messages {
            if session.is_stateful()
                && message.is_sequenced()
                && !self.receive_sequence().should_process()
            {
                log::trace!("[HubConnection] Dropping replayed message");
                continue;
            }

            match message {
                HubMessage::Invocation(invocation) => self.dispatcher.dispatch(self, invocation),
                HubMessage::StreamItem(item) => self.calls.stream_item(item),
                HubMessage::Completion(completion) => self.calls.complete(completion),
                HubMessage::Ping => {}
                HubMessage::Close(close) => {
                    log::info!("[HubConnection] Close message received from server");
                    if close.allow_reconnect != Some(true) {
                        session.no_reconnect.store(true, Ordering::SeqCst);
                    }
                    let error = close.error.map(|error| {
                        HubError::ConnectionAborted(format!(
                            "Server returned an error on close: {error}"
                        ))
                    });
                    session.stop_in_background(error);
                    return;
                }
                HubMessage::Ack(ack) if session.is_stateful() => {
                    if let Err(e) = session.buffer.ack(ack.sequence_id) {
                        log::error!("[HubConnection] Invalid ack from server: {}", e);
                        session.fail(e);
                        return;
                    }
                }
                HubMessage::Sequence(sequence) if session.is_stateful() => {
                    if let Err(e) = self.receive_sequence().reset_to(sequence.sequence_id) {
                        log::error!("[HubConnection] Invalid sequence from server: {}", e);
                        session.fail(e);
                        return;
                    }
                }
                other => {
                    log::warn!(
                        "[HubConnection] Ignoring unexpected message of type {}",
                        other.message_type()
                    );
                }
            }
        }
    }

    // ========================================================================
    // Close path
    // ========================================================================

    fn handle_transport_close(self: Arc<Self>, session: Arc<Session>, error: Option<HubError>) {
        session.closed.store(true, Ordering::SeqCst);
        session.cancel.cancel();

        let during_handshake = HubError::ConnectionAborted(match &error {
            Some(e) => format!("The connection was closed before the handshake completed: {e}"),
            None => "The connection was closed before the handshake completed.".to_string(),
        });
        if session.resolve_handshake(Err(during_handshake)) {
            return;
        }

        tokio::spawn(async move { self.handle_close(session, error).await });
    }

    async fn handle_close(self: Arc<Self>, session: Arc<Session>, error: Option<HubError>) {
        let reconnect = {
            let mut lc = self.lifecycle();
            if !lc
                .session
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, &session))
            {
                return;
            }
            lc.session = None;

            let give_up = lc.stopping || session.no_reconnect.load(Ordering::SeqCst);
            let first_delay = match &self.retry_policy {
                Some(policy) if !give_up => policy.next_retry_interval(0),
                _ => None,
            };
            if first_delay.is_some() {
                self.state_tx.send_replace(ConnectionState::Reconnecting);
            }
            first_delay.map(|delay| (delay, lc.reconnect_cancel.clone()))
        };

        let Some((first_delay, cancel)) = reconnect else {
            let error = if self.lifecycle().stopping { None } else { error };
            self.finalize(error);
            return;
        };

        if !session.is_stateful() {
            self.calls
                .fail_all(&error.clone().unwrap_or_else(HubError::aborted));
        }
        match &error {
            Some(e) => log::warn!("[HubConnection] Connection lost ({}), reconnecting", e),
            None => log::warn!("[HubConnection] Connection lost, reconnecting"),
        }
        for handler in snapshot(&self.reconnecting_handlers) {
            handler(error.clone());
        }

        self.reconnect(first_delay, cancel, error).await;
    }

    async fn reconnect(
        self: Arc<Self>,
        first_delay: Duration,
        cancel: CancellationToken,
        mut last_error: Option<HubError>,
    ) {
        let mut retry_count: u32 = 0;
        let mut delay = first_delay;
        loop {
            if cancel.is_cancelled() {
                log::debug!("[HubConnection] Reconnect cancelled");
                self.finalize(None);
                return;
            }
            log::info!("[HubConnection] Reconnect attempt {}", retry_count + 1);

            match self.connect_and_handshake(true).await {
                Ok(()) => {
                    let connection_id = self.lifecycle().connection_id.clone();
                    log::info!(
                        "[HubConnection] Reconnected after {} attempt(s)",
                        retry_count + 1
                    );
                    for handler in snapshot(&self.reconnected_handlers) {
                        handler(connection_id.clone());
                    }
                    return;
                }
                Err(e) => {
                    log::warn!("[HubConnection] Reconnect attempt failed: {}", e);
                    if self.lifecycle().stopping {
                        self.finalize(None);
                        return;
                    }
                    last_error = Some(e);
                }
            }

            log::debug!("[HubConnection] Next reconnect attempt in {:?}", delay);
            tokio::select! {
                () = cancel.cancelled() => {
                    log::debug!("[HubConnection] Reconnect cancelled");
                    self.finalize(None);
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }

            retry_count += 1;
            let next = self
                .retry_policy
                .as_ref()
                .and_then(|policy| policy.next_retry_interval(retry_count));
            let Some(next) = next else {
                log::info!(
                    "[HubConnection] Reconnect retries exhausted after {} attempt(s)",
                    retry_count
                );
                self.finalize(last_error);
                return;
            };
            delay = next;
        }
    }

    /// Terminal transition to `Stopped`.
    fn finalize(&self, error: Option<HubError>) {
        let buffer = {
            let mut lc = self.lifecycle();
            lc.session = None;
            lc.connecting = None;
            lc.connection_id = None;
            self.state_tx.send_replace(ConnectionState::Stopped);
            Arc::clone(&lc.buffer)
        };
        buffer.close();
        self.calls
            .fail_all(&error.clone().unwrap_or_else(HubError::aborted));

        match &error {
            Some(e) => log::info!("[HubConnection] Connection closed with an error: {}", e),
            None => log::info!("[HubConnection] Connection closed"),
        }
        for handler in snapshot(&self.closed_handlers) {
            handler(error.clone());
        }
    }

    // ========================================================================
    // Send path
    // ========================================================================

    /// Encode a sequenced message and queue it for the sender loop.
    pub(crate) async fn send_hub_message(&self, message: &HubMessage) -> Result<(), HubError> {
        let buffer = {
            let lc = self.lifecycle();
            if !matches!(
                self.state(),
                ConnectionState::Connected | ConnectionState::Reconnecting
            ) {
                return Err(HubError::InvalidOperation(
                    "Cannot send data if the connection is not in the 'Connected' or \
                     'Reconnecting' state."
                        .to_string(),
                ));
            }
            Arc::clone(&lc.buffer)
        };
        let payload = self.protocol.write_message(message)?;
        buffer.enqueue(payload).await
    }

    /// Write a control message straight to the transport, bypassing the buffer.
    async fn send_direct(&self, session: &Session, message: &HubMessage) -> Result<(), HubError> {
        let payload = self.protocol.write_message(message)?;
        session.transport.send(payload).await?;
        session.touch_sent();
        Ok(())
    }

    pub(crate) async fn cancel_stream(&self, invocation_id: &str) -> Result<(), HubError> {
        if self.calls.remove(invocation_id).is_none() {
            return Ok(());
        }
        log::debug!("[HubConnection] Cancelling stream {}", invocation_id);
        self.send_hub_message(&HubMessage::CancelInvocation(CancelInvocationMessage {
            invocation_id: invocation_id.to_string(),
            headers: None,
        }))
        .await
    }
}

impl Drop for HubInner {
    fn drop(&mut self) {
        let lc = self
            .lifecycle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        lc.buffer.close();
        lc.reconnect_cancel.cancel();
        let sessions = lc.session.take().into_iter().chain(lc.connecting.take());
        let runtime = tokio::runtime::Handle::try_current().ok();
        for session in sessions {
            session.cancel.cancel();
            if let Some(runtime) = &runtime {
                let transport = Arc::clone(&session.transport);
                runtime.spawn(async move {
                    let _ = transport.stop(None).await;
                });
            }
        }
    }
}

fn stopped_during_connect() -> HubError {
    HubError::ConnectionAborted("The connection was stopped during negotiation.".to_string())
}

fn snapshot<T: Clone>(handlers: &Mutex<Vec<T>>) -> Vec<T> {
    handlers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

// ============================================================================
// Session tasks
// ============================================================================

/// Drain the buffer into the session's transport until the session ends.
async fn run_sender(session: Arc<Session>) {
    loop {
        let ready = tokio::select! {
            biased;
            () = session.cancel.cancelled() => false,
            ready = session.buffer.wait_to_dequeue() => ready,
        };
        if !ready {
            return;
        }

        while let Some(payload) = session.buffer.try_dequeue() {
            let sent = session.buffer.last_sent_sequence_id();
            if session.cancel.is_cancelled() {
                return;
            }
            if let Err(e) = session.transport.send(payload).await {
                log::warn!("[HubConnection] Send failed: {}", e);
                session.stop_in_background(Some(e));
                return;
            }
            session.touch_sent();
            session.transmitted.send_replace(sent);

            // Without server acks the transport accepting the frame is the ack.
            if !session.is_stateful() {
                if let Err(e) = session.buffer.ack(sent) {
                    log::error!("[HubConnection] Local ack failed: {}", e);
                    session.fail(e);
                    return;
                }
            }
        }
    }
}

/// Server timeout, keep-alive pings and stateful acks for one session.
async fn run_liveness(
    inner: Weak<HubInner>,
    session: Arc<Session>,
    server_timeout: Duration,
    keep_alive: Duration,
) {
    let tick = LIVENESS_TICK
        .min(server_timeout / 4)
        .min(keep_alive / 2)
        .max(Duration::from_millis(10));
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = session.cancel.cancelled() => return,
            _ = interval.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            return;
        };

        if session.since_received() >= server_timeout {
            log::warn!(
                "[HubConnection] No message from the server for {:?}, closing",
                server_timeout
            );
            let error = HubError::Timeout(
                "Server timeout elapsed without receiving a message from the server.".to_string(),
            );
            if let Err(e) = session.transport.stop(Some(error)).await {
                log::debug!("[HubConnection] Transport stop failed: {}", e);
            }
            return;
        }

        if session.is_stateful() {
            let pending = inner.receive_sequence().take_pending_ack();
            if let Some(sequence_id) = pending {
                let ack = HubMessage::Ack(AckMessage { sequence_id });
                if let Err(e) = inner.send_direct(&session, &ack).await {
                    log::debug!("[HubConnection] Failed to send ack: {}", e);
                }
            }
        }

        if session.since_sent() >= keep_alive {
            log::trace!("[HubConnection] Sending keep-alive ping");
            if let Err(e) = inner.send_direct(&session, &HubMessage::Ping).await {
                log::debug!("[HubConnection] Failed to send ping: {}", e);
            }
        }
    }
}

// ============================================================================
// Public handle
// ============================================================================

/// Client connection to a hub.
///
/// Cheap to clone; clones share one connection. Build one with
/// [`HubConnection::builder`].
///
/// ```no_run
/// # async fn demo() -> Result<(), hubrpc::HubError> {
/// use hubrpc::HubConnection;
///
/// let connection = HubConnection::builder()
///     .with_url("http://localhost:5000/chat")
///     .with_automatic_reconnect()
///     .build()?;
///
/// connection.on("ReceiveMessage", |(user, text): (String, String)| async move {
///     println!("{user}: {text}");
/// });
/// connection.start().await?;
/// let echoed: String = connection.invoke("Echo", ("hello",)).await?;
/// # let _ = echoed;
/// connection.stop().await
/// # }
/// ```
#[derive(Clone)]
pub struct HubConnection {
    inner: Arc<HubInner>,
}

impl std::fmt::Debug for HubConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubConnection")
            .field("url", &self.inner.url)
            .field("state", &self.inner.state())
            .field("protocol", &self.inner.protocol.name())
            .finish_non_exhaustive()
    }
}

impl HubConnection {
    /// Start configuring a connection.
    pub fn builder() -> HubConnectionBuilder {
        HubConnectionBuilder::new()
    }

    pub(crate) fn from_parts(
        url: String,
        protocol: Arc<dyn HubProtocol>,
        transport_factory: Arc<dyn TransportFactory>,
        retry_policy: Option<Arc<dyn RetryPolicy>>,
        options: HubConnectionOptions,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Stopped);
        let buffer = Arc::new(MessageBuffer::new(options.max_buffer_size));
        Self {
            inner: Arc::new(HubInner {
                url,
                protocol,
                transport_factory,
                retry_policy,
                options,
                registry: Arc::new(InvocationRegistry::new()),
                dispatcher: Dispatcher::default(),
                calls: PendingCalls::default(),
                state_tx,
                lifecycle: Mutex::new(Lifecycle {
                    starting: false,
                    stopping: false,
                    start_done: None,
                    connecting: None,
                    session: None,
                    buffer,
                    reconnect_cancel: CancellationToken::new(),
                    connection_id: None,
                }),
                receive_sequence: Mutex::new(ReceiveSequence::new()),
                closed_handlers: Mutex::new(Vec::new()),
                reconnecting_handlers: Mutex::new(Vec::new()),
                reconnected_handlers: Mutex::new(Vec::new()),
                invocation_ids: AtomicU64::new(0),
            }),
        }
    }

    /// Connect and complete the handshake.
    ///
    /// Fails with [`HubError::InvalidOperation`] unless the connection is
    /// `Stopped` with no other start in flight.
    pub async fn start(&self) -> Result<(), HubError> {
        self.inner.start().await
    }

    /// Close the connection. Resolves once it is `Stopped`.
    ///
    /// Concurrent calls share one shutdown. Stopping a stopped connection
    /// is a no-op.
    pub async fn stop(&self) -> Result<(), HubError> {
        self.inner.stop().await
    }

    /// Call a hub method without waiting for a result.
    ///
    /// Resolves once the message is buffered for sending.
    pub async fn send<A: IntoArguments>(&self, method: &str, arguments: A) -> Result<(), HubError> {
        let message = HubMessage::Invocation(InvocationMessage {
            invocation_id: None,
            target: method.to_string(),
            arguments: arguments.into_arguments()?,
            stream_ids: None,
            headers: None,
        });
        self.inner.send_hub_message(&message).await
    }

    /// Call a hub method and wait for its result.
    ///
    /// A method that returns nothing decodes as JSON `null`, so `R = ()`
    /// works for void methods.
    pub async fn invoke<R, A>(&self, method: &str, arguments: A) -> Result<R, HubError>
    where
        R: DeserializeOwned,
        A: IntoArguments,
    {
        let arguments = arguments.into_arguments()?;
        let invocation_id = self.inner.next_invocation_id();
        let (tx, rx) = oneshot::channel();
        self.inner
            .calls
            .insert(invocation_id.clone(), PendingCall::Invoke(tx));

        let message = HubMessage::Invocation(InvocationMessage {
            invocation_id: Some(invocation_id.clone()),
            target: method.to_string(),
            arguments,
            stream_ids: None,
            headers: None,
        });
        if let Err(e) = self.inner.send_hub_message(&message).await {
            self.inner.calls.remove(&invocation_id);
            return Err(e);
        }

        let result = rx.await.map_err(|_closed| HubError::aborted())??;
        Ok(serde_json::from_value(result.unwrap_or(Value::Null))?)
    }

    /// Call a streaming hub method.
    pub async fn stream<T, A>(&self, method: &str, arguments: A) -> Result<HubStream<T>, HubError>
    where
        T: DeserializeOwned,
        A: IntoArguments,
    {
        let arguments = arguments.into_arguments()?;
        let invocation_id = self.inner.next_invocation_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .calls
            .insert(invocation_id.clone(), PendingCall::Stream(tx));

        let message = HubMessage::StreamInvocation(StreamInvocationMessage {
            invocation_id: invocation_id.clone(),
            target: method.to_string(),
            arguments,
            stream_ids: None,
            headers: None,
        });
        if let Err(e) = self.inner.send_hub_message(&message).await {
            self.inner.calls.remove(&invocation_id);
            return Err(e);
        }
        Ok(HubStream::new(invocation_id, rx, Arc::downgrade(&self.inner)))
    }

    /// Register the handler the hub calls for `method`.
    ///
    /// The handler's argument tuple fixes how many arguments it takes and how
    /// they decode. Returning `Result<T, E>` answers client-result invocations.
    pub fn on<A, F, Fut>(&self, method: &str, handler: F)
    where
        A: FromArguments,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: HandlerOutput,
    {
        self.inner.registry.register(method, handler);
    }

    /// Remove the handler for `method`. Returns whether one was registered.
    pub fn off(&self, method: &str) -> bool {
        self.inner.registry.remove(method)
    }

    /// Called once each time the connection stops for good, with the error
    /// that ended it.
    pub fn on_closed<F>(&self, handler: F)
    where
        F: Fn(Option<HubError>) + Send + Sync + 'static,
    {
        self.inner
            .closed_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Called when the connection is lost and reconnecting begins.
    pub fn on_reconnecting<F>(&self, handler: F)
    where
        F: Fn(Option<HubError>) + Send + Sync + 'static,
    {
        self.inner
            .reconnecting_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Called after a successful reconnect with the new connection id.
    pub fn on_reconnected<F>(&self, handler: F)
    where
        F: Fn(Option<String>) + Send + Sync + 'static,
    {
        self.inner
            .reconnected_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Connection id assigned during negotiation, while connected.
    pub fn connection_id(&self) -> Option<String> {
        self.inner.lifecycle().connection_id.clone()
    }

    /// Hub URL this connection targets.
    pub fn url(&self) -> &str {
        &self.inner.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "Reconnecting");
        assert_eq!(ConnectionState::Stopped.as_str(), "Stopped");
    }

    #[test]
    fn test_session_handshake_resolves_once() {
        struct Idle;

        #[async_trait::async_trait]
        impl Transport for Idle {
            async fn connect(
                &self,
                _url: &str,
                _format: crate::protocol::TransferFormat,
            ) -> Result<(), HubError> {
                Ok(())
            }
            async fn send(&self, _payload: Payload) -> Result<(), HubError> {
                Ok(())
            }
            async fn stop(&self, _error: Option<HubError>) -> Result<(), HubError> {
                Ok(())
            }
            fn on_receive(&self, _handler: crate::transport::ReceiveHandler) {}
            fn on_close(&self, _handler: crate::transport::CloseHandler) {}
        }

        let (tx, mut rx) = oneshot::channel();
        let session = Session::new(Arc::new(Idle), Arc::new(MessageBuffer::new(10)), tx);
        assert!(session.resolve_handshake(Ok(())));
        assert!(!session.resolve_handshake(Err(HubError::aborted())));
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }
}
