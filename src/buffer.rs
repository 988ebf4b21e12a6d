//! Outbound message buffer with backpressure and replay.
//!
//! Every sequenced message the connection sends goes through a
//! [`MessageBuffer`] before it reaches a transport. A single sender loop pulls
//! items out in id order; items stay in the buffer until they are
//! acknowledged, so after a reconnect the loop can rewind and replay whatever
//! the server never confirmed.
//!
//! # Protocol
//!
//! ```text
//! producer            MessageBuffer                 sender loop
//!    │  enqueue(m1) ──>  [1]                              │
//!    │  enqueue(m2) ──>  [1, 2]        wait_to_dequeue ──>│
//!    │                   [1, 2]  <──── try_dequeue (m1)   │
//!    │                   [1, 2]  <──── try_dequeue (m2)   │
//!    │     (connection drops, server acked 1)             │
//!    │  ack(1)      ──>  [2]                              │
//!    │  reset_dequeue ─> [2]   <──── try_dequeue (m2 again)
//! ```
//!
//! # Backpressure
//!
//! Once the bytes held by the buffer exceed the configured budget, `enqueue`
//! still stores the message but suspends the producer. A producer is released
//! when its item is acknowledged, or when an ack frees enough space that the
//! cumulative size of the remaining items up to and including its own fits the
//! budget again. This is the same rule enqueue applies, so relief is
//! proportional to the space an ack frees.
//!
//! The receive side of sequencing lives here too: [`ReceiveSequence`] tracks
//! which inbound messages were already processed so replays are dropped.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::error::HubError;
use crate::protocol::Payload;

/// A payload waiting in the buffer.
#[derive(Debug)]
struct BufferedItem {
    payload: Payload,
    size: usize,
    /// Monotonic id, starting at 1 in enqueue order.
    id: i64,
    /// Held while the producer is suspended by backpressure.
    release: Option<oneshot::Sender<()>>,
}

#[derive(Debug, Default)]
struct BufferState {
    items: VecDeque<BufferedItem>,
    buffered_bytes: usize,
    total_count: i64,
    last_sent_id: i64,
    /// Index into `items` of the next item to hand to the sender loop.
    next_send: usize,
    dequeue_waiters: Vec<oneshot::Sender<bool>>,
    closed: bool,
}

impl BufferState {
    fn wake_dequeuers(&mut self, available: bool) {
        for waiter in self.dequeue_waiters.drain(..) {
            let _ = waiter.send(available);
        }
    }
}

/// Backpressure-aware outbound queue with acknowledgment and replay.
#[derive(Debug)]
pub struct MessageBuffer {
    max_buffer_size: usize,
    state: Mutex<BufferState>,
}

impl MessageBuffer {
    /// Create a buffer that suspends producers above `max_buffer_size` bytes.
    #[must_use]
    pub fn new(max_buffer_size: usize) -> Self {
        Self {
            max_buffer_size,
            state: Mutex::new(BufferState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a payload.
    ///
    /// Returns once the payload is stored, unless the buffer is over budget,
    /// in which case the caller is suspended until acknowledgments make room.
    pub async fn enqueue(&self, payload: Payload) -> Result<(), HubError> {
        let waiter = {
            let mut state = self.state();
            if state.closed {
                return Err(HubError::InvalidOperation(
                    "Message buffer has closed".to_string(),
                ));
            }

            let size = payload.len();
            state.buffered_bytes += size;
            state.total_count += 1;
            let id = state.total_count;

            let (release, waiter) = if state.buffered_bytes > self.max_buffer_size {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            } else {
                (None, None)
            };

            state.items.push_back(BufferedItem {
                payload,
                size,
                id,
                release,
            });
            state.wake_dequeuers(true);
            waiter
        };

        if let Some(waiter) = waiter {
            log::debug!(
                "[MessageBuffer] Over budget of {} bytes, waiting for acknowledgments",
                self.max_buffer_size
            );
            waiter.await.map_err(|_closed| {
                HubError::ConnectionAborted(
                    "Message buffer closed before the message was acknowledged.".to_string(),
                )
            })?;
        }
        Ok(())
    }

    /// Acknowledge every item with an id up to and including `sequence_id`.
    ///
    /// Returns `Ok(false)` without touching anything when the id is not
    /// positive or lies beyond the last id handed to the sender loop. An
    /// acknowledgment that would move the send cursor below zero is reported
    /// as an error and leaves the buffer untouched; the caller must treat it
    /// as fatal.
    pub fn ack(&self, sequence_id: i64) -> Result<bool, HubError> {
        let mut guard = self.state();
        let state = &mut *guard;

        if sequence_id <= 0 || sequence_id > state.last_sent_id {
            return Ok(false);
        }

        let acked = state
            .items
            .iter()
            .take_while(|item| item.id <= sequence_id)
            .count();
        if acked > state.next_send {
            return Err(HubError::InvalidOperation(format!(
                "Acknowledging {} message(s) would move the send cursor ({}) below zero",
                acked, state.next_send
            )));
        }

        for item in state.items.drain(..acked) {
            state.buffered_bytes -= item.size;
            if let Some(release) = item.release {
                let _ = release.send(());
            }
        }
        state.next_send -= acked;

        let mut cumulative = 0;
        for item in &mut state.items {
            cumulative += item.size;
            if cumulative > self.max_buffer_size {
                break;
            }
            if let Some(release) = item.release.take() {
                let _ = release.send(());
            }
        }

        Ok(true)
    }

    /// Wait until an unsent item is available.
    ///
    /// Returns `false` once the buffer is closed.
    pub async fn wait_to_dequeue(&self) -> bool {
        let waiter = {
            let mut state = self.state();
            if state.next_send < state.items.len() {
                return true;
            }
            if state.closed {
                return false;
            }
            let (tx, rx) = oneshot::channel();
            state.dequeue_waiters.push(tx);
            rx
        };
        waiter.await.unwrap_or(false)
    }

    /// Take the next unsent payload, if any, and record its id as sent.
    pub fn try_dequeue(&self) -> Option<Payload> {
        let mut guard = self.state();
        let state = &mut *guard;

        let item = state.items.get(state.next_send)?;
        let id = item.id;
        let payload = item.payload.clone();
        state.next_send += 1;
        state.last_sent_id = id;
        Some(payload)
    }

    /// Rewind the send cursor to the oldest unacknowledged item.
    ///
    /// Called once per successful reconnect, before replay starts.
    pub fn reset_dequeue(&self) {
        let mut state = self.state();
        state.next_send = 0;
        state.last_sent_id = state.items.front().map_or(0, |item| item.id);
        state.wake_dequeuers(true);
    }

    /// Close the buffer, ending the sender loop and failing suspended producers.
    pub fn close(&self) {
        let mut state = self.state();
        state.closed = true;
        state.wake_dequeuers(false);
        for item in &mut state.items {
            item.release.take();
        }
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Number of unacknowledged items.
    pub fn len(&self) -> usize {
        self.state().items.len()
    }

    /// Whether every item has been acknowledged.
    pub fn is_empty(&self) -> bool {
        self.state().items.is_empty()
    }

    /// Bytes held by unacknowledged items.
    pub fn buffered_bytes(&self) -> usize {
        self.state().buffered_bytes
    }

    /// Id of the item most recently handed to the sender loop (0 if none).
    pub fn last_sent_sequence_id(&self) -> i64 {
        self.state().last_sent_id
    }

    /// Id of the oldest unacknowledged item.
    pub fn first_pending_id(&self) -> Option<i64> {
        self.state().items.front().map(|item| item.id)
    }

    /// Id of the newest unacknowledged item.
    pub fn last_pending_id(&self) -> Option<i64> {
        self.state().items.back().map(|item| item.id)
    }

    /// Id announced in the `Sequence` message after a reconnect: the oldest
    /// unacknowledged item, or the next id to be assigned when none is left.
    pub fn replay_start_id(&self) -> i64 {
        let state = self.state();
        state
            .items
            .front()
            .map_or(state.total_count + 1, |item| item.id)
    }
}

/// Receive-side sequencing for stateful reconnect.
///
/// Every sequenced inbound message gets the next id. After a reconnect the
/// server announces where its replay starts; ids at or below the latest one
/// already processed are duplicates.
#[derive(Debug)]
pub struct ReceiveSequence {
    next_receiving_id: i64,
    latest_received_id: i64,
    last_acked_id: i64,
}

impl Default for ReceiveSequence {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveSequence {
    /// Start counting from id 1.
    pub fn new() -> Self {
        Self {
            next_receiving_id: 1,
            latest_received_id: 0,
            last_acked_id: 0,
        }
    }

    /// Assign the next id to an inbound sequenced message.
    ///
    /// Returns `false` when the message is a replay that was already processed.
    pub fn should_process(&mut self) -> bool {
        let current = self.next_receiving_id;
        self.next_receiving_id += 1;
        if current <= self.latest_received_id {
            return false;
        }
        self.latest_received_id = current;
        true
    }

    /// Apply a `Sequence` message: the next inbound message carries `sequence_id`.
    pub fn reset_to(&mut self, sequence_id: i64) -> Result<(), HubError> {
        if sequence_id > self.next_receiving_id {
            return Err(HubError::InvalidData(
                "Sequence ID greater than amount of messages we've received.".to_string(),
            ));
        }
        self.next_receiving_id = sequence_id;
        Ok(())
    }

    /// Id to acknowledge, if anything arrived since the last acknowledgment.
    pub fn take_pending_ack(&mut self) -> Option<i64> {
        if self.latest_received_id > self.last_acked_id {
            self.last_acked_id = self.latest_received_id;
            Some(self.latest_received_id)
        } else {
            None
        }
    }
}
