//! Outstanding invocations waiting for the server.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::HubError;
use crate::protocol::{CompletionMessage, StreamItemMessage};

/// Result of an `invoke`: the completion's result, if it carried one.
pub(crate) type InvokeResult = Result<Option<Value>, HubError>;

/// Where the server's answer to an invocation goes.
#[derive(Debug)]
pub(crate) enum PendingCall {
    /// `invoke`: resolved once by the completion.
    Invoke(oneshot::Sender<InvokeResult>),
    /// `stream`: fed by stream items, ended by the completion.
    Stream(mpsc::UnboundedSender<Result<Value, HubError>>),
}

/// Pending calls keyed by invocation id.
#[derive(Debug, Default)]
pub(crate) struct PendingCalls {
    calls: Mutex<HashMap<String, PendingCall>>,
}

impl PendingCalls {
    fn calls(&self) -> MutexGuard<'_, HashMap<String, PendingCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn insert(&self, invocation_id: String, call: PendingCall) {
        self.calls().insert(invocation_id, call);
    }

    pub(crate) fn remove(&self, invocation_id: &str) -> Option<PendingCall> {
        self.calls().remove(invocation_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.calls().len()
    }

    /// Forward a stream item. Unknown ids are logged and dropped.
    pub(crate) fn stream_item(&self, message: StreamItemMessage) {
        let calls = self.calls();
        match calls.get(&message.invocation_id) {
            Some(PendingCall::Stream(items)) => {
                let _ = items.send(Ok(message.item));
            }
            Some(PendingCall::Invoke(_)) => {
                log::warn!(
                    "[HubConnection] Stream item received for non-streaming invocation {}",
                    message.invocation_id
                );
            }
            None => {
                log::debug!(
                    "[HubConnection] Stream item for unknown invocation {}",
                    message.invocation_id
                );
            }
        }
    }

    /// Resolve the call a completion belongs to.
    pub(crate) fn complete(&self, message: CompletionMessage) {
        let Some(call) = self.remove(&message.invocation_id) else {
            log::debug!(
                "[HubConnection] Completion for unknown invocation {}",
                message.invocation_id
            );
            return;
        };

        match call {
            PendingCall::Invoke(waiter) => {
                let outcome = match message.error {
                    Some(error) => Err(HubError::Invocation(error)),
                    None => Ok(message.result),
                };
                let _ = waiter.send(outcome);
            }
            PendingCall::Stream(items) => {
                if let Some(error) = message.error {
                    let _ = items.send(Err(HubError::Invocation(error)));
                }
            }
        }
    }

    /// Fail every pending call with `error`.
    pub(crate) fn fail_all(&self, error: &HubError) {
        let drained: Vec<PendingCall> = self.calls().drain().map(|(_, call)| call).collect();
        if !drained.is_empty() {
            log::debug!(
                "[HubConnection] Failing {} pending invocation(s): {}",
                drained.len(),
                error
            );
        }
        for call in drained {
            match call {
                PendingCall::Invoke(waiter) => {
                    let _ = waiter.send(Err(error.clone()));
                }
                PendingCall::Stream(items) => {
                    let _ = items.send(Err(error.clone()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn completion(id: &str, result: Option<Value>, error: Option<&str>) -> CompletionMessage {
        CompletionMessage {
            invocation_id: id.to_string(),
            result,
            error: error.map(str::to_string),
            headers: None,
        }
    }

    #[tokio::test]
    async fn test_completion_resolves_invoke() {
        let calls = PendingCalls::default();
        let (tx, rx) = oneshot::channel();
        calls.insert("1".to_string(), PendingCall::Invoke(tx));

        calls.complete(completion("1", Some(json!("hi")), None));
        assert_eq!(rx.await.unwrap(), Ok(Some(json!("hi"))));
        assert_eq!(calls.len(), 0);
    }

    #[tokio::test]
    async fn test_error_completion_fails_invoke() {
        let calls = PendingCalls::default();
        let (tx, rx) = oneshot::channel();
        calls.insert("1".to_string(), PendingCall::Invoke(tx));

        calls.complete(completion("1", None, Some("boom")));
        assert_eq!(rx.await.unwrap(), Err(HubError::Invocation("boom".to_string())));
    }

    #[tokio::test]
    async fn test_stream_items_then_completion() {
        let calls = PendingCalls::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        calls.insert("s".to_string(), PendingCall::Stream(tx));

        for n in 0..3 {
            calls.stream_item(StreamItemMessage {
                invocation_id: "s".to_string(),
                item: json!(n),
                headers: None,
            });
        }
        calls.complete(completion("s", None, None));

        for n in 0..3 {
            assert_eq!(rx.recv().await.unwrap().unwrap(), json!(n));
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_fail_all() {
        let calls = PendingCalls::default();
        let (tx, rx) = oneshot::channel();
        calls.insert("1".to_string(), PendingCall::Invoke(tx));

        calls.fail_all(&HubError::aborted());
        assert_eq!(rx.await.unwrap(), Err(HubError::aborted()));
        assert_eq!(calls.len(), 0);
    }
}
