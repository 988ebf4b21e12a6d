//! Ordered dispatch of server-to-client invocations.
//!
//! Each method name gets its own worker task fed by an unbounded queue.
//! Calls to one method run one after another in frame order; different
//! methods run concurrently. Workers are spawned on first use and live as
//! long as the connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::mpsc;

use super::HubInner;
use crate::error::HubError;
use crate::invocation::InvocationRegistry;
use crate::protocol::{CompletionMessage, HubMessage, InvocationMessage};

#[derive(Debug, Default)]
pub(super) struct Dispatcher {
    workers: Mutex<HashMap<String, mpsc::UnboundedSender<InvocationMessage>>>,
}

impl Dispatcher {
    /// Queue `message` on its method's worker.
    pub(super) fn dispatch(&self, inner: &Arc<HubInner>, message: InvocationMessage) {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);

        let message = match workers.get(&message.target) {
            Some(queue) => match queue.send(message) {
                Ok(()) => return,
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };

        let (queue, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(
            Arc::downgrade(inner),
            Arc::clone(&inner.registry),
            receiver,
        ));
        let target = message.target.clone();
        let _ = queue.send(message);
        workers.insert(target, queue);
    }
}

async fn run_worker(
    inner: Weak<HubInner>,
    registry: Arc<InvocationRegistry>,
    mut queue: mpsc::UnboundedReceiver<InvocationMessage>,
) {
    while let Some(message) = queue.recv().await {
        invoke_client_method(&inner, &registry, message).await;
    }
}

async fn invoke_client_method(
    inner: &Weak<HubInner>,
    registry: &InvocationRegistry,
    message: InvocationMessage,
) {
    let InvocationMessage {
        invocation_id,
        target,
        arguments,
        ..
    } = message;

    let outcome = match registry.lookup(&target) {
        Some(entity) => {
            let outcome = entity.call(&target, arguments).await;
            if let Err(e) = &outcome {
                log::error!(
                    "[HubConnection] A callback for the method '{}' threw error '{}'.",
                    target,
                    e
                );
            }
            outcome
        }
        None => {
            log::warn!("[HubConnection] No client method with the name '{}' found.", target);
            Ok(None)
        }
    };

    // Only invocations with an id expect a result back.
    let Some(invocation_id) = invocation_id else {
        return;
    };

    let completion = match outcome {
        Ok(Some(result)) => CompletionMessage {
            invocation_id,
            result: Some(result),
            error: None,
            headers: None,
        },
        Ok(None) => CompletionMessage {
            invocation_id,
            result: None,
            error: Some("Client didn't provide a result.".to_string()),
            headers: None,
        },
        Err(e) => CompletionMessage {
            invocation_id,
            result: None,
            error: Some(match e {
                HubError::Invocation(message) => message,
                other => other.to_string(),
            }),
            headers: None,
        },
    };

    let Some(inner) = inner.upgrade() else {
        return;
    };
    if let Err(e) = inner
        .send_hub_message(&HubMessage::Completion(completion))
        .await
    {
        log::warn!("[HubConnection] Failed to send client result for '{}': {}", target, e);
    }
}

