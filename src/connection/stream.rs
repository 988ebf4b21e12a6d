//! Server-to-client streaming results.

use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{ready, Context, Poll};

use futures_util::Stream;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;

use super::HubInner;
use crate::error::HubError;

/// Items produced by a hub method invoked with
/// [`HubConnection::stream`](super::HubConnection::stream).
///
/// Yields each item in order and ends when the server completes the stream.
/// A completion carrying an error is yielded as a final `Err`. Dropping the
/// stream before it ends asks the server to cancel it.
pub struct HubStream<T> {
    invocation_id: String,
    items: mpsc::UnboundedReceiver<Result<Value, HubError>>,
    inner: Weak<HubInner>,
    finished: bool,
    _item: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for HubStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubStream")
            .field("invocation_id", &self.invocation_id)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<T> HubStream<T> {
    pub(super) fn new(
        invocation_id: String,
        items: mpsc::UnboundedReceiver<Result<Value, HubError>>,
        inner: Weak<HubInner>,
    ) -> Self {
        Self {
            invocation_id,
            items,
            inner,
            finished: false,
            _item: PhantomData,
        }
    }

    /// Id of the stream invocation.
    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    /// Stop the stream and tell the server to cancel it.
    pub async fn cancel(mut self) -> Result<(), HubError> {
        self.finished = true;
        match self.inner.upgrade() {
            Some(inner) => inner.cancel_stream(&self.invocation_id).await,
            None => Ok(()),
        }
    }
}

impl<T: DeserializeOwned> Stream for HubStream<T> {
    type Item = Result<T, HubError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match ready!(self.items.poll_recv(cx)) {
            Some(Ok(value)) => {
                Poll::Ready(Some(serde_json::from_value(value).map_err(HubError::from)))
            }
            Some(Err(e)) => {
                self.finished = true;
                Poll::Ready(Some(Err(e)))
            }
            None => {
                self.finished = true;
                Poll::Ready(None)
            }
        }
    }
}

impl<T> Drop for HubStream<T> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::debug!(
                "[HubConnection] Stream {} dropped outside a runtime; not cancelling",
                self.invocation_id
            );
            return;
        };
        let invocation_id = std::mem::take(&mut self.invocation_id);
        runtime.spawn(async move {
            if let Err(e) = inner.cancel_stream(&invocation_id).await {
                log::debug!("[HubConnection] Failed to cancel stream {}: {}", invocation_id, e);
            }
        });
    }
}
