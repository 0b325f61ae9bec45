//! Caller-side handle for a dispatched operation.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use remq_core::{RemqError, RespValue, Result};
use tokio::sync::oneshot;

use super::dispatcher::CommandDispatcher;
use super::registry::{DispatchId, Outcome, PendingOperation};

/// Turns the server reply into the caller's type. `None` means the deadline
/// passed without a reply.
pub(crate) type ReplyMapper<T> = Box<dyn FnOnce(Option<RespValue>) -> Result<T> + Send>;

/// Handle to an operation that has been registered and handed to the dispatcher.
///
/// Awaiting the handle yields the result. Dropping it before the operation
/// resolves cancels the operation.
pub struct OperationHandle<T> {
    operation: Arc<PendingOperation>,
    receiver: oneshot::Receiver<Outcome>,
    dispatcher: CommandDispatcher,
    mapper: Option<ReplyMapper<T>>,
}

impl<T> OperationHandle<T> {
    pub(crate) fn new(
        operation: Arc<PendingOperation>,
        receiver: oneshot::Receiver<Outcome>,
        dispatcher: CommandDispatcher,
        mapper: ReplyMapper<T>,
    ) -> Self {
        Self {
            operation,
            receiver,
            dispatcher,
            mapper: Some(mapper),
        }
    }

    /// Returns the dispatch identifier of the operation.
    pub fn id(&self) -> DispatchId {
        self.operation.id()
    }

    /// Returns `true` once the operation has resolved, whatever the outcome.
    pub fn is_done(&self) -> bool {
        self.operation.is_terminal()
    }

    /// Cancels the operation.
    ///
    /// Returns `false` if it had already resolved. A blocking command already
    /// parked on the server is released in the background.
    pub fn cancel(&self) -> bool {
        self.dispatcher.cancel(self.operation.id())
    }

    /// Waits up to `timeout` for the operation to resolve, without consuming the
    /// result. Returns `true` if it resolved in time.
    pub async fn await_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.operation.resolved())
            .await
            .is_ok()
    }

    /// Waits for the result.
    pub async fn get(self) -> Result<T> {
        self.await
    }
}

impl<T> Future for OperationHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.mapper.is_none() {
            return Poll::Ready(Err(RemqError::Protocol(
                "operation handle polled after completion".to_string(),
            )));
        }

        let outcome = match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(outcome) => outcome,
        };
        let Some(mapper) = this.mapper.take() else {
            return Poll::Ready(Err(RemqError::Shutdown));
        };

        Poll::Ready(match outcome {
            Ok(Outcome::Reply(value)) => mapper(Some(value)),
            Ok(Outcome::TimedOut) => mapper(None),
            Ok(Outcome::Canceled) => Err(RemqError::Canceled),
            Ok(Outcome::Failed(e)) => Err(e),
            Err(_) => Err(RemqError::Shutdown),
        })
    }
}

impl<T> Drop for OperationHandle<T> {
    fn drop(&mut self) {
        if !self.operation.is_terminal() {
            self.dispatcher.cancel(self.operation.id());
        }
    }
}

impl<T> fmt::Debug for OperationHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationHandle")
            .field("operation", &self.operation)
            .finish()
    }
}
