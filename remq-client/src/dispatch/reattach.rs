//! Re-sends blocking commands interrupted by a connection loss.

use std::sync::Arc;
use std::time::Duration;

use remq_core::RemqError;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::dispatcher::CommandDispatcher;
use super::registry::{OperationState, Outcome, PendingOperation};
use crate::connection::{calculate_backoff_with_jitter, AcquireMode, PoolEvent};

#[derive(Debug)]
struct CoordinatorInner {
    dispatcher: CommandDispatcher,
    shutdown: CancellationToken,
}

/// Watches the pool for lost connections and reattaches the blocking commands
/// that were parked on them.
///
/// A reattached command is written again on a fresh exclusive connection with
/// its server-side wait reduced to the budget left before its deadline. Attempts
/// continue until the command resolves: by a reply, by its deadline, by
/// cancellation or by client shutdown.
#[derive(Debug, Clone)]
pub struct ReattachmentCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl ReattachmentCoordinator {
    /// Starts the coordinator on the current runtime.
    pub(crate) fn start(
        dispatcher: CommandDispatcher,
        handoff: mpsc::UnboundedReceiver<Arc<PendingOperation>>,
    ) -> Self {
        // Subscribe before spawning so no loss between now and the first poll is missed.
        let events = dispatcher.pool().subscribe();
        let coordinator = Self {
            inner: Arc::new(CoordinatorInner {
                dispatcher,
                shutdown: CancellationToken::new(),
            }),
        };
        tokio::spawn(coordinator.clone().run(events, handoff));
        coordinator
    }

    /// Stops watching and abandons every reattachment in progress.
    pub fn stop(&self) {
        self.inner.shutdown.cancel();
    }

    /// Returns `true` once [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    async fn run(
        self,
        mut events: broadcast::Receiver<PoolEvent>,
        mut handoff: mpsc::UnboundedReceiver<Arc<PendingOperation>>,
    ) {
        tracing::debug!("reattachment coordinator started");
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                Some(operation) = handoff.recv() => self.spawn_reattach(operation),
                event = events.recv() => match event {
                    Ok(PoolEvent::Disconnected { id, error, in_flight, .. }) => {
                        let interrupted = self.inner.dispatcher.connection_lost(id, &in_flight);
                        if !interrupted.is_empty() {
                            tracing::info!(
                                connection = %id,
                                error = error.as_deref().unwrap_or("closed"),
                                count = interrupted.len(),
                                "reattaching blocking operations after connection loss"
                            );
                        }
                        for operation in interrupted {
                            if operation.begin_reattach() {
                                self.spawn_reattach(operation);
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "missed pool events, rescanning pending operations");
                        self.rescan();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        tracing::debug!("reattachment coordinator stopped");
    }

    /// Picks up blocking operations whose connection left the pool while
    /// events were being dropped.
    fn rescan(&self) {
        let dispatcher = &self.inner.dispatcher;
        for operation in dispatcher.registry().snapshot() {
            if !operation.command().is_blocking() || operation.state() != OperationState::Sent {
                continue;
            }
            let Some(connection) = operation.connection() else {
                continue;
            };
            if dispatcher.pool().contains(connection) {
                continue;
            }
            let interrupted = dispatcher.connection_lost(connection, &[operation.id()]);
            for operation in interrupted {
                if operation.begin_reattach() {
                    self.spawn_reattach(operation);
                }
            }
        }
    }

    fn spawn_reattach(&self, operation: Arc<PendingOperation>) {
        tokio::spawn(self.clone().reattach(operation));
    }

    #[instrument(
        name = "reattach",
        skip(self, operation),
        fields(id = %operation.id(), command = %operation.command())
    )]
    async fn reattach(self, operation: Arc<PendingOperation>) {
        let dispatcher = &self.inner.dispatcher;
        let pool = dispatcher.pool();
        let retry = dispatcher.config().retry().clone();
        let acquire_timeout = dispatcher.config().pool().acquire_timeout();
        let mut events = pool.subscribe();
        let mut backoff = retry.initial_backoff();
        let mut attempt: u32 = 0;

        loop {
            if operation.is_terminal() {
                return;
            }
            let remaining = operation.remaining();
            if remaining.map_or(false, |r| r.is_zero()) {
                dispatcher
                    .registry()
                    .resolve_operation(&operation, Outcome::TimedOut);
                return;
            }

            attempt += 1;
            let wait = remaining.map_or(acquire_timeout, |r| r.min(acquire_timeout));
            let acquired = tokio::select! {
                result = pool.acquire(AcquireMode::Exclusive, wait) => result,
                _ = operation.resolved() => return,
                _ = self.inner.shutdown.cancelled() => Err(RemqError::Shutdown),
            };

            let error = match acquired {
                Ok(connection) => match dispatcher.write(&connection, &operation).await {
                    Ok(()) => {
                        if !operation.is_terminal() {
                            tracing::info!(attempt, connection = %connection.id(), "blocking operation reattached");
                        }
                        return;
                    }
                    Err(e) => e,
                },
                Err(e) => e,
            };

            if matches!(error, RemqError::Shutdown) {
                dispatcher
                    .registry()
                    .resolve_operation(&operation, Outcome::Failed(RemqError::Shutdown));
                return;
            }

            // A failed write hands the operation back in `Created`; claim it again.
            if operation.state() == OperationState::Created && !operation.begin_reattach() {
                return;
            }

            let delay = operation
                .remaining()
                .map_or(backoff, |r| r.min(backoff));
            tracing::debug!(attempt, error = %error, delay = ?delay, "reattach attempt failed");

            if !self.pause(&operation, &mut events, delay).await {
                if !operation.is_terminal() && self.is_stopped() {
                    dispatcher
                        .registry()
                        .resolve_operation(&operation, Outcome::Failed(RemqError::Shutdown));
                }
                return;
            }

            backoff = calculate_backoff_with_jitter(
                backoff,
                retry.multiplier(),
                retry.max_backoff(),
                retry.jitter(),
            );
        }
    }

    /// Waits for the backoff delay or a fresh connection. Returns `false` if the
    /// operation resolved or the coordinator stopped meanwhile.
    async fn pause(
        &self,
        operation: &PendingOperation,
        events: &mut broadcast::Receiver<PoolEvent>,
        delay: Duration,
    ) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = operation.resolved() => return false,
                _ = self.inner.shutdown.cancelled() => return false,
                _ = &mut sleep => return true,
                event = events.recv() => match event {
                    Ok(PoolEvent::Connected { .. }) => return true,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return false,
                },
            }
        }
    }
}
