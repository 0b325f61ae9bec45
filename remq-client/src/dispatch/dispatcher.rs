//! Command dispatch: acquire, write, resolve.

use std::sync::Arc;
use std::time::Instant;

use remq_core::{Command, FromResp, RemqError, RespValue, Result};
use tokio::sync::mpsc;
use tracing::instrument;

use super::handle::{OperationHandle, ReplyMapper};
use super::registry::{DispatchId, OperationState, Outcome, PendingOperation, PendingRegistry};
use crate::config::ClientConfig;
use crate::connection::{AcquireMode, Connection, ConnectionId, ConnectionPool};

/// Failures after which a blocking command waits for the endpoint to come back.
fn is_transient(error: &RemqError) -> bool {
    error.is_connection_failure() || matches!(error, RemqError::Timeout(_))
}

#[derive(Debug)]
struct DispatcherInner {
    config: Arc<ClientConfig>,
    pool: ConnectionPool,
    registry: Arc<PendingRegistry>,
    handoff: mpsc::UnboundedSender<Arc<PendingOperation>>,
}

/// Sends commands and routes their results back to the callers.
///
/// Non-blocking commands share pipelined connections and carry the configured
/// response deadline. Blocking commands take a connection exclusively; when the
/// endpoint is unreachable they go to the reattachment coordinator instead of
/// failing.
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    inner: Arc<DispatcherInner>,
}

impl CommandDispatcher {
    /// Creates a dispatcher along with the channel on which it hands blocking
    /// operations to the reattachment coordinator.
    pub(crate) fn new(
        config: Arc<ClientConfig>,
        pool: ConnectionPool,
        registry: Arc<PendingRegistry>,
    ) -> (Self, mpsc::UnboundedReceiver<Arc<PendingOperation>>) {
        let (handoff, receiver) = mpsc::unbounded_channel();
        let dispatcher = Self {
            inner: Arc::new(DispatcherInner {
                config,
                pool,
                registry,
                handoff,
            }),
        };
        (dispatcher, receiver)
    }

    /// Returns the connection pool commands are sent through.
    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    /// Returns the registry of in-flight operations.
    pub fn registry(&self) -> &Arc<PendingRegistry> {
        &self.inner.registry
    }

    pub(crate) fn config(&self) -> &Arc<ClientConfig> {
        &self.inner.config
    }

    fn effective_deadline(&self, command: &Command, deadline: Option<Instant>) -> Option<Instant> {
        if command.is_blocking() {
            deadline
        } else {
            let response = Instant::now() + self.inner.config.network().response_timeout();
            Some(deadline.map_or(response, |d| d.min(response)))
        }
    }

    /// Registers a command and starts sending it in the background.
    ///
    /// Returns immediately; the caller suspends only when awaiting the handle.
    /// Blocking commands wait until `deadline` (forever when `None`); other
    /// commands wait at most the configured response timeout.
    pub fn submit<T, F>(&self, command: Command, deadline: Option<Instant>, mapper: F) -> OperationHandle<T>
    where
        F: FnOnce(Option<RespValue>) -> Result<T> + Send + 'static,
    {
        let deadline = self.effective_deadline(&command, deadline);
        let (operation, receiver) = self.inner.registry.register(command, deadline);
        self.watch_deadline(Arc::clone(&operation));
        tokio::spawn(self.clone().start(Arc::clone(&operation)));

        let mapper: ReplyMapper<T> = Box::new(mapper);
        OperationHandle::new(operation, receiver, self.clone(), mapper)
    }

    /// Sends a command and converts its reply.
    pub async fn execute<R: FromResp>(&self, command: Command) -> Result<R> {
        let name = command.name();
        self.submit(command, None, move |reply| match reply {
            Some(value) => R::from_resp(value),
            None => Err(RemqError::Timeout(format!("no reply to {}", name))),
        })
        .await
    }

    /// Writes a command on a specific connection.
    ///
    /// The caller is responsible for the connection being suitable, exclusive
    /// for blocking commands in particular.
    #[instrument(
        name = "dispatcher.dispatch",
        skip(self, connection, command),
        fields(connection = %connection.id(), command = %command)
    )]
    pub async fn dispatch(
        &self,
        connection: &Arc<Connection>,
        command: Command,
        deadline: Option<Instant>,
    ) -> Result<OperationHandle<RespValue>> {
        let deadline = self.effective_deadline(&command, deadline);
        let (operation, receiver) = self.inner.registry.register(command, deadline);
        self.watch_deadline(Arc::clone(&operation));

        let handle = OperationHandle::new(
            Arc::clone(&operation),
            receiver,
            self.clone(),
            Box::new(|reply: Option<RespValue>| Ok(reply.unwrap_or(RespValue::Nil))),
        );

        if let Err(e) = self.write(connection, &operation).await {
            self.inner
                .registry
                .resolve_operation(&operation, Outcome::Failed(RemqError::ConnectionLost));
            return Err(e);
        }
        Ok(handle)
    }

    async fn start(self, operation: Arc<PendingOperation>) {
        let mode = if operation.command().is_blocking() {
            AcquireMode::Exclusive
        } else {
            AcquireMode::Shared
        };
        let acquire_timeout = self.inner.config.pool().acquire_timeout();

        let acquired = tokio::select! {
            result = self.inner.pool.acquire(mode, acquire_timeout) => result,
            _ = operation.resolved() => return,
        };

        let result = match acquired {
            Ok(connection) => self.write(&connection, &operation).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.on_start_failure(&operation, e);
        }
    }

    fn on_start_failure(&self, operation: &Arc<PendingOperation>, error: RemqError) {
        if operation.is_terminal() {
            return;
        }

        if operation.command().is_blocking() && is_transient(&error) {
            if operation.begin_reattach() {
                tracing::debug!(
                    id = %operation.id(),
                    error = %error,
                    "endpoint unavailable, waiting to reattach blocking operation"
                );
                if let Err(mpsc::error::SendError(operation)) = self.inner.handoff.send(Arc::clone(operation)) {
                    self.inner
                        .registry
                        .resolve_operation(&operation, Outcome::Failed(RemqError::Shutdown));
                }
            }
            return;
        }

        let error = if operation.connection().is_some() && error.is_connection_failure() {
            RemqError::ConnectionLost
        } else {
            error
        };
        self.inner
            .registry
            .resolve_operation(operation, Outcome::Failed(error));
    }

    /// Writes a registered operation, rewriting any server-side wait to the
    /// budget left before its deadline.
    ///
    /// Returns an error only while the caller still owns the operation: if a
    /// concurrent loss notice took it over, the failed write reports success.
    pub(crate) async fn write(&self, connection: &Arc<Connection>, operation: &Arc<PendingOperation>) -> Result<()> {
        let blocking = operation.command().is_blocking();

        if operation.is_terminal() {
            if blocking {
                self.inner.pool.release(connection);
            }
            return Ok(());
        }

        let command = if operation.command().has_wait_budget() {
            match operation.remaining() {
                Some(remaining) if remaining.is_zero() => {
                    self.inner.pool.release(connection);
                    self.inner
                        .registry
                        .resolve_operation(operation, Outcome::TimedOut);
                    return Ok(());
                }
                remaining => operation.command().with_wait(remaining),
            }
        } else {
            operation.command().clone()
        };

        operation.mark_sent(connection.id());
        tracing::trace!(id = %operation.id(), connection = %connection.id(), command = %command, "writing command");

        if let Err(e) = connection.send(operation.id(), command).await {
            if blocking {
                self.inner.pool.release(connection);
            }
            return if operation.reclaim(connection.id()) {
                Err(e)
            } else {
                Ok(())
            };
        }

        if blocking && operation.is_terminal() {
            self.release_parked(connection.id());
        }
        Ok(())
    }

    /// Applies a connection loss to the operations it interrupted.
    ///
    /// Non-blocking operations fail with [`RemqError::ConnectionLost`]; blocking
    /// ones move to `ConnectionLost` and are returned for reattachment.
    pub(crate) fn connection_lost(
        &self,
        connection: ConnectionId,
        in_flight: &[DispatchId],
    ) -> Vec<Arc<PendingOperation>> {
        let registry = &self.inner.registry;
        let mut affected: Vec<Arc<PendingOperation>> =
            in_flight.iter().filter_map(|id| registry.lookup(*id)).collect();
        for operation in registry.on_connection(connection) {
            if !affected.iter().any(|known| known.id() == operation.id()) {
                affected.push(operation);
            }
        }

        let mut blocking = Vec::new();
        for operation in affected {
            if operation.is_terminal() || operation.connection() != Some(connection) {
                continue;
            }
            if operation.command().is_blocking() {
                if operation.mark_connection_lost(connection) {
                    blocking.push(operation);
                }
            } else if registry.resolve_operation(&operation, Outcome::Failed(RemqError::ConnectionLost)) {
                tracing::debug!(id = %operation.id(), connection = %connection, "operation lost with its connection");
            }
        }
        blocking
    }

    /// Cancels an operation. Returns `false` if it had already resolved.
    ///
    /// Local resolution is immediate. A blocking command parked on the server is
    /// released in the background with `CLIENT UNBLOCK` from another connection,
    /// or by closing its connection when no other one is at hand.
    pub fn cancel(&self, id: DispatchId) -> bool {
        let Some(operation) = self.inner.registry.lookup(id) else {
            return false;
        };
        let parked = operation.command().is_blocking() && operation.state() == OperationState::Sent;
        let connection = operation.connection();

        if !self.inner.registry.cancel(id) {
            return false;
        }
        if let (true, Some(connection)) = (parked, connection) {
            self.release_parked(connection);
        }
        true
    }

    /// Cancels every live operation.
    pub fn cancel_all(&self) -> usize {
        self.inner.registry.cancel_all()
    }

    fn release_parked(&self, connection: ConnectionId) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let dispatcher = self.clone();
        runtime.spawn(async move { dispatcher.unblock(connection).await });
    }

    async fn unblock(&self, connection_id: ConnectionId) {
        let pool = &self.inner.pool;
        let Some(blocked) = pool.get(connection_id) else {
            return;
        };
        if blocked.in_flight() == 0 {
            return;
        }

        if let (Some(client_id), Some(other)) = (blocked.server_client_id(), pool.try_acquire_now(connection_id)) {
            let command = Command::new("CLIENT").arg("UNBLOCK").arg(client_id);
            let result = match self.dispatch(&other, command, None).await {
                Ok(handle) => handle.await,
                Err(e) => Err(e),
            };
            match result {
                Ok(RespValue::Integer(1)) => {
                    tracing::debug!(connection = %connection_id, via = %other.id(), "released parked command");
                    return;
                }
                Ok(_) => {
                    tracing::debug!(connection = %connection_id, "server had no parked command to release");
                    return;
                }
                Err(e) => {
                    tracing::debug!(connection = %connection_id, error = %e, "CLIENT UNBLOCK failed, closing connection");
                }
            }
        }

        pool.retire(&blocked).await;
    }

    fn watch_deadline(&self, operation: Arc<PendingOperation>) {
        let Some(deadline) = operation.deadline() else {
            return;
        };
        let dispatcher = self.clone();
        let grace = self.inner.config.network().timeout_grace();

        tokio::spawn(async move {
            let mut expiry = tokio::time::Instant::from_std(deadline);
            let mut extended = false;

            loop {
                tokio::select! {
                    _ = operation.resolved() => return,
                    _ = tokio::time::sleep_until(expiry) => {}
                }
                // The server-side wait ends with the deadline; give its reply a
                // chance to arrive so a value popped at the last moment is kept.
                if !extended
                    && !grace.is_zero()
                    && operation.state() == OperationState::Sent
                    && operation.command().has_wait_budget()
                {
                    extended = true;
                    expiry += grace;
                    continue;
                }
                break;
            }

            let parked = operation.state() == OperationState::Sent;
            let connection = operation.connection();
            let blocking = operation.command().is_blocking();
            let outcome = if blocking {
                Outcome::TimedOut
            } else {
                Outcome::Failed(RemqError::Timeout(format!(
                    "no reply to {} within {:?}",
                    operation.command(),
                    deadline.saturating_duration_since(operation.created_at())
                )))
            };

            if dispatcher.inner.registry.resolve_operation(&operation, outcome) {
                tracing::debug!(id = %operation.id(), "operation deadline expired");
                if let (true, true, Some(connection)) = (blocking, parked, connection) {
                    dispatcher.release_parked(connection);
                }
            }
        });
    }
}
