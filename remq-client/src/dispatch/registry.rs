//! Per-client table of in-flight operations.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use remq_core::{Command, RemqError, RespValue};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionId;

/// Identifier of a dispatched operation, unique and increasing within a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DispatchId(u64);

impl DispatchId {
    pub(crate) fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw ID value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DispatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Lifecycle state of a pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OperationState {
    /// Registered, not yet written to a connection.
    Created = 0,
    /// Written to a connection, awaiting the reply.
    Sent = 1,
    /// Its connection died before the reply arrived.
    ConnectionLost = 2,
    /// Waiting for a connection to re-send on.
    Reconnecting = 3,
    /// Resolved with a server reply.
    Completed = 4,
    /// Resolved with an error.
    Failed = 5,
    /// Resolved by cancellation.
    Canceled = 6,
    /// Resolved by its deadline.
    TimedOut = 7,
}

impl OperationState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => OperationState::Created,
            1 => OperationState::Sent,
            2 => OperationState::ConnectionLost,
            3 => OperationState::Reconnecting,
            4 => OperationState::Completed,
            5 => OperationState::Failed,
            6 => OperationState::Canceled,
            _ => OperationState::TimedOut,
        }
    }

    /// Returns `true` for the four resolved states.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationState::Completed
                | OperationState::Failed
                | OperationState::Canceled
                | OperationState::TimedOut
        )
    }
}

/// How an operation was resolved.
#[derive(Debug)]
pub enum Outcome {
    /// The server answered.
    Reply(RespValue),
    /// The operation failed.
    Failed(RemqError),
    /// The caller canceled.
    Canceled,
    /// The deadline passed before any reply.
    TimedOut,
}

impl Outcome {
    fn state(&self) -> OperationState {
        match self {
            Outcome::Reply(_) => OperationState::Completed,
            Outcome::Failed(_) => OperationState::Failed,
            Outcome::Canceled => OperationState::Canceled,
            Outcome::TimedOut => OperationState::TimedOut,
        }
    }
}

const NO_CONNECTION: u64 = 0;

/// A dispatched command awaiting resolution.
///
/// The result is assigned exactly once. Whichever of reply, cancellation,
/// deadline or connection failure reaches [`PendingOperation::resolve`] first
/// wins; every later attempt is a no-op.
pub struct PendingOperation {
    id: DispatchId,
    command: Command,
    deadline: Option<Instant>,
    created_at: Instant,
    state: AtomicU8,
    terminal: AtomicBool,
    connection: AtomicU64,
    sent_at: Mutex<Option<Instant>>,
    sender: Mutex<Option<oneshot::Sender<Outcome>>>,
    resolved: CancellationToken,
}

impl PendingOperation {
    /// Returns the dispatch identifier.
    pub fn id(&self) -> DispatchId {
        self.id
    }

    /// Returns the command as originally submitted.
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Returns the absolute deadline, `None` for operations that wait forever.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns when the operation was registered.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Returns the current state.
    pub fn state(&self) -> OperationState {
        OperationState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Returns `true` once the operation is resolved.
    pub fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::Acquire)
    }

    /// Returns the connection the command was last written to.
    pub fn connection(&self) -> Option<ConnectionId> {
        match self.connection.load(Ordering::Acquire) {
            NO_CONNECTION => None,
            raw => Some(ConnectionId::from_raw(raw)),
        }
    }

    /// Returns when the command was last written.
    pub fn sent_at(&self) -> Option<Instant> {
        *self.sent_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the budget left before the deadline; `None` means unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Returns `true` if the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.remaining().map_or(false, |r| r.is_zero())
    }

    /// Waits until the operation is resolved.
    pub async fn resolved(&self) {
        self.resolved.cancelled().await
    }

    pub(crate) fn mark_sent(&self, connection: ConnectionId) {
        *self.sent_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        self.connection.store(connection.value(), Ordering::Release);
        self.transition(&[OperationState::Created, OperationState::Reconnecting], OperationState::Sent);
    }

    /// Moves a live operation to `ConnectionLost`, returning `false` if it already moved on.
    pub(crate) fn mark_connection_lost(&self, connection: ConnectionId) -> bool {
        if self.connection() != Some(connection) {
            return false;
        }
        self.transition(&[OperationState::Sent], OperationState::ConnectionLost)
    }

    /// Takes a failed write back from `Sent`, returning `false` if the loss was
    /// already picked up elsewhere.
    pub(crate) fn reclaim(&self, connection: ConnectionId) -> bool {
        if self.connection() != Some(connection) {
            return false;
        }
        self.transition(&[OperationState::Sent], OperationState::Created)
    }

    /// Claims the operation for reattachment; only one claimant succeeds.
    pub(crate) fn begin_reattach(&self) -> bool {
        self.transition(
            &[
                OperationState::Created,
                OperationState::Sent,
                OperationState::ConnectionLost,
            ],
            OperationState::Reconnecting,
        )
    }

    fn transition(&self, from: &[OperationState], to: OperationState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if !from.contains(&OperationState::from_u8(current)) {
                return false;
            }
            match self.state.compare_exchange(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Assigns the result. Returns `false` if another resolution already won.
    pub(crate) fn resolve(&self, outcome: Outcome) -> bool {
        if self
            .terminal
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.state.store(outcome.state() as u8, Ordering::Release);
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            // The caller may have dropped its handle; the outcome is then discarded.
            let _ = sender.send(outcome);
        }
        self.resolved.cancel();
        true
    }
}

impl fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperation")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("state", &self.state())
            .field("connection", &self.connection())
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// Table of in-flight operations keyed by dispatch identifier.
///
/// Entries are removed as soon as they resolve, so the table only ever holds
/// live work.
#[derive(Debug)]
pub struct PendingRegistry {
    operations: DashMap<DispatchId, Arc<PendingOperation>>,
    next_id: AtomicU64,
}

impl Default for PendingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            operations: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a command, returning the operation and the receiving end of its result.
    pub fn register(
        &self,
        command: Command,
        deadline: Option<Instant>,
    ) -> (Arc<PendingOperation>, oneshot::Receiver<Outcome>) {
        let id = DispatchId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = oneshot::channel();
        let operation = Arc::new(PendingOperation {
            id,
            command,
            deadline,
            created_at: Instant::now(),
            state: AtomicU8::new(OperationState::Created as u8),
            terminal: AtomicBool::new(false),
            connection: AtomicU64::new(NO_CONNECTION),
            sent_at: Mutex::new(None),
            sender: Mutex::new(Some(sender)),
            resolved: CancellationToken::new(),
        });
        self.operations.insert(id, Arc::clone(&operation));
        (operation, receiver)
    }

    /// Looks up a live operation.
    pub fn lookup(&self, id: DispatchId) -> Option<Arc<PendingOperation>> {
        self.operations.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Resolves the operation and drops it from the table.
    ///
    /// Idempotent: returns `false` when the operation is unknown or already resolved.
    pub fn resolve(&self, id: DispatchId, outcome: Outcome) -> bool {
        match self.lookup(id) {
            Some(operation) => self.resolve_operation(&operation, outcome),
            None => false,
        }
    }

    pub(crate) fn resolve_operation(&self, operation: &PendingOperation, outcome: Outcome) -> bool {
        let won = operation.resolve(outcome);
        self.operations.remove(&operation.id);
        won
    }

    /// Resolves an operation from a server reply, turning error replies into
    /// [`RemqError::Remote`].
    pub(crate) fn complete(&self, id: DispatchId, reply: RespValue) -> bool {
        let outcome = match reply {
            RespValue::Error(message) => Outcome::Failed(RemqError::Remote(message)),
            other => Outcome::Reply(other),
        };
        let carried_data = matches!(
            outcome,
            Outcome::Reply(ref value) if !value.is_nil()
        );

        if self.resolve(id, outcome) {
            return true;
        }
        if carried_data {
            tracing::warn!(id = %id, "discarding reply for an operation that already resolved");
        } else {
            tracing::debug!(id = %id, "discarding late reply");
        }
        false
    }

    /// Cancels an operation locally. Returns `false` if it already resolved.
    pub fn cancel(&self, id: DispatchId) -> bool {
        let canceled = self.resolve(id, Outcome::Canceled);
        if canceled {
            tracing::debug!(id = %id, "operation canceled");
        }
        canceled
    }

    /// Cancels every live operation, returning how many were canceled.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<DispatchId> = self.operations.iter().map(|entry| *entry.key()).collect();
        ids.into_iter().filter(|id| self.cancel(*id)).count()
    }

    /// Returns the live operations last written to the given connection.
    pub fn on_connection(&self, connection: ConnectionId) -> Vec<Arc<PendingOperation>> {
        self.operations
            .iter()
            .filter(|entry| entry.value().connection() == Some(connection))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Returns every live operation.
    pub fn snapshot(&self) -> Vec<Arc<PendingOperation>> {
        self.operations
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Returns the number of live operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Returns `true` when nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
