//! Single connection to a server node.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use remq_core::{Command, RemqError, RespCodec, RespValue, Result};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::Endpoint;
use crate::config::ClientConfig;
use crate::dispatch::{DispatchId, PendingRegistry};

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generates a new unique connection ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw ID value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Handshake in progress.
    Connecting = 0,
    /// Usable for commands.
    Active = 1,
    /// Failed; waiting to be discarded by the pool.
    Broken = 2,
    /// Closed deliberately.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Active,
            2 => ConnectionState::Broken,
            _ => ConnectionState::Closed,
        }
    }
}

/// Notice sent to the pool when a connection stops being usable.
#[derive(Debug)]
pub(crate) struct ConnectionLoss {
    pub(crate) id: ConnectionId,
    pub(crate) error: Option<String>,
    pub(crate) in_flight: Vec<DispatchId>,
}

/// Shared handles every connection's reader needs.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionContext {
    pub(crate) registry: Arc<PendingRegistry>,
    pub(crate) losses: mpsc::UnboundedSender<ConnectionLoss>,
    pub(crate) available: Arc<Notify>,
}

const LEASE_FREE: u64 = 0;
const LEASE_RESERVED: u64 = u64::MAX;

type Reader = FramedRead<OwnedReadHalf, RespCodec>;
type Writer = FramedWrite<OwnedWriteHalf, RespCodec>;

/// A pipelined connection to one server node.
///
/// Commands are written under a single writer lock, and each written command
/// appends its dispatch id to an in-flight queue under the same lock. A reader
/// task matches replies to that queue in order.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    endpoint: Endpoint,
    address: SocketAddr,
    server_client_id: Option<i64>,
    created_at: Instant,
    state: AtomicU8,
    writer: tokio::sync::Mutex<Writer>,
    in_flight: Mutex<VecDeque<DispatchId>>,
    lease: AtomicU64,
    closed: CancellationToken,
    context: ConnectionContext,
}

impl Connection {
    /// Dials the endpoint, runs the handshake and starts the reply reader.
    pub(crate) async fn open(
        endpoint: Endpoint,
        address: SocketAddr,
        config: &ClientConfig,
        context: ConnectionContext,
    ) -> Result<Arc<Self>> {
        let stream = TcpStream::connect(address).await.map_err(|e| {
            RemqError::Connection(format!("failed to connect to {}: {}", address, e))
        })?;

        stream.set_nodelay(true).map_err(|e| {
            RemqError::Connection(format!("failed to set TCP_NODELAY: {}", e))
        })?;

        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, RespCodec::new());
        let mut writer = FramedWrite::new(write_half, RespCodec::new());

        let server_client_id = handshake(&mut reader, &mut writer, config).await?;

        let connection = Arc::new(Self {
            id: ConnectionId::new(),
            endpoint,
            address,
            server_client_id,
            created_at: Instant::now(),
            state: AtomicU8::new(ConnectionState::Active as u8),
            writer: tokio::sync::Mutex::new(writer),
            in_flight: Mutex::new(VecDeque::new()),
            lease: AtomicU64::new(LEASE_FREE),
            closed: CancellationToken::new(),
            context,
        });

        tokio::spawn(Arc::clone(&connection).read_replies(reader));

        tracing::debug!(
            id = %connection.id,
            address = %address,
            client_id = ?server_client_id,
            "established connection"
        );
        Ok(connection)
    }

    /// Returns the connection's unique identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the endpoint this connection belongs to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Returns the remote address of this connection.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Returns the id the server assigned this connection, if it reported one.
    pub fn server_client_id(&self) -> Option<i64> {
        self.server_client_id
    }

    /// Returns when this connection was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Returns the current state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Returns `true` while the connection accepts commands.
    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    /// Returns the number of commands awaiting replies.
    pub fn in_flight(&self) -> usize {
        self.queue().len()
    }

    /// Returns `true` while a blocking command holds the connection exclusively.
    pub fn is_leased(&self) -> bool {
        self.lease.load(Ordering::Acquire) != LEASE_FREE
    }

    /// Reserves the connection for one blocking command. The lease passes to
    /// that command when it is written and ends with its reply.
    pub(crate) fn try_lease(&self) -> bool {
        self.lease
            .compare_exchange(LEASE_FREE, LEASE_RESERVED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release_lease(&self) {
        if self.lease.swap(LEASE_FREE, Ordering::AcqRel) != LEASE_FREE {
            self.context.available.notify_waiters();
        }
    }

    fn release_lease_held_by(&self, id: DispatchId) {
        if self
            .lease
            .compare_exchange(id.value(), LEASE_FREE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.context.available.notify_waiters();
        }
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, VecDeque<DispatchId>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Writes a command and records its dispatch id as awaiting a reply.
    ///
    /// On failure the id is not left behind in the in-flight queue, so the caller
    /// remains responsible for the operation.
    pub(crate) async fn send(&self, id: DispatchId, command: Command) -> Result<()> {
        let mut writer = self.writer.lock().await;

        {
            let mut queue = self.queue();
            if !self.is_active() {
                return Err(RemqError::Connection(format!(
                    "connection {} is not active",
                    self.id
                )));
            }
            if command.is_blocking() {
                let _ = self.lease.compare_exchange(
                    LEASE_RESERVED,
                    id.value(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
            queue.push_back(id);
        }

        if let Err(e) = writer.send(command).await {
            self.queue().retain(|pending| *pending != id);
            drop(writer);
            tracing::warn!(id = %self.id, error = %e, "failed to write command");
            self.fail(Some(format!("write failed: {}", e)));
            return Err(RemqError::Connection(format!(
                "failed to write to {}: {}",
                self.address, e
            )));
        }
        Ok(())
    }

    /// Moves the connection out of `Active` and reports its in-flight work to the pool.
    ///
    /// Only the first call has any effect.
    pub(crate) fn fail(&self, error: Option<String>) {
        let next = if error.is_some() {
            ConnectionState::Broken
        } else {
            ConnectionState::Closed
        };

        let in_flight: Vec<DispatchId> = {
            let mut queue = self.queue();
            let current = self.state.load(Ordering::Acquire);
            if matches!(
                ConnectionState::from_u8(current),
                ConnectionState::Broken | ConnectionState::Closed
            ) {
                return;
            }
            self.state.store(next as u8, Ordering::Release);
            queue.drain(..).collect()
        };

        self.closed.cancel();
        self.lease.store(LEASE_FREE, Ordering::Release);

        let loss = ConnectionLoss {
            id: self.id,
            error,
            in_flight,
        };
        if self.context.losses.send(loss).is_err() {
            tracing::debug!(id = %self.id, "pool no longer listening for connection losses");
        }
        self.context.available.notify_waiters();
    }

    /// Stops the reader and shuts down the write side, so the server drops any
    /// command parked on this connection.
    pub(crate) async fn close(&self) {
        self.fail(None);

        let shutdown = tokio::time::timeout(Duration::from_secs(1), async {
            let mut writer = self.writer.lock().await;
            SinkExt::<Command>::close(&mut *writer).await
        })
        .await;

        if let Ok(Err(e)) = shutdown {
            tracing::debug!(id = %self.id, error = %e, "error while closing connection");
        }
        tracing::debug!(id = %self.id, address = %self.address, "connection closed");
    }

    async fn read_replies(self: Arc<Self>, mut reader: Reader) {
        let error = loop {
            tokio::select! {
                _ = self.closed.cancelled() => break None,
                frame = reader.next() => match frame {
                    Some(Ok(reply)) => {
                        if let Err(e) = self.on_reply(reply) {
                            break Some(e.to_string());
                        }
                    }
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break Some("connection closed by server".to_string()),
                },
            }
        };

        if let Some(error) = &error {
            tracing::info!(id = %self.id, address = %self.address, error = %error, "connection lost");
        }
        self.fail(error);
    }

    fn on_reply(&self, reply: RespValue) -> Result<()> {
        let id = self.queue().pop_front().ok_or_else(|| {
            RemqError::Protocol("reply received with no command in flight".to_string())
        })?;

        self.context.registry.complete(id, reply);
        self.release_lease_held_by(id);
        Ok(())
    }
}

async fn handshake(reader: &mut Reader, writer: &mut Writer, config: &ClientConfig) -> Result<Option<i64>> {
    let client_id = match round_trip(reader, writer, Command::new("CLIENT").arg("ID")).await? {
        RespValue::Integer(id) => Some(id),
        RespValue::Error(message) => {
            tracing::debug!(error = %message, "server does not report client ids");
            None
        }
        other => {
            return Err(RemqError::Protocol(format!(
                "unexpected reply to CLIENT ID: {:?}",
                other
            )))
        }
    };

    if let Some(name) = config.client_name() {
        let command = Command::new("CLIENT").arg("SETNAME").arg(name);
        round_trip(reader, writer, command).await?.into_result()?;
    }

    if let Some(database) = config.database() {
        let command = Command::new("SELECT").arg(database);
        round_trip(reader, writer, command).await?.into_result()?;
    }

    Ok(client_id)
}

async fn round_trip(reader: &mut Reader, writer: &mut Writer, command: Command) -> Result<RespValue> {
    let name = command.name();
    writer.send(command).await?;
    match reader.next().await {
        Some(reply) => reply,
        None => Err(RemqError::Connection(format!(
            "connection closed during handshake ({})",
            name
        ))),
    }
}
