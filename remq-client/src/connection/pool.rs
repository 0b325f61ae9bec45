//! Connection pool management and lifecycle handling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use remq_core::{RemqError, Result};
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::instrument;

use super::connection::{Connection, ConnectionContext, ConnectionId, ConnectionLoss};
use super::resolver::{Endpoint, EndpointResolver};
use crate::config::ClientConfig;
use crate::dispatch::{DispatchId, PendingRegistry};

/// Events emitted during connection lifecycle.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A connection finished its handshake and is ready.
    Connected {
        /// The connection identifier.
        id: ConnectionId,
        /// The endpoint of the connection.
        endpoint: Endpoint,
    },
    /// A connection was lost or closed.
    Disconnected {
        /// The connection identifier.
        id: ConnectionId,
        /// The endpoint of the connection.
        endpoint: Endpoint,
        /// The error that caused disconnection, `None` for a deliberate close.
        error: Option<String>,
        /// Operations written to the connection that never got a reply.
        in_flight: Vec<DispatchId>,
    },
    /// A background reconnection attempt is scheduled.
    ReconnectAttempt {
        /// The endpoint being reconnected.
        endpoint: Endpoint,
        /// The current attempt number.
        attempt: u32,
        /// The delay before this attempt.
        next_delay: Duration,
    },
    /// Background reconnection gave up after the configured attempts.
    ReconnectFailed {
        /// The endpoint that failed to reconnect.
        endpoint: Endpoint,
        /// The error from the last attempt.
        error: String,
    },
}

/// How a caller intends to use an acquired connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Pipelined with other callers' commands.
    Shared,
    /// Held alone until the reply of the single command written to it arrives.
    Exclusive,
}

/// Calculates the next backoff duration with jitter applied.
pub(crate) fn calculate_backoff_with_jitter(
    current_backoff: Duration,
    multiplier: f64,
    max_backoff: Duration,
    jitter: f64,
) -> Duration {
    let base_backoff = current_backoff.as_secs_f64() * multiplier;

    let jitter_factor = if jitter > 0.0 {
        let mut rng = rand::thread_rng();
        1.0 + rng.gen_range(-jitter..=jitter)
    } else {
        1.0
    };

    let jittered_backoff = base_backoff * jitter_factor;

    std::cmp::min(
        Duration::from_secs_f64(jittered_backoff.max(0.0)),
        max_backoff,
    )
}

#[derive(Debug, Default)]
struct PoolState {
    connections: HashMap<ConnectionId, Arc<Connection>>,
    opening: usize,
    /// Losses reported by connections that are not inserted yet.
    unclaimed: HashMap<ConnectionId, ConnectionLoss>,
}

enum Selection {
    Ready(Arc<Connection>),
    Open,
    Wait,
}

#[derive(Debug)]
struct PoolInner {
    endpoint: Endpoint,
    config: Arc<ClientConfig>,
    resolver: Arc<dyn EndpointResolver>,
    context: ConnectionContext,
    state: Mutex<PoolState>,
    available: Arc<Notify>,
    event_sender: broadcast::Sender<PoolEvent>,
    shutdown: watch::Sender<bool>,
    reconnecting: AtomicBool,
}

/// Per-endpoint set of connections.
///
/// Keeps at least `min_idle` connections open, never more than `max_size`, and
/// restores the minimum in the background after a connection is lost. Cloning
/// yields another handle to the same pool.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates a pool for the configured endpoint. No connection is opened yet.
    pub fn new(
        config: Arc<ClientConfig>,
        resolver: Arc<dyn EndpointResolver>,
        registry: Arc<PendingRegistry>,
    ) -> Self {
        let (event_sender, _) = broadcast::channel(256);
        let (shutdown, _) = watch::channel(false);
        let (losses, loss_receiver) = mpsc::unbounded_channel();
        let available = Arc::new(Notify::new());

        let inner = Arc::new(PoolInner {
            endpoint: config.endpoint().clone(),
            context: ConnectionContext {
                registry,
                losses,
                available: Arc::clone(&available),
            },
            config,
            resolver,
            state: Mutex::new(PoolState::default()),
            available,
            event_sender,
            shutdown,
            reconnecting: AtomicBool::new(false),
        });

        tokio::spawn(supervise(Arc::downgrade(&inner), loss_receiver));

        Self { inner }
    }

    /// Subscribes to connection lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.event_sender.subscribe()
    }

    /// Returns the endpoint served by this pool.
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Opens connections up to the configured minimum.
    ///
    /// Fails only if the minimum is non-zero and no connection could be opened.
    #[instrument(
        name = "connection_pool.warm_up",
        skip(self),
        fields(endpoint = %self.inner.endpoint)
    )]
    pub async fn warm_up(&self) -> Result<()> {
        let min_idle = self.inner.config.pool().min_idle();
        let mut last_error = None;

        while self.connection_count() < min_idle {
            if !self.inner.reserve_slot() {
                break;
            }
            if let Err(e) = self.inner.open_reserved(false).await {
                tracing::warn!(error = %e, "failed initial connection");
                last_error = Some(e);
                break;
            }
        }

        match last_error {
            Some(e) if self.connection_count() == 0 => Err(e),
            _ => {
                tracing::info!(count = self.connection_count(), "connection pool ready");
                Ok(())
            }
        }
    }

    /// Returns an active connection, opening one if below the maximum.
    ///
    /// Waits for a connection to become available otherwise, failing with
    /// [`RemqError::PoolExhausted`] once `acquire_timeout` elapses.
    pub async fn acquire(&self, mode: AcquireMode, acquire_timeout: Duration) -> Result<Arc<Connection>> {
        let deadline = Instant::now() + acquire_timeout;

        loop {
            if self.is_shutdown_requested() {
                return Err(RemqError::Shutdown);
            }

            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.inner.select(mode) {
                Selection::Ready(connection) => return Ok(connection),
                Selection::Open => {
                    let leased = mode == AcquireMode::Exclusive;
                    return match timeout_at(deadline, self.inner.open_reserved(leased)).await {
                        Ok(result) => result,
                        Err(_) => Err(RemqError::PoolExhausted(acquire_timeout)),
                    };
                }
                Selection::Wait => {
                    if timeout_at(deadline, notified).await.is_err() {
                        tracing::debug!(mode = ?mode, timeout = ?acquire_timeout, "connection pool exhausted");
                        return Err(RemqError::PoolExhausted(acquire_timeout));
                    }
                }
            }
        }
    }

    /// Returns an active connection other than `exclude` without opening one or waiting.
    pub fn try_acquire_now(&self, exclude: ConnectionId) -> Option<Arc<Connection>> {
        let state = self.inner.lock();
        state
            .connections
            .values()
            .filter(|c| c.id() != exclude && c.is_active() && !c.is_leased())
            .min_by_key(|c| c.in_flight())
            .cloned()
    }

    /// Gives back an exclusively acquired connection whose command was never written.
    pub fn release(&self, connection: &Connection) {
        connection.release_lease();
    }

    /// Marks a connection as broken and hands its in-flight work to subscribers.
    #[instrument(
        name = "connection_pool.mark_broken",
        skip(self, connection),
        fields(id = %connection.id())
    )]
    pub fn mark_broken(&self, connection: &Connection, reason: &str) {
        tracing::warn!(reason = %reason, "marking connection broken");
        connection.fail(Some(reason.to_string()));
    }

    /// Closes a connection deliberately.
    #[instrument(
        name = "connection_pool.retire",
        skip(self, connection),
        fields(id = %connection.id())
    )]
    pub async fn retire(&self, connection: &Connection) {
        connection.close().await;
    }

    /// Looks up a pooled connection.
    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.inner.lock().connections.get(&id).cloned()
    }

    /// Returns `true` if the pool still holds the connection.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.inner.lock().connections.contains_key(&id)
    }

    /// Returns the number of open connections.
    pub fn connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }

    /// Returns the number of open connections not held by a blocking command.
    pub fn idle_count(&self) -> usize {
        self.inner
            .lock()
            .connections
            .values()
            .filter(|c| !c.is_leased())
            .count()
    }

    /// Returns `true` if shutdown has been requested.
    pub fn is_shutdown_requested(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Closes every connection and stops background reconnection.
    #[instrument(
        name = "connection_pool.shutdown",
        skip(self),
        fields(endpoint = %self.inner.endpoint)
    )]
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);

        let connections: Vec<Arc<Connection>> =
            self.inner.lock().connections.values().cloned().collect();
        tracing::debug!(connection_count = connections.len(), "closing all connections");

        for connection in connections {
            connection.close().await;
        }
        self.inner.available.notify_waiters();
        tracing::info!("connection pool shut down");
    }
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn select(&self, mode: AcquireMode) -> Selection {
        let mut state = self.lock();
        let usable = state
            .connections
            .values()
            .filter(|c| c.is_active() && !c.is_leased());

        let picked = match mode {
            AcquireMode::Shared => usable.min_by_key(|c| c.in_flight()).cloned(),
            AcquireMode::Exclusive => usable
                .filter(|c| c.in_flight() == 0)
                .find(|c| c.try_lease())
                .cloned(),
        };
        if let Some(connection) = picked {
            return Selection::Ready(connection);
        }

        if state.connections.len() + state.opening < self.config.pool().max_size() {
            state.opening += 1;
            Selection::Open
        } else {
            Selection::Wait
        }
    }

    fn reserve_slot(&self) -> bool {
        let mut state = self.lock();
        if state.connections.len() + state.opening < self.config.pool().max_size() {
            state.opening += 1;
            true
        } else {
            false
        }
    }

    /// Opens a connection into a slot reserved by `select` or `reserve_slot`.
    ///
    /// A connection opened for an exclusive caller enters the pool already
    /// leased, so no shared caller can pipeline onto it first.
    #[instrument(
        name = "connection_pool.connect",
        skip(self),
        fields(endpoint = %self.endpoint)
    )]
    async fn open_reserved(self: &Arc<Self>, leased: bool) -> Result<Arc<Connection>> {
        struct Reservation<'a>(&'a PoolInner);

        impl Drop for Reservation<'_> {
            fn drop(&mut self) {
                self.0.lock().opening -= 1;
                self.0.available.notify_waiters();
            }
        }

        let reservation = Reservation(self);
        let connect_timeout = self.config.network().connection_timeout();
        tracing::debug!(timeout = ?connect_timeout, "attempting connection");

        let connection = timeout(connect_timeout, self.connect())
            .await
            .map_err(|_| {
                tracing::warn!(timeout = ?connect_timeout, "connection attempt timed out");
                RemqError::Timeout(format!(
                    "connection to {} timed out after {:?}",
                    self.endpoint, connect_timeout
                ))
            })??;

        if *self.shutdown.borrow() {
            connection.close().await;
            return Err(RemqError::Shutdown);
        }

        if leased {
            connection.try_lease();
        }

        let early_loss = {
            let mut state = self.lock();
            let loss = state.unclaimed.remove(&connection.id());
            if loss.is_none() {
                state
                    .connections
                    .insert(connection.id(), Arc::clone(&connection));
            }
            loss
        };
        drop(reservation);

        if let Some(loss) = early_loss {
            let id = connection.id();
            self.publish_loss(connection, loss);
            return Err(RemqError::Connection(format!(
                "connection {} to {} lost right after its handshake",
                id, self.endpoint
            )));
        }

        let _ = self.event_sender.send(PoolEvent::Connected {
            id: connection.id(),
            endpoint: self.endpoint.clone(),
        });
        tracing::info!(id = %connection.id(), "connected to server");

        Ok(connection)
    }

    async fn connect(&self) -> Result<Arc<Connection>> {
        let addresses = self.resolver.resolve(&self.endpoint).await?;
        let mut last_error = None;

        for address in addresses {
            match Connection::open(
                self.endpoint.clone(),
                address,
                &self.config,
                self.context.clone(),
            )
            .await
            {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    tracing::debug!(address = %address, error = %e, "address unreachable");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            RemqError::Connection(format!("no addresses to connect to for {}", self.endpoint))
        }))
    }

    fn on_connection_loss(self: &Arc<Self>, loss: ConnectionLoss) {
        let removed = {
            let mut state = self.lock();
            match state.connections.remove(&loss.id) {
                Some(removed) => removed,
                None => {
                    // The opener claims it once it tries to insert the connection.
                    if !*self.shutdown.borrow() {
                        state.unclaimed.insert(loss.id, loss);
                    }
                    return;
                }
            }
        };
        self.publish_loss(removed, loss);
    }

    fn publish_loss(self: &Arc<Self>, removed: Arc<Connection>, loss: ConnectionLoss) {
        tokio::spawn(async move { removed.close().await });

        match &loss.error {
            Some(error) => tracing::info!(id = %loss.id, error = %error, in_flight = loss.in_flight.len(), "disconnected from server"),
            None => tracing::debug!(id = %loss.id, in_flight = loss.in_flight.len(), "connection retired"),
        }

        let _ = self.event_sender.send(PoolEvent::Disconnected {
            id: loss.id,
            endpoint: self.endpoint.clone(),
            error: loss.error,
            in_flight: loss.in_flight,
        });
        self.available.notify_waiters();

        if !*self.shutdown.borrow()
            && self.lock().connections.len() < self.config.pool().min_idle()
            && !self.reconnecting.swap(true, Ordering::AcqRel)
        {
            tokio::spawn(Arc::clone(self).reconnect());
        }
    }

    /// Restores the minimum number of connections with exponential backoff.
    #[instrument(
        name = "connection_pool.reconnect",
        skip(self),
        fields(
            endpoint = %self.endpoint,
            max_retries = ?self.config.retry().max_retries()
        )
    )]
    async fn reconnect(self: Arc<Self>) {
        let retry_config = self.config.retry();
        let mut current_backoff = retry_config.initial_backoff();
        let mut attempt = 0u32;
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if *shutdown.borrow() || self.lock().connections.len() >= self.config.pool().min_idle() {
                break;
            }

            attempt += 1;

            if let Some(max_retries) = retry_config.max_retries() {
                if attempt > max_retries {
                    let error = format!("failed to reconnect after {} attempts", max_retries);
                    tracing::error!(attempts = attempt - 1, "reconnection failed permanently");
                    let _ = self.event_sender.send(PoolEvent::ReconnectFailed {
                        endpoint: self.endpoint.clone(),
                        error,
                    });
                    break;
                }
            }

            let _ = self.event_sender.send(PoolEvent::ReconnectAttempt {
                endpoint: self.endpoint.clone(),
                attempt,
                next_delay: current_backoff,
            });

            tracing::debug!(
                attempt = attempt,
                backoff = ?current_backoff,
                "attempting reconnection"
            );

            tokio::select! {
                _ = tokio::time::sleep(current_backoff) => {}
                _ = shutdown.changed() => break,
            }

            if self.reserve_slot() {
                match self.open_reserved(false).await {
                    Ok(connection) => {
                        tracing::info!(attempt = attempt, id = %connection.id(), "reconnection successful");
                        attempt = 0;
                        current_backoff = retry_config.initial_backoff();
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(
                            attempt = attempt,
                            error = %e,
                            "reconnection attempt failed"
                        );
                    }
                }
            }

            current_backoff = calculate_backoff_with_jitter(
                current_backoff,
                retry_config.multiplier(),
                retry_config.max_backoff(),
                retry_config.jitter(),
            );
        }

        self.reconnecting.store(false, Ordering::Release);
    }
}

async fn supervise(
    pool: std::sync::Weak<PoolInner>,
    mut losses: mpsc::UnboundedReceiver<ConnectionLoss>,
) {
    while let Some(loss) = losses.recv().await {
        match pool.upgrade() {
            Some(inner) => inner.on_connection_loss(loss),
            None => break,
        }
    }
}
