//! remq client entry point.

use std::sync::Arc;

use remq_core::{Command, FromResp, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::connection::{ConnectionPool, DnsResolver, EndpointResolver};
use crate::dispatch::{CommandDispatcher, PendingRegistry, ReattachmentCoordinator};
use crate::proxy::{BlockingQueue, ScriptService};

/// The main entry point for talking to a server.
///
/// `RemqClient` owns the connection pool, the dispatcher, the registry of
/// in-flight operations and the reattachment coordinator. Proxies obtained from
/// it share those components and stay usable until [`shutdown`](Self::shutdown).
///
/// # Example
///
/// ```ignore
/// use remq_client::{ClientConfig, RemqClient};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = ClientConfig::builder()
///         .address("127.0.0.1:6379")
///         .build()?;
///
///     let client = RemqClient::new(config).await?;
///     let queue = client.get_blocking_queue::<String>("jobs");
///
///     queue.add(&"resize".to_string()).await?;
///     let job = queue.take().await?;
///
///     client.shutdown().await;
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct RemqClient {
    id: Uuid,
    config: Arc<ClientConfig>,
    pool: ConnectionPool,
    dispatcher: CommandDispatcher,
    coordinator: ReattachmentCoordinator,
    scripts: ScriptService,
}

impl RemqClient {
    /// Creates a new client and opens the configured minimum of connections.
    ///
    /// # Errors
    ///
    /// Returns an error if the minimum is non-zero and no connection could be
    /// opened.
    pub async fn new(config: ClientConfig) -> Result<Self> {
        Self::with_resolver(config, Arc::new(DnsResolver)).await
    }

    /// Creates a new client that resolves its endpoint through `resolver`.
    pub async fn with_resolver(config: ClientConfig, resolver: Arc<dyn EndpointResolver>) -> Result<Self> {
        let id = Uuid::new_v4();
        let config = Arc::new(config);
        let registry = Arc::new(PendingRegistry::new());
        let pool = ConnectionPool::new(Arc::clone(&config), resolver, Arc::clone(&registry));

        if let Err(e) = pool.warm_up().await {
            pool.shutdown().await;
            return Err(e);
        }

        let (dispatcher, handoff) = CommandDispatcher::new(Arc::clone(&config), pool.clone(), registry);
        let coordinator = ReattachmentCoordinator::start(dispatcher.clone(), handoff);
        let scripts = ScriptService::new(dispatcher.clone());

        tracing::info!(
            client = %id,
            endpoint = %config.endpoint(),
            connections = pool.connection_count(),
            "client started"
        );

        Ok(Self {
            id,
            config,
            pool,
            dispatcher,
            coordinator,
            scripts,
        })
    }

    /// Returns the identifier of this client instance.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the configuration the client was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns a blocking queue proxy for the given name.
    ///
    /// Nothing is sent to the server; the queue exists there once it holds an item.
    pub fn get_blocking_queue<T>(&self, name: &str) -> BlockingQueue<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        BlockingQueue::new(name.to_string(), self.dispatcher.clone())
    }

    /// Returns the script service.
    pub fn get_script(&self) -> ScriptService {
        self.scripts.clone()
    }

    /// Sends an arbitrary command and converts its reply.
    pub async fn execute<R: FromResp>(&self, command: Command) -> Result<R> {
        self.dispatcher.execute(command).await
    }

    /// Returns the dispatcher shared by every proxy of this client.
    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    /// Returns the connection pool.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Returns the number of operations still awaiting resolution.
    pub fn pending_operations(&self) -> usize {
        self.dispatcher.registry().len()
    }

    /// Shuts down the client.
    ///
    /// Every pending operation resolves as canceled, reattachment stops and all
    /// connections close. Proxies fail with `Shutdown` afterwards.
    pub async fn shutdown(&self) {
        tracing::info!(client = %self.id, "shutting down client");
        let canceled = self.dispatcher.cancel_all();
        if canceled > 0 {
            tracing::debug!(canceled, "canceled pending operations");
        }
        self.coordinator.stop();
        self.pool.shutdown().await;
    }
}
