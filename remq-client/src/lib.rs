//! Async Rust client for RESP servers with resilient blocking queues.
//!
//! The client pools connections to one server endpoint, pipelines ordinary
//! commands and gives every blocking command a connection of its own. Each
//! command becomes a pending operation with a single result: a reply, an
//! error, a cancellation or an expired deadline, whichever comes first.
//!
//! When a connection carrying a blocking wait drops, the wait is not failed.
//! It is re-sent on a fresh connection once the server is reachable again,
//! with the server-side wait cut down to the budget left before its deadline.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use remq_client::{ClientConfig, RemqClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::builder()
//!         .address("127.0.0.1:6379")
//!         .build()?;
//!     let client = RemqClient::new(config).await?;
//!
//!     let queue = client.get_blocking_queue::<u64>("jobs");
//!     queue.add(&42).await?;
//!
//!     // Waits up to five seconds, across reconnects.
//!     let job = queue.poll_timeout(Duration::from_secs(5)).await?;
//!     println!("{:?}", job); // Some(42)
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Configuration
//!
//! ```rust,no_run
//! use remq_client::ClientConfig;
//! use std::time::Duration;
//!
//! let config = ClientConfig::builder()
//!     .address("redis://10.0.0.1:6379")
//!     .client_name("billing-worker")
//!     .connection_timeout(Duration::from_secs(10))
//!     .pool(|p| p.min_idle(2).max_size(16))
//!     .retry(|r| r
//!         .initial_backoff(Duration::from_millis(100))
//!         .max_backoff(Duration::from_secs(30))
//!         .multiplier(2.0)
//!         .jitter(0.2))
//!     .build()
//!     .expect("invalid config");
//! ```
//!
//! # Cancellation
//!
//! Waiting operations can also be started as handles:
//!
//! ```rust,ignore
//! let handle = queue.take_async();
//! if !handle.await_timeout(Duration::from_secs(1)).await {
//!     handle.cancel();
//! }
//! ```
//!
//! Cancellation resolves the operation at once. A wait already parked on the
//! server is released in the background.

#![warn(missing_docs)]

mod client;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod proxy;

pub use client::RemqClient;
pub use config::{
    ClientConfig, ClientConfigBuilder, ConfigError, NetworkConfig, NetworkConfigBuilder,
    PoolConfig, PoolConfigBuilder, RetryConfig, RetryConfigBuilder,
};
pub use connection::{
    AcquireMode, Connection, ConnectionId, ConnectionPool, ConnectionState, DnsResolver,
    Endpoint, EndpointResolver, PoolEvent, StaticResolver,
};
pub use dispatch::{
    CommandDispatcher, DispatchId, OperationHandle, OperationState, Outcome, PendingOperation,
    PendingRegistry, ReattachmentCoordinator,
};
pub use proxy::{BlockingQueue, QueueOperation, Script, ScriptService};
pub use remq_core as core;
pub use remq_core::{Command, FromResp, RemqError, RespValue, Result};
