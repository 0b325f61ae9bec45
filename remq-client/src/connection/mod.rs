//! Connection management for the remq client.

mod connection;
mod pool;
mod resolver;

pub use connection::{Connection, ConnectionId, ConnectionState};
pub use pool::{AcquireMode, ConnectionPool, PoolEvent};
pub use resolver::{DnsResolver, Endpoint, EndpointResolver, StaticResolver};

pub(crate) use pool::calculate_backoff_with_jitter;
