//! Client configuration types and builders.

use std::time::Duration;

use crate::connection::Endpoint;

/// Default server endpoint.
const DEFAULT_ADDRESS: &str = "127.0.0.1:6379";
/// Default connection timeout.
const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
/// Default reply deadline for non-blocking commands.
const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);
/// Default extra wait granted to a server reply racing a blocking deadline.
const DEFAULT_TIMEOUT_GRACE: Duration = Duration::from_millis(500);
/// Default number of connections kept open while idle.
const DEFAULT_MIN_IDLE: usize = 1;
/// Default upper bound on open connections.
const DEFAULT_MAX_SIZE: usize = 8;
/// Default connection acquisition timeout.
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(3);
/// Default initial retry backoff.
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
/// Default maximum retry backoff.
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Default retry multiplier.
const DEFAULT_RETRY_MULTIPLIER: f64 = 2.0;

/// Configuration error returned when validation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for remq_core::RemqError {
    fn from(err: ConfigError) -> Self {
        remq_core::RemqError::Configuration(err.message)
    }
}

/// Network timeouts.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    connection_timeout: Duration,
    response_timeout: Duration,
    timeout_grace: Duration,
}

impl NetworkConfig {
    /// Returns the connection timeout duration.
    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }

    /// Returns the reply deadline applied to non-blocking commands.
    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    /// Returns how long a blocking command already on the wire may overrun its
    /// deadline while the server's own timeout reply is on its way.
    pub fn timeout_grace(&self) -> Duration {
        self.timeout_grace
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            timeout_grace: DEFAULT_TIMEOUT_GRACE,
        }
    }
}

/// Builder for `NetworkConfig`.
#[derive(Debug, Clone, Default)]
pub struct NetworkConfigBuilder {
    connection_timeout: Option<Duration>,
    response_timeout: Option<Duration>,
    timeout_grace: Option<Duration>,
}

impl NetworkConfigBuilder {
    /// Creates a new network configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the connection timeout duration.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    /// Sets the reply deadline for non-blocking commands.
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    /// Sets the grace period granted to in-flight blocking replies.
    pub fn timeout_grace(mut self, grace: Duration) -> Self {
        self.timeout_grace = Some(grace);
        self
    }

    /// Builds the network configuration.
    pub fn build(self) -> Result<NetworkConfig, ConfigError> {
        let connection_timeout = self
            .connection_timeout
            .unwrap_or(DEFAULT_CONNECTION_TIMEOUT);
        let response_timeout = self.response_timeout.unwrap_or(DEFAULT_RESPONSE_TIMEOUT);

        if connection_timeout.is_zero() {
            return Err(ConfigError::new("connection_timeout must be positive"));
        }
        if response_timeout.is_zero() {
            return Err(ConfigError::new("response_timeout must be positive"));
        }

        Ok(NetworkConfig {
            connection_timeout,
            response_timeout,
            timeout_grace: self.timeout_grace.unwrap_or(DEFAULT_TIMEOUT_GRACE),
        })
    }
}

/// Connection pool sizing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    min_idle: usize,
    max_size: usize,
    acquire_timeout: Duration,
}

impl PoolConfig {
    /// Returns the number of connections the pool keeps open while idle.
    pub fn min_idle(&self) -> usize {
        self.min_idle
    }

    /// Returns the maximum number of open connections.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Returns how long `acquire` waits before giving up.
    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle: DEFAULT_MIN_IDLE,
            max_size: DEFAULT_MAX_SIZE,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }
}

/// Builder for `PoolConfig`.
#[derive(Debug, Clone, Default)]
pub struct PoolConfigBuilder {
    min_idle: Option<usize>,
    max_size: Option<usize>,
    acquire_timeout: Option<Duration>,
}

impl PoolConfigBuilder {
    /// Creates a new pool configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of connections kept open while idle.
    pub fn min_idle(mut self, min_idle: usize) -> Self {
        self.min_idle = Some(min_idle);
        self
    }

    /// Sets the maximum number of open connections.
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }

    /// Sets the acquisition timeout.
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    /// Builds the pool configuration, returning an error if validation fails.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `max_size` is zero
    /// - `min_idle` exceeds `max_size`
    pub fn build(self) -> Result<PoolConfig, ConfigError> {
        let max_size = self.max_size.unwrap_or(DEFAULT_MAX_SIZE);
        let min_idle = self.min_idle.unwrap_or_else(|| DEFAULT_MIN_IDLE.min(max_size));

        if max_size == 0 {
            return Err(ConfigError::new("max_size must be at least 1"));
        }
        if min_idle > max_size {
            return Err(ConfigError::new("min_idle must not exceed max_size"));
        }

        Ok(PoolConfig {
            min_idle,
            max_size,
            acquire_timeout: self.acquire_timeout.unwrap_or(DEFAULT_ACQUIRE_TIMEOUT),
        })
    }
}

/// Retry configuration for reconnection attempts.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
    jitter: f64,
    max_retries: Option<u32>,
}

impl RetryConfig {
    /// Returns the initial backoff duration.
    pub fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    /// Returns the maximum backoff duration.
    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    /// Returns the backoff multiplier.
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Returns the jitter factor applied to each backoff.
    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Returns the maximum number of reconnect attempts, `None` for unlimited.
    pub fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            multiplier: DEFAULT_RETRY_MULTIPLIER,
            jitter: 0.0,
            max_retries: None,
        }
    }
}

impl From<RetryConfig> for RetryConfigBuilder {
    fn from(config: RetryConfig) -> Self {
        Self {
            initial_backoff: Some(config.initial_backoff),
            max_backoff: Some(config.max_backoff),
            multiplier: Some(config.multiplier),
            jitter: Some(config.jitter),
            max_retries: config.max_retries,
        }
    }
}

/// Builder for `RetryConfig`.
#[derive(Debug, Clone, Default)]
pub struct RetryConfigBuilder {
    initial_backoff: Option<Duration>,
    max_backoff: Option<Duration>,
    multiplier: Option<f64>,
    jitter: Option<f64>,
    max_retries: Option<u32>,
}

impl RetryConfigBuilder {
    /// Creates a new retry configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the initial backoff duration.
    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = Some(backoff);
        self
    }

    /// Sets the maximum backoff duration.
    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = Some(backoff);
        self
    }

    /// Sets the backoff multiplier. A multiplier of 1.0 gives a fixed backoff.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Sets the jitter factor, a fraction in `[0, 1]` of each backoff.
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Caps the number of reconnect attempts after a connection is lost.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Builds the retry configuration, returning an error if validation fails.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `initial_backoff` exceeds `max_backoff`
    /// - `multiplier` is less than 1.0
    /// - `jitter` lies outside `[0, 1]`
    pub fn build(self) -> Result<RetryConfig, ConfigError> {
        let initial_backoff = self.initial_backoff.unwrap_or(DEFAULT_INITIAL_BACKOFF);
        let max_backoff = self.max_backoff.unwrap_or(DEFAULT_MAX_BACKOFF);
        let multiplier = self.multiplier.unwrap_or(DEFAULT_RETRY_MULTIPLIER);
        let jitter = self.jitter.unwrap_or(0.0);

        if initial_backoff > max_backoff {
            return Err(ConfigError::new(
                "initial_backoff must not exceed max_backoff",
            ));
        }

        if multiplier < 1.0 {
            return Err(ConfigError::new("multiplier must be at least 1.0"));
        }

        if !(0.0..=1.0).contains(&jitter) {
            return Err(ConfigError::new("jitter must be between 0.0 and 1.0"));
        }

        Ok(RetryConfig {
            initial_backoff,
            max_backoff,
            multiplier,
            jitter,
            max_retries: self.max_retries,
        })
    }
}

/// Top-level client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    endpoint: Endpoint,
    client_name: Option<String>,
    database: Option<u32>,
    network: NetworkConfig,
    pool: PoolConfig,
    retry: RetryConfig,
}

impl ClientConfig {
    /// Creates a new client configuration builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// Returns the server endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Returns the name announced with `CLIENT SETNAME`, if any.
    pub fn client_name(&self) -> Option<&str> {
        self.client_name.as_deref()
    }

    /// Returns the logical database selected on every connection, if any.
    pub fn database(&self) -> Option<u32> {
        self.database
    }

    /// Returns the network configuration.
    pub fn network(&self) -> &NetworkConfig {
        &self.network
    }

    /// Returns the pool configuration.
    pub fn pool(&self) -> &PoolConfig {
        &self.pool
    }

    /// Returns the retry configuration.
    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::new("127.0.0.1", 6379),
            client_name: None,
            database: None,
            network: NetworkConfig::default(),
            pool: PoolConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// Builder for `ClientConfig`.
#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    address: Option<String>,
    client_name: Option<String>,
    database: Option<u32>,
    network: NetworkConfigBuilder,
    pool: PoolConfigBuilder,
    retry: RetryConfigBuilder,
}

impl ClientConfigBuilder {
    /// Creates a new client configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the server address, as `host:port` or `redis://host:port`.
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Sets the name announced on every connection.
    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    /// Selects a logical database on every connection.
    pub fn database(mut self, database: u32) -> Self {
        self.database = Some(database);
        self
    }

    /// Configures network settings using a builder function.
    pub fn network<F>(mut self, f: F) -> Self
    where
        F: FnOnce(NetworkConfigBuilder) -> NetworkConfigBuilder,
    {
        self.network = f(self.network);
        self
    }

    /// Configures pool settings using a builder function.
    pub fn pool<F>(mut self, f: F) -> Self
    where
        F: FnOnce(PoolConfigBuilder) -> PoolConfigBuilder,
    {
        self.pool = f(self.pool);
        self
    }

    /// Configures retry settings using a builder function.
    pub fn retry<F>(mut self, f: F) -> Self
    where
        F: FnOnce(RetryConfigBuilder) -> RetryConfigBuilder,
    {
        self.retry = f(self.retry);
        self
    }

    /// Sets the connection timeout.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.network = self.network.connection_timeout(timeout);
        self
    }

    /// Sets the reply deadline for non-blocking commands.
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.network = self.network.response_timeout(timeout);
        self
    }

    /// Builds the client configuration, returning an error if validation fails.
    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        let address = self.address.as_deref().unwrap_or(DEFAULT_ADDRESS);
        let endpoint: Endpoint = address
            .parse()
            .map_err(|e| ConfigError::new(format!("invalid address '{}': {}", address, e)))?;

        if let Some(name) = &self.client_name {
            if name.is_empty() || name.contains(char::is_whitespace) {
                return Err(ConfigError::new(
                    "client_name must be non-empty and contain no whitespace",
                ));
            }
        }

        let network = self.network.build()?;
        let pool = self.pool.build()?;
        let retry = self.retry.build()?;

        Ok(ClientConfig {
            endpoint,
            client_name: self.client_name,
            database: self.database,
            network,
            pool,
            retry,
        })
    }
}
