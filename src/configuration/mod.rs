//! Immutable client configuration.
//!
//! A [`Configuration`] is produced once by a [`ConfigurationBuilder`] and only read afterwards:
//! the transport factory, connection pool and operations factory copy what they need from it when
//! they are constructed.
//!
//! # Example
//! ```rust
//! use hotrod::configuration::{ConfigurationBuilder, ExhaustedAction};
//!
//! let config = ConfigurationBuilder::new()
//!     .add_servers("node1:11222;node2:11223")
//!     .connection_pool(|pool| pool.exhausted_action(ExhaustedAction::Fail).max_active(4))
//!     .force_return_values(true)
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.servers().len(), 2);
//! assert_eq!(config.connection_pool().max_active(), Some(4));
//! ```
mod builder;

use std::time::Duration;

pub use builder::{
    ConfigurationBuilder, ConnectionPoolConfigurationBuilder, ServerConfigurationBuilder,
    SslConfigurationBuilder,
};

use crate::transport::ServerAddress;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 11222;

/// What the pool does when a server has no idle transport and no capacity left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExhaustedAction {
    /// Fail immediately with `PoolExhausted`.
    Fail,
    /// Block the caller up to the configured max wait.
    #[default]
    Wait,
    /// Open a transport anyway, transiently exceeding the caps.
    CreateNew,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerConfiguration {
    host: String,
    port: u16,
}

impl ServerConfiguration {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn address(&self) -> ServerAddress {
        ServerAddress::new(self.host.clone(), self.port)
    }
}

/// Pool tuning. Unset limits (`None`) mean unbounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionPoolConfiguration {
    pub(crate) exhausted_action: ExhaustedAction,
    pub(crate) lifo: bool,
    pub(crate) max_active: Option<usize>,
    pub(crate) max_total: Option<usize>,
    pub(crate) max_idle: Option<usize>,
    pub(crate) min_idle: usize,
    pub(crate) max_wait: Option<Duration>,
    pub(crate) time_between_eviction_runs: Option<Duration>,
    pub(crate) min_evictable_idle_time: Option<Duration>,
    pub(crate) num_tests_per_eviction_run: usize,
    pub(crate) test_on_borrow: bool,
    pub(crate) test_on_return: bool,
    pub(crate) test_while_idle: bool,
}

impl ConnectionPoolConfiguration {
    pub fn exhausted_action(&self) -> ExhaustedAction {
        self.exhausted_action
    }

    pub fn lifo(&self) -> bool {
        self.lifo
    }

    /// Per-server cap on idle plus in-use transports.
    pub fn max_active(&self) -> Option<usize> {
        self.max_active
    }

    /// Cap on idle plus in-use transports across every server.
    pub fn max_total(&self) -> Option<usize> {
        self.max_total
    }

    pub fn max_idle(&self) -> Option<usize> {
        self.max_idle
    }

    pub fn min_idle(&self) -> usize {
        self.min_idle
    }

    /// `None` waits forever, `Some(Duration::ZERO)` does not wait at all.
    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait
    }

    pub fn time_between_eviction_runs(&self) -> Option<Duration> {
        self.time_between_eviction_runs
    }

    pub fn min_evictable_idle_time(&self) -> Option<Duration> {
        self.min_evictable_idle_time
    }

    pub fn num_tests_per_eviction_run(&self) -> usize {
        self.num_tests_per_eviction_run
    }

    pub fn test_on_borrow(&self) -> bool {
        self.test_on_borrow
    }

    pub fn test_on_return(&self) -> bool {
        self.test_on_return
    }

    pub fn test_while_idle(&self) -> bool {
        self.test_while_idle
    }
}

impl Default for ConnectionPoolConfiguration {
    fn default() -> Self {
        ConnectionPoolConfigurationBuilder::default().create()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SslConfiguration {
    pub(crate) enabled: bool,
    pub(crate) server_ca_file: Option<String>,
    pub(crate) client_certificate_file: Option<String>,
}

impl SslConfiguration {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn server_ca_file(&self) -> Option<&str> {
        self.server_ca_file.as_deref()
    }

    pub fn client_certificate_file(&self) -> Option<&str> {
        self.client_certificate_file.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    pub(crate) protocol_version: String,
    pub(crate) servers: Vec<ServerConfiguration>,
    pub(crate) connection_pool: ConnectionPoolConfiguration,
    pub(crate) connection_timeout: Duration,
    pub(crate) socket_timeout: Duration,
    pub(crate) force_return_values: bool,
    pub(crate) ping_on_startup: bool,
    pub(crate) tcp_no_delay: bool,
    pub(crate) key_size_estimate: usize,
    pub(crate) value_size_estimate: usize,
    pub(crate) max_retries: usize,
    pub(crate) server_failure_cooldown: Duration,
    pub(crate) ssl: SslConfiguration,
}

impl Configuration {
    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    /// Never empty.
    pub fn servers(&self) -> &[ServerConfiguration] {
        &self.servers
    }

    pub fn connection_pool(&self) -> &ConnectionPoolConfiguration {
        &self.connection_pool
    }

    /// `Duration::ZERO` means no timeout.
    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }

    /// `Duration::ZERO` means no timeout.
    pub fn socket_timeout(&self) -> Duration {
        self.socket_timeout
    }

    pub fn force_return_values(&self) -> bool {
        self.force_return_values
    }

    pub fn ping_on_startup(&self) -> bool {
        self.ping_on_startup
    }

    pub fn tcp_no_delay(&self) -> bool {
        self.tcp_no_delay
    }

    pub fn key_size_estimate(&self) -> usize {
        self.key_size_estimate
    }

    pub fn value_size_estimate(&self) -> usize {
        self.value_size_estimate
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    pub fn server_failure_cooldown(&self) -> Duration {
        self.server_failure_cooldown
    }

    pub fn ssl(&self) -> &SslConfiguration {
        &self.ssl
    }
}

impl Default for Configuration {
    fn default() -> Self {
        ConfigurationBuilder::new().create_unchecked()
    }
}
