use std::{collections::HashSet, time::Duration};

use log::warn;

use crate::{
    HotRodError, HotRodResult,
    protocol::ProtocolVersion,
};

use super::{
    Configuration, ConnectionPoolConfiguration, DEFAULT_HOST, DEFAULT_PORT, ExhaustedAction,
    ServerConfiguration, SslConfiguration,
};

const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_SOCKET_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_KEY_SIZE_ESTIMATE: usize = 64;
const DEFAULT_VALUE_SIZE_ESTIMATE: usize = 512;
const DEFAULT_MAX_RETRIES: usize = 1;
const DEFAULT_SERVER_FAILURE_COOLDOWN_MS: u64 = 5_000;

/// Converts the `-1 means unbounded` convention of the pool settings.
fn bounded(value: i32) -> Option<usize> {
    usize::try_from(value).ok()
}

fn millis(value: i64) -> Option<Duration> {
    u64::try_from(value).ok().map(Duration::from_millis)
}

/// Millisecond settings where anything `<= 0` disables the feature.
fn positive_millis(value: i64) -> Option<Duration> {
    millis(value).filter(|d| !d.is_zero())
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfigurationBuilder {
    host: Option<String>,
    port: Option<u16>,
}

impl ServerConfigurationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn create(self) -> ServerConfiguration {
        ServerConfiguration::new(
            self.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            self.port.unwrap_or(DEFAULT_PORT),
        )
    }
}

/// Pool settings, using the `-1 = unbounded` and millisecond conventions of the Hot Rod
/// client properties.
#[derive(Debug, Clone)]
pub struct ConnectionPoolConfigurationBuilder {
    exhausted_action: ExhaustedAction,
    lifo: bool,
    max_active: i32,
    max_total: i32,
    max_idle: i32,
    min_idle: i32,
    max_wait: i64,
    time_between_eviction_runs: i64,
    min_evictable_idle_time: i64,
    num_tests_per_eviction_run: i32,
    test_on_borrow: bool,
    test_on_return: bool,
    test_while_idle: bool,
}

impl Default for ConnectionPoolConfigurationBuilder {
    fn default() -> Self {
        Self {
            exhausted_action: ExhaustedAction::Wait,
            lifo: true,
            max_active: -1,
            max_total: -1,
            max_idle: -1,
            min_idle: 1,
            max_wait: -1,
            time_between_eviction_runs: 120_000,
            min_evictable_idle_time: 1_800_000,
            num_tests_per_eviction_run: 3,
            test_on_borrow: false,
            test_on_return: false,
            test_while_idle: true,
        }
    }
}

impl ConnectionPoolConfigurationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exhausted_action(mut self, action: ExhaustedAction) -> Self {
        self.exhausted_action = action;
        self
    }

    pub fn lifo(mut self, lifo: bool) -> Self {
        self.lifo = lifo;
        self
    }

    pub fn max_active(mut self, max_active: i32) -> Self {
        self.max_active = max_active;
        self
    }

    pub fn max_total(mut self, max_total: i32) -> Self {
        self.max_total = max_total;
        self
    }

    pub fn max_idle(mut self, max_idle: i32) -> Self {
        self.max_idle = max_idle;
        self
    }

    pub fn min_idle(mut self, min_idle: i32) -> Self {
        self.min_idle = min_idle;
        self
    }

    /// Milliseconds; `0` does not wait, negative waits forever.
    pub fn max_wait(mut self, max_wait_ms: i64) -> Self {
        self.max_wait = max_wait_ms;
        self
    }

    /// Milliseconds; `<= 0` disables the background evictor.
    pub fn time_between_eviction_runs(mut self, interval_ms: i64) -> Self {
        self.time_between_eviction_runs = interval_ms;
        self
    }

    pub fn min_evictable_idle_time(mut self, idle_ms: i64) -> Self {
        self.min_evictable_idle_time = idle_ms;
        self
    }

    pub fn num_tests_per_eviction_run(mut self, tests: i32) -> Self {
        self.num_tests_per_eviction_run = tests;
        self
    }

    pub fn test_on_borrow(mut self, test: bool) -> Self {
        self.test_on_borrow = test;
        self
    }

    pub fn test_on_return(mut self, test: bool) -> Self {
        self.test_on_return = test;
        self
    }

    pub fn test_while_idle(mut self, test: bool) -> Self {
        self.test_while_idle = test;
        self
    }

    pub fn read(mut self, bean: &ConnectionPoolConfiguration) -> Self {
        let signed = |v: Option<usize>| v.map_or(-1, |v| i32::try_from(v).unwrap_or(i32::MAX));
        let ms = |v: Option<Duration>| {
            v.map_or(-1, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        };

        self.exhausted_action = bean.exhausted_action;
        self.lifo = bean.lifo;
        self.max_active = signed(bean.max_active);
        self.max_total = signed(bean.max_total);
        self.max_idle = signed(bean.max_idle);
        self.min_idle = signed(Some(bean.min_idle));
        self.max_wait = ms(bean.max_wait);
        self.time_between_eviction_runs = ms(bean.time_between_eviction_runs);
        self.min_evictable_idle_time = ms(bean.min_evictable_idle_time);
        self.num_tests_per_eviction_run = signed(Some(bean.num_tests_per_eviction_run));
        self.test_on_borrow = bean.test_on_borrow;
        self.test_on_return = bean.test_on_return;
        self.test_while_idle = bean.test_while_idle;
        self
    }

    pub fn create(self) -> ConnectionPoolConfiguration {
        ConnectionPoolConfiguration {
            exhausted_action: self.exhausted_action,
            lifo: self.lifo,
            max_active: bounded(self.max_active).filter(|v| *v > 0),
            max_total: bounded(self.max_total).filter(|v| *v > 0),
            max_idle: bounded(self.max_idle),
            min_idle: bounded(self.min_idle).unwrap_or(0),
            max_wait: millis(self.max_wait),
            time_between_eviction_runs: positive_millis(self.time_between_eviction_runs),
            min_evictable_idle_time: positive_millis(self.min_evictable_idle_time),
            num_tests_per_eviction_run: bounded(self.num_tests_per_eviction_run).unwrap_or(0),
            test_on_borrow: self.test_on_borrow,
            test_on_return: self.test_on_return,
            test_while_idle: self.test_while_idle,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SslConfigurationBuilder {
    enabled: bool,
    server_ca_file: Option<String>,
    client_certificate_file: Option<String>,
}

impl SslConfigurationBuilder {
    pub fn enable(mut self) -> Self {
        self.enabled = true;
        self
    }

    pub fn disable(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn server_ca_file(mut self, path: impl Into<String>) -> Self {
        self.server_ca_file = Some(path.into());
        self
    }

    pub fn client_certificate_file(mut self, path: impl Into<String>) -> Self {
        self.client_certificate_file = Some(path.into());
        self
    }

    pub fn read(mut self, bean: &SslConfiguration) -> Self {
        self.enabled = bean.enabled;
        self.server_ca_file = bean.server_ca_file.clone();
        self.client_certificate_file = bean.client_certificate_file.clone();
        self
    }

    pub fn create(self) -> SslConfiguration {
        SslConfiguration {
            enabled: self.enabled,
            server_ca_file: self.server_ca_file,
            client_certificate_file: self.client_certificate_file,
        }
    }
}

/// Fluent builder for [`Configuration`].
///
/// Setters never fail; malformed input (for instance an unparsable port in
/// [`add_servers`](Self::add_servers)) is remembered and reported by [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct ConfigurationBuilder {
    protocol_version: String,
    servers: Vec<ServerConfigurationBuilder>,
    connection_pool: ConnectionPoolConfigurationBuilder,
    ssl: SslConfigurationBuilder,
    connection_timeout: Duration,
    socket_timeout: Duration,
    force_return_values: bool,
    ping_on_startup: bool,
    tcp_no_delay: bool,
    key_size_estimate: usize,
    value_size_estimate: usize,
    max_retries: usize,
    server_failure_cooldown: Duration,
    errors: Vec<String>,
}

impl Default for ConfigurationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigurationBuilder {
    pub fn new() -> Self {
        Self {
            protocol_version: ProtocolVersion::default().to_string(),
            servers: Vec::new(),
            connection_pool: ConnectionPoolConfigurationBuilder::default(),
            ssl: SslConfigurationBuilder::default(),
            connection_timeout: Duration::from_millis(DEFAULT_CONNECTION_TIMEOUT_MS),
            socket_timeout: Duration::from_millis(DEFAULT_SOCKET_TIMEOUT_MS),
            force_return_values: false,
            ping_on_startup: true,
            tcp_no_delay: true,
            key_size_estimate: DEFAULT_KEY_SIZE_ESTIMATE,
            value_size_estimate: DEFAULT_VALUE_SIZE_ESTIMATE,
            max_retries: DEFAULT_MAX_RETRIES,
            server_failure_cooldown: Duration::from_millis(DEFAULT_SERVER_FAILURE_COOLDOWN_MS),
            errors: Vec::new(),
        }
    }

    pub fn add_server<F>(mut self, f: F) -> Self
    where
        F: FnOnce(ServerConfigurationBuilder) -> ServerConfigurationBuilder,
    {
        self.servers.push(f(ServerConfigurationBuilder::new()));
        self
    }

    /// Adds every server of a `host[:port];host[:port]...` list. A missing port means 11222.
    pub fn add_servers(mut self, servers: &str) -> Self {
        for entry in servers.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let (host, port) = match entry.rsplit_once(':') {
                Some((host, port)) => match port.trim().parse::<u16>() {
                    Ok(port) => (host.trim(), port),
                    Err(_) => {
                        self.errors
                            .push(format!("invalid port in server entry '{entry}'"));
                        continue;
                    }
                },
                None => (entry, DEFAULT_PORT),
            };

            if host.is_empty() {
                self.errors
                    .push(format!("missing host in server entry '{entry}'"));
                continue;
            }
            self.servers
                .push(ServerConfigurationBuilder::new().host(host).port(port));
        }
        self
    }

    pub fn connection_pool<F>(mut self, f: F) -> Self
    where
        F: FnOnce(ConnectionPoolConfigurationBuilder) -> ConnectionPoolConfigurationBuilder,
    {
        self.connection_pool = f(self.connection_pool);
        self
    }

    pub fn ssl<F>(mut self, f: F) -> Self
    where
        F: FnOnce(SslConfigurationBuilder) -> SslConfigurationBuilder,
    {
        self.ssl = f(self.ssl);
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    pub fn force_return_values(mut self, force: bool) -> Self {
        self.force_return_values = force;
        self
    }

    pub fn ping_on_startup(mut self, ping: bool) -> Self {
        self.ping_on_startup = ping;
        self
    }

    pub fn tcp_no_delay(mut self, no_delay: bool) -> Self {
        self.tcp_no_delay = no_delay;
        self
    }

    pub fn key_size_estimate(mut self, estimate: usize) -> Self {
        self.key_size_estimate = estimate;
        self
    }

    pub fn value_size_estimate(mut self, estimate: usize) -> Self {
        self.value_size_estimate = estimate;
        self
    }

    pub fn protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }

    pub fn max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn server_failure_cooldown(mut self, cooldown: Duration) -> Self {
        self.server_failure_cooldown = cooldown;
        self
    }

    /// Replaces every setting with the values held by an existing configuration.
    pub fn read(mut self, bean: &Configuration) -> Self {
        self.protocol_version = bean.protocol_version.clone();
        self.servers = bean
            .servers
            .iter()
            .map(|s| ServerConfigurationBuilder::new().host(s.host()).port(s.port()))
            .collect();
        self.connection_pool = ConnectionPoolConfigurationBuilder::new().read(&bean.connection_pool);
        self.ssl = SslConfigurationBuilder::default().read(&bean.ssl);
        self.connection_timeout = bean.connection_timeout;
        self.socket_timeout = bean.socket_timeout;
        self.force_return_values = bean.force_return_values;
        self.ping_on_startup = bean.ping_on_startup;
        self.tcp_no_delay = bean.tcp_no_delay;
        self.key_size_estimate = bean.key_size_estimate;
        self.value_size_estimate = bean.value_size_estimate;
        self.max_retries = bean.max_retries;
        self.server_failure_cooldown = bean.server_failure_cooldown;
        self.errors.clear();
        self
    }

    /// Validates the collected settings and produces the immutable configuration.
    pub fn create(self) -> HotRodResult<Configuration> {
        if !self.errors.is_empty() {
            return Err(HotRodError::Configuration(self.errors.join("; ")));
        }
        ProtocolVersion::parse(&self.protocol_version)?;

        Ok(self.create_unchecked())
    }

    pub fn build(self) -> HotRodResult<Configuration> {
        self.create()
    }

    pub(crate) fn create_unchecked(self) -> Configuration {
        let mut seen = HashSet::new();
        let mut servers = Vec::with_capacity(self.servers.len());
        for server in self.servers.into_iter().map(ServerConfigurationBuilder::create) {
            if seen.insert(server.clone()) {
                servers.push(server);
            } else {
                warn!(
                    "ignoring duplicate server {}:{}",
                    server.host(),
                    server.port()
                );
            }
        }
        if servers.is_empty() {
            servers.push(ServerConfiguration::new(DEFAULT_HOST, DEFAULT_PORT));
        }

        Configuration {
            protocol_version: self.protocol_version,
            servers,
            connection_pool: self.connection_pool.create(),
            connection_timeout: self.connection_timeout,
            socket_timeout: self.socket_timeout,
            force_return_values: self.force_return_values,
            ping_on_startup: self.ping_on_startup,
            tcp_no_delay: self.tcp_no_delay,
            key_size_estimate: self.key_size_estimate,
            value_size_estimate: self.value_size_estimate,
            max_retries: self.max_retries,
            server_failure_cooldown: self.server_failure_cooldown,
            ssl: self.ssl.create(),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn create_defaults_to_local_server() {
        let config = ConfigurationBuilder::new().create().unwrap();

        assert_eq!(
            config.servers(),
            &[ServerConfiguration::new("127.0.0.1", 11222)]
        );
        assert_eq!(config.protocol_version(), "1.2");
        assert!(config.ping_on_startup());
        assert!(config.tcp_no_delay());
    }

    #[test]
    fn add_servers_splits_entries() {
        let config = ConfigurationBuilder::new()
            .add_servers("a:11222;b:11223")
            .create()
            .unwrap();

        assert_eq!(
            config.servers(),
            &[
                ServerConfiguration::new("a", 11222),
                ServerConfiguration::new("b", 11223)
            ]
        );
    }

    #[rstest]
    #[case("a", "a", 11222)]
    #[case(" a:1234 ", "a", 1234)]
    #[case("a:1234;", "a", 1234)]
    fn add_servers_single_entry(#[case] input: &str, #[case] host: &str, #[case] port: u16) {
        let config = ConfigurationBuilder::new()
            .add_servers(input)
            .create()
            .unwrap();

        assert_eq!(config.servers(), &[ServerConfiguration::new(host, port)]);
    }

    #[rstest]
    #[case("a:port")]
    #[case("a:70000")]
    #[case(":11222")]
    fn add_servers_rejects_malformed_entries(#[case] input: &str) {
        let err = ConfigurationBuilder::new()
            .add_servers(input)
            .create()
            .unwrap_err();

        assert!(matches!(err, HotRodError::Configuration(_)));
    }

    #[test]
    fn duplicate_servers_collapse() {
        let config = ConfigurationBuilder::new()
            .add_servers("a:1;a:1")
            .add_server(|s| s.host("a").port(1))
            .create()
            .unwrap();

        assert_eq!(config.servers().len(), 1);
    }

    #[test]
    fn unknown_protocol_version_fails_fast() {
        let err = ConfigurationBuilder::new()
            .protocol_version("9.9")
            .create()
            .unwrap_err();

        assert!(matches!(err, HotRodError::UnsupportedProtocol(v) if v == "9.9"));
    }

    #[test]
    fn pool_sentinels_become_unbounded() {
        let pool = ConnectionPoolConfigurationBuilder::new()
            .max_active(-1)
            .max_idle(-1)
            .max_wait(-1)
            .time_between_eviction_runs(0)
            .create();

        assert_eq!(pool.max_active(), None);
        assert_eq!(pool.max_idle(), None);
        assert_eq!(pool.max_wait(), None);
        assert_eq!(pool.time_between_eviction_runs(), None);
        assert_eq!(pool.exhausted_action(), ExhaustedAction::Wait);
    }

    #[test]
    fn zero_max_wait_means_no_waiting() {
        let pool = ConnectionPoolConfigurationBuilder::new().max_wait(0).create();

        assert_eq!(pool.max_wait(), Some(Duration::ZERO));
    }

    #[test]
    fn read_copies_existing_configuration() {
        let original = ConfigurationBuilder::new()
            .add_servers("a:1;b:2")
            .protocol_version("1.1")
            .force_return_values(true)
            .socket_timeout(Duration::from_millis(250))
            .connection_pool(|p| {
                p.exhausted_action(ExhaustedAction::CreateNew)
                    .max_active(3)
                    .max_wait(40)
            })
            .ssl(|s| s.enable().server_ca_file("ca.pem"))
            .create()
            .unwrap();

        let copy = ConfigurationBuilder::new().read(&original).create().unwrap();

        assert_eq!(copy, original);
    }
}
