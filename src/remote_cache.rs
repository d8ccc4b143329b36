use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use log::{info, warn};
use parking_lot::Mutex;

use crate::{
    HotRodError, HotRodResult,
    configuration::Configuration,
    operations::{MetadataValue, Operation, OperationsFactory, VersionedValue, WriteOutcome},
    protocol::{Flags, codec_for_version},
    transport::TransportFactory,
};

/// Entry point of the client: owns the connections to the cluster and hands out caches.
///
/// ```no_run
/// use hotrod::{ConfigurationBuilder, RemoteCacheManager};
///
/// let config = ConfigurationBuilder::new().add_servers("127.0.0.1:11222").build()?;
/// let manager = RemoteCacheManager::new(config, true)?;
/// let cache = manager.cache("books")?;
/// cache.put(b"isbn:0131103628", b"The C Programming Language")?;
/// manager.stop();
/// # Ok::<(), hotrod::HotRodError>(())
/// ```
#[derive(Debug)]
pub struct RemoteCacheManager {
    config: Configuration,
    transport_factory: Mutex<Option<Arc<TransportFactory>>>,
}

impl RemoteCacheManager {
    pub fn new(config: Configuration, start: bool) -> HotRodResult<Self> {
        let manager = Self {
            config,
            transport_factory: Mutex::new(None),
        };
        if start {
            manager.start()?;
        }
        Ok(manager)
    }

    pub fn configuration(&self) -> &Configuration {
        &self.config
    }

    /// Creates the connection pool and, if configured, pings every server once.
    pub fn start(&self) -> HotRodResult<()> {
        let mut slot = self.transport_factory.lock();
        if slot.is_some() {
            return Ok(());
        }
        if self.config.ssl().enabled() {
            return Err(HotRodError::Configuration(
                "SSL transports are not supported by this client".to_string(),
            ));
        }

        let codec = codec_for_version(self.config.protocol_version())?;
        let factory = Arc::new(TransportFactory::new(&self.config, codec));

        if self.config.ping_on_startup() {
            let ping = OperationsFactory::new(Arc::clone(&factory), "", &self.config)
                .new_ping_operation();
            for server in self.config.servers() {
                let address = server.address();
                match ping.execute_on(&address) {
                    Ok(()) => info!("server {address} is reachable"),
                    Err(e) => warn!("could not ping {address} on startup: {e}"),
                }
            }
        }

        info!(
            "remote cache manager started with {} server(s), protocol {}",
            self.config.servers().len(),
            self.config.protocol_version()
        );
        *slot = Some(factory);
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.transport_factory.lock().is_some()
    }

    /// Closes every connection. Caches obtained earlier fail from now on.
    pub fn stop(&self) {
        if let Some(factory) = self.transport_factory.lock().take() {
            factory.destroy();
            info!("remote cache manager stopped");
        }
    }

    /// Cache named `name`; the empty name selects the server's default cache.
    ///
    /// Fails with [`HotRodError::Configuration`] when the manager is not started.
    pub fn cache(&self, name: &str) -> HotRodResult<RemoteCache> {
        let factory = self.transport_factory.lock().clone().ok_or_else(|| {
            HotRodError::Configuration("remote cache manager is not started".to_string())
        })?;
        Ok(RemoteCache {
            name: name.to_string(),
            operations: OperationsFactory::new(factory, name, &self.config),
        })
    }
}

impl Drop for RemoteCacheManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Byte-oriented view of one remote cache.
///
/// Every call builds an operation and executes it on the caller's thread.
#[derive(Debug, Clone)]
pub struct RemoteCache {
    name: String,
    operations: OperationsFactory,
}

impl RemoteCache {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Same cache, with `flags` added to every request.
    pub fn with_flags(&self, flags: Flags) -> Self {
        Self {
            name: self.name.clone(),
            operations: self.operations.with_flags(flags),
        }
    }

    pub fn get(&self, key: &[u8]) -> HotRodResult<Option<Vec<u8>>> {
        self.operations.new_get_operation(key).execute()
    }

    /// Stores `value`; returns the previous value only when return values are forced.
    pub fn put(&self, key: &[u8], value: &[u8]) -> HotRodResult<Option<Vec<u8>>> {
        self.put_with_expiration(key, value, None, None)
    }

    pub fn put_with_expiration(
        &self,
        key: &[u8],
        value: &[u8],
        lifespan: Option<Duration>,
        max_idle: Option<Duration>,
    ) -> HotRodResult<Option<Vec<u8>>> {
        self.operations
            .new_put_operation(key, value, lifespan, max_idle)
            .execute()
    }

    pub fn put_if_absent(&self, key: &[u8], value: &[u8]) -> HotRodResult<WriteOutcome> {
        self.operations
            .new_put_if_absent_operation(key, value, None, None)
            .execute()
    }

    pub fn replace(&self, key: &[u8], value: &[u8]) -> HotRodResult<WriteOutcome> {
        self.operations
            .new_replace_operation(key, value, None, None)
            .execute()
    }

    pub fn replace_with_version(
        &self,
        key: &[u8],
        value: &[u8],
        version: u64,
    ) -> HotRodResult<WriteOutcome> {
        self.operations
            .new_replace_if_unmodified_operation(key, value, version, None, None)
            .execute()
    }

    pub fn remove(&self, key: &[u8]) -> HotRodResult<WriteOutcome> {
        self.operations.new_remove_operation(key).execute()
    }

    pub fn remove_with_version(&self, key: &[u8], version: u64) -> HotRodResult<WriteOutcome> {
        self.operations
            .new_remove_if_unmodified_operation(key, version)
            .execute()
    }

    pub fn contains_key(&self, key: &[u8]) -> HotRodResult<bool> {
        self.operations.new_contains_key_operation(key).execute()
    }

    pub fn get_versioned(&self, key: &[u8]) -> HotRodResult<Option<VersionedValue>> {
        self.operations.new_get_with_version_operation(key).execute()
    }

    pub fn get_with_metadata(&self, key: &[u8]) -> HotRodResult<Option<MetadataValue>> {
        self.operations.new_get_with_metadata_operation(key).execute()
    }

    /// Up to `count` entries, or all of them when `count` is 0.
    pub fn get_bulk(&self, count: u32) -> HotRodResult<HashMap<Vec<u8>, Vec<u8>>> {
        self.operations.new_bulk_get_operation(count).execute()
    }

    pub fn key_set(&self) -> HotRodResult<HashSet<Vec<u8>>> {
        self.operations.new_bulk_get_keys_operation(0).execute()
    }

    pub fn clear(&self) -> HotRodResult<()> {
        self.operations.new_clear_operation().execute()
    }

    pub fn stats(&self) -> HotRodResult<HashMap<String, String>> {
        self.operations.new_stats_operation().execute()
    }

    pub fn ping(&self) -> HotRodResult<()> {
        self.operations.new_ping_operation().execute()
    }
}
