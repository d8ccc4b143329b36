use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::{
    HotRodError, HotRodResult,
    configuration::Configuration,
    protocol::{Codec, TopologyUpdate},
};

use super::{ConnectionPool, Connector, PooledTransport, ServerAddress, TcpConnector, TopologyInfo};

/// Routes requests to servers and owns the pool they are served from.
///
/// The factory holds the current [`TopologyInfo`], which only ever moves forward: an update is
/// installed when its id is greater than the current one. Servers that fail at the transport level
/// are kept out of the candidate set for a cooldown period.
#[derive(Debug)]
pub struct TransportFactory {
    codec: Arc<dyn Codec>,
    pool: ConnectionPool,
    topology: RwLock<TopologyInfo>,
    round_robin: AtomicUsize,
    suspects: Mutex<HashMap<ServerAddress, Instant>>,
    failure_cooldown: Duration,
    message_ids: Arc<AtomicU64>,
}

impl TransportFactory {
    pub fn new(config: &Configuration, codec: Arc<dyn Codec>) -> Self {
        let message_ids = Arc::new(AtomicU64::new(1));
        let connector = Arc::new(TcpConnector::new(
            config,
            Arc::clone(&codec),
            Arc::clone(&message_ids),
        ));
        Self::with_connector(config, codec, connector, message_ids)
    }

    pub(crate) fn with_connector(
        config: &Configuration,
        codec: Arc<dyn Codec>,
        connector: Arc<dyn Connector>,
        message_ids: Arc<AtomicU64>,
    ) -> Self {
        let servers = config.servers().iter().map(|s| s.address()).collect();
        Self {
            codec,
            pool: ConnectionPool::new(config.connection_pool().clone(), connector),
            topology: RwLock::new(TopologyInfo::new(servers)),
            round_robin: AtomicUsize::new(0),
            suspects: Mutex::new(HashMap::new()),
            failure_cooldown: config.server_failure_cooldown(),
            message_ids,
        }
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn next_message_id(&self) -> u64 {
        self.message_ids.fetch_add(1, Ordering::Relaxed)
    }

    pub fn topology_id(&self) -> u32 {
        self.topology.read().topology_id()
    }

    pub fn servers(&self) -> Vec<ServerAddress> {
        self.topology.read().servers().to_vec()
    }

    /// Checks out a transport for a request on `key`, skipping `excluded` servers.
    ///
    /// The key's owner is used when the topology carries a hash ring and the owner is a
    /// candidate; otherwise servers take turns.
    pub fn get_transport(
        &self,
        key: Option<&[u8]>,
        excluded: &HashSet<ServerAddress>,
    ) -> HotRodResult<PooledTransport> {
        let address = self.select_server(key, excluded)?;
        self.pool.acquire(&address)
    }

    fn select_server(
        &self,
        key: Option<&[u8]>,
        excluded: &HashSet<ServerAddress>,
    ) -> HotRodResult<ServerAddress> {
        let topology = self.topology.read();
        let not_excluded: Vec<&ServerAddress> = topology
            .servers()
            .iter()
            .filter(|s| !excluded.contains(*s))
            .collect();

        let mut candidates = {
            let mut suspects = self.suspects.lock();
            let now = Instant::now();
            suspects.retain(|_, until| *until > now);
            not_excluded
                .iter()
                .copied()
                .filter(|s| !suspects.contains_key(*s))
                .collect::<Vec<_>>()
        };
        if candidates.is_empty() {
            // everything left is suspect; trying one beats failing outright
            candidates = not_excluded;
        }
        if candidates.is_empty() {
            return Err(HotRodError::NoServerAvailable(format!(
                "all {} servers failed for this request",
                topology.servers().len()
            )));
        }

        if let (Some(key), Some(hash)) = (key, topology.consistent_hash()) {
            if let Some(owner) = hash.server_for(key) {
                if candidates.contains(&owner) {
                    return Ok(owner.clone());
                }
                debug!("owner {owner} of key is unavailable, picking another server");
            }
        }

        let next = self.round_robin.fetch_add(1, Ordering::Relaxed);
        Ok(candidates[next % candidates.len()].clone())
    }

    /// Installs a topology received in a response header if it is newer than the current one.
    pub fn update_topology(&self, update: &TopologyUpdate) -> bool {
        let applied = {
            let mut topology = self.topology.write();
            topology.apply(update)
        };
        if applied {
            info!(
                "installed topology {} with servers [{}]",
                update.topology_id,
                update
                    .servers
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            self.pool.retain(&update.servers);
        } else {
            debug!("ignoring topology {}", update.topology_id);
        }
        applied
    }

    /// Keeps `address` out of the candidate set for the failure cooldown and drops its idle
    /// transports.
    pub fn mark_suspect(&self, address: &ServerAddress) {
        warn!(
            "marking {address} as failed for {:?}",
            self.failure_cooldown
        );
        self.suspects
            .lock()
            .insert(address.clone(), Instant::now() + self.failure_cooldown);
        self.pool.clear(address);
    }

    pub fn is_suspect(&self, address: &ServerAddress) -> bool {
        self.suspects
            .lock()
            .get(address)
            .is_some_and(|until| *until > Instant::now())
    }

    /// Closes every pooled transport.
    pub fn destroy(&self) {
        self.pool.close();
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::{
        configuration::ConfigurationBuilder,
        protocol::{Codec12, HashTopology},
        transport::Transport,
    };

    struct MemoryConnector;

    impl Connector for MemoryConnector {
        fn connect(&self, address: &ServerAddress) -> HotRodResult<Transport> {
            Ok(Transport::from_stream(
                address.clone(),
                Box::new(Cursor::new(Vec::new())),
            ))
        }

        fn validate(&self, _transport: &mut Transport) -> bool {
            true
        }
    }

    fn factory(servers: &str) -> TransportFactory {
        let config = ConfigurationBuilder::new()
            .add_servers(servers)
            .connection_pool(|p| p.time_between_eviction_runs(0))
            .create()
            .unwrap();
        TransportFactory::with_connector(
            &config,
            Arc::new(Codec12),
            Arc::new(MemoryConnector),
            Arc::new(AtomicU64::new(1)),
        )
    }

    fn address(host: &str, port: u16) -> ServerAddress {
        ServerAddress::new(host, port)
    }

    fn no_exclusions() -> HashSet<ServerAddress> {
        HashSet::new()
    }

    #[test]
    fn round_robin_without_hash() {
        let factory = factory("a:1;b:2");

        let first = factory.get_transport(None, &no_exclusions()).unwrap();
        let second = factory.get_transport(None, &no_exclusions()).unwrap();

        assert_ne!(first.address(), second.address());
    }

    #[test]
    fn excluded_servers_are_skipped() {
        let factory = factory("a:1;b:2");
        let excluded = HashSet::from([address("a", 1)]);

        for _ in 0..4 {
            let transport = factory.get_transport(None, &excluded).unwrap();
            assert_eq!(transport.address(), &address("b", 2));
        }
    }

    #[test]
    fn all_excluded_is_an_error() {
        let factory = factory("a:1");
        let excluded = HashSet::from([address("a", 1)]);

        let err = factory.get_transport(None, &excluded).unwrap_err();

        assert!(matches!(err, HotRodError::NoServerAvailable(_)));
    }

    #[test]
    fn suspects_are_avoided_until_cooldown_ends() {
        let factory = factory("a:1;b:2");
        factory.mark_suspect(&address("a", 1));

        assert!(factory.is_suspect(&address("a", 1)));
        for _ in 0..4 {
            let transport = factory.get_transport(None, &no_exclusions()).unwrap();
            assert_eq!(transport.address(), &address("b", 2));
        }
    }

    #[test]
    fn suspects_are_used_when_nothing_else_is_left() {
        let factory = factory("a:1");
        factory.mark_suspect(&address("a", 1));

        let transport = factory.get_transport(None, &no_exclusions()).unwrap();

        assert_eq!(transport.address(), &address("a", 1));
    }

    #[test]
    fn topology_only_moves_forward() {
        let factory = factory("a:1");
        let newer = TopologyUpdate {
            topology_id: 5,
            servers: vec![address("b", 2), address("c", 3)],
            hash: None,
        };
        let stale = TopologyUpdate {
            topology_id: 5,
            servers: vec![address("d", 4)],
            hash: None,
        };

        assert!(factory.update_topology(&newer));
        assert!(!factory.update_topology(&stale));

        assert_eq!(factory.topology_id(), 5);
        assert_eq!(factory.servers(), vec![address("b", 2), address("c", 3)]);
    }

    #[test]
    fn topology_change_drops_idle_transports_of_removed_servers() {
        let factory = factory("a:1");
        drop(factory.get_transport(None, &no_exclusions()).unwrap());
        assert_eq!(factory.pool().idle_count(&address("a", 1)), 1);

        factory.update_topology(&TopologyUpdate {
            topology_id: 1,
            servers: vec![address("b", 2)],
            hash: None,
        });

        assert_eq!(factory.pool().idle_count(&address("a", 1)), 0);
    }

    #[test]
    fn keys_route_to_their_owner() {
        let factory = factory("a:1;b:2");
        factory.update_topology(&TopologyUpdate {
            topology_id: 1,
            servers: vec![address("a", 1), address("b", 2)],
            hash: Some(HashTopology {
                num_key_owners: 1,
                hash_function_version: 1,
                hash_space: i32::MAX as u32,
                num_virtual_nodes: 1,
                server_hashes: vec![(address("a", 1), 1 << 29), (address("b", 2), 1 << 30)],
            }),
        });

        let owner = {
            let topology = factory.topology.read();
            topology
                .consistent_hash()
                .and_then(|h| h.server_for(b"key"))
                .cloned()
                .unwrap()
        };

        for _ in 0..4 {
            let transport = factory.get_transport(Some(b"key"), &no_exclusions()).unwrap();
            assert_eq!(transport.address(), &owner);
        }
    }

    #[test]
    fn message_ids_increase() {
        let factory = factory("a:1");

        let first = factory.next_message_id();

        assert!(factory.next_message_id() > first);
    }
}
