use std::collections::BTreeMap;

use log::warn;

use crate::protocol::{HashTopology, TopologyUpdate, murmur_hash2};

use super::ServerAddress;

/// Hash function versions this client can route with.
const MURMUR_HASH2_VERSION: u8 = 1;

/// Consistent hash ring built from a hash-distribution-aware topology update.
///
/// Each server sits on the ring at the hash it advertised; a key belongs to the first server at or
/// after the key's position, wrapping around past the end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistentHash {
    ring: BTreeMap<u32, ServerAddress>,
    hash_space: u32,
    num_key_owners: u16,
}

impl ConsistentHash {
    /// Returns `None` for hash functions this client does not implement, or an empty ring.
    pub fn new(topology: &HashTopology) -> Option<Self> {
        if topology.hash_function_version != MURMUR_HASH2_VERSION {
            warn!(
                "unsupported hash function version {}, falling back to round robin",
                topology.hash_function_version
            );
            return None;
        }
        if topology.server_hashes.is_empty() {
            return None;
        }

        let ring = topology
            .server_hashes
            .iter()
            .map(|(address, hash)| (*hash, address.clone()))
            .collect();

        Some(Self {
            ring,
            hash_space: topology.hash_space,
            num_key_owners: topology.num_key_owners,
        })
    }

    pub fn num_key_owners(&self) -> u16 {
        self.num_key_owners
    }

    /// Position of `key` on the ring.
    pub fn key_hash(&self, key: &[u8]) -> u32 {
        // the server side works on signed ints; i32::MIN has no absolute value and maps to 0
        let hash = murmur_hash2(key) as i32;
        let normalized = hash.checked_abs().unwrap_or(0) as u32;
        if self.hash_space == 0 {
            normalized
        } else {
            normalized % self.hash_space
        }
    }

    pub fn server_for(&self, key: &[u8]) -> Option<&ServerAddress> {
        let hash = self.key_hash(key);
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, address)| address)
    }
}

/// The cluster view the client currently routes against.
#[derive(Debug, Clone, Default)]
pub struct TopologyInfo {
    topology_id: u32,
    servers: Vec<ServerAddress>,
    hash: Option<ConsistentHash>,
}

impl TopologyInfo {
    pub fn new(servers: Vec<ServerAddress>) -> Self {
        Self {
            topology_id: 0,
            servers,
            hash: None,
        }
    }

    pub fn topology_id(&self) -> u32 {
        self.topology_id
    }

    pub fn servers(&self) -> &[ServerAddress] {
        &self.servers
    }

    pub fn consistent_hash(&self) -> Option<&ConsistentHash> {
        self.hash.as_ref()
    }

    /// Installs `update` when it is newer than the current view. Returns whether it was applied.
    pub fn apply(&mut self, update: &TopologyUpdate) -> bool {
        if update.topology_id <= self.topology_id || update.servers.is_empty() {
            return false;
        }

        self.topology_id = update.topology_id;
        self.servers = update.servers.clone();
        self.hash = update.hash.as_ref().and_then(ConsistentHash::new);
        true
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn address(name: &str) -> ServerAddress {
        ServerAddress::new(name, 11222)
    }

    fn hash_topology(hash_function_version: u8, server_hashes: &[(&str, u32)]) -> HashTopology {
        HashTopology {
            num_key_owners: 2,
            hash_function_version,
            hash_space: i32::MAX as u32,
            num_virtual_nodes: 1,
            server_hashes: server_hashes
                .iter()
                .map(|(name, hash)| (address(name), *hash))
                .collect(),
        }
    }

    fn update(topology_id: u32, servers: &[&str]) -> TopologyUpdate {
        TopologyUpdate {
            topology_id,
            servers: servers.iter().map(|s| address(s)).collect(),
            hash: None,
        }
    }

    #[rstest]
    #[case(0, "a")]
    #[case(100, "a")]
    #[case(101, "b")]
    #[case(1_000, "c")]
    #[case(1_001, "a")]
    fn ring_picks_next_server(#[case] hash: u32, #[case] owner: &str) {
        let ring = ConsistentHash::new(&hash_topology(1, &[("a", 100), ("b", 500), ("c", 1_000)]))
            .unwrap();

        let found = ring
            .ring
            .range(hash..)
            .next()
            .or_else(|| ring.ring.iter().next())
            .map(|(_, a)| a.clone());

        assert_eq!(found, Some(address(owner)));
    }

    #[test]
    fn server_for_is_stable_and_on_the_ring() {
        let ring = ConsistentHash::new(&hash_topology(1, &[("a", 1 << 20), ("b", 1 << 30)]))
            .unwrap();

        let first = ring.server_for(b"user:42").cloned();
        let second = ring.server_for(b"user:42").cloned();

        assert_eq!(first, second);
        assert!(matches!(first, Some(a) if a == address("a") || a == address("b")));
    }

    #[test]
    fn key_hash_stays_within_hash_space() {
        let mut topology = hash_topology(1, &[("a", 1)]);
        topology.hash_space = 1_000;
        let ring = ConsistentHash::new(&topology).unwrap();

        for key in [&b"a"[..], b"bb", b"some longer key", b""] {
            assert!(ring.key_hash(key) < 1_000);
        }
    }

    #[test]
    fn unknown_hash_function_disables_hashing() {
        assert!(ConsistentHash::new(&hash_topology(2, &[("a", 1)])).is_none());
    }

    #[test]
    fn newer_topology_replaces_older() {
        let mut info = TopologyInfo::new(vec![address("seed")]);

        assert!(info.apply(&update(3, &["a", "b"])));
        assert_eq!(info.topology_id(), 3);
        assert_eq!(info.servers(), &[address("a"), address("b")]);
    }

    #[rstest]
    #[case(3)]
    #[case(2)]
    fn stale_topology_is_ignored(#[case] stale_id: u32) {
        let mut info = TopologyInfo::new(vec![address("seed")]);
        info.apply(&update(3, &["a", "b"]));

        assert!(!info.apply(&update(stale_id, &["c"])));
        assert_eq!(info.topology_id(), 3);
        assert_eq!(info.servers(), &[address("a"), address("b")]);
    }

    #[test]
    fn empty_server_list_is_ignored() {
        let mut info = TopologyInfo::new(vec![address("seed")]);

        assert!(!info.apply(&update(5, &[])));
        assert_eq!(info.servers(), &[address("seed")]);
    }

    #[test]
    fn hash_topology_builds_ring() {
        let mut info = TopologyInfo::new(vec![address("seed")]);
        let mut with_hash = update(4, &["a"]);
        with_hash.hash = Some(hash_topology(1, &[("a", 7)]));

        info.apply(&with_hash);

        assert_eq!(
            info.consistent_hash().and_then(|h| h.server_for(b"k")),
            Some(&address("a"))
        );
    }
}
