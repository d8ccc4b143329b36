use std::{sync::Arc, time::Duration};

use bytes::Bytes;

use crate::{configuration::Configuration, protocol::Flags, transport::TransportFactory};

use super::{
    BulkGetKeysOperation, BulkGetOperation, ClearOperation, ContainsKeyOperation,
    GetOperation, GetWithMetadataOperation, GetWithVersionOperation, OperationContext,
    PingOperation, PutIfAbsentOperation, PutOperation, RemoveIfUnmodifiedOperation,
    RemoveOperation, ReplaceIfUnmodifiedOperation, ReplaceOperation, StatsOperation,
};

/// Expiration in whole seconds as sent on the wire, rounded up so that a short non-zero
/// duration still expires. `None` and zero mean no expiration.
fn seconds(duration: Option<Duration>) -> u32 {
    duration.map_or(0, |d| {
        let secs = d.as_secs().saturating_add(u64::from(d.subsec_nanos() > 0));
        u32::try_from(secs).unwrap_or(u32::MAX)
    })
}

/// Builds operations for one cache.
///
/// Construction never touches the network; every operation is bound to the shared transport
/// factory and picks up the topology id current at the time it is created.
#[derive(Debug, Clone)]
pub struct OperationsFactory {
    transport_factory: Arc<TransportFactory>,
    cache_name: Bytes,
    flags: Flags,
    max_retries: usize,
    key_size_estimate: usize,
    value_size_estimate: usize,
}

impl OperationsFactory {
    pub fn new(
        transport_factory: Arc<TransportFactory>,
        cache_name: &str,
        config: &Configuration,
    ) -> Self {
        let flags = if config.force_return_values() {
            Flags::FORCE_RETURN_VALUE
        } else {
            Flags::NONE
        };
        Self {
            transport_factory,
            cache_name: Bytes::copy_from_slice(cache_name.as_bytes()),
            flags,
            max_retries: config.max_retries(),
            key_size_estimate: config.key_size_estimate(),
            value_size_estimate: config.value_size_estimate(),
        }
    }

    /// A factory whose operations also carry `flags`.
    pub fn with_flags(&self, flags: Flags) -> Self {
        Self {
            flags: self.flags | flags,
            ..self.clone()
        }
    }

    pub fn cache_name(&self) -> &[u8] {
        &self.cache_name
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn transport_factory(&self) -> &Arc<TransportFactory> {
        &self.transport_factory
    }

    fn context(&self) -> OperationContext {
        OperationContext {
            transport_factory: Arc::clone(&self.transport_factory),
            cache_name: self.cache_name.clone(),
            flags: self.flags,
            topology_id: self.transport_factory.topology_id(),
            max_retries: self.max_retries,
            key_size_estimate: self.key_size_estimate,
            value_size_estimate: self.value_size_estimate,
        }
    }

    pub fn new_get_operation(&self, key: &[u8]) -> GetOperation {
        GetOperation::new(self.context(), key.to_vec())
    }

    pub fn new_contains_key_operation(&self, key: &[u8]) -> ContainsKeyOperation {
        ContainsKeyOperation::new(self.context(), key.to_vec())
    }

    pub fn new_remove_operation(&self, key: &[u8]) -> RemoveOperation {
        RemoveOperation::new(self.context(), key.to_vec())
    }

    pub fn new_remove_if_unmodified_operation(
        &self,
        key: &[u8],
        version: u64,
    ) -> RemoveIfUnmodifiedOperation {
        RemoveIfUnmodifiedOperation::new(self.context(), key.to_vec(), version)
    }

    pub fn new_get_with_version_operation(&self, key: &[u8]) -> GetWithVersionOperation {
        GetWithVersionOperation::new(self.context(), key.to_vec())
    }

    pub fn new_get_with_metadata_operation(&self, key: &[u8]) -> GetWithMetadataOperation {
        GetWithMetadataOperation::new(self.context(), key.to_vec())
    }

    pub fn new_put_operation(
        &self,
        key: &[u8],
        value: &[u8],
        lifespan: Option<Duration>,
        max_idle: Option<Duration>,
    ) -> PutOperation {
        PutOperation::new(
            self.context(),
            key.to_vec(),
            value.to_vec(),
            seconds(lifespan),
            seconds(max_idle),
        )
    }

    pub fn new_put_if_absent_operation(
        &self,
        key: &[u8],
        value: &[u8],
        lifespan: Option<Duration>,
        max_idle: Option<Duration>,
    ) -> PutIfAbsentOperation {
        PutIfAbsentOperation::new(
            self.context(),
            key.to_vec(),
            value.to_vec(),
            seconds(lifespan),
            seconds(max_idle),
        )
    }

    pub fn new_replace_operation(
        &self,
        key: &[u8],
        value: &[u8],
        lifespan: Option<Duration>,
        max_idle: Option<Duration>,
    ) -> ReplaceOperation {
        ReplaceOperation::new(
            self.context(),
            key.to_vec(),
            value.to_vec(),
            seconds(lifespan),
            seconds(max_idle),
        )
    }

    pub fn new_replace_if_unmodified_operation(
        &self,
        key: &[u8],
        value: &[u8],
        version: u64,
        lifespan: Option<Duration>,
        max_idle: Option<Duration>,
    ) -> ReplaceIfUnmodifiedOperation {
        ReplaceIfUnmodifiedOperation::new(
            self.context(),
            key.to_vec(),
            value.to_vec(),
            seconds(lifespan),
            seconds(max_idle),
            version,
        )
    }

    pub fn new_clear_operation(&self) -> ClearOperation {
        ClearOperation::new(self.context())
    }

    pub fn new_stats_operation(&self) -> StatsOperation {
        StatsOperation::new(self.context())
    }

    pub fn new_ping_operation(&self) -> PingOperation {
        PingOperation::new(self.context())
    }

    pub fn new_bulk_get_operation(&self, count: u32) -> BulkGetOperation {
        BulkGetOperation::new(self.context(), count)
    }

    pub fn new_bulk_get_keys_operation(&self, scope: u32) -> BulkGetKeysOperation {
        BulkGetKeysOperation::new(self.context(), scope)
    }
}
