//! Typed remote operations.
//!
//! Every request/response exchange with a server is an [`Operation`]: a small value holding the
//! request parameters and an [`OperationContext`] (cache name, flags, topology id and the shared
//! [`TransportFactory`]). Operations only describe their payload; checking out a transport,
//! framing the header, forwarding topology changes, releasing the transport and failing over to
//! another server are shared by all of them through [`Operation::execute`].
//!
//! Operations are built by the [`OperationsFactory`] and are cheap to construct and discard.
mod cache;
mod factory;
mod key;
mod key_value;

use std::{collections::HashSet, sync::Arc};

use bytes::{Bytes, BytesMut};
use log::{debug, warn};

pub use cache::{
    BulkGetKeysOperation, BulkGetOperation, ClearOperation, PingOperation, StatsOperation,
};
pub use factory::OperationsFactory;
pub use key::{
    ContainsKeyOperation, GetOperation, GetWithMetadataOperation, GetWithVersionOperation,
    RemoveIfUnmodifiedOperation, RemoveOperation,
};
pub use key_value::{
    PutIfAbsentOperation, PutOperation, ReplaceIfUnmodifiedOperation, ReplaceOperation,
};

use crate::{
    HotRodError, HotRodResult,
    protocol::{
        Codec, Flags, HeaderParams, ProtocolVersion, ResponseHeader,
        header::CLIENT_INTELLIGENCE_HASH_DISTRIBUTION_AWARE, status,
    },
    transport::{ServerAddress, Transport, TransportFactory},
};

/// Magic, message id, version, op code, flags, intelligence, topology id and tx marker.
const HEADER_SIZE_ESTIMATE: usize = 24;

/// Value stored under a key together with its version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    pub value: Vec<u8>,
    pub version: u64,
}

/// Value stored under a key with its version and expiration metadata.
///
/// `None` lifespan or max idle means the entry never expires for that reason. Timestamps are
/// milliseconds since the epoch as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataValue {
    pub value: Vec<u8>,
    pub version: u64,
    pub created: Option<u64>,
    pub lifespan: Option<u32>,
    pub last_used: Option<u64>,
    pub max_idle: Option<u32>,
}

/// Result of a conditional write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Whether the server applied the write.
    pub executed: bool,
    /// Previous value, only sent back when the request carried
    /// [`Flags::FORCE_RETURN_VALUE`].
    pub previous: Option<Vec<u8>>,
}

/// Everything an operation needs besides its own parameters.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub(crate) transport_factory: Arc<TransportFactory>,
    pub(crate) cache_name: Bytes,
    pub(crate) flags: Flags,
    pub(crate) topology_id: u32,
    pub(crate) max_retries: usize,
    pub(crate) key_size_estimate: usize,
    pub(crate) value_size_estimate: usize,
}

impl OperationContext {
    pub fn cache_name(&self) -> &[u8] {
        &self.cache_name
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Topology id the operation was created against.
    pub fn topology_id(&self) -> u32 {
        self.topology_id
    }

    /// Buffer space for a length-prefixed key.
    fn key_size_hint(&self, key: &[u8]) -> usize {
        key.len().max(self.key_size_estimate) + 5
    }

    /// Buffer space for a length-prefixed value.
    fn value_size_hint(&self, value: &[u8]) -> usize {
        value.len().max(self.value_size_estimate) + 5
    }

    fn codec(&self) -> &dyn Codec {
        self.transport_factory.codec().as_ref()
    }

    fn header(&self, op_code: u8) -> HeaderParams {
        HeaderParams {
            op_code,
            message_id: self.transport_factory.next_message_id(),
            cache_name: self.cache_name.clone(),
            flags: self.flags,
            client_intelligence: CLIENT_INTELLIGENCE_HASH_DISTRIBUTION_AWARE,
            topology_id: self.topology_id,
        }
    }
}

/// One request/response exchange.
pub trait Operation {
    type Output;

    const NAME: &'static str;
    const REQUEST_OP_CODE: u8;
    const MINIMUM_VERSION: ProtocolVersion = ProtocolVersion::V10;

    fn context(&self) -> &OperationContext;

    /// Key the request is routed by; `None` sends it to any server.
    fn routing_key(&self) -> Option<&[u8]> {
        None
    }

    /// Bytes the payload is expected to take, used to size the request buffer.
    fn body_size_hint(&self) -> usize {
        0
    }

    fn write_body(&self, codec: &dyn Codec, buf: &mut BytesMut);

    /// Parses the payload following a successful response header.
    fn read_body(
        &self,
        codec: &dyn Codec,
        transport: &mut Transport,
        header: &ResponseHeader,
    ) -> HotRodResult<Self::Output>;

    fn execute(&self) -> HotRodResult<Self::Output>
    where
        Self: Sized,
    {
        execute(self)
    }
}

fn execute<O: Operation>(op: &O) -> HotRodResult<O::Output> {
    let ctx = op.context();
    let factory = &ctx.transport_factory;
    let version = factory.codec().version();
    if version < O::MINIMUM_VERSION {
        return Err(HotRodError::UnsupportedOperation {
            operation: O::NAME,
            version,
        });
    }

    let mut failed: HashSet<ServerAddress> = HashSet::new();
    let mut retries = 0;
    loop {
        let result = factory
            .get_transport(op.routing_key(), &failed)
            .and_then(|mut transport| exchange(op, &mut transport));

        let error = match result {
            Ok(output) => return Ok(output),
            Err(e) => e,
        };

        let Some(address) = error.address().cloned() else {
            return Err(error);
        };
        if matches!(
            error,
            HotRodError::Connection { .. } | HotRodError::Timeout { .. }
        ) {
            factory.mark_suspect(&address);
        }
        if !error.is_retryable() || retries >= ctx.max_retries {
            return Err(error);
        }

        failed.insert(address);
        if factory.servers().iter().all(|s| failed.contains(s)) {
            debug!("{} failed and no other server is left", O::NAME);
            return Err(error);
        }
        retries += 1;
        warn!("{} failed ({error}), retrying on another server", O::NAME);
    }
}

/// Runs one exchange on an already checked-out transport.
///
/// Anything but a server-reported error leaves the connection in an unknown state, so the
/// transport is invalidated and will be closed on release.
fn exchange<O: Operation>(op: &O, transport: &mut Transport) -> HotRodResult<O::Output> {
    let result = write_and_read(op, transport);
    if let Err(e) = &result {
        if !matches!(e, HotRodError::RemoteOperation { .. }) {
            transport.invalidate();
        }
    }
    result
}

fn write_and_read<O: Operation>(op: &O, transport: &mut Transport) -> HotRodResult<O::Output> {
    let ctx = op.context();
    let codec = ctx.codec();
    let params = ctx.header(O::REQUEST_OP_CODE);

    let mut buf = BytesMut::with_capacity(
        HEADER_SIZE_ESTIMATE + params.cache_name.len() + op.body_size_hint(),
    );
    codec.encode_header(&params, &mut buf);
    op.write_body(codec, &mut buf);
    transport.write(&buf)?;

    let header = codec.decode_header(transport, &params)?;
    if let Some(topology) = &header.topology {
        ctx.transport_factory.update_topology(topology);
    }
    check_status(transport, &header)?;

    op.read_body(codec, transport, &header)
}

/// Turns an error response into [`HotRodError::RemoteOperation`], consuming its message.
fn check_status(transport: &mut Transport, header: &ResponseHeader) -> HotRodResult<()> {
    if !header.is_error() {
        return Ok(());
    }
    let message = transport.read_string()?;
    debug!(
        "server {} answered with status {:#04x}: {message}",
        transport.address(),
        header.status
    );
    Err(HotRodError::RemoteOperation {
        status: header.status,
        message,
    })
}

fn unexpected_status(operation: &str, header: &ResponseHeader) -> HotRodError {
    HotRodError::Protocol(format!(
        "unexpected status {:#04x} in {operation} response",
        header.status
    ))
}

/// Reads the previous value a write sends back when it was forced to.
fn read_previous_value(
    ctx: &OperationContext,
    codec: &dyn Codec,
    transport: &mut Transport,
    header: &ResponseHeader,
) -> HotRodResult<Option<Vec<u8>>> {
    let sends_value = matches!(
        header.status,
        status::NO_ERROR | status::NOT_PUT_REMOVED_REPLACED
    );
    if !ctx.flags.contains(Flags::FORCE_RETURN_VALUE) || !sends_value {
        return Ok(None);
    }
    let previous = codec.decode_bytes(transport)?;
    Ok((!previous.is_empty()).then_some(previous))
}
