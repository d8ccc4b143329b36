//! Operations on the cache as a whole.
use std::collections::{HashMap, HashSet};

use bytes::{Bytes, BytesMut};

use crate::{
    HotRodError, HotRodResult,
    protocol::{
        Codec, Flags, HeaderParams, ProtocolVersion, ResponseHeader,
        header::CLIENT_INTELLIGENCE_BASIC, op_code, put_vint, status,
    },
    transport::{ServerAddress, Transport},
};

use super::{Operation, OperationContext, check_status, exchange, unexpected_status};

/// Pings a server. Used to check reachability on startup and to validate pooled transports.
#[derive(Debug, Clone)]
pub struct PingOperation {
    ctx: OperationContext,
}

impl PingOperation {
    pub(crate) fn new(ctx: OperationContext) -> Self {
        Self { ctx }
    }

    /// Pings one specific server instead of letting the transport factory choose.
    pub fn execute_on(&self, address: &ServerAddress) -> HotRodResult<()> {
        let mut transport = self.ctx.transport_factory.pool().acquire(address)?;
        exchange(self, &mut transport)
    }

    /// Pings over a transport that is not checked out from the pool, as a minimal client: no
    /// cache name, no topology.
    pub(crate) fn validate(
        codec: &dyn Codec,
        transport: &mut Transport,
        message_id: u64,
    ) -> HotRodResult<()> {
        let params = HeaderParams {
            op_code: op_code::PING_REQUEST,
            message_id,
            cache_name: Bytes::new(),
            flags: Flags::NONE,
            client_intelligence: CLIENT_INTELLIGENCE_BASIC,
            topology_id: 0,
        };
        let mut buf = BytesMut::with_capacity(16);
        codec.encode_header(&params, &mut buf);
        transport.write(&buf)?;

        let header = codec.decode_header(transport, &params)?;
        check_status(transport, &header)?;
        if header.status != status::NO_ERROR {
            return Err(unexpected_status("ping", &header));
        }
        Ok(())
    }
}

impl Operation for PingOperation {
    type Output = ();

    const NAME: &'static str = "ping";
    const REQUEST_OP_CODE: u8 = op_code::PING_REQUEST;

    fn context(&self) -> &OperationContext {
        &self.ctx
    }

    fn write_body(&self, _codec: &dyn Codec, _buf: &mut BytesMut) {}

    fn read_body(
        &self,
        _codec: &dyn Codec,
        _transport: &mut Transport,
        header: &ResponseHeader,
    ) -> HotRodResult<Self::Output> {
        match header.status {
            status::NO_ERROR => Ok(()),
            _ => Err(unexpected_status(Self::NAME, header)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClearOperation {
    ctx: OperationContext,
}

impl ClearOperation {
    pub(crate) fn new(ctx: OperationContext) -> Self {
        Self { ctx }
    }
}

impl Operation for ClearOperation {
    type Output = ();

    const NAME: &'static str = "clear";
    const REQUEST_OP_CODE: u8 = op_code::CLEAR_REQUEST;

    fn context(&self) -> &OperationContext {
        &self.ctx
    }

    fn write_body(&self, _codec: &dyn Codec, _buf: &mut BytesMut) {}

    fn read_body(
        &self,
        _codec: &dyn Codec,
        _transport: &mut Transport,
        header: &ResponseHeader,
    ) -> HotRodResult<Self::Output> {
        match header.status {
            status::NO_ERROR => Ok(()),
            _ => Err(unexpected_status(Self::NAME, header)),
        }
    }
}

/// Server statistics as name/value pairs.
#[derive(Debug, Clone)]
pub struct StatsOperation {
    ctx: OperationContext,
}

impl StatsOperation {
    pub(crate) fn new(ctx: OperationContext) -> Self {
        Self { ctx }
    }
}

impl Operation for StatsOperation {
    type Output = HashMap<String, String>;

    const NAME: &'static str = "stats";
    const REQUEST_OP_CODE: u8 = op_code::STATS_REQUEST;

    fn context(&self) -> &OperationContext {
        &self.ctx
    }

    fn write_body(&self, _codec: &dyn Codec, _buf: &mut BytesMut) {}

    fn read_body(
        &self,
        _codec: &dyn Codec,
        transport: &mut Transport,
        header: &ResponseHeader,
    ) -> HotRodResult<Self::Output> {
        if header.status != status::NO_ERROR {
            return Err(unexpected_status(Self::NAME, header));
        }

        let count = transport.read_vint()? as usize;
        let mut stats = HashMap::with_capacity(count.min(256));
        for _ in 0..count {
            let name = transport.read_string()?;
            let value = transport.read_string()?;
            stats.insert(name, value);
        }
        Ok(stats)
    }
}

/// Reads `more (u8) | entry` records until `more` is 0.
fn read_stream<T>(
    transport: &mut Transport,
    mut read_entry: impl FnMut(&mut Transport) -> HotRodResult<T>,
    mut accept: impl FnMut(T),
) -> HotRodResult<()> {
    loop {
        match transport.read_byte()? {
            0 => return Ok(()),
            1 => accept(read_entry(transport)?),
            other => {
                return Err(HotRodError::Protocol(format!(
                    "invalid bulk stream marker {other:#04x}"
                )));
            }
        }
    }
}

/// Fetches up to `count` entries, every entry when `count` is 0.
#[derive(Debug, Clone)]
pub struct BulkGetOperation {
    ctx: OperationContext,
    count: u32,
}

impl BulkGetOperation {
    pub(crate) fn new(ctx: OperationContext, count: u32) -> Self {
        Self { ctx, count }
    }
}

impl Operation for BulkGetOperation {
    type Output = HashMap<Vec<u8>, Vec<u8>>;

    const NAME: &'static str = "bulkGet";
    const REQUEST_OP_CODE: u8 = op_code::BULK_GET_REQUEST;

    fn context(&self) -> &OperationContext {
        &self.ctx
    }

    fn body_size_hint(&self) -> usize {
        5
    }

    fn write_body(&self, _codec: &dyn Codec, buf: &mut BytesMut) {
        put_vint(buf, self.count);
    }

    fn read_body(
        &self,
        codec: &dyn Codec,
        transport: &mut Transport,
        header: &ResponseHeader,
    ) -> HotRodResult<Self::Output> {
        if header.status != status::NO_ERROR {
            return Err(unexpected_status(Self::NAME, header));
        }

        let mut entries = HashMap::new();
        read_stream(
            transport,
            |t| Ok((codec.decode_bytes(t)?, codec.decode_bytes(t)?)),
            |(key, value)| {
                entries.insert(key, value);
            },
        )?;
        Ok(entries)
    }
}

/// Fetches every key of the cache.
///
/// `scope` 0 lets the server pick, 1 restricts the keys to the ones held by the server that
/// answers, 2 asks for every key in the cluster.
#[derive(Debug, Clone)]
pub struct BulkGetKeysOperation {
    ctx: OperationContext,
    scope: u32,
}

impl BulkGetKeysOperation {
    pub(crate) fn new(ctx: OperationContext, scope: u32) -> Self {
        Self { ctx, scope }
    }
}

impl Operation for BulkGetKeysOperation {
    type Output = HashSet<Vec<u8>>;

    const NAME: &'static str = "bulkGetKeys";
    const REQUEST_OP_CODE: u8 = op_code::BULK_GET_KEYS_REQUEST;
    const MINIMUM_VERSION: ProtocolVersion = ProtocolVersion::V12;

    fn context(&self) -> &OperationContext {
        &self.ctx
    }

    fn body_size_hint(&self) -> usize {
        5
    }

    fn write_body(&self, _codec: &dyn Codec, buf: &mut BytesMut) {
        put_vint(buf, self.scope);
    }

    fn read_body(
        &self,
        codec: &dyn Codec,
        transport: &mut Transport,
        header: &ResponseHeader,
    ) -> HotRodResult<Self::Output> {
        if header.status != status::NO_ERROR {
            return Err(unexpected_status(Self::NAME, header));
        }

        let mut keys = HashSet::new();
        read_stream(
            transport,
            |t| codec.decode_bytes(t),
            |key| {
                keys.insert(key);
            },
        )?;
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Cursor,
        sync::{Arc, atomic::AtomicU64},
    };

    use bytes::BufMut;

    use super::*;
    use crate::{
        configuration::{Configuration, ConfigurationBuilder},
        operations::OperationsFactory,
        protocol::{Codec12, codec_for_version, header::RESPONSE_MAGIC, put_array, put_vlong},
        testing::MockServer,
        transport::{Connector, TcpConnector, TransportFactory},
    };

    fn operations(server: &MockServer) -> OperationsFactory {
        let config = ConfigurationBuilder::new()
            .add_servers(&server.address().to_string())
            .connection_pool(|p| p.time_between_eviction_runs(0))
            .create()
            .unwrap();
        let codec = codec_for_version(config.protocol_version()).unwrap();
        OperationsFactory::new(
            Arc::new(TransportFactory::new(&config, codec)),
            "",
            &config,
        )
    }

    #[test]
    fn bulk_stream_stops_at_zero_marker() {
        let mut bytes = BytesMut::new();
        for key in [&b"a"[..], b"b"] {
            bytes.put_u8(1);
            put_array(&mut bytes, key);
        }
        bytes.put_u8(0);
        let mut transport = Transport::from_stream(
            ServerAddress::new("127.0.0.1", 11222),
            Box::new(Cursor::new(bytes.to_vec())),
        );

        let mut keys = Vec::new();
        read_stream(&mut transport, |t| t.read_array(), |k| keys.push(k)).unwrap();

        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn bad_stream_marker_is_a_protocol_error() {
        let mut transport = Transport::from_stream(
            ServerAddress::new("127.0.0.1", 11222),
            Box::new(Cursor::new(vec![7u8])),
        );

        let err = read_stream(&mut transport, |t| t.read_array(), |_| {}).unwrap_err();

        assert!(matches!(err, HotRodError::Protocol(_)));
    }

    #[test]
    fn validate_reads_a_ping_response() {
        let mut response = BytesMut::new();
        response.put_u8(RESPONSE_MAGIC);
        put_vlong(&mut response, 9);
        response.put_u8(op_code::response(op_code::PING_REQUEST));
        response.put_u8(status::NO_ERROR);
        response.put_u8(0);
        let mut transport = Transport::from_stream(
            ServerAddress::new("127.0.0.1", 11222),
            Box::new(Cursor::new(response.to_vec())),
        );

        PingOperation::validate(&Codec12, &mut transport, 9).unwrap();
    }

    #[test]
    fn stats_clear_and_bulk_reads() {
        let server = MockServer::start();
        let ops = operations(&server);
        for (k, v) in [(&b"a"[..], &b"1"[..]), (b"b", b"2"), (b"c", b"3")] {
            ops.new_put_operation(k, v, None, None).execute().unwrap();
        }

        let entries = ops.new_bulk_get_operation(0).execute().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries.get(&b"b".to_vec()), Some(&b"2".to_vec()));
        assert_eq!(ops.new_bulk_get_operation(2).execute().unwrap().len(), 2);

        let keys = ops.new_bulk_get_keys_operation(0).execute().unwrap();
        assert!(keys.contains(&b"c".to_vec()));

        let stats = ops.new_stats_operation().execute().unwrap();
        assert_eq!(
            stats.get("currentNumberOfEntries").map(String::as_str),
            Some("3")
        );

        ops.new_clear_operation().execute().unwrap();
        assert!(ops.new_bulk_get_keys_operation(0).execute().unwrap().is_empty());
    }

    #[test]
    fn ping_specific_server() {
        let server = MockServer::start();
        let ops = operations(&server);

        ops.new_ping_operation().execute_on(server.address()).unwrap();

        assert_eq!(server.request_count(), 1);
    }

    #[test]
    fn tcp_connector_validates_with_ping() {
        let server = MockServer::start();
        let connector = TcpConnector::new(
            &Configuration::default(),
            Arc::new(Codec12),
            Arc::new(AtomicU64::new(1)),
        );
        let mut transport = connector.connect(server.address()).unwrap();

        assert!(connector.validate(&mut transport));

        server.stop_connections();
        assert!(!connector.validate(&mut transport));
        assert!(!transport.is_valid());
    }
}
