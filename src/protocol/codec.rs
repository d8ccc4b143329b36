use std::{fmt, sync::Arc};

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    HotRodError, HotRodResult,
    transport::{ServerAddress, Transport},
};

use super::{
    ProtocolVersion,
    header::{
        CLIENT_INTELLIGENCE_HASH_DISTRIBUTION_AWARE, CLIENT_INTELLIGENCE_TOPOLOGY_AWARE,
        NO_TRANSACTION, REQUEST_MAGIC, RESPONSE_MAGIC, TOPOLOGY_CHANGED, TOPOLOGY_UNCHANGED,
    },
    op_code, primitives, status, Flags,
};

/// Everything a request header carries.
#[derive(Debug, Clone)]
pub struct HeaderParams {
    pub op_code: u8,
    pub message_id: u64,
    pub cache_name: Bytes,
    pub flags: Flags,
    pub client_intelligence: u8,
    pub topology_id: u32,
}

impl HeaderParams {
    pub fn response_op_code(&self) -> u8 {
        op_code::response(self.op_code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeader {
    pub message_id: u64,
    pub op_code: u8,
    pub status: u8,
    pub topology: Option<TopologyUpdate>,
}

impl ResponseHeader {
    /// An error response is followed by an error message instead of the operation payload.
    pub fn is_error(&self) -> bool {
        self.op_code == op_code::ERROR_RESPONSE || status::is_error(self.status)
    }
}

/// Cluster view pushed by a server when the client's topology id is out of date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyUpdate {
    pub topology_id: u32,
    pub servers: Vec<ServerAddress>,
    pub hash: Option<HashTopology>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashTopology {
    pub num_key_owners: u16,
    pub hash_function_version: u8,
    pub hash_space: u32,
    pub num_virtual_nodes: u32,
    pub server_hashes: Vec<(ServerAddress, u32)>,
}

/// Version-specific encoder/decoder of the Hot Rod wire format.
///
/// Encoding is pure; decoding pulls bytes from a [`Transport`]. Implementations hold no state,
/// so one instance is shared by every operation of a client.
pub trait Codec: Send + Sync + fmt::Debug {
    fn version(&self) -> ProtocolVersion;

    /// Whether hash-aware topology payloads carry the number of virtual nodes.
    fn reads_virtual_nodes(&self) -> bool;

    fn encode_header(&self, params: &HeaderParams, buf: &mut BytesMut) {
        buf.put_u8(REQUEST_MAGIC);
        primitives::put_vlong(buf, params.message_id);
        buf.put_u8(self.version().as_byte());
        buf.put_u8(params.op_code);
        primitives::put_array(buf, &params.cache_name);
        primitives::put_vint(buf, params.flags.bits());
        buf.put_u8(params.client_intelligence);
        primitives::put_vint(buf, params.topology_id);
        buf.put_u8(NO_TRANSACTION);
    }

    /// Encodes a key or value as a length-prefixed array.
    fn encode_bytes(&self, bytes: &[u8], buf: &mut BytesMut) {
        primitives::put_array(buf, bytes);
    }

    fn decode_header(
        &self,
        transport: &mut Transport,
        params: &HeaderParams,
    ) -> HotRodResult<ResponseHeader> {
        let magic = transport.read_byte()?;
        if magic != RESPONSE_MAGIC {
            return Err(HotRodError::Protocol(format!(
                "invalid magic {magic:#04x}, expected {RESPONSE_MAGIC:#04x}"
            )));
        }

        let message_id = transport.read_vlong()?;
        let op_code = transport.read_byte()?;
        let status = transport.read_byte()?;
        let topology = match transport.read_byte()? {
            TOPOLOGY_UNCHANGED => None,
            TOPOLOGY_CHANGED => Some(self.decode_topology(transport, params.client_intelligence)?),
            marker => {
                return Err(HotRodError::Protocol(format!(
                    "invalid topology change marker {marker:#04x}"
                )));
            }
        };

        let header = ResponseHeader {
            message_id,
            op_code,
            status,
            topology,
        };

        // servers may answer a garbled request with message id 0
        if !header.is_error() {
            if message_id != params.message_id {
                return Err(HotRodError::Protocol(format!(
                    "message id mismatch: sent {}, received {message_id}",
                    params.message_id
                )));
            }
            if op_code != params.response_op_code() {
                return Err(HotRodError::Protocol(format!(
                    "unexpected response op code {op_code:#04x}, expected {:#04x}",
                    params.response_op_code()
                )));
            }
        }

        Ok(header)
    }

    fn decode_bytes(&self, transport: &mut Transport) -> HotRodResult<Vec<u8>> {
        transport.read_array()
    }

    fn decode_topology(
        &self,
        transport: &mut Transport,
        client_intelligence: u8,
    ) -> HotRodResult<TopologyUpdate> {
        match client_intelligence {
            CLIENT_INTELLIGENCE_TOPOLOGY_AWARE => {
                let topology_id = transport.read_vint()?;
                let count = transport.read_vint()? as usize;
                let mut servers = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    servers.push(read_address(transport)?);
                }
                Ok(TopologyUpdate {
                    topology_id,
                    servers,
                    hash: None,
                })
            }
            CLIENT_INTELLIGENCE_HASH_DISTRIBUTION_AWARE => {
                let topology_id = transport.read_vint()?;
                let num_key_owners = transport.read_u16()?;
                let hash_function_version = transport.read_byte()?;
                let hash_space = transport.read_vint()?;
                let count = transport.read_vint()? as usize;
                let num_virtual_nodes = if self.reads_virtual_nodes() {
                    transport.read_vint()?
                } else {
                    1
                };

                let mut servers: Vec<ServerAddress> = Vec::new();
                let mut server_hashes = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let address = read_address(transport)?;
                    let hash = transport.read_u32()?;
                    if !servers.contains(&address) {
                        servers.push(address.clone());
                    }
                    server_hashes.push((address, hash));
                }

                Ok(TopologyUpdate {
                    topology_id,
                    servers,
                    hash: Some(HashTopology {
                        num_key_owners,
                        hash_function_version,
                        hash_space,
                        num_virtual_nodes,
                        server_hashes,
                    }),
                })
            }
            other => Err(HotRodError::Protocol(format!(
                "topology update sent to a client with intelligence {other:#04x}"
            ))),
        }
    }
}

fn read_address(transport: &mut Transport) -> HotRodResult<ServerAddress> {
    let host = transport.read_string()?;
    let port = transport.read_u16()?;
    Ok(ServerAddress::new(host, port))
}

#[derive(Debug, Default)]
pub struct Codec10;

impl Codec for Codec10 {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::V10
    }

    fn reads_virtual_nodes(&self) -> bool {
        false
    }
}

#[derive(Debug, Default)]
pub struct Codec11;

impl Codec for Codec11 {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::V11
    }

    fn reads_virtual_nodes(&self) -> bool {
        true
    }
}

#[derive(Debug, Default)]
pub struct Codec12;

impl Codec for Codec12 {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::V12
    }

    fn reads_virtual_nodes(&self) -> bool {
        true
    }
}

/// Selects the codec for a configured protocol version string.
pub fn codec_for_version(version: &str) -> HotRodResult<Arc<dyn Codec>> {
    let codec: Arc<dyn Codec> = match ProtocolVersion::parse(version)? {
        ProtocolVersion::V10 => Arc::new(Codec10),
        ProtocolVersion::V11 => Arc::new(Codec11),
        ProtocolVersion::V12 => Arc::new(Codec12),
    };
    Ok(codec)
}
