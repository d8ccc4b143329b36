//! Operations addressed by a single key, without a value in the request.
use bytes::{BufMut, BytesMut};

use crate::{
    HotRodResult,
    protocol::{Codec, ProtocolVersion, ResponseHeader, op_code, status},
    transport::Transport,
};

use super::{
    MetadataValue, Operation, OperationContext, VersionedValue, WriteOutcome, read_previous_value,
    unexpected_status,
};

/// Metadata flag bits of a `getWithMetadata` response.
const INFINITE_LIFESPAN: u8 = 0x01;
const INFINITE_MAXIDLE: u8 = 0x02;

#[derive(Debug, Clone)]
pub struct GetOperation {
    ctx: OperationContext,
    key: Vec<u8>,
}

impl GetOperation {
    pub(crate) fn new(ctx: OperationContext, key: Vec<u8>) -> Self {
        Self { ctx, key }
    }
}

impl Operation for GetOperation {
    type Output = Option<Vec<u8>>;

    const NAME: &'static str = "get";
    const REQUEST_OP_CODE: u8 = op_code::GET_REQUEST;

    fn context(&self) -> &OperationContext {
        &self.ctx
    }

    fn routing_key(&self) -> Option<&[u8]> {
        Some(&self.key)
    }

    fn body_size_hint(&self) -> usize {
        self.ctx.key_size_hint(&self.key)
    }

    fn write_body(&self, codec: &dyn Codec, buf: &mut BytesMut) {
        codec.encode_bytes(&self.key, buf);
    }

    fn read_body(
        &self,
        codec: &dyn Codec,
        transport: &mut Transport,
        header: &ResponseHeader,
    ) -> HotRodResult<Self::Output> {
        match header.status {
            status::NO_ERROR => Ok(Some(codec.decode_bytes(transport)?)),
            status::KEY_DOES_NOT_EXIST => Ok(None),
            _ => Err(unexpected_status(Self::NAME, header)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContainsKeyOperation {
    ctx: OperationContext,
    key: Vec<u8>,
}

impl ContainsKeyOperation {
    pub(crate) fn new(ctx: OperationContext, key: Vec<u8>) -> Self {
        Self { ctx, key }
    }
}

impl Operation for ContainsKeyOperation {
    type Output = bool;

    const NAME: &'static str = "containsKey";
    const REQUEST_OP_CODE: u8 = op_code::CONTAINS_KEY_REQUEST;

    fn context(&self) -> &OperationContext {
        &self.ctx
    }

    fn routing_key(&self) -> Option<&[u8]> {
        Some(&self.key)
    }

    fn body_size_hint(&self) -> usize {
        self.ctx.key_size_hint(&self.key)
    }

    fn write_body(&self, codec: &dyn Codec, buf: &mut BytesMut) {
        codec.encode_bytes(&self.key, buf);
    }

    fn read_body(
        &self,
        _codec: &dyn Codec,
        _transport: &mut Transport,
        header: &ResponseHeader,
    ) -> HotRodResult<Self::Output> {
        match header.status {
            status::NO_ERROR => Ok(true),
            status::KEY_DOES_NOT_EXIST => Ok(false),
            _ => Err(unexpected_status(Self::NAME, header)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemoveOperation {
    ctx: OperationContext,
    key: Vec<u8>,
}

impl RemoveOperation {
    pub(crate) fn new(ctx: OperationContext, key: Vec<u8>) -> Self {
        Self { ctx, key }
    }
}

impl Operation for RemoveOperation {
    type Output = WriteOutcome;

    const NAME: &'static str = "remove";
    const REQUEST_OP_CODE: u8 = op_code::REMOVE_REQUEST;

    fn context(&self) -> &OperationContext {
        &self.ctx
    }

    fn routing_key(&self) -> Option<&[u8]> {
        Some(&self.key)
    }

    fn body_size_hint(&self) -> usize {
        self.ctx.key_size_hint(&self.key)
    }

    fn write_body(&self, codec: &dyn Codec, buf: &mut BytesMut) {
        codec.encode_bytes(&self.key, buf);
    }

    fn read_body(
        &self,
        codec: &dyn Codec,
        transport: &mut Transport,
        header: &ResponseHeader,
    ) -> HotRodResult<Self::Output> {
        match header.status {
            status::NO_ERROR | status::KEY_DOES_NOT_EXIST => Ok(WriteOutcome {
                executed: header.status == status::NO_ERROR,
                previous: read_previous_value(&self.ctx, codec, transport, header)?,
            }),
            _ => Err(unexpected_status(Self::NAME, header)),
        }
    }
}

/// Removes the key only if its version still matches.
#[derive(Debug, Clone)]
pub struct RemoveIfUnmodifiedOperation {
    ctx: OperationContext,
    key: Vec<u8>,
    version: u64,
}

impl RemoveIfUnmodifiedOperation {
    pub(crate) fn new(ctx: OperationContext, key: Vec<u8>, version: u64) -> Self {
        Self { ctx, key, version }
    }
}

impl Operation for RemoveIfUnmodifiedOperation {
    type Output = WriteOutcome;

    const NAME: &'static str = "removeIfUnmodified";
    const REQUEST_OP_CODE: u8 = op_code::REMOVE_IF_UNMODIFIED_REQUEST;

    fn context(&self) -> &OperationContext {
        &self.ctx
    }

    fn routing_key(&self) -> Option<&[u8]> {
        Some(&self.key)
    }

    fn body_size_hint(&self) -> usize {
        self.ctx.key_size_hint(&self.key) + 8
    }

    fn write_body(&self, codec: &dyn Codec, buf: &mut BytesMut) {
        codec.encode_bytes(&self.key, buf);
        buf.put_u64(self.version);
    }

    fn read_body(
        &self,
        codec: &dyn Codec,
        transport: &mut Transport,
        header: &ResponseHeader,
    ) -> HotRodResult<Self::Output> {
        match header.status {
            status::NO_ERROR | status::NOT_PUT_REMOVED_REPLACED | status::KEY_DOES_NOT_EXIST => {
                Ok(WriteOutcome {
                    executed: header.status == status::NO_ERROR,
                    previous: read_previous_value(&self.ctx, codec, transport, header)?,
                })
            }
            _ => Err(unexpected_status(Self::NAME, header)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GetWithVersionOperation {
    ctx: OperationContext,
    key: Vec<u8>,
}

impl GetWithVersionOperation {
    pub(crate) fn new(ctx: OperationContext, key: Vec<u8>) -> Self {
        Self { ctx, key }
    }
}

impl Operation for GetWithVersionOperation {
    type Output = Option<VersionedValue>;

    const NAME: &'static str = "getWithVersion";
    const REQUEST_OP_CODE: u8 = op_code::GET_WITH_VERSION_REQUEST;

    fn context(&self) -> &OperationContext {
        &self.ctx
    }

    fn routing_key(&self) -> Option<&[u8]> {
        Some(&self.key)
    }

    fn body_size_hint(&self) -> usize {
        self.ctx.key_size_hint(&self.key)
    }

    fn write_body(&self, codec: &dyn Codec, buf: &mut BytesMut) {
        codec.encode_bytes(&self.key, buf);
    }

    fn read_body(
        &self,
        codec: &dyn Codec,
        transport: &mut Transport,
        header: &ResponseHeader,
    ) -> HotRodResult<Self::Output> {
        match header.status {
            status::NO_ERROR => {
                let version = transport.read_u64()?;
                let value = codec.decode_bytes(transport)?;
                Ok(Some(VersionedValue { value, version }))
            }
            status::KEY_DOES_NOT_EXIST => Ok(None),
            _ => Err(unexpected_status(Self::NAME, header)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GetWithMetadataOperation {
    ctx: OperationContext,
    key: Vec<u8>,
}

impl GetWithMetadataOperation {
    pub(crate) fn new(ctx: OperationContext, key: Vec<u8>) -> Self {
        Self { ctx, key }
    }
}

impl Operation for GetWithMetadataOperation {
    type Output = Option<MetadataValue>;

    const NAME: &'static str = "getWithMetadata";
    const REQUEST_OP_CODE: u8 = op_code::GET_WITH_METADATA_REQUEST;
    const MINIMUM_VERSION: ProtocolVersion = ProtocolVersion::V12;

    fn context(&self) -> &OperationContext {
        &self.ctx
    }

    fn routing_key(&self) -> Option<&[u8]> {
        Some(&self.key)
    }

    fn body_size_hint(&self) -> usize {
        self.ctx.key_size_hint(&self.key)
    }

    fn write_body(&self, codec: &dyn Codec, buf: &mut BytesMut) {
        codec.encode_bytes(&self.key, buf);
    }

    fn read_body(
        &self,
        codec: &dyn Codec,
        transport: &mut Transport,
        header: &ResponseHeader,
    ) -> HotRodResult<Self::Output> {
        match header.status {
            status::NO_ERROR => {}
            status::KEY_DOES_NOT_EXIST => return Ok(None),
            _ => return Err(unexpected_status(Self::NAME, header)),
        }

        let flags = transport.read_byte()?;
        let (created, lifespan) = if flags & INFINITE_LIFESPAN == 0 {
            (Some(transport.read_u64()?), Some(transport.read_vint()?))
        } else {
            (None, None)
        };
        let (last_used, max_idle) = if flags & INFINITE_MAXIDLE == 0 {
            (Some(transport.read_u64()?), Some(transport.read_vint()?))
        } else {
            (None, None)
        };
        let version = transport.read_u64()?;
        let value = codec.decode_bytes(transport)?;

        Ok(Some(MetadataValue {
            value,
            version,
            created,
            lifespan,
            last_used,
            max_idle,
        }))
    }
}
