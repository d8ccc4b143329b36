//! Writes carrying a key, expiration settings and a value.
use bytes::{BufMut, BytesMut};

use crate::{
    HotRodResult,
    protocol::{Codec, ResponseHeader, op_code, put_vint, status},
    transport::Transport,
};

use super::{Operation, OperationContext, WriteOutcome, read_previous_value, unexpected_status};

/// Key, expiration and value shared by every write.
#[derive(Debug, Clone)]
struct Entry {
    key: Vec<u8>,
    value: Vec<u8>,
    /// Seconds, 0 for no expiration.
    lifespan: u32,
    /// Seconds, 0 for no expiration.
    max_idle: u32,
}

impl Entry {
    fn size_hint(&self, ctx: &OperationContext) -> usize {
        ctx.key_size_hint(&self.key) + ctx.value_size_hint(&self.value) + 10
    }

    fn write_key_and_expiration(&self, codec: &dyn Codec, buf: &mut BytesMut) {
        codec.encode_bytes(&self.key, buf);
        put_vint(buf, self.lifespan);
        put_vint(buf, self.max_idle);
    }
}

fn conditional_outcome(
    name: &str,
    ctx: &OperationContext,
    codec: &dyn Codec,
    transport: &mut Transport,
    header: &ResponseHeader,
) -> HotRodResult<WriteOutcome> {
    match header.status {
        status::NO_ERROR | status::NOT_PUT_REMOVED_REPLACED | status::KEY_DOES_NOT_EXIST => {
            Ok(WriteOutcome {
                executed: header.status == status::NO_ERROR,
                previous: read_previous_value(ctx, codec, transport, header)?,
            })
        }
        _ => Err(unexpected_status(name, header)),
    }
}

/// Unconditional write. Returns the previous value when forced to.
#[derive(Debug, Clone)]
pub struct PutOperation {
    ctx: OperationContext,
    entry: Entry,
}

impl PutOperation {
    pub(crate) fn new(
        ctx: OperationContext,
        key: Vec<u8>,
        value: Vec<u8>,
        lifespan: u32,
        max_idle: u32,
    ) -> Self {
        Self {
            ctx,
            entry: Entry {
                key,
                value,
                lifespan,
                max_idle,
            },
        }
    }
}

impl Operation for PutOperation {
    type Output = Option<Vec<u8>>;

    const NAME: &'static str = "put";
    const REQUEST_OP_CODE: u8 = op_code::PUT_REQUEST;

    fn context(&self) -> &OperationContext {
        &self.ctx
    }

    fn routing_key(&self) -> Option<&[u8]> {
        Some(&self.entry.key)
    }

    fn body_size_hint(&self) -> usize {
        self.entry.size_hint(&self.ctx)
    }

    fn write_body(&self, codec: &dyn Codec, buf: &mut BytesMut) {
        self.entry.write_key_and_expiration(codec, buf);
        codec.encode_bytes(&self.entry.value, buf);
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
        read_previous_value(&self.ctx, codec, transport, header)
    }
}

#[derive(Debug, Clone)]
pub struct PutIfAbsentOperation {
    ctx: OperationContext,
    entry: Entry,
}

impl PutIfAbsentOperation {
    pub(crate) fn new(
        ctx: OperationContext,
        key: Vec<u8>,
        value: Vec<u8>,
        lifespan: u32,
        max_idle: u32,
    ) -> Self {
        Self {
            ctx,
            entry: Entry {
                key,
                value,
                lifespan,
                max_idle,
            },
        }
    }
}

impl Operation for PutIfAbsentOperation {
    type Output = WriteOutcome;

    const NAME: &'static str = "putIfAbsent";
    const REQUEST_OP_CODE: u8 = op_code::PUT_IF_ABSENT_REQUEST;

    fn context(&self) -> &OperationContext {
        &self.ctx
    }

    fn routing_key(&self) -> Option<&[u8]> {
        Some(&self.entry.key)
    }

    fn body_size_hint(&self) -> usize {
        self.entry.size_hint(&self.ctx)
    }

    fn write_body(&self, codec: &dyn Codec, buf: &mut BytesMut) {
        self.entry.write_key_and_expiration(codec, buf);
        codec.encode_bytes(&self.entry.value, buf);
    }

    fn read_body(
        &self,
        codec: &dyn Codec,
        transport: &mut Transport,
        header: &ResponseHeader,
    ) -> HotRodResult<Self::Output> {
        conditional_outcome(Self::NAME, &self.ctx, codec, transport, header)
    }
}

/// Overwrites the key only if it is present.
#[derive(Debug, Clone)]
pub struct ReplaceOperation {
    ctx: OperationContext,
    entry: Entry,
}

impl ReplaceOperation {
    pub(crate) fn new(
        ctx: OperationContext,
        key: Vec<u8>,
        value: Vec<u8>,
        lifespan: u32,
        max_idle: u32,
    ) -> Self {
        Self {
            ctx,
            entry: Entry {
                key,
                value,
                lifespan,
                max_idle,
            },
        }
    }
}

impl Operation for ReplaceOperation {
    type Output = WriteOutcome;

    const NAME: &'static str = "replace";
    const REQUEST_OP_CODE: u8 = op_code::REPLACE_REQUEST;

    fn context(&self) -> &OperationContext {
        &self.ctx
    }

    fn routing_key(&self) -> Option<&[u8]> {
        Some(&self.entry.key)
    }

    fn body_size_hint(&self) -> usize {
        self.entry.size_hint(&self.ctx)
    }

    fn write_body(&self, codec: &dyn Codec, buf: &mut BytesMut) {
        self.entry.write_key_and_expiration(codec, buf);
        codec.encode_bytes(&self.entry.value, buf);
    }

    fn read_body(
        &self,
        codec: &dyn Codec,
        transport: &mut Transport,
        header: &ResponseHeader,
    ) -> HotRodResult<Self::Output> {
        conditional_outcome(Self::NAME, &self.ctx, codec, transport, header)
    }
}

/// Overwrites the key only if its version still matches.
#[derive(Debug, Clone)]
pub struct ReplaceIfUnmodifiedOperation {
    ctx: OperationContext,
    entry: Entry,
    version: u64,
}

impl ReplaceIfUnmodifiedOperation {
    pub(crate) fn new(
        ctx: OperationContext,
        key: Vec<u8>,
        value: Vec<u8>,
        lifespan: u32,
        max_idle: u32,
        version: u64,
    ) -> Self {
        Self {
            ctx,
            entry: Entry {
                key,
                value,
                lifespan,
                max_idle,
            },
            version,
        }
    }
}

impl Operation for ReplaceIfUnmodifiedOperation {
    type Output = WriteOutcome;

    const NAME: &'static str = "replaceIfUnmodified";
    const REQUEST_OP_CODE: u8 = op_code::REPLACE_IF_UNMODIFIED_REQUEST;

    fn context(&self) -> &OperationContext {
        &self.ctx
    }

    fn routing_key(&self) -> Option<&[u8]> {
        Some(&self.entry.key)
    }

    fn body_size_hint(&self) -> usize {
        self.entry.size_hint(&self.ctx) + 8
    }

    fn write_body(&self, codec: &dyn Codec, buf: &mut BytesMut) {
        self.entry.write_key_and_expiration(codec, buf);
        buf.put_u64(self.version);
        codec.encode_bytes(&self.entry.value, buf);
    }

    fn read_body(
        &self,
        codec: &dyn Codec,
        transport: &mut Transport,
        header: &ResponseHeader,
    ) -> HotRodResult<Self::Output> {
        conditional_outcome(Self::NAME, &self.ctx, codec, transport, header)
    }
}
