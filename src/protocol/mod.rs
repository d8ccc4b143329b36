//! Hot Rod wire protocol.
//!
//! This module owns every detail of the binary format spoken between the client and the cache
//! servers: protocol primitives, request/response headers, topology payloads and the hash
//! function used for key routing. The rest of the crate is format-agnostic and goes through a
//! [`Codec`] selected from the configured [`ProtocolVersion`].
//!
//! # Binary Format
//!
//! - Variable-length integers (`vint`, `vlong`) are unsigned LEB128.
//! - Byte arrays and strings are prefixed with their length as a `vint`.
//! - Fixed-width integers are big-endian.
//!
//! A request starts with a header
//!
//! ```text
//! 0xA0 | message id (vlong) | version (u8) | op code (u8) | cache name (array)
//!      | flags (vint) | client intelligence (u8) | topology id (vint) | tx type (u8)
//! ```
//!
//! followed by the operation payload (key, expiration, value, ...). A response starts with
//!
//! ```text
//! 0xA1 | message id (vlong) | op code (u8) | status (u8) | topology marker (u8) [| topology]
//! ```
//!
//! # Versions
//!
//! Versions 1.0, 1.1 and 1.2 are supported. They share the header layout; 1.1 adds the number
//! of virtual nodes to hash-aware topology payloads and 1.2 adds the metadata and key-set
//! operations.
mod codec;
mod hash;
mod primitives;

use std::{fmt, ops::BitOr};

pub use codec::{
    Codec, Codec10, Codec11, Codec12, HashTopology, HeaderParams, ResponseHeader, TopologyUpdate,
    codec_for_version,
};
pub use hash::murmur_hash2;
pub(crate) use primitives::{put_array, put_string, put_vint, put_vlong};

use crate::{HotRodError, HotRodResult};

pub mod header {
    pub const REQUEST_MAGIC: u8 = 0xA0;
    pub const RESPONSE_MAGIC: u8 = 0xA1;

    pub const CLIENT_INTELLIGENCE_BASIC: u8 = 0x01;
    pub const CLIENT_INTELLIGENCE_TOPOLOGY_AWARE: u8 = 0x02;
    pub const CLIENT_INTELLIGENCE_HASH_DISTRIBUTION_AWARE: u8 = 0x03;

    pub const NO_TRANSACTION: u8 = 0x00;

    pub const TOPOLOGY_UNCHANGED: u8 = 0x00;
    pub const TOPOLOGY_CHANGED: u8 = 0x01;
}

/// Request op codes. Every response op code is its request op code plus one.
pub mod op_code {
    pub const PUT_REQUEST: u8 = 0x01;
    pub const GET_REQUEST: u8 = 0x03;
    pub const PUT_IF_ABSENT_REQUEST: u8 = 0x05;
    pub const REPLACE_REQUEST: u8 = 0x07;
    pub const REPLACE_IF_UNMODIFIED_REQUEST: u8 = 0x09;
    pub const REMOVE_REQUEST: u8 = 0x0B;
    pub const REMOVE_IF_UNMODIFIED_REQUEST: u8 = 0x0D;
    pub const CONTAINS_KEY_REQUEST: u8 = 0x0F;
    pub const GET_WITH_VERSION_REQUEST: u8 = 0x11;
    pub const CLEAR_REQUEST: u8 = 0x13;
    pub const STATS_REQUEST: u8 = 0x15;
    pub const PING_REQUEST: u8 = 0x17;
    pub const BULK_GET_REQUEST: u8 = 0x19;
    pub const GET_WITH_METADATA_REQUEST: u8 = 0x1B;
    pub const BULK_GET_KEYS_REQUEST: u8 = 0x1D;

    pub const ERROR_RESPONSE: u8 = 0x50;

    pub const fn response(request: u8) -> u8 {
        request + 1
    }
}

pub mod status {
    pub const NO_ERROR: u8 = 0x00;
    pub const NOT_PUT_REMOVED_REPLACED: u8 = 0x01;
    pub const KEY_DOES_NOT_EXIST: u8 = 0x02;

    pub const INVALID_MAGIC_OR_MESSAGE_ID: u8 = 0x81;
    pub const UNKNOWN_COMMAND: u8 = 0x82;
    pub const UNKNOWN_VERSION: u8 = 0x83;
    pub const REQUEST_PARSING_ERROR: u8 = 0x84;
    pub const SERVER_ERROR: u8 = 0x85;
    pub const COMMAND_TIMEOUT: u8 = 0x86;

    pub const fn is_error(status: u8) -> bool {
        status >= INVALID_MAGIC_OR_MESSAGE_ID
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ProtocolVersion {
    V10,
    V11,
    #[default]
    V12,
}

impl ProtocolVersion {
    /// Parses `"1.0"`, `"1.1"` or `"1.2"`. An empty string selects the default version.
    pub fn parse(version: &str) -> HotRodResult<Self> {
        match version.trim() {
            "" => Ok(Self::default()),
            "1.0" => Ok(Self::V10),
            "1.1" => Ok(Self::V11),
            "1.2" => Ok(Self::V12),
            other => Err(HotRodError::UnsupportedProtocol(other.to_string())),
        }
    }

    /// Version byte sent in every request header.
    pub fn as_byte(self) -> u8 {
        match self {
            Self::V10 => 10,
            Self::V11 => 11,
            Self::V12 => 12,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V10 => write!(f, "1.0"),
            Self::V11 => write!(f, "1.1"),
            Self::V12 => write!(f, "1.2"),
        }
    }
}

/// Request flags bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Flags(u32);

impl Flags {
    pub const NONE: Flags = Flags(0);
    /// Ask write operations to send back the previous value.
    pub const FORCE_RETURN_VALUE: Flags = Flags(0x0001);
    /// Ignore the lifespan sent with the request and use the server default.
    pub const DEFAULT_LIFESPAN: Flags = Flags(0x0002);
    /// Ignore the max idle sent with the request and use the server default.
    pub const DEFAULT_MAXIDLE: Flags = Flags(0x0004);

    pub const fn from_bits(bits: u32) -> Self {
        Flags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Self) -> Self::Output {
        Flags(self.0 | rhs.0)
    }
}
