//! Client error taxonomy.
//!
//! Every fallible call in the crate returns a [`HotRodResult`]. Errors raised while talking to a
//! particular server carry its [`ServerAddress`], which is what the operation retry loop uses to
//! pick a different server on failover.
use std::io;

use thiserror::Error;

use crate::{protocol::ProtocolVersion, transport::ServerAddress};

pub type HotRodResult<T> = Result<T, HotRodError>;

#[derive(Debug, Error)]
pub enum HotRodError {
    #[error("[connection][{address}]: {source}")]
    Connection {
        address: ServerAddress,
        #[source]
        source: io::Error,
    },

    #[error("[pool][{address}] exhausted: {reason}")]
    PoolExhausted {
        address: ServerAddress,
        reason: String,
    },

    #[error("[timeout][{address}]: {reason}")]
    Timeout {
        address: ServerAddress,
        reason: String,
    },

    #[error("malformed response: {0}")]
    Protocol(String),

    #[error("unsupported protocol version '{0}'")]
    UnsupportedProtocol(String),

    #[error("server returned status {status:#04x}: {message}")]
    RemoteOperation { status: u8, message: String },

    #[error("{operation} requires protocol version 1.2 or later (configured {version})")]
    UnsupportedOperation {
        operation: &'static str,
        version: ProtocolVersion,
    },

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("no server available; {0}")]
    NoServerAvailable(String),
}

impl HotRodError {
    /// Maps an I/O failure on a socket bound to `address`.
    pub(crate) fn from_io(address: &ServerAddress, error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => HotRodError::Timeout {
                address: address.clone(),
                reason: error.to_string(),
            },
            _ => HotRodError::Connection {
                address: address.clone(),
                source: error,
            },
        }
    }

    /// Failures that may succeed against a different server.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HotRodError::Connection { .. }
                | HotRodError::PoolExhausted { .. }
                | HotRodError::Timeout { .. }
        )
    }

    /// Server the failure is attributed to, if any.
    pub fn address(&self) -> Option<&ServerAddress> {
        match self {
            HotRodError::Connection { address, .. }
            | HotRodError::PoolExhausted { address, .. }
            | HotRodError::Timeout { address, .. } => Some(address),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_timeouts_map_to_timeout() {
        let address = ServerAddress::new("127.0.0.1", 11222);
        let err = HotRodError::from_io(&address, io::Error::from(io::ErrorKind::WouldBlock));

        assert!(matches!(err, HotRodError::Timeout { .. }));
        assert!(err.is_retryable());
        assert_eq!(err.address(), Some(&address));
    }

    #[test]
    fn remote_errors_are_not_retried() {
        let err = HotRodError::RemoteOperation {
            status: 0x85,
            message: "boom".to_string(),
        };

        assert!(!err.is_retryable());
        assert_eq!(err.address(), None);
        assert_eq!(err.to_string(), "server returned status 0x85: boom");
    }
}
