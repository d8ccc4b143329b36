//! Client for the Hot Rod binary remote-cache protocol.
//!
//! The crate is layered bottom-up:
//!
//! - [`protocol`]: codecs for protocol versions 1.0 to 1.2.
//! - [`transport`]: connections, the per-server connection pool and topology-aware routing.
//! - [`operations`]: typed request/response exchanges and the factory that builds them.
//! - [`RemoteCacheManager`] / [`RemoteCache`]: the facade most callers use.
//!
//! Logging goes through the [`log`] facade; install a logger such as `env_logger` to see it.
pub mod cli;
pub mod configuration;
mod error;
pub mod operations;
pub mod protocol;
mod remote_cache;
pub mod transport;

#[cfg(test)]
mod testing;

pub use configuration::{Configuration, ConfigurationBuilder};
pub use error::{HotRodError, HotRodResult};
pub use remote_cache::{RemoteCache, RemoteCacheManager};
