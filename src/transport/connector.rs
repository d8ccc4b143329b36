use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use log::debug;

use crate::{
    HotRodResult, configuration::Configuration, operations::PingOperation, protocol::Codec,
};

use super::{ServerAddress, Transport};

/// Creates and health-checks transports on behalf of the pool.
pub trait Connector: Send + Sync {
    fn connect(&self, address: &ServerAddress) -> HotRodResult<Transport>;

    /// Returns `false` when the transport must not be handed out again.
    fn validate(&self, transport: &mut Transport) -> bool;
}

/// Plain TCP connector; validation sends a ping.
#[derive(Debug)]
pub struct TcpConnector {
    codec: Arc<dyn Codec>,
    message_ids: Arc<AtomicU64>,
    connect_timeout: Duration,
    socket_timeout: Duration,
    tcp_no_delay: bool,
}

impl TcpConnector {
    pub fn new(config: &Configuration, codec: Arc<dyn Codec>, message_ids: Arc<AtomicU64>) -> Self {
        Self {
            codec,
            message_ids,
            connect_timeout: config.connection_timeout(),
            socket_timeout: config.socket_timeout(),
            tcp_no_delay: config.tcp_no_delay(),
        }
    }
}

impl Connector for TcpConnector {
    fn connect(&self, address: &ServerAddress) -> HotRodResult<Transport> {
        Transport::connect(
            address,
            self.connect_timeout,
            self.socket_timeout,
            self.tcp_no_delay,
        )
    }

    fn validate(&self, transport: &mut Transport) -> bool {
        if !transport.is_valid() {
            return false;
        }

        let message_id = self.message_ids.fetch_add(1, Ordering::Relaxed);
        match PingOperation::validate(self.codec.as_ref(), transport, message_id) {
            Ok(()) => true,
            Err(e) => {
                debug!(
                    "transport {} to {} failed validation: {e}",
                    transport.id(),
                    transport.address()
                );
                transport.invalidate();
                false
            }
        }
    }
}
