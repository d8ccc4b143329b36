//! Connections to cache servers.
//!
//! A [`Transport`] is one logical connection to one server. Transports are created by a
//! [`Connector`], parked in the [`ConnectionPool`] while idle and handed to exactly one operation
//! at a time through a [`PooledTransport`] guard. The [`TransportFactory`] sits on top: it knows the
//! cluster topology, picks a server for each request and keeps track of servers that recently
//! failed.
//!
//! # Ownership
//!
//! - Idle transports are owned by the pool.
//! - Checked-out transports are owned by the [`PooledTransport`] guard, which returns them to
//!   the pool (or closes them if they are broken) when dropped.
//! - Closing the pool shuts down every socket, including the ones currently checked out.
mod connector;
mod evictor;
mod factory;
mod pool;
mod topology;

use std::{
    fmt,
    io::{self, BufReader, Read, Write},
    net::{Shutdown, TcpStream, ToSocketAddrs},
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use integer_encoding::VarIntReader;
use log::{debug, trace};

pub use connector::{Connector, TcpConnector};
pub use factory::TransportFactory;
pub use pool::{ConnectionPool, PooledTransport};
pub use topology::{ConsistentHash, TopologyInfo};

use crate::{HotRodError, HotRodResult};

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

const INITIAL_READ_CAPACITY: usize = 8 * 1024;

/// `host:port` of a cache server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerAddress {
    host: String,
    port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Byte stream a transport runs over.
pub trait Stream: Read + Write + Send {}

impl<T: Read + Write + Send> Stream for T {}

/// Second handle on a transport's socket, used to abort I/O of a checked-out transport.
#[derive(Debug)]
pub(crate) struct ShutdownHandle(TcpStream);

impl ShutdownHandle {
    pub(crate) fn shutdown(&self) {
        let _ = self.0.shutdown(Shutdown::Both);
    }
}

/// One connection to one server.
///
/// Reads are buffered; writes go straight to the socket. Any I/O failure marks the transport
/// invalid, which makes the pool close it instead of reusing it.
pub struct Transport {
    id: u64,
    address: ServerAddress,
    reader: BufReader<Box<dyn Stream>>,
    socket: Option<TcpStream>,
    valid: bool,
    closed: bool,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("valid", &self.valid)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Transport {
    /// Opens a TCP connection to `address`.
    ///
    /// A zero `connect_timeout` or `socket_timeout` means no timeout.
    pub fn connect(
        address: &ServerAddress,
        connect_timeout: Duration,
        socket_timeout: Duration,
        tcp_no_delay: bool,
    ) -> HotRodResult<Self> {
        let connection_error = |source: io::Error| HotRodError::Connection {
            address: address.clone(),
            source,
        };

        let mut last_error = None;
        let mut stream = None;
        for addr in (address.host(), address.port())
            .to_socket_addrs()
            .map_err(connection_error)?
        {
            let attempt = if connect_timeout.is_zero() {
                TcpStream::connect(addr)
            } else {
                TcpStream::connect_timeout(&addr, connect_timeout)
            };
            match attempt {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => last_error = Some(e),
            }
        }

        let stream = match stream {
            Some(stream) => stream,
            None => {
                let error = last_error.unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, "host did not resolve")
                });
                return Err(HotRodError::from_io(address, error));
            }
        };

        let timeout = (!socket_timeout.is_zero()).then_some(socket_timeout);
        stream.set_read_timeout(timeout).map_err(connection_error)?;
        stream.set_write_timeout(timeout).map_err(connection_error)?;
        stream.set_nodelay(tcp_no_delay).map_err(connection_error)?;
        let socket = stream.try_clone().map_err(connection_error)?;

        let mut transport = Self::from_stream(address.clone(), Box::new(stream));
        transport.socket = Some(socket);
        debug!("opened transport {} to {address}", transport.id);
        Ok(transport)
    }

    /// Wraps an already connected stream.
    pub fn from_stream(address: ServerAddress, stream: Box<dyn Stream>) -> Self {
        Self {
            id: NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed),
            address,
            reader: BufReader::new(stream),
            socket: None,
            valid: true,
            closed: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn is_valid(&self) -> bool {
        self.valid && !self.closed
    }

    /// Marks the transport as unusable; it is closed instead of pooled on release.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    pub(crate) fn shutdown_handle(&self) -> Option<ShutdownHandle> {
        self.socket
            .as_ref()
            .and_then(|s| s.try_clone().ok())
            .map(ShutdownHandle)
    }

    fn fail(&mut self, error: io::Error) -> HotRodError {
        self.valid = false;
        HotRodError::from_io(&self.address, error)
    }

    /// Writes a full request frame and flushes it.
    pub fn write(&mut self, bytes: &[u8]) -> HotRodResult<()> {
        trace!("transport {} writing {} bytes", self.id, bytes.len());
        let stream = self.reader.get_mut();
        let result = stream.write_all(bytes).and_then(|_| stream.flush());
        result.map_err(|e| self.fail(e))
    }

    /// Reads exactly `n` bytes. The buffer grows with the bytes received, so a bogus length
    /// from the wire fails on end of stream instead of allocating `n` bytes up front.
    pub fn read_exact(&mut self, n: usize) -> HotRodResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(n.min(INITIAL_READ_CAPACITY));
        let result = (&mut self.reader).take(n as u64).read_to_end(&mut buf);
        match result {
            Ok(read) if read == n => Ok(buf),
            Ok(read) => Err(self.fail(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("expected {n} bytes, stream ended after {read}"),
            ))),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn read_array_of<const N: usize>(&mut self) -> HotRodResult<[u8; N]> {
        let mut buf = [0u8; N];
        match self.reader.read_exact(&mut buf) {
            Ok(()) => Ok(buf),
            Err(e) => Err(self.fail(e)),
        }
    }

    pub fn read_byte(&mut self) -> HotRodResult<u8> {
        Ok(self.read_array_of::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> HotRodResult<u16> {
        Ok(u16::from_be_bytes(self.read_array_of()?))
    }

    pub fn read_u32(&mut self) -> HotRodResult<u32> {
        Ok(u32::from_be_bytes(self.read_array_of()?))
    }

    pub fn read_u64(&mut self) -> HotRodResult<u64> {
        Ok(u64::from_be_bytes(self.read_array_of()?))
    }

    pub fn read_vint(&mut self) -> HotRodResult<u32> {
        match self.reader.read_varint::<u32>() {
            Ok(v) => Ok(v),
            Err(e) => Err(self.fail(e)),
        }
    }

    pub fn read_vlong(&mut self) -> HotRodResult<u64> {
        match self.reader.read_varint::<u64>() {
            Ok(v) => Ok(v),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Reads a `vint` length followed by that many bytes.
    pub fn read_var_length(&mut self) -> HotRodResult<Vec<u8>> {
        let len = self.read_vint()? as usize;
        self.read_exact(len)
    }

    pub fn read_array(&mut self) -> HotRodResult<Vec<u8>> {
        self.read_var_length()
    }

    pub fn read_string(&mut self) -> HotRodResult<String> {
        let bytes = self.read_var_length()?;
        String::from_utf8(bytes).map_err(|e| {
            self.valid = false;
            HotRodError::Protocol(format!("string is not valid UTF-8: {e}"))
        })
    }

    /// Closes the socket. Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(socket) = self.socket.take() {
            let _ = socket.shutdown(Shutdown::Both);
        }
        debug!("closed transport {} to {}", self.id, self.address);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}
