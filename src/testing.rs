//! In-process Hot Rod server for tests.
//!
//! Speaks enough of protocol 1.x to exercise the client: an in-memory store with versions and
//! expiration metadata, topology pushes, and injected faults.
use std::{
    collections::{BTreeMap, VecDeque},
    io::{self, BufReader, Read, Write},
    net::{Shutdown, TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::{BufMut, BytesMut};
use integer_encoding::VarIntReader;
use parking_lot::Mutex;

use crate::{
    protocol::{
        header::{
            CLIENT_INTELLIGENCE_HASH_DISTRIBUTION_AWARE, CLIENT_INTELLIGENCE_TOPOLOGY_AWARE,
            REQUEST_MAGIC, RESPONSE_MAGIC, TOPOLOGY_CHANGED, TOPOLOGY_UNCHANGED,
        },
        op_code, put_array, put_string, put_vint, put_vlong, status,
    },
    transport::ServerAddress,
};

const FORCE_RETURN_VALUE: u32 = 0x01;
const INFINITE_LIFESPAN: u8 = 0x01;
const INFINITE_MAXIDLE: u8 = 0x02;

/// One-shot misbehaviour applied to the next matching request.
#[derive(Debug, Clone)]
pub(crate) enum Fault {
    /// Answer the next get with a value cut short, then drop the connection.
    TruncateGet,
    /// Answer the next request with an error response.
    ErrorStatus(u8, String),
    /// Read the next request and never answer it; the connection stays open.
    Stall,
}

struct StoredEntry {
    value: Vec<u8>,
    version: u64,
    created: u64,
    lifespan: u32,
    max_idle: u32,
}

#[derive(Default)]
struct ServerState {
    entries: Mutex<BTreeMap<Vec<u8>, StoredEntry>>,
    versions: AtomicU64,
    topology: Mutex<Option<(u32, Vec<ServerAddress>)>>,
    faults: Mutex<VecDeque<Fault>>,
    requests: AtomicUsize,
    connections: Mutex<Vec<TcpStream>>,
    stopped: AtomicBool,
}

struct Request {
    message_id: u64,
    version: u8,
    op_code: u8,
    flags: u32,
    intelligence: u8,
    topology_id: u32,
}

impl Request {
    fn force_return(&self) -> bool {
        self.flags & FORCE_RETURN_VALUE != 0
    }
}

enum Body {
    Key(Vec<u8>),
    KeyVersion(Vec<u8>, u64),
    Write {
        key: Vec<u8>,
        lifespan: u32,
        max_idle: u32,
        version: Option<u64>,
        value: Vec<u8>,
    },
    Count(u32),
    Empty,
}

pub(crate) struct MockServer {
    address: ServerAddress,
    state: Arc<ServerState>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl MockServer {
    pub(crate) fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(ServerState::default());

        let shared = Arc::clone(&state);
        let acceptor = thread::spawn(move || {
            for stream in listener.incoming() {
                if shared.stopped.load(Ordering::SeqCst) {
                    break;
                }
                let Ok(stream) = stream else { continue };
                if let Ok(clone) = stream.try_clone() {
                    shared.connections.lock().push(clone);
                }
                let state = Arc::clone(&shared);
                thread::spawn(move || serve(stream, state));
            }
        });

        Self {
            address: ServerAddress::new("127.0.0.1", port),
            state,
            acceptor: Mutex::new(Some(acceptor)),
        }
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub(crate) fn inject(&self, fault: Fault) {
        self.state.faults.lock().push_back(fault);
    }

    /// Sends `servers` as topology `id` to every client still on an older topology.
    pub(crate) fn set_topology(&self, id: u32, servers: &[ServerAddress]) {
        *self.state.topology.lock() = Some((id, servers.to_vec()));
    }

    pub(crate) fn request_count(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    pub(crate) fn stored_entries(&self) -> usize {
        self.state.entries.lock().len()
    }

    /// Shuts down every accepted connection; the listener keeps running.
    pub(crate) fn stop_connections(&self) {
        for stream in self.state.connections.lock().drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Closes the listener and every connection. Later connection attempts are refused.
    pub(crate) fn stop(&self) {
        if self.state.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        // wake the acceptor so it sees the flag and drops the listener
        let _ = TcpStream::connect((self.address.host(), self.address.port()));
        if let Some(acceptor) = self.acceptor.lock().take() {
            let _ = acceptor.join();
        }
        self.stop_connections();
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

fn read_u8(r: &mut impl Read) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u64(r: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

fn read_array(r: &mut impl Read) -> io::Result<Vec<u8>> {
    let len: u32 = r.read_varint()?;
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_request(r: &mut impl Read) -> io::Result<Request> {
    if read_u8(r)? != REQUEST_MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad magic"));
    }
    let message_id: u64 = r.read_varint()?;
    let version = read_u8(r)?;
    let op_code = read_u8(r)?;
    let _cache_name = read_array(r)?;
    let flags: u32 = r.read_varint()?;
    let intelligence = read_u8(r)?;
    let topology_id: u32 = r.read_varint()?;
    let _tx_type = read_u8(r)?;
    Ok(Request {
        message_id,
        version,
        op_code,
        flags,
        intelligence,
        topology_id,
    })
}

fn read_body(r: &mut impl Read, op: u8) -> io::Result<Option<Body>> {
    let body = match op {
        op_code::GET_REQUEST
        | op_code::CONTAINS_KEY_REQUEST
        | op_code::REMOVE_REQUEST
        | op_code::GET_WITH_VERSION_REQUEST
        | op_code::GET_WITH_METADATA_REQUEST => Body::Key(read_array(r)?),
        op_code::REMOVE_IF_UNMODIFIED_REQUEST => Body::KeyVersion(read_array(r)?, read_u64(r)?),
        op_code::PUT_REQUEST
        | op_code::PUT_IF_ABSENT_REQUEST
        | op_code::REPLACE_REQUEST
        | op_code::REPLACE_IF_UNMODIFIED_REQUEST => {
            let key = read_array(r)?;
            let lifespan: u32 = r.read_varint()?;
            let max_idle: u32 = r.read_varint()?;
            let version = if op == op_code::REPLACE_IF_UNMODIFIED_REQUEST {
                Some(read_u64(r)?)
            } else {
                None
            };
            let value = read_array(r)?;
            Body::Write {
                key,
                lifespan,
                max_idle,
                version,
                value,
            }
        }
        op_code::BULK_GET_REQUEST | op_code::BULK_GET_KEYS_REQUEST => {
            Body::Count(r.read_varint()?)
        }
        op_code::PING_REQUEST | op_code::CLEAR_REQUEST | op_code::STATS_REQUEST => Body::Empty,
        _ => return Ok(None),
    };
    Ok(Some(body))
}

fn serve(stream: TcpStream, state: Arc<ServerState>) {
    let Ok(mut writer) = stream.try_clone() else {
        return;
    };
    let mut reader = BufReader::new(stream);

    loop {
        let Ok(request) = read_request(&mut reader) else {
            return;
        };
        let Ok(body) = read_body(&mut reader, request.op_code) else {
            return;
        };
        state.requests.fetch_add(1, Ordering::SeqCst);

        let mut out = BytesMut::new();
        let keep_open = match body {
            Some(body) => respond(&state, &request, body, &mut out),
            None => {
                write_error(&state, &request, status::UNKNOWN_COMMAND, "unknown command", &mut out);
                false
            }
        };

        if writer.write_all(&out).and_then(|_| writer.flush()).is_err() {
            return;
        }
        if !keep_open {
            let _ = writer.shutdown(Shutdown::Both);
            return;
        }
    }
}

fn write_header(state: &ServerState, request: &Request, op: u8, status: u8, out: &mut BytesMut) {
    out.put_u8(RESPONSE_MAGIC);
    put_vlong(out, request.message_id);
    out.put_u8(op);
    out.put_u8(status);

    let topology = state.topology.lock().clone();
    match topology {
        Some((id, servers))
            if request.topology_id < id
                && request.intelligence >= CLIENT_INTELLIGENCE_TOPOLOGY_AWARE =>
        {
            out.put_u8(TOPOLOGY_CHANGED);
            put_vint(out, id);
            if request.intelligence == CLIENT_INTELLIGENCE_HASH_DISTRIBUTION_AWARE {
                out.put_u16(1);
                out.put_u8(1);
                put_vint(out, i32::MAX as u32);
                put_vint(out, servers.len() as u32);
                if request.version >= 11 {
                    put_vint(out, 1);
                }
                let step = i32::MAX as u32 / servers.len().max(1) as u32;
                for (i, server) in servers.iter().enumerate() {
                    put_string(out, server.host());
                    out.put_u16(server.port());
                    out.put_u32(step * (i as u32 + 1));
                }
            } else {
                put_vint(out, servers.len() as u32);
                for server in &servers {
                    put_string(out, server.host());
                    out.put_u16(server.port());
                }
            }
        }
        _ => out.put_u8(TOPOLOGY_UNCHANGED),
    }
}

fn write_error(state: &ServerState, request: &Request, status: u8, message: &str, out: &mut BytesMut) {
    write_header(state, request, op_code::ERROR_RESPONSE, status, out);
    put_string(out, message);
}

/// Writes the previous value of a forced write; an empty array stands for none.
fn write_previous(request: &Request, previous: Option<&[u8]>, out: &mut BytesMut) {
    if request.force_return() {
        put_array(out, previous.unwrap_or_default());
    }
}

fn respond(state: &ServerState, request: &Request, body: Body, out: &mut BytesMut) -> bool {
    let fault = {
        let mut faults = state.faults.lock();
        let applies = match faults.front() {
            Some(Fault::TruncateGet) => request.op_code == op_code::GET_REQUEST,
            Some(Fault::ErrorStatus(..) | Fault::Stall) => true,
            None => false,
        };
        if applies { faults.pop_front() } else { None }
    };
    let response_op = op_code::response(request.op_code);

    match fault {
        Some(Fault::ErrorStatus(status, message)) => {
            write_error(state, request, status, &message, out);
            return true;
        }
        Some(Fault::TruncateGet) => {
            write_header(state, request, response_op, status::NO_ERROR, out);
            put_vint(out, 10);
            out.put_slice(b"abc");
            return false;
        }
        Some(Fault::Stall) => return true,
        None => {}
    }

    let mut entries = state.entries.lock();
    let next_version = || state.versions.fetch_add(1, Ordering::SeqCst) + 1;

    match (request.op_code, body) {
        (op_code::PING_REQUEST, _) => {
            write_header(state, request, response_op, status::NO_ERROR, out)
        }
        (op_code::CLEAR_REQUEST, _) => {
            entries.clear();
            write_header(state, request, response_op, status::NO_ERROR, out);
        }
        (op_code::STATS_REQUEST, _) => {
            write_header(state, request, response_op, status::NO_ERROR, out);
            let stats = [
                ("currentNumberOfEntries", entries.len().to_string()),
                ("requests", state.requests.load(Ordering::SeqCst).to_string()),
            ];
            put_vint(out, stats.len() as u32);
            for (name, value) in stats {
                put_string(out, name);
                put_string(out, &value);
            }
        }
        (op_code::GET_REQUEST, Body::Key(key)) => match entries.get(&key) {
            Some(entry) => {
                write_header(state, request, response_op, status::NO_ERROR, out);
                put_array(out, &entry.value);
            }
            None => write_header(state, request, response_op, status::KEY_DOES_NOT_EXIST, out),
        },
        (op_code::CONTAINS_KEY_REQUEST, Body::Key(key)) => {
            let status = if entries.contains_key(&key) {
                status::NO_ERROR
            } else {
                status::KEY_DOES_NOT_EXIST
            };
            write_header(state, request, response_op, status, out);
        }
        (op_code::GET_WITH_VERSION_REQUEST, Body::Key(key)) => match entries.get(&key) {
            Some(entry) => {
                write_header(state, request, response_op, status::NO_ERROR, out);
                out.put_u64(entry.version);
                put_array(out, &entry.value);
            }
            None => write_header(state, request, response_op, status::KEY_DOES_NOT_EXIST, out),
        },
        (op_code::GET_WITH_METADATA_REQUEST, Body::Key(key)) => match entries.get(&key) {
            Some(entry) => {
                write_header(state, request, response_op, status::NO_ERROR, out);
                let mut flags = 0;
                if entry.lifespan == 0 {
                    flags |= INFINITE_LIFESPAN;
                }
                if entry.max_idle == 0 {
                    flags |= INFINITE_MAXIDLE;
                }
                out.put_u8(flags);
                if entry.lifespan != 0 {
                    out.put_u64(entry.created);
                    put_vint(out, entry.lifespan);
                }
                if entry.max_idle != 0 {
                    out.put_u64(entry.created);
                    put_vint(out, entry.max_idle);
                }
                out.put_u64(entry.version);
                put_array(out, &entry.value);
            }
            None => write_header(state, request, response_op, status::KEY_DOES_NOT_EXIST, out),
        },
        (op_code::REMOVE_REQUEST, Body::Key(key)) => match entries.remove(&key) {
            Some(entry) => {
                write_header(state, request, response_op, status::NO_ERROR, out);
                write_previous(request, Some(&entry.value), out);
            }
            None => write_header(state, request, response_op, status::KEY_DOES_NOT_EXIST, out),
        },
        (op_code::REMOVE_IF_UNMODIFIED_REQUEST, Body::KeyVersion(key, version)) => {
            match entries.get(&key).map(|e| e.version) {
                None => {
                    write_header(state, request, response_op, status::KEY_DOES_NOT_EXIST, out)
                }
                Some(current) if current != version => {
                    write_header(state, request, response_op, status::NOT_PUT_REMOVED_REPLACED, out);
                    write_previous(request, entries.get(&key).map(|e| e.value.as_slice()), out);
                }
                Some(_) => {
                    let previous = entries.remove(&key).map(|e| e.value);
                    write_header(state, request, response_op, status::NO_ERROR, out);
                    write_previous(request, previous.as_deref(), out);
                }
            }
        }
        (
            op,
            Body::Write {
                key,
                lifespan,
                max_idle,
                version,
                value,
            },
        ) => {
            let current = entries.get(&key).map(|e| e.version);
            let applies = match op {
                op_code::PUT_REQUEST => true,
                op_code::PUT_IF_ABSENT_REQUEST => current.is_none(),
                op_code::REPLACE_REQUEST => current.is_some(),
                _ => current.is_some() && current == version,
            };
            if op == op_code::REPLACE_IF_UNMODIFIED_REQUEST && current.is_none() {
                write_header(state, request, response_op, status::KEY_DOES_NOT_EXIST, out);
                return true;
            }

            if applies {
                let previous = entries.insert(
                    key,
                    StoredEntry {
                        value,
                        version: next_version(),
                        created: now_millis(),
                        lifespan,
                        max_idle,
                    },
                );
                write_header(state, request, response_op, status::NO_ERROR, out);
                write_previous(request, previous.as_ref().map(|e| e.value.as_slice()), out);
            } else {
                write_header(state, request, response_op, status::NOT_PUT_REMOVED_REPLACED, out);
                write_previous(request, entries.get(&key).map(|e| e.value.as_slice()), out);
            }
        }
        (op_code::BULK_GET_REQUEST, Body::Count(count)) => {
            write_header(state, request, response_op, status::NO_ERROR, out);
            let limit = if count == 0 { usize::MAX } else { count as usize };
            for (key, entry) in entries.iter().take(limit) {
                out.put_u8(1);
                put_array(out, key);
                put_array(out, &entry.value);
            }
            out.put_u8(0);
        }
        (op_code::BULK_GET_KEYS_REQUEST, Body::Count(_scope)) => {
            write_header(state, request, response_op, status::NO_ERROR, out);
            for key in entries.keys() {
                out.put_u8(1);
                put_array(out, key);
            }
            out.put_u8(0);
        }
        _ => {
            write_error(state, request, status::REQUEST_PARSING_ERROR, "malformed request", out);
            return false;
        }
    }
    true
}
