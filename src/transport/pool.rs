//! Keyed pool of transports, one sub-pool per server address.
//!
//! All bookkeeping lives behind a single mutex so that checking for an idle transport and taking
//! it, or reserving capacity for a new one, is atomic. Socket work (connecting, validating,
//! closing) happens with the lock released.
use std::{
    collections::{HashMap, VecDeque},
    fmt,
    ops::{Deref, DerefMut},
    sync::{Arc, Weak},
    time::Instant,
};

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{
    HotRodError, HotRodResult,
    configuration::{ConnectionPoolConfiguration, ExhaustedAction},
};

use super::{Connector, ServerAddress, ShutdownHandle, Transport, evictor::Evictor};

struct IdleTransport {
    transport: Transport,
    since: Instant,
}

#[derive(Default)]
struct ServerPool {
    // oldest first
    idle: VecDeque<IdleTransport>,
    active: usize,
    /// Left the topology while transports were checked out; those are closed on return.
    retired: bool,
}

impl ServerPool {
    fn size(&self) -> usize {
        self.idle.len() + self.active
    }
}

/// Outcome of reserving room for a new transport.
enum Capacity {
    Available,
    /// Room was made by taking the oldest idle transport of another server, to be closed once
    /// the lock is released.
    Reclaimed(IdleTransport),
    Exhausted,
}

#[derive(Default)]
struct PoolState {
    servers: HashMap<ServerAddress, ServerPool>,
    in_use: HashMap<u64, ShutdownHandle>,
    /// Idle plus in-use transports across every server.
    total: usize,
    closed: bool,
}

struct PoolInner {
    config: ConnectionPoolConfiguration,
    connector: Arc<dyn Connector>,
    state: Mutex<PoolState>,
    available: Condvar,
    evictor: Mutex<Option<Evictor>>,
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ConnectionPool")
            .field("servers", &state.servers.len())
            .field("total", &state.total)
            .field("closed", &state.closed)
            .finish()
    }
}

impl ConnectionPool {
    /// Creates the pool and, when an eviction interval is configured, its evictor thread.
    pub fn new(config: ConnectionPoolConfiguration, connector: Arc<dyn Connector>) -> Self {
        let interval = config.time_between_eviction_runs;
        let pool = Self {
            inner: Arc::new(PoolInner {
                config,
                connector,
                state: Mutex::new(PoolState::default()),
                available: Condvar::new(),
                evictor: Mutex::new(None),
            }),
        };

        if let Some(interval) = interval {
            let weak: Weak<PoolInner> = Arc::downgrade(&pool.inner);
            let started = Evictor::start(interval, move || match weak.upgrade() {
                Some(inner) => {
                    ConnectionPool { inner }.evict();
                    true
                }
                None => false,
            });
            match started {
                Ok(evictor) => *pool.inner.evictor.lock() = Some(evictor),
                Err(e) => warn!("failed to start evictor thread, idle transports will not be evicted: {e}"),
            }
        }

        pool
    }

    pub fn config(&self) -> &ConnectionPoolConfiguration {
        &self.inner.config
    }

    /// Checks out a transport to `address`, applying the exhausted action when the caps are hit.
    pub fn acquire(&self, address: &ServerAddress) -> HotRodResult<PooledTransport> {
        let config = &self.inner.config;
        let deadline = config.max_wait.map(|wait| Instant::now() + wait);
        let mut state = self.inner.state.lock();

        loop {
            if state.closed {
                return Err(HotRodError::PoolExhausted {
                    address: address.clone(),
                    reason: "pool is closed".to_string(),
                });
            }

            let idle = {
                let server = state.servers.entry(address.clone()).or_default();
                server.retired = false;
                let idle = if config.lifo {
                    server.idle.pop_back()
                } else {
                    server.idle.pop_front()
                };
                if idle.is_some() {
                    server.active += 1;
                }
                idle
            };

            if let Some(IdleTransport { mut transport, .. }) = idle {
                if config.test_on_borrow {
                    let healthy = MutexGuard::unlocked(&mut state, || {
                        self.inner.connector.validate(&mut transport)
                    });
                    if !healthy {
                        Self::forget(&mut state, address);
                        self.inner.available.notify_all();
                        continue;
                    }
                }
                trace!("reusing transport {} to {address}", transport.id());
                return self.checkout(&mut state, transport);
            }

            let create_new = config.exhausted_action == ExhaustedAction::CreateNew;
            let (fits, reclaimed) = match self.reserve(&mut state, address) {
                Capacity::Available => (true, None),
                Capacity::Reclaimed(idle) => (true, Some(idle)),
                Capacity::Exhausted => (create_new, None),
            };
            if fits {
                if let Some(server) = state.servers.get_mut(address) {
                    server.active += 1;
                }
                state.total += 1;

                let created = MutexGuard::unlocked(&mut state, || {
                    drop(reclaimed);
                    self.inner.connector.connect(address)
                });
                return match created {
                    Ok(transport) => self.checkout(&mut state, transport),
                    Err(e) => {
                        Self::forget(&mut state, address);
                        self.inner.available.notify_all();
                        Err(e)
                    }
                };
            }

            match (config.exhausted_action, deadline) {
                (ExhaustedAction::Wait, None) => self.inner.available.wait(&mut state),
                (ExhaustedAction::Wait, Some(deadline)) => {
                    if Instant::now() >= deadline
                        || self
                            .inner
                            .available
                            .wait_until(&mut state, deadline)
                            .timed_out()
                    {
                        debug!("timed out waiting for a transport to {address}");
                        return Err(HotRodError::PoolExhausted {
                            address: address.clone(),
                            reason: format!(
                                "no transport became available within {:?}",
                                config.max_wait.unwrap_or_default()
                            ),
                        });
                    }
                }
                _ => {
                    debug!("pool exhausted for {address}");
                    return Err(HotRodError::PoolExhausted {
                        address: address.clone(),
                        reason: "no idle transport and the pool is at capacity".to_string(),
                    });
                }
            }
        }
    }

    /// Whether one more transport to `address` fits under the caps. When only the global cap is
    /// in the way, the oldest idle transport of another server is taken out to make room.
    fn reserve(&self, state: &mut PoolState, address: &ServerAddress) -> Capacity {
        let config = &self.inner.config;
        let server_size = state.servers.get(address).map_or(0, ServerPool::size);
        if config.max_active.is_some_and(|max| server_size >= max) {
            return Capacity::Exhausted;
        }

        let Some(max_total) = config.max_total else {
            return Capacity::Available;
        };
        if state.total < max_total {
            return Capacity::Available;
        }

        let victim = state
            .servers
            .iter()
            .filter(|(a, s)| *a != address && !s.idle.is_empty())
            .min_by_key(|(_, s)| s.idle.front().map(|i| i.since))
            .map(|(a, _)| a.clone());

        if let Some(idle) = victim
            .as_ref()
            .and_then(|a| state.servers.get_mut(a))
            .and_then(|s| s.idle.pop_front())
        {
            state.total -= 1;
            debug!(
                "closing idle transport {} to {} to make room for {address}",
                idle.transport.id(),
                idle.transport.address()
            );
            return Capacity::Reclaimed(idle);
        }
        Capacity::Exhausted
    }

    fn checkout(
        &self,
        state: &mut PoolState,
        mut transport: Transport,
    ) -> HotRodResult<PooledTransport> {
        if state.closed {
            let address = transport.address().clone();
            Self::forget(state, &address);
            transport.close();
            return Err(HotRodError::PoolExhausted {
                address,
                reason: "pool is closed".to_string(),
            });
        }

        if let Some(handle) = transport.shutdown_handle() {
            state.in_use.insert(transport.id(), handle);
        }
        Ok(PooledTransport {
            pool: self.clone(),
            transport: Some(transport),
        })
    }

    /// Drops the accounting of one in-use transport that will not come back.
    fn forget(state: &mut PoolState, address: &ServerAddress) {
        if let Some(server) = state.servers.get_mut(address) {
            server.active = server.active.saturating_sub(1);
        }
        state.total = state.total.saturating_sub(1);
        Self::prune(state, address);
    }

    /// Removes the entry of a retired server once its last transport is back.
    fn prune(state: &mut PoolState, address: &ServerAddress) {
        if state
            .servers
            .get(address)
            .is_some_and(|s| s.retired && s.active == 0 && s.idle.is_empty())
        {
            state.servers.remove(address);
            debug!("dropped pool for {address}");
        }
    }

    fn release(&self, mut transport: Transport) {
        let config = &self.inner.config;
        if config.test_on_return && transport.is_valid() {
            self.inner.connector.validate(&mut transport);
        }

        let mut state = self.inner.state.lock();
        state.in_use.remove(&transport.id());
        let reusable = !state.closed && transport.is_valid();

        if let Some(server) = state.servers.get_mut(transport.address()) {
            server.active = server.active.saturating_sub(1);
            if reusable
                && !server.retired
                && config.max_idle.is_none_or(|max| server.idle.len() < max)
            {
                trace!("transport {} returned to the pool", transport.id());
                server.idle.push_back(IdleTransport {
                    transport,
                    since: Instant::now(),
                });
                self.inner.available.notify_all();
                return;
            }
        }

        state.total = state.total.saturating_sub(1);
        Self::prune(&mut state, transport.address());
        self.inner.available.notify_all();
        drop(state);
        transport.close();
    }

    /// Closes the idle transports of every server not in `addresses`. Transports of those
    /// servers that are checked out keep counting against the caps and are closed on return.
    pub fn retain(&self, addresses: &[ServerAddress]) {
        let mut removed = Vec::new();
        {
            let mut state = self.inner.state.lock();
            let state = &mut *state;
            let gone: Vec<ServerAddress> = state
                .servers
                .keys()
                .filter(|a| !addresses.contains(a))
                .cloned()
                .collect();
            for address in gone {
                if let Some(server) = state.servers.get_mut(&address) {
                    server.retired = true;
                    state.total -= server.idle.len();
                    removed.extend(server.idle.drain(..));
                }
                Self::prune(state, &address);
            }
            self.inner.available.notify_all();
        }
        drop(removed);
    }

    /// Closes every idle transport to `address`.
    pub fn clear(&self, address: &ServerAddress) {
        let idle: Vec<IdleTransport> = {
            let mut state = self.inner.state.lock();
            let Some(server) = state.servers.get_mut(address) else {
                return;
            };
            let idle: Vec<IdleTransport> = server.idle.drain(..).collect();
            state.total -= idle.len();
            self.inner.available.notify_all();
            idle
        };
        if !idle.is_empty() {
            debug!("closed {} idle transports to {address}", idle.len());
        }
    }

    /// One eviction pass over every server.
    pub fn evict(&self) {
        let config = &self.inner.config;
        let now = Instant::now();
        let mut evicted = Vec::new();
        let mut to_test = Vec::new();
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            let state = &mut *state;
            for server in state.servers.values_mut() {
                let mut examined = 0;
                while examined < config.num_tests_per_eviction_run
                    && server.idle.len() > config.min_idle
                {
                    let expired = match (server.idle.front(), config.min_evictable_idle_time) {
                        (Some(idle), Some(min)) => now.duration_since(idle.since) >= min,
                        _ => false,
                    };
                    if !expired {
                        break;
                    }
                    if let Some(idle) = server.idle.pop_front() {
                        evicted.push(idle);
                        state.total -= 1;
                    }
                    examined += 1;
                }

                if config.test_while_idle {
                    let remaining = config.num_tests_per_eviction_run.saturating_sub(examined);
                    for _ in 0..remaining.min(server.idle.len()) {
                        if let Some(idle) = server.idle.pop_front() {
                            server.active += 1;
                            to_test.push(idle);
                        }
                    }
                }
            }
            if !evicted.is_empty() {
                self.inner.available.notify_all();
            }
        }

        if !evicted.is_empty() {
            debug!("evicted {} idle transports", evicted.len());
        }
        drop(evicted);

        if to_test.is_empty() {
            return;
        }
        let tested: Vec<(IdleTransport, bool)> = to_test
            .into_iter()
            .map(|mut idle| {
                let healthy = self.inner.connector.validate(&mut idle.transport);
                (idle, healthy)
            })
            .collect();

        let mut dropped = Vec::new();
        {
            let mut state = self.inner.state.lock();
            let state = &mut *state;
            let closed = state.closed;
            // reversed, so that pushing each to the front restores the oldest-first order
            for (idle, healthy) in tested.into_iter().rev() {
                let address = idle.transport.address().clone();
                if let Some(server) = state.servers.get_mut(&address) {
                    server.active = server.active.saturating_sub(1);
                    if healthy && !closed && !server.retired {
                        server.idle.push_front(idle);
                        continue;
                    }
                }
                state.total = state.total.saturating_sub(1);
                Self::prune(state, &address);
                dropped.push(idle);
            }
            if !dropped.is_empty() {
                self.inner.available.notify_all();
            }
        }

        for idle in &dropped {
            debug!(
                "idle transport {} to {} dropped after validation",
                idle.transport.id(),
                idle.transport.address()
            );
        }
    }

    /// Closes every transport and stops the evictor. Checked-out transports have their sockets
    /// shut down and are closed when returned.
    pub fn close(&self) {
        if let Some(evictor) = self.inner.evictor.lock().take() {
            evictor.stop();
        }

        let idle: Vec<IdleTransport> = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;

            let mut idle = Vec::new();
            for server in state.servers.values_mut() {
                idle.extend(server.idle.drain(..));
            }
            state.total -= idle.len();
            for handle in state.in_use.values() {
                handle.shutdown();
            }
            self.inner.available.notify_all();
            idle
        };
        debug!("connection pool closed ({} idle transports)", idle.len());
    }

    pub fn idle_count(&self, address: &ServerAddress) -> usize {
        let state = self.inner.state.lock();
        state.servers.get(address).map_or(0, |s| s.idle.len())
    }

    pub fn active_count(&self, address: &ServerAddress) -> usize {
        let state = self.inner.state.lock();
        state.servers.get(address).map_or(0, |s| s.active)
    }

    /// Idle plus in-use transports across every server.
    pub fn total(&self) -> usize {
        self.inner.state.lock().total
    }
}

/// A checked-out transport. Dropping it returns the transport to its pool, or closes it when it
/// was invalidated.
pub struct PooledTransport {
    pool: ConnectionPool,
    transport: Option<Transport>,
}

impl PooledTransport {
    /// Returns the transport to the pool.
    pub fn release(self) {}
}

impl fmt::Debug for PooledTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledTransport").field(&self.transport).finish()
    }
}

impl Deref for PooledTransport {
    type Target = Transport;

    fn deref(&self) -> &Self::Target {
        self.transport
            .as_ref()
            .expect("transport is present until drop")
    }
}

impl DerefMut for PooledTransport {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.transport
            .as_mut()
            .expect("transport is present until drop")
    }
}

impl Drop for PooledTransport {
    fn drop(&mut self) {
        if let Some(transport) = self.transport.take() {
            self.pool.release(transport);
        }
    }
}
