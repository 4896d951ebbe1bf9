//! Reusable connections to remote MTAs.
//!
//! Connections are pooled per recipient domain and remote address, and at
//! most `max_per_domain` connections, active or idle, are open to one
//! domain across all of its addresses. A client is `active` while checked
//! out and `idle` once released. Release sends `RSET` and only pools the
//! client if the server answers `250`; anything else, including a client
//! abandoned mid-DATA, is destroyed. Idle clients that have aged out or
//! died are destroyed the next time their key is used.

use std::{
    fmt::{self, Display},
    future::Future,
    net::SocketAddr,
    sync::Arc,
};

use ahash::AHashMap;
use parking_lot::Mutex;
use postern_common::{Domain, internal};
use postern_smtp::client::{ClientError, SmtpClient};
use tokio::time::Instant;

use crate::{config::PoolConfig, error::PoolError};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub domain: Domain,
    pub host: String,
    pub address: SocketAddr,
}

impl Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} [{}]", self.domain, self.host, self.address)
    }
}

struct Idle {
    client: SmtpClient,
    since: Instant,
}

#[derive(Default)]
struct Slots {
    idle: Vec<Idle>,
    active: usize,
}

impl Slots {
    /// Move idle clients that are too old or dead into `stale`.
    fn prune(&mut self, max_idle: std::time::Duration, stale: &mut Vec<SmtpClient>) -> usize {
        let before = stale.len();
        for mut idle in std::mem::take(&mut self.idle) {
            if idle.since.elapsed() >= max_idle || idle.client.is_dead() {
                stale.push(idle.client);
            } else {
                self.idle.push(idle);
            }
        }
        stale.len() - before
    }

    const fn is_unused(&self) -> bool {
        self.active == 0 && self.idle.is_empty()
    }
}

#[derive(Default)]
struct State {
    slots: AHashMap<PoolKey, Slots>,
    /// Open connections by recipient domain, active and idle alike.
    open: AHashMap<Domain, usize>,
}

impl State {
    fn open(&self, domain: &Domain) -> usize {
        self.open.get(domain).copied().unwrap_or_default()
    }

    fn opened(&mut self, domain: &Domain) {
        *self.open.entry(domain.clone()).or_default() += 1;
    }

    fn closed(&mut self, domain: &Domain, count: usize) {
        if count == 0 {
            return;
        }
        if let Some(open) = self.open.get_mut(domain) {
            *open = open.saturating_sub(count);
            if *open == 0 {
                self.open.remove(domain);
            }
        }
    }

    fn prune(&mut self, key: &PoolKey, max_idle: std::time::Duration, stale: &mut Vec<SmtpClient>) {
        let pruned = self
            .slots
            .get_mut(key)
            .map_or(0, |slot| slot.prune(max_idle, stale));
        self.closed(&key.domain, pruned);
    }

    /// Give up one idle client pooled for another address of `key`'s domain.
    fn evict(&mut self, key: &PoolKey, stale: &mut Vec<SmtpClient>) -> bool {
        let Some(idle) = self
            .slots
            .iter_mut()
            .filter(|(other, _)| other.domain == key.domain && *other != key)
            .find_map(|(_, slot)| slot.idle.pop())
        else {
            return false;
        };

        stale.push(idle.client);
        self.closed(&key.domain, 1);
        true
    }

    /// A checked out client came back, to the idle list when `client` is
    /// given, otherwise closed.
    fn settle(&mut self, key: &PoolKey, client: Option<SmtpClient>) {
        let returned = client.is_some();
        if let Some(slot) = self.slots.get_mut(key) {
            slot.active = slot.active.saturating_sub(1);
            if let Some(client) = client {
                slot.idle.push(Idle {
                    client,
                    since: Instant::now(),
                });
            } else if slot.is_unused() {
                self.slots.remove(key);
            }
        }

        if !returned {
            self.closed(&key.domain, 1);
        }
    }
}

/// Holds a checked out slot. Unless settled, the slot is freed and its
/// connection counted as closed when this drops.
struct Lease {
    key: PoolKey,
    state: Arc<Mutex<State>>,
    settled: bool,
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.settled {
            self.state.lock().settle(&self.key, None);
        }
    }
}

/// A client checked out of the pool.
///
/// Hand it back with [`ClientPool::release`] or [`ClientPool::destroy`].
/// Dropping it closes the socket and frees its slot.
pub struct PooledClient {
    lease: Lease,
    client: SmtpClient,
    reused: bool,
}

impl PooledClient {
    #[must_use]
    pub const fn key(&self) -> &PoolKey {
        &self.lease.key
    }

    /// Whether this connection carried an earlier delivery.
    #[must_use]
    pub const fn is_reused(&self) -> bool {
        self.reused
    }

    pub const fn client(&mut self) -> &mut SmtpClient {
        &mut self.client
    }
}

enum Checkout {
    Idle(Lease, SmtpClient),
    Connect(Lease),
    Saturated,
}

pub struct ClientPool {
    config: PoolConfig,
    state: Arc<Mutex<State>>,
}

impl fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientPool")
            .field("config", &self.config)
            .field("keys", &self.state.lock().slots.len())
            .finish()
    }
}

impl ClientPool {
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            state: Arc::default(),
        }
    }

    /// Check out an idle client for `key`, or open one with `connect` if the
    /// domain is under its limit.
    ///
    /// An idle client of another address of the same domain is closed to
    /// make room. A saturated domain is reported immediately so the caller
    /// can requeue.
    pub async fn acquire<F, Fut>(&self, key: &PoolKey, connect: F) -> Result<PooledClient, PoolError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SmtpClient, ClientError>>,
    {
        let mut stale = Vec::new();
        let checkout = {
            let mut state = self.state.lock();
            state.prune(key, self.config.idle_timeout(), &mut stale);

            let slot = state.slots.entry(key.clone()).or_default();
            if let Some(idle) = slot.idle.pop() {
                slot.active += 1;
                Checkout::Idle(self.lease(key), idle.client)
            } else if state.open(&key.domain) < self.config.max_per_domain
                || state.evict(key, &mut stale)
            {
                state.slots.entry(key.clone()).or_default().active += 1;
                state.opened(&key.domain);
                Checkout::Connect(self.lease(key))
            } else {
                if state.slots.get(key).is_some_and(Slots::is_unused) {
                    state.slots.remove(key);
                }
                Checkout::Saturated
            }
        };
        close(stale).await;

        match checkout {
            Checkout::Idle(lease, client) => Ok(PooledClient {
                lease,
                client,
                reused: true,
            }),
            Checkout::Saturated => Err(PoolError::Saturated(key.domain.to_string())),
            Checkout::Connect(lease) => {
                let client = connect().await?;
                Ok(PooledClient {
                    lease,
                    client,
                    reused: false,
                })
            }
        }
    }

    fn lease(&self, key: &PoolKey) -> Lease {
        Lease {
            key: key.clone(),
            state: Arc::clone(&self.state),
            settled: false,
        }
    }

    /// Reset the session and keep the client for the next delivery.
    pub async fn release(&self, mut pooled: PooledClient) {
        let reset = pooled.client.rset().await;
        if !matches!(reset, Ok(ref response) if response.code == 250) {
            internal!(
                level = DEBUG,
                "Connection to {} did not accept RSET, closing",
                pooled.key()
            );
            self.destroy(pooled).await;
            return;
        }

        let PooledClient {
            mut lease, client, ..
        } = pooled;
        self.state.lock().settle(&lease.key, Some(client));
        lease.settled = true;
    }

    /// Close the connection without reusing it.
    pub async fn destroy(&self, mut pooled: PooledClient) {
        pooled.client.shutdown().await;
    }

    /// Close idle clients that have aged out or died, across all keys.
    pub async fn reap(&self) {
        let mut stale = Vec::new();
        {
            let mut state = self.state.lock();
            let keys: Vec<_> = state.slots.keys().cloned().collect();
            for key in &keys {
                state.prune(key, self.config.idle_timeout(), &mut stale);
            }
            state.slots.retain(|_, slot| !slot.is_unused());
        }
        close(stale).await;
    }

    /// QUIT and close every idle client.
    pub async fn close_all(&self) {
        let idle: Vec<_> = {
            let mut state = self.state.lock();
            let mut idle = Vec::new();
            let mut closed: AHashMap<Domain, usize> = AHashMap::new();
            for (key, slot) in &mut state.slots {
                *closed.entry(key.domain.clone()).or_default() += slot.idle.len();
                idle.extend(slot.idle.drain(..).map(|idle| idle.client));
            }
            for (domain, count) in closed {
                state.closed(&domain, count);
            }
            state.slots.retain(|_, slot| !slot.is_unused());
            idle
        };

        for mut client in idle {
            let _ = client.quit().await;
            client.shutdown().await;
        }
    }

    /// `(active, idle)` counts for `key`.
    #[must_use]
    pub fn stats(&self, key: &PoolKey) -> (usize, usize) {
        self.state
            .lock()
            .slots
            .get(key)
            .map_or((0, 0), |slot| (slot.active, slot.idle.len()))
    }

    /// Connections open to `domain`, checked out or idle.
    #[must_use]
    pub fn open(&self, domain: &Domain) -> usize {
        self.state.lock().open(domain)
    }
}

async fn close(clients: Vec<SmtpClient>) {
    for mut client in clients {
        internal!(level = DEBUG, "Closing stale connection to {}", client.peer());
        client.shutdown().await;
    }
}
