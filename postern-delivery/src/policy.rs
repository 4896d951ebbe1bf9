//! Per-domain delivery limits.
//!
//! Each recipient domain gets a concurrent connection limit and four rate
//! counters: `micro`, `tiny`, `medium` and `big`. Every counter has its own
//! quota and window length, by default one second, one minute, one hour and
//! one day. A quota of zero means unlimited. A delivery that would break a
//! limit is deferred, not failed.

use std::{sync::Arc, time::Duration};

use ahash::AHashMap;
use dashmap::DashMap;
use postern_common::Domain;
use serde::Deserialize;
use tokio::time::Instant;

const COUNTERS: [&str; 4] = ["micro", "tiny", "medium", "big"];

/// Retry delay when a domain has no free connection slot.
const CONNECTION_RETRY: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Limits {
    #[serde(default)]
    pub conn_limit: u32,

    #[serde(default)]
    pub micro_limit: u32,
    #[serde(default = "defaults::micro_window_secs")]
    pub micro_window_secs: u64,

    #[serde(default)]
    pub tiny_limit: u32,
    #[serde(default = "defaults::tiny_window_secs")]
    pub tiny_window_secs: u64,

    #[serde(default)]
    pub medium_limit: u32,
    #[serde(default = "defaults::medium_window_secs")]
    pub medium_window_secs: u64,

    #[serde(default)]
    pub big_limit: u32,
    #[serde(default = "defaults::big_window_secs")]
    pub big_window_secs: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            conn_limit: 0,
            micro_limit: 0,
            micro_window_secs: defaults::micro_window_secs(),
            tiny_limit: 0,
            tiny_window_secs: defaults::tiny_window_secs(),
            medium_limit: 0,
            medium_window_secs: defaults::medium_window_secs(),
            big_limit: 0,
            big_window_secs: defaults::big_window_secs(),
        }
    }
}

impl Limits {
    /// Quota and window of each counter, in `COUNTERS` order.
    const fn rates(&self) -> [(u32, Duration); 4] {
        [
            (self.micro_limit, Duration::from_secs(self.micro_window_secs)),
            (self.tiny_limit, Duration::from_secs(self.tiny_window_secs)),
            (self.medium_limit, Duration::from_secs(self.medium_window_secs)),
            (self.big_limit, Duration::from_secs(self.big_window_secs)),
        ]
    }
}

mod defaults {
    pub const fn micro_window_secs() -> u64 {
        1
    }

    pub const fn tiny_window_secs() -> u64 {
        60
    }

    pub const fn medium_window_secs() -> u64 {
        3600
    }

    pub const fn big_window_secs() -> u64 {
        86_400
    }
}

/// ```ron
/// policy: (
///     defaults: ( conn_limit: 10, tiny_limit: 600 ),
///     domains: {
///         "example.com": ( conn_limit: 2, medium_limit: 50, medium_window_secs: 900 ),
///     },
/// )
/// ```
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub defaults: Limits,
    /// Overrides by recipient domain.
    #[serde(default)]
    pub domains: AHashMap<String, Limits>,
}

impl PolicyConfig {
    #[must_use]
    pub fn limits_for(&self, domain: &Domain) -> &Limits {
        self.domains
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(domain))
            .map_or(&self.defaults, |(_, limits)| limits)
    }
}

/// Why a delivery has to wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Throttle {
    Connections { limit: u32 },
    Rate {
        counter: &'static str,
        limit: u32,
        window: Duration,
        retry_after: Duration,
    },
}

impl Throttle {
    #[must_use]
    pub const fn retry_after(&self) -> Duration {
        match self {
            Self::Connections { .. } => CONNECTION_RETRY,
            Self::Rate { retry_after, .. } => *retry_after,
        }
    }
}

impl std::fmt::Display for Throttle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connections { limit } => write!(f, "{limit} connections already open"),
            Self::Rate {
                counter,
                limit,
                window,
                ..
            } => write!(
                f,
                "{counter} limit of {limit} deliveries per {}s reached",
                window.as_secs()
            ),
        }
    }
}

#[derive(Debug)]
struct Counter {
    count: u32,
    started: Instant,
}

#[derive(Debug)]
struct DomainState {
    limits: Limits,
    active: u32,
    windows: [Counter; 4],
}

impl DomainState {
    fn new(limits: Limits) -> Self {
        let now = Instant::now();
        Self {
            limits,
            active: 0,
            windows: std::array::from_fn(|_| Counter {
                count: 0,
                started: now,
            }),
        }
    }

    fn admit(&mut self, now: Instant) -> Result<(), Throttle> {
        let conn_limit = self.limits.conn_limit;
        if conn_limit > 0 && self.active >= conn_limit {
            return Err(Throttle::Connections { limit: conn_limit });
        }

        let rates = self.limits.rates();
        for ((counter, (limit, window)), name) in self.windows.iter_mut().zip(rates).zip(COUNTERS) {
            if limit == 0 {
                continue;
            }

            let elapsed = now.duration_since(counter.started);
            if elapsed >= window {
                counter.count = 0;
                counter.started = now;
            } else if counter.count >= limit {
                return Err(Throttle::Rate {
                    counter: name,
                    limit,
                    window,
                    retry_after: window - elapsed,
                });
            }
        }

        for counter in &mut self.windows {
            counter.count += 1;
        }
        self.active += 1;
        Ok(())
    }
}

/// Limit state for every domain seen so far, created on first use.
#[derive(Debug, Default)]
pub struct DeliveryPolicy {
    config: PolicyConfig,
    domains: Arc<DashMap<Domain, DomainState>>,
}

impl DeliveryPolicy {
    #[must_use]
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            config,
            domains: Arc::default(),
        }
    }

    /// Take a connection slot for `domain` and count one delivery.
    ///
    /// The slot is released when the guard drops.
    pub fn acquire(&self, domain: &Domain) -> Result<PolicyGuard, Throttle> {
        self.domains
            .entry(domain.clone())
            .or_insert_with(|| DomainState::new(self.config.limits_for(domain).clone()))
            .admit(Instant::now())?;

        Ok(PolicyGuard {
            domains: Arc::clone(&self.domains),
            domain: domain.clone(),
        })
    }

    /// Connections currently held for `domain`.
    #[must_use]
    pub fn active(&self, domain: &Domain) -> u32 {
        self.domains.get(domain).map_or(0, |state| state.active)
    }
}

#[derive(Debug)]
pub struct PolicyGuard {
    domains: Arc<DashMap<Domain, DomainState>>,
    domain: Domain,
}

impl Drop for PolicyGuard {
    fn drop(&mut self) {
        if let Some(mut state) = self.domains.get_mut(&self.domain) {
            state.active = state.active.saturating_sub(1);
        }
    }
}
