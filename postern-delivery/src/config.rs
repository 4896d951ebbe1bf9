//! Outbound delivery configuration.
//!
//! ```ron
//! outbound: (
//!     queue_dir: "/var/spool/postern/queue",
//!     concurrency_max: 50,
//!     enable_tls: true,
//!     pool: ( max_per_domain: 4, idle_timeout_secs: 120 ),
//!     policy: (
//!         defaults: ( conn_limit: 10 ),
//!         domains: { "example.com": ( conn_limit: 2, tiny_limit: 30 ) },
//!     ),
//! )
//! ```

use std::{path::PathBuf, time::Duration};

use postern_smtp::ClientTimeouts;
use serde::Deserialize;

use crate::policy::PolicyConfig;

#[derive(Clone, Debug, Deserialize)]
pub struct OutboundConfig {
    /// Directory holding queue files.
    #[serde(default = "defaults::queue_dir")]
    pub queue_dir: PathBuf,

    /// Accept mail into the queue but never attempt delivery.
    #[serde(default)]
    pub disabled: bool,

    /// Upper bound on deliveries in flight at once.
    #[serde(default = "defaults::concurrency_max")]
    pub concurrency_max: usize,

    /// Temporary failures tolerated before a message is given up on.
    #[serde(default = "defaults::max_temp_failures")]
    pub max_temp_failures: u32,

    /// Port remote MTAs are contacted on.
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Upgrade with STARTTLS whenever the remote offers it.
    #[serde(default = "defaults::enable_tls")]
    pub enable_tls: bool,

    #[serde(default)]
    pub accept_invalid_certs: bool,

    /// Pass the original client address on with XCLIENT when offered.
    #[serde(default)]
    pub enable_xclient: bool,

    /// How long shutdown waits for deliveries in flight.
    #[serde(default = "defaults::shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    #[serde(default)]
    pub timeouts: ClientTimeouts,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub dns: DnsConfig,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            queue_dir: defaults::queue_dir(),
            disabled: false,
            concurrency_max: defaults::concurrency_max(),
            max_temp_failures: defaults::max_temp_failures(),
            port: defaults::port(),
            enable_tls: defaults::enable_tls(),
            accept_invalid_certs: false,
            enable_xclient: false,
            shutdown_timeout_secs: defaults::shutdown_timeout_secs(),
            timeouts: ClientTimeouts::default(),
            pool: PoolConfig::default(),
            policy: PolicyConfig::default(),
            dns: DnsConfig::default(),
        }
    }
}

impl OutboundConfig {
    #[must_use]
    pub fn in_directory(queue_dir: impl Into<PathBuf>) -> Self {
        Self {
            queue_dir: queue_dir.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Reuse of connections to remote MTAs.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct PoolConfig {
    /// Connections open at once to one recipient domain, over all its hosts.
    #[serde(default = "defaults::max_per_domain")]
    pub max_per_domain: usize,

    /// Idle connections older than this are closed instead of reused.
    #[serde(default = "defaults::idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_domain: defaults::max_per_domain(),
            idle_timeout_secs: defaults::idle_timeout_secs(),
        }
    }
}

impl PoolConfig {
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct DnsConfig {
    #[serde(default = "defaults::dns_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: defaults::dns_timeout_secs(),
        }
    }
}

mod defaults {
    use std::path::PathBuf;

    pub fn queue_dir() -> PathBuf {
        PathBuf::from("queue")
    }

    pub const fn concurrency_max() -> usize {
        100
    }

    pub const fn max_temp_failures() -> u32 {
        6
    }

    pub const fn port() -> u16 {
        25
    }

    pub const fn enable_tls() -> bool {
        true
    }

    pub const fn shutdown_timeout_secs() -> u64 {
        30
    }

    pub const fn max_per_domain() -> usize {
        10
    }

    pub const fn idle_timeout_secs() -> u64 {
        300
    }

    pub const fn dns_timeout_secs() -> u64 {
        5
    }
}
