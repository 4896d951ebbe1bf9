//! Outbound delivery.
//!
//! Accepted relay mail is written to the queue directory, one file per
//! recipient domain, by the [`QueueHandoff`](postern_smtp::QueueHandoff)
//! implementation on [`Outbound`]. [`Outbound::run`] then schedules queue
//! files round-robin across domains, and each [`HMailItem`] resolves mail
//! exchangers and speaks SMTP to them through a [`ClientPool`], subject to
//! per-domain [`DeliveryPolicy`] limits.

pub mod config;
pub mod dns;
pub mod error;
mod handoff;
pub mod hmail;
pub mod outbound;
pub mod policy;
pub mod pool;
pub mod queue;
mod scheduler;

pub use config::{DnsConfig, OutboundConfig, PoolConfig};
pub use dns::{DnsResolver, MxRecord, Resolve, StaticResolver};
pub use error::{DeliveryError, DnsError, PoolError};
pub use hmail::{HMailItem, MailState};
pub use outbound::{Outbound, OutboundBuilder};
pub use policy::{DeliveryPolicy, Limits, PolicyConfig, Throttle};
pub use pool::{ClientPool, PoolKey, PooledClient};
pub use queue::{OutboundQueue, RoundRobin};
