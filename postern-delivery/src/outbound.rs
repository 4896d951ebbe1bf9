use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use postern_plugins::{Dispatcher, Notes};

use crate::{
    config::OutboundConfig,
    dns::{DnsResolver, Resolve},
    error::DnsError,
    policy::DeliveryPolicy,
    pool::ClientPool,
    queue::OutboundQueue,
};

/// Everything shared by the scheduler, delivery attempts and the inbound
/// hand-off.
pub struct Outbound {
    pub(crate) config: OutboundConfig,
    pub(crate) me: Arc<str>,
    pub(crate) queue: Arc<OutboundQueue>,
    pub(crate) policy: DeliveryPolicy,
    pub(crate) pool: ClientPool,
    pub(crate) resolver: Arc<dyn Resolve>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) notes: Notes,
    pub(crate) stopping: AtomicBool,
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbound")
            .field("me", &self.me)
            .field("queue_dir", &self.config.queue_dir)
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl Outbound {
    #[must_use]
    pub fn builder(config: OutboundConfig) -> OutboundBuilder {
        OutboundBuilder {
            config,
            me: None,
            resolver: None,
            dispatcher: Dispatcher::default(),
            notes: Notes::default(),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &OutboundConfig {
        &self.config
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<OutboundQueue> {
        &self.queue
    }

    #[must_use]
    pub const fn policy(&self) -> &DeliveryPolicy {
        &self.policy
    }

    #[must_use]
    pub const fn pool(&self) -> &ClientPool {
        &self.pool
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Relaxed)
    }
}

pub struct OutboundBuilder {
    config: OutboundConfig,
    me: Option<Arc<str>>,
    resolver: Option<Arc<dyn Resolve>>,
    dispatcher: Dispatcher,
    notes: Notes,
}

impl OutboundBuilder {
    /// Name used in EHLO and in queue file names.
    #[must_use]
    pub fn with_me(mut self, me: impl Into<Arc<str>>) -> Self {
        self.me = Some(me.into());
        self
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolve>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    #[must_use]
    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Share the note table with inbound sessions.
    #[must_use]
    pub fn with_notes(mut self, notes: Notes) -> Self {
        self.notes = notes;
        self
    }

    /// Uses the system resolver unless one was given.
    pub fn build(self) -> Result<Arc<Outbound>, DnsError> {
        let resolver = match self.resolver {
            Some(resolver) => resolver,
            None => Arc::new(DnsResolver::new(&self.config.dns)?),
        };
        let me = self.me.unwrap_or_else(|| {
            std::env::var("HOSTNAME")
                .unwrap_or_else(|_| "localhost".to_string())
                .into()
        });

        Ok(Arc::new(Outbound {
            queue: Arc::new(OutboundQueue::new(&self.config.queue_dir)),
            policy: DeliveryPolicy::new(self.config.policy.clone()),
            pool: ClientPool::new(self.config.pool.clone()),
            config: self.config,
            me,
            resolver,
            dispatcher: self.dispatcher,
            notes: self.notes,
            stopping: AtomicBool::new(false),
        }))
    }
}
