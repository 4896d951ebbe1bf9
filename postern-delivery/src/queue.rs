//! The in-memory view of the queue directory.
//!
//! Files due now wait in per-domain lists; files due later sit on a timer
//! and join their list when it fires. Every file this process knows about is
//! tracked by identity (pid, counter, host and domain, which survive a retry
//! rename), so rescanning the directory never queues a file twice.

use std::{
    collections::{BTreeMap, VecDeque},
    ops::Bound,
    path::{Path, PathBuf},
    sync::{Arc, Weak},
    time::Duration,
};

use ahash::AHashSet;
use parking_lot::Mutex;
use postern_common::{Domain, internal, tracing};
use postern_spool::{QueueFile, QueueFileName};
use tokio::{sync::Notify, task::JoinSet};

fn identity(name: &QueueFileName) -> String {
    format!("{}_{}.{}@{}", name.pid, name.uniq, name.host, name.domain)
}

/// Position of a round-robin walk over the domains.
#[derive(Debug, Default)]
pub struct RoundRobin {
    last: Option<Domain>,
}

#[derive(Debug, Default)]
struct State {
    domains: BTreeMap<Domain, VecDeque<QueueFile>>,
    queued: usize,
    tracked: AHashSet<String>,
}

#[derive(Debug)]
pub struct OutboundQueue {
    directory: PathBuf,
    state: Mutex<State>,
    timers: Mutex<JoinSet<()>>,
    ready: Notify,
}

impl OutboundQueue {
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            state: Mutex::default(),
            timers: Mutex::new(JoinSet::new()),
            ready: Notify::new(),
        }
    }

    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Track `file` and append it to its domain's list.
    pub fn push(&self, file: QueueFile) {
        {
            let mut state = self.state.lock();
            state.tracked.insert(identity(&file.name));
            state.queued += 1;
            state
                .domains
                .entry(file.name.domain.clone())
                .or_default()
                .push_back(file);
        }
        self.ready.notify_one();
    }

    /// Put back a file taken by [`shift`](Self::shift) but not started, at
    /// the head of its domain's list and without waking the scheduler.
    pub fn restore(&self, file: QueueFile) {
        let mut state = self.state.lock();
        state.queued += 1;
        state
            .domains
            .entry(file.name.domain.clone())
            .or_default()
            .push_front(file);
    }

    /// Resolves once a file has been pushed since the last call.
    pub async fn ready(&self) {
        self.ready.notified().await;
    }

    /// Next file for `domain`, if one is waiting.
    pub fn dequeue(&self, domain: &Domain) -> Option<QueueFile> {
        let mut state = self.state.lock();
        let list = state.domains.get_mut(domain)?;
        let file = list.pop_front();
        if list.is_empty() {
            state.domains.remove(domain);
        }
        if file.is_some() {
            state.queued -= 1;
        }
        file
    }

    /// Take the next file round-robin across domains.
    ///
    /// `cursor` remembers the domain served last so that one busy domain
    /// cannot starve the rest.
    pub fn shift(&self, cursor: &mut RoundRobin) -> Option<QueueFile> {
        let mut state = self.state.lock();
        let domain = cursor
            .last
            .as_ref()
            .and_then(|last| {
                state
                    .domains
                    .range((Bound::Excluded(last), Bound::Unbounded))
                    .next()
            })
            .or_else(|| state.domains.iter().next())
            .map(|(domain, _)| domain.clone())?;

        let list = state.domains.get_mut(&domain)?;
        let file = list.pop_front();
        if list.is_empty() {
            state.domains.remove(&domain);
        }
        if file.is_some() {
            state.queued -= 1;
        }

        cursor.last = Some(domain);
        file
    }

    /// Files waiting to be delivered now.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().queued
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Files waiting on a retry timer.
    #[must_use]
    pub fn deferred(&self) -> usize {
        self.timers.lock().len()
    }

    #[must_use]
    pub fn is_tracked(&self, name: &QueueFileName) -> bool {
        self.state.lock().tracked.contains(&identity(name))
    }

    /// Forget a file that has left the queue for good.
    pub fn untrack(&self, name: &QueueFileName) {
        self.state.lock().tracked.remove(&identity(name));
    }

    /// Track `file` now and queue it once `delay` has passed.
    pub fn defer(self: &Arc<Self>, file: QueueFile, delay: Duration) {
        self.state.lock().tracked.insert(identity(&file.name));

        let queue: Weak<Self> = Arc::downgrade(self);
        let mut timers = self.timers.lock();
        while timers.try_join_next().is_some() {}

        timers.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(queue) = queue.upgrade() {
                queue.push(file);
            }
        });
    }

    /// Drop pending retry timers; their files stay on disk for the next start.
    pub fn cancel_timers(&self) {
        self.timers.lock().abort_all();
    }

    /// Scan the directory and queue every file this process does not know.
    ///
    /// Temporary files and names that do not parse are skipped. Files due in
    /// the future are held on a timer. Returns the number of files found.
    #[tracing::instrument(level = "trace", skip(self), fields(directory = %self.directory.display()))]
    pub async fn load(self: &Arc<Self>) -> std::io::Result<usize> {
        let mut entries = tokio::fs::read_dir(&self.directory).await?;
        let mut loaded = 0;

        while let Some(entry) = entries.next_entry().await? {
            let Ok(file_name) = entry.file_name().into_string() else {
                continue;
            };
            if QueueFileName::is_temporary(&file_name) {
                continue;
            }

            let name = match file_name.parse::<QueueFileName>() {
                Ok(name) => name,
                Err(err) => {
                    internal!(level = WARN, "Skipping {file_name}: {err}");
                    continue;
                }
            };
            if self.is_tracked(&name) {
                continue;
            }

            let delay = name.remaining();
            let file = QueueFile::new(&self.directory, name);
            match delay {
                Some(delay) => self.defer(file, delay),
                None => self.push(file),
            }
            loaded += 1;
        }

        internal!(level = INFO, "Loaded {loaded} queue files from {}", self.directory.display());
        Ok(loaded)
    }
}
