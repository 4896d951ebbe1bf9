use std::{
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use postern_common::{Code, Signal, internal, tracing};
use postern_plugins::{Hook, HookArgs, HookState, Subject};
use postern_spool::QueueFile;
use tokio::{
    sync::broadcast,
    task::JoinSet,
    time::{Instant, sleep},
};

use crate::{
    hmail::{HMailItem, MailState, preview},
    outbound::Outbound,
    queue::RoundRobin,
};

/// Wait between passes while work is backing up.
const BUSY_WAIT: Duration = Duration::from_secs(1);
/// Wait between passes otherwise.
const IDLE_WAIT: Duration = Duration::from_secs(3);
/// How often the queue directory is rescanned for files written by other processes.
const RESCAN_INTERVAL: Duration = Duration::from_secs(60);

impl Outbound {
    /// Deliver queued mail until a shutdown signal arrives.
    ///
    /// Loads the queue directory first, then runs a pass roughly every one to
    /// three seconds, or as soon as a file is queued. On shutdown no new work
    /// is started; deliveries in flight get `shutdown_timeout` to finish and
    /// their files stay on disk if they do not.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.config.queue_dir).await?;
        self.queue.load().await?;

        let mut in_flight = JoinSet::new();
        let mut cursor = RoundRobin::default();
        let mut rescan_at = Instant::now() + RESCAN_INTERVAL;

        loop {
            while let Some(done) = in_flight.try_join_next() {
                if let Err(err) = done {
                    internal!(level = ERROR, "Delivery task failed: {err}");
                }
            }

            if Instant::now() >= rescan_at {
                if let Err(err) = self.queue.load().await {
                    internal!(level = ERROR, "Unable to rescan {}: {err}", self.config.queue_dir.display());
                }
                rescan_at = Instant::now() + RESCAN_INTERVAL;
            }

            let wait = self.tick(&mut in_flight, &mut cursor).await;

            tokio::select! {
                biased;
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!(level = INFO, "Outbound delivery received shutdown signal");
                        }
                        Err(err) => {
                            internal!(level = ERROR, "Outbound shutdown channel error: {err}");
                        }
                    }
                    break;
                }
                () = self.queue.ready() => {}
                () = sleep(wait) => {}
            }
        }

        self.drain(in_flight).await;
        Ok(())
    }

    /// One scheduling pass; returns how long to wait before the next.
    #[tracing::instrument(level = "trace", skip_all, fields(queued = self.queue.len()))]
    async fn tick(self: &Arc<Self>, in_flight: &mut JoinSet<()>, cursor: &mut RoundRobin) -> Duration {
        let max = self.config.concurrency_max;
        if self.config.disabled || in_flight.len() >= max {
            return BUSY_WAIT;
        }

        self.pool.reap().await;

        let mut held = Vec::new();
        while in_flight.len() < max {
            let Some(file) = self.queue.shift(cursor) else {
                break;
            };

            if self.allowed(&file).await {
                let outbound = Arc::clone(self);
                in_flight.spawn(async move { outbound.work(file).await });
            } else {
                held.push(file);
            }
        }
        for file in held.into_iter().rev() {
            self.queue.restore(file);
        }

        if self.queue.len() > max {
            BUSY_WAIT
        } else {
            IDLE_WAIT
        }
    }

    /// Ask the `limit` hook whether `file` may go out now.
    async fn allowed(&self, file: &QueueFile) -> bool {
        let args = HookArgs::new(Subject::MailItem(Box::new(preview(&file.name))), self.notes.clone());
        let mut state = HookState::default();

        match self.dispatcher.run(Hook::Limit, &mut state, args).await {
            Ok(outcome) if outcome.code == Code::Delay || outcome.code.is_deny() => {
                internal!(
                    level = DEBUG,
                    "Limit hook held {} ({})",
                    file.name,
                    outcome.code
                );
                false
            }
            Ok(_) => true,
            Err(err) => {
                internal!(level = ERROR, "Limit hook for {}: {err}", file.name);
                true
            }
        }
    }

    /// Send `file`, then keep the connection warm with the same domain's backlog.
    async fn work(self: Arc<Self>, file: QueueFile) {
        let domain = file.name.domain.clone();
        let mut next = Some(file);

        while let Some(file) = next.take() {
            let state = HMailItem::new(Arc::clone(&self), file).send().await;
            if matches!(state, MailState::Delivered | MailState::Bounced) && !self.is_stopping() {
                next = self.queue.dequeue(&domain);
            }
        }
    }

    async fn drain(&self, mut in_flight: JoinSet<()>) {
        self.stopping.store(true, Ordering::Relaxed);

        if !in_flight.is_empty() {
            internal!(
                level = INFO,
                "Waiting up to {}s for {} deliveries in flight",
                self.config.shutdown_timeout_secs,
                in_flight.len()
            );
        }

        let waited = tokio::time::timeout(self.config.shutdown_timeout(), async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;

        if waited.is_err() {
            internal!(
                level = WARN,
                "Shutdown timeout exceeded, {} deliveries will be retried on restart",
                in_flight.len()
            );
            in_flight.abort_all();
            while in_flight.join_next().await.is_some() {}
        }

        self.queue.cancel_timers();
        self.pool.close_all().await;
        internal!(level = INFO, "Outbound delivery shutdown complete");
    }
}
