use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use postern_common::{Signal, internal};
use postern_delivery::{Outbound, Resolve};
use postern_plugins::{Dispatcher, HookRegistry, Notes, PluginConfig, modules};
use postern_smtp::{Listener, QueueHandoff, SessionConfig};
use tokio::{sync::broadcast, task::JoinSet};

use crate::config::Config;

/// Build the hook registry from the plugins named in the configuration.
pub fn registry(config: &PluginConfig) -> anyhow::Result<HookRegistry> {
    let mut builder = HookRegistry::builder().with_config(config);
    for name in &config.enabled {
        builder = builder.register(modules::load(name)?);
    }
    Ok(builder.build())
}

/// The whole process: listeners and outbound delivery sharing one plugin
/// registry, note table and shutdown broadcast.
pub struct Postern {
    config: Config,
    resolver: Option<Arc<dyn Resolve>>,
    shutdown: broadcast::Sender<Signal>,
}

/// A started [`Postern`].
pub struct Running {
    addresses: Vec<SocketAddr>,
    shutdown: broadcast::Sender<Signal>,
    tasks: JoinSet<anyhow::Result<()>>,
}

impl Postern {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let (shutdown, _) = broadcast::channel(64);
        Self {
            config,
            resolver: None,
            shutdown,
        }
    }

    /// Route outbound mail with `resolver` instead of the system DNS.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolve>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Bind every listener and start outbound delivery.
    ///
    /// Configuration problems (unknown plugins, unreadable TLS material,
    /// sockets that cannot be bound) fail here, before any mail is accepted.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn start(self) -> anyhow::Result<Running> {
        let config = self.config;
        let me = config.me();

        config.spool.init()?;
        let dispatcher = Dispatcher::new(Arc::new(registry(&config.plugins)?));
        let notes = Notes::new();

        let mut outbound = Outbound::builder(config.outbound.clone())
            .with_me(Arc::clone(&me))
            .with_dispatcher(dispatcher.clone())
            .with_notes(notes.clone());
        if let Some(resolver) = self.resolver {
            outbound = outbound.with_resolver(resolver);
        }
        let outbound = outbound.build()?;
        let handoff: Arc<dyn QueueHandoff> = Arc::clone(&outbound) as _;

        let mut bound = Vec::with_capacity(config.listeners.len());
        for listener_config in &config.listeners {
            let session = SessionConfig::builder()
                .with_me(Arc::clone(&me))
                .with_smtp(config.smtp.clone())
                .with_spool(config.spool.clone())
                .with_dispatcher(dispatcher.clone())
                .with_notes(notes.clone())
                .with_handoff(Arc::clone(&handoff))
                .build();
            let listener = Listener::new(listener_config.clone(), session);

            listener
                .validate()
                .with_context(|| format!("TLS configuration for {}", listener.socket()))?;
            let socket = listener.bind().await?;
            bound.push((listener, socket));
        }

        let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();
        let mut addresses = Vec::with_capacity(bound.len());

        for (listener, socket) in bound {
            addresses.push(socket.local_addr()?);
            let signal = self.shutdown.subscribe();
            tasks.spawn(async move {
                listener
                    .serve_on(socket, signal)
                    .await
                    .map_err(anyhow::Error::from)
            });
        }

        let signal = self.shutdown.subscribe();
        tasks.spawn(async move { outbound.run(signal).await.map_err(anyhow::Error::from) });

        internal!(level = INFO, "Postern running as {me}");
        Ok(Running {
            addresses,
            shutdown: self.shutdown,
            tasks,
        })
    }

    /// Run until SIGINT or SIGTERM, then shut down gracefully.
    pub async fn run(self) -> anyhow::Result<()> {
        let mut running = self.start().await?;

        tokio::select! {
            result = wait_for_signal() => result?,
            result = running.next_exit() => {
                internal!(level = ERROR, "A service stopped unexpectedly");
                result?;
            }
        }

        running.stop().await
    }
}

impl Running {
    /// Local addresses of the listeners, in configuration order.
    #[must_use]
    pub fn addresses(&self) -> &[SocketAddr] {
        &self.addresses
    }

    /// Broadcast shutdown and wait for every service to finish.
    pub async fn stop(mut self) -> anyhow::Result<()> {
        internal!(level = INFO, "Shutting down ...");
        // Fails only when every service has already stopped.
        let _ = self.shutdown.send(Signal::Shutdown);

        let mut result = Ok(());
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(err) = joined.map_err(anyhow::Error::from).and_then(|r| r) {
                internal!(level = ERROR, "{err:#}");
                result = Err(err);
            }
        }

        internal!(level = INFO, "Shutdown complete");
        result
    }

    async fn next_exit(&mut self) -> anyhow::Result<()> {
        match self.tasks.join_next().await {
            Some(joined) => joined?,
            None => std::future::pending().await,
        }
    }
}

async fn wait_for_signal() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            internal!(level = INFO, "CTRL+C entered, shutting down");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate signal received, shutting down");
        }
    }

    Ok(())
}
