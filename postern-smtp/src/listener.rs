use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use postern_common::{Signal, error::ListenerError, internal, tracing};
use serde::Deserialize;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::broadcast,
    task::JoinSet,
};

use crate::{
    config::TlsContext,
    connection::Connection,
    error::TlsResult,
    session::{Session, SessionConfig},
};

/// One listening socket
///
/// ```ron
/// (
///     socket: "[::]:25",
///     tls: Some((certificate: "/etc/postern/cert.pem", key: "/etc/postern/key.pem")),
///     relay_clients: ["127.0.0.1", "::1"],
/// )
/// ```
#[derive(Clone, Debug, Deserialize)]
pub struct ListenerConfig {
    pub socket: SocketAddr,
    #[serde(default)]
    pub tls: Option<TlsContext>,
    /// Peers whose connections relay mail to remote domains
    #[serde(default)]
    pub relay_clients: Vec<IpAddr>,
}

#[derive(Debug)]
pub struct Listener {
    config: ListenerConfig,
    session: Arc<SessionConfig>,
}

impl Listener {
    /// The listener's TLS context replaces whatever `session` carried.
    #[must_use]
    pub fn new(config: ListenerConfig, mut session: SessionConfig) -> Self {
        session.tls.clone_from(&config.tls);

        Self {
            config,
            session: Arc::new(session),
        }
    }

    #[must_use]
    pub const fn socket(&self) -> SocketAddr {
        self.config.socket
    }

    /// Load the certificate and key up front so a bad path fails at startup.
    pub fn validate(&self) -> TlsResult<()> {
        if let Some(tls) = self.config.tls.as_ref() {
            Connection::<TcpStream>::acceptor(tls)?;
        }

        Ok(())
    }

    pub async fn bind(&self) -> Result<TcpListener, ListenerError> {
        TcpListener::bind(self.config.socket)
            .await
            .map_err(|source| ListenerError::BindFailed {
                address: self.config.socket.to_string(),
                source,
            })
    }

    pub async fn serve(&self, shutdown: broadcast::Receiver<Signal>) -> Result<(), ListenerError> {
        let listener = self.bind().await?;
        self.serve_on(listener, shutdown).await
    }

    /// Accept connections until shutdown, then wait for open sessions.
    ///
    /// Sessions receive the same shutdown signal and answer `421` to their
    /// clients before closing.
    #[tracing::instrument(level = "trace", skip_all, fields(socket = %self.config.socket))]
    pub async fn serve_on(
        &self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), ListenerError> {
        internal!(level = INFO, "Serving SMTP on {}", self.config.socket);
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed) => break,
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    }
                }

                connection = listener.accept() => {
                    let (stream, peer) = match connection {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            internal!(level = ERROR, "{}", ListenerError::AcceptFailed(err));
                            continue;
                        }
                    };
                    tracing::debug!("Connection received on {} from {peer}", self.config.socket);

                    let local = stream.local_addr().unwrap_or(self.config.socket);
                    let relaying = self.config.relay_clients.contains(&peer.ip());
                    let session = Session::create(stream, peer, local, relaying, Arc::clone(&self.session));
                    let signal = shutdown.resubscribe();

                    sessions.spawn(async move {
                        if let Err(err) = session.run(signal).await {
                            if err.is_client_error() {
                                internal!(level = INFO, "Session with {peer} ended: {err}");
                            } else {
                                internal!(level = ERROR, "Session with {peer} failed: {err}");
                            }
                        }
                    });
                }
            }

            while sessions.try_join_next().is_some() {}
        }

        internal!(
            level = INFO,
            "SMTP listener {} received shutdown signal, finishing {} sessions ...",
            self.config.socket,
            sessions.len()
        );
        while sessions.join_next().await.is_some() {}

        Ok(())
    }
}
