//! One inbound SMTP connection.
//!
//! A [`Session`] owns its socket, its current [`Transaction`] and the hook
//! state used by the dispatcher. Lines are read one at a time and handled
//! strictly in arrival order; every reply is written before the next line is
//! looked at.

use std::{
    fmt::{self, Write as _},
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use postern_common::{Code, Signal, Status, error::SessionError, internal, outgoing, tracing};
use postern_plugins::{
    ConnectionView, Dispatcher, Hook, HookArgs, HookState, Notes, Outcome, Subject,
};
use postern_spool::SpoolConfig;
use serde_json::json;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::broadcast,
};

use crate::{
    config::{SmtpConfig, TlsContext},
    connection::Connection,
    error::LineError,
    handoff::QueueHandoff,
    line_source::LineSource,
    transaction::Transaction,
};

mod commands;
mod data;

/// Where a session is in the protocol.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum State {
    /// Waiting on a hook before the next line may be handled.
    #[default]
    Pause,
    /// Ready for the next command line.
    Cmd,
    /// Receiving message content after `354`.
    Data,
    Disconnected,
}

/// What the session does after handling a line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    StartTls,
    Disconnect,
}

/// Everything sessions accepted by one listener share.
pub struct SessionConfig {
    /// Host name used in the greeting and in HELO/EHLO replies.
    pub me: Arc<str>,
    pub smtp: SmtpConfig,
    pub tls: Option<TlsContext>,
    pub spool: SpoolConfig,
    pub dispatcher: Dispatcher,
    pub notes: Notes,
    pub handoff: Option<Arc<dyn QueueHandoff>>,
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("me", &self.me)
            .field("smtp", &self.smtp)
            .field("tls", &self.tls)
            .field("spool", &self.spool)
            .field("dispatcher", &self.dispatcher)
            .field("handoff", &self.handoff.is_some())
            .finish_non_exhaustive()
    }
}

impl SessionConfig {
    /// Create a new `SessionConfig` builder
    #[must_use]
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }
}

/// Builder for `SessionConfig`
#[derive(Default)]
pub struct SessionConfigBuilder {
    me: Option<Arc<str>>,
    smtp: Option<SmtpConfig>,
    tls: Option<TlsContext>,
    spool: SpoolConfig,
    dispatcher: Dispatcher,
    notes: Notes,
    handoff: Option<Arc<dyn QueueHandoff>>,
}

impl SessionConfigBuilder {
    /// Set the host name announced to clients
    #[must_use]
    pub fn with_me(mut self, me: impl Into<Arc<str>>) -> Self {
        self.me = Some(me.into());
        self
    }

    #[must_use]
    pub fn with_smtp(mut self, smtp: SmtpConfig) -> Self {
        self.smtp = Some(smtp);
        self
    }

    /// Set the TLS context for STARTTLS support
    #[must_use]
    pub fn with_tls(mut self, tls: Option<TlsContext>) -> Self {
        self.tls = tls;
        self
    }

    #[must_use]
    pub fn with_spool(mut self, spool: SpoolConfig) -> Self {
        self.spool = spool;
        self
    }

    #[must_use]
    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Share a note table with other parts of the process
    #[must_use]
    pub fn with_notes(mut self, notes: Notes) -> Self {
        self.notes = notes;
        self
    }

    /// Where relayed mail is handed once accepted
    #[must_use]
    pub fn with_handoff(mut self, handoff: Arc<dyn QueueHandoff>) -> Self {
        self.handoff = Some(handoff);
        self
    }

    /// Build the final `SessionConfig`
    #[must_use]
    pub fn build(self) -> SessionConfig {
        SessionConfig {
            me: self.me.unwrap_or_else(|| {
                std::env::var("HOSTNAME")
                    .unwrap_or_else(|_| "localhost".to_string())
                    .into()
            }),
            smtp: self.smtp.unwrap_or_default(),
            tls: self.tls,
            spool: self.spool,
            dispatcher: self.dispatcher,
            notes: self.notes,
            handoff: self.handoff,
        }
    }
}

pub struct Session<Stream> {
    id: String,
    peer: SocketAddr,
    local: SocketAddr,
    config: Arc<SessionConfig>,
    lines: LineSource<Connection<Stream>>,
    state: State,
    hello: Option<String>,
    esmtp: bool,
    relaying: bool,
    early_talker: bool,
    transaction: Option<Transaction>,
    transactions: u32,
    hooks: HookState,
    started: Instant,
}

impl<Stream> Session<Stream>
where
    Stream: AsyncRead + AsyncWrite + Unpin + Send,
{
    #[must_use]
    pub fn create(
        stream: Stream,
        peer: SocketAddr,
        local: SocketAddr,
        relaying: bool,
        config: Arc<SessionConfig>,
    ) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            peer,
            local,
            config,
            lines: LineSource::new(Connection::Plain(stream)),
            state: State::Pause,
            hello: None,
            esmtp: false,
            relaying,
            early_talker: false,
            transaction: None,
            transactions: 0,
            hooks: HookState::default(),
            started: Instant::now(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn state(&self) -> State {
        self.state
    }

    /// Serve the connection until it ends.
    ///
    /// The disconnect hook always runs and the socket is always shut down,
    /// whatever ended the session.
    #[tracing::instrument(level = "debug", skip_all, fields(id = %self.id, peer = %self.peer))]
    pub async fn run(mut self, mut signal: broadcast::Receiver<Signal>) -> Result<(), SessionError> {
        internal!(
            level = INFO,
            { session = %self.id, peer = %self.peer, relaying = self.relaying },
            "Connected"
        );

        let result = self.drive(&mut signal).await;
        self.disconnect().await;

        internal!(
            level = INFO,
            { session = %self.id, transactions = self.transactions },
            "Connection closed"
        );
        result
    }

    async fn drive(&mut self, signal: &mut broadcast::Receiver<Signal>) -> Result<(), SessionError> {
        if self.greet().await? == Flow::Disconnect {
            return Ok(());
        }

        let lifetime = self.config.smtp.timeouts.connection_secs;
        loop {
            if self.started.elapsed() >= Duration::from_secs(lifetime) {
                tracing::warn!(
                    peer = %self.peer,
                    max_secs = lifetime,
                    "Connection exceeded maximum lifetime, closing"
                );
                self.say(Status::Unavailable, "Connection open too long")
                    .await?;
                return Err(SessionError::Timeout(lifetime));
            }

            match self.next(signal).await? {
                Flow::Continue => {}
                Flow::StartTls => self.starttls().await?,
                Flow::Disconnect => return Ok(()),
            }
        }
    }

    fn timeout_secs(&self) -> u64 {
        match self.state {
            State::Data => self.config.smtp.timeouts.data_block_secs,
            _ => self.config.smtp.timeouts.command_secs,
        }
    }

    fn line_limit(&self) -> usize {
        match self.state {
            State::Data => self.data_line_limit(),
            _ => self.config.smtp.max_line_length,
        }
    }

    async fn next(&mut self, signal: &mut broadcast::Receiver<Signal>) -> Result<Flow, SessionError> {
        let timeout_secs = self.timeout_secs();
        self.lines.set_limit(Some(self.line_limit()));

        let read = tokio::select! {
            biased;
            Ok(Signal::Shutdown) = signal.recv() => {
                self.say(Status::Unavailable, "Server shutting down").await?;
                return Ok(Flow::Disconnect);
            }
            read = tokio::time::timeout(Duration::from_secs(timeout_secs), self.lines.next_line()) => read,
        };

        match read {
            Err(_) => {
                tracing::warn!(
                    peer = %self.peer,
                    state = ?self.state,
                    timeout_secs,
                    "Client connection timed out"
                );
                if let Err(err) = self.say(Status::Unavailable, "timeout exceeded").await {
                    internal!(level = DEBUG, "Unable to send timeout reply: {err}");
                }
                Err(SessionError::Timeout(timeout_secs))
            }
            Ok(Err(LineError::TooLong(limit))) => self.line_too_long(limit).await,
            Ok(Err(LineError::Io(err))) => Err(err.into()),
            Ok(Ok(None)) => {
                internal!(level = DEBUG, "Peer closed the connection");
                Ok(Flow::Disconnect)
            }
            Ok(Ok(Some(line))) => self.process(line).await,
        }
    }

    async fn line_too_long(&mut self, limit: usize) -> Result<Flow, SessionError> {
        if self.state == State::Data {
            return self.data_too_long(limit).await;
        }

        internal!(
            level = INFO,
            { session = %self.id, peer = %self.peer },
            "Command line exceeds {limit} bytes"
        );
        self.say(Status::InternalError, "Line too long").await?;
        Ok(Flow::Disconnect)
    }

    async fn process(&mut self, line: Vec<u8>) -> Result<Flow, SessionError> {
        let result = if self.state == State::Data {
            self.data_line(line).await
        } else {
            self.command(&line).await
        };

        if let Err(SessionError::Handler(reason)) = &result {
            internal!(level = ERROR, "Command handler failed: {reason}");
            self.say(Status::InternalError, "Internal Server Error")
                .await?;
        }

        result
    }

    /// Run the connect hook and send the banner.
    async fn greet(&mut self) -> Result<Flow, SessionError> {
        self.state = State::Pause;
        let outcome = self.hook(Hook::Connect, Vec::new()).await?;

        if self.lines.poll_input()? && self.lines.has_buffered() {
            self.early_talker = true;
            self.config.notes.set(&self.id, "early_talker", true);
            internal!(level = INFO, { session = %self.id, peer = %self.peer }, "Early talker");
            tokio::time::sleep(self.config.smtp.early_talker_delay()).await;
        }

        match outcome.code {
            Code::Deny | Code::DenyDisconnect => {
                self.respond(
                    Status::TransactionFailed,
                    &outcome.message_or("Your mail is not welcome here"),
                )
                .await?;
                return Ok(Flow::Disconnect);
            }
            Code::DenySoft | Code::DenySoftDisconnect => {
                self.respond(Status::Unavailable, &outcome.message_or("Come back later"))
                    .await?;
                return Ok(Flow::Disconnect);
            }
            _ => {}
        }

        self.state = State::Cmd;
        let banner = if outcome.code == Code::Ok && !outcome.message.is_empty() {
            outcome.message
        } else {
            vec![format!("{} ESMTP postern ready", self.config.me)]
        };
        self.respond(Status::ServiceReady, &banner).await?;

        Ok(Flow::Continue)
    }

    async fn starttls(&mut self) -> Result<(), SessionError> {
        let Some(tls) = self.config.tls.clone() else {
            return Ok(());
        };

        let discarded = self.lines.discard_buffered();
        if discarded > 0 {
            internal!(
                level = WARN,
                "Discarded {discarded} bytes pipelined ahead of the TLS handshake"
            );
        }

        let info = self
            .lines
            .get_mut()
            .upgrade(&tls)
            .await
            .map_err(|err| SessionError::Protocol(err.to_string()))?;

        internal!(
            level = DEBUG,
            "Connection upgraded to {} using {}",
            info.protocol,
            info.cipher
        );

        self.reset_transaction().await?;
        self.hello = None;
        self.esmtp = false;
        self.config.notes.set(
            &self.id,
            "tls",
            json!({ "protocol": info.protocol, "cipher": info.cipher }),
        );

        Ok(())
    }

    /// End the session: drop the transaction, tell plugins, release notes.
    async fn disconnect(&mut self) {
        if self.state == State::Disconnected {
            return;
        }

        if let Err(err) = self.reset_transaction().await {
            internal!(level = WARN, "Reset on disconnect failed: {err}");
        }

        self.state = State::Disconnected;
        if let Err(err) = self.hook(Hook::Disconnect, Vec::new()).await {
            internal!(level = WARN, "Disconnect hook failed: {err}");
        }

        self.config.notes.clear(&self.id);

        if let Err(err) = self.lines.get_mut().shutdown().await {
            internal!(level = DEBUG, "Shutdown of {} failed: {err}", self.peer);
        }
    }

    /// Throw away the current transaction, if any.
    pub(crate) async fn reset_transaction(&mut self) -> Result<(), SessionError> {
        if self.transaction.is_none() {
            return Ok(());
        }

        let hook = self.hook(Hook::ResetTransaction, Vec::new()).await;

        if let Some(txn) = self.transaction.take() {
            self.config.notes.clear(&txn.id);
            txn.discard().await;
        }

        hook.map(|_| ())
    }

    fn view(&self) -> ConnectionView {
        ConnectionView {
            id: self.id.clone(),
            remote: self.peer,
            local: self.local,
            hello: self.hello.clone(),
            esmtp: self.esmtp,
            relaying: self.relaying,
            tls: self.lines.get_ref().is_tls(),
            early_talker: self.early_talker,
            transaction: self.transaction.as_ref().map(Transaction::view),
        }
    }

    /// Run `hook` for this connection.
    pub(crate) async fn hook(
        &mut self,
        hook: Hook,
        params: Vec<String>,
    ) -> Result<Outcome, SessionError> {
        let args = HookArgs::new(
            Subject::Connection(Box::new(self.view())),
            self.config.notes.clone(),
        )
        .with_params(params);

        self.config
            .dispatcher
            .run(hook, &mut self.hooks, args)
            .await
            .map_err(|err| SessionError::Handler(err.to_string()))
    }

    /// Answer a denial. Returns `None` when `outcome` is not a deny.
    pub(crate) async fn refuse(
        &mut self,
        outcome: &Outcome,
        hard: Status,
        soft: Status,
        default: impl Into<String>,
    ) -> Result<Option<Flow>, SessionError> {
        let status = match outcome.code {
            Code::Deny | Code::DenyDisconnect => hard,
            Code::DenySoft | Code::DenySoftDisconnect => soft,
            _ => return Ok(None),
        };

        self.respond(status, &outcome.message_or(default)).await?;

        Ok(Some(if outcome.code.disconnects() {
            Flow::Disconnect
        } else {
            Flow::Continue
        }))
    }

    pub(crate) async fn say(
        &mut self,
        status: Status,
        line: impl Into<String>,
    ) -> Result<(), SessionError> {
        self.respond(status, &[line.into()]).await
    }

    pub(crate) async fn respond(
        &mut self,
        status: Status,
        lines: &[String],
    ) -> Result<(), SessionError> {
        let code = u16::from(status);
        let uuid = (self.config.smtp.deny_includes_uuid && code >= 400).then(|| {
            self.transaction
                .as_ref()
                .map_or(self.id.as_str(), |txn| txn.id.as_str())
        });

        let reply = format_reply(code, lines, uuid);
        outgoing!({ session = %self.id }, "{}", reply.trim_end());

        let stream = self.lines.get_mut();
        stream.write_all(reply.as_bytes()).await?;
        stream.flush().await?;

        Ok(())
    }
}

/// Render a reply: `code-` on every line but the last, `code ` on the last.
pub(crate) fn format_reply(code: u16, lines: &[String], uuid: Option<&str>) -> String {
    let mut reply = String::new();
    let last = lines.len().saturating_sub(1);

    if lines.is_empty() {
        return uuid.map_or_else(|| format!("{code} \r\n"), |uuid| format!("{code} ({uuid})\r\n"));
    }

    for (index, line) in lines.iter().enumerate() {
        let separator = if index == last { ' ' } else { '-' };
        let _ = write!(reply, "{code}{separator}{line}");
        if index == last
            && let Some(uuid) = uuid
        {
            let _ = write!(reply, " ({uuid})");
        }
        reply.push_str("\r\n");
    }

    reply
}
