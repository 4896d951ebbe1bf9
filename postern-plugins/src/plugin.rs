use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{error::PluginError, hook::Hook, notes::Notes, reply::Reply};

/// A unit of policy.
///
/// A plugin declares the hooks it wants through [`hooks`](Self::hooks) and
/// receives each of them in [`handle`](Self::handle). Every invocation must
/// eventually answer through `reply` exactly once; the handler may hand the
/// reply off to spawned work and return early.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn hooks(&self) -> &[Hook];

    /// Override the registry's timeout for this plugin.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Extra EHLO capability lines, e.g. `AUTH PLAIN LOGIN`.
    fn capabilities(&self) -> Vec<String> {
        Vec::new()
    }

    async fn handle(&self, hook: Hook, args: HookArgs, reply: Reply) -> Result<(), PluginError>;
}

/// A read-only picture of the transaction in progress.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransactionView {
    pub id: String,
    pub mail_from: Option<String>,
    pub rcpt_to: Vec<String>,
    pub data_bytes: u64,
    pub header: Vec<(String, String)>,
}

/// A read-only picture of an inbound connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionView {
    pub id: String,
    pub remote: SocketAddr,
    pub local: SocketAddr,
    pub hello: Option<String>,
    pub esmtp: bool,
    pub relaying: bool,
    pub tls: bool,
    pub early_talker: bool,
    pub transaction: Option<TransactionView>,
}

/// A read-only picture of an outbound queue file being delivered.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MailItemView {
    pub file: String,
    pub domain: String,
    pub uuid: Option<String>,
    pub mail_from: Option<String>,
    pub rcpt_to: Vec<String>,
    pub failures: u32,
}

/// What a hook is being run on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Subject {
    Connection(Box<ConnectionView>),
    MailItem(Box<MailItemView>),
}

impl Subject {
    /// Note scope for the subject: transaction id when there is one.
    #[must_use]
    pub fn scope(&self) -> &str {
        match self {
            Self::Connection(conn) => conn
                .transaction
                .as_ref()
                .map_or(conn.id.as_str(), |txn| txn.id.as_str()),
            Self::MailItem(item) => item.uuid.as_deref().unwrap_or(item.file.as_str()),
        }
    }
}

/// Everything a plugin receives for one invocation.
#[derive(Clone, Debug)]
pub struct HookArgs {
    pub subject: Arc<Subject>,
    pub params: Vec<String>,
    pub notes: Notes,
}

impl HookArgs {
    #[must_use]
    pub fn new(subject: Subject, notes: Notes) -> Self {
        Self {
            subject: Arc::new(subject),
            params: Vec::new(),
            notes,
        }
    }

    #[must_use]
    pub fn with_params(mut self, params: Vec<String>) -> Self {
        self.params = params;
        self
    }

    #[must_use]
    pub fn connection(&self) -> Option<&ConnectionView> {
        match self.subject.as_ref() {
            Subject::Connection(conn) => Some(conn),
            Subject::MailItem(_) => None,
        }
    }

    #[must_use]
    pub fn mail_item(&self) -> Option<&MailItemView> {
        match self.subject.as_ref() {
            Subject::MailItem(item) => Some(item),
            Subject::Connection(_) => None,
        }
    }
}
