//! Delivery failures, split by what happens to the message next.

use postern_smtp::client::{ClientError, Response};
use postern_spool::QueueFileError;
use thiserror::Error;

/// How a delivery attempt failed.
///
/// - `Bounce` gives up on the message and notifies the sender.
/// - `TempFail` reschedules it with backoff.
/// - `Fatal` drops it; nothing can be done and nobody can be told.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Permanent failure: {0}")]
    Bounce(String),

    #[error("Temporary failure: {0}")]
    TempFail(String),

    #[error("Fatal failure: {0}")]
    Fatal(String),
}

impl DeliveryError {
    /// Classify an unexpected reply: 5xx bounces, anything else is retried.
    #[must_use]
    pub fn from_reply(stage: &str, response: &Response) -> Self {
        let reason = format!("{stage}: {} {}", response.code, response.message());
        if response.is_permanent_error() {
            Self::Bounce(reason)
        } else {
            Self::TempFail(reason)
        }
    }
}

impl From<ClientError> for DeliveryError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Rejected(response) => Self::from_reply("rejected", &response),
            err => Self::TempFail(err.to_string()),
        }
    }
}

impl From<QueueFileError> for DeliveryError {
    fn from(err: QueueFileError) -> Self {
        match err {
            QueueFileError::Io(err) => Self::TempFail(format!("queue file: {err}")),
            err => Self::Fatal(format!("queue file: {err}")),
        }
    }
}

#[derive(Debug, Error)]
pub enum DnsError {
    /// NXDOMAIN, or the name exists without records of the asked type.
    #[error("No records found for {0}")]
    NotFound(String),

    #[error("DNS lookup for {name} failed: {reason}")]
    Lookup { name: String, reason: String },

    #[error("Unable to build resolver: {0}")]
    Resolver(String),
}

#[derive(Debug, Error)]
pub enum PoolError {
    /// Every connection allowed for this domain is already in use.
    #[error("Connection limit reached for {0}")]
    Saturated(String),

    #[error(transparent)]
    Client(#[from] ClientError),
}
