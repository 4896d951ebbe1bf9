use async_trait::async_trait;
use postern_spool::MessageSpool;
use serde_json::{Map, Value};
use thiserror::Error;

/// An accepted message on its way to the outbound queue.
#[derive(Debug)]
pub struct Envelope<'a> {
    pub uuid: &'a str,
    pub mail_from: &'a str,
    pub rcpt_to: &'a [String],
    pub notes: Map<String, Value>,
    pub message: &'a MessageSpool,
}

#[derive(Debug, Error)]
#[error("Unable to queue message: {0}")]
pub struct HandoffError(#[from] pub Box<dyn std::error::Error + Send + Sync>);

/// Where relayed mail goes once a session has accepted it.
///
/// Implemented by the outbound queue; the session only knows this seam.
#[async_trait]
pub trait QueueHandoff: Send + Sync {
    /// Persist the message durably before the client is told it was queued.
    async fn queue_outbound(&self, envelope: Envelope<'_>) -> Result<(), HandoffError>;
}
