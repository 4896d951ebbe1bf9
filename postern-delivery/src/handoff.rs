use std::collections::BTreeMap;

use async_trait::async_trait;
use postern_common::{Domain, internal, tracing};
use postern_smtp::{Envelope, HandoffError, QueueHandoff};
use postern_spool::{QueueFile, QueueFileError, QueueFileName, Todo};
use thiserror::Error;

use crate::outbound::Outbound;

#[derive(Debug, Error)]
enum SplitError {
    #[error("Recipient {0} has no domain")]
    NoDomain(String),

    #[error(transparent)]
    QueueFile(#[from] QueueFileError),
}

/// Group recipients by their domain, keeping each group in arrival order.
fn by_domain(rcpt_to: &[String]) -> Result<BTreeMap<Domain, Vec<String>>, SplitError> {
    let mut domains: BTreeMap<Domain, Vec<String>> = BTreeMap::new();
    for rcpt in rcpt_to {
        let domain =
            Domain::of_address(rcpt).ok_or_else(|| SplitError::NoDomain(rcpt.clone()))?;
        domains.entry(domain).or_default().push(rcpt.clone());
    }
    Ok(domains)
}

impl Outbound {
    async fn write_all(&self, envelope: &Envelope<'_>) -> Result<Vec<QueueFile>, SplitError> {
        let domains = by_domain(envelope.rcpt_to)?;
        let mut written = Vec::with_capacity(domains.len());

        for (domain, rcpt_to) in domains {
            let mut todo = Todo::new(envelope.uuid, envelope.mail_from, rcpt_to, domain.clone());
            todo.notes.clone_from(&envelope.notes);

            let name = QueueFileName::fresh(&self.me, domain);
            match QueueFile::write(&self.config.queue_dir, name, &todo, envelope.message).await {
                Ok(file) => written.push(file),
                Err(err) => {
                    for file in &written {
                        if let Err(err) = file.remove().await {
                            internal!(level = WARN, "Unable to remove {}: {err}", file.path.display());
                        }
                    }
                    return Err(err.into());
                }
            }
        }

        Ok(written)
    }
}

#[async_trait]
impl QueueHandoff for Outbound {
    /// Write one queue file per recipient domain.
    ///
    /// Either every file is written or none is left behind.
    #[tracing::instrument(level = "trace", skip_all, fields(uuid = envelope.uuid))]
    async fn queue_outbound(&self, envelope: Envelope<'_>) -> Result<(), HandoffError> {
        let written = self
            .write_all(&envelope)
            .await
            .map_err(|err| HandoffError(Box::new(err)))?;

        internal!(
            level = INFO,
            "Queued {} for {} domain(s)",
            envelope.uuid,
            written.len()
        );
        for file in written {
            self.queue.push(file);
        }
        Ok(())
    }
}
