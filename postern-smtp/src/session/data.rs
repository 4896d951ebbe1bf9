use postern_common::{Code, Status, error::SessionError, internal};
use postern_plugins::Hook;
use tokio::io::{AsyncRead, AsyncWrite};

use super::{Flow, Session, State};
use crate::handoff::Envelope;

const QUEUE_DECLINED: &str = "Queuing declined or disabled, try later";

fn missing_transaction() -> SessionError {
    SessionError::Handler("message content without a transaction".to_string())
}

impl<Stream> Session<Stream>
where
    Stream: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Handle one line received after `354`.
    pub(super) async fn data_line(&mut self, line: Vec<u8>) -> Result<Flow, SessionError> {
        match line.as_slice() {
            b".\r\n" => return self.end_of_data().await,
            b".\n" | b".\r" => {
                internal!(level = WARN, "Bare end of data marker from {}", self.peer);
                self.say(
                    Status::Unavailable,
                    "Bare CR or LF in end of data marker is not allowed",
                )
                .await?;
                return Ok(Flow::Disconnect);
            }
            _ => {}
        }

        let content = if line.starts_with(b"..") {
            &line[1..]
        } else {
            &line[..]
        };

        let txn = self.transaction.as_mut().ok_or_else(missing_transaction)?;
        txn.append(content).await;

        let databytes = self.config.smtp.databytes;
        let received = txn.data_bytes;
        if databytes > 0 && received > databytes {
            return self.too_big(received, "Message too big!").await;
        }

        Ok(Flow::Continue)
    }

    /// Longest data line that still fits, terminator included.
    ///
    /// With a size limit in force the line may overshoot the remaining
    /// allowance by the three bytes of an end of data marker.
    pub(super) fn data_line_limit(&self) -> usize {
        let smtp = &self.config.smtp;
        let Some(txn) = self.transaction.as_ref().filter(|_| smtp.databytes > 0) else {
            return smtp.max_data_line_length;
        };

        let remaining = smtp.databytes.saturating_sub(txn.data_bytes).saturating_add(3);
        usize::try_from(remaining)
            .map_or(smtp.max_data_line_length, |remaining| {
                remaining.min(smtp.max_data_line_length)
            })
    }

    /// A data line outgrew `limit` before it was complete.
    pub(super) async fn data_too_long(&mut self, limit: usize) -> Result<Flow, SessionError> {
        let received = self
            .transaction
            .as_ref()
            .map_or(0, |txn| txn.data_bytes)
            .saturating_add(limit as u64);

        let reason = if limit < self.config.smtp.max_data_line_length {
            "Message too big!"
        } else {
            "Line too long"
        };
        self.too_big(received, reason).await
    }

    async fn too_big(&mut self, received: u64, reason: &str) -> Result<Flow, SessionError> {
        let transaction = self.transaction.as_ref().map_or("", |txn| txn.id.as_str());
        internal!(
            level = INFO,
            { session = %self.id, transaction = %transaction },
            "Message exceeds its limit after {received} bytes"
        );
        self.hook(Hook::MaxDataExceeded, vec![received.to_string()])
            .await?;
        self.say(Status::ExceededStorage, reason).await?;
        Ok(Flow::Disconnect)
    }

    async fn end_of_data(&mut self) -> Result<Flow, SessionError> {
        self.state = State::Cmd;

        let txn = self.transaction.as_mut().ok_or_else(missing_transaction)?;
        if let Err(err) = txn.finish().await {
            internal!(level = ERROR, "Unable to spool {}: {err}", txn.id);
            self.say(
                Status::ActionUnavailable,
                "Message could not be stored, try later",
            )
            .await?;
            self.reset_transaction().await?;
            return Ok(Flow::Continue);
        }

        let outcome = self.hook(Hook::DataPost, Vec::new()).await?;
        let flow = match self
            .refuse(
                &outcome,
                Status::Error,
                Status::ActionUnavailable,
                "Message denied",
            )
            .await?
        {
            Some(flow) => flow,
            None if self.relaying => self.queue_outbound().await?,
            None => self.queue().await?,
        };

        self.reset_transaction().await?;
        Ok(flow)
    }

    /// Hand a relayed message to the outbound queue.
    async fn queue_outbound(&mut self) -> Result<Flow, SessionError> {
        let outcome = self.hook(Hook::QueueOutbound, Vec::new()).await?;
        if let Some(flow) = self
            .refuse(
                &outcome,
                Status::Error,
                Status::ActionUnavailable,
                "Message denied",
            )
            .await?
        {
            return Ok(flow);
        }

        let txn = self.transaction.as_ref().ok_or_else(missing_transaction)?;
        let queued = format!("Message Queued ({})", txn.id);

        if outcome.code == Code::Ok {
            self.respond(Status::Ok, &outcome.message_or(queued)).await?;
            return Ok(Flow::Continue);
        }

        let Some(handoff) = self.config.handoff.clone() else {
            self.say(Status::ActionUnavailable, QUEUE_DECLINED).await?;
            return Ok(Flow::Continue);
        };

        let envelope = Envelope {
            uuid: &txn.id,
            mail_from: &txn.mail_from,
            rcpt_to: &txn.rcpt_to,
            notes: self.config.notes.snapshot(&txn.id),
            message: txn.message(),
        };
        let result = handoff.queue_outbound(envelope).await;

        match result {
            Ok(()) => {
                internal!(level = INFO, "{queued}");
                self.say(Status::Ok, queued).await?;
            }
            Err(err) => {
                internal!(level = ERROR, "{err}");
                self.say(Status::ActionUnavailable, "Queuing failed, try later")
                    .await?;
            }
        }

        Ok(Flow::Continue)
    }

    /// Deliver locally through the `queue` hook; only `OK` accepts.
    async fn queue(&mut self) -> Result<Flow, SessionError> {
        let outcome = self.hook(Hook::Queue, Vec::new()).await?;
        if let Some(flow) = self
            .refuse(
                &outcome,
                Status::Error,
                Status::ActionUnavailable,
                "Message denied",
            )
            .await?
        {
            return Ok(flow);
        }

        if outcome.code == Code::Ok {
            let txn = self.transaction.as_ref().ok_or_else(missing_transaction)?;
            let queued = format!("Message Queued ({})", txn.id);
            self.respond(Status::Ok, &outcome.message_or(queued)).await?;
        } else {
            self.say(Status::ActionUnavailable, QUEUE_DECLINED).await?;
        }

        Ok(Flow::Continue)
    }
}
