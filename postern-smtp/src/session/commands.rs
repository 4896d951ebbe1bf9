use postern_common::{Code, Domain, Status, error::SessionError, incoming};
use postern_plugins::Hook;
use postern_spool::trim_terminator;
use tokio::io::{AsyncRead, AsyncWrite};

use super::{Flow, Session, State};
use crate::{
    rfc1869::{self, Kind},
    transaction::Transaction,
};

impl<Stream> Session<Stream>
where
    Stream: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Parse `VERB [args]` and run the matching command.
    pub(super) async fn command(&mut self, line: &[u8]) -> Result<Flow, SessionError> {
        let text = String::from_utf8_lossy(trim_terminator(line)).into_owned();
        incoming!({ session = %self.id }, "{text}");

        let (verb, args) = text.split_once(' ').unwrap_or((text.as_str(), ""));
        let verb = verb.to_ascii_lowercase();

        match verb.as_str() {
            "helo" => self.cmd_helo(args, false).await,
            "ehlo" => self.cmd_helo(args, true).await,
            "mail" => self.cmd_mail(args).await,
            "rcpt" => self.cmd_rcpt(args).await,
            "data" => self.cmd_data().await,
            "rset" => self.cmd_rset().await,
            "noop" => self.cmd_noop().await,
            "vrfy" => self.cmd_vrfy(args).await,
            "help" => self.cmd_help().await,
            "quit" => self.cmd_quit().await,
            "starttls" => self.cmd_starttls(args).await,
            _ => self.unrecognized(&verb, args).await,
        }
    }

    async fn cmd_helo(&mut self, args: &str, extended: bool) -> Result<Flow, SessionError> {
        let verb = if extended { "EHLO" } else { "HELO" };
        let host = args.trim();
        if host.is_empty() {
            self.say(
                Status::SyntaxError,
                format!("{verb} requires domain/address - see RFC-2821 4.1.1.1"),
            )
            .await?;
            return Ok(Flow::Continue);
        }

        self.reset_transaction().await?;
        self.hello = Some(host.to_string());
        self.esmtp = extended;

        let hook = if extended { Hook::Ehlo } else { Hook::Helo };
        let outcome = self.hook(hook, vec![host.to_string()]).await?;

        if outcome.code.is_deny() {
            self.hello = None;
            self.esmtp = false;
        }
        if let Some(flow) = self
            .refuse(
                &outcome,
                Status::Error,
                Status::MailboxUnavailable,
                format!("{verb} denied"),
            )
            .await?
        {
            return Ok(flow);
        }

        let greeting = format!(
            "{} Hello {host} [{}]",
            self.config.me,
            self.peer.ip()
        );

        if !extended {
            self.say(Status::Ok, greeting).await?;
            return Ok(Flow::Continue);
        }

        let mut lines = vec![greeting, "PIPELINING".to_string(), "8BITMIME".to_string()];
        match self.config.smtp.databytes {
            0 => lines.push("SIZE".to_string()),
            size => lines.push(format!("SIZE {size}")),
        }
        if self.config.tls.is_some() && !self.lines.get_ref().is_tls() {
            lines.push("STARTTLS".to_string());
        }
        lines.extend(self.config.dispatcher.registry().capabilities());

        self.respond(Status::Ok, &lines).await?;
        Ok(Flow::Continue)
    }

    async fn cmd_mail(&mut self, args: &str) -> Result<Flow, SessionError> {
        if self.hello.is_none() {
            self.say(Status::InvalidCommandSequence, "Use EHLO/HELO before MAIL")
                .await?;
            return Ok(Flow::Continue);
        }
        if self.transaction.is_some() {
            self.say(Status::InvalidCommandSequence, "Nested MAIL command")
                .await?;
            return Ok(Flow::Continue);
        }

        let parsed = match rfc1869::parse(Kind::Mail, args, self.config.smtp.strict_rfc1869) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.say(Status::SyntaxError, err.to_string()).await?;
                return Ok(Flow::Continue);
            }
        };
        let Some((from, params)) = parsed.split_first() else {
            self.say(Status::SyntaxError, "Missing sender").await?;
            return Ok(Flow::Continue);
        };

        let databytes = self.config.smtp.databytes;
        if let Some(size) = rfc1869::parameter(params, "size") {
            match size.parse::<u64>() {
                Ok(size) if databytes > 0 && size > databytes => {
                    self.say(
                        Status::ExceededStorage,
                        format!("Message size {size} exceeds maximum of {databytes} bytes"),
                    )
                    .await?;
                    return Ok(Flow::Continue);
                }
                Ok(_) => {}
                Err(_) => {
                    self.say(Status::SyntaxError, "Invalid SIZE parameter")
                        .await?;
                    return Ok(Flow::Continue);
                }
            }
        }

        self.transactions += 1;
        let id = format!("{}.{}", self.id, self.transactions);
        self.config
            .notes
            .set(&id, "remote_ip", self.peer.ip().to_string());

        let from = from.clone();
        self.transaction = Some(Transaction::new(
            id,
            from.clone(),
            params.to_vec(),
            self.config.spool.clone(),
        ));

        let outcome = self.hook(Hook::Mail, parsed).await?;
        if let Some(flow) = self
            .refuse(
                &outcome,
                Status::Error,
                Status::MailboxUnavailable,
                format!("sender {from} denied"),
            )
            .await?
        {
            self.reset_transaction().await?;
            return Ok(flow);
        }

        self.respond(Status::Ok, &outcome.message_or(format!("sender {from} OK")))
            .await?;
        Ok(Flow::Continue)
    }

    async fn cmd_rcpt(&mut self, args: &str) -> Result<Flow, SessionError> {
        if self.transaction.is_none() {
            self.say(Status::InvalidCommandSequence, "Use MAIL before RCPT")
                .await?;
            return Ok(Flow::Continue);
        }

        let parsed = match rfc1869::parse(Kind::Rcpt, args, self.config.smtp.strict_rfc1869) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.say(Status::SyntaxError, err.to_string()).await?;
                return Ok(Flow::Continue);
            }
        };
        let Some(rcpt) = parsed.first().cloned() else {
            self.say(Status::SyntaxError, "Missing recipient").await?;
            return Ok(Flow::Continue);
        };

        // Relayed mail is queued by recipient domain.
        if self.relaying && Domain::of_address(&rcpt).is_none() {
            self.say(
                Status::MailboxNameNotAllowed,
                format!("Relaying to {rcpt} requires a domain"),
            )
            .await?;
            return Ok(Flow::Continue);
        }

        let outcome = self.hook(Hook::Rcpt, parsed).await?;
        if let Some(flow) = self
            .refuse(
                &outcome,
                Status::Error,
                Status::MailboxUnavailable,
                format!("delivery denied for {rcpt}"),
            )
            .await?
        {
            return Ok(flow);
        }

        // CONT only accepts on relaying connections
        if outcome.code != Code::Ok && !self.relaying {
            self.say(Status::Error, format!("I cannot deliver mail for {rcpt}"))
                .await?;
            return Ok(Flow::Continue);
        }

        if let Some(txn) = self.transaction.as_mut() {
            txn.rcpt_to.push(rcpt.clone());
        }
        self.hook(Hook::RcptOk, vec![rcpt.clone()]).await?;

        self.respond(
            Status::Ok,
            &outcome.message_or(format!("recipient {rcpt} OK")),
        )
        .await?;
        Ok(Flow::Continue)
    }

    async fn cmd_data(&mut self) -> Result<Flow, SessionError> {
        let Some(txn) = self.transaction.as_ref() else {
            self.say(Status::InvalidCommandSequence, "MAIL required first")
                .await?;
            return Ok(Flow::Continue);
        };
        if txn.rcpt_to.is_empty() {
            self.say(Status::InvalidCommandSequence, "RCPT required first")
                .await?;
            return Ok(Flow::Continue);
        }

        let outcome = self.hook(Hook::Data, Vec::new()).await?;
        if let Some(flow) = self
            .refuse(
                &outcome,
                Status::TransactionFailed,
                Status::ActionUnavailable,
                "Message denied",
            )
            .await?
        {
            self.reset_transaction().await?;
            return Ok(flow);
        }

        self.state = State::Data;
        self.say(Status::StartMailInput, "go ahead, make my day")
            .await?;
        Ok(Flow::Continue)
    }

    async fn cmd_rset(&mut self) -> Result<Flow, SessionError> {
        self.hook(Hook::Rset, Vec::new()).await?;
        self.reset_transaction().await?;
        self.say(Status::Ok, "OK").await?;
        Ok(Flow::Continue)
    }

    async fn cmd_noop(&mut self) -> Result<Flow, SessionError> {
        let outcome = self.hook(Hook::Noop, Vec::new()).await?;
        if let Some(flow) = self
            .refuse(
                &outcome,
                Status::InternalError,
                Status::MailboxUnavailable,
                "NOOP denied",
            )
            .await?
        {
            return Ok(flow);
        }

        self.say(Status::Ok, "OK").await?;
        Ok(Flow::Continue)
    }

    async fn cmd_vrfy(&mut self, args: &str) -> Result<Flow, SessionError> {
        let outcome = self
            .hook(Hook::Vrfy, vec![args.trim().to_string()])
            .await?;

        if outcome.code == Code::Ok {
            self.respond(Status::Ok, &outcome.message_or("User OK"))
                .await?;
            return Ok(Flow::Continue);
        }
        if let Some(flow) = self
            .refuse(
                &outcome,
                Status::Error,
                Status::MailboxUnavailable,
                "Access Denied",
            )
            .await?
        {
            return Ok(flow);
        }

        self.say(
            Status::CannotVerify,
            "Just try sending a mail and we'll see how it turns out ...",
        )
        .await?;
        Ok(Flow::Continue)
    }

    async fn cmd_help(&mut self) -> Result<Flow, SessionError> {
        let lines = [
            "This is postern",
            "Supported commands: HELO EHLO MAIL RCPT DATA RSET NOOP VRFY HELP QUIT",
            "Extensions: PIPELINING 8BITMIME SIZE STARTTLS",
        ]
        .map(String::from);

        self.respond(Status::HelpMessage, &lines).await?;
        Ok(Flow::Continue)
    }

    async fn cmd_quit(&mut self) -> Result<Flow, SessionError> {
        self.hook(Hook::Quit, Vec::new()).await?;
        self.say(
            Status::GoodBye,
            format!(
                "{} closing connection. Have a jolly good day.",
                self.config.me
            ),
        )
        .await?;
        Ok(Flow::Disconnect)
    }

    async fn cmd_starttls(&mut self, args: &str) -> Result<Flow, SessionError> {
        if self.config.tls.is_none() || self.lines.get_ref().is_tls() {
            self.say(Status::NotImplemented, "Command not implemented")
                .await?;
            return Ok(Flow::Continue);
        }
        if !args.trim().is_empty() {
            self.say(Status::SyntaxError, "Syntax error (no parameters allowed)")
                .await?;
            return Ok(Flow::Continue);
        }

        self.say(Status::ServiceReady, "Go ahead.").await?;
        Ok(Flow::StartTls)
    }

    async fn unrecognized(&mut self, verb: &str, args: &str) -> Result<Flow, SessionError> {
        let params = vec![verb.to_ascii_uppercase(), args.trim().to_string()];
        let outcome = self.hook(Hook::UnrecognizedCommand, params).await?;

        if outcome.code == Code::Ok {
            self.respond(Status::Ok, &outcome.message_or("OK")).await?;
            return Ok(Flow::Continue);
        }
        if let Some(flow) = self
            .refuse(
                &outcome,
                Status::InternalError,
                Status::MailboxUnavailable,
                "Unrecognized command",
            )
            .await?
        {
            return Ok(flow);
        }

        self.say(Status::InternalError, "Unrecognized command")
            .await?;
        Ok(Flow::Continue)
    }
}
