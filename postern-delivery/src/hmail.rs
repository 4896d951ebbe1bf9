//! One delivery attempt for one queue file.
//!
//! An [`HMailItem`] loads the todo header, resolves mail exchangers and walks
//! them in order until a remote MTA takes the message. It then settles the
//! queue file: removed on delivery, bounce or fatal failure, renamed and put
//! back on a retry timer on temporary failure.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use postern_common::{Code, internal, tracing};
use postern_plugins::{Hook, HookArgs, HookState, MailItemView, Outcome, Subject};
use postern_smtp::client::{ClientError, Response, SmtpClient};
use postern_spool::{QueueFile, QueueFileName, Todo};

use crate::{
    dns::mail_exchangers,
    error::{DeliveryError, PoolError},
    outbound::Outbound,
    pool::{PoolKey, PooledClient},
};

/// How long a delivery waits when every pooled connection is in use.
const POOL_RETRY: Duration = Duration::from_secs(1);

/// Delay before the retry that follows failure number `failures`.
///
/// ```
/// use std::time::Duration;
/// use postern_delivery::hmail::backoff;
///
/// assert_eq!(backoff(1), Duration::from_secs(64));
/// assert_eq!(backoff(3), Duration::from_secs(256));
/// ```
#[must_use]
pub fn backoff(failures: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(failures.saturating_add(5)))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MailState {
    Loading,
    Resolving,
    Delivering,
    Delivered,
    Bounced,
    /// Renamed and waiting on a retry timer.
    Deferred,
    Fatal,
    /// Removed at a plugin's request.
    Dropped,
}

/// What the remote said when it took the message.
#[derive(Debug)]
struct Accepted {
    host: String,
    address: SocketAddr,
    response: Response,
    refused: Vec<(String, Response)>,
    deferred: Vec<String>,
}

enum Failure {
    Delivery(DeliveryError),
    /// Not attempted; try again after the delay without counting a failure.
    Throttled(Duration, String),
}

impl From<DeliveryError> for Failure {
    fn from(err: DeliveryError) -> Self {
        Self::Delivery(err)
    }
}

/// Outcome of trying one remote address.
enum Route {
    /// This address did not work; move on to the next.
    Next(String),
    Stop(Failure),
}

/// Where a dialog broke off.
enum Dialog {
    /// The connection is unusable.
    Lost(ClientError),
    /// The remote refused; the connection is back in command state.
    Refused(DeliveryError),
}

pub struct HMailItem {
    outbound: Arc<Outbound>,
    file: QueueFile,
    todo: Option<Todo>,
    state: MailState,
    hooks: HookState,
}

impl HMailItem {
    #[must_use]
    pub fn new(outbound: Arc<Outbound>, file: QueueFile) -> Self {
        Self {
            outbound,
            file,
            todo: None,
            state: MailState::Loading,
            hooks: HookState::default(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> MailState {
        self.state
    }

    /// Attempt delivery and settle the queue file. Returns the final state.
    #[tracing::instrument(level = "trace", skip_all, fields(file = %self.file.name))]
    pub async fn send(mut self) -> MailState {
        match self.attempt().await {
            Ok(accepted) => self.delivered(accepted).await,
            Err(Failure::Throttled(delay, reason)) => {
                internal!(
                    level = DEBUG,
                    { hmail = %self.file.name, delay_secs = delay.as_secs() },
                    "Holding delivery: {reason}"
                );
                self.forget_notes();
                self.outbound.queue.defer(self.file.clone(), delay);
                self.state = MailState::Deferred;
            }
            Err(Failure::Delivery(DeliveryError::Bounce(reason))) => self.bounce(&reason).await,
            Err(Failure::Delivery(DeliveryError::TempFail(reason))) => self.temp_fail(&reason).await,
            Err(Failure::Delivery(DeliveryError::Fatal(reason))) => self.fatal(&reason).await,
        }

        self.state
    }

    async fn attempt(&mut self) -> Result<Accepted, Failure> {
        self.state = MailState::Loading;
        let todo = self.file.read_todo().await.map_err(DeliveryError::from)?;
        for (key, value) in &todo.notes {
            self.outbound.notes.set(&todo.uuid, key.clone(), value.clone());
        }
        self.todo = Some(todo);

        let domain = self.file.name.domain.clone();
        let _slot = self
            .outbound
            .policy
            .acquire(&domain)
            .map_err(|throttle| Failure::Throttled(throttle.retry_after(), throttle.to_string()))?;

        self.state = MailState::Resolving;
        let exchangers = mail_exchangers(self.outbound.resolver.as_ref(), &domain)
            .await
            .map_err(|err| DeliveryError::Fatal(err.to_string()))?;
        if exchangers.iter().all(|mx| mx.is_null()) {
            return Err(DeliveryError::Bounce(format!("{domain} does not accept mail")).into());
        }

        self.state = MailState::Delivering;
        let mut resolved = false;
        let mut last_error = String::new();

        for mx in exchangers.iter().filter(|mx| !mx.is_null()) {
            let addresses = match self.outbound.resolver.addresses(&mx.exchange).await {
                Ok(addresses) if !addresses.is_empty() => addresses,
                Ok(_) => continue,
                Err(err) => {
                    internal!(level = DEBUG, "Skipping MX {}: {err}", mx.exchange);
                    continue;
                }
            };
            resolved = true;

            for ip in addresses {
                let address = SocketAddr::new(ip, self.outbound.config.port);
                match self.try_address(&mx.exchange, address).await {
                    Ok(accepted) => return Ok(accepted),
                    Err(Route::Next(reason)) => {
                        internal!(level = INFO, "{} [{address}]: {reason}", mx.exchange);
                        last_error = reason;
                    }
                    Err(Route::Stop(failure)) => return Err(failure),
                }
            }
        }

        if resolved {
            Err(DeliveryError::TempFail(format!("Tried all MXs: {last_error}")).into())
        } else {
            Err(DeliveryError::Fatal(format!("No deliverable route to {domain}")).into())
        }
    }

    async fn try_address(&self, host: &str, address: SocketAddr) -> Result<Accepted, Route> {
        let outbound = &self.outbound;
        let key = PoolKey {
            domain: self.file.name.domain.clone(),
            host: host.to_string(),
            address,
        };

        let mut pooled = match outbound
            .pool
            .acquire(&key, || connect(outbound, host, address))
            .await
        {
            Ok(pooled) => pooled,
            Err(PoolError::Saturated(domain)) => {
                return Err(Route::Stop(Failure::Throttled(
                    POOL_RETRY,
                    format!("all connections to {domain} are busy"),
                )));
            }
            Err(PoolError::Client(err)) => return Err(Route::Next(err.to_string())),
        };

        let Some(todo) = self.todo.as_ref() else {
            outbound.pool.destroy(pooled).await;
            return Err(Route::Stop(
                DeliveryError::Fatal("todo was not loaded".to_string()).into(),
            ));
        };

        match self.dialog(todo, &mut pooled).await {
            Ok((response, refused, deferred)) => {
                outbound.pool.release(pooled).await;
                Ok(Accepted {
                    host: host.to_string(),
                    address,
                    response,
                    refused,
                    deferred,
                })
            }
            Err(Dialog::Refused(err)) => {
                outbound.pool.release(pooled).await;
                Err(Route::Stop(err.into()))
            }
            Err(Dialog::Lost(err)) => {
                let reused = pooled.is_reused();
                outbound.pool.destroy(pooled).await;
                if reused {
                    // A pooled connection may have been closed remotely while idle.
                    return Err(Route::Next(format!("pooled connection failed: {err}")));
                }
                Err(Route::Stop(
                    DeliveryError::TempFail(format!("{host} [{address}]: {err}")).into(),
                ))
            }
        }
    }

    /// MAIL, RCPT for each recipient, DATA and the body.
    async fn dialog(
        &self,
        todo: &Todo,
        pooled: &mut PooledClient,
    ) -> Result<(Response, Vec<(String, Response)>, Vec<String>), Dialog> {
        let (_, mut body) = self
            .file
            .open()
            .await
            .map_err(|err| Dialog::Refused(err.into()))?;
        let client = pooled.client();

        if self.outbound.config.enable_xclient && client.supports("XCLIENT") {
            self.xclient(todo, client).await.map_err(Dialog::Lost)?;
        }

        let reply = client.mail_from(&todo.mail_from).await.map_err(Dialog::Lost)?;
        if !reply.is_success() {
            return Err(Dialog::Refused(DeliveryError::from_reply("MAIL FROM", &reply)));
        }

        let mut accepted = 0;
        let mut refused = Vec::new();
        let mut deferred = Vec::new();
        let mut last = None;

        for rcpt in &todo.rcpt_to {
            let reply = client.rcpt_to(rcpt).await.map_err(Dialog::Lost)?;
            if reply.is_success() {
                accepted += 1;
            } else if reply.is_permanent_error() {
                refused.push((rcpt.clone(), reply.clone()));
                last = Some(reply);
            } else {
                deferred.push(rcpt.clone());
                last = Some(reply);
            }
        }

        if accepted == 0 {
            let reply = last.unwrap_or_else(|| Response::new(554, vec!["No recipients".into()]));
            let err = if deferred.is_empty() {
                DeliveryError::from_reply("RCPT TO", &reply)
            } else {
                DeliveryError::TempFail(format!("RCPT TO: {} {}", reply.code, reply.message()))
            };
            return Err(Dialog::Refused(err));
        }

        let reply = client.data().await.map_err(Dialog::Lost)?;
        if reply.code != 354 {
            return Err(Dialog::Refused(DeliveryError::from_reply("DATA", &reply)));
        }

        let reply = client.send_body(&mut body).await.map_err(Dialog::Lost)?;
        if !reply.is_success() {
            return Err(Dialog::Refused(DeliveryError::from_reply(
                "end of data",
                &reply,
            )));
        }

        Ok((reply, refused, deferred))
    }

    /// Hand on the original client address; a refusal is not an error.
    async fn xclient(&self, todo: &Todo, client: &mut SmtpClient) -> Result<(), ClientError> {
        let Some(ip) = todo.notes.get("remote_ip").and_then(|ip| ip.as_str()) else {
            return Ok(());
        };

        let reply = client.xclient(ip, None).await?;
        if reply.is_success() {
            client.hello(&self.outbound.me).await?;
        } else {
            internal!(
                level = DEBUG,
                "{} refused XCLIENT: {} {}",
                client.peer(),
                reply.code,
                reply.message()
            );
        }
        Ok(())
    }

    async fn delivered(&mut self, accepted: Accepted) {
        self.state = MailState::Delivered;
        let uuid = self.todo.as_ref().map_or("", |todo| todo.uuid.as_str()).to_string();

        internal!(
            level = INFO,
            { hmail = %self.file.name, uuid = %uuid },
            "Delivered to {} [{}]: {} {}",
            accepted.host,
            accepted.address,
            accepted.response.code,
            accepted.response.message()
        );
        for (rcpt, reply) in &accepted.refused {
            internal!(
                level = WARN,
                "Recipient {rcpt} bounced by {}: {} {}",
                accepted.host,
                reply.code,
                reply.message()
            );
        }
        if !accepted.deferred.is_empty() {
            self.requeue_recipients(accepted.deferred).await;
        }

        self.hook(
            Hook::Delivered,
            vec![
                accepted.host,
                accepted.address.ip().to_string(),
                accepted.response.code.to_string(),
                accepted.response.message(),
            ],
        )
        .await;

        self.finish().await;
    }

    /// Write recipients that were deferred by the remote into their own
    /// queue file, due after the usual backoff.
    async fn requeue_recipients(&self, recipients: Vec<String>) {
        let Some(todo) = self.todo.as_ref() else {
            return;
        };
        let failures = self.file.name.failures + 1;
        if failures >= self.outbound.config.max_temp_failures {
            internal!(
                level = ERROR,
                "Giving up on {} after {failures} failures",
                recipients.join(", ")
            );
            return;
        }

        let delay = backoff(failures);
        let mut rest = todo.clone();
        rest.rcpt_to = recipients;
        let name = QueueFileName::fresh(&self.outbound.me, self.file.name.domain.clone())
            .retry(failures, delay);

        match self.file.split(name, &rest).await {
            Ok(file) => self.outbound.queue.defer(file, delay),
            Err(err) => internal!(
                level = ERROR,
                "Unable to requeue deferred recipients of {}: {err}",
                self.file.name
            ),
        }
    }

    async fn bounce(&mut self, reason: &str) {
        self.state = MailState::Bounced;

        let outcome = self.hook(Hook::Bounce, vec![reason.to_string()]).await;
        if outcome.code == Code::Ok {
            internal!(level = DEBUG, { hmail = %self.file.name }, "Bounced: {reason}");
        } else {
            internal!(level = ERROR, { hmail = %self.file.name }, "Bounced: {reason}");
        }

        self.finish().await;
    }

    async fn temp_fail(&mut self, reason: &str) {
        let failures = self.file.name.failures + 1;
        if failures >= self.outbound.config.max_temp_failures {
            self.fatal(&format!("Too many failures ({failures}), last: {reason}"))
                .await;
            return;
        }

        let delay = backoff(failures);
        let outcome = self
            .hook(
                Hook::Deferred,
                vec![delay.as_secs().to_string(), reason.to_string()],
            )
            .await;

        if outcome.code == Code::Ok {
            internal!(level = INFO, "Dropping {} at plugin request: {reason}", self.file.name);
            self.state = MailState::Dropped;
            self.finish().await;
            return;
        }
        if outcome.code.is_deny() {
            self.bounce(reason).await;
            return;
        }

        let next = self.file.name.retry(failures, delay);
        if let Err(err) = self.file.rename(next).await {
            internal!(level = ERROR, "Unable to reschedule {}: {err}", self.file.name);
        }

        internal!(
            level = INFO,
            { hmail = %self.file.name, failures, delay_secs = delay.as_secs() },
            "Temporary failure, retrying: {reason}"
        );
        self.state = MailState::Deferred;
        self.forget_notes();
        self.outbound.queue.defer(self.file.clone(), delay);
    }

    async fn fatal(&mut self, reason: &str) {
        self.state = MailState::Fatal;
        internal!(level = ERROR, { hmail = %self.file.name }, "Giving up: {reason}");
        self.finish().await;
    }

    /// Remove the file and forget it.
    async fn finish(&self) {
        if let Err(err) = self.file.remove().await {
            internal!(level = WARN, "Unable to remove {}: {err}", self.file.path.display());
        }
        self.outbound.queue.untrack(&self.file.name);
        self.forget_notes();
    }

    fn forget_notes(&self) {
        if let Some(todo) = self.todo.as_ref() {
            self.outbound.notes.clear(&todo.uuid);
        }
    }

    fn view(&self) -> MailItemView {
        let todo = self.todo.as_ref();
        MailItemView {
            file: self.file.name.to_string(),
            domain: self.file.name.domain.to_string(),
            uuid: todo.map(|todo| todo.uuid.clone()),
            mail_from: todo.map(|todo| todo.mail_from.clone()),
            rcpt_to: todo.map(|todo| todo.rcpt_to.clone()).unwrap_or_default(),
            failures: self.file.name.failures,
        }
    }

    async fn hook(&mut self, hook: Hook, params: Vec<String>) -> Outcome {
        let args = HookArgs::new(
            Subject::MailItem(Box::new(self.view())),
            self.outbound.notes.clone(),
        )
        .with_params(params);

        match self
            .outbound
            .dispatcher
            .run(hook, &mut self.hooks, args)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                internal!(level = ERROR, "{hook} hook for {}: {err}", self.file.name);
                Outcome::default()
            }
        }
    }
}

/// Open, greet and optionally secure a new connection.
async fn connect(
    outbound: &Outbound,
    host: &str,
    address: SocketAddr,
) -> Result<SmtpClient, ClientError> {
    let config = &outbound.config;
    let mut client = SmtpClient::connect(address, host, config.timeouts.clone())
        .await?
        .accept_invalid_certs(config.accept_invalid_certs);

    let greeting = client.read_greeting().await?;
    if !greeting.is_success() {
        return Err(ClientError::Rejected(greeting));
    }

    let hello = client.hello(&outbound.me).await?;
    if !hello.is_success() {
        return Err(ClientError::Rejected(hello));
    }

    if config.enable_tls && client.supports("STARTTLS") {
        let reply = client.starttls().await?;
        if reply.is_success() {
            let hello = client.hello(&outbound.me).await?;
            if !hello.is_success() {
                return Err(ClientError::Rejected(hello));
            }
        } else {
            internal!(
                level = DEBUG,
                "{host} [{address}] refused STARTTLS, continuing in plain text"
            );
        }
    }

    Ok(client)
}

/// Build the metadata plugins see for a queue file that has not been loaded.
#[must_use]
pub fn preview(name: &QueueFileName) -> MailItemView {
    MailItemView {
        file: name.to_string(),
        domain: name.domain.to_string(),
        failures: name.failures,
        ..MailItemView::default()
    }
}
