//! Inbound sessions driven over an in-memory duplex stream.

use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use postern_common::{Code, Signal, error::SessionError};
use postern_plugins::{
    Dispatcher, Hook, HookArgs, HookRegistry, Plugin, PluginError, Reply, modules::test::Scripted,
};
use postern_smtp::{
    Envelope, HandoffError, QueueHandoff, ServerTimeouts, Session, SessionConfig, SmtpConfig,
};
use postern_spool::{DeliverOptions, SpoolConfig};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream},
    sync::broadcast,
    task::JoinHandle,
};

#[derive(Debug, PartialEq, Eq)]
struct Queued {
    uuid: String,
    mail_from: String,
    rcpt_to: Vec<String>,
    body: Vec<u8>,
}

#[derive(Default)]
struct Recorder {
    queued: Mutex<Vec<Queued>>,
}

#[async_trait]
impl QueueHandoff for Recorder {
    async fn queue_outbound(&self, envelope: Envelope<'_>) -> Result<(), HandoffError> {
        let mut body = Vec::new();
        envelope
            .message
            .deliver(&mut body, DeliverOptions::raw())
            .await
            .map_err(|err| HandoffError(Box::new(err)))?;

        self.queued.lock().unwrap().push(Queued {
            uuid: envelope.uuid.to_string(),
            mail_from: envelope.mail_from.to_string(),
            rcpt_to: envelope.rcpt_to.to_vec(),
            body,
        });
        Ok(())
    }
}

struct Client {
    stream: BufReader<DuplexStream>,
}

impl Client {
    async fn send(&mut self, line: &str) {
        self.stream
            .get_mut()
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.get_mut().write_all(bytes).await.unwrap();
    }

    async fn reply(&mut self) -> (u16, Vec<String>) {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let read = self.stream.read_line(&mut line).await.unwrap();
            assert!(read > 0, "connection closed while waiting for a reply");

            let line = line.trim_end();
            let code = line[..3].parse().unwrap();
            lines.push(line.get(4..).unwrap_or_default().to_string());

            if line.as_bytes().get(3) != Some(&b'-') {
                return (code, lines);
            }
        }
    }

    async fn code(&mut self) -> u16 {
        self.reply().await.0
    }

    async fn is_closed(&mut self) -> bool {
        let mut line = String::new();
        self.stream.read_line(&mut line).await.unwrap() == 0
    }
}

struct Harness {
    client: Client,
    shutdown: broadcast::Sender<Signal>,
    session: JoinHandle<Result<(), SessionError>>,
    _spool: TempDir,
}

fn peer() -> SocketAddr {
    "192.0.2.1:40000".parse().unwrap()
}

fn local() -> SocketAddr {
    "192.0.2.25:25".parse().unwrap()
}

fn registry(plugins: Vec<Arc<dyn Plugin>>) -> Dispatcher {
    let builder = plugins
        .into_iter()
        .fold(HookRegistry::builder(), |builder, plugin| builder.register(plugin));
    Dispatcher::new(Arc::new(builder.build()))
}

fn config(smtp: SmtpConfig, dispatcher: Dispatcher, handoff: Option<Arc<Recorder>>) -> (SessionConfig, TempDir) {
    let spool = tempfile::tempdir().unwrap();
    let mut builder = SessionConfig::builder()
        .with_me("mx.test")
        .with_smtp(smtp)
        .with_spool(SpoolConfig::in_directory(spool.path()))
        .with_dispatcher(dispatcher);
    if let Some(handoff) = handoff {
        builder = builder.with_handoff(handoff);
    }
    (builder.build(), spool)
}

async fn start(config: (SessionConfig, TempDir), relaying: bool) -> Harness {
    start_with(config, relaying, b"").await
}

/// Start a session, with `early` already written by the client.
async fn start_with(config: (SessionConfig, TempDir), relaying: bool, early: &[u8]) -> Harness {
    let (session_config, spool) = config;
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let (shutdown, signal) = broadcast::channel(1);

    client.write_all(early).await.unwrap();

    let session = Session::create(server, peer(), local(), relaying, Arc::new(session_config));
    let session = tokio::spawn(session.run(signal));

    Harness {
        client: Client {
            stream: BufReader::new(client),
        },
        shutdown,
        session,
        _spool: spool,
    }
}

#[tokio::test]
async fn relayed_message_is_queued() {
    let recorder = Arc::new(Recorder::default());
    let mut harness = start(
        config(SmtpConfig::default(), Dispatcher::default(), Some(Arc::clone(&recorder))),
        true,
    )
    .await;
    let client = &mut harness.client;

    assert_eq!(client.code().await, 220);
    client.send("EHLO a").await;
    assert_eq!(client.code().await, 250);
    client.send("MAIL FROM:<a@b>").await;
    assert_eq!(client.code().await, 250);
    client.send("RCPT TO:<c@d>").await;
    assert_eq!(client.code().await, 250);
    client.send("DATA").await;
    assert_eq!(client.code().await, 354);
    client.send_raw(b"Subject: hi\r\n\r\nhello\r\n..dotted\r\n.\r\n").await;

    let (code, message) = client.reply().await;
    assert_eq!(code, 250);
    assert!(message[0].starts_with("Message Queued ("));

    let queued = recorder.queued.lock().unwrap().pop().unwrap();
    assert_eq!(queued.mail_from, "<a@b>");
    assert_eq!(queued.rcpt_to, ["<c@d>"]);
    assert_eq!(queued.body, b"Subject: hi\r\n\r\nhello\r\n.dotted\r\n");
    assert_eq!(message[0], format!("Message Queued ({})", queued.uuid));

    client.send("QUIT").await;
    assert_eq!(client.code().await, 221);
    assert!(client.is_closed().await);
    harness.session.await.unwrap().unwrap();
}

#[tokio::test]
async fn ehlo_lists_capabilities() {
    let plugin = Scripted::new("auth").with_capability("AUTH PLAIN");
    let smtp = SmtpConfig {
        databytes: 1000,
        ..SmtpConfig::default()
    };
    let mut harness = start(config(smtp, registry(vec![Arc::new(plugin)]), None), false).await;
    let client = &mut harness.client;

    assert_eq!(client.code().await, 220);
    client.send("EHLO client.example").await;
    let (code, lines) = client.reply().await;

    assert_eq!(code, 250);
    assert_eq!(
        lines,
        [
            "mx.test Hello client.example [192.0.2.1]",
            "PIPELINING",
            "8BITMIME",
            "SIZE 1000",
            "AUTH PLAIN",
        ]
    );
}

#[tokio::test]
async fn command_sequence_is_enforced() {
    let mut harness = start(config(SmtpConfig::default(), Dispatcher::default(), None), true).await;
    let client = &mut harness.client;

    assert_eq!(client.code().await, 220);
    client.send("HELO").await;
    assert_eq!(client.code().await, 501);
    client.send("MAIL FROM:<a@b>").await;
    assert_eq!(client.code().await, 503);
    client.send("HELO a").await;
    assert_eq!(client.code().await, 250);
    client.send("RCPT TO:<c@d>").await;
    assert_eq!(client.code().await, 503);
    client.send("MAIL FROM:<a@b>").await;
    assert_eq!(client.code().await, 250);
    client.send("MAIL FROM:<a@b>").await;
    assert_eq!(client.code().await, 503);
    client.send("DATA").await;
    assert_eq!(client.code().await, 503);
    client.send("RCPT TO:nobody").await;
    assert_eq!(client.code().await, 501);
    client.send("RSET").await;
    assert_eq!(client.code().await, 250);
    client.send("NOOP").await;
    assert_eq!(client.code().await, 250);
    client.send("VRFY someone").await;
    assert_eq!(client.code().await, 252);
    client.send("HELP").await;
    assert_eq!(client.code().await, 214);
    client.send("STARTTLS").await;
    assert_eq!(client.code().await, 502);
    client.send("WIBBLE").await;
    assert_eq!(client.code().await, 500);
}

#[tokio::test]
async fn unplanned_recipients_are_refused_without_relaying() {
    let mut harness = start(config(SmtpConfig::default(), Dispatcher::default(), None), false).await;
    let client = &mut harness.client;

    assert_eq!(client.code().await, 220);
    client.send("EHLO a").await;
    client.reply().await;
    client.send("MAIL FROM:<a@b>").await;
    assert_eq!(client.code().await, 250);
    client.send("RCPT TO:<c@d>").await;

    assert_eq!(
        client.reply().await,
        (550, vec!["I cannot deliver mail for <c@d>".to_string()])
    );
}

#[tokio::test]
async fn relayed_recipient_needs_a_domain() {
    let recorder = Arc::new(Recorder::default());
    let mut harness = start(
        config(SmtpConfig::default(), Dispatcher::default(), Some(Arc::clone(&recorder))),
        true,
    )
    .await;
    let client = &mut harness.client;

    assert_eq!(client.code().await, 220);
    client.send("EHLO a").await;
    client.reply().await;
    client.send("MAIL FROM:<a@b>").await;
    assert_eq!(client.code().await, 250);
    client.send("RCPT TO:<postmaster>").await;
    assert_eq!(
        client.reply().await,
        (553, vec!["Relaying to <postmaster> requires a domain".to_string()])
    );

    client.send("DATA").await;
    assert_eq!(client.code().await, 503);

    client.send("RCPT TO:<postmaster@d>").await;
    assert_eq!(client.code().await, 250);
    client.send("DATA").await;
    assert_eq!(client.code().await, 354);
    client.send_raw(b"hi\r\n.\r\n").await;
    assert_eq!(client.code().await, 250);
    assert_eq!(recorder.queued.lock().unwrap()[0].rcpt_to, ["<postmaster@d>"]);
}

#[tokio::test]
async fn local_delivery_needs_a_queue_plugin() {
    let plugin = Scripted::new("rcpt_to.in_host_list").on(Hook::Rcpt, Code::Ok);
    let mut harness = start(config(SmtpConfig::default(), registry(vec![Arc::new(plugin)]), None), false).await;
    let client = &mut harness.client;

    assert_eq!(client.code().await, 220);
    client.send("HELO a").await;
    client.send("MAIL FROM:<>").await;
    client.send("RCPT TO:<postmaster>").await;
    client.send("DATA").await;
    assert_eq!(client.code().await, 250);
    assert_eq!(client.code().await, 250);
    assert_eq!(client.code().await, 250);
    assert_eq!(client.code().await, 354);

    client.send_raw(b"hello\r\n.\r\n").await;
    assert_eq!(
        client.reply().await,
        (451, vec!["Queuing declined or disabled, try later".to_string()])
    );
}

#[tokio::test]
async fn bare_line_feed_after_dot_disconnects() {
    let recorder = Arc::new(Recorder::default());
    let mut harness = start(
        config(SmtpConfig::default(), Dispatcher::default(), Some(Arc::clone(&recorder))),
        true,
    )
    .await;
    let client = &mut harness.client;

    assert_eq!(client.code().await, 220);
    client.send("HELO a").await;
    client.send("MAIL FROM:<a@b>").await;
    client.send("RCPT TO:<c@d>").await;
    client.send("DATA").await;
    for expected in [250, 250, 250, 354] {
        assert_eq!(client.code().await, expected);
    }

    client.send_raw(b"hello\r\n.\n").await;
    assert_eq!(client.code().await, 421);
    assert!(client.is_closed().await);
    assert!(recorder.queued.lock().unwrap().is_empty());
}

#[tokio::test]
async fn oversized_message_is_rejected() {
    let smtp = SmtpConfig {
        databytes: 16,
        ..SmtpConfig::default()
    };
    let mut harness = start(config(smtp, Dispatcher::default(), None), true).await;
    let client = &mut harness.client;

    assert_eq!(client.code().await, 220);
    client.send("EHLO a").await;
    client.reply().await;
    client.send("MAIL FROM:<a@b> SIZE=17").await;
    assert_eq!(client.code().await, 552);

    client.send("MAIL FROM:<a@b> SIZE=10").await;
    assert_eq!(client.code().await, 250);
    client.send("RCPT TO:<c@d>").await;
    assert_eq!(client.code().await, 250);
    client.send("DATA").await;
    assert_eq!(client.code().await, 354);

    client.send_raw(b"0123456789\r\n0123456789\r\n").await;
    assert_eq!(
        client.reply().await,
        (552, vec!["Message too big!".to_string()])
    );
    assert!(client.is_closed().await);
}

#[tokio::test]
async fn unterminated_data_cannot_outgrow_databytes() {
    let smtp = SmtpConfig {
        databytes: 16,
        ..SmtpConfig::default()
    };
    let mut harness = start(config(smtp, Dispatcher::default(), None), true).await;
    let client = &mut harness.client;

    assert_eq!(client.code().await, 220);
    client.send("EHLO a").await;
    client.reply().await;
    client.send("MAIL FROM:<a@b>").await;
    assert_eq!(client.code().await, 250);
    client.send("RCPT TO:<c@d>").await;
    assert_eq!(client.code().await, 250);
    client.send("DATA").await;
    assert_eq!(client.code().await, 354);

    client.send_raw(&[b'x'; 32 * 1024]).await;
    assert_eq!(
        client.reply().await,
        (552, vec!["Message too big!".to_string()])
    );
    assert!(client.is_closed().await);
}

#[tokio::test]
async fn data_lines_have_a_maximum_length() {
    let smtp = SmtpConfig {
        databytes: 0,
        max_data_line_length: 64,
        ..SmtpConfig::default()
    };
    let mut harness = start(config(smtp, Dispatcher::default(), None), true).await;
    let client = &mut harness.client;

    assert_eq!(client.code().await, 220);
    client.send("HELO a").await;
    client.reply().await;
    client.send("MAIL FROM:<a@b>").await;
    assert_eq!(client.code().await, 250);
    client.send("RCPT TO:<c@d>").await;
    assert_eq!(client.code().await, 250);
    client.send("DATA").await;
    assert_eq!(client.code().await, 354);

    client.send(&"y".repeat(40)).await;
    client.send(&"z".repeat(100)).await;
    assert_eq!(
        client.reply().await,
        (552, vec!["Line too long".to_string()])
    );
    assert!(client.is_closed().await);
}

#[tokio::test]
async fn long_command_lines_are_refused() {
    let mut harness = start(config(SmtpConfig::default(), Dispatcher::default(), None), true).await;
    let client = &mut harness.client;

    assert_eq!(client.code().await, 220);
    client.send(&format!("HELO {}", "a".repeat(600))).await;
    assert_eq!(client.reply().await, (500, vec!["Line too long".to_string()]));
    assert!(client.is_closed().await);
}

#[tokio::test]
async fn unterminated_command_is_refused_at_the_limit() {
    let mut harness = start(config(SmtpConfig::default(), Dispatcher::default(), None), true).await;
    let client = &mut harness.client;

    assert_eq!(client.code().await, 220);
    client.send("EHLO a").await;
    client.reply().await;
    client.send_raw(&[b'A'; 8 * 1024]).await;
    assert_eq!(client.code().await, 500);
    assert!(client.is_closed().await);
}

#[tokio::test]
async fn denials_carry_the_transaction_id() {
    let plugin = Scripted::new("mail_from.blocklist").answer(Hook::Mail, Code::Deny, "go away");
    let smtp = SmtpConfig {
        deny_includes_uuid: true,
        ..SmtpConfig::default()
    };
    let mut harness = start(config(smtp, registry(vec![Arc::new(plugin)]), None), true).await;
    let client = &mut harness.client;

    assert_eq!(client.code().await, 220);
    client.send("HELO a").await;
    assert_eq!(client.code().await, 250);
    client.send("MAIL FROM:<spam@example.com>").await;

    let (code, lines) = client.reply().await;
    assert_eq!(code, 550);
    assert!(lines[0].starts_with("go away ("));
    assert!(lines[0].ends_with(".1)"));

    client.send("MAIL FROM:<a@b>").await;
    assert_eq!(client.code().await, 550);
}

#[tokio::test]
async fn connect_deny_closes_the_connection() {
    let plugin = Scripted::new("dnsbl").answer(Hook::Connect, Code::Deny, "listed");
    let mut harness = start(config(SmtpConfig::default(), registry(vec![Arc::new(plugin)]), None), false).await;

    assert_eq!(
        harness.client.reply().await,
        (554, vec!["listed".to_string()])
    );
    assert!(harness.client.is_closed().await);
}

#[tokio::test]
async fn shutdown_answers_421() {
    let mut harness = start(config(SmtpConfig::default(), Dispatcher::default(), None), false).await;

    assert_eq!(harness.client.code().await, 220);
    harness.shutdown.send(Signal::Shutdown).unwrap();

    assert_eq!(
        harness.client.reply().await,
        (421, vec!["Server shutting down".to_string()])
    );
    assert!(harness.client.is_closed().await);
    harness.session.await.unwrap().unwrap();
}

#[tokio::test]
async fn idle_data_times_out_with_421() {
    let smtp = SmtpConfig {
        timeouts: ServerTimeouts {
            data_block_secs: 1,
            ..ServerTimeouts::default()
        },
        ..SmtpConfig::default()
    };
    let mut harness = start(config(smtp, Dispatcher::default(), None), true).await;
    let client = &mut harness.client;

    assert_eq!(client.code().await, 220);
    client.send("HELO a").await;
    client.reply().await;
    client.send("MAIL FROM:<a@b>").await;
    assert_eq!(client.code().await, 250);
    client.send("RCPT TO:<c@d>").await;
    assert_eq!(client.code().await, 250);
    client.send("DATA").await;
    assert_eq!(client.code().await, 354);

    assert_eq!(
        client.reply().await,
        (421, vec!["timeout exceeded".to_string()])
    );
    assert!(client.is_closed().await);
    assert!(matches!(
        harness.session.await.unwrap(),
        Err(SessionError::Timeout(1))
    ));
}

struct EarlyTalkerWatch(Arc<AtomicBool>);

#[async_trait]
impl Plugin for EarlyTalkerWatch {
    fn name(&self) -> &str {
        "early_talker_watch"
    }

    fn hooks(&self) -> &[Hook] {
        &[Hook::Ehlo]
    }

    async fn handle(&self, _hook: Hook, args: HookArgs, reply: Reply) -> Result<(), PluginError> {
        let early = args.connection().is_some_and(|conn| conn.early_talker);
        self.0.store(early, Ordering::SeqCst);
        reply.send(Code::Cont);
        Ok(())
    }
}

#[tokio::test]
async fn talking_before_the_greeting_is_flagged() {
    let seen = Arc::new(AtomicBool::new(false));
    let watch = EarlyTalkerWatch(Arc::clone(&seen));
    let smtp = SmtpConfig {
        early_talker_delay_ms: 10,
        ..SmtpConfig::default()
    };

    let mut harness = start_with(
        config(smtp, registry(vec![Arc::new(watch)]), None),
        false,
        b"EHLO early\r\n",
    )
    .await;

    assert_eq!(harness.client.code().await, 220);
    assert_eq!(harness.client.code().await, 250);
    assert!(seen.load(Ordering::SeqCst));
}
