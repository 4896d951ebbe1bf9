#![allow(clippy::unwrap_used, clippy::expect_used)]

mod support;

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use postern::{Config, Postern};
use postern_delivery::{OutboundConfig, StaticResolver};
use postern_smtp::{ClientTimeouts, ListenerConfig, SmtpConfig, TlsContext, client::SmtpClient};
use postern_spool::{QueueFile, QueueFileName, SpoolConfig};
use pretty_assertions::assert_eq;
use support::sink::Sink;
use tokio::io::AsyncReadExt;

const BODY: &[u8] = b"Subject: hi\r\n\r\nhello\r\n";

fn timeouts() -> ClientTimeouts {
    ClientTimeouts {
        connect_secs: 2,
        command_secs: 5,
        data_secs: 5,
    }
}

fn config(dir: &Path, outbound_port: Option<u16>) -> Config {
    let mut outbound = OutboundConfig::in_directory(dir.join("queue"));
    outbound.enable_tls = false;
    outbound.timeouts = timeouts();
    match outbound_port {
        Some(port) => outbound.port = port,
        None => outbound.disabled = true,
    }

    Config {
        me: Some("postern.test".to_string()),
        listeners: vec![ListenerConfig {
            socket: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            tls: None,
            relay_clients: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
        }],
        smtp: SmtpConfig {
            early_talker_delay_ms: 0,
            ..SmtpConfig::default()
        },
        spool: SpoolConfig::in_directory(dir.join("spool")),
        outbound,
        ..Config::default()
    }
}

fn resolver() -> Arc<StaticResolver> {
    Arc::new(
        StaticResolver::new()
            .with_mx("d", 10, "mx.d")
            .with_host("mx.d", IpAddr::V4(Ipv4Addr::LOCALHOST)),
    )
}

fn queued(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .map(|entry| entry.unwrap())
        .filter(|entry| !QueueFileName::is_temporary(&entry.file_name().to_string_lossy()))
        .map(|entry| entry.path())
        .collect()
}

/// EHLO, MAIL, RCPT and DATA against `addr`, returning each reply code and
/// the final reply text.
async fn send(addr: SocketAddr) -> (Vec<u16>, String) {
    let mut client = SmtpClient::connect(addr, "postern.test", timeouts())
        .await
        .unwrap();

    let mut codes = vec![client.read_greeting().await.unwrap().code];
    codes.push(client.ehlo("a").await.unwrap().code);
    codes.push(client.mail_from("<a@b>").await.unwrap().code);
    codes.push(client.rcpt_to("<c@d>").await.unwrap().code);
    codes.push(client.data().await.unwrap().code);

    let mut body = BODY;
    let reply = client.send_body(&mut body).await.unwrap();
    codes.push(reply.code);

    client.quit().await.unwrap();
    (codes, reply.message())
}

#[tokio::test]
async fn relayed_message_is_queued_with_its_envelope() {
    let dir = tempfile::tempdir().unwrap();
    let queue_dir = dir.path().join("queue");
    std::fs::create_dir_all(&queue_dir).unwrap();

    let running = Postern::new(config(dir.path(), None))
        .with_resolver(resolver())
        .start()
        .await
        .unwrap();
    let addr = running.addresses()[0];

    let (codes, reply) = send(addr).await;
    assert_eq!(codes, vec![220, 250, 250, 250, 354, 250]);
    assert!(reply.contains("Message Queued"), "{reply}");

    let files = queued(&queue_dir);
    assert_eq!(files.len(), 1);

    let name: QueueFileName = files[0]
        .file_name()
        .unwrap()
        .to_string_lossy()
        .parse()
        .unwrap();
    let file = QueueFile::new(&queue_dir, name);
    let (todo, mut reader) = file.open().await.unwrap();
    assert_eq!(todo.mail_from, "<a@b>");
    assert_eq!(todo.rcpt_to, vec!["<c@d>".to_string()]);
    assert_eq!(todo.domain.as_str(), "d");
    assert_eq!(
        todo.notes.get("remote_ip").and_then(|ip| ip.as_str()),
        Some("127.0.0.1")
    );

    let mut body = Vec::new();
    reader.read_to_end(&mut body).await.unwrap();
    assert_eq!(body, BODY);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn relayed_message_reaches_the_remote_mx() {
    let dir = tempfile::tempdir().unwrap();
    let queue_dir = dir.path().join("queue");
    let sink = Sink::start().await.unwrap();

    let running = Postern::new(config(dir.path(), Some(sink.port())))
        .with_resolver(resolver())
        .start()
        .await
        .unwrap();

    let (codes, _) = send(running.addresses()[0]).await;
    assert_eq!(codes.last(), Some(&250));

    let delivered = tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            if !sink.bodies().is_empty() && queued(&queue_dir).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(delivered.is_ok(), "message was not delivered");

    let bodies = sink.bodies();
    assert_eq!(bodies.len(), 1);
    assert!(bodies[0].ends_with(b"hello\r\n"));

    running.stop().await.unwrap();
}

#[tokio::test]
async fn missing_tls_material_fails_startup() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), None);
    config.listeners[0].tls = Some(TlsContext {
        certificate: dir.path().join("missing.crt"),
        key: dir.path().join("missing.key"),
    });

    let started = Postern::new(config).with_resolver(resolver()).start().await;
    let Err(err) = started else {
        panic!("started without a certificate");
    };
    assert!(format!("{err:#}").contains("TLS configuration"));
}

#[tokio::test]
async fn stop_closes_the_listeners() {
    let dir = tempfile::tempdir().unwrap();
    let running = Postern::new(config(dir.path(), None))
        .with_resolver(resolver())
        .start()
        .await
        .unwrap();
    let addr = running.addresses()[0];

    running.stop().await.unwrap();

    let connected = tokio::net::TcpStream::connect(addr).await;
    assert!(connected.is_err());
}
