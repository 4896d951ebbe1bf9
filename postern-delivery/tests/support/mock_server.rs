//! A scripted remote MTA for delivery tests.
//!
//! Every connection gets the configured greeting and answers; the server
//! records each command it sees, every message body, and how many
//! connections were opened.
#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use ahash::AHashMap;
use parking_lot::Mutex;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
    time::timeout,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Seen {
    Ehlo(String),
    Helo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    /// The body as received, still dot-stuffed, without the final dot.
    Body(Vec<u8>),
    Rset,
    Quit,
    Other(String),
}

#[derive(Clone, Debug)]
struct Answer {
    code: u16,
    text: String,
}

impl Answer {
    fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    fn line(&self) -> String {
        format!("{} {}\r\n", self.code, self.text)
    }
}

#[derive(Clone, Debug)]
struct Script {
    greeting: Answer,
    capabilities: Vec<String>,
    ehlo_code: u16,
    mail: Answer,
    rcpt: Answer,
    /// Answers for recipients containing the key.
    rcpt_for: AHashMap<String, Answer>,
    data: Answer,
    end_of_data: Answer,
    rset: Answer,
    /// Close the connection after this many commands.
    hang_up_after: Option<usize>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            greeting: Answer::new(220, "mock.test ESMTP"),
            capabilities: vec!["PIPELINING".to_string(), "8BITMIME".to_string()],
            ehlo_code: 250,
            mail: Answer::new(250, "Sender OK"),
            rcpt: Answer::new(250, "Recipient OK"),
            rcpt_for: AHashMap::new(),
            data: Answer::new(354, "Go ahead"),
            end_of_data: Answer::new(250, "Queued as MOCK1"),
            rset: Answer::new(250, "Reset"),
            hang_up_after: None,
        }
    }
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    seen: Arc<Mutex<Vec<Seen>>>,
    connections: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder::default()
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    #[must_use]
    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().clone()
    }

    #[must_use]
    pub fn bodies(&self) -> Vec<Vec<u8>> {
        self.seen
            .lock()
            .iter()
            .filter_map(|seen| match seen {
                Seen::Body(body) => Some(body.clone()),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }

    async fn serve(
        stream: TcpStream,
        script: Arc<Script>,
        seen: Arc<Mutex<Vec<Seen>>>,
    ) -> std::io::Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        let mut commands = 0;

        writer.write_all(script.greeting.line().as_bytes()).await?;

        loop {
            if script.hang_up_after.is_some_and(|limit| commands >= limit) {
                return Ok(());
            }

            line.clear();
            let Ok(read) = timeout(Duration::from_secs(10), reader.read_line(&mut line)).await else {
                return Ok(());
            };
            if read? == 0 {
                return Ok(());
            }
            commands += 1;

            let command = line.trim_end().to_string();
            let (verb, rest) = command.split_once(' ').unwrap_or((command.as_str(), ""));
            let verb = verb.to_ascii_uppercase();

            let (event, reply) = match verb.as_str() {
                "EHLO" => {
                    let mut reply = format!("{}-mock.test\r\n", script.ehlo_code);
                    for (i, capability) in script.capabilities.iter().enumerate() {
                        let sep = if i + 1 == script.capabilities.len() { ' ' } else { '-' };
                        reply.push_str(&format!("{}{sep}{capability}\r\n", script.ehlo_code));
                    }
                    if script.capabilities.is_empty() {
                        reply = format!("{} mock.test\r\n", script.ehlo_code);
                    }
                    (Seen::Ehlo(rest.to_string()), reply)
                }
                "HELO" => (Seen::Helo(rest.to_string()), "250 mock.test\r\n".to_string()),
                "MAIL" => (Seen::MailFrom(rest.to_string()), script.mail.line()),
                "RCPT" => {
                    let answer = script
                        .rcpt_for
                        .iter()
                        .find(|(key, _)| rest.contains(key.as_str()))
                        .map_or(&script.rcpt, |(_, answer)| answer);
                    (Seen::RcptTo(rest.to_string()), answer.line())
                }
                "DATA" => (Seen::Data, script.data.line()),
                "RSET" => (Seen::Rset, script.rset.line()),
                "QUIT" => {
                    seen.lock().push(Seen::Quit);
                    writer.write_all(b"221 Bye\r\n").await?;
                    return Ok(());
                }
                _ => (Seen::Other(command.clone()), "502 Not implemented\r\n".to_string()),
            };

            let reading_body = event == Seen::Data && script.data.code == 354;
            seen.lock().push(event);
            writer.write_all(reply.as_bytes()).await?;

            if reading_body {
                let mut body = Vec::new();
                loop {
                    let mut data = Vec::new();
                    if reader.read_until(b'\n', &mut data).await? == 0 {
                        return Ok(());
                    }
                    if data == b".\r\n" {
                        break;
                    }
                    body.extend_from_slice(&data);
                }
                seen.lock().push(Seen::Body(body));
                writer
                    .write_all(script.end_of_data.line().as_bytes())
                    .await?;
            }
        }
    }
}

impl Drop for MockSmtpServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Default)]
pub struct MockSmtpServerBuilder {
    script: Script,
}

impl MockSmtpServerBuilder {
    #[must_use]
    pub fn with_greeting(mut self, code: u16, text: &str) -> Self {
        self.script.greeting = Answer::new(code, text);
        self
    }

    /// Replace the EHLO keywords advertised after the first line.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.script.capabilities = capabilities.iter().map(ToString::to_string).collect();
        self
    }

    #[must_use]
    pub const fn with_ehlo_code(mut self, code: u16) -> Self {
        self.script.ehlo_code = code;
        self
    }

    #[must_use]
    pub fn with_mail_response(mut self, code: u16, text: &str) -> Self {
        self.script.mail = Answer::new(code, text);
        self
    }

    #[must_use]
    pub fn with_rcpt_response(mut self, code: u16, text: &str) -> Self {
        self.script.rcpt = Answer::new(code, text);
        self
    }

    /// Answer recipients containing `needle` differently from the rest.
    #[must_use]
    pub fn with_rcpt_response_for(mut self, needle: &str, code: u16, text: &str) -> Self {
        self.script
            .rcpt_for
            .insert(needle.to_string(), Answer::new(code, text));
        self
    }

    #[must_use]
    pub fn with_data_response(mut self, code: u16, text: &str) -> Self {
        self.script.data = Answer::new(code, text);
        self
    }

    #[must_use]
    pub fn with_end_of_data_response(mut self, code: u16, text: &str) -> Self {
        self.script.end_of_data = Answer::new(code, text);
        self
    }

    #[must_use]
    pub fn with_rset_response(mut self, code: u16, text: &str) -> Self {
        self.script.rset = Answer::new(code, text);
        self
    }

    #[must_use]
    pub const fn hang_up_after(mut self, commands: usize) -> Self {
        self.script.hang_up_after = Some(commands);
        self
    }

    pub async fn build(self) -> std::io::Result<MockSmtpServer> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let script = Arc::new(self.script);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let task = tokio::spawn({
            let seen = Arc::clone(&seen);
            let connections = Arc::clone(&connections);
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::Relaxed);
                    let script = Arc::clone(&script);
                    let seen = Arc::clone(&seen);
                    tokio::spawn(async move {
                        if let Err(err) = MockSmtpServer::serve(stream, script, seen).await {
                            tracing::debug!("Mock server connection error: {err}");
                        }
                    });
                }
            }
        });

        Ok(MockSmtpServer {
            addr,
            seen,
            connections,
            task,
        })
    }
}
