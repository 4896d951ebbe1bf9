//! An MTA that accepts everything and keeps the bodies.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};

pub struct Sink {
    addr: SocketAddr,
    bodies: Arc<Mutex<Vec<Vec<u8>>>>,
    task: JoinHandle<()>,
}

impl Sink {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let bodies = Arc::new(Mutex::new(Vec::new()));

        let task = tokio::spawn({
            let bodies = Arc::clone(&bodies);
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let bodies = Arc::clone(&bodies);
                    tokio::spawn(async move {
                        let _ = accept_all(stream, bodies).await;
                    });
                }
            }
        });

        Ok(Self { addr, bodies, task })
    }

    pub const fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn bodies(&self) -> Vec<Vec<u8>> {
        self.bodies.lock().unwrap().clone()
    }
}

impl Drop for Sink {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_all(stream: TcpStream, bodies: Arc<Mutex<Vec<Vec<u8>>>>) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    writer.write_all(b"220 sink.test ESMTP\r\n").await?;

    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok(());
        }

        let verb = line
            .split(|b| *b == b' ' || *b == b'\r')
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();

        match verb.as_slice() {
            b"DATA" => {
                writer.write_all(b"354 Go ahead\r\n").await?;
                let mut body = Vec::new();
                loop {
                    line.clear();
                    if reader.read_until(b'\n', &mut line).await? == 0 {
                        return Ok(());
                    }
                    if line == b".\r\n" {
                        break;
                    }
                    body.extend_from_slice(&line);
                }
                bodies.lock().unwrap().push(body);
                writer.write_all(b"250 Accepted\r\n").await?;
            }
            b"QUIT" => {
                writer.write_all(b"221 Bye\r\n").await?;
                return Ok(());
            }
            _ => writer.write_all(b"250 OK\r\n").await?,
        }
    }
}
