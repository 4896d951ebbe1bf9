//! SMTP client used for outbound delivery.

use std::{
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures_util::FutureExt;
use postern_common::{incoming, internal, outgoing};
use postern_spool::{DeliverOptions, lines::pump};
use tokio::{
    io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::TcpStream,
};
use tokio_rustls::{
    TlsConnector,
    rustls::{ClientConfig, RootCertStore, pki_types::ServerName},
};

use super::{
    error::{ClientError, Result},
    response::Response,
};
use crate::config::ClientTimeouts;

const BUFFER_SIZE: usize = 8192;

/// Maximum size of the read buffer to prevent unbounded growth (1MB).
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

enum ClientConnection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl ClientConnection {
    async fn upgrade_to_tls(self, server_name: &str, accept_invalid_certs: bool) -> Result<Self> {
        let Self::Plain(stream) = self else {
            return Err(ClientError::TlsError("Connection is already TLS".to_string()));
        };

        let mut root_store = RootCertStore::empty();
        let certs = rustls_native_certs::load_native_certs();
        for cert in certs.certs {
            root_store
                .add(cert)
                .map_err(|e| ClientError::TlsError(format!("Failed to add certificate: {e}")))?;
        }
        if !certs.errors.is_empty() {
            internal!(
                level = WARN,
                "Some native certificates could not be loaded: {:?}",
                certs.errors
            );
        }

        let mut config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        // Only for opportunistic STARTTLS towards MX hosts.
        if accept_invalid_certs {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(danger::NoVerifier));
        }

        let connector = TlsConnector::from(Arc::new(config));
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| ClientError::TlsError(format!("Invalid server name: {e}")))?;

        let stream = connector
            .connect(name, stream)
            .await
            .map_err(|e| ClientError::TlsError(e.to_string()))?;

        Ok(Self::Tls(Box::new(stream)))
    }
}

impl AsyncWrite for ClientConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

impl AsyncRead for ClientConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

mod danger {
    use tokio_rustls::rustls::{
        DigitallySignedStruct, SignatureScheme,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, ServerName, UnixTime},
    };

    /// Accepts any certificate.
    #[derive(Debug)]
    pub struct NoVerifier;

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ED25519,
            ]
        }
    }
}

/// One client connection to a remote MTA.
pub struct SmtpClient {
    connection: Option<ClientConnection>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    peer: SocketAddr,
    server_name: String,
    accept_invalid_certs: bool,
    timeouts: ClientTimeouts,
    extensions: Vec<String>,
}

impl SmtpClient {
    /// Open a TCP connection to `peer`.
    ///
    /// `server_name` is the MX host name, used for TLS.
    pub async fn connect(
        peer: SocketAddr,
        server_name: impl Into<String>,
        timeouts: ClientTimeouts,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(timeouts.connect(), TcpStream::connect(peer))
            .await
            .map_err(|_| ClientError::Timeout("connect"))??;

        Ok(Self {
            connection: Some(ClientConnection::Plain(stream)),
            buffer: vec![0; BUFFER_SIZE],
            buffer_pos: 0,
            peer,
            server_name: server_name.into(),
            accept_invalid_certs: false,
            timeouts,
            extensions: Vec::new(),
        })
    }

    /// Accept certificates that do not verify when upgrading with STARTTLS.
    #[must_use]
    pub const fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    #[must_use]
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self.connection, Some(ClientConnection::Tls(_)))
    }

    /// Extensions advertised in the last EHLO reply.
    #[must_use]
    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    #[must_use]
    pub fn supports(&self, keyword: &str) -> bool {
        self.extensions
            .iter()
            .any(|ext| ext.eq_ignore_ascii_case(keyword))
    }

    pub async fn read_greeting(&mut self) -> Result<Response> {
        let timeout = self.timeouts.command();
        self.read_response(timeout, "greeting").await
    }

    pub async fn send_command(&mut self, command: &str) -> Result<()> {
        outgoing!("{command}");
        let connection = self.connection.as_mut().ok_or(ClientError::ConnectionClosed)?;
        connection.write_all(format!("{command}\r\n").as_bytes()).await?;
        connection.flush().await?;
        Ok(())
    }

    /// Send a command and read its reply; error replies come back as `Ok`.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        self.send_command(command).await?;
        let timeout = self.timeouts.command();
        self.read_response(timeout, "command reply").await
    }

    /// `EHLO`, remembering the advertised extensions.
    pub async fn ehlo(&mut self, name: &str) -> Result<Response> {
        let response = self.command(&format!("EHLO {name}")).await?;
        self.extensions = if response.is_success() {
            response.extensions()
        } else {
            Vec::new()
        };
        Ok(response)
    }

    pub async fn helo(&mut self, name: &str) -> Result<Response> {
        self.extensions.clear();
        self.command(&format!("HELO {name}")).await
    }

    /// Greet with EHLO, falling back to HELO when EHLO is refused permanently.
    pub async fn hello(&mut self, name: &str) -> Result<Response> {
        let response = self.ehlo(name).await?;
        if response.is_permanent_error() {
            internal!(
                level = DEBUG,
                "{} refused EHLO ({}), trying HELO",
                self.peer,
                response.code
            );
            return self.helo(name).await;
        }
        Ok(response)
    }

    /// `XCLIENT ADDR=... [NAME=...]`; the caller decides what a refusal means.
    pub async fn xclient(&mut self, addr: &str, name: Option<&str>) -> Result<Response> {
        let command = name.map_or_else(
            || format!("XCLIENT ADDR={addr}"),
            |name| format!("XCLIENT ADDR={addr} NAME={name}"),
        );
        self.command(&command).await
    }

    /// `STARTTLS` and, on a 220, the handshake.
    pub async fn starttls(&mut self) -> Result<Response> {
        let response = self.command("STARTTLS").await?;

        if response.is_success() {
            let connection = self.connection.take().ok_or(ClientError::ConnectionClosed)?;
            self.connection = Some(
                connection
                    .upgrade_to_tls(&self.server_name, self.accept_invalid_certs)
                    .await?,
            );
            self.buffer_pos = 0;
            self.extensions.clear();
        }

        Ok(response)
    }

    pub async fn mail_from(&mut self, from: &str) -> Result<Response> {
        self.command(&format!("MAIL FROM:{from}")).await
    }

    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:{to}")).await
    }

    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA").await
    }

    /// Stream the message body, dot-stuffed and terminated, and read the reply.
    pub async fn send_body<R>(&mut self, body: &mut R) -> Result<Response>
    where
        R: AsyncBufRead + Unpin,
    {
        let timeout = self.timeouts.data();
        let connection = self.connection.as_mut().ok_or(ClientError::ConnectionClosed)?;

        let sent = tokio::time::timeout(timeout, async {
            let sent = pump(body, connection, DeliverOptions::smtp()).await?;
            connection.flush().await?;
            Ok::<_, std::io::Error>(sent)
        })
        .await
        .map_err(|_| ClientError::Timeout("message body"))??;

        internal!(level = DEBUG, "Sent {sent} bytes of message data to {}", self.peer);
        self.read_response(timeout, "end of data reply").await
    }

    pub async fn rset(&mut self) -> Result<Response> {
        self.command("RSET").await
    }

    pub async fn quit(&mut self) -> Result<Response> {
        self.command("QUIT").await
    }

    /// Check an idle connection without waiting.
    ///
    /// Anything readable on an idle SMTP connection (EOF, an error, or an
    /// unsolicited reply such as a 421) means it can no longer be used.
    pub fn is_dead(&mut self) -> bool {
        let Some(connection) = self.connection.as_mut() else {
            return true;
        };

        let mut peek = [0; 1];
        match connection.read(&mut peek).now_or_never() {
            None => false,
            Some(Ok(_) | Err(_)) => true,
        }
    }

    /// Close without QUIT.
    pub async fn shutdown(&mut self) {
        if let Some(mut connection) = self.connection.take()
            && let Err(err) = connection.shutdown().await
        {
            internal!(level = DEBUG, "Error closing connection to {}: {err}", self.peer);
        }
    }

    async fn read_response(&mut self, timeout: Duration, waiting_for: &'static str) -> Result<Response> {
        tokio::time::timeout(timeout, self.read_response_inner())
            .await
            .map_err(|_| ClientError::Timeout(waiting_for))?
    }

    async fn read_response_inner(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) =
                Response::parse_response(&self.buffer[..self.buffer_pos])?
            {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;

                for line in &response.lines {
                    incoming!("{} {line}", response.code);
                }

                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(ClientError::ParseError(format!(
                        "Response too large (exceeds {MAX_BUFFER_SIZE} bytes)"
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let connection = self.connection.as_mut().ok_or(ClientError::ConnectionClosed)?;
            let read = connection.read(&mut self.buffer[self.buffer_pos..]).await?;
            if read == 0 {
                return Err(ClientError::ConnectionClosed);
            }
            self.buffer_pos += read;
        }
    }
}
