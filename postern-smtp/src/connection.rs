use std::{
    fs::File,
    io::BufReader,
    path::Path,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use postern_common::{internal, tracing};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        ServerConfig, ServerConnection,
        pki_types::{CertificateDer, PrivateKeyDer},
    },
    server::TlsStream,
};

use crate::{
    config::TlsContext,
    error::{TlsError, TlsResult},
};

/// Negotiated parameters of an upgraded connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsInfo {
    pub protocol: String,
    pub cipher: String,
}

impl TlsInfo {
    fn of(conn: &ServerConnection) -> Self {
        Self {
            protocol: conn
                .protocol_version()
                .and_then(|version| version.as_str())
                .unwrap_or_default()
                .to_string(),
            cipher: conn
                .negotiated_cipher_suite()
                .and_then(|suite| suite.suite().as_str())
                .unwrap_or_default()
                .to_string(),
        }
    }
}

/// The byte stream under a session, before or after STARTTLS.
pub enum Connection<Stream> {
    Plain(Stream),
    Tls(Box<TlsStream<Stream>>),
    /// Left behind while a handshake owns the stream, and after one fails.
    Detached,
}

impl<Stream> Connection<Stream>
where
    Stream: AsyncRead + AsyncWrite + Unpin + Send,
{
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    pub(crate) fn load_certs(path: &Path) -> std::io::Result<Vec<CertificateDer<'static>>> {
        rustls_pemfile::certs(&mut BufReader::new(File::open(path)?)).collect()
    }

    pub(crate) fn load_key(path: &Path) -> TlsResult<PrivateKeyDer<'static>> {
        let path_str = path.display().to_string();
        let mut reader = BufReader::new(File::open(path).map_err(|e| TlsError::KeyLoad {
            path: path_str.clone(),
            reason: e.to_string(),
        })?);

        match rustls_pemfile::read_one(&mut reader).map_err(|e| TlsError::KeyLoad {
            path: path_str.clone(),
            reason: e.to_string(),
        })? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => Ok(PrivateKeyDer::Pkcs1(key)),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => Ok(PrivateKeyDer::Pkcs8(key)),
            Some(rustls_pemfile::Item::Sec1Key(key)) => Ok(PrivateKeyDer::Sec1(key)),
            _ => Err(TlsError::KeyLoad {
                path: path_str,
                reason: "Unable to determine key file format (expected PKCS1, PKCS8, or SEC1)"
                    .to_string(),
            }),
        }
    }

    /// Build an acceptor from the certificate and key on disk.
    pub fn acceptor(context: &TlsContext) -> TlsResult<TlsAcceptor> {
        let certs =
            Self::load_certs(&context.certificate).map_err(|e| TlsError::CertificateLoad {
                path: context.certificate.display().to_string(),
                source: e,
            })?;
        let key = Self::load_key(&context.key)?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    /// Run the server side of a TLS handshake on a plain connection.
    ///
    /// On failure the connection is left detached and unusable.
    #[tracing::instrument(level = "trace", skip_all, err)]
    pub async fn upgrade(&mut self, context: &TlsContext) -> TlsResult<TlsInfo> {
        internal!(level = DEBUG, "Upgrading connection ...");

        let acceptor = Self::acceptor(context)?;

        let Self::Plain(stream) = std::mem::replace(self, Self::Detached) else {
            return Err(TlsError::UpgradeFailed(
                "connection is not plaintext".to_string(),
            ));
        };

        let stream = acceptor.accept(stream).await?;
        let info = TlsInfo::of(stream.get_ref().1);
        *self = Self::Tls(Box::new(stream));

        Ok(info)
    }
}

fn detached() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::NotConnected, "connection is detached")
}

impl<Stream: AsyncRead + AsyncWrite + Unpin> AsyncRead for Connection<Stream> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            Self::Detached => Poll::Ready(Err(detached())),
        }
    }
}

impl<Stream: AsyncRead + AsyncWrite + Unpin> AsyncWrite for Connection<Stream> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            Self::Detached => Poll::Ready(Err(detached())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            Self::Detached => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            Self::Detached => Poll::Ready(Ok(())),
        }
    }
}
