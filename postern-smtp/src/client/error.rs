//! Error types for the SMTP client.

use std::io;

use thiserror::Error;

use super::response::Response;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse SMTP response: {0}")]
    ParseError(String),

    /// The server answered with an error code.
    #[error("SMTP error: {} - {}", .0.code, .0.message())]
    Rejected(Response),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    #[error("UTF-8 error: {0}")]
    Utf8Error(#[from] std::str::Utf8Error),
}

impl ClientError {
    /// Whether retrying later could succeed.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        match self {
            Self::Rejected(response) => !response.is_permanent_error(),
            _ => true,
        }
    }
}

/// Specialized `Result` type for SMTP client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
