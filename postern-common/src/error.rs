//! Error types shared by the protocol listeners and sessions.

use std::io;

use thiserror::Error;

/// Errors raised while validating a listener's configuration at startup.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    #[error("I/O error during validation: {0}")]
    Io(#[from] io::Error),
}

/// Errors that end a single SMTP session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection error: {0}")]
    Connection(#[from] io::Error),

    /// A command handler failed; the client has been sent a 500 reply.
    #[error("Command handler failed: {0}")]
    Handler(String),

    #[error("Shutdown requested")]
    Shutdown,

    #[error("Session timed out after {0} seconds")]
    Timeout(u64),
}

impl SessionError {
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }

    /// Returns `true` if the peer caused the failure
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Timeout(_))
    }
}

/// Errors from the accept loop.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Failed to bind to {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to accept connection: {0}")]
    AcceptFailed(#[from] io::Error),
}
