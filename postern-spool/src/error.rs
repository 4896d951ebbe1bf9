//! Error types for the postern-spool crate.

use std::{io, path::PathBuf};

use thiserror::Error;

/// Errors raised by a [`MessageSpool`](crate::MessageSpool).
#[derive(Debug, Error)]
pub enum SpoolError {
    /// I/O operation failed (spill file create/write/read).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The spill file already existed. Collisions are never retried.
    #[error("Spool file already exists: {}", .0.display())]
    Collision(PathBuf),

    /// A second `deliver` was started while one is still running.
    #[error("Message is already being delivered")]
    AlreadyDelivering,

    #[error("Message input has not been finished")]
    NotFinished,

    #[error("Message input has already been finished")]
    AlreadyFinished,

    #[error("Invalid spool configuration: {0}")]
    InvalidConfiguration(String),
}

/// Errors reading or writing an outbound queue file.
#[derive(Debug, Error)]
pub enum QueueFileError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Queue file already exists: {}", .0.display())]
    Collision(PathBuf),

    #[error("Todo header is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Todo header of {0} bytes exceeds the maximum")]
    HeaderTooLarge(u64),

    #[error("Invalid queue file name: {0}")]
    InvalidName(String),

    #[error("Spool error: {0}")]
    Spool(#[from] SpoolError),
}

/// Specialized `Result` type for spool operations.
pub type Result<T> = std::result::Result<T, SpoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let spool_err = SpoolError::from(io_err);

        assert!(matches!(spool_err, SpoolError::Io(_)));
        assert!(spool_err.to_string().contains("access denied"));
    }

    #[test]
    fn collision_names_the_path() {
        let err = QueueFileError::Collision(PathBuf::from("/var/spool/postern/.1_0_1_1.h@d"));
        assert_eq!(
            err.to_string(),
            "Queue file already exists: /var/spool/postern/.1_0_1_1.h@d"
        );
    }
}
