use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::error::SpoolError;

/// Configuration for in-flight message spooling
///
/// ```ron
/// spool: (
///     directory: "/var/spool/postern/tmp",
///     threshold: 1048576,
/// )
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct SpoolConfig {
    /// Where spill files are created once a message outgrows `threshold`
    #[serde(default = "default_directory")]
    pub directory: PathBuf,

    /// Bytes kept in memory before spilling to disk
    #[serde(default = "default_threshold")]
    pub threshold: usize,

    /// Size of the write batches handed to the write path
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_directory() -> PathBuf {
    PathBuf::from("/var/spool/postern/tmp")
}

const fn default_threshold() -> usize {
    1024 * 1024
}

const fn default_chunk_size() -> usize {
    64 * 1024
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            threshold: default_threshold(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl SpoolConfig {
    /// Config rooted at `directory` with default sizes
    #[must_use]
    pub fn in_directory(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    #[must_use]
    pub const fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Check the directory and sizes, creating the directory if needed.
    pub fn init(&self) -> Result<(), SpoolError> {
        if self.chunk_size == 0 {
            return Err(SpoolError::InvalidConfiguration(
                "chunk_size must be non-zero".to_string(),
            ));
        }

        validate_path(&self.directory)?;
        std::fs::create_dir_all(&self.directory)?;

        Ok(())
    }
}

/// Reject directory traversal and system directories for spool-like paths.
pub fn validate_path(path: &Path) -> Result<(), SpoolError> {
    if path.components().any(|c| c == Component::ParentDir) {
        return Err(SpoolError::InvalidConfiguration(format!(
            "Spool path cannot contain '..' components: {}",
            path.display()
        )));
    }

    let sensitive_prefixes = [
        "/etc", "/bin", "/sbin", "/usr/bin", "/usr/sbin", "/boot", "/sys", "/proc", "/dev",
    ];

    if let Some(prefix) = sensitive_prefixes.iter().find(|p| path.starts_with(p)) {
        return Err(SpoolError::InvalidConfiguration(format!(
            "Spool path cannot be in system directory {prefix}: {}",
            path.display()
        )));
    }

    Ok(())
}
