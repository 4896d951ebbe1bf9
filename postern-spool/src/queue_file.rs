//! Outbound queue files.
//!
//! A queue file is `[u32 big-endian N][N bytes of JSON todo][message bytes]`,
//! named `<next_ms>_<failures>_<pid>_<uniq>.<host>@<domain>`. Files are
//! written under a leading-dot name and renamed into place once synced, so a
//! directory scan never sees a partial file.

use std::{
    fmt::{self, Display},
    path::{Path, PathBuf},
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use postern_common::{Domain, internal};
use serde::{Deserialize, Serialize};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader},
};

use crate::{
    error::QueueFileError,
    lines::DeliverOptions,
    message::MessageSpool,
};

/// Refuse to allocate for absurd header lengths read from a corrupt file.
const MAX_TODO_LEN: u32 = 16 * 1024 * 1024;

/// Everything about a queued message except its bytes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Todo {
    pub uuid: String,
    pub mail_from: String,
    pub rcpt_to: Vec<String>,
    pub domain: Domain,
    #[serde(default)]
    pub notes: serde_json::Map<String, serde_json::Value>,
    /// Milliseconds since the epoch at which the message was first queued.
    #[serde(default)]
    pub queue_time: u64,
}

impl Todo {
    #[must_use]
    pub fn new(
        uuid: impl Into<String>,
        mail_from: impl Into<String>,
        rcpt_to: Vec<String>,
        domain: Domain,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            mail_from: mail_from.into(),
            rcpt_to,
            domain,
            notes: serde_json::Map::new(),
            queue_time: now_ms(),
        }
    }
}

#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

static UNIQ: AtomicU64 = AtomicU64::new(0);

/// Parsed form of a queue file name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueueFileName {
    pub next_process: u64,
    pub failures: u32,
    pub pid: u32,
    pub uniq: u64,
    pub host: String,
    pub domain: Domain,
}

impl QueueFileName {
    /// A fresh name for a message due now, unique within this process.
    #[must_use]
    pub fn fresh(host: &str, domain: Domain) -> Self {
        Self {
            next_process: now_ms(),
            failures: 0,
            pid: std::process::id(),
            uniq: UNIQ.fetch_add(1, Ordering::Relaxed),
            host: sanitise_host(host),
            domain,
        }
    }

    /// The same file rescheduled after another failure.
    #[must_use]
    pub fn retry(&self, failures: u32, delay: Duration) -> Self {
        Self {
            next_process: now_ms() + u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            failures,
            ..self.clone()
        }
    }

    /// In-progress writes start with a dot and are never picked up.
    #[must_use]
    pub fn is_temporary(name: &str) -> bool {
        name.starts_with('.')
    }

    /// Time left until the file is due, if it is in the future.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.next_process
            .checked_sub(now_ms())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

/// Keep separators out of the host part so the name stays parseable.
fn sanitise_host(host: &str) -> String {
    host.replace('/', "\\057")
        .replace(':', "\\072")
        .replace('_', "\\137")
        .replace('@', "\\100")
}

impl Display for QueueFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}.{}@{}",
            self.next_process, self.failures, self.pid, self.uniq, self.host, self.domain
        )
    }
}

impl FromStr for QueueFileName {
    type Err = QueueFileError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let invalid = || QueueFileError::InvalidName(name.to_string());

        let (prefix, domain) = name.rsplit_once('@').ok_or_else(invalid)?;
        let (numbers, host) = prefix.split_once('.').ok_or_else(invalid)?;

        let mut parts = numbers.split('_');
        let mut next = || parts.next().ok_or_else(invalid);

        let next_process = next()?.parse().map_err(|_| invalid())?;
        let failures = next()?.parse().map_err(|_| invalid())?;
        let pid = next()?.parse().map_err(|_| invalid())?;
        let uniq = next()?.parse().map_err(|_| invalid())?;

        if parts.next().is_some() || domain.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            next_process,
            failures,
            pid,
            uniq,
            host: host.to_string(),
            domain: Domain::new(domain),
        })
    }
}

/// Length prefix followed by the JSON todo.
fn encode(todo: &Todo) -> Result<Vec<u8>, QueueFileError> {
    let header = serde_json::to_vec(todo)?;
    let len = u32::try_from(header.len())
        .ok()
        .filter(|len| *len <= MAX_TODO_LEN)
        .ok_or(QueueFileError::HeaderTooLarge(header.len() as u64))?;

    let mut encoded = Vec::with_capacity(4 + header.len());
    encoded.extend_from_slice(&len.to_be_bytes());
    encoded.extend_from_slice(&header);
    Ok(encoded)
}

/// Exclusively create the dot-prefixed temporary file for `name`.
async fn create(directory: &Path, name: &QueueFileName) -> Result<(PathBuf, File), QueueFileError> {
    let temp = directory.join(format!(".{name}"));
    match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp)
        .await
    {
        Ok(file) => Ok((temp, file)),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            Err(QueueFileError::Collision(temp))
        }
        Err(err) => Err(err.into()),
    }
}

/// A queue file on disk.
#[derive(Clone, Debug)]
pub struct QueueFile {
    pub name: QueueFileName,
    pub path: PathBuf,
}

impl QueueFile {
    #[must_use]
    pub fn new(directory: &Path, name: QueueFileName) -> Self {
        Self {
            path: directory.join(name.to_string()),
            name,
        }
    }

    /// Write `todo` and the spooled message as a new queue file.
    ///
    /// The file is created exclusively under a dot-prefixed name, synced,
    /// and then renamed into place.
    #[tracing::instrument(level = "trace", skip_all, fields(name = %name))]
    pub async fn write(
        directory: &Path,
        name: QueueFileName,
        todo: &Todo,
        message: &MessageSpool,
    ) -> Result<Self, QueueFileError> {
        let header = encode(todo)?;
        let (temp, mut file) = create(directory, &name).await?;

        let written = async {
            file.write_all(&header).await?;
            message.deliver(&mut file, DeliverOptions::raw()).await?;
            Ok::<_, QueueFileError>(())
        }
        .await;

        Self::commit(directory, name, temp, file, written).await
    }

    /// Copy this file's message into a new queue file carrying `todo`.
    #[tracing::instrument(level = "trace", skip_all, fields(from = %self.name, name = %name))]
    pub async fn split(&self, name: QueueFileName, todo: &Todo) -> Result<Self, QueueFileError> {
        let directory = self.path.parent().map(Path::to_path_buf).unwrap_or_default();
        let header = encode(todo)?;
        let (_, mut body) = self.open().await?;
        let (temp, mut file) = create(&directory, &name).await?;

        let written = async {
            file.write_all(&header).await?;
            tokio::io::copy_buf(&mut body, &mut file).await?;
            Ok::<_, QueueFileError>(())
        }
        .await;

        Self::commit(&directory, name, temp, file, written).await
    }

    /// Sync and rename a finished temporary file, or remove it after a failure.
    async fn commit(
        directory: &Path,
        name: QueueFileName,
        temp: PathBuf,
        file: File,
        written: Result<(), QueueFileError>,
    ) -> Result<Self, QueueFileError> {
        let written = match written {
            Ok(()) => file.sync_all().await.map_err(QueueFileError::from),
            Err(err) => Err(err),
        };
        drop(file);

        if let Err(err) = written {
            if let Err(cleanup) = tokio::fs::remove_file(&temp).await {
                internal!(
                    level = WARN,
                    "Unable to remove partial queue file {}: {cleanup}",
                    temp.display()
                );
            }
            return Err(err);
        }

        let queued = Self::new(directory, name);
        tokio::fs::rename(&temp, &queued.path).await?;

        internal!(level = DEBUG, "Queued {}", queued.path.display());
        Ok(queued)
    }

    /// Read only the todo header.
    pub async fn read_todo(&self) -> Result<Todo, QueueFileError> {
        let (todo, _) = self.open().await?;
        Ok(todo)
    }

    /// Read the todo header and return a reader positioned at the message bytes.
    pub async fn open(&self) -> Result<(Todo, BufReader<File>), QueueFileError> {
        let mut file = File::open(&self.path).await?;

        let len = file.read_u32().await?;
        if len > MAX_TODO_LEN {
            return Err(QueueFileError::HeaderTooLarge(u64::from(len)));
        }

        let mut header = vec![0; len as usize];
        file.read_exact(&mut header).await?;
        let todo = serde_json::from_slice(&header)?;

        file.seek(std::io::SeekFrom::Start(4 + u64::from(len)))
            .await?;

        Ok((todo, BufReader::new(file)))
    }

    /// Move the file to its retry name.
    pub async fn rename(&mut self, name: QueueFileName) -> Result<(), QueueFileError> {
        let path = self.path.with_file_name(name.to_string());
        tokio::fs::rename(&self.path, &path).await?;

        self.path = path;
        self.name = name;
        Ok(())
    }

    pub async fn remove(&self) -> Result<(), QueueFileError> {
        Ok(tokio::fs::remove_file(&self.path).await?)
    }
}
