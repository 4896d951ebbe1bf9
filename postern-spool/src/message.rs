use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use ahash::AHashMap;
use postern_common::internal;
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncWrite, AsyncWriteExt, BufReader},
};

use crate::{
    config::SpoolConfig,
    error::{Result, SpoolError},
    lines::{DeliverOptions, pump, trim_terminator},
};

/// Byte offsets of one MIME boundary within the spooled message.
///
/// `start` is the offset of the first `--token` line, `end` the offset just
/// past the closing `--token--` line (if one was seen).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundarySpan {
    pub start: u64,
    pub end: Option<u64>,
}

/// Enough of the current line to classify it; long lines are never copied in full.
const SCAN_PREFIX: usize = 256;

#[derive(Debug, Default)]
struct Indexer {
    line_start: u64,
    line_len: u64,
    prefix: Vec<u8>,
    in_body: bool,
    header_end: Option<u64>,
    boundaries: AHashMap<String, BoundarySpan>,
}

impl Indexer {
    fn scan(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let (line, rest, complete) = match bytes.iter().position(|&b| b == b'\n') {
                Some(idx) => (&bytes[..=idx], &bytes[idx + 1..], true),
                None => (bytes, &[][..], false),
            };

            let room = SCAN_PREFIX.saturating_sub(self.prefix.len());
            self.prefix.extend_from_slice(&line[..line.len().min(room)]);
            self.line_len += line.len() as u64;

            if complete {
                self.classify();
                self.line_start += self.line_len;
                self.line_len = 0;
                self.prefix.clear();
            }

            bytes = rest;
        }
    }

    fn classify(&mut self) {
        let line = trim_terminator(&self.prefix);
        let line_end = self.line_start + self.line_len;

        if !self.in_body {
            if line.is_empty() {
                self.in_body = true;
                self.header_end = Some(self.line_start);
            }
            return;
        }

        let Some(marker) = line.strip_prefix(b"--") else {
            return;
        };

        let Ok(token) = std::str::from_utf8(marker) else {
            return;
        };
        let token = token.trim_end();

        if token.is_empty() {
            return;
        }

        if let Some(closing) = token.strip_suffix("--")
            && let Some(span) = self.boundaries.get_mut(closing)
        {
            span.end = Some(line_end);
            return;
        }

        self.boundaries
            .entry(token.to_string())
            .or_insert(BoundarySpan {
                start: self.line_start,
                end: None,
            });
    }
}

/// One message body being received, kept in memory until it outgrows the
/// configured threshold and spilled to an exclusively created file after that.
///
/// There is exactly one writer. Once [`finish`](Self::finish) has completed,
/// the message can be read back any number of times with
/// [`deliver`](Self::deliver), one reader at a time.
#[derive(Debug)]
pub struct MessageSpool {
    config: SpoolConfig,
    id: String,
    pending: Vec<u8>,
    memory: Vec<u8>,
    file: Option<File>,
    path: Option<PathBuf>,
    total: u64,
    finished: bool,
    index: Indexer,
    delivering: AtomicBool,
}

struct DeliveryGuard<'a>(&'a AtomicBool);

impl Drop for DeliveryGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl MessageSpool {
    /// `id` becomes part of the spill file name and must be unique per process.
    #[must_use]
    pub fn new(config: SpoolConfig, id: impl Into<String>) -> Self {
        Self {
            config,
            id: id.into(),
            pending: Vec::new(),
            memory: Vec::new(),
            file: None,
            path: None,
            total: 0,
            finished: false,
            index: Indexer::default(),
            delivering: AtomicBool::new(false),
        }
    }

    /// Append bytes to the message.
    ///
    /// Bytes are batched into `chunk_size` writes; a batch that would push the
    /// in-memory size past `threshold` moves the whole message to disk.
    pub async fn append(&mut self, bytes: &[u8]) -> Result<()> {
        if self.finished {
            return Err(SpoolError::AlreadyFinished);
        }

        self.index.scan(bytes);
        self.total += bytes.len() as u64;
        self.pending.extend_from_slice(bytes);

        while self.pending.len() >= self.config.chunk_size.max(1) {
            let rest = self.pending.split_off(self.config.chunk_size.max(1));
            let chunk = std::mem::replace(&mut self.pending, rest);
            self.write_chunk(&chunk).await?;
        }

        Ok(())
    }

    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        if self.file.is_none() && self.memory.len() + chunk.len() <= self.config.threshold {
            self.memory.extend_from_slice(chunk);
            return Ok(());
        }

        if self.file.is_none() {
            self.spill().await?;
        }

        if let Some(file) = self.file.as_mut() {
            file.write_all(chunk).await?;
        }

        Ok(())
    }

    async fn spill(&mut self) -> Result<()> {
        let path = self.config.directory.join(format!("{}.spool", self.id));

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(SpoolError::Collision(path));
            }
            Err(err) => return Err(err.into()),
        };

        internal!(
            level = DEBUG,
            "Spilling message {} to {} after {} bytes",
            self.id,
            path.display(),
            self.memory.len()
        );

        file.write_all(&self.memory).await?;
        self.memory = Vec::new();
        self.file = Some(file);
        self.path = Some(path);

        Ok(())
    }

    /// Mark input complete. Returns once every byte is in memory or synced to disk.
    pub async fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Err(SpoolError::AlreadyFinished);
        }

        let chunk = std::mem::take(&mut self.pending);
        self.write_chunk(&chunk).await?;

        if let Some(file) = self.file.as_mut() {
            file.flush().await?;
            file.sync_all().await?;
        }

        // Indexing works line by line; an unterminated last line still counts.
        if self.index.line_len > 0 {
            self.index.classify();
        }

        self.finished = true;
        Ok(())
    }

    /// Re-emit the message into `dest` as shaped by `options`.
    ///
    /// Only one delivery may run at a time; a concurrent second call fails with
    /// [`SpoolError::AlreadyDelivering`].
    pub async fn deliver<W>(&self, dest: &mut W, options: DeliverOptions) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        if !self.finished {
            return Err(SpoolError::NotFinished);
        }

        if self
            .delivering
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SpoolError::AlreadyDelivering);
        }
        let _guard = DeliveryGuard(&self.delivering);

        let written = match &self.path {
            Some(path) => {
                let mut reader = BufReader::new(File::open(path).await?);
                pump(&mut reader, dest, options).await?
            }
            None => {
                let mut reader = self.memory.as_slice();
                pump(&mut reader, dest, options).await?
            }
        };

        Ok(written)
    }

    /// Total bytes appended so far.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.total
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Offset of the blank line separating headers from the body.
    #[must_use]
    pub const fn header_end(&self) -> Option<u64> {
        self.index.header_end
    }

    /// MIME boundary tokens seen in the body, with their extents.
    #[must_use]
    pub const fn boundaries(&self) -> &AHashMap<String, BoundarySpan> {
        &self.index.boundaries
    }

    /// Path of the spill file, once the message has moved to disk.
    #[must_use]
    pub fn spill_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Drop the message and unlink its spill file.
    pub async fn destroy(mut self) -> Result<()> {
        self.file = None;
        if let Some(path) = self.path.take() {
            tokio::fs::remove_file(&path).await?;
        }

        Ok(())
    }
}

/// A spool dropped without [`MessageSpool::destroy`] unlinks its spill file
/// on the runtime's blocking pool, or inline when no runtime is running.
impl Drop for MessageSpool {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(err) = tokio::fs::remove_file(&path).await {
                        unlink_failed(&path, &err);
                    }
                });
            }
            Err(_) => {
                if let Err(err) = std::fs::remove_file(&path) {
                    unlink_failed(&path, &err);
                }
            }
        }
    }
}

fn unlink_failed(path: &Path, err: &std::io::Error) {
    internal!(
        level = WARN,
        "Unable to remove spool file {}: {err}",
        path.display()
    );
}
