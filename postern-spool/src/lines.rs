//! Line re-emission for spooled messages.
//!
//! Spooled bytes are stored exactly as received (minus transparency dots), and
//! each consumer wants them back in its own shape: CRLF for SMTP, LF for local
//! tools, dot-stuffed and dot-terminated for a DATA phase, or length-prefixed
//! frames for streaming scanner protocols.

use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub enum LineEnding {
    #[default]
    Crlf,
    Lf,
}

impl LineEnding {
    #[must_use]
    pub const fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::Crlf => b"\r\n",
            Self::Lf => b"\n",
        }
    }
}

/// How [`MessageSpool::deliver`](crate::MessageSpool::deliver) shapes its output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeliverOptions {
    /// Rewrite every terminator to this ending; `None` keeps the bytes as spooled.
    pub line_ending: Option<LineEnding>,
    /// Prefix lines starting with `.` with another `.` (RFC 5321 section 4.5.2).
    pub dot_stuffing: bool,
    /// Append the `.` end-of-data line.
    pub ending_dot: bool,
    /// Wrap the output in `[u32 big-endian length][bytes]` frames, closed by a zero-length frame.
    pub chunked: bool,
    /// Output batch size, and the maximum frame size in chunked mode.
    pub chunk_size: usize,
}

impl Default for DeliverOptions {
    fn default() -> Self {
        Self::raw()
    }
}

impl DeliverOptions {
    /// The message bytes exactly as they were spooled.
    #[must_use]
    pub const fn raw() -> Self {
        Self {
            line_ending: None,
            dot_stuffing: false,
            ending_dot: false,
            chunked: false,
            chunk_size: 64 * 1024,
        }
    }

    /// Ready to be written after a `354` reply.
    #[must_use]
    pub const fn smtp() -> Self {
        Self {
            line_ending: Some(LineEnding::Crlf),
            dot_stuffing: true,
            ending_dot: true,
            chunked: false,
            chunk_size: 64 * 1024,
        }
    }

    #[must_use]
    pub const fn with_line_ending(mut self, line_ending: Option<LineEnding>) -> Self {
        self.line_ending = line_ending;
        self
    }

    #[must_use]
    pub const fn with_dot_stuffing(mut self, dot_stuffing: bool) -> Self {
        self.dot_stuffing = dot_stuffing;
        self
    }

    #[must_use]
    pub const fn with_ending_dot(mut self, ending_dot: bool) -> Self {
        self.ending_dot = ending_dot;
        self
    }

    #[must_use]
    pub const fn with_chunked(mut self, chunked: bool) -> Self {
        self.chunked = chunked;
        self
    }

    #[must_use]
    pub const fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

/// Strip a trailing `\n` or `\r\n`.
#[must_use]
pub fn trim_terminator(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

struct Framer<'w, W> {
    dest: &'w mut W,
    buffer: Vec<u8>,
    options: DeliverOptions,
    written: u64,
}

impl<W: AsyncWrite + Unpin> Framer<'_, W> {
    async fn push(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.buffer.extend_from_slice(bytes);
        while self.buffer.len() >= self.options.chunk_size.max(1) {
            let rest = self.buffer.split_off(self.options.chunk_size.max(1));
            let frame = std::mem::replace(&mut self.buffer, rest);
            self.emit(&frame).await?;
        }

        Ok(())
    }

    async fn emit(&mut self, frame: &[u8]) -> std::io::Result<()> {
        if frame.is_empty() {
            return Ok(());
        }

        if self.options.chunked {
            let len = u32::try_from(frame.len()).map_err(std::io::Error::other)?;
            self.dest.write_all(&len.to_be_bytes()).await?;
        }

        self.dest.write_all(frame).await?;
        self.written += frame.len() as u64;

        Ok(())
    }

    async fn finish(mut self) -> std::io::Result<u64> {
        let frame = std::mem::take(&mut self.buffer);
        self.emit(&frame).await?;

        if self.options.chunked {
            self.dest.write_all(&0_u32.to_be_bytes()).await?;
        }

        self.dest.flush().await?;
        Ok(self.written)
    }
}

/// Copy `source` line by line into `dest`, shaped by `options`.
///
/// Returns the number of message bytes written, excluding any frame headers.
pub async fn pump<R, W>(source: &mut R, dest: &mut W, options: DeliverOptions) -> std::io::Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut framer = Framer {
        dest,
        buffer: Vec::with_capacity(options.chunk_size.min(64 * 1024)),
        options,
        written: 0,
    };

    let mut line = Vec::new();
    let mut terminated = true;

    loop {
        line.clear();
        if source.read_until(b'\n', &mut line).await? == 0 {
            break;
        }

        terminated = line.ends_with(b"\n");

        if options.dot_stuffing && line.first() == Some(&b'.') {
            framer.push(b".").await?;
        }

        match options.line_ending {
            Some(ending) => {
                framer.push(trim_terminator(&line)).await?;
                framer.push(ending.as_bytes()).await?;
                terminated = true;
            }
            None => framer.push(&line).await?,
        }
    }

    if options.ending_dot {
        let ending = options.line_ending.unwrap_or_default().as_bytes();
        if !terminated {
            framer.push(ending).await?;
        }
        framer.push(b".").await?;
        framer.push(ending).await?;
    }

    framer.finish().await
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    async fn run(input: &[u8], options: DeliverOptions) -> Vec<u8> {
        let mut source = input;
        let mut out = Vec::new();
        pump(&mut source, &mut out, options).await.unwrap();
        out
    }

    #[tokio::test]
    async fn raw_is_identity() {
        let input = b"Subject: hi\r\n\r\n.leading dot\nbare lf\r\nno newline";
        assert_eq!(run(input, DeliverOptions::raw()).await, input.to_vec());
    }

    #[tokio::test]
    async fn smtp_stuffs_and_terminates() {
        let out = run(b"a\n.b\r\nc", DeliverOptions::smtp()).await;
        assert_eq!(out, b"a\r\n..b\r\nc\r\n.\r\n".to_vec());
    }

    #[tokio::test]
    async fn lf_endings() {
        let options = DeliverOptions::raw().with_line_ending(Some(LineEnding::Lf));
        assert_eq!(run(b"a\r\nb\r\n", options).await, b"a\nb\n".to_vec());
    }

    #[tokio::test]
    async fn chunked_framing() {
        let options = DeliverOptions::raw().with_chunked(true).with_chunk_size(4);
        let out = run(b"abcdefg", options).await;

        assert_eq!(
            out,
            [
                &[0, 0, 0, 4][..],
                b"abcd",
                &[0, 0, 0, 3],
                b"efg",
                &[0, 0, 0, 0],
            ]
            .concat()
        );
    }

    #[test]
    fn terminators() {
        assert_eq!(trim_terminator(b"abc\r\n"), b"abc");
        assert_eq!(trim_terminator(b"abc\n"), b"abc");
        assert_eq!(trim_terminator(b"abc"), b"abc");
    }
}
