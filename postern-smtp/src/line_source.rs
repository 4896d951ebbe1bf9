use std::io;

use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::LineError;

const READ_SIZE: usize = 8192;

/// Turns a byte stream into complete lines.
///
/// Each line keeps its original terminator. A final line without one is
/// returned as-is once the stream ends.
///
/// With a limit set, a line (terminator included) longer than the limit is
/// an error as soon as that many bytes are buffered, terminator or not.
#[derive(Debug)]
pub struct LineSource<R> {
    reader: R,
    buffer: Vec<u8>,
    limit: Option<usize>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> LineSource<R> {
    pub const fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::new(),
            limit: None,
            eof: false,
        }
    }

    /// Longest line accepted by the following reads; `None` for no limit.
    pub const fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }

    #[must_use]
    pub const fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// The next complete line, or `None` once the stream is exhausted.
    ///
    /// Cancel safe: bytes already read stay buffered for the next call.
    /// After [`LineError::TooLong`] the buffered input is gone.
    pub async fn next_line(&mut self) -> Result<Option<Vec<u8>>, LineError> {
        loop {
            if let Some(line) = self.take_line()? {
                return Ok(Some(line));
            }

            if self.eof {
                return Ok((!self.buffer.is_empty()).then(|| std::mem::take(&mut self.buffer)));
            }

            self.fill().await?;
        }
    }

    /// Read whatever is immediately available without waiting.
    ///
    /// Returns `true` if bytes arrived (or the peer closed).
    pub fn poll_input(&mut self) -> io::Result<bool> {
        if self.eof {
            return Ok(true);
        }

        self.fill().now_or_never().map_or(Ok(false), |read| read.map(|()| true))
    }

    /// Whether input is waiting that has not been handed out yet.
    #[must_use]
    pub fn has_buffered(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Throw away buffered input, e.g. plaintext pipelined before a TLS upgrade.
    pub fn discard_buffered(&mut self) -> usize {
        let discarded = self.buffer.len();
        self.buffer.clear();
        discarded
    }

    pub const fn get_ref(&self) -> &R {
        &self.reader
    }

    pub const fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    fn take_line(&mut self) -> Result<Option<Vec<u8>>, LineError> {
        let end = self.buffer.iter().position(|b| *b == b'\n');
        let len = end.map_or(self.buffer.len(), |end| end + 1);

        if let Some(limit) = self.limit
            && len > limit
        {
            self.buffer.clear();
            return Err(LineError::TooLong(limit));
        }

        Ok(end.map(|end| {
            let rest = self.buffer.split_off(end + 1);
            std::mem::replace(&mut self.buffer, rest)
        }))
    }

    async fn fill(&mut self) -> io::Result<()> {
        let mut chunk = [0; READ_SIZE];
        let read = self.reader.read(&mut chunk).await?;

        if read == 0 {
            self.eof = true;
        } else {
            self.buffer.extend_from_slice(&chunk[..read]);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::io::AsyncWriteExt;

    use super::*;

    async fn collect<R: AsyncRead + Unpin>(source: &mut LineSource<R>) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        while let Some(line) = source.next_line().await.unwrap() {
            lines.push(line);
        }
        lines
    }

    fn expected(lines: &[&str]) -> Vec<Vec<u8>> {
        lines.iter().map(|line| line.as_bytes().to_vec()).collect()
    }

    #[tokio::test]
    async fn any_split_yields_the_same_lines() {
        let input = b"EHLO a\r\nMAIL FROM:<a@b>\nRCPT TO:<c@d>\r\nDATA\r\n";
        let want = expected(&["EHLO a\r\n", "MAIL FROM:<a@b>\n", "RCPT TO:<c@d>\r\n", "DATA\r\n"]);

        for split in [1, 2, 3, 7, 13, input.len()] {
            let (mut client, server) = tokio::io::duplex(64);
            let writer = tokio::spawn(async move {
                for chunk in input.chunks(split) {
                    client.write_all(chunk).await.unwrap();
                    tokio::task::yield_now().await;
                }
            });

            let mut source = LineSource::new(server);
            assert_eq!(collect(&mut source).await, want, "split every {split} bytes");
            writer.await.unwrap();
        }
    }

    #[tokio::test]
    async fn trailing_partial_line_is_flushed_at_close() {
        let mut source = LineSource::new(&b"QUIT\r\nNOOP"[..]);

        assert_eq!(collect(&mut source).await, expected(&["QUIT\r\n", "NOOP"]));
        assert!(source.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_stream_has_no_lines() {
        let mut source = LineSource::new(&b""[..]);
        assert!(source.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn poll_input_sees_early_bytes() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut source = LineSource::new(server);

        assert!(!source.poll_input().unwrap());

        client.write_all(b"EHLO early\r\n").await.unwrap();
        assert!(source.poll_input().unwrap());
        assert!(source.has_buffered());
        assert_eq!(source.next_line().await.unwrap().unwrap(), b"EHLO early\r\n");
    }

    #[tokio::test]
    async fn limit_applies_to_complete_lines() {
        let mut source = LineSource::new(&b"NOOP\r\nEHLO a-rather-long-name\r\n"[..]);
        source.set_limit(Some(8));

        assert_eq!(source.next_line().await.unwrap().unwrap(), b"NOOP\r\n");
        assert!(matches!(source.next_line().await, Err(LineError::TooLong(8))));
        assert!(!source.has_buffered());
    }

    #[tokio::test]
    async fn limit_stops_an_unterminated_line() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let mut source = LineSource::new(server);
        source.set_limit(Some(512));

        let writer = tokio::spawn(async move {
            let junk = vec![b'x'; 1024];
            for _ in 0..64 {
                if client.write_all(&junk).await.is_err() {
                    break;
                }
            }
            client
        });

        assert!(matches!(source.next_line().await, Err(LineError::TooLong(512))));
        drop(source);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn discard_drops_pipelined_input() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"STARTTLS\r\nMAIL FROM:<x@y>\r\n").await.unwrap();

        let mut source = LineSource::new(server);
        assert_eq!(source.next_line().await.unwrap().unwrap(), b"STARTTLS\r\n");
        assert_eq!(source.discard_buffered(), 17);
        assert!(!source.has_buffered());
    }
}
