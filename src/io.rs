//! Line-oriented buffered reads over an async byte stream.
//!
//! Mirrors the safe-I/O helper the rest of the proxy is built on: a single
//! read-ahead buffer shared between line reads and fixed-length reads so the
//! two can be interleaved on the same socket without losing bytes.

use bytes::{Bytes, BytesMut};
use std::io::{self, ErrorKind};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Initial capacity for the read-ahead buffer. Grows as needed past this.
const READAHEAD_CAPACITY: usize = 4096;

/// A stateful line/byte reader bound to an `AsyncRead` stream.
pub struct LineReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READAHEAD_CAPACITY),
        }
    }

    /// Returns the next line up through and including its terminating `\n`,
    /// or up to `max - 1` bytes if no `\n` appears first. An empty return
    /// means the stream hit EOF before any bytes were read.
    pub async fn read_line(&mut self, max: usize) -> io::Result<Bytes> {
        loop {
            if let Some(pos) = self.buf[..self.buf.len().min(max)]
                .iter()
                .position(|&b| b == b'\n')
            {
                return Ok(self.buf.split_to(pos + 1).freeze());
            }

            if self.buf.len() >= max.saturating_sub(1) {
                let take = max.saturating_sub(1).min(self.buf.len());
                return Ok(self.buf.split_to(take).freeze());
            }

            if self.fill().await? == 0 {
                if self.buf.is_empty() {
                    return Ok(Bytes::new());
                }
                let rest = self.buf.split_to(self.buf.len());
                return Ok(rest.freeze());
            }
        }
    }

    /// Returns exactly `n` bytes, retrying short reads until satisfied.
    /// EOF before `n` bytes have been accumulated is an error.
    pub async fn read_n(&mut self, n: usize) -> io::Result<Bytes> {
        while self.buf.len() < n {
            if self.fill().await? == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "stream closed before requested length was read",
                ));
            }
        }
        Ok(self.buf.split_to(n).freeze())
    }

    /// Reads more bytes from the underlying stream into the read-ahead
    /// buffer, retrying transient interruptions. Returns 0 on EOF.
    async fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; READAHEAD_CAPACITY];
        loop {
            match self.inner.read(&mut chunk).await {
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    return Ok(n);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
