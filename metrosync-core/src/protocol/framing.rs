//! Length-prefixed framing
//!
//! A frame is a decimal byte count on its own line followed by exactly that
//! many bytes of UTF-8 payload:
//!
//! ```text
//! 57\n
//! {"type":"PlaybackCommand","deviceId":"dev-a",...}\n
//! ```
//!
//! The reader counts bytes, not lines. The newline after the payload is
//! optional on input; blank lines between frames are skipped.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use thiserror::Error;

/// Default upper bound for a single payload
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// Longest accepted length line, newline included
const MAX_LENGTH_LINE: u64 = 20;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Invalid length prefix: {0:?}")]
    InvalidLength(String),

    #[error("Length prefix line exceeds {MAX_LENGTH_LINE} bytes")]
    LengthLineTooLong,

    #[error("Frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Stream ended inside a length prefix")]
    TruncatedPrefix,

    #[error("Stream ended after {received} of {expected} bytes")]
    Truncated { expected: usize, received: usize },

    #[error("Stream read failed: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Whether the error means the stream is out of sync or cut short,
    /// as opposed to an I/O failure underneath it
    pub fn is_protocol_error(&self) -> bool {
        !matches!(self, FrameError::Io(_))
    }
}

/// Reads frames from a byte stream
pub struct FrameReader<R> {
    inner: BufReader<R>,
    max_frame_len: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_frame_len(reader, DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(reader: R, max_frame_len: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            max_frame_len,
        }
    }

    /// Read the next frame's payload bytes.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly between frames.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let len = match self.read_length().await? {
            Some(len) => len,
            None => return Ok(None),
        };

        if len > self.max_frame_len {
            return Err(FrameError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        // A single read may return fewer bytes than asked for
        let mut payload = vec![0u8; len];
        let mut received = 0;
        while received < len {
            let n = self.inner.read(&mut payload[received..]).await?;
            if n == 0 {
                return Err(FrameError::Truncated {
                    expected: len,
                    received,
                });
            }
            received += n;
        }

        Ok(Some(payload))
    }

    async fn read_length(&mut self) -> Result<Option<usize>, FrameError> {
        let mut raw = Vec::new();
        loop {
            raw.clear();
            let n = (&mut self.inner)
                .take(MAX_LENGTH_LINE)
                .read_until(b'\n', &mut raw)
                .await?;

            if n == 0 {
                return Ok(None);
            }

            if raw.last() != Some(&b'\n') {
                if n as u64 >= MAX_LENGTH_LINE {
                    return Err(FrameError::LengthLineTooLong);
                }
                return Err(FrameError::TruncatedPrefix);
            }

            // Garbage in the prefix is a framing error, not an I/O one
            let line = String::from_utf8_lossy(&raw);
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            return trimmed
                .parse::<usize>()
                .map(Some)
                .map_err(|_| FrameError::InvalidLength(trimmed.to_string()));
        }
    }
}

/// Writes frames to a byte stream
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { inner: writer }
    }

    /// Write one frame and flush it
    pub async fn write_frame(&mut self, payload: &str) -> std::io::Result<()> {
        let mut frame = Vec::with_capacity(payload.len() + 24);
        frame.extend_from_slice(payload.len().to_string().as_bytes());
        frame.push(b'\n');
        frame.extend_from_slice(payload.as_bytes());
        frame.push(b'\n');

        // One buffer per frame so a prefix is never separated from its payload
        self.inner.write_all(&frame).await?;
        self.inner.flush().await
    }

    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.inner.shutdown().await
    }
}
