//! Framed IPC primitives for worker communication.
//!
//! Frames are a big-endian `u32` byte count followed by the payload. Both
//! pipe ends run through tokio, so reads and writes never block the
//! scheduler.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame payload (64 MiB). A prefix above this is
/// treated as protocol corruption rather than an allocation request.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Reads length-prefixed frames from a byte stream.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read one frame. Returns `None` on EOF at a frame boundary; EOF in the
    /// middle of a frame is reported the same way, since a torn frame and a
    /// closed pipe are handled identically by callers.
    pub async fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        let len = match self.inner.read_u32().await {
            Ok(len) => len,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        };
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame length {} exceeds maximum {}", len, MAX_FRAME_LEN),
            ));
        }
        let mut payload = vec![0u8; len as usize];
        match self.inner.read_exact(&mut payload).await {
            Ok(_) => Ok(Some(payload)),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Writes length-prefixed frames to a byte stream.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write one frame (length prefix plus payload) and flush.
    pub async fn write_frame(&mut self, payload: &[u8]) -> io::Result<()> {
        if payload.len() > MAX_FRAME_LEN as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "frame payload {} exceeds maximum {}",
                    payload.len(),
                    MAX_FRAME_LEN
                ),
            ));
        }
        self.inner.write_u32(payload.len() as u32).await?;
        self.inner.write_all(payload).await?;
        self.inner.flush().await
    }
}
