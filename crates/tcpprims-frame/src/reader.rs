use std::io::{ErrorKind, Read};

use bytes::{Bytes, BytesMut};
use tracing::warn;

use crate::codec::{read_length, FrameConfig, HEADER_SIZE};
use crate::error::{FrameError, Result};

const READ_CHUNK_SIZE: usize = 8 * 1024;
const MAX_PREALLOC: usize = 64 * 1024;

/// Reads complete frames from any blocking `Read` stream.
///
/// Handles partial reads internally: callers always get complete payloads.
pub struct FrameReader<T> {
    inner: T,
    config: FrameConfig,
}

impl<T: Read> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self { inner, config }
    }

    /// Read the next complete payload (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when end-of-stream falls on
    /// a frame boundary and `Err(FrameError::Truncated { .. })` when it cuts a
    /// frame short. The length bound is enforced before any payload buffer is
    /// reserved.
    pub fn read_frame(&mut self) -> Result<Bytes> {
        let mut header = [0u8; HEADER_SIZE];
        let got = read_full(&mut self.inner, &mut header)?;
        if got == 0 {
            return Err(FrameError::ConnectionClosed);
        }
        if got < HEADER_SIZE {
            return Err(FrameError::Truncated {
                expected: HEADER_SIZE,
                received: got,
            });
        }

        let len = read_length(&header);
        if len > self.config.max_payload_size {
            warn!(
                size = len,
                max = self.config.max_payload_size,
                "rejecting oversized frame"
            );
            return Err(FrameError::PayloadTooLarge {
                size: len,
                max: self.config.max_payload_size,
            });
        }

        let mut payload = BytesMut::with_capacity(len.min(MAX_PREALLOC));
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        while payload.len() < len {
            let want = (len - payload.len()).min(READ_CHUNK_SIZE);
            let n = read_full(&mut self.inner, &mut chunk[..want])?;
            payload.extend_from_slice(&chunk[..n]);
            if n < want {
                return Err(FrameError::Truncated {
                    expected: HEADER_SIZE + len,
                    received: HEADER_SIZE + payload.len(),
                });
            }
        }

        Ok(payload.freeze())
    }

    /// Read frames until the stream ends, handing each payload to `on_frame`.
    ///
    /// Returns `Ok(())` for an orderly end-of-stream on a frame boundary and
    /// the terminating error otherwise.
    pub fn for_each_frame(&mut self, mut on_frame: impl FnMut(Bytes)) -> Result<()> {
        loop {
            match self.read_frame() {
                Ok(payload) => on_frame(payload),
                Err(FrameError::ConnectionClosed) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum payload size for subsequent frame decoding.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.config.max_payload_size = max_payload_size;
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

/// Fill `buf` from `reader`, looping over short reads.
///
/// Returns fewer than `buf.len()` bytes only when the stream ended.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0usize;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(FrameError::Io(err)),
        }
    }
    Ok(filled)
}
