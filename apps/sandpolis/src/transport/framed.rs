//! Length-prefixed framing: an unsigned LEB128 byte count followed by the
//! encoded message body.

use bytes::{Buf, Bytes, BytesMut};
use state_tree::codec::wire::{var_u64_len, write_var_u64};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const DEFAULT_MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

const MAX_PREFIX_LEN: usize = 10;
const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: u64, max: usize },
    #[error("malformed frame length prefix")]
    BadLengthPrefix,
    #[error("connection ended inside a frame")]
    Truncated,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    pub fn reason(&self) -> &'static str {
        match self {
            FrameError::FrameTooLarge { .. } => "too_large",
            FrameError::BadLengthPrefix => "bad_prefix",
            FrameError::Truncated => "truncated",
            FrameError::Io(_) => "io",
        }
    }
}

/// Incremental frame splitter over a byte buffer.
///
/// Bytes are fed with [`FrameDecoder::extend`]; complete bodies come out of
/// [`FrameDecoder::next_frame`] in arrival order.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_len: usize,
}

impl FrameDecoder {
    pub fn new(max_len: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(READ_CHUNK),
            max_len,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        let Some((len, prefix)) = self.peek_length()? else {
            return Ok(None);
        };
        if len > self.max_len as u64 {
            return Err(FrameError::FrameTooLarge {
                len,
                max: self.max_len,
            });
        }
        let len = len as usize;
        if self.buffer.len() < prefix + len {
            return Ok(None);
        }
        self.buffer.advance(prefix);
        Ok(Some(self.buffer.split_to(len).freeze()))
    }

    fn peek_length(&self) -> Result<Option<(u64, usize)>, FrameError> {
        let mut value: u64 = 0;
        for (index, byte) in self.buffer.iter().take(MAX_PREFIX_LEN).enumerate() {
            value |= u64::from(byte & 0x7F) << (7 * index);
            if byte & 0x80 == 0 {
                return Ok(Some((value, index + 1)));
            }
        }
        if self.buffer.len() >= MAX_PREFIX_LEN {
            return Err(FrameError::BadLengthPrefix);
        }
        Ok(None)
    }
}

/// Reads frames from an async byte source.
pub struct FrameReader<R> {
    inner: R,
    decoder: FrameDecoder,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_len: usize) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(max_len),
            chunk: vec![0u8; READ_CHUNK],
        }
    }

    /// Next frame body, or `None` when the peer closed cleanly between frames.
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(Some(frame));
            }
            let read = self.inner.read(&mut self.chunk).await?;
            if read == 0 {
                if self.decoder.buffered() == 0 {
                    return Ok(None);
                }
                return Err(FrameError::Truncated);
            }
            self.decoder.extend(&self.chunk[..read]);
        }
    }
}

/// Writes frames to an async byte sink.
pub struct FrameWriter<W> {
    inner: W,
    max_len: usize,
    scratch: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, max_len: usize) -> Self {
        Self {
            inner,
            max_len,
            scratch: Vec::with_capacity(READ_CHUNK),
        }
    }

    pub async fn send(&mut self, body: &[u8]) -> Result<(), FrameError> {
        if body.len() > self.max_len {
            return Err(FrameError::FrameTooLarge {
                len: body.len() as u64,
                max: self.max_len,
            });
        }
        self.scratch.clear();
        self.scratch.reserve(var_u64_len(body.len() as u64) + body.len());
        write_var_u64(&mut self.scratch, body.len() as u64);
        self.scratch.extend_from_slice(body);
        self.inner.write_all(&self.scratch).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
