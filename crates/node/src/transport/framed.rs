//! Async frame I/O over byte streams.
//!
//! [`FrameSource`] and [`FrameSink`] move single frames; [`MessageReader`]
//! and [`MessageWriter`] build whole messages on top of them. The same
//! message layer runs over plain streams, the local-socket ack link and
//! QUIC streams.

use std::future::Future;
use std::time::Duration;

use protocol::error::{ProtocolError, Result};
use protocol::framing::{Frame, FrameAssembler, FrameCodec, FrameHeader, FRAME_HEADER_SIZE};
use protocol::length_prefix::{decode_length, encode_prefixed, LENGTH_PREFIX_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Default number of attempts per frame write.
pub const MAX_WRITE_ATTEMPTS: u32 = 3;

/// Default backoff unit between write attempts.
pub const WRITE_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Yields frames from a transport.
pub trait FrameSource: Send {
    /// Read and verify the next frame.
    fn next_frame(&mut self) -> impl Future<Output = Result<Frame>> + Send;
}

/// Writes frames to a transport.
pub trait FrameSink: Send {
    /// Write one frame.
    fn send_frame(&mut self, frame: &Frame) -> impl Future<Output = Result<()>> + Send;

    /// Flush buffered frames.
    fn flush(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Reads frames from any async byte stream.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
}

impl<R> FrameReader<R> {
    /// Wrap a byte stream.
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Unwrap the byte stream.
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Borrow the byte stream.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }
}

impl<R: AsyncRead + Unpin + Send> FrameSource for FrameReader<R> {
    async fn next_frame(&mut self) -> Result<Frame> {
        let mut raw = [0u8; FRAME_HEADER_SIZE];
        AsyncReadExt::read_exact(&mut self.inner, &mut raw).await?;
        let header = FrameHeader::decode(&raw);
        let len = header.check_length()?;

        let mut body = vec![0u8; len];
        if len > 0 {
            AsyncReadExt::read_exact(&mut self.inner, &mut body).await?;
        }

        let frame = Frame { header, body };
        frame.verify()?;
        debug!(
            frame_no = frame.header.frame_no,
            len,
            last = frame.header.last_frame,
            "Read frame"
        );
        Ok(frame)
    }
}

/// Writes frames to any async byte stream.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
}

impl<W> FrameWriter<W> {
    /// Wrap a byte stream.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Unwrap the byte stream.
    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Borrow the byte stream.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }
}

impl<W: AsyncWrite + Unpin + Send> FrameSink for FrameWriter<W> {
    async fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        AsyncWriteExt::write_all(&mut self.inner, &frame.encode()).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        AsyncWriteExt::flush(&mut self.inner).await?;
        Ok(())
    }
}

/// Retry policy for transient write failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per frame, first included.
    pub max_attempts: u32,
    /// Attempt `n` waits `n * backoff` before retrying.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_WRITE_ATTEMPTS,
            backoff: WRITE_RETRY_BACKOFF,
        }
    }
}

/// Reassembles messages from a frame source.
#[derive(Debug)]
pub struct MessageReader<S> {
    source: S,
    assembler: FrameAssembler,
}

impl<S: FrameSource> MessageReader<S> {
    /// Read messages of at most `max_frames` frames from `source`.
    pub fn new(source: S, max_frames: u64) -> Self {
        Self::with_assembler(source, FrameAssembler::new(max_frames))
    }

    /// Read messages from `source` under the limits of `assembler`.
    pub fn with_assembler(source: S, assembler: FrameAssembler) -> Self {
        Self { source, assembler }
    }

    /// Read the next complete message.
    ///
    /// A stream that ends in the middle of a message is reported as closed;
    /// the partial payload is discarded.
    pub async fn read(&mut self) -> Result<Vec<u8>> {
        loop {
            let frame = self.source.next_frame().await.map_err(|err| {
                match (&err, self.assembler.frames_read()) {
                    (ProtocolError::ConnectionClosed(_), n) if n > 0 => {
                        ProtocolError::ConnectionClosed(format!(
                            "stream ended after {} frames of an incomplete message",
                            n
                        ))
                    }
                    _ => err,
                }
            })?;
            if let Some(message) = self.assembler.push(frame)? {
                return Ok(message);
            }
        }
    }

    /// Unwrap the frame source.
    pub fn into_inner(self) -> S {
        self.source
    }
}

/// Splits messages into frames and writes them to a frame sink.
#[derive(Debug)]
pub struct MessageWriter<K> {
    sink: K,
    codec: FrameCodec,
    retry: RetryPolicy,
}

impl<K: FrameSink> MessageWriter<K> {
    /// Write messages to `sink` using `codec`.
    pub fn new(sink: K, codec: FrameCodec) -> Self {
        Self {
            sink,
            codec,
            retry: RetryPolicy::default(),
        }
    }

    /// Replace the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The codec used for splitting.
    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    /// Write one message under a fresh process id.
    pub async fn write(&mut self, payload: &[u8]) -> Result<()> {
        let frames = self.codec.encode_message(payload)?;
        for frame in &frames {
            self.send_with_retry(frame).await?;
        }
        self.sink.flush().await
    }

    async fn send_with_retry(&mut self, frame: &Frame) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.sink.send_frame(frame).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_temporary() && attempt < self.retry.max_attempts => {
                    warn!(
                        frame_no = frame.header.frame_no,
                        attempt,
                        error = %err,
                        "Frame write failed, retrying"
                    );
                    tokio::time::sleep(self.retry.backoff * attempt).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Borrow the frame sink.
    pub fn sink_mut(&mut self) -> &mut K {
        &mut self.sink
    }

    /// Unwrap the frame sink.
    pub fn into_inner(self) -> K {
        self.sink
    }
}

/// Write `payload` with the 8-byte little-endian length prefix.
pub async fn write_prefixed<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    AsyncWriteExt::write_all(writer, &encode_prefixed(payload)).await?;
    AsyncWriteExt::flush(writer).await?;
    Ok(())
}

/// Read one length-prefixed payload of at most `max` bytes.
pub async fn read_prefixed<R: AsyncRead + Unpin>(reader: &mut R, max: u64) -> Result<Vec<u8>> {
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    AsyncReadExt::read_exact(reader, &mut prefix).await?;
    let len = decode_length(prefix, max)?;

    let mut payload = vec![0u8; len];
    AsyncReadExt::read_exact(reader, &mut payload).await?;
    Ok(payload)
}
