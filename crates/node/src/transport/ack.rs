//! Stop-and-wait acknowledgments for local-socket transports.
//!
//! Every frame is sent as a data record and the writer blocks until the
//! peer answers with an ack record echoing the frame's checksum and number.
//!
//! ```text
//! data: 0x00 ‖ frame
//! ack:  0x01 ‖ checksum: u32 BE ‖ frame_no: u64 BE
//! ```
//!
//! A pump task owns the read half. It acknowledges data records as they
//! arrive and forwards the frames to the [`AckedReceiver`]. Ack records go
//! to the [`AckedSender`] waiting for them. Frames are queued without bound
//! so an idle receiver never stalls ack delivery.

use std::sync::Arc;

use protocol::error::{ProtocolError, Result};
use protocol::framing::Frame;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use super::framed::{FrameReader, FrameSink, FrameSource};

const RECORD_DATA: u8 = 0x00;
const RECORD_ACK: u8 = 0x01;

/// Size of an ack record, tag included.
pub const ACK_RECORD_SIZE: usize = 13;

type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Unpin + Send>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ack {
    checksum: u32,
    frame_no: u64,
}

impl Ack {
    fn for_frame(frame: &Frame) -> Self {
        Self {
            checksum: frame.header.checksum,
            frame_no: frame.header.frame_no,
        }
    }

    fn encode(self) -> [u8; ACK_RECORD_SIZE] {
        let mut out = [0u8; ACK_RECORD_SIZE];
        out[0] = RECORD_ACK;
        out[1..5].copy_from_slice(&self.checksum.to_be_bytes());
        out[5..13].copy_from_slice(&self.frame_no.to_be_bytes());
        out
    }

    fn decode(body: &[u8; ACK_RECORD_SIZE - 1]) -> Self {
        let mut frame_no = [0u8; 8];
        frame_no.copy_from_slice(&body[4..12]);
        Self {
            checksum: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
            frame_no: u64::from_be_bytes(frame_no),
        }
    }
}

/// Split a stream into an acknowledged frame receiver and sender.
///
/// Must be called within a tokio runtime; the pump task is spawned here.
pub fn split_acked<S>(stream: S) -> (AckedReceiver, AckedSender)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let writer: SharedWriter = Arc::new(Mutex::new(Box::new(write_half)));
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let (ack_tx, ack_rx) = mpsc::unbounded_channel();

    let pump = tokio::spawn(pump(
        FrameReader::new(read_half),
        Arc::clone(&writer),
        frame_tx,
        ack_tx,
    ));

    (
        AckedReceiver {
            frames: frame_rx,
            pump,
        },
        AckedSender {
            writer,
            acks: ack_rx,
        },
    )
}

async fn pump<R>(
    mut reader: FrameReader<R>,
    writer: SharedWriter,
    frames: mpsc::UnboundedSender<Result<Frame>>,
    acks: mpsc::UnboundedSender<Ack>,
) where
    R: AsyncRead + Unpin + Send,
{
    let result: Result<()> = async {
        loop {
            let mut tag = [0u8; 1];
            reader.get_mut().read_exact(&mut tag).await?;

            match tag[0] {
                RECORD_DATA => {
                    let frame = reader.next_frame().await?;
                    {
                        let mut w = writer.lock().await;
                        w.write_all(&Ack::for_frame(&frame).encode()).await?;
                        w.flush().await?;
                    }
                    if frames.send(Ok(frame)).is_err() {
                        return Ok(());
                    }
                }
                RECORD_ACK => {
                    let mut body = [0u8; ACK_RECORD_SIZE - 1];
                    reader.get_mut().read_exact(&mut body).await?;
                    if acks.send(Ack::decode(&body)).is_err() {
                        return Ok(());
                    }
                }
                other => {
                    return Err(ProtocolError::MalformedPacket(format!(
                        "unknown local-socket record type {:#04x}",
                        other
                    )))
                }
            }
        }
    }
    .await;

    if let Err(err) = result {
        debug!(error = %err, "Local-socket pump stopped");
        let _ = frames.send(Err(err));
    }
}

/// Receiving half of an acknowledged local-socket link.
#[derive(Debug)]
pub struct AckedReceiver {
    frames: mpsc::UnboundedReceiver<Result<Frame>>,
    pump: JoinHandle<()>,
}

impl FrameSource for AckedReceiver {
    async fn next_frame(&mut self) -> Result<Frame> {
        match self.frames.recv().await {
            Some(result) => result,
            None => Err(ProtocolError::ConnectionClosed(
                "local socket closed".into(),
            )),
        }
    }
}

impl Drop for AckedReceiver {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Sending half of an acknowledged local-socket link.
pub struct AckedSender {
    writer: SharedWriter,
    acks: mpsc::UnboundedReceiver<Ack>,
}

impl AckedSender {
    /// Shut down the write side of the socket.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.lock().await.shutdown().await?;
        Ok(())
    }
}

impl std::fmt::Debug for AckedSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckedSender").finish_non_exhaustive()
    }
}

impl FrameSink for AckedSender {
    async fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        let mut record = Vec::with_capacity(1 + frame.encoded_len());
        record.push(RECORD_DATA);
        record.extend_from_slice(&frame.encode());
        {
            let mut w = self.writer.lock().await;
            w.write_all(&record).await?;
            w.flush().await?;
        }

        let ack = self.acks.recv().await.ok_or_else(|| {
            ProtocolError::ConnectionClosed("local socket closed while awaiting ack".into())
        })?;
        let expected = Ack::for_frame(frame);
        if ack != expected {
            return Err(ProtocolError::AckMismatch(format!(
                "frame {} checksum {:#010x} acknowledged as frame {} checksum {:#010x}",
                expected.frame_no, expected.checksum, ack.frame_no, ack.checksum
            )));
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        // Each frame is flushed before its ack is awaited.
        Ok(())
    }
}
