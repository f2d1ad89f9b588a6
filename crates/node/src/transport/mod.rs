//! Stream transports: classification, framing and version agreement.
//!
//! A connected byte stream is classified into a [`RawTransport`], then
//! upgraded into a [`FramedConn`] that carries whole messages and has
//! already agreed a protocol version with the peer.
//!
//! | Kind    | Frame size | Acknowledged |
//! |---------|-----------:|:------------:|
//! | `tcp`   | 1024       | no           |
//! | `tls`   | 1024       | no           |
//! | `local` | 1024       | per frame    |

pub mod ack;
pub mod framed;
pub mod negotiate;

use std::any::Any;
use std::fmt;

use protocol::error::{ProtocolError, Result};
use protocol::framing::{FrameCodec, DEFAULT_FRAME_SIZE, MAX_FRAMES_PER_MESSAGE};
use protocol::version::ProtocolVersion;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsStream;
use tracing::{debug, info};

use self::ack::{split_acked, AckedReceiver, AckedSender};
use self::framed::{FrameReader, FrameSink, FrameSource, FrameWriter, MessageReader, MessageWriter};
pub use self::negotiate::{negotiate_version, Role};

/// Recognised stream transport kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Plain TCP.
    Tcp,
    /// TLS over TCP.
    Tls,
    /// Unix domain socket.
    Local,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => f.write_str("tcp"),
            TransportKind::Tls => f.write_str("tls"),
            TransportKind::Local => f.write_str("local"),
        }
    }
}

/// Framing parameters chosen for a transport kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportParams {
    pub frame_size: usize,
    pub max_frames: u64,
    pub ack_per_frame: bool,
}

impl TransportParams {
    /// Parameters for `kind`.
    pub fn for_kind(kind: TransportKind) -> Self {
        Self {
            frame_size: DEFAULT_FRAME_SIZE,
            max_frames: MAX_FRAMES_PER_MESSAGE,
            ack_per_frame: kind == TransportKind::Local,
        }
    }
}

/// A connected byte stream of a recognised kind.
pub enum RawTransport {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    #[cfg(unix)]
    Local(UnixStream),
}

impl RawTransport {
    /// Classify an opaque connected handle.
    ///
    /// Anything that is not a TCP stream, a TLS stream over TCP or a Unix
    /// stream is rejected with [`ProtocolError::UnsupportedTransport`].
    pub fn classify(handle: Box<dyn Any + Send>) -> Result<Self> {
        let handle = match handle.downcast::<TcpStream>() {
            Ok(stream) => return Ok(RawTransport::Tcp(*stream)),
            Err(handle) => handle,
        };
        let handle = match handle.downcast::<TlsStream<TcpStream>>() {
            Ok(stream) => return Ok(RawTransport::Tls(stream)),
            Err(handle) => handle,
        };
        let handle = match handle.downcast::<tokio_rustls::client::TlsStream<TcpStream>>() {
            Ok(stream) => return Ok(RawTransport::from(*stream)),
            Err(handle) => handle,
        };
        let handle = match handle.downcast::<tokio_rustls::server::TlsStream<TcpStream>>() {
            Ok(stream) => return Ok(RawTransport::from(*stream)),
            Err(handle) => handle,
        };
        #[cfg(unix)]
        let handle = match handle.downcast::<UnixStream>() {
            Ok(stream) => return Ok(RawTransport::Local(*stream)),
            Err(handle) => handle,
        };
        drop(handle);
        Err(ProtocolError::UnsupportedTransport(
            "handle is not a TCP, TLS or local stream".into(),
        ))
    }

    /// The transport kind.
    pub fn kind(&self) -> TransportKind {
        match self {
            RawTransport::Tcp(_) => TransportKind::Tcp,
            RawTransport::Tls(_) => TransportKind::Tls,
            #[cfg(unix)]
            RawTransport::Local(_) => TransportKind::Local,
        }
    }

    fn into_boxed(self) -> BoxedStream {
        match self {
            RawTransport::Tcp(stream) => Box::new(stream),
            RawTransport::Tls(stream) => stream,
            #[cfg(unix)]
            RawTransport::Local(stream) => Box::new(stream),
        }
    }
}

impl fmt::Debug for RawTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RawTransport").field(&self.kind()).finish()
    }
}

impl From<TcpStream> for RawTransport {
    fn from(stream: TcpStream) -> Self {
        RawTransport::Tcp(stream)
    }
}

impl From<TlsStream<TcpStream>> for RawTransport {
    fn from(stream: TlsStream<TcpStream>) -> Self {
        RawTransport::Tls(Box::new(stream))
    }
}

impl From<tokio_rustls::client::TlsStream<TcpStream>> for RawTransport {
    fn from(stream: tokio_rustls::client::TlsStream<TcpStream>) -> Self {
        RawTransport::Tls(Box::new(TlsStream::from(stream)))
    }
}

impl From<tokio_rustls::server::TlsStream<TcpStream>> for RawTransport {
    fn from(stream: tokio_rustls::server::TlsStream<TcpStream>) -> Self {
        RawTransport::Tls(Box::new(TlsStream::from(stream)))
    }
}

#[cfg(unix)]
impl From<UnixStream> for RawTransport {
    fn from(stream: UnixStream) -> Self {
        RawTransport::Local(stream)
    }
}

trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}

type BoxedStream = Box<dyn IoStream>;

enum ConnSource {
    Plain(FrameReader<ReadHalf<BoxedStream>>),
    Acked(AckedReceiver),
}

impl FrameSource for ConnSource {
    async fn next_frame(&mut self) -> Result<protocol::Frame> {
        match self {
            ConnSource::Plain(reader) => reader.next_frame().await,
            ConnSource::Acked(receiver) => receiver.next_frame().await,
        }
    }
}

enum ConnSink {
    Plain(FrameWriter<WriteHalf<BoxedStream>>),
    Acked(AckedSender),
}

impl ConnSink {
    async fn shutdown(&mut self) -> Result<()> {
        match self {
            ConnSink::Plain(writer) => {
                writer.get_mut().shutdown().await?;
                Ok(())
            }
            ConnSink::Acked(sender) => sender.shutdown().await,
        }
    }
}

impl FrameSink for ConnSink {
    async fn send_frame(&mut self, frame: &protocol::Frame) -> Result<()> {
        match self {
            ConnSink::Plain(writer) => writer.send_frame(frame).await,
            ConnSink::Acked(sender) => sender.send_frame(frame).await,
        }
    }

    async fn flush(&mut self) -> Result<()> {
        match self {
            ConnSink::Plain(writer) => writer.flush().await,
            ConnSink::Acked(sender) => sender.flush().await,
        }
    }
}

/// A message-oriented connection with an agreed protocol version.
///
/// Reads and writes lock independent halves, so one task may read while
/// another writes.
pub struct FramedConn {
    kind: TransportKind,
    agreed_version: ProtocolVersion,
    reader: Mutex<MessageReader<ConnSource>>,
    writer: Mutex<MessageWriter<ConnSink>>,
}

impl FramedConn {
    /// Frame `raw` for its kind and negotiate a version as `role`.
    pub async fn upgrade(
        raw: RawTransport,
        role: Role,
        supported: &[ProtocolVersion],
    ) -> Result<Self> {
        let kind = raw.kind();
        let params = TransportParams::for_kind(kind);
        let codec = FrameCodec::new(params.frame_size, params.max_frames)?;
        let stream = raw.into_boxed();

        let (source, sink) = if params.ack_per_frame {
            let (receiver, sender) = split_acked(stream);
            (ConnSource::Acked(receiver), ConnSink::Acked(sender))
        } else {
            let (read_half, write_half) = tokio::io::split(stream);
            (
                ConnSource::Plain(FrameReader::new(read_half)),
                ConnSink::Plain(FrameWriter::new(write_half)),
            )
        };
        let mut reader = MessageReader::new(source, params.max_frames);
        let mut writer = MessageWriter::new(sink, codec);
        debug!(%kind, %role, "Upgrading transport");

        let agreed_version = negotiate_version(&mut reader, &mut writer, role, supported).await?;
        info!(%kind, %role, version = %agreed_version, "Transport upgraded");

        Ok(Self {
            kind,
            agreed_version,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        })
    }

    /// Transport kind underneath.
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Version agreed during the upgrade.
    pub fn agreed_version(&self) -> ProtocolVersion {
        self.agreed_version
    }

    /// Send one message.
    pub async fn write(&self, payload: &[u8]) -> Result<()> {
        self.writer.lock().await.write(payload).await
    }

    /// Receive one message.
    pub async fn read(&self) -> Result<Vec<u8>> {
        self.reader.lock().await.read().await
    }

    /// Shut down the write side; the peer's reads end once drained.
    pub async fn close(&self) -> Result<()> {
        self.writer.lock().await.sink_mut().shutdown().await
    }
}

impl fmt::Debug for FramedConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedConn")
            .field("kind", &self.kind)
            .field("agreed_version", &self.agreed_version)
            .finish_non_exhaustive()
    }
}
