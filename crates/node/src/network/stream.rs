//! Logical streams over one QUIC connection.
//!
//! A [`BiStream`] pairs an outbound unidirectional QUIC stream with the
//! peer's inbound one. The initiator opens and writes its hello before it
//! accepts and reads; the acceptor does the reverse, so the two sides never
//! wait on each other.
//!
//! [`ControlStream`] and [`TrafficStream`] wrap a `BiStream` and split into
//! a [`PacketReader`] and [`PacketWriter`], each owned by exactly one task.

use protocol::error::{ProtocolError, Result};
use protocol::framing::FrameCodec;
use protocol::length_prefix::MAX_PREFIXED_PAYLOAD;
use protocol::packet::{Packet, StreamKind};
use quinn::{RecvStream, SendStream};
use tracing::debug;

use crate::transport::framed::{
    read_prefixed, write_prefixed, FrameReader, FrameWriter, MessageReader, MessageWriter,
};
use crate::transport::Role;

/// Classify a QUIC connection failure.
pub(crate) fn connection_error(err: quinn::ConnectionError) -> ProtocolError {
    use quinn::ConnectionError;
    match err {
        ConnectionError::ApplicationClosed(_)
        | ConnectionError::ConnectionClosed(_)
        | ConnectionError::LocallyClosed
        | ConnectionError::Reset => ProtocolError::ConnectionClosed(err.to_string()),
        ConnectionError::TimedOut => ProtocolError::Timeout(err.to_string()),
        other => ProtocolError::Quic(other.to_string()),
    }
}

/// One outbound and one inbound QUIC stream used as a pair.
#[derive(Debug)]
pub struct BiStream {
    send: SendStream,
    recv: RecvStream,
}

impl BiStream {
    /// Open the pair as `role`, sending `hello` and returning the peer's.
    pub async fn establish(
        conn: &quinn::Connection,
        role: Role,
        hello: &[u8],
    ) -> Result<(Self, Vec<u8>)> {
        let (send, recv, peer_hello) = match role {
            Role::Initiator => {
                let send = Self::open_outbound(conn, hello).await?;
                let (recv, peer_hello) = Self::accept_inbound(conn).await?;
                (send, recv, peer_hello)
            }
            Role::Acceptor => {
                let (recv, peer_hello) = Self::accept_inbound(conn).await?;
                let send = Self::open_outbound(conn, hello).await?;
                (send, recv, peer_hello)
            }
        };
        debug!(
            %role,
            remote = %conn.remote_address(),
            hello_len = peer_hello.len(),
            "Stream pair established"
        );
        Ok((Self::from_parts(send, recv), peer_hello))
    }

    /// Open the outbound half and write `hello` on it.
    pub async fn open_outbound(conn: &quinn::Connection, hello: &[u8]) -> Result<SendStream> {
        let mut send = conn.open_uni().await.map_err(connection_error)?;
        write_prefixed(&mut send, hello).await?;
        Ok(send)
    }

    /// Accept the peer's outbound half and read its hello.
    pub async fn accept_inbound(conn: &quinn::Connection) -> Result<(RecvStream, Vec<u8>)> {
        let mut recv = conn.accept_uni().await.map_err(connection_error)?;
        let hello = read_prefixed(&mut recv, MAX_PREFIXED_PAYLOAD).await?;
        Ok((recv, hello))
    }

    /// Pair already established halves.
    pub fn from_parts(send: SendStream, recv: RecvStream) -> Self {
        Self { send, recv }
    }

    fn into_halves(self, kind: StreamKind, codec: FrameCodec) -> (PacketReader, PacketWriter) {
        let assembler = codec.assembler();
        (
            PacketReader {
                kind,
                inner: MessageReader::with_assembler(FrameReader::new(self.recv), assembler),
            },
            PacketWriter {
                kind,
                inner: MessageWriter::new(FrameWriter::new(self.send), codec),
            },
        )
    }
}

/// Stream carrying the hello exchange and signaling packets.
#[derive(Debug)]
pub struct ControlStream {
    inner: BiStream,
}

impl ControlStream {
    pub fn new(inner: BiStream) -> Self {
        Self { inner }
    }

    /// Split into the reader and writer owned by the connection tasks.
    pub fn into_split(self, codec: FrameCodec) -> (PacketReader, PacketWriter) {
        self.inner.into_halves(StreamKind::Control, codec)
    }
}

/// Stream carrying application and routing payloads.
#[derive(Debug)]
pub struct TrafficStream {
    inner: BiStream,
}

impl TrafficStream {
    pub fn new(inner: BiStream) -> Self {
        Self { inner }
    }

    /// Split into the reader and writer owned by the connection tasks.
    pub fn into_split(self, codec: FrameCodec) -> (PacketReader, PacketWriter) {
        self.inner.into_halves(StreamKind::Traffic, codec)
    }
}

/// Reads tagged packets from one stream.
#[derive(Debug)]
pub struct PacketReader {
    kind: StreamKind,
    inner: MessageReader<FrameReader<RecvStream>>,
}

impl PacketReader {
    /// Stream this reader belongs to.
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Read the next packet.
    ///
    /// Packets whose type belongs to the other stream are rejected.
    pub async fn read(&mut self) -> Result<Packet> {
        let packet = Packet::decode(&self.inner.read().await?)?;
        if packet.kind.stream() != self.kind {
            return Err(ProtocolError::MalformedPacket(format!(
                "{} packet received on the {:?} stream",
                packet.kind, self.kind
            )));
        }
        Ok(packet)
    }
}

/// Writes tagged packets to one stream.
#[derive(Debug)]
pub struct PacketWriter {
    kind: StreamKind,
    inner: MessageWriter<FrameWriter<SendStream>>,
}

impl PacketWriter {
    /// Stream this writer belongs to.
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Write one packet.
    pub async fn write(&mut self, packet: &Packet) -> Result<()> {
        self.inner.write(&packet.encode()).await
    }

    /// Finish the outbound stream.
    pub fn finish(mut self) {
        // A stream already reset or closed by the connection needs nothing.
        let _ = self.inner.sink_mut().get_mut().finish();
    }
}
