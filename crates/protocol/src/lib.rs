//! # PeerLink Protocol Library
//!
//! Wire formats for PeerLink node-to-node connections. Nothing in this crate
//! performs I/O; the `peerlink-node` crate drives these types over QUIC,
//! TCP, TLS and local sockets.
//!
//! ## Overview
//!
//! - **Frame Codec**: checksummed, sequenced frames with bounded reassembly
//! - **Length Prefix**: 8-byte little-endian prefix for handshake packets
//! - **Versions**: packed version numbers and the agreement rule
//! - **Hello Packets**: signed handshake messages carrying identity and features
//! - **Connection Config**: `<name=value;...>` feature flags and their intersection
//! - **Packets**: 2-byte tagged control and traffic packets
//! - **Node Identity**: Ed25519 signing and X25519 key-agreement keys
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │     Tagged packets (control/traffic)    │  2-byte type tags
//! ├─────────────────────────────────────────┤
//! │   Hello exchange (once per stream)      │  MessagePack, Ed25519-signed
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  21-byte header, CRC32
//! ├─────────────────────────────────────────┤
//! │      Transport (QUIC/TCP/TLS/Unix)      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{FrameCodec, Packet};
//!
//! let packet = Packet::datagram(b"hello".to_vec());
//! let codec = FrameCodec::default();
//! let frames = codec.encode_message(&packet.encode()).unwrap();
//!
//! let mut assembler = codec.assembler();
//! let mut message = None;
//! for frame in frames {
//!     message = assembler.push(frame).unwrap();
//! }
//! assert_eq!(Packet::decode(&message.unwrap()).unwrap(), packet);
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod framing;
pub mod hello;
pub mod length_prefix;
pub mod packet;
pub mod version;

pub use config::{ConfigEntry, ConnectionConfig, AUTO_ROUTING, ENABLED, TRAFFIC_FORWARDING};
pub use crypto::{hash, NodeId, NodeIdentity, PeerIdentity, Signature, CRYPTO_METHOD};
pub use error::{ProtocolError, Result};
pub use framing::{
    Frame, FrameAssembler, FrameCodec, FrameHeader, DEFAULT_FRAME_SIZE, FRAME_HEADER_SIZE,
    MAX_FRAMES_PER_MESSAGE, MAX_MESSAGE_SIZE,
};
pub use hello::{quic_payload_size, HelloPacket, HelloParams, TrafficHello};
pub use packet::{KeepaliveId, Packet, PacketType, StreamKind, KEEPALIVE_ID_SIZE};
pub use version::{negotiate, ProtocolVersion, LOCAL_VERSION, SUPPORTED_VERSIONS};
