//! QUIC peer connections.
//!
//! A QUIC connection carries three channels: the control stream (hello,
//! keepalive and routing hooks), the traffic stream (application payloads)
//! and, when both sides allow it, unreliable datagrams.
//!
//! - [`tls`]: rustls and quinn endpoint configuration
//! - [`stream`]: stream pairing and packet I/O
//! - [`handshake`]: hello exchange and validation
//! - [`keepalive`]: liveness probing
//! - [`datagram`]: tagged unreliable datagrams
//! - [`connection`]: the running connection and its application handle

pub mod connection;
pub mod datagram;
pub mod handshake;
pub mod keepalive;
pub mod stream;
pub mod tls;

pub use connection::{ConnectionHandle, ConnectionSettings};
pub use datagram::{DatagramHandler, DatagramHandlers};
pub use handshake::{HandshakeController, HandshakeState, PeerInfo};
pub use keepalive::{KeepaliveSettings, KeepaliveState};
pub use stream::{BiStream, ControlStream, TrafficStream};
pub use tls::{PEERLINK_ALPN, SelfSignedCert};
