//! # PeerLink Node Library
//!
//! This crate runs authenticated, versioned, liveness-monitored peer
//! connections on top of the wire formats in the [`protocol`] crate.
//!
//! ## Overview
//!
//! - **Transport upgrade**: wrap a TCP, TLS or local socket in the frame
//!   protocol and agree on a protocol version
//! - **QUIC connections**: signed hello handshake, feature negotiation,
//!   control and traffic streams, unreliable datagrams
//! - **Keepalive**: challenge/response probing with interval backoff
//! - **Lifecycle**: one cancellation scope per connection and a registry of
//!   live connections per node
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                              Node                                │
//! │        listen / connect / accept / shutdown, datagram handlers   │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────────┐   ┌──────────────────────────────────────┐ │
//! │  │ ConnectionManager│◄──│          ConnectionHandle            │ │
//! │  │   (registry)     │   │ send / recv / send_unreliable / close│ │
//! │  └──────────────────┘   └──────────────────────────────────────┘ │
//! │                                                                  │
//! │  ┌────────────┐ ┌─────────────┐ ┌────────────┐ ┌──────────────┐  │
//! │  │ Handshake  │ │   Control   │ │  Traffic   │ │  Keepalive   │  │
//! │  │ Controller │ │   stream    │ │  stream    │ │    task      │  │
//! │  └────────────┘ └─────────────┘ └────────────┘ └──────────────┘  │
//! │                                                                  │
//! │  ┌────────────────────────────────────────────────────────────┐  │
//! │  │      QUIC (quinn + rustls)   │   FramedConn (TCP/TLS/UDS)  │  │
//! │  └────────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use peerlink_node::network::tls::insecure_client_config;
//! use peerlink_node::{ConnectionSettings, Node};
//! use protocol::NodeIdentity;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let node = Node::new(NodeIdentity::generate(), ConnectionSettings::default());
//!
//!     let conn = node
//!         .connect("quic://192.0.2.10:4433", insecure_client_config()?)
//!         .await?;
//!     conn.send(b"hello")?;
//!     let reply = conn.recv().await?;
//!     println!("peer {} says {:?}", conn.peer_node_id(), reply);
//!
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`address`]: peer URI validation and host classification
//! - [`config`]: configuration loading and defaults
//! - [`error`]: node setup errors
//! - [`lifecycle`]: connection states, close reasons and cancellation
//! - [`network`]: QUIC handshake, streams, keepalive and datagrams
//! - [`node`]: listener, dialer and identity persistence
//! - [`queue`]: outbound packet queues
//! - [`registry`]: live connection registry
//! - [`transport`]: framed byte-stream transports and version negotiation

pub mod address;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod network;
pub mod node;
pub mod queue;
pub mod registry;
pub mod transport;

// Re-export protocol for convenience
pub use protocol;

pub use address::{AddressType, PeerUri};
pub use config::{Config, ConfigError};
pub use error::{SetupError, SetupResult};
pub use lifecycle::{CloseReason, ConnectionState, LifecycleContext};
pub use network::{ConnectionHandle, ConnectionSettings, KeepaliveSettings, PEERLINK_ALPN};
pub use node::{load_or_generate_identity, Node};
pub use queue::OutboundQueue;
pub use registry::{ConnectionId, ConnectionManager};
pub use transport::{FramedConn, RawTransport, Role, TransportKind};
