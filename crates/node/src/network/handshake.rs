//! Hello exchange on the control and traffic streams.
//!
//! ```text
//! Idle ──► SendingHello ──► AwaitingPeerHello ──► Negotiated
//!   (acceptor: AwaitingPeerHello first)   └──────► Failed
//! ```
//!
//! A peer hello is accepted only if its signature verifies, its crypto
//! method matches ours, and each side supports the other's version.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use protocol::config::ConnectionConfig;
use protocol::crypto::{NodeIdentity, PeerIdentity, CRYPTO_METHOD};
use protocol::error::{ProtocolError, Result};
use protocol::hello::{HelloPacket, HelloParams, TrafficHello};
use protocol::version::ProtocolVersion;
use tracing::{debug, warn};

use super::stream::{BiStream, ControlStream, TrafficStream};
use crate::transport::Role;

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    SendingHello,
    AwaitingPeerHello,
    Negotiated,
    Failed,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HandshakeState::Idle => "idle",
            HandshakeState::SendingHello => "sending-hello",
            HandshakeState::AwaitingPeerHello => "awaiting-peer-hello",
            HandshakeState::Negotiated => "negotiated",
            HandshakeState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What the peer announced in an accepted hello.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Verified signer identity.
    pub identity: PeerIdentity,
    /// Peer X25519 public key.
    pub encryption_public_key: Vec<u8>,
    /// Version the peer speaks.
    pub version: ProtocolVersion,
    /// Versions the peer accepts.
    pub supported_versions: Vec<ProtocolVersion>,
    /// Peer's announced MTU.
    pub mtu: u16,
    /// Whether the peer wants per-packet acknowledgments.
    pub ack_per_packet: bool,
    /// Rate cap requested by the peer, 0 for none.
    pub max_packets_per_second: u32,
    /// Where the peer sees this node.
    pub observed_address: Option<SocketAddr>,
    /// Features the peer enabled.
    pub config: ConnectionConfig,
    /// Features enabled on both sides.
    pub negotiated_config: ConnectionConfig,
}

/// Drives the hello exchange for one connection.
pub struct HandshakeController {
    identity: Arc<NodeIdentity>,
    role: Role,
    params: HelloParams,
    state: HandshakeState,
}

impl HandshakeController {
    /// A controller in the `Idle` state.
    pub fn new(identity: Arc<NodeIdentity>, role: Role, params: HelloParams) -> Self {
        Self {
            identity,
            role,
            params,
            state: HandshakeState::Idle,
        }
    }

    /// Current state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    fn transition(&mut self, state: HandshakeState) {
        debug!(role = %self.role, from = %self.state, to = %state, "Handshake state");
        self.state = state;
    }

    /// Exchange hellos on a new control stream.
    ///
    /// On error the controller is `Failed` and the caller must close the
    /// connection without sending anything else.
    pub async fn run(&mut self, conn: &quinn::Connection) -> Result<(ControlStream, PeerInfo)> {
        match self.exchange(conn).await {
            Ok(result) => {
                self.transition(HandshakeState::Negotiated);
                Ok(result)
            }
            Err(err) => {
                self.transition(HandshakeState::Failed);
                warn!(
                    role = %self.role,
                    remote = %conn.remote_address(),
                    error = %err,
                    "Handshake failed"
                );
                Err(err)
            }
        }
    }

    async fn exchange(&mut self, conn: &quinn::Connection) -> Result<(ControlStream, PeerInfo)> {
        let hello = HelloPacket::signed(&self.identity, self.params.clone())?.to_bytes()?;

        let (send, recv, peer_hello) = match self.role {
            Role::Initiator => {
                self.transition(HandshakeState::SendingHello);
                let send = BiStream::open_outbound(conn, &hello).await?;
                self.transition(HandshakeState::AwaitingPeerHello);
                let (recv, peer_hello) = BiStream::accept_inbound(conn).await?;
                (send, recv, peer_hello)
            }
            Role::Acceptor => {
                self.transition(HandshakeState::AwaitingPeerHello);
                let (recv, peer_hello) = BiStream::accept_inbound(conn).await?;
                self.transition(HandshakeState::SendingHello);
                let send = BiStream::open_outbound(conn, &hello).await?;
                (send, recv, peer_hello)
            }
        };

        let peer = self.evaluate(&peer_hello)?;
        Ok((ControlStream::new(BiStream::from_parts(send, recv)), peer))
    }

    /// Validate a serialized peer hello against local settings.
    pub fn evaluate(&self, peer_hello: &[u8]) -> Result<PeerInfo> {
        let hello = HelloPacket::from_bytes(peer_hello)?;
        let identity = hello.verify()?;

        if hello.crypto_method != CRYPTO_METHOD {
            return Err(ProtocolError::HandshakeFailed(format!(
                "unsupported crypto method {:?}",
                hello.crypto_method
            )));
        }
        hello.check_versions(self.params.local_version, &self.params.supported_versions)?;

        let negotiated_config =
            ConnectionConfig::intersect(&hello.config_options, &self.params.config);
        let observed_address = hello.observed_address();
        Ok(PeerInfo {
            identity,
            encryption_public_key: hello.encryption_public_key,
            version: hello.local_version,
            supported_versions: hello.supported_versions,
            mtu: hello.max_transmission_unit,
            ack_per_packet: hello.ack_per_packet,
            max_packets_per_second: hello.max_packets_per_second,
            observed_address,
            config: hello.config_options,
            negotiated_config,
        })
    }

    /// Open the traffic stream and check the peer signed its hello with the
    /// key from the control stream.
    pub async fn open_traffic(
        &self,
        conn: &quinn::Connection,
        peer: &PeerIdentity,
    ) -> Result<TrafficStream> {
        let hello = TrafficHello::signed(&self.identity).to_bytes()?;
        let (stream, peer_hello) = BiStream::establish(conn, self.role, &hello).await?;
        TrafficHello::from_bytes(&peer_hello)?.verify(peer)?;
        debug!(role = %self.role, "Traffic stream validated");
        Ok(TrafficStream::new(stream))
    }
}

impl fmt::Debug for HandshakeController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeController")
            .field("role", &self.role)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use protocol::config::{AUTO_ROUTING, ENABLED, TRAFFIC_FORWARDING};
    use protocol::version::{LOCAL_VERSION, SUPPORTED_VERSIONS};

    use super::*;

    fn params(config: ConnectionConfig, supported: &[ProtocolVersion]) -> HelloParams {
        HelloParams {
            local_version: supported[0],
            supported_versions: supported.to_vec(),
            config,
            observed_peer: "192.0.2.7:4433".parse().unwrap(),
            max_transmission_unit: 1350,
            ack_per_packet: false,
            max_packets_per_second: 0,
        }
    }

    fn controller(config: ConnectionConfig, supported: &[ProtocolVersion]) -> HandshakeController {
        HandshakeController::new(
            Arc::new(NodeIdentity::generate()),
            Role::Acceptor,
            params(config, supported),
        )
    }

    #[test]
    fn test_evaluate_accepts_valid_hello() {
        let peer = NodeIdentity::generate();
        let peer_config = ConnectionConfig::new()
            .with(AUTO_ROUTING, ENABLED)
            .unwrap()
            .with(TRAFFIC_FORWARDING, ENABLED)
            .unwrap();
        let hello = HelloPacket::signed(&peer, params(peer_config, SUPPORTED_VERSIONS)).unwrap();

        let local_config = ConnectionConfig::new().with(AUTO_ROUTING, ENABLED).unwrap();
        let ctl = controller(local_config, SUPPORTED_VERSIONS);
        assert_eq!(ctl.state(), HandshakeState::Idle);

        let info = ctl.evaluate(&hello.to_bytes().unwrap()).unwrap();
        assert_eq!(info.identity.node_id(), peer.node_id());
        assert_eq!(info.version, LOCAL_VERSION);
        assert_eq!(info.mtu, 1350);
        assert_eq!(
            info.observed_address,
            Some("192.0.2.7:4433".parse().unwrap())
        );
        assert_eq!(info.negotiated_config.len(), 1);
        assert!(info.negotiated_config.auto_routing());
        assert!(!info.negotiated_config.traffic_forwarding());
    }

    #[test]
    fn test_evaluate_rejects_tampered_hello() {
        let peer = NodeIdentity::generate();
        let mut hello =
            HelloPacket::signed(&peer, params(ConnectionConfig::new(), SUPPORTED_VERSIONS))
                .unwrap();
        hello.max_transmission_unit = 9000;

        let ctl = controller(ConnectionConfig::new(), SUPPORTED_VERSIONS);
        let err = ctl.evaluate(&hello.to_bytes().unwrap()).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidSignature(_)), "{:?}", err);
    }

    #[test]
    fn test_evaluate_rejects_unsupported_peer_version() {
        let peer = NodeIdentity::generate();
        let hello = HelloPacket::signed(
            &peer,
            params(ConnectionConfig::new(), &[ProtocolVersion(200_000_000)]),
        )
        .unwrap();

        let ctl = controller(ConnectionConfig::new(), SUPPORTED_VERSIONS);
        let err = ctl.evaluate(&hello.to_bytes().unwrap()).unwrap_err();
        assert!(matches!(err, ProtocolError::VersionRejected(_)));
    }

    #[test]
    fn test_evaluate_rejects_foreign_crypto_method() {
        let peer = NodeIdentity::generate();
        let mut hello =
            HelloPacket::signed(&peer, params(ConnectionConfig::new(), SUPPORTED_VERSIONS))
                .unwrap();
        hello.crypto_method = "rsa#dh;".into();
        hello.signature = peer.sign(&hello.signing_bytes().unwrap()).as_bytes().to_vec();

        let ctl = controller(ConnectionConfig::new(), SUPPORTED_VERSIONS);
        let err = ctl.evaluate(&hello.to_bytes().unwrap()).unwrap_err();
        assert!(matches!(err, ProtocolError::HandshakeFailed(_)));
    }

    #[test]
    fn test_evaluate_rejects_garbage() {
        let ctl = controller(ConnectionConfig::new(), SUPPORTED_VERSIONS);
        let err = ctl.evaluate(b"not a hello").unwrap_err();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }
}
