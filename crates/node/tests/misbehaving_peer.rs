//! A node facing a hand-driven QUIC peer that breaks the protocol on purpose.
//!
//! The peer side runs the real handshake, then writes packets and raw frames
//! directly so the node's teardown can be observed from both ends.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use peerlink_node::network::stream::{PacketReader, PacketWriter};
use peerlink_node::network::tls::{client_config_trusting, quic_client_config};
use peerlink_node::network::{BiStream, HandshakeController, SelfSignedCert};
use peerlink_node::{
    CloseReason, ConnectionHandle, ConnectionSettings, ConnectionState, KeepaliveSettings, Node,
    Role,
};
use protocol::{
    ConnectionConfig, Frame, FrameCodec, HelloParams, NodeIdentity, Packet, PacketType,
    TrafficHello, DEFAULT_FRAME_SIZE, LOCAL_VERSION, MAX_FRAMES_PER_MESSAGE, SUPPORTED_VERSIONS,
};
use quinn::{ConnectionError, RecvStream, SendStream, VarInt};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

/// Close code the node uses when a connection ends with an error.
const CLOSE_CODE_ERROR: u32 = 1;

/// The dialing side, driven by hand. Every stream half is held so the node
/// never sees a stream stopped underneath it.
struct RawPeer {
    _endpoint: quinn::Endpoint,
    conn: quinn::Connection,
    _control_reader: PacketReader,
    control_writer: PacketWriter,
    traffic_send: SendStream,
    _traffic_recv: RecvStream,
}

impl RawPeer {
    /// Dial `addr` and complete the control handshake and traffic hello.
    async fn connect(addr: SocketAddr, cert: &SelfSignedCert) -> Self {
        let endpoint = quinn::Endpoint::client("127.0.0.1:0".parse().unwrap()).unwrap();
        let tls = client_config_trusting(cert.cert_der().clone()).unwrap();
        let config = quic_client_config(tls, true).unwrap();
        let conn = endpoint
            .connect_with(config, addr, "localhost")
            .unwrap()
            .await
            .unwrap();

        let identity = Arc::new(NodeIdentity::generate());
        let params = HelloParams {
            local_version: LOCAL_VERSION,
            supported_versions: SUPPORTED_VERSIONS.to_vec(),
            config: ConnectionConfig::new(),
            observed_peer: addr,
            max_transmission_unit: 1200,
            ack_per_packet: false,
            max_packets_per_second: 0,
        };
        let mut controller =
            HandshakeController::new(Arc::clone(&identity), Role::Initiator, params);
        let (control, _peer) = controller.run(&conn).await.unwrap();

        let hello = TrafficHello::signed(&identity).to_bytes().unwrap();
        let traffic_send = BiStream::open_outbound(&conn, &hello).await.unwrap();
        let (traffic_recv, _) = BiStream::accept_inbound(&conn).await.unwrap();

        let (control_reader, control_writer) = control.into_split(codec());
        Self {
            _endpoint: endpoint,
            conn,
            _control_reader: control_reader,
            control_writer,
            traffic_send,
            _traffic_recv: traffic_recv,
        }
    }

    async fn send_control(&mut self, packet: Packet) {
        self.control_writer.write(&packet).await.unwrap();
    }

    async fn send_frames(&mut self, frames: &[Frame]) {
        // One write, so the node cannot close the stream between frames.
        let wire: Vec<u8> = frames.iter().flat_map(Frame::encode).collect();
        self.traffic_send.write_all(&wire).await.unwrap();
    }

    async fn send_traffic(&mut self, packet: Packet) {
        let frames = codec().encode_message(&packet.encode()).unwrap();
        self.send_frames(&frames).await;
    }

    /// Wait until the node closes the connection with an error code.
    async fn expect_error_close(&self) {
        match timeout(WAIT, self.conn.closed()).await.unwrap() {
            ConnectionError::ApplicationClosed(close) => {
                assert_eq!(close.error_code, VarInt::from_u32(CLOSE_CODE_ERROR));
            }
            other => panic!("unexpected close: {other:?}"),
        }
    }
}

fn codec() -> FrameCodec {
    FrameCodec::new(DEFAULT_FRAME_SIZE, MAX_FRAMES_PER_MESSAGE).unwrap()
}

fn listening_node(settings: ConnectionSettings) -> (Node, SocketAddr, SelfSignedCert) {
    let node = Node::new(NodeIdentity::generate(), settings);
    let cert = SelfSignedCert::generate("localhost").unwrap();
    let addr = node
        .listen("127.0.0.1:0".parse().unwrap(), cert.server_config().unwrap())
        .unwrap();
    (node, addr, cert)
}

/// A listening node with one accepted hand-driven peer.
async fn node_with_peer(settings: ConnectionSettings) -> (Node, ConnectionHandle, RawPeer) {
    let (node, addr, cert) = listening_node(settings);
    let (peer, accepted) = tokio::join!(
        timeout(WAIT, RawPeer::connect(addr, &cert)),
        timeout(WAIT, node.accept()),
    );
    let accepted = accepted.unwrap().unwrap();
    assert_eq!(accepted.state(), ConnectionState::Active);
    assert_eq!(node.connections().len(), 1);
    (node, accepted, peer.unwrap())
}

async fn assert_violation_teardown(node: &Node, accepted: &ConnectionHandle, peer: &RawPeer) {
    let reason = timeout(WAIT, accepted.closed()).await.unwrap();
    assert!(matches!(reason, CloseReason::ProtocolViolation(_)), "{reason:?}");
    assert_eq!(accepted.state(), ConnectionState::Closed);
    assert!(node.connections().is_empty());
    assert!(node.registry().get(&accepted.id()).is_none());
    peer.expect_error_close().await;
}

#[tokio::test]
async fn test_unknown_keepalive_reply_tears_down_connection() {
    let (node, accepted, mut peer) = node_with_peer(ConnectionSettings::default()).await;

    peer.send_control(Packet::keepalive_reply(&[7u8; 32])).await;

    assert_violation_teardown(&node, &accepted, &peer).await;
    let reason = accepted.closed().await;
    assert!(reason.to_string().contains("keepalive"), "{reason}");
    node.shutdown().await;
}

#[tokio::test]
async fn test_corrupted_traffic_frame_tears_down_connection() {
    let (node, accepted, mut peer) = node_with_peer(ConnectionSettings::default()).await;

    let mut frame = codec()
        .encode_message(&Packet::datagram(b"bit rot".to_vec()).encode())
        .unwrap()
        .remove(0);
    let last = frame.body.len() - 1;
    frame.body[last] ^= 0xff;
    peer.send_frames(&[frame]).await;

    assert_violation_teardown(&node, &accepted, &peer).await;
    assert!(accepted.recv().await.is_err());
    node.shutdown().await;
}

#[tokio::test]
async fn test_out_of_sequence_traffic_frame_tears_down_connection() {
    let (node, accepted, mut peer) = node_with_peer(ConnectionSettings::default()).await;

    let body = Packet::datagram(b"gap".to_vec()).encode();
    peer.send_frames(&[
        Frame::new(body.clone(), 9, 0, false),
        Frame::new(body, 9, 2, true),
    ])
    .await;

    assert_violation_teardown(&node, &accepted, &peer).await;
    node.shutdown().await;
}

#[tokio::test]
async fn test_extension_packets_keep_connection_active() {
    let (node, accepted, mut peer) = node_with_peer(ConnectionSettings::default()).await;

    peer.send_control(Packet::new(PacketType::RoutingCrawler, b"crawl".to_vec()))
        .await;
    peer.send_control(Packet::new(PacketType::PeerDiscovery, b"who".to_vec()))
        .await;
    peer.send_traffic(Packet::new(PacketType::RoutingChannelDatagram, b"routed".to_vec()))
        .await;
    peer.send_traffic(Packet::datagram(b"after hooks".to_vec())).await;

    // The datagram is read after the hooks on the same streams.
    assert_eq!(
        timeout(WAIT, accepted.recv()).await.unwrap().unwrap(),
        b"after hooks"
    );
    assert_eq!(accepted.state(), ConnectionState::Active);
    assert!(!accepted.is_closed());
    assert_eq!(node.connections().len(), 1);

    node.shutdown().await;
}

#[tokio::test]
async fn test_silent_peer_times_out() {
    let settings = ConnectionSettings {
        keepalive: KeepaliveSettings {
            interval: Duration::from_millis(100),
            min_interval: Duration::from_millis(20),
            max_missed: 3,
        },
        ..ConnectionSettings::default()
    };
    let (node, accepted, peer) = node_with_peer(settings).await;

    // The peer never reads its control stream, so no challenge is answered.
    let reason = timeout(WAIT, accepted.closed()).await.unwrap();
    assert!(matches!(reason, CloseReason::Timeout(_)), "{reason:?}");
    assert!(reason.is_error());
    assert!(node.connections().is_empty());
    peer.expect_error_close().await;

    node.shutdown().await;
}
