//! Tagged packets carried on the control and traffic streams.
//!
//! After the hello exchange every framed message on a stream is a packet:
//! a 2-byte big-endian type tag followed by the packet body.

use std::fmt;

use crate::error::{ProtocolError, Result};

/// Size of a packet type tag.
pub const PACKET_TAG_SIZE: usize = 2;

/// Size of a keepalive challenge id.
pub const KEEPALIVE_ID_SIZE: usize = 32;

/// Random id identifying one keepalive challenge.
pub type KeepaliveId = [u8; KEEPALIVE_ID_SIZE];

/// Stream a packet type belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Signaling: keepalive and routing hooks.
    Control,
    /// Bulk payloads.
    Traffic,
}

/// Packet types and their wire tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Liveness challenge carrying a 32-byte id.
    Keepalive,
    /// Answer to a [`PacketType::Keepalive`] with the same id.
    KeepaliveReply,
    /// Routing crawler probe (not handled).
    RoutingCrawler,
    /// Proof-of-work difficulty announcement (not handled).
    PowDifficultyUpdate,
    /// Automatic routing table update (not handled).
    AutoRoutingTableUpdate,
    /// Peer discovery message (not handled).
    PeerDiscovery,
    /// Application payload.
    Datagram,
    /// Routed channel payload (not handled).
    RoutingChannelDatagram,
}

impl PacketType {
    /// All packet types, control first.
    pub const ALL: [PacketType; 8] = [
        PacketType::Keepalive,
        PacketType::KeepaliveReply,
        PacketType::RoutingCrawler,
        PacketType::PowDifficultyUpdate,
        PacketType::AutoRoutingTableUpdate,
        PacketType::PeerDiscovery,
        PacketType::Datagram,
        PacketType::RoutingChannelDatagram,
    ];

    /// The 2-byte wire tag.
    pub fn tag(self) -> [u8; PACKET_TAG_SIZE] {
        match self {
            PacketType::Keepalive => [0x01, 0x01],
            PacketType::KeepaliveReply => [0x01, 0x02],
            PacketType::RoutingCrawler => [0x02, 0x01],
            PacketType::PowDifficultyUpdate => [0x02, 0x02],
            PacketType::AutoRoutingTableUpdate => [0x02, 0x03],
            PacketType::PeerDiscovery => [0x02, 0x04],
            PacketType::Datagram => [0x03, 0x01],
            PacketType::RoutingChannelDatagram => [0x03, 0x02],
        }
    }

    /// Look up a packet type by tag.
    pub fn from_tag(tag: [u8; PACKET_TAG_SIZE]) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.tag() == tag)
            .ok_or(ProtocolError::UnknownPacketType {
                tag: u16::from_be_bytes(tag),
            })
    }

    /// The stream this packet type travels on.
    pub fn stream(self) -> StreamKind {
        match self {
            PacketType::Datagram | PacketType::RoutingChannelDatagram => StreamKind::Traffic,
            _ => StreamKind::Control,
        }
    }

    /// Whether this node only logs packets of this type.
    pub fn is_extension_hook(self) -> bool {
        matches!(
            self,
            PacketType::RoutingCrawler
                | PacketType::PowDifficultyUpdate
                | PacketType::AutoRoutingTableUpdate
                | PacketType::PeerDiscovery
                | PacketType::RoutingChannelDatagram
        )
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketType::Keepalive => "keepalive",
            PacketType::KeepaliveReply => "keepalive-reply",
            PacketType::RoutingCrawler => "routing-crawler",
            PacketType::PowDifficultyUpdate => "pow-difficulty-update",
            PacketType::AutoRoutingTableUpdate => "auto-routing-table-update",
            PacketType::PeerDiscovery => "peer-discovery",
            PacketType::Datagram => "datagram",
            PacketType::RoutingChannelDatagram => "routing-channel-datagram",
        };
        f.write_str(name)
    }
}

/// A typed packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet type.
    pub kind: PacketType,
    /// Packet body, tag excluded.
    pub body: Vec<u8>,
}

impl Packet {
    /// Create a packet.
    pub fn new(kind: PacketType, body: Vec<u8>) -> Self {
        Self { kind, body }
    }

    /// A keepalive challenge.
    pub fn keepalive(id: &KeepaliveId) -> Self {
        Self::new(PacketType::Keepalive, id.to_vec())
    }

    /// A reply to the challenge `id`.
    pub fn keepalive_reply(id: &KeepaliveId) -> Self {
        Self::new(PacketType::KeepaliveReply, id.to_vec())
    }

    /// An application datagram.
    pub fn datagram(payload: Vec<u8>) -> Self {
        Self::new(PacketType::Datagram, payload)
    }

    /// Encode as `tag ‖ body`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PACKET_TAG_SIZE + self.body.len());
        out.extend_from_slice(&self.kind.tag());
        out.extend_from_slice(&self.body);
        out
    }

    /// Decode a packet from one framed message.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < PACKET_TAG_SIZE {
            return Err(ProtocolError::MalformedPacket(format!(
                "packet of {} bytes has no type tag",
                data.len()
            )));
        }
        let kind = PacketType::from_tag([data[0], data[1]])?;
        Ok(Self::new(kind, data[PACKET_TAG_SIZE..].to_vec()))
    }

    /// Body interpreted as a keepalive id.
    pub fn keepalive_id(&self) -> Result<KeepaliveId> {
        self.body.as_slice().try_into().map_err(|_| {
            ProtocolError::MalformedPacket(format!(
                "{} id must be {} bytes, got {}",
                self.kind,
                KEEPALIVE_ID_SIZE,
                self.body.len()
            ))
        })
    }
}

/// Type tags for the unreliable datagram channel.
pub mod datagram_tag {
    /// Application payload.
    pub const DATA: u8 = 0x01;
    /// Routed channel payload.
    pub const ROUTING_CHANNEL: u8 = 0x02;
    /// Path probe.
    pub const PROBE: u8 = 0x03;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_unique() {
        for (i, a) in PacketType::ALL.iter().enumerate() {
            for b in &PacketType::ALL[i + 1..] {
                assert_ne!(a.tag(), b.tag(), "{} and {}", a, b);
            }
            assert_eq!(PacketType::from_tag(a.tag()).unwrap(), *a);
        }
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let err = Packet::decode(&[0x09, 0x09, 1, 2]).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownPacketType { tag: 0x0909 }));
    }

    #[test]
    fn test_short_packet_rejected() {
        assert!(matches!(
            Packet::decode(&[0x01]),
            Err(ProtocolError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_keepalive_packet_layout() {
        let id = [7u8; KEEPALIVE_ID_SIZE];
        let wire = Packet::keepalive(&id).encode();

        assert_eq!(&wire[..2], &[0x01, 0x01]);
        assert_eq!(wire.len(), 2 + KEEPALIVE_ID_SIZE);

        let packet = Packet::decode(&wire).unwrap();
        assert_eq!(packet.kind, PacketType::Keepalive);
        assert_eq!(packet.keepalive_id().unwrap(), id);
    }

    #[test]
    fn test_keepalive_id_length_checked() {
        let packet = Packet::new(PacketType::KeepaliveReply, vec![1, 2, 3]);
        assert!(matches!(
            packet.keepalive_id(),
            Err(ProtocolError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_stream_assignment() {
        assert_eq!(PacketType::Keepalive.stream(), StreamKind::Control);
        assert_eq!(PacketType::PeerDiscovery.stream(), StreamKind::Control);
        assert_eq!(PacketType::Datagram.stream(), StreamKind::Traffic);
        assert!(!PacketType::Datagram.is_extension_hook());
        assert!(PacketType::RoutingCrawler.is_extension_hook());
    }
}
