//! Hello packets: the signed handshake messages opening each stream.
//!
//! The control stream opens with a [`HelloPacket`] in each direction; the
//! traffic stream opens with a [`TrafficHello`] signed by the same key, which
//! ties it to the authenticated control stream.
//!
//! Both are MessagePack maps with numbered string keys so fields can be added
//! without renumbering.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::config::ConnectionConfig;
use crate::crypto::{NodeIdentity, PeerIdentity, Signature, CRYPTO_METHOD};
use crate::error::{ProtocolError, Result};
use crate::version::{format_versions, ProtocolVersion};

/// Largest QUIC payload a node announces.
pub const MAX_QUIC_PAYLOAD: u16 = 1350;

/// Usable QUIC payload for a link MTU: IP header, UDP header and QUIC
/// short-header overhead are subtracted, capped at [`MAX_QUIC_PAYLOAD`].
pub fn quic_payload_size(link_mtu: u16, ipv6: bool) -> u16 {
    const UDP_HEADER: u16 = 8;
    const QUIC_OVERHEAD: u16 = 15;
    let ip_header = if ipv6 { 40 } else { 20 };

    link_mtu
        .saturating_sub(ip_header + UDP_HEADER + QUIC_OVERHEAD)
        .min(MAX_QUIC_PAYLOAD)
}

/// Inputs for building a local hello.
#[derive(Debug, Clone)]
pub struct HelloParams {
    /// Version this node speaks.
    pub local_version: ProtocolVersion,
    /// Versions this node accepts.
    pub supported_versions: Vec<ProtocolVersion>,
    /// Locally enabled features.
    pub config: ConnectionConfig,
    /// Address the peer is seen from.
    pub observed_peer: SocketAddr,
    /// Announced MTU.
    pub max_transmission_unit: u16,
    /// Whether this node wants per-packet acknowledgments.
    pub ack_per_packet: bool,
    /// Rate cap for the peer, 0 for none.
    pub max_packets_per_second: u32,
}

/// Handshake packet opening the control stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPacket {
    #[serde(rename = "1")]
    pub local_version: ProtocolVersion,
    #[serde(rename = "2")]
    pub supported_versions: Vec<ProtocolVersion>,
    #[serde(rename = "3")]
    pub crypto_method: String,
    #[serde(rename = "4")]
    pub config_options: ConnectionConfig,
    #[serde(rename = "5", with = "serde_bytes")]
    pub signer_public_key: Vec<u8>,
    #[serde(rename = "6", with = "serde_bytes")]
    pub encryption_public_key: Vec<u8>,
    #[serde(rename = "7", with = "serde_bytes")]
    pub observed_peer_address: Vec<u8>,
    #[serde(rename = "8")]
    pub observed_peer_port: u16,
    #[serde(rename = "9")]
    pub max_transmission_unit: u16,
    #[serde(rename = "10")]
    pub ack_per_packet: bool,
    #[serde(rename = "11")]
    pub max_packets_per_second: u32,
    /// Ed25519 signature over the encoding with this field empty.
    #[serde(rename = "12", with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl HelloPacket {
    /// Build and sign a hello for `identity`.
    pub fn signed(identity: &NodeIdentity, params: HelloParams) -> Result<Self> {
        let observed_peer_address = match params.observed_peer.ip() {
            IpAddr::V4(ip) => ip.octets().to_vec(),
            IpAddr::V6(ip) => ip.octets().to_vec(),
        };

        let mut hello = Self {
            local_version: params.local_version,
            supported_versions: params.supported_versions,
            crypto_method: CRYPTO_METHOD.to_string(),
            config_options: params.config,
            signer_public_key: identity.public_key_bytes().to_vec(),
            encryption_public_key: identity.encryption_public_key().to_vec(),
            observed_peer_address,
            observed_peer_port: params.observed_peer.port(),
            max_transmission_unit: params.max_transmission_unit,
            ack_per_packet: params.ack_per_packet,
            max_packets_per_second: params.max_packets_per_second,
            signature: Vec::new(),
        };
        hello.signature = identity.sign(&hello.signing_bytes()?).as_bytes().to_vec();
        Ok(hello)
    }

    /// Canonical bytes covered by the signature.
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.signature.clear();
        Ok(rmp_serde::to_vec_named(&unsigned)?)
    }

    /// Verify the signature against the announced signer key.
    pub fn verify(&self) -> Result<PeerIdentity> {
        let peer = PeerIdentity::from_public_key_bytes(&self.signer_public_key)?;
        let signature = Signature::from_slice(&self.signature)?;
        peer.verify(&self.signing_bytes()?, &signature)?;
        Ok(peer)
    }

    /// Check that each side accepts the other's version.
    pub fn check_versions(
        &self,
        local_version: ProtocolVersion,
        local_supported: &[ProtocolVersion],
    ) -> Result<()> {
        if !local_supported.contains(&self.local_version) {
            return Err(ProtocolError::VersionRejected(format!(
                "peer version {} is not supported, supported versions: {}",
                self.local_version,
                format_versions(local_supported)
            )));
        }
        if !self.supported_versions.contains(&local_version) {
            return Err(ProtocolError::VersionRejected(format!(
                "peer does not support local version {}, peer supports: {}",
                local_version,
                format_versions(&self.supported_versions)
            )));
        }
        Ok(())
    }

    /// The address the peer observed this node at.
    pub fn observed_address(&self) -> Option<SocketAddr> {
        let ip = match self.observed_peer_address.len() {
            4 => {
                let octets: [u8; 4] = self.observed_peer_address.as_slice().try_into().ok()?;
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            16 => {
                let octets: [u8; 16] = self.observed_peer_address.as_slice().try_into().ok()?;
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => return None,
        };
        Some(SocketAddr::new(ip, self.observed_peer_port))
    }

    /// Serialize to MessagePack.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserialize from MessagePack.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Handshake packet opening the traffic stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficHello {
    #[serde(rename = "1", with = "serde_bytes")]
    pub validation_id: Vec<u8>,
    #[serde(rename = "2", with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl TrafficHello {
    /// A fresh random validation id signed by `identity`.
    pub fn signed(identity: &NodeIdentity) -> Self {
        let validation_id: [u8; 32] = rand::random();
        Self {
            validation_id: validation_id.to_vec(),
            signature: identity.sign(&validation_id).as_bytes().to_vec(),
        }
    }

    /// Verify the validation id was signed by `peer`.
    pub fn verify(&self, peer: &PeerIdentity) -> Result<()> {
        let signature = Signature::from_slice(&self.signature)?;
        peer.verify(&self.validation_id, &signature)
    }

    /// Serialize to MessagePack.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserialize from MessagePack.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
