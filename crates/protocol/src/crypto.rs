//! Node identity: signing and key-agreement keys.
//!
//! A node signs its hello packets with an Ed25519 key and announces an
//! X25519 public key for key agreement (`ed25519#curve25519`). Both keys are
//! derived from a single 32-byte secret so an identity persists as one file.

use ed25519_dalek::{
    Signature as Ed25519Signature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH,
    SIGNATURE_LENGTH,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ProtocolError, Result};

/// Crypto method announced in hello packets.
pub const CRYPTO_METHOD: &str = "ed25519#curve25519;";

/// Length of a persisted identity secret.
pub const SECRET_KEY_LENGTH: usize = ed25519_dalek::SECRET_KEY_LENGTH;

/// Length of a node ID in bytes (SHA-256 output truncated to 16 bytes).
pub const NODE_ID_LENGTH: usize = 16;

/// Domain separator for deriving the X25519 secret.
const KEY_AGREEMENT_CONTEXT: &[u8] = b"peerlink x25519 v1";

/// SHA-256 of `data`.
pub fn hash(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// A node identifier derived from the signing public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(#[serde(with = "serde_bytes")] pub [u8; NODE_ID_LENGTH]);

impl NodeId {
    /// Returns the raw bytes of this node ID.
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LENGTH] {
        &self.0
    }

    /// Groups of 4 hex characters separated by colons,
    /// e.g. `a1b2:c3d4:e5f6:7890:1234:5678:9abc:def0`.
    pub fn fingerprint(&self) -> String {
        self.0
            .chunks(2)
            .map(|chunk| format!("{:02x}{:02x}", chunk[0], chunk[1]))
            .collect::<Vec<_>>()
            .join(":")
    }

    fn from_public_key(public_key: &VerifyingKey) -> Self {
        let digest = hash(public_key.as_bytes());
        let mut id = [0u8; NODE_ID_LENGTH];
        id.copy_from_slice(&digest[..NODE_ID_LENGTH]);
        Self(id)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.fingerprint())
    }
}

/// A 64-byte Ed25519 signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "serde_bytes")] pub [u8; SIGNATURE_LENGTH]);

impl Signature {
    /// Parses a signature received as a byte string.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; SIGNATURE_LENGTH] = bytes.try_into().map_err(|_| {
            ProtocolError::InvalidSignature(format!(
                "expected {} bytes, got {}",
                SIGNATURE_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Returns the raw bytes of this signature.
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.0
    }

    fn as_ed25519(&self) -> Ed25519Signature {
        Ed25519Signature::from_bytes(&self.0)
    }
}

/// The local node's keys.
#[derive(Clone)]
pub struct NodeIdentity {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    agreement_secret: x25519_dalek::StaticSecret,
    node_id: NodeId,
}

impl NodeIdentity {
    /// Generates a new random identity.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Restores an identity from its 32-byte secret.
    pub fn from_secret_key_bytes(bytes: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(bytes))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        let mut seed = Sha256::new();
        seed.update(KEY_AGREEMENT_CONTEXT);
        seed.update(signing_key.to_bytes());
        let seed: [u8; 32] = seed.finalize().into();

        Self {
            node_id: NodeId::from_public_key(&verifying_key),
            agreement_secret: x25519_dalek::StaticSecret::from(seed),
            signing_key,
            verifying_key,
        }
    }

    /// Returns the secret key bytes. Only use this for persisting the identity.
    pub fn secret_key_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.signing_key.to_bytes()
    }

    /// Ed25519 public key bytes.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.to_bytes()
    }

    /// X25519 public key bytes.
    pub fn encryption_public_key(&self) -> [u8; 32] {
        x25519_dalek::PublicKey::from(&self.agreement_secret).to_bytes()
    }

    /// Returns the node ID.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Public half of this identity.
    pub fn to_peer_identity(&self) -> PeerIdentity {
        PeerIdentity {
            verifying_key: self.verifying_key,
            node_id: self.node_id,
        }
    }

    /// Signs `message` with the node's Ed25519 key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing_key.sign(message).to_bytes())
    }

    /// Verifies a signature made by this node.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        self.verifying_key
            .verify(message, &signature.as_ed25519())
            .map_err(ProtocolError::from)
    }

    /// Human-readable fingerprint of the node ID.
    pub fn fingerprint(&self) -> String {
        self.node_id.fingerprint()
    }
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("node_id", &self.node_id)
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// The public identity of a remote node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerIdentity {
    verifying_key: VerifyingKey,
    node_id: NodeId,
}

impl PeerIdentity {
    /// Parses a peer's Ed25519 public key as announced in its hello.
    pub fn from_public_key_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; PUBLIC_KEY_LENGTH] = bytes.try_into().map_err(|_| {
            ProtocolError::InvalidPublicKey(format!(
                "expected {} bytes, got {}",
                PUBLIC_KEY_LENGTH,
                bytes.len()
            ))
        })?;
        let verifying_key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| ProtocolError::InvalidPublicKey(e.to_string()))?;

        Ok(Self {
            node_id: NodeId::from_public_key(&verifying_key),
            verifying_key,
        })
    }

    /// Ed25519 public key bytes.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.to_bytes()
    }

    /// Returns the node ID.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Verifies a signature made by this peer.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        self.verifying_key
            .verify(message, &signature.as_ed25519())
            .map_err(ProtocolError::from)
    }

    /// Human-readable fingerprint of the node ID.
    pub fn fingerprint(&self) -> String {
        self.node_id.fingerprint()
    }
}
