//! Protocol version numbers and the version agreement rule.
//!
//! A version is a single `u64` whose decimal digits pack four fields:
//!
//! ```text
//!   major   release   build    beta
//!  .....  |  dddd  | dddddd |  dd
//! ```
//!
//! so `100000001` renders as `0.1.0-Beta 1`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// A packed protocol version number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolVersion(pub u64);

impl ProtocolVersion {
    /// Beta number, 0 for a stable release.
    pub fn beta(self) -> u64 {
        self.0 % 100
    }

    /// Build number.
    pub fn build(self) -> u64 {
        (self.0 / 100) % 1_000_000
    }

    /// Release number.
    pub fn release(self) -> u64 {
        (self.0 / 100_000_000) % 10_000
    }

    /// Major number.
    pub fn major(self) -> u64 {
        self.0 / 10_000_000_000
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.release(), self.build())?;
        if self.beta() > 0 {
            write!(f, "-Beta {}", self.beta())?;
        }
        Ok(())
    }
}

impl From<u64> for ProtocolVersion {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Version spoken by this build.
pub const LOCAL_VERSION: ProtocolVersion = ProtocolVersion(100_000_001);

/// Versions this build can speak, in preference order.
pub const SUPPORTED_VERSIONS: &[ProtocolVersion] = &[LOCAL_VERSION];

/// Renders a version list for diagnostics.
pub fn format_versions(versions: &[ProtocolVersion]) -> String {
    versions
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Pick the agreed version: the first entry of the initiator's list that the
/// acceptor also supports.
pub fn negotiate(
    initiator: &[ProtocolVersion],
    acceptor: &[ProtocolVersion],
) -> Result<ProtocolVersion> {
    initiator
        .iter()
        .copied()
        .find(|v| acceptor.contains(v))
        .ok_or_else(|| ProtocolError::NoCommonVersion {
            local: format_versions(acceptor),
            remote: format_versions(initiator),
        })
}

/// Initiator's half of the version exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionOffer {
    /// Versions the initiator supports, in preference order.
    pub supported_versions: Vec<ProtocolVersion>,
}

/// Acceptor's answer. `None` means no common version exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionAnswer {
    /// The agreed version.
    pub agreed_version: Option<ProtocolVersion>,
}

impl VersionOffer {
    /// Encode as JSON.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from JSON.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl VersionAnswer {
    /// Encode as JSON.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from JSON.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
