//! Per-connection feature flags exchanged in the hello packet.
//!
//! A config is an ordered set of `name=value` entries rendered as
//! `<name1=value1;name2=value2>` (empty: `<>`). Names are restricted to
//! `[A-Za-z0-9_-]+`; values are form-encoded so they may carry any text.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::form_urlencoded;

use crate::error::{ProtocolError, Result};

/// Entry enabling automatic routing-table exchange.
pub const AUTO_ROUTING: &str = "auto-routing";

/// Entry enabling traffic forwarding on behalf of the peer.
pub const TRAFFIC_FORWARDING: &str = "traffic-forwarding";

/// Canonical value for an enabled flag.
pub const ENABLED: &str = "yes";

/// A single `name=value` entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigEntry {
    /// Entry name, `[A-Za-z0-9_-]+`.
    pub name: String,
    /// Decoded value.
    pub value: String,
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ProtocolError::InvalidConfigName(name.to_string()))
    }
}

/// Ordered set of feature entries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionConfig {
    entries: Vec<ConfigEntry>,
}

impl ConnectionConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `name` to `value`, replacing any previous value for `name`.
    pub fn add(&mut self, name: &str, value: &str) -> Result<()> {
        validate_name(name)?;
        match self.entries.iter_mut().find(|e| e.name == name) {
            Some(entry) => entry.value = value.to_string(),
            None => self.entries.push(ConfigEntry {
                name: name.to_string(),
                value: value.to_string(),
            }),
        }
        Ok(())
    }

    /// Builder form of [`add`](Self::add).
    pub fn with(mut self, name: &str, value: &str) -> Result<Self> {
        self.add(name, value)?;
        Ok(self)
    }

    /// Value of `name`, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value.as_str())
    }

    /// All entries in insertion order.
    pub fn list(&self) -> &[ConfigEntry] {
        &self.entries
    }

    /// Whether an entry named `name` exists.
    pub fn has_entry(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Whether `name` exists with exactly `value`.
    pub fn has_entry_with_value(&self, name: &str, value: &str) -> bool {
        self.get(name) == Some(value)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the config has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `auto-routing=yes` is present.
    pub fn auto_routing(&self) -> bool {
        self.has_entry_with_value(AUTO_ROUTING, ENABLED)
    }

    /// Whether `traffic-forwarding=yes` is present.
    pub fn traffic_forwarding(&self) -> bool {
        self.has_entry_with_value(TRAFFIC_FORWARDING, ENABLED)
    }

    /// Entries present on both sides with equal values, in remote order.
    pub fn intersect(remote: &ConnectionConfig, local: &ConnectionConfig) -> ConnectionConfig {
        let entries = remote
            .entries
            .iter()
            .filter(|e| local.has_entry_with_value(&e.name, &e.value))
            .cloned()
            .collect();
        ConnectionConfig { entries }
    }
}

impl fmt::Display for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<")?;
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            let value: String = form_urlencoded::byte_serialize(entry.value.as_bytes()).collect();
            write!(f, "{}={}", entry.name, value)?;
        }
        f.write_str(">")
    }
}

impl FromStr for ConnectionConfig {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        let inner = s
            .trim()
            .strip_prefix('<')
            .and_then(|rest| rest.strip_suffix('>'))
            .ok_or_else(|| {
                ProtocolError::InvalidConfig(format!("missing angle brackets: {:?}", s))
            })?;

        let mut config = ConnectionConfig::new();
        for raw in inner.split(';').filter(|raw| !raw.is_empty()) {
            if !raw.contains('=') || raw.contains('&') {
                return Err(ProtocolError::InvalidConfig(format!(
                    "malformed entry: {:?}",
                    raw
                )));
            }
            let (name, value) = form_urlencoded::parse(raw.as_bytes())
                .next()
                .ok_or_else(|| {
                    ProtocolError::InvalidConfig(format!("malformed entry: {:?}", raw))
                })?;
            config.add(&name, &value)?;
        }
        Ok(config)
    }
}

impl Serialize for ConnectionConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ConnectionConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
