//! Registry of live connections.
//!
//! Each [`Node`](crate::Node) owns one [`ConnectionManager`]. Connections
//! are added once their handshake completes and removed by their own
//! teardown; [`ConnectionManager::snapshot`] is the only way to enumerate
//! them.

use std::fmt;
use std::str::FromStr;

use dashmap::DashMap;
use uuid::Uuid;

use crate::lifecycle::CloseReason;
use crate::network::ConnectionHandle;

/// Unique identifier of a connection within a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// A fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConnectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Thread-safe map of connection id to handle.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    connections: DashMap<ConnectionId, ConnectionHandle>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `handle`. Returns false if its id was already present.
    pub fn add(&self, handle: ConnectionHandle) -> bool {
        let id = handle.id();
        let fresh = self.connections.insert(id, handle).is_none();
        tracing::debug!(conn_id = %id, total = self.connections.len(), "Connection registered");
        fresh
    }

    /// Stop tracking `id`.
    pub fn remove(&self, id: &ConnectionId) -> Option<ConnectionHandle> {
        let removed = self.connections.remove(id).map(|(_, handle)| handle);
        if removed.is_some() {
            tracing::debug!(
                conn_id = %id,
                total = self.connections.len(),
                "Connection unregistered"
            );
        }
        removed
    }

    pub fn get(&self, id: &ConnectionId) -> Option<ConnectionHandle> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Handles of every registered connection at this instant.
    pub fn snapshot(&self) -> Vec<ConnectionHandle> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Close every connection and wait until each has been torn down.
    pub async fn close_all(&self) {
        let handles = self.snapshot();
        if handles.is_empty() {
            return;
        }
        tracing::info!(count = handles.len(), "Closing all connections");

        for handle in &handles {
            handle.close();
        }
        for handle in handles {
            let reason: CloseReason = handle.closed().await;
            tracing::debug!(conn_id = %handle.id(), %reason, "Connection closed by shutdown");
        }
    }
}
