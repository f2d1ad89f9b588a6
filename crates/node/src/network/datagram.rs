//! Unreliable datagram channel.
//!
//! Each QUIC datagram is `tag: u8 ‖ payload`. Handlers are registered per
//! tag on the node and shared by all of its connections; datagrams with no
//! handler are logged and dropped.

use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use protocol::error::{ProtocolError, Result};
use tracing::{debug, warn};

use super::stream::connection_error;
use crate::lifecycle::LifecycleContext;
use crate::registry::ConnectionId;

/// Callback invoked for each datagram with a given tag.
pub type DatagramHandler = Arc<dyn Fn(ConnectionId, Bytes) + Send + Sync>;

/// Tag-indexed datagram handlers.
#[derive(Default)]
pub struct DatagramHandlers {
    handlers: DashMap<u8, DatagramHandler>,
}

impl DatagramHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handler` for `tag`, replacing any previous one.
    pub fn register(&self, tag: u8, handler: DatagramHandler) {
        self.handlers.insert(tag, handler);
    }

    /// Remove the handler for `tag`.
    pub fn unregister(&self, tag: u8) -> bool {
        self.handlers.remove(&tag).is_some()
    }

    /// Deliver a tagged payload. Returns false if no handler took it.
    pub fn dispatch(&self, conn_id: ConnectionId, tag: u8, payload: Bytes) -> bool {
        // Clone out of the map so the handler runs without holding a shard lock.
        let handler = self.handlers.get(&tag).map(|h| Arc::clone(h.value()));
        match handler {
            Some(handler) => {
                handler(conn_id, payload);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for DatagramHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<u8> = self.handlers.iter().map(|e| *e.key()).collect();
        tags.sort_unstable();
        f.debug_struct("DatagramHandlers").field("tags", &tags).finish()
    }
}

/// Prefix `payload` with its tag.
pub fn encode_datagram(tag: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + payload.len());
    buf.put_u8(tag);
    buf.put_slice(payload);
    buf.freeze()
}

/// Split a datagram into tag and payload.
pub fn decode_datagram(mut datagram: Bytes) -> Option<(u8, Bytes)> {
    if datagram.is_empty() {
        return None;
    }
    let payload = datagram.split_off(1);
    Some((datagram[0], payload))
}

/// Send one tagged datagram.
pub fn send_datagram(conn: &quinn::Connection, tag: u8, payload: &[u8]) -> Result<()> {
    use quinn::SendDatagramError;

    conn.send_datagram(encode_datagram(tag, payload))
        .map_err(|err| match err {
            SendDatagramError::UnsupportedByPeer | SendDatagramError::Disabled => {
                ProtocolError::UnsupportedTransport(err.to_string())
            }
            SendDatagramError::TooLarge => ProtocolError::FrameTooLarge {
                size: payload.len() + 1,
                max: conn.max_datagram_size().unwrap_or(0),
            },
            SendDatagramError::ConnectionLost(err) => connection_error(err),
        })
}

/// Receive datagrams until the connection or `ctx` ends.
///
/// Returns the transport error that ended the loop, or `Ok` on
/// cancellation.
pub async fn receive_loop(
    conn: quinn::Connection,
    conn_id: ConnectionId,
    handlers: Arc<DatagramHandlers>,
    ctx: LifecycleContext,
) -> Result<()> {
    loop {
        let datagram = tokio::select! {
            _ = ctx.cancelled() => return Ok(()),
            received = conn.read_datagram() => received.map_err(connection_error)?,
        };

        match decode_datagram(datagram) {
            Some((tag, payload)) => {
                let len = payload.len();
                if handlers.dispatch(conn_id, tag, payload) {
                    debug!(conn_id = %conn_id, tag, len, "Datagram delivered");
                } else {
                    warn!(conn_id = %conn_id, tag, len, "No handler for datagram tag, dropped");
                }
            }
            None => warn!(conn_id = %conn_id, "Empty datagram dropped"),
        }
    }
}
