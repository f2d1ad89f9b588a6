//! Per-connection lifecycle: cancellation scope, close reason and state.
//!
//! Every task belonging to a connection shares one [`LifecycleContext`].
//! The first task to fail cancels it with a [`CloseReason`]; later
//! cancellations are no-ops, so the reason is recorded and logged once.

use std::fmt;
use std::sync::{Arc, OnceLock};

use protocol::ProtocolError;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by this node.
    LocalClose,
    /// The peer or transport went away.
    PeerClosed(String),
    /// Keepalive or an operation deadline expired.
    Timeout(String),
    /// The peer violated the wire protocol.
    ProtocolViolation(String),
    /// Any other transport failure.
    Transport(String),
}

impl CloseReason {
    /// Classify an error that ended a connection task.
    pub fn from_error(err: &ProtocolError) -> Self {
        let msg = err.to_string();
        if err.is_connection_closed() {
            CloseReason::PeerClosed(msg)
        } else if matches!(err, ProtocolError::Timeout(_)) {
            CloseReason::Timeout(msg)
        } else if err.is_protocol_violation() {
            CloseReason::ProtocolViolation(msg)
        } else {
            CloseReason::Transport(msg)
        }
    }

    /// Whether the connection ended through a fault rather than a close request.
    pub fn is_error(&self) -> bool {
        !matches!(self, CloseReason::LocalClose | CloseReason::PeerClosed(_))
    }
}

impl From<&ProtocolError> for CloseReason {
    fn from(err: &ProtocolError) -> Self {
        CloseReason::from_error(err)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::LocalClose => write!(f, "closed locally"),
            CloseReason::PeerClosed(msg) => write!(f, "peer closed: {}", msg),
            CloseReason::Timeout(msg) => write!(f, "timeout: {}", msg),
            CloseReason::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            CloseReason::Transport(msg) => write!(f, "transport error: {}", msg),
        }
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport is being established.
    Connecting,
    /// Hello exchange in progress.
    Handshaking,
    /// Reader, writer and keepalive tasks are running.
    Active,
    /// Cancellation observed, tasks are winding down.
    Closing,
    /// Resources released and removed from the registry.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Active => "active",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Shared cancellation scope of one connection.
#[derive(Debug, Clone)]
pub struct LifecycleContext {
    token: CancellationToken,
    reason: Arc<OnceLock<CloseReason>>,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl LifecycleContext {
    /// A fresh context in the `Connecting` state.
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// A context cancelled together with `parent`.
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self::with_token(parent.child_token())
    }

    fn with_token(token: CancellationToken) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            token,
            reason: Arc::new(OnceLock::new()),
            state: Arc::new(state),
        }
    }

    /// Cancel with `reason`. Returns true if this call decided the reason.
    pub fn cancel(&self, reason: CloseReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.token.cancel();
        first
    }

    /// Cancel with the reason derived from `err`.
    pub fn fail(&self, err: &ProtocolError) -> bool {
        self.cancel(CloseReason::from_error(err))
    }

    /// Whether the context has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the context is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// The recorded reason. A context cancelled through its parent reports
    /// [`CloseReason::LocalClose`].
    pub fn reason(&self) -> Option<CloseReason> {
        if !self.is_cancelled() {
            return None;
        }
        Some(self.reason.get().cloned().unwrap_or(CloseReason::LocalClose))
    }

    /// A token cancelled with this context, for per-operation scopes.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Move to `state`.
    pub fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Resolves once the state reaches `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this only ends by matching.
        let _ = rx.wait_for(|state| *state == target).await;
    }
}

impl Default for LifecycleContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_cancel_wins() {
        let ctx = LifecycleContext::new();
        assert!(ctx.reason().is_none());

        assert!(ctx.cancel(CloseReason::Timeout("keepalive".into())));
        assert!(!ctx.cancel(CloseReason::LocalClose));
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.reason(), Some(CloseReason::Timeout("keepalive".into())));
    }

    #[test]
    fn test_clones_share_cancellation() {
        let ctx = LifecycleContext::new();
        let other = ctx.clone();
        let child = ctx.child_token();

        other.cancel(CloseReason::LocalClose);
        assert!(ctx.is_cancelled());
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_parent_cancellation_reports_local_close() {
        let parent = CancellationToken::new();
        let ctx = LifecycleContext::child_of(&parent);

        parent.cancel();
        assert_eq!(ctx.reason(), Some(CloseReason::LocalClose));
    }

    #[test]
    fn test_reason_from_error() {
        let reason = CloseReason::from_error(&ProtocolError::ConnectionClosed("eof".into()));
        assert!(matches!(reason, CloseReason::PeerClosed(_)));
        assert!(!reason.is_error());

        let reason = CloseReason::from_error(&ProtocolError::FrameOutOfSequence {
            expected: 1,
            got: 3,
        });
        assert!(matches!(reason, CloseReason::ProtocolViolation(_)));
        assert!(reason.is_error());

        let reason = CloseReason::from_error(&ProtocolError::Timeout("x".into()));
        assert!(matches!(reason, CloseReason::Timeout(_)));
    }

    #[tokio::test]
    async fn test_wait_for_state() {
        let ctx = LifecycleContext::new();
        assert_eq!(ctx.state(), ConnectionState::Connecting);

        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.wait_for_state(ConnectionState::Closed).await })
        };
        ctx.set_state(ConnectionState::Active);
        ctx.set_state(ConnectionState::Closed);

        waiter.await.unwrap();
        assert_eq!(ctx.state(), ConnectionState::Closed);
    }
}
