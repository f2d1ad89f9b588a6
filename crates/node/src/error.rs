//! Node-level setup errors.
//!
//! These are returned synchronously by `Node::listen` and `Node::connect`
//! before any connection exists. Failures of a live connection are
//! [`ProtocolError`]s and end up as a [`CloseReason`](crate::CloseReason).

use std::net::SocketAddr;

use protocol::ProtocolError;
use thiserror::Error;

/// Errors raised while setting up listeners or outbound connections.
#[derive(Error, Debug)]
pub enum SetupError {
    /// The peer URI could not be parsed or has forbidden parts.
    #[error("invalid peer URI: {0}")]
    InvalidUri(String),

    /// The URI scheme is not `quic`.
    #[error("unsupported URI scheme '{0}', expected 'quic'")]
    UnsupportedScheme(String),

    /// The host could not be resolved or classified.
    #[error("cannot resolve host '{0}'")]
    UnresolvableHost(String),

    /// The node already has a listener.
    #[error("node is already listening on {0}")]
    AlreadyListening(SocketAddr),

    /// The local bind address is unusable.
    #[error("invalid local address: {0}")]
    InvalidLocalAddress(String),

    /// TLS or QUIC crypto configuration failed.
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// The node has been shut down.
    #[error("node is shut down")]
    ShutDown,

    /// Socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The handshake or transport failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Result type alias for node setup.
pub type SetupResult<T> = std::result::Result<T, SetupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_error_display() {
        let err = SetupError::UnsupportedScheme("tcp".into());
        assert_eq!(err.to_string(), "unsupported URI scheme 'tcp', expected 'quic'");

        let err = SetupError::AlreadyListening("127.0.0.1:4000".parse().unwrap());
        assert_eq!(err.to_string(), "node is already listening on 127.0.0.1:4000");
    }

    #[test]
    fn test_protocol_error_is_transparent() {
        let err = SetupError::from(ProtocolError::VersionRejected("too old".into()));
        assert_eq!(err.to_string(), "version rejected: too old");
    }
}
