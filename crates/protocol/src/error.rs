//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Cryptographic errors
    /// Signature verification failed.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Invalid or malformed public key.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    // Handshake errors
    /// The hello exchange could not be completed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The peer announced a version this node does not accept, or does not
    /// accept ours.
    #[error("version rejected: {0}")]
    VersionRejected(String),

    /// The two supported-version lists are disjoint.
    #[error("no common protocol version: local supports [{local}], peer supports [{remote}]")]
    NoCommonVersion {
        /// Versions supported locally.
        local: String,
        /// Versions offered by the peer.
        remote: String,
    },

    // Frame errors
    /// Frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// The configured frame size leaves no room for a body.
    #[error("invalid frame size: {size} bytes, must be larger than the {header} byte header")]
    InvalidFrameSize {
        /// Requested frame size.
        size: usize,
        /// Header size.
        header: usize,
    },

    /// Frame body does not match its CRC32.
    #[error("checksum mismatch on frame {frame_no}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Frame number within the message.
        frame_no: u64,
        /// Checksum carried in the header.
        expected: u32,
        /// Checksum computed over the received body.
        actual: u32,
    },

    /// A frame arrived with an unexpected sequence number.
    #[error("frame out of sequence: expected frame {expected}, got {got}")]
    FrameOutOfSequence {
        /// Next expected frame number.
        expected: u64,
        /// Frame number received.
        got: u64,
    },

    /// A message would span more frames than the transport allows.
    #[error("too many frames: message exceeds {max} frames")]
    TooManyFrames {
        /// Maximum frames per message.
        max: u64,
    },

    /// A message being reassembled outgrew the buffering limit.
    #[error("message too large: {size} bytes exceeds maximum of {max} bytes")]
    MessageTooLarge {
        /// Bytes the message would occupy with the latest frame.
        size: usize,
        /// Maximum message size.
        max: usize,
    },

    /// A local-socket acknowledgment did not match the frame just written.
    #[error("acknowledgment mismatch: {0}")]
    AckMismatch(String),

    // Packet errors
    /// A packet carried a tag that no handler is registered for.
    #[error("unknown packet type: {tag:#06x}")]
    UnknownPacketType {
        /// The 2-byte tag, big-endian.
        tag: u16,
    },

    /// A packet was too short or its body was malformed.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// A keepalive reply referenced a challenge this node never sent.
    #[error("unknown keepalive reply: {0}")]
    UnknownKeepaliveReply(String),

    // Configuration errors
    /// Config entry name contains characters outside `[A-Za-z0-9_-]`.
    #[error("invalid config name: {0:?}")]
    InvalidConfigName(String),

    /// Config string is not of the form `<name=value;...>`.
    #[error("invalid config string: {0}")]
    InvalidConfig(String),

    // Connection errors
    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// An I/O operation was interrupted and may be retried.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// The raw handle is not a supported byte-stream transport.
    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// QUIC endpoint or connection failure.
    #[error("quic error: {0}")]
    Quic(String),

    /// Data transfer failed.
    #[error("transfer failed: {0}")]
    TransferFailed(String),
}

impl ProtocolError {
    /// Returns true for errors a writer may retry after a short backoff.
    pub fn is_temporary(&self) -> bool {
        matches!(self, ProtocolError::TransientIo(_) | ProtocolError::Timeout(_))
    }

    /// Returns true if the error means the peer or transport went away.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, ProtocolError::ConnectionClosed(_))
    }

    /// Returns true for violations of the wire protocol. These are never retried.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ProtocolError::ChecksumMismatch { .. }
                | ProtocolError::FrameOutOfSequence { .. }
                | ProtocolError::UnknownPacketType { .. }
                | ProtocolError::MalformedPacket(_)
                | ProtocolError::UnknownKeepaliveReply(_)
                | ProtocolError::AckMismatch(_)
                | ProtocolError::VersionRejected(_)
                | ProtocolError::InvalidSignature(_)
                | ProtocolError::HandshakeFailed(_)
                | ProtocolError::Deserialization(_)
        )
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(err.to_string())
    }
}

impl From<ed25519_dalek::SignatureError> for ProtocolError {
    fn from(err: ed25519_dalek::SignatureError) -> Self {
        ProtocolError::InvalidSignature(err.to_string())
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            ErrorKind::Interrupted | ErrorKind::WouldBlock => {
                ProtocolError::TransientIo(err.to_string())
            }
            _ => ProtocolError::TransferFailed(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialization_error_display() {
        let err = ProtocolError::Serialization("invalid utf-8".to_string());
        assert_eq!(err.to_string(), "serialization failed: invalid utf-8");
    }

    #[test]
    fn test_checksum_mismatch_display() {
        let err = ProtocolError::ChecksumMismatch {
            frame_no: 2,
            expected: 0xDEADBEEF,
            actual: 0x1,
        };
        assert_eq!(
            err.to_string(),
            "checksum mismatch on frame 2: expected 0xdeadbeef, got 0x00000001"
        );
    }

    #[test]
    fn test_frame_out_of_sequence_display() {
        let err = ProtocolError::FrameOutOfSequence {
            expected: 2,
            got: 3,
        };
        assert_eq!(
            err.to_string(),
            "frame out of sequence: expected frame 2, got 3"
        );
    }

    #[test]
    fn test_invalid_frame_size_display() {
        let err = ProtocolError::InvalidFrameSize {
            size: 21,
            header: 21,
        };
        assert_eq!(
            err.to_string(),
            "invalid frame size: 21 bytes, must be larger than the 21 byte header"
        );
    }

    #[test]
    fn test_unknown_packet_type_display() {
        let err = ProtocolError::UnknownPacketType { tag: 0x0909 };
        assert_eq!(err.to_string(), "unknown packet type: 0x0909");
    }

    #[test]
    fn test_no_common_version_display() {
        let err = ProtocolError::NoCommonVersion {
            local: "1, 3".to_string(),
            remote: "2".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "no common protocol version: local supports [1, 3], peer supports [2]"
        );
    }

    #[test]
    fn test_frame_too_large_error_display() {
        let err = ProtocolError::FrameTooLarge {
            size: 100_000,
            max: 65536,
        };
        assert_eq!(
            err.to_string(),
            "frame too large: 100000 bytes exceeds maximum of 65536 bytes"
        );
    }

    #[test]
    fn test_message_too_large_error_display() {
        let err = ProtocolError::MessageTooLarge {
            size: 40_000_000,
            max: 32_866_304,
        };
        assert_eq!(
            err.to_string(),
            "message too large: 40000000 bytes exceeds maximum of 32866304 bytes"
        );
        assert!(!err.is_protocol_violation());
    }

    #[test]
    fn test_connection_closed_error_display() {
        let err = ProtocolError::ConnectionClosed("peer disconnected".to_string());
        assert_eq!(err.to_string(), "connection closed: peer disconnected");
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let protocol_err: ProtocolError = json_err.into();
        assert!(matches!(protocol_err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_from_rmp_serde_decode_error() {
        #[derive(Debug, serde::Deserialize)]
        #[allow(dead_code)]
        struct TestStruct {
            field: String,
        }
        let msgpack_err = rmp_serde::from_slice::<TestStruct>(&[0x00]).unwrap_err();
        let protocol_err: ProtocolError = msgpack_err.into();
        assert!(matches!(protocol_err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_from_io_error_timeout() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::Timeout(_)));
        assert!(protocol_err.is_temporary());
    }

    #[test]
    fn test_from_io_error_eof_is_closed() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let protocol_err: ProtocolError = io_err.into();
        assert!(protocol_err.is_connection_closed());
        assert!(!protocol_err.is_temporary());
    }

    #[test]
    fn test_from_io_error_interrupted_is_temporary() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Interrupted, "signal");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::TransientIo(_)));
        assert!(protocol_err.is_temporary());
    }

    #[test]
    fn test_from_io_error_other() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::TransferFailed(_)));
    }

    #[test]
    fn test_protocol_violations_are_not_temporary() {
        let err = ProtocolError::FrameOutOfSequence {
            expected: 1,
            got: 5,
        };
        assert!(err.is_protocol_violation());
        assert!(!err.is_temporary());

        let err = ProtocolError::Timeout("keepalive".into());
        assert!(!err.is_protocol_violation());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }
}
