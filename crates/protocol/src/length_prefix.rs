//! 8-byte little-endian length prefix used for handshake packets.
//!
//! Hello packets are exchanged before frame I/O starts on a stream and are
//! carried as `length: u64 LE ‖ payload`.

use crate::error::{ProtocolError, Result};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 8;

/// Upper bound on a length-prefixed payload (64 KiB).
pub const MAX_PREFIXED_PAYLOAD: u64 = 64 * 1024;

/// Encode a payload length as the 8-byte prefix.
pub fn encode_length(len: usize) -> [u8; LENGTH_PREFIX_SIZE] {
    (len as u64).to_le_bytes()
}

/// Decode the 8-byte prefix, rejecting lengths above `max`.
pub fn decode_length(prefix: [u8; LENGTH_PREFIX_SIZE], max: u64) -> Result<usize> {
    let len = u64::from_le_bytes(prefix);
    if len > max {
        return Err(ProtocolError::FrameTooLarge {
            size: len as usize,
            max: max as usize,
        });
    }
    Ok(len as usize)
}

/// Prepend the length prefix to `payload`.
pub fn encode_prefixed(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    out.extend_from_slice(&encode_length(payload.len()));
    out.extend_from_slice(payload);
    out
}

/// Split a prefixed buffer into its payload and the number of bytes consumed.
pub fn decode_prefixed(data: &[u8], max: u64) -> Result<(&[u8], usize)> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Deserialization(
            "insufficient data for length prefix".into(),
        ));
    }
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    prefix.copy_from_slice(&data[..LENGTH_PREFIX_SIZE]);
    let len = decode_length(prefix, max)?;

    let end = LENGTH_PREFIX_SIZE + len;
    if data.len() < end {
        return Err(ProtocolError::Deserialization(format!(
            "insufficient data for payload: need {} bytes, got {}",
            end,
            data.len()
        )));
    }
    Ok((&data[LENGTH_PREFIX_SIZE..end], end))
}
