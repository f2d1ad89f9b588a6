//! Frame codec for splitting messages into checksummed, sequenced frames.
//!
//! # Frame Format
//!
//! Each frame consists of a 21-byte big-endian header followed by the body:
//! - 4 bytes: body length
//! - 4 bytes: CRC32 (IEEE) of the body, 0 for an empty body
//! - 4 bytes: process id, random per logical write
//! - 8 bytes: frame number, counting from 0 within one logical write
//! - 1 byte: last-frame flag (0 or 1)
//! - N bytes: body
//!
//! # Messages
//!
//! A message is split into frames of at most `frame_size` bytes on the wire.
//! Exactly one frame per message carries the last-frame flag and it is the
//! final one emitted. An empty message is a single empty frame.

use crate::error::{ProtocolError, Result};

/// Frame header size: 4 (length) + 4 (checksum) + 4 (process id) + 8 (frame no) + 1 (last).
pub const FRAME_HEADER_SIZE: usize = 21;

/// Default on-wire frame size, header included.
pub const DEFAULT_FRAME_SIZE: usize = 1024;

/// Default cap on frames per message (1 MiB / 32).
pub const MAX_FRAMES_PER_MESSAGE: u64 = 1024 * 1024 / 32;

/// Largest body a decoder will allocate for a single frame (1 MiB).
pub const MAX_FRAME_BODY_SIZE: usize = 1024 * 1024;

/// Largest message an assembler buffers by default: `MAX_FRAMES_PER_MESSAGE`
/// full bodies at the default frame size.
pub const MAX_MESSAGE_SIZE: usize =
    MAX_FRAMES_PER_MESSAGE as usize * (DEFAULT_FRAME_SIZE - FRAME_HEADER_SIZE);

/// Returns the body capacity of a frame of `frame_size` bytes.
pub fn body_capacity(frame_size: usize) -> Result<usize> {
    if frame_size <= FRAME_HEADER_SIZE {
        return Err(ProtocolError::InvalidFrameSize {
            size: frame_size,
            header: FRAME_HEADER_SIZE,
        });
    }
    Ok(frame_size - FRAME_HEADER_SIZE)
}

/// Computes the CRC32 (IEEE) checksum of a frame body.
#[inline]
pub fn checksum(body: &[u8]) -> u32 {
    if body.is_empty() {
        0
    } else {
        crc32fast::hash(body)
    }
}

/// The fixed-size header preceding every frame body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Number of body bytes following the header.
    pub data_length: u32,
    /// CRC32 of the body.
    pub checksum: u32,
    /// Random identifier shared by all frames of one logical write.
    pub process_id: u32,
    /// Position of this frame within its message.
    pub frame_no: u64,
    /// Set on the final frame of a message.
    pub last_frame: bool,
}

impl FrameHeader {
    /// Encode the header into its 21-byte wire form.
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut out = [0u8; FRAME_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.data_length.to_be_bytes());
        out[4..8].copy_from_slice(&self.checksum.to_be_bytes());
        out[8..12].copy_from_slice(&self.process_id.to_be_bytes());
        out[12..20].copy_from_slice(&self.frame_no.to_be_bytes());
        out[20] = u8::from(self.last_frame);
        out
    }

    /// Decode a header from its 21-byte wire form.
    pub fn decode(bytes: &[u8; FRAME_HEADER_SIZE]) -> Self {
        let u32_at =
            |i: usize| u32::from_be_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let mut frame_no = [0u8; 8];
        frame_no.copy_from_slice(&bytes[12..20]);

        Self {
            data_length: u32_at(0),
            checksum: u32_at(4),
            process_id: u32_at(8),
            frame_no: u64::from_be_bytes(frame_no),
            last_frame: bytes[20] != 0,
        }
    }

    /// Reject headers announcing bodies larger than a decoder will buffer.
    pub fn check_length(&self) -> Result<usize> {
        let len = self.data_length as usize;
        if len > MAX_FRAME_BODY_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: len + FRAME_HEADER_SIZE,
                max: MAX_FRAME_BODY_SIZE + FRAME_HEADER_SIZE,
            });
        }
        Ok(len)
    }
}

/// A frame containing a header and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The frame header.
    pub header: FrameHeader,
    /// The body bytes.
    pub body: Vec<u8>,
}

impl Frame {
    /// Create a frame, computing length and checksum from the body.
    pub fn new(body: Vec<u8>, process_id: u32, frame_no: u64, last_frame: bool) -> Self {
        let header = FrameHeader {
            data_length: body.len() as u32,
            checksum: checksum(&body),
            process_id,
            frame_no,
            last_frame,
        };
        Self { header, body }
    }

    /// Number of bytes this frame occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.body.len()
    }

    /// Check the body against the header checksum.
    pub fn verify(&self) -> Result<()> {
        let actual = checksum(&self.body);
        if actual != self.header.checksum {
            return Err(ProtocolError::ChecksumMismatch {
                frame_no: self.header.frame_no,
                expected: self.header.checksum,
                actual,
            });
        }
        Ok(())
    }

    /// Encode the frame into bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&self.header.encode());
        out.extend_from_slice(&self.body);
        out
    }

    /// Decode a frame from the start of `data`.
    ///
    /// Returns the verified frame and the number of bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(ProtocolError::Deserialization(format!(
                "insufficient data for header: need {} bytes, got {}",
                FRAME_HEADER_SIZE,
                data.len()
            )));
        }

        let mut raw = [0u8; FRAME_HEADER_SIZE];
        raw.copy_from_slice(&data[..FRAME_HEADER_SIZE]);
        let header = FrameHeader::decode(&raw);
        let len = header.check_length()?;

        let total = FRAME_HEADER_SIZE + len;
        if data.len() < total {
            return Err(ProtocolError::Deserialization(format!(
                "insufficient data for body: need {} bytes, got {}",
                total,
                data.len()
            )));
        }

        let frame = Self {
            header,
            body: data[FRAME_HEADER_SIZE..total].to_vec(),
        };
        frame.verify()?;
        Ok((frame, total))
    }
}

/// Splits messages into frames for a given frame size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    frame_size: usize,
    max_frames: u64,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            frame_size: DEFAULT_FRAME_SIZE,
            max_frames: MAX_FRAMES_PER_MESSAGE,
        }
    }
}

impl FrameCodec {
    /// Create a codec. Fails if `frame_size` leaves no room for a body.
    pub fn new(frame_size: usize, max_frames: u64) -> Result<Self> {
        body_capacity(frame_size)?;
        Ok(Self {
            frame_size,
            max_frames: max_frames.max(1),
        })
    }

    /// On-wire frame size, header included.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Maximum frames in one message.
    pub fn max_frames(&self) -> u64 {
        self.max_frames
    }

    /// Body bytes carried per frame.
    pub fn body_capacity(&self) -> usize {
        self.frame_size - FRAME_HEADER_SIZE
    }

    /// Number of frames a payload of `len` bytes splits into.
    pub fn frame_count(&self, len: usize) -> u64 {
        if len == 0 {
            1
        } else {
            len.div_ceil(self.body_capacity()) as u64
        }
    }

    /// Split `payload` into frames tagged with `process_id`.
    pub fn encode(&self, payload: &[u8], process_id: u32) -> Result<Vec<Frame>> {
        let count = self.frame_count(payload.len());
        if count > self.max_frames {
            return Err(ProtocolError::TooManyFrames {
                max: self.max_frames,
            });
        }

        if payload.is_empty() {
            return Ok(vec![Frame::new(Vec::new(), process_id, 0, true)]);
        }

        let frames = payload
            .chunks(self.body_capacity())
            .enumerate()
            .map(|(i, chunk)| {
                let frame_no = i as u64;
                Frame::new(chunk.to_vec(), process_id, frame_no, frame_no + 1 == count)
            })
            .collect();
        Ok(frames)
    }

    /// Split `payload` into frames under a fresh random process id.
    pub fn encode_message(&self, payload: &[u8]) -> Result<Vec<Frame>> {
        self.encode(payload, rand::random())
    }

    /// Largest message this codec can encode.
    pub fn max_message_size(&self) -> usize {
        usize::try_from(self.max_frames)
            .unwrap_or(usize::MAX)
            .saturating_mul(self.body_capacity())
    }

    /// Create an assembler accepting exactly what this codec can encode.
    pub fn assembler(&self) -> FrameAssembler {
        FrameAssembler::with_limits(self.max_frames, self.max_message_size())
    }
}

/// Reassembles frames of one message, enforcing sequence and size limits.
#[derive(Debug)]
pub struct FrameAssembler {
    max_frames: u64,
    max_message_size: usize,
    next_frame_no: u64,
    buffer: Vec<u8>,
}

impl FrameAssembler {
    /// Create an assembler accepting at most `max_frames` frames and
    /// [`MAX_MESSAGE_SIZE`] bytes per message.
    pub fn new(max_frames: u64) -> Self {
        Self::with_limits(max_frames, MAX_MESSAGE_SIZE)
    }

    /// Create an assembler with explicit frame and byte limits.
    pub fn with_limits(max_frames: u64, max_message_size: usize) -> Self {
        Self {
            max_frames,
            max_message_size,
            next_frame_no: 0,
            buffer: Vec::new(),
        }
    }

    /// Byte limit for one message.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Number of frames accepted for the message in progress.
    pub fn frames_read(&self) -> u64 {
        self.next_frame_no
    }

    /// Accept the next frame.
    ///
    /// Returns the full payload once the last frame arrives. Any error leaves
    /// the assembler in an unspecified state; the stream must be abandoned.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Vec<u8>>> {
        if frame.header.frame_no != self.next_frame_no {
            return Err(ProtocolError::FrameOutOfSequence {
                expected: self.next_frame_no,
                got: frame.header.frame_no,
            });
        }
        if self.next_frame_no >= self.max_frames {
            return Err(ProtocolError::TooManyFrames {
                max: self.max_frames,
            });
        }
        frame.verify()?;

        let size = self.buffer.len() + frame.body.len();
        if size > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }

        self.next_frame_no += 1;
        self.buffer.extend_from_slice(&frame.body);

        if frame.header.last_frame {
            self.next_frame_no = 0;
            return Ok(Some(std::mem::take(&mut self.buffer)));
        }
        Ok(None)
    }
}
