//! Serial frame codec for the acknowledged profile.
//!
//! ```text
//! +--------+--------+--------+---------------------+----------+
//! | marker |  type  | length | payload (length B)  | checksum |
//! |  0xAA  |   u8   |   u8   |                     |    u8    |
//! +--------+--------+--------+---------------------+----------+
//! ```
//!
//! `checksum` is the XOR of `type`, `length` and every payload byte. The
//! marker is excluded; it only exists so a reader can find the next frame
//! after garbage on the line. This module has no knowledge of files or
//! sessions; it turns frames into bytes and back.

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

/// Start-of-frame marker.
pub const FRAME_MARKER: u8 = 0xAA;

/// Largest payload a single frame can carry (length is one byte).
pub const MAX_FRAME_PAYLOAD: usize = u8::MAX as usize;

/// Bytes before the payload: marker, type, length.
pub const FRAME_HEADER_LEN: usize = 3;

/// COMMIT status: receiver stored exactly the announced number of bytes.
pub const COMMIT_OK: u8 = 0x00;

/// COMMIT status: byte count did not match the size announced in START.
pub const COMMIT_SIZE_MISMATCH: u8 = 0x01;

/// COMMIT status: receiver could not persist the data.
pub const COMMIT_STORAGE_ERROR: u8 = 0x02;

/// Frame types on the serial link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Payload: 4-byte little-endian total size.
    Start = 0x01,
    /// Payload: up to 255 bytes of log data.
    Data = 0x02,
    /// No payload.
    End = 0x03,
    /// No payload. Acknowledges the last frame received.
    Ack = 0x04,
    /// Payload: one status byte, `COMMIT_OK` on success.
    Commit = 0x05,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameType::Start),
            0x02 => Ok(FrameType::Data),
            0x03 => Ok(FrameType::End),
            0x04 => Ok(FrameType::Ack),
            0x05 => Ok(FrameType::Commit),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

/// Fixed prefix of every frame.
///
/// Wire size: 3 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct FrameHeader {
    pub marker: u8,
    pub frame_type: u8,
    pub length: u8,
}

assert_eq_size!(FrameHeader, [u8; FRAME_HEADER_LEN]);

/// XOR of type, length and payload.
pub fn checksum(frame_type: u8, length: u8, payload: &[u8]) -> u8 {
    payload.iter().fold(frame_type ^ length, |acc, b| acc ^ b)
}

/// One decoded frame. The checksum is implicit: a `Frame` value only
/// exists if it verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: Bytes) -> Result<Self, FrameError> {
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            frame_type,
            payload,
        })
    }

    pub fn start(total_size: u32) -> Self {
        Self {
            frame_type: FrameType::Start,
            payload: Bytes::copy_from_slice(&total_size.to_le_bytes()),
        }
    }

    pub fn data(payload: Bytes) -> Result<Self, FrameError> {
        Self::new(FrameType::Data, payload)
    }

    pub fn end() -> Self {
        Self::empty(FrameType::End)
    }

    pub fn ack() -> Self {
        Self::empty(FrameType::Ack)
    }

    pub fn commit(status: u8) -> Self {
        Self {
            frame_type: FrameType::Commit,
            payload: Bytes::copy_from_slice(&[status]),
        }
    }

    fn empty(frame_type: FrameType) -> Self {
        Self {
            frame_type,
            payload: Bytes::new(),
        }
    }

    /// Size announced by a START frame.
    pub fn start_size(&self) -> Option<u32> {
        if self.frame_type != FrameType::Start {
            return None;
        }
        let raw: [u8; 4] = self.payload.get(..4)?.try_into().ok()?;
        Some(u32::from_le_bytes(raw))
    }

    /// Status byte of a COMMIT frame.
    pub fn commit_status(&self) -> Option<u8> {
        if self.frame_type != FrameType::Commit {
            return None;
        }
        self.payload.first().copied()
    }

    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.payload.len() + 1
    }

    pub fn encode(&self) -> Bytes {
        let length = self.payload.len() as u8;
        let header = FrameHeader {
            marker: FRAME_MARKER,
            frame_type: self.frame_type as u8,
            length,
        };
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(header.as_bytes());
        buf.put_slice(&self.payload);
        buf.put_u8(checksum(header.frame_type, length, &self.payload));
        buf.freeze()
    }

    /// Verify a frame body (`length` payload bytes followed by the checksum)
    /// read after a header.
    pub fn from_parts(frame_type: u8, length: u8, body: &[u8]) -> Result<Self, FrameError> {
        let len = usize::from(length);
        if body.len() != len + 1 {
            return Err(FrameError::Incomplete);
        }
        let (payload, tail) = body.split_at(len);
        let expected = checksum(frame_type, length, payload);
        if tail[0] != expected {
            return Err(FrameError::ChecksumMismatch {
                expected,
                got: tail[0],
            });
        }
        Ok(Self {
            frame_type: FrameType::try_from(frame_type)?,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    /// Decode the first frame in `buf`, skipping bytes before a marker.
    ///
    /// Returns the frame and the number of bytes consumed. On a checksum or
    /// type error the caller should drop everything up to and including the
    /// bad marker and scan again.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), FrameError> {
        let start = buf
            .iter()
            .position(|&b| b == FRAME_MARKER)
            .ok_or(FrameError::Incomplete)?;
        let rest = &buf[start..];
        let header = FrameHeader::read_from_prefix(rest).ok_or(FrameError::Incomplete)?;
        let body_len = usize::from(header.length) + 1;
        let body = rest
            .get(FRAME_HEADER_LEN..FRAME_HEADER_LEN + body_len)
            .ok_or(FrameError::Incomplete)?;
        let frame = Self::from_parts(header.frame_type, header.length, body)?;
        Ok((frame, start + FRAME_HEADER_LEN + body_len))
    }
}

/// Reasons a frame is discarded. None of these ever reach a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame incomplete")]
    Incomplete,

    #[error("checksum mismatch: computed 0x{expected:02x}, received 0x{got:02x}")]
    ChecksumMismatch { expected: u8, got: u8 },

    #[error("unknown frame type: 0x{0:02x}")]
    UnknownType(u8),

    #[error("payload length {0} exceeds maximum {}", MAX_FRAME_PAYLOAD)]
    PayloadTooLarge(usize),
}
