//! Bridge frame codec: the relay hop from the radio base to the data host.
//!
//! ```text
//! +--------+--------+----------------+---------------------+----------+
//! | marker |  kind  | length (u16LE) | payload (length B)  | checksum |
//! |  0xAA  |   u8   |   lo  |   hi   |                     |    u8    |
//! +--------+--------+----------------+---------------------+----------+
//! ```
//!
//! `checksum` is the XOR of `kind`, both length bytes and every payload
//! byte. Unlike the acknowledged serial profile this hop is one-way and
//! unacknowledged: a frame that fails its checksum is dropped and the
//! relayed log is expected to be refused by the status that follows.

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, F32, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

pub const BRIDGE_MARKER: u8 = 0xAA;

/// Largest payload a bridge frame may carry.
pub const BRIDGE_MAX_PAYLOAD: usize = 200;

/// Marker, kind, two length bytes.
pub const BRIDGE_HEADER_LEN: usize = 4;

pub const CUT_RECORD_LEN: usize = 21;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BridgeKind {
    /// Payload: one `CutRecord`.
    CutRecord = 0x01,
    /// Payload: one `BridgeStatus` byte.
    Status = 0x02,
    /// Payload: raw log bytes, in order.
    LogLine = 0x03,
}

impl TryFrom<u8> for BridgeKind {
    type Error = BridgeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(BridgeKind::CutRecord),
            0x02 => Ok(BridgeKind::Status),
            0x03 => Ok(BridgeKind::LogLine),
            other => Err(BridgeError::UnknownKind(other)),
        }
    }
}

/// Link and transfer state reported to the data host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BridgeStatus {
    PeerConnected = 0x01,
    PeerDisconnected = 0x02,
    /// Drop anything buffered; log bytes follow.
    TransferStart = 0x03,
    /// Every log byte has been relayed.
    TransferDone = 0x04,
    /// The relayed log is incomplete and must be thrown away.
    TransferError = 0x05,
}

impl TryFrom<u8> for BridgeStatus {
    type Error = BridgeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(BridgeStatus::PeerConnected),
            0x02 => Ok(BridgeStatus::PeerDisconnected),
            0x03 => Ok(BridgeStatus::TransferStart),
            0x04 => Ok(BridgeStatus::TransferDone),
            0x05 => Ok(BridgeStatus::TransferError),
            other => Err(BridgeError::UnknownStatus(other)),
        }
    }
}

/// Wire size: 4 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct BridgeHeader {
    pub marker: u8,
    pub kind: u8,
    pub length: U16<LittleEndian>,
}

assert_eq_size!(BridgeHeader, [u8; BRIDGE_HEADER_LEN]);

/// One cut event as the base station packs it.
///
/// Wire size: 21 bytes.
#[derive(Debug, Clone, Copy, PartialEq, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct CutRecord {
    pub sequence_id: U32<LittleEndian>,
    /// Unix epoch seconds.
    pub timestamp: U32<LittleEndian>,
    pub latitude: F32<LittleEndian>,
    pub longitude: F32<LittleEndian>,
    /// Kilograms.
    pub force: F32<LittleEndian>,
    pub fix_type: u8,
}

assert_eq_size!(CutRecord, [u8; CUT_RECORD_LEN]);

/// XOR of kind, both length bytes and the payload.
pub fn bridge_checksum(kind: u8, length: u16, payload: &[u8]) -> u8 {
    let [lo, hi] = length.to_le_bytes();
    payload.iter().fold(kind ^ lo ^ hi, |acc, b| acc ^ b)
}

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeMessage {
    CutRecord(CutRecord),
    Status(BridgeStatus),
    LogLine(Bytes),
}

impl BridgeMessage {
    /// Log bytes as one message. Callers split longer runs.
    pub fn log_line(bytes: Bytes) -> Result<Self, BridgeError> {
        if bytes.is_empty() {
            return Err(BridgeError::EmptyLogLine);
        }
        if bytes.len() > BRIDGE_MAX_PAYLOAD {
            return Err(BridgeError::PayloadTooLarge(bytes.len()));
        }
        Ok(BridgeMessage::LogLine(bytes))
    }

    pub fn kind(&self) -> BridgeKind {
        match self {
            BridgeMessage::CutRecord(_) => BridgeKind::CutRecord,
            BridgeMessage::Status(_) => BridgeKind::Status,
            BridgeMessage::LogLine(_) => BridgeKind::LogLine,
        }
    }

    fn payload(&self) -> Bytes {
        match self {
            BridgeMessage::CutRecord(record) => Bytes::copy_from_slice(record.as_bytes()),
            BridgeMessage::Status(status) => Bytes::copy_from_slice(&[*status as u8]),
            BridgeMessage::LogLine(bytes) => bytes.clone(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let payload = self.payload();
        let length = payload.len() as u16;
        let header = BridgeHeader {
            marker: BRIDGE_MARKER,
            kind: self.kind() as u8,
            length: U16::new(length),
        };
        let mut buf = BytesMut::with_capacity(BRIDGE_HEADER_LEN + payload.len() + 1);
        buf.put_slice(header.as_bytes());
        buf.put_slice(&payload);
        buf.put_u8(bridge_checksum(header.kind, length, &payload));
        buf.freeze()
    }

    /// Verify a frame body (`length` payload bytes then the checksum) read
    /// after a header.
    pub fn from_parts(kind: u8, length: u16, body: &[u8]) -> Result<Self, BridgeError> {
        let len = usize::from(length);
        if len > BRIDGE_MAX_PAYLOAD {
            return Err(BridgeError::PayloadTooLarge(len));
        }
        if body.len() != len + 1 {
            return Err(BridgeError::Incomplete);
        }
        let (payload, tail) = body.split_at(len);
        let expected = bridge_checksum(kind, length, payload);
        if tail[0] != expected {
            return Err(BridgeError::ChecksumMismatch {
                expected,
                got: tail[0],
            });
        }
        match BridgeKind::try_from(kind)? {
            BridgeKind::CutRecord => CutRecord::read_from(payload)
                .map(BridgeMessage::CutRecord)
                .ok_or(BridgeError::BadCutRecord(len)),
            BridgeKind::Status => {
                let code = payload.first().copied().ok_or(BridgeError::Incomplete)?;
                Ok(BridgeMessage::Status(BridgeStatus::try_from(code)?))
            }
            BridgeKind::LogLine => Ok(BridgeMessage::LogLine(Bytes::copy_from_slice(payload))),
        }
    }

    /// Decode the first frame in `buf`, skipping bytes before a marker.
    /// Returns the message and the bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), BridgeError> {
        let start = buf
            .iter()
            .position(|&b| b == BRIDGE_MARKER)
            .ok_or(BridgeError::Incomplete)?;
        let rest = &buf[start..];
        let header = BridgeHeader::read_from_prefix(rest).ok_or(BridgeError::Incomplete)?;
        let length = header.length.get();
        if usize::from(length) > BRIDGE_MAX_PAYLOAD {
            return Err(BridgeError::PayloadTooLarge(usize::from(length)));
        }
        let body_len = usize::from(length) + 1;
        let body = rest
            .get(BRIDGE_HEADER_LEN..BRIDGE_HEADER_LEN + body_len)
            .ok_or(BridgeError::Incomplete)?;
        let message = Self::from_parts(header.kind, length, body)?;
        Ok((message, start + BRIDGE_HEADER_LEN + body_len))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("bridge frame incomplete")]
    Incomplete,

    #[error("bridge checksum mismatch: computed 0x{expected:02x}, received 0x{got:02x}")]
    ChecksumMismatch { expected: u8, got: u8 },

    #[error("unknown bridge message kind: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("unknown bridge status: 0x{0:02x}")]
    UnknownStatus(u8),

    #[error("bridge payload length {0} exceeds maximum {}", BRIDGE_MAX_PAYLOAD)]
    PayloadTooLarge(usize),

    #[error("cut record payload is {0} bytes, expected {}", CUT_RECORD_LEN)]
    BadCutRecord(usize),

    #[error("log line is empty")]
    EmptyLogLine,
}
