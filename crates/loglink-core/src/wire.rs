//! loglink wire format: control channel and chunk stream.
//!
//! These types ARE the protocol spoken over the notification link. The
//! requester writes commands to the control channel; the responder answers
//! with status events on the same channel and streams the log on the chunk
//! channel. Every multi-byte integer is little-endian.
//!
//! Fixed-layout headers use zerocopy derives over byte-order-aware integer
//! types, so there is no unsafe code and no alignment requirement.

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Opcode carried by every responder → requester status event.
pub const OPCODE_STATUS: u8 = 0x80;

/// Longest resource name accepted in a START_TRANSFER command.
/// Names must fit a 64-byte buffer together with their NUL terminator.
pub const MAX_NAME_LEN: usize = 63;

/// Bytes of index header in front of every chunk payload.
pub const CHUNK_INDEX_LEN: usize = 2;

/// Per-notification overhead charged against the negotiated MTU.
pub const NOTIFY_OVERHEAD: u16 = 3;

/// Upper bound on chunk payload regardless of the negotiated MTU.
pub const DEFAULT_CHUNK_CEILING: u16 = 160;

/// MTU every connection starts with before negotiation.
pub const DEFAULT_MTU: u16 = 23;

// ── Opcodes and status codes ─────────────────────────────────────────────────

/// First byte of every control-channel message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlOpcode {
    Nop = 0x00,
    StartTransfer = 0x01,
    Abort = 0x02,
    Status = OPCODE_STATUS,
}

impl TryFrom<u8> for ControlOpcode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(ControlOpcode::Nop),
            0x01 => Ok(ControlOpcode::StartTransfer),
            0x02 => Ok(ControlOpcode::Abort),
            OPCODE_STATUS => Ok(ControlOpcode::Status),
            other => Err(WireError::UnknownOpcode(other)),
        }
    }
}

/// Second byte of a status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusCode {
    /// Transfer accepted. A 4-byte size follows.
    Ok = 0x00,
    ErrNoFile = 0x01,
    ErrFs = 0x02,
    ErrBusy = 0x03,
    TransferDone = 0x04,
    TransferAborted = 0x05,
}

impl TryFrom<u8> for StatusCode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(StatusCode::Ok),
            0x01 => Ok(StatusCode::ErrNoFile),
            0x02 => Ok(StatusCode::ErrFs),
            0x03 => Ok(StatusCode::ErrBusy),
            0x04 => Ok(StatusCode::TransferDone),
            0x05 => Ok(StatusCode::TransferAborted),
            other => Err(WireError::UnknownStatus(other)),
        }
    }
}

impl From<StatusCode> for u8 {
    fn from(s: StatusCode) -> u8 {
        s as u8
    }
}

// ── Control commands (requester → responder) ──────────────────────────────────

/// A command written by the requester to the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Nop,
    /// Ask the responder to stream the named resource.
    /// Wire: `[0x01][name bytes][0x00]`.
    StartTransfer { name: String },
    /// Cancel whatever transfer is in progress.
    Abort,
}

impl ControlCommand {
    pub fn start(name: impl Into<String>) -> Result<Self, WireError> {
        let name = name.into();
        validate_name(&name)?;
        Ok(ControlCommand::StartTransfer { name })
    }

    pub fn opcode(&self) -> ControlOpcode {
        match self {
            ControlCommand::Nop => ControlOpcode::Nop,
            ControlCommand::StartTransfer { .. } => ControlOpcode::StartTransfer,
            ControlCommand::Abort => ControlOpcode::Abort,
        }
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::with_capacity(2 + MAX_NAME_LEN);
        buf.put_u8(self.opcode() as u8);
        if let ControlCommand::StartTransfer { name } = self {
            validate_name(name)?;
            buf.put_slice(name.as_bytes());
            buf.put_u8(0);
        }
        Ok(buf.freeze())
    }

    /// Parse a control write. The name runs until the first NUL or the end
    /// of the buffer, whichever comes first.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let (&opcode, rest) = buf.split_first().ok_or(WireError::Truncated {
            needed: 1,
            got: 0,
        })?;
        match ControlOpcode::try_from(opcode)? {
            ControlOpcode::Nop => Ok(ControlCommand::Nop),
            ControlOpcode::Abort => Ok(ControlCommand::Abort),
            ControlOpcode::StartTransfer => {
                let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
                let name = std::str::from_utf8(&rest[..end]).map_err(|_| WireError::InvalidName)?;
                validate_name(name)?;
                Ok(ControlCommand::StartTransfer {
                    name: name.to_string(),
                })
            }
            // Status is an event opcode, never a command.
            ControlOpcode::Status => Err(WireError::UnknownOpcode(opcode)),
        }
    }
}

/// Check a resource name against the length bound and character set.
pub fn validate_name(name: &str) -> Result<(), WireError> {
    if name.is_empty() {
        return Err(WireError::EmptyName);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(WireError::NameTooLong(name.len()));
    }
    if !name.bytes().all(|b| b.is_ascii_graphic() || b == b' ') {
        return Err(WireError::InvalidName);
    }
    Ok(())
}

// ── Control events (responder → requester) ────────────────────────────────────

/// Status event header for `Accepted`: opcode, status, 4-byte size.
///
/// Wire size: 6 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct AcceptedHeader {
    pub opcode: u8,
    pub status: u8,
    pub size: U32<LittleEndian>,
}

assert_eq_size!(AcceptedHeader, [u8; 6]);

/// A status event pushed by the responder on the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    Accepted { size: u32 },
    NotFound,
    Storage,
    Busy,
    Done,
    Aborted,
}

impl ControlEvent {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ControlEvent::Accepted { .. } => StatusCode::Ok,
            ControlEvent::NotFound => StatusCode::ErrNoFile,
            ControlEvent::Storage => StatusCode::ErrFs,
            ControlEvent::Busy => StatusCode::ErrBusy,
            ControlEvent::Done => StatusCode::TransferDone,
            ControlEvent::Aborted => StatusCode::TransferAborted,
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            ControlEvent::Accepted { size } => {
                let header = AcceptedHeader {
                    opcode: OPCODE_STATUS,
                    status: StatusCode::Ok.into(),
                    size: U32::new(*size),
                };
                Bytes::copy_from_slice(header.as_bytes())
            }
            other => Bytes::copy_from_slice(&[OPCODE_STATUS, other.status_code().into()]),
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < 2 {
            return Err(WireError::Truncated {
                needed: 2,
                got: buf.len(),
            });
        }
        if buf[0] != OPCODE_STATUS {
            return Err(WireError::UnknownOpcode(buf[0]));
        }
        match StatusCode::try_from(buf[1])? {
            StatusCode::Ok => {
                let header = AcceptedHeader::read_from_prefix(buf).ok_or(WireError::Truncated {
                    needed: std::mem::size_of::<AcceptedHeader>(),
                    got: buf.len(),
                })?;
                Ok(ControlEvent::Accepted {
                    size: header.size.get(),
                })
            }
            StatusCode::ErrNoFile => Ok(ControlEvent::NotFound),
            StatusCode::ErrFs => Ok(ControlEvent::Storage),
            StatusCode::ErrBusy => Ok(ControlEvent::Busy),
            StatusCode::TransferDone => Ok(ControlEvent::Done),
            StatusCode::TransferAborted => Ok(ControlEvent::Aborted),
        }
    }
}

// ── Chunk stream ──────────────────────────────────────────────────────────────

/// Index prefix of every chunk notification.
///
/// Wire size: 2 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct ChunkHeader {
    /// First chunk = 0, increments by 1.
    pub index: U16<LittleEndian>,
}

assert_eq_size!(ChunkHeader, [u8; CHUNK_INDEX_LEN]);

/// One slice of the log payload as carried on the chunk channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMessage {
    pub index: u16,
    pub payload: Bytes,
}

impl ChunkMessage {
    pub fn encode(&self) -> Bytes {
        let header = ChunkHeader {
            index: U16::new(self.index),
        };
        let mut buf = BytesMut::with_capacity(CHUNK_INDEX_LEN + self.payload.len());
        buf.put_slice(header.as_bytes());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// A chunk must carry at least one payload byte.
    pub fn decode(buf: Bytes) -> Result<Self, WireError> {
        if buf.len() <= CHUNK_INDEX_LEN {
            return Err(WireError::EmptyChunk(buf.len()));
        }
        let header = ChunkHeader::read_from_prefix(&buf[..]).ok_or(WireError::Truncated {
            needed: CHUNK_INDEX_LEN,
            got: buf.len(),
        })?;
        Ok(ChunkMessage {
            index: header.index.get(),
            payload: buf.slice(CHUNK_INDEX_LEN..),
        })
    }
}

/// Chunk payload size for a connection with the given MTU.
///
/// `min(ceiling, mtu - overhead - CHUNK_INDEX_LEN)`, or `None` when the MTU
/// leaves no room for payload.
pub fn chunk_size_for_mtu(mtu: u16, ceiling: u16, overhead: u16) -> Option<u16> {
    let room = i32::from(mtu) - i32::from(overhead) - CHUNK_INDEX_LEN as i32;
    let size = room.min(i32::from(ceiling));
    if size <= 0 {
        None
    } else {
        Some(size as u16)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("message truncated: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("unknown opcode: 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("unknown status code: 0x{0:02x}")]
    UnknownStatus(u8),

    #[error("resource name is empty")]
    EmptyName,

    #[error("resource name length {0} exceeds maximum {}", MAX_NAME_LEN)]
    NameTooLong(usize),

    #[error("resource name is not printable ASCII")]
    InvalidName,

    #[error("chunk of {0} bytes carries no payload")]
    EmptyChunk(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
