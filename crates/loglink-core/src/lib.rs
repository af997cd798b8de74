//! loglink-core: wire formats, frame codecs, and configuration.
//! All other loglink crates depend on this one.

pub mod bridge;
pub mod config;
pub mod frame;
pub mod wire;

pub use bridge::{BridgeError, BridgeMessage, BridgeStatus};
pub use frame::{Frame, FrameError, FrameType};
pub use wire::{ChunkMessage, ControlCommand, ControlEvent, StatusCode, WireError};
