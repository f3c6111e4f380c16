//! Wire Protocol
//!
//! Message types, their JSON encoding and the length-prefixed framing used
//! on every peer connection.

pub mod codec;
pub mod framing;
mod message;

pub use codec::{decode, decode_frame, encode, DecodeError, EncodeError};
pub use framing::{FrameError, FrameReader, FrameWriter, DEFAULT_MAX_FRAME_LEN};
pub use message::*;

/// Default TCP port for peer connections
pub const DEFAULT_PORT: u16 = 45678;
