//! Tunnel Protocol Definitions
//!
//! This crate defines the private protocol spoken between the local and the remote
//! agent: the message schemas for both directions, the SOCKS5-style reply codes they
//! carry, and the length-prefixed, compressed framing used on the wire.

pub mod codec;
pub mod messages;
pub mod reply;

pub use codec::{CodecError, TunnelCodec};
pub use messages::*;
pub use reply::ReplyCode;

/// Protocol version, written as the first byte of every serialized message
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;
