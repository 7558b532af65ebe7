//! Protocol implementation module
//!
//! This module defines the telegram types exchanged with devices, their
//! byte layouts, the checksum and the framing codec.

pub mod codec;
pub mod message;
pub mod text;

pub use self::codec::{checksum, DecoderRegistry, TelegramCodec};
pub use self::message::{Body, FileMode, FileStatus, Telegram, TelegramKind, TypeCode};
pub use self::text::ArgValue;

/// Fixed signature opening every telegram
pub const SIGNATURE: [u8; 4] = [2, 77, 108, 2];

/// Signature plus dst, src, length and type code
pub const HEADER_LEN: usize = SIGNATURE.len() + 4;

/// Checksum bytes closing every telegram
pub const TRAILER_LEN: usize = 2;

/// Largest payload the one-byte length field can describe
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize - 1;
