//! Z3K link: UDP telegram protocol engine for Z3K heating controllers
//!
//! This library discovers controllers on the local network, correlates
//! request/response telegrams over a connectionless transport, moves the
//! device configuration file in acknowledged chunks and tracks the live
//! state each device pushes.
pub mod core;
pub mod device;
pub mod network;
pub mod protocol;
pub mod util;

#[cfg(test)]
mod testing;

// Re-export commonly used items
pub use crate::core::{Config, Error, Result, Serial};
pub use crate::device::{ConfigCodec, RawConfigCodec, SessionHandle};
pub use crate::network::{DeviceServer, DeviceServerHandle};
pub use crate::protocol::{Telegram, TelegramCodec};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
