//! Core types and traits for the Z3K link
//!
//! This module contains the fundamental building blocks used throughout the library.

pub mod error;
pub mod serde;
pub mod types;

pub use self::error::{Error, FileTransferError, ProtocolError, RequestError, Result};
pub use self::types::{model_name, Config, DeviceInfo, Serial};

use std::time::Duration;

/// Port the receive socket listens on, and the port devices listen on
pub const LISTEN_PORT: u16 = 49080;

/// Port the send socket binds to
pub const SEND_PORT: u16 = 49079;

/// Interval between discovery beacons
pub const BEACON_INTERVAL: Duration = Duration::from_secs(10);

/// Default timeout for a correlated request
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Period of the pending-request timeout sweep
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Lowest pseudo-address handed out for correlated requests
pub const MIN_ADDRESS: u8 = 10;

/// One past the highest pseudo-address handed out for correlated requests
pub const MAX_ADDRESS: u8 = 250;

/// Size of one file transfer chunk in bytes
pub const CHUNK_SIZE: usize = 100;

/// Device configuration file name
pub const CONFIG_FILE_NAME: &str = "config.txt";

/// Maximum datagram size accepted from the network
pub const MAX_DATAGRAM_SIZE: usize = 1024;
