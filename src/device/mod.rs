//! Device session module
//!
//! Everything that belongs to one discovered device: its file transfer
//! manager, its live-state listener and the session that owns them.

pub mod files;
pub mod live_state;
pub mod session;

pub use self::files::FileTransferManager;
pub use self::live_state::LiveState;
pub use self::session::{BootstrapStage, DeviceSession, SessionHandle, SessionSummary};

use std::fmt;

use crate::core::Result;
use crate::protocol::text;
use crate::protocol::ArgValue;

/// Configuration-file collaborator.
///
/// The link moves configuration files as raw bytes; an implementation of
/// this trait gives them meaning and decodes live-state pushes against the
/// decoded configuration.
pub trait ConfigCodec: Send + Sync + 'static {
    /// Decoded configuration file
    type Config: Clone + Send + Sync + 'static;
    /// Decoded state of one configuration object
    type State: Clone + fmt::Debug + Send + Sync + 'static;

    fn decode_config(&self, bytes: &[u8]) -> Result<Self::Config>;

    fn encode_config(&self, config: &Self::Config) -> Result<Vec<u8>>;

    /// Decodes the arguments of a `#Y` push for `object_id`. Returns `None`
    /// for objects the configuration does not describe.
    fn decode_state(&self, config: &Self::Config, object_id: u32, args: &[ArgValue]) -> Option<Self::State>;
}

/// Pass-through codec: the configuration is its Windows-1251 text and each
/// object state is its raw argument list.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawConfigCodec;

impl ConfigCodec for RawConfigCodec {
    type Config = String;
    type State = Vec<ArgValue>;

    fn decode_config(&self, bytes: &[u8]) -> Result<String> {
        Ok(text::decode_cp1251(bytes))
    }

    fn encode_config(&self, config: &String) -> Result<Vec<u8>> {
        Ok(text::encode_cp1251(config))
    }

    fn decode_state(&self, _config: &String, _object_id: u32, args: &[ArgValue]) -> Option<Vec<ArgValue>> {
        Some(args.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_codec_roundtrip() {
        let codec = RawConfigCodec;
        let bytes = codec.encode_config(&"Контур 1".to_string()).unwrap();
        assert_eq!(codec.decode_config(&bytes).unwrap(), "Контур 1");

        let args = vec![ArgValue::Number(1.0)];
        assert_eq!(codec.decode_state(&String::new(), 5, &args), Some(args));
    }
}
