//! Text payload helpers
//!
//! Text telegrams carry Windows-1251 text. The parsers here recognise the
//! handful of reply shapes the link itself cares about: discovery replies,
//! version replies and live-state pushes.

use encoding_rs::WINDOWS_1251;
use serde::{Deserialize, Serialize};

use crate::core::{model_name, DeviceInfo, Serial};

/// Payload of a discovery beacon
pub const BEACON: &str = "#F";

/// Firmware version query
pub const VERSION_QUERY: &str = "#S7?";

/// Request for a full live-state dump
pub const ALL_STATES_QUERY: &str = "GETALLSTATES?";

/// Encodes text as Windows-1251. Characters outside the codepage become
/// numeric character references.
pub fn encode_cp1251(text: &str) -> Vec<u8> {
    let (bytes, _, _) = WINDOWS_1251.encode(text);
    bytes.into_owned()
}

/// Decodes Windows-1251 bytes. Every byte value maps to a character.
pub fn decode_cp1251(bytes: &[u8]) -> String {
    WINDOWS_1251.decode_without_bom_handling(bytes).0.into_owned()
}

/// A discovery reply `#I<serial>:<model>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryReply {
    pub serial: Serial,
    pub model: String,
}

/// Parses a discovery reply
pub fn parse_discovery_reply(text: &str) -> Option<DiscoveryReply> {
    let rest = text.strip_prefix("#I")?;
    let serial = Serial::parse(rest.get(..Serial::LEN)?)?;
    let model = rest[Serial::LEN..].strip_prefix(':')?;
    let model = model.split(['\r', '\n']).next().unwrap_or_default();
    Some(DiscoveryReply {
        serial,
        model: model.to_string(),
    })
}

/// Parses a version reply `#S7=<model> <hw> <fw>`
pub fn parse_version_reply(text: &str) -> Option<DeviceInfo> {
    let rest = text.trim().strip_prefix("#S7=")?;
    let mut fields = rest.splitn(3, char::is_whitespace);
    let code = fields.next()?;
    if !code.chars().all(|c| c.is_ascii_alphanumeric() || c == '+') {
        return None;
    }
    let hardware = fields.next()?;
    if !hardware.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let firmware: String = fields
        .next()?
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();

    Some(DeviceInfo {
        model_code: code.to_string(),
        model_name: model_name(code).unwrap_or(code).to_string(),
        hardware: hardware.to_string(),
        firmware: firmware.parse().unwrap_or(0),
    })
}

/// One value in a live-state argument list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Number(f64),
    Text(String),
    List(Vec<f64>),
}

impl ArgValue {
    /// Numeric value, parsing text if needed
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ArgValue::Number(n) => Some(*n),
            ArgValue::Text(s) => s.trim().parse().ok(),
            ArgValue::List(_) => None,
        }
    }
}

/// A live-state push `#Y<id>$<args>`
#[derive(Debug, Clone, PartialEq)]
pub struct StateTelegram {
    pub object_id: u32,
    pub args: Vec<ArgValue>,
}

/// Returns the object id of a live-state push, even when its arguments
/// cannot be decoded
pub fn state_object_id(text: &str) -> Option<u32> {
    let rest = text.strip_prefix("#Y")?;
    let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    rest[..digits].parse().ok()
}

/// Parses a live-state push. The argument list must be non-empty, must not
/// end with `!` and must not contain line breaks.
pub fn parse_state_telegram(text: &str) -> Option<StateTelegram> {
    let rest = text.strip_prefix("#Y")?;
    let (id, args) = rest.split_once('$')?;
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if args.is_empty() || args.ends_with('!') || args.contains(['\r', '\n']) {
        return None;
    }
    Some(StateTelegram {
        object_id: id.parse().ok()?,
        args: decode_arguments(args)?,
    })
}

/// Decodes a comma separated argument list of numbers, single-quoted
/// strings (with `\'` escapes) and bracketed number lists.
pub fn decode_arguments(args: &str) -> Option<Vec<ArgValue>> {
    const ESCAPED_QUOTE: char = '\u{030A}';
    let json = args
        .replace("\\'", &ESCAPED_QUOTE.to_string())
        .replace('"', "\\\"")
        .replace('\'', "\"")
        .replace(ESCAPED_QUOTE, "'");
    serde_json::from_str(&format!("[{}]", json)).ok()
}
