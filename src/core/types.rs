use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Error, Result};

/// Twelve hex digit device identity, stable across IP changes.
///
/// Stored upper-cased so lookups are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Serial(String);

impl Serial {
    /// Number of hex digits in a serial
    pub const LEN: usize = 12;

    /// Parses a serial, accepting either case
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() == Self::LEN && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(Serial(s.to_ascii_uppercase()))
        } else {
            None
        }
    }

    /// Returns the serial as an upper-case string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Serial {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Serial::parse(s).ok_or_else(|| Error::config(format!("invalid device serial: {:?}", s)))
    }
}

impl TryFrom<String> for Serial {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Serial> for String {
    fn from(serial: Serial) -> Self {
        serial.0
    }
}

/// Firmware identity reported by a device in its `#S7=` reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Model code as sent by the device, e.g. `H1000`
    pub model_code: String,
    /// Human readable model name
    pub model_name: String,
    /// Hardware revision
    pub hardware: String,
    /// Firmware build number
    pub firmware: u32,
}

/// Model codes and their display names
const MODEL_NAMES: &[(&str, &str)] = &[
    ("SX250", "Mega SX-LRW"),
    ("SX170", "Mega SX-170"),
    ("SX300", "Mega SX-300"),
    ("SX350", "Mega SX-350"),
    ("H1000", "ZONT H-1000"),
    ("H2000", "ZONT H-2000"),
    ("T100", "ZONT H-1"),
    ("T102", "ZONT H-2"),
    ("L1000", "ZONT L-1000"),
    ("L1000S", "ZONT L-1000 Sim"),
    ("tracker", "Tracker"),
    ("ZTC-100", "ZTC-100"),
    ("ZTC-110", "ZTC-110"),
    ("ZTC-100M", "ZTC-100M"),
    ("ZTC-110M", "ZTC-110M"),
    ("ZTC-500", "ZTC-500"),
    ("ZTC-700", "ZTC-700"),
    ("ZTC-700M", "ZTC-700M"),
    ("ZTC-700S", "ZTC-700S"),
    ("ZTC-701M", "ZTC-701M"),
    ("ZTC-710", "ZTC-710"),
    ("ZTC-720", "ZTC-720"),
    ("ZTC-800", "ZTC-800"),
    ("ZTC-111", "ZTC-111"),
    ("ZTC-120", "ZTC-120"),
    ("ZTC-200", "ZTC-200"),
    ("ZTA-110", "ZTA-110"),
    ("GTW-100", "ZONT EXPERT"),
    ("GTW-102", "GTW-102"),
    ("GLT-100", "GLT-100"),
    ("G-100", "G-100"),
    ("E-100", "E-100"),
    ("G-100M", "G-100M"),
    ("E-100M", "E-100M"),
    ("A200", "A200"),
    ("A200E", "A200E"),
    ("A100", "A100"),
    ("A110", "A110"),
    ("A100M", "A100M"),
    ("A110M", "A110M"),
    ("H2001", "ZONT H-2001"),
    ("H1000+", "ZONT H1000+"),
    ("H2000+", "ZONT H2000+"),
    ("CLIMATIC+", "ZONT CLIMATIC+"),
    ("VALTEC_1", "ZONT VALTEC 1"),
    ("VALTEC_K300", "VALTEC K300"),
    ("C2000+", "ZONT C2000+"),
    ("A300", "ZONT A300"),
    ("A400", "ZONT A400"),
    ("SMART+", "ZONT SMART 2.0"),
    ("CLIMATIC", "ZONT CLIMATIC"),
    ("NAVTEL", "Навтелеком"),
    ("EGTS", "ЕГТС"),
    ("GALILEO", "Галилео"),
    ("ARNAVI", "Arnavi"),
    ("WIALONBIN", "Wialon"),
    ("TELTONIK", "Teltonika"),
    ("SATSOL", "Satellite Solutions"),
    ("NEOMATIK", "Неоматика"),
    ("A000", "Автоскан GPS"),
    ("ZTC-900", "ZTC-900"),
    ("SMART_1_0", "SMART 1.0"),
    ("H1V_PLUS", "ZONT H1V+"),
    ("CONNECT_PLUS", "ZONT Connect+"),
    ("GRANIT", "Гранит"),
];

/// Returns the display name for a device model code, if known
pub fn model_name(code: &str) -> Option<&'static str> {
    MODEL_NAMES
        .iter()
        .find(|(known, _)| *known == code)
        .map(|(_, name)| *name)
}

/// Configuration for the device link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Local address the receive socket binds to
    pub listen_addr: SocketAddr,
    /// Local address the send socket binds to
    pub send_addr: SocketAddr,
    /// Destination port for unicast and broadcast telegrams
    pub device_port: u16,
    /// Destination of discovery beacons
    pub broadcast_addr: Ipv4Addr,
    /// Interval between discovery beacons
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub beacon_interval: Duration,
    /// Default timeout for correlated requests
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub request_timeout: Duration,
    /// Period of the pending-request timeout sweep
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub sweep_interval: Duration,
    /// Evict sessions not heard from for this long; never when unset
    #[serde(serialize_with = "super::serde::serialize_opt_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_opt_duration")]
    pub session_ttl: Option<Duration>,
    /// Name of the device configuration file
    pub config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, super::LISTEN_PORT)),
            send_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, super::SEND_PORT)),
            device_port: super::LISTEN_PORT,
            broadcast_addr: Ipv4Addr::BROADCAST,
            beacon_interval: super::BEACON_INTERVAL,
            request_timeout: super::REQUEST_TIMEOUT,
            sweep_interval: super::SWEEP_INTERVAL,
            session_ttl: None,
            config_file: super::CONFIG_FILE_NAME.to_string(),
        }
    }
}

impl Config {
    /// Parses a TOML document, filling unset fields with defaults
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(s).map_err(|e| Error::config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Checks that the configured periods are usable
    pub fn validate(&self) -> Result<()> {
        let periods = [
            ("beacon_interval", self.beacon_interval),
            ("request_timeout", self.request_timeout),
            ("sweep_interval", self.sweep_interval),
        ];
        for (name, period) in periods {
            if period.is_zero() {
                return Err(Error::config(format!("{} must be greater than zero", name)));
            }
        }
        if self.session_ttl.map_or(false, |ttl| ttl.is_zero()) {
            return Err(Error::config("session_ttl must be greater than zero when set"));
        }
        if self.config_file.is_empty() {
            return Err(Error::config("config_file must not be empty"));
        }
        Ok(())
    }

    /// Socket address a device with the given IP is reached at
    pub fn device_addr(&self, ip: std::net::IpAddr) -> SocketAddr {
        SocketAddr::new(ip, self.device_port)
    }

    /// Socket address beacons are broadcast to
    pub fn beacon_addr(&self) -> SocketAddr {
        SocketAddr::from((self.broadcast_addr, self.device_port))
    }
}
