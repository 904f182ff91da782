//! Config keys, values and capability flags.
//!
//! A [`ConfigKey`] names a configurable or readable device property. For
//! each (key, group) pair a driver declares [`ConfigCaps`]: which of the
//! get/set/list operations are legal. A capability bit must never be
//! advertised for an operation the driver does not implement; the framework
//! checks the bit *before* any driver code runs (see
//! [`crate::device::Device`]).

use serde::{Deserialize, Serialize};

/// Enumerated identifier for a configurable/readable device property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigKey {
    /// Connection string used to reach the device ("/dev/ttyUSB0", ...).
    Conn,
    /// Serial line parameters ("9600/8n1").
    SerialComm,
    /// Modbus slave address.
    ModbusAddr,
    /// Sample rate in Hz.
    Samplerate,
    /// Stop acquisition after this many samples.
    LimitSamples,
    /// Stop acquisition after this many milliseconds.
    LimitMsec,
    /// Generator pattern selection (demo driver).
    PatternMode,
    /// Channel-group enable state (relay drivers).
    Enabled,
}

impl ConfigKey {
    /// Stable textual id, matching the serde representation.
    pub fn id(&self) -> &'static str {
        match self {
            ConfigKey::Conn => "conn",
            ConfigKey::SerialComm => "serial_comm",
            ConfigKey::ModbusAddr => "modbus_addr",
            ConfigKey::Samplerate => "samplerate",
            ConfigKey::LimitSamples => "limit_samples",
            ConfigKey::LimitMsec => "limit_msec",
            ConfigKey::PatternMode => "pattern_mode",
            ConfigKey::Enabled => "enabled",
        }
    }
}

/// A config value, tagged by shape rather than by key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigValue {
    UInt(u64),
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl ConfigValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ConfigValue::UInt(v) => Some(*v),
            ConfigValue::Int(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ConfigValue::Float(v) => Some(*v),
            ConfigValue::UInt(v) => Some(*v as f64),
            ConfigValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }
}

/// Per-(key, group) capability flags, independently settable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigCaps {
    /// The key can be read.
    pub get: bool,
    /// The key can be written.
    pub set: bool,
    /// The set of accepted values can be enumerated.
    pub list: bool,
    /// The key may be written while the device is acquiring.
    pub live_set: bool,
}

impl ConfigCaps {
    pub const GET: ConfigCaps = ConfigCaps {
        get: true,
        set: false,
        list: false,
        live_set: false,
    };

    pub const GET_SET: ConfigCaps = ConfigCaps {
        get: true,
        set: true,
        list: false,
        live_set: false,
    };

    pub const GET_SET_LIST: ConfigCaps = ConfigCaps {
        get: true,
        set: true,
        list: true,
        live_set: false,
    };

    pub fn live(mut self) -> Self {
        self.live_set = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_serde_matches_id() {
        for key in [
            ConfigKey::Conn,
            ConfigKey::Samplerate,
            ConfigKey::LimitSamples,
            ConfigKey::Enabled,
        ] {
            let json = serde_json::to_string(&key).unwrap();
            assert_eq!(json, format!("\"{}\"", key.id()));
        }
    }

    #[test]
    fn value_accessors() {
        assert_eq!(ConfigValue::UInt(48000).as_u64(), Some(48000));
        assert_eq!(ConfigValue::Int(-1).as_u64(), None);
        assert_eq!(ConfigValue::Bool(true).as_bool(), Some(true));
        assert_eq!(ConfigValue::Str("demo".into()).as_str(), Some("demo"));
        assert_eq!(ConfigValue::Float(1.5).as_f64(), Some(1.5));
    }

    #[test]
    fn caps_presets() {
        let caps = ConfigCaps::GET_SET_LIST;
        assert!(caps.get && caps.set && caps.list && !caps.live_set);
        assert!(ConfigCaps::GET_SET.live().live_set);
    }
}
