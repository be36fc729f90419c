//! Sensor link configuration
//!
//! Timing and buffering knobs for the protocol engine. Serial line
//! parameters are fixed by the sensor and live in
//! [`SerialSettings::JRT`](crate::protocol::SerialSettings::JRT).

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::{
    ProtocolError, DEFAULT_MAX_PAYLOAD_WORDS, DEFAULT_SETTLING_DELAY_MS, DEFAULT_WRITE_TIMEOUT_MS,
};

/// Configuration for a sensor connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Bound on each command write, in milliseconds
    pub write_timeout_ms: u64,
    /// Pause between opening the port and sending the handshake, in milliseconds
    pub settling_delay_ms: u64,
    /// Reassemble frames split across reads; `false` treats every read as one frame
    pub reassemble_frames: bool,
    /// Initial capacity of the read buffer
    pub read_buffer_size: usize,
    /// Diagnostic events buffered per subscriber
    pub diagnostics_capacity: usize,
    /// Largest payload length field accepted while reassembling, in 16-bit words
    pub max_payload_words: u16,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            settling_delay_ms: DEFAULT_SETTLING_DELAY_MS,
            reassemble_frames: true,
            read_buffer_size: 256,
            diagnostics_capacity: 64,
            max_payload_words: DEFAULT_MAX_PAYLOAD_WORDS,
        }
    }
}

impl SensorConfig {
    /// Parse and validate a JSON configuration. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ProtocolError> {
        let config: SensorConfig = serde_json::from_str(json)
            .map_err(|e| ProtocolError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.write_timeout_ms == 0 {
            return Err(ProtocolError::InvalidConfig(
                "write_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.read_buffer_size == 0 {
            return Err(ProtocolError::InvalidConfig(
                "read_buffer_size must be greater than zero".to_string(),
            ));
        }
        if self.diagnostics_capacity == 0 {
            return Err(ProtocolError::InvalidConfig(
                "diagnostics_capacity must be greater than zero".to_string(),
            ));
        }
        if self.max_payload_words == 0 {
            return Err(ProtocolError::InvalidConfig(
                "max_payload_words must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Write timeout as a duration
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Settling delay as a duration
    pub fn settling_delay(&self) -> Duration {
        Duration::from_millis(self.settling_delay_ms)
    }
}
