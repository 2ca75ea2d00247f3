//! Engine configuration
//!
//! Every field has a default, so a JSON file only needs to name what a
//! particular device changes:
//!
//! ```json
//! { "delivery_mode": "blocking", "poll_interval_ms": 200, "max_failed_polls": 5 }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::{ProtocolError, DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS, DEFAULT_WRITE_CHUNK};

/// How inbound bytes reach the reconstructor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// The transport notifies the engine; each notification runs one pass
    #[default]
    EventDriven,
    /// The sender waits for its response against a deadline
    Blocking,
}

/// Serial line settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    pub port_name: String,
    pub baud_rate: u32,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

/// Per-device engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub delivery_mode: DeliveryMode,
    /// Status poll interval; `None` disables polling
    pub poll_interval_ms: Option<u64>,
    /// Consecutive failed polls before an attached device is declared detached
    pub max_failed_polls: u32,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Fixed part of a blocking response deadline
    pub response_min_timeout_ms: u64,
    /// Per-expected-byte part of a blocking response deadline
    pub response_per_byte_ms: u64,
    /// Event-driven mode abandons a partial frame that stalls this long
    pub frame_timeout_ms: u64,
    /// Largest single transport write
    pub max_write_chunk: usize,
    /// Flush the transport after every good frame. Off by default so bytes of
    /// a following frame survive.
    pub flush_after_frame: bool,
    /// Delay between close and reopen when resetting the connection
    pub reset_delay_ms: u64,
    /// How often to check `bytes_to_read` when the transport cannot notify
    pub data_watch_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            delivery_mode: DeliveryMode::EventDriven,
            poll_interval_ms: Some(500),
            max_failed_polls: 3,
            read_timeout_ms: 100,
            write_timeout_ms: 100,
            response_min_timeout_ms: 50,
            response_per_byte_ms: 2,
            frame_timeout_ms: DEFAULT_TIMEOUT_MS,
            max_write_chunk: DEFAULT_WRITE_CHUNK,
            flush_after_frame: false,
            reset_delay_ms: 1000,
            data_watch_interval_ms: 5,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json).map_err(|e| ProtocolError::Config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval_ms.map(Duration::from_millis)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn reset_delay(&self) -> Duration {
        Duration::from_millis(self.reset_delay_ms)
    }

    pub fn data_watch_interval(&self) -> Duration {
        Duration::from_millis(self.data_watch_interval_ms.max(1))
    }

    pub fn response_timing(&self) -> ResponseTiming {
        ResponseTiming {
            min: Duration::from_millis(self.response_min_timeout_ms),
            per_byte: Duration::from_millis(self.response_per_byte_ms),
        }
    }
}

/// Blocking-mode response deadline: a fixed minimum plus a per-byte margin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseTiming {
    pub min: Duration,
    pub per_byte: Duration,
}

impl ResponseTiming {
    /// Time allowed for a response of `expected_len` bytes
    pub fn deadline(&self, expected_len: usize) -> Duration {
        let bytes = u32::try_from(expected_len).unwrap_or(u32::MAX);
        self.min + self.per_byte.saturating_mul(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.delivery_mode, DeliveryMode::EventDriven);
        assert_eq!(config.max_failed_polls, 3);
        assert!(!config.flush_after_frame);
        assert_eq!(config.poll_interval(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{ "delivery_mode": "blocking", "poll_interval_ms": null, "max_failed_polls": 5 }"#,
        )
        .unwrap();
        assert_eq!(config.delivery_mode, DeliveryMode::Blocking);
        assert_eq!(config.poll_interval(), None);
        assert_eq!(config.max_failed_polls, 5);
        assert_eq!(config.max_write_chunk, DEFAULT_WRITE_CHUNK);
    }

    #[test]
    fn test_bad_json_is_config_error() {
        let err = EngineConfig::from_json_str("{ \"max_failed_polls\": \"three\" }").unwrap_err();
        assert!(matches!(err, ProtocolError::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "reset_delay_ms": 250 }}"#).unwrap();
        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.reset_delay(), Duration::from_millis(250));
    }

    #[test]
    fn test_response_deadline() {
        let timing = ResponseTiming {
            min: Duration::from_millis(50),
            per_byte: Duration::from_millis(2),
        };
        assert_eq!(timing.deadline(0), Duration::from_millis(50));
        assert_eq!(timing.deadline(10), Duration::from_millis(70));
    }
}
