//! Configuration types for the RAMSES-II transport
//!
//! This module provides configuration structures for the serial interface,
//! the command engine's QoS settings and fragment reassembly.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::address::Address;

/// Maximum payload size of a RAMSES-II frame
pub const MAX_PAYLOAD_LEN: usize = 48;

/// Default baud rate for evofw3/HGI80 gateways
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Placeholder source address used by gateways for their own transmissions
pub const DEFAULT_GATEWAY_ID: &str = "18:000730";

/// Minimum gap between two transmissions
pub const DEFAULT_MIN_GAP_MS: u64 = 50;

/// Default wait for a correlated response
pub const DEFAULT_REPLY_TIMEOUT_MS: u64 = 500;

/// Default wait for responses to control commands (e.g. schedule writes)
pub const DEFAULT_CONTROL_TIMEOUT_MS: u64 = 1000;

/// Default retransmissions after the first attempt
pub const DEFAULT_MAX_RETRIES: u8 = 3;

/// Upper bound on configured retries
pub const MAX_RETRY_LIMIT: u8 = 5;

/// Duty-cycle budget: transmissions allowed per window
pub const DEFAULT_DUTY_CYCLE_TOKENS: u32 = 80;

/// Duty-cycle window length
pub const DEFAULT_DUTY_CYCLE_WINDOW_SECS: u64 = 60;

/// Default reassembly window for fragmented payloads
pub const DEFAULT_FRAGMENT_WINDOW_MS: u64 = 3000;

/// Main configuration for the RAMSES-II transport
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RamsesConfig {
    /// Interface configuration
    #[serde(default)]
    pub interface: InterfaceConfig,

    /// Command engine settings
    #[serde(default)]
    pub transport: TransportConfig,

    /// Fragment reassembly settings
    #[serde(default)]
    pub fragments: FragmentConfig,
}

/// Interface type for connecting to a RAMSES-II gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InterfaceConfig {
    /// USB/serial gateway (evofw3 or HGI80)
    Serial {
        /// Path to serial port (e.g., /dev/ttyUSB0, /dev/ttyACM0)
        port: PathBuf,
        /// Baud rate (default: 115200)
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        InterfaceConfig::Serial {
            port: PathBuf::from("/dev/ttyUSB0"),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

/// Command engine (QoS) configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Address the gateway transmits as
    #[serde(default = "default_gateway_id")]
    pub gateway_id: Address,

    /// Minimum gap between transmissions
    #[serde(with = "humantime_serde", default = "default_min_gap")]
    pub min_gap: Duration,

    /// Transmissions allowed per duty-cycle window (0 = unlimited)
    #[serde(default = "default_duty_cycle_tokens")]
    pub duty_cycle_tokens: u32,

    /// Duty-cycle window length
    #[serde(with = "humantime_serde", default = "default_duty_cycle_window")]
    pub duty_cycle_window: Duration,

    /// Response timeouts by command class
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Retransmissions after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u8,

    /// Double the timeout on each retry (capped at 4x)
    #[serde(default = "default_backoff")]
    pub backoff: bool,

    /// Upper bound of the random delay added before a retransmission
    #[serde(with = "humantime_serde", default)]
    pub retry_jitter: Duration,

    /// Maximum number of queued commands
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Identical frames seen within this window are dropped (0 = disabled)
    #[serde(with = "humantime_serde", default)]
    pub dedup_window: Duration,

    /// Size of the duplicate-frame cache
    #[serde(default = "default_dedup_cache_size")]
    pub dedup_cache_size: usize,
}

fn default_gateway_id() -> Address {
    Address::GATEWAY
}

fn default_min_gap() -> Duration {
    Duration::from_millis(DEFAULT_MIN_GAP_MS)
}

fn default_duty_cycle_tokens() -> u32 {
    DEFAULT_DUTY_CYCLE_TOKENS
}

fn default_duty_cycle_window() -> Duration {
    Duration::from_secs(DEFAULT_DUTY_CYCLE_WINDOW_SECS)
}

fn default_max_retries() -> u8 {
    DEFAULT_MAX_RETRIES
}

fn default_backoff() -> bool {
    true
}

fn default_queue_size() -> usize {
    64
}

fn default_dedup_cache_size() -> usize {
    256
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            gateway_id: Address::GATEWAY,
            min_gap: default_min_gap(),
            duty_cycle_tokens: DEFAULT_DUTY_CYCLE_TOKENS,
            duty_cycle_window: default_duty_cycle_window(),
            timeouts: TimeoutConfig::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: true,
            retry_jitter: Duration::ZERO,
            queue_size: 64,
            dedup_window: Duration::ZERO,
            dedup_cache_size: 256,
        }
    }
}

impl TransportConfig {
    /// Check the settings for values the engine cannot work with
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_retries > MAX_RETRY_LIMIT {
            return Err(crate::RamsesError::InvalidConfig(format!(
                "max_retries {} exceeds limit {}",
                self.max_retries, MAX_RETRY_LIMIT
            )));
        }
        if self.queue_size == 0 {
            return Err(crate::RamsesError::InvalidConfig(
                "queue_size must be at least 1".to_string(),
            ));
        }
        if self.duty_cycle_tokens > 0 && self.duty_cycle_window.is_zero() {
            return Err(crate::RamsesError::InvalidConfig(
                "duty_cycle_window must be non-zero when a budget is set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Response timeouts, by command class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Requests for state or schema
    #[serde(with = "humantime_serde", default = "default_probe_timeout")]
    pub probe: Duration,

    /// Writes and schedule transfers
    #[serde(with = "humantime_serde", default = "default_control_timeout")]
    pub control: Duration,

    /// Binding handshake transmissions
    #[serde(with = "humantime_serde", default = "default_control_timeout")]
    pub binding: Duration,
}

fn default_probe_timeout() -> Duration {
    Duration::from_millis(DEFAULT_REPLY_TIMEOUT_MS)
}

fn default_control_timeout() -> Duration {
    Duration::from_millis(DEFAULT_CONTROL_TIMEOUT_MS)
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            probe: default_probe_timeout(),
            control: default_control_timeout(),
            binding: default_control_timeout(),
        }
    }
}

/// Fragment reassembly configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentConfig {
    /// Time allowed between related fragments
    #[serde(with = "humantime_serde", default = "default_fragment_window")]
    pub window: Duration,
}

fn default_fragment_window() -> Duration {
    Duration::from_millis(DEFAULT_FRAGMENT_WINDOW_MS)
}

impl Default for FragmentConfig {
    fn default() -> Self {
        Self {
            window: default_fragment_window(),
        }
    }
}

/// Serde adapter for `Duration` as humantime strings (e.g. "500ms", "3s")
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RamsesConfig::default();
        assert_eq!(config.transport.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.transport.min_gap, Duration::from_millis(50));
        assert_eq!(config.transport.gateway_id.to_string(), DEFAULT_GATEWAY_ID);
        assert_eq!(config.fragments.window, Duration::from_secs(3));
        assert!(config.transport.validate().is_ok());
    }

    #[test]
    fn test_humantime_durations() {
        let json = r#"{
            "transport": { "min_gap": "100ms", "timeouts": { "probe": "2s" }, "max_retries": 1 },
            "fragments": { "window": "5s" }
        }"#;
        let config: RamsesConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.transport.min_gap, Duration::from_millis(100));
        assert_eq!(config.transport.timeouts.probe, Duration::from_secs(2));
        assert_eq!(
            config.transport.timeouts.control,
            Duration::from_millis(DEFAULT_CONTROL_TIMEOUT_MS)
        );
        assert_eq!(config.transport.max_retries, 1);
        assert_eq!(config.fragments.window, Duration::from_secs(5));

        let out = serde_json::to_value(&config.transport).unwrap();
        assert_eq!(out["min_gap"], "100ms");
        assert_eq!(out["gateway_id"], "18:000730");
    }

    #[test]
    fn test_validate_rejects_excess_retries() {
        let mut config = TransportConfig::default();
        config.max_retries = MAX_RETRY_LIMIT + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_interface_config_tagged() {
        let json = r#"{ "type": "serial", "port": "/dev/ttyACM0" }"#;
        let iface: InterfaceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            iface,
            InterfaceConfig::Serial {
                port: PathBuf::from("/dev/ttyACM0"),
                baud_rate: DEFAULT_BAUD_RATE
            }
        );
    }
}
