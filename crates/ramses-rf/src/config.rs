//! Gateway configuration
//!
//! [`GatewayConfig`] combines the transport settings of `ramses-tx` with the
//! entity graph and binding policies. Durations are written as humantime
//! strings (`"500ms"`, `"5s"`, `"15m"`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ramses_tx::config::{humantime_serde, InterfaceConfig, RamsesConfig, DEFAULT_BAUD_RATE};
use ramses_tx::Address;

use crate::error::{Result, RfError};

/// Independent exchanges needed to change a learned schema value
pub const DEFAULT_CORROBORATION: u8 = 2;

/// Default interval between discovery rounds
pub const DEFAULT_DISCOVERY_INTERVAL_SECS: u64 = 900;

/// Default wait for a bind accept after an offer
pub const DEFAULT_ACCEPT_TIMEOUT_SECS: u64 = 5;

/// Default wait for a bind confirm after an accept
pub const DEFAULT_CONFIRM_TIMEOUT_SECS: u64 = 3;

/// Default retransmissions of a bind offer
pub const DEFAULT_OFFER_RETRIES: u8 = 2;

/// Main configuration for the gateway service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Interface, transport and fragment settings
    #[serde(flatten)]
    pub ramses: RamsesConfig,

    /// Entity graph policies
    #[serde(default)]
    pub graph: GraphConfig,

    /// Binding handshake settings
    #[serde(default)]
    pub binding: BindingConfig,
}

impl GatewayConfig {
    /// Load a configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the settings for values the gateway cannot work with
    pub fn validate(&self) -> Result<()> {
        self.ramses.transport.validate()?;
        if self.graph.corroboration == 0 {
            return Err(RfError::InvalidConfig(
                "corroboration must be at least 1".to_string(),
            ));
        }
        if self.graph.discovery && self.graph.discovery_interval.is_zero() {
            return Err(RfError::InvalidConfig(
                "discovery_interval must be non-zero when discovery is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// Entity graph configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Learn from third-party traffic: destinations create devices and zone
    /// types are inferred from what devices send
    #[serde(default)]
    pub eavesdrop: bool,

    /// Independent exchanges needed before a learned schema value changes
    #[serde(default = "default_corroboration")]
    pub corroboration: u8,

    /// Periodically probe for missing schema
    #[serde(default)]
    pub discovery: bool,

    /// Interval between discovery rounds
    #[serde(with = "humantime_serde", default = "default_discovery_interval")]
    pub discovery_interval: Duration,
}

fn default_corroboration() -> u8 {
    DEFAULT_CORROBORATION
}

fn default_discovery_interval() -> Duration {
    Duration::from_secs(DEFAULT_DISCOVERY_INTERVAL_SECS)
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            eavesdrop: false,
            corroboration: DEFAULT_CORROBORATION,
            discovery: false,
            discovery_interval: default_discovery_interval(),
        }
    }
}

/// Binding handshake configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingConfig {
    /// Wait for an accept after an offer
    #[serde(with = "humantime_serde", default = "default_accept_timeout")]
    pub accept_timeout: Duration,

    /// Wait for a confirm after an accept
    #[serde(with = "humantime_serde", default = "default_confirm_timeout")]
    pub confirm_timeout: Duration,

    /// Retransmissions of an offer sent by the gateway
    #[serde(default = "default_offer_retries")]
    pub offer_retries: u8,
}

fn default_accept_timeout() -> Duration {
    Duration::from_secs(DEFAULT_ACCEPT_TIMEOUT_SECS)
}

fn default_confirm_timeout() -> Duration {
    Duration::from_secs(DEFAULT_CONFIRM_TIMEOUT_SECS)
}

fn default_offer_retries() -> u8 {
    DEFAULT_OFFER_RETRIES
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            accept_timeout: default_accept_timeout(),
            confirm_timeout: default_confirm_timeout(),
            offer_retries: DEFAULT_OFFER_RETRIES,
        }
    }
}

/// Builder for GatewayConfig
#[derive(Debug, Default)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set serial port path
    pub fn serial_port(mut self, port: impl Into<PathBuf>) -> Self {
        self.config.ramses.interface = InterfaceConfig::Serial {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
        };
        self
    }

    /// Set serial port with baud rate
    pub fn serial_port_with_baud(mut self, port: impl Into<PathBuf>, baud_rate: u32) -> Self {
        self.config.ramses.interface = InterfaceConfig::Serial {
            port: port.into(),
            baud_rate,
        };
        self
    }

    /// Set the address the gateway transmits as
    pub fn gateway_id(mut self, addr: Address) -> Self {
        self.config.ramses.transport.gateway_id = addr;
        self
    }

    /// Set the minimum gap between transmissions
    pub fn min_gap(mut self, gap: Duration) -> Self {
        self.config.ramses.transport.min_gap = gap;
        self
    }

    /// Set retransmissions after the first attempt
    pub fn max_retries(mut self, retries: u8) -> Self {
        self.config.ramses.transport.max_retries = retries.min(ramses_tx::config::MAX_RETRY_LIMIT);
        self
    }

    /// Set the fragment reassembly window
    pub fn fragment_window(mut self, window: Duration) -> Self {
        self.config.ramses.fragments.window = window;
        self
    }

    /// Drop identical frames seen within `window`
    pub fn dedup_window(mut self, window: Duration) -> Self {
        self.config.ramses.transport.dedup_window = window;
        self
    }

    /// Enable or disable eavesdropping
    pub fn eavesdrop(mut self, enabled: bool) -> Self {
        self.config.graph.eavesdrop = enabled;
        self
    }

    /// Enable periodic discovery at `interval`
    pub fn discovery(mut self, interval: Duration) -> Self {
        self.config.graph.discovery = true;
        self.config.graph.discovery_interval = interval;
        self
    }

    /// Set the corroboration count (at least 1)
    pub fn corroboration(mut self, count: u8) -> Self {
        self.config.graph.corroboration = count.max(1);
        self
    }

    /// Set binding timeouts
    pub fn binding_timeouts(mut self, accept: Duration, confirm: Duration) -> Self {
        self.config.binding.accept_timeout = accept;
        self.config.binding.confirm_timeout = confirm;
        self
    }

    /// Build the configuration
    pub fn build(self) -> GatewayConfig {
        self.config
    }
}
