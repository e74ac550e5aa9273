//! Coordinator configuration
//!
//! Construction parameters for one coordinator: the device address, the poll
//! timing, and the register spans to acquire each cycle. Loaded from a YAML
//! file merged with `REGPOLL_`-prefixed environment overrides.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Network identity of the polled device; immutable for the coordinator's
/// lifetime. Changing it means constructing a new coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAddress {
    /// Hostname or IP address
    pub host: String,

    /// TCP port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Unit (slave) identifier
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
}

/// One contiguous address range within a register space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanRange {
    /// First address to read
    #[serde(default)]
    pub start: u16,
    /// Number of addresses to read
    pub count: u16,
}

impl SpanRange {
    pub const fn new(start: u16, count: u16) -> Self {
        Self { start, count }
    }
}

/// The spans read in each acquisition cycle, one per register space
///
/// Defaults match the known device profile: 7 coils, 54 discrete inputs,
/// 33 input registers, 69 holding registers, all starting at address 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterSpans {
    #[serde(default = "default_coil_span")]
    pub coils: SpanRange,
    #[serde(default = "default_discrete_span")]
    pub discrete_inputs: SpanRange,
    #[serde(default = "default_input_span")]
    pub input_registers: SpanRange,
    #[serde(default = "default_holding_span")]
    pub holding_registers: SpanRange,
}

impl Default for RegisterSpans {
    fn default() -> Self {
        Self {
            coils: default_coil_span(),
            discrete_inputs: default_discrete_span(),
            input_registers: default_input_span(),
            holding_registers: default_holding_span(),
        }
    }
}

/// Logging section of the configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional log file path; console-only when absent
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Top-level coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Device endpoint
    pub device: DeviceAddress,

    /// Scheduled acquisition period in seconds
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Bound on one full acquisition cycle in seconds
    #[serde(default = "default_acquisition_timeout_secs")]
    pub acquisition_timeout_secs: u64,

    /// Bound on one connection attempt in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Register spans acquired each cycle
    #[serde(default)]
    pub spans: RegisterSpans,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingSection,
}

impl CoordinatorConfig {
    /// Load from a YAML file, then apply `REGPOLL_`-prefixed environment
    /// overrides (`REGPOLL_DEVICE__HOST`, `REGPOLL_POLL_INTERVAL_SECS`, ...)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("REGPOLL_").split("__"))
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.host.is_empty() {
            return Err(ConfigError::Invalid("device.host must not be empty".into()));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_secs must be greater than zero".into(),
            ));
        }
        if self.acquisition_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "acquisition_timeout_secs must be greater than zero".into(),
            ));
        }
        for (name, span) in [
            ("coils", self.spans.coils),
            ("discrete_inputs", self.spans.discrete_inputs),
            ("input_registers", self.spans.input_registers),
            ("holding_registers", self.spans.holding_registers),
        ] {
            if span.count == 0 {
                return Err(ConfigError::Invalid(format!(
                    "spans.{}.count must be greater than zero",
                    name
                )));
            }
            // Highest address read is start + count - 1; it must stay within
            // the 16-bit address space.
            if u32::from(span.start) + u32::from(span.count) > u32::from(u16::MAX) + 1 {
                return Err(ConfigError::Invalid(format!(
                    "spans.{}: start {} + count {} exceeds the 16-bit address space",
                    name, span.start, span.count
                )));
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn acquisition_timeout(&self) -> Duration {
        Duration::from_secs(self.acquisition_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

fn default_coil_span() -> SpanRange {
    SpanRange::new(0, 7)
}

fn default_discrete_span() -> SpanRange {
    SpanRange::new(0, 54)
}

fn default_input_span() -> SpanRange {
    SpanRange::new(0, 33)
}

fn default_holding_span() -> SpanRange {
    SpanRange::new(0, 69)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval_secs() -> u64 {
    15
}

fn default_acquisition_timeout_secs() -> u64 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    5
}
