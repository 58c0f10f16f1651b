//! Limiter configuration model.
//!
//! A [`LimiterConfig`] is an immutable-per-version value: identity, global
//! switch, overflow strategy, and one sub-config per admission dimension. It
//! is always replaced as a whole (an `Arc` snapshot swap), never mutated
//! field-by-field, so in-flight calls observe a consistent version.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{FloodgateError, Result};

/// Delimiter joining the identity fields. No identity field may contain it.
pub const IDENTITY_DELIMITER: char = ':';

/// A two-state switch used for the global limiter and each gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Switch {
    On,
    Off,
}

impl Switch {
    /// Whether the switch is in the `On` position.
    pub fn is_on(self) -> bool {
        self == Switch::On
    }
}

/// Action taken when a gate reports that its dimension is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowStrategy {
    /// Let the exceeding call proceed anyway.
    Ignore,
    /// Invoke the caller-supplied fallback.
    Fallback,
    /// Return a typed limit-exceeded error.
    Reject,
}

/// Configuration for the concurrency gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Whether the concurrency gate is evaluated
    #[serde(default = "default_switch_off")]
    pub enable: Switch,

    /// Permits consumed per call
    #[serde(default = "default_unit")]
    pub permit_unit: u32,

    /// Ceiling on in-flight permits
    #[serde(default = "default_max")]
    pub max_permit: u32,

    /// Maximum wait when acquiring, in milliseconds; 0 means non-blocking
    #[serde(default)]
    pub timeout_ms: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            enable: default_switch_off(),
            permit_unit: default_unit(),
            max_permit: default_max(),
            timeout_ms: 0,
        }
    }
}

impl ConcurrencyConfig {
    /// Acquire timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Configuration for the rate gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateConfig {
    /// Whether the rate gate is evaluated
    #[serde(default = "default_switch_off")]
    pub enable: Switch,

    /// Tokens consumed per call
    #[serde(default = "default_unit")]
    pub rate_unit: u32,

    /// Token replenishment ceiling, per second
    #[serde(default = "default_max")]
    pub max_rate: u32,

    /// Maximum wait for the next token, in milliseconds; 0 means non-blocking
    #[serde(default)]
    pub timeout_ms: u64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            enable: default_switch_off(),
            rate_unit: default_unit(),
            max_rate: default_max(),
            timeout_ms: 0,
        }
    }
}

impl RateConfig {
    /// Acquire timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Configuration for the counter gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterConfig {
    /// Whether the counter gate is evaluated
    #[serde(default = "default_switch_off")]
    pub enable: Switch,

    /// Increment per call
    #[serde(default = "default_unit")]
    pub count_unit: u32,

    /// Ceiling on the accumulated count within one window
    #[serde(default = "default_max_count")]
    pub max_count: u64,

    /// Round-trip timeout for the store backend, in milliseconds; the local
    /// counter gate never blocks
    #[serde(default)]
    pub timeout_ms: u64,

    /// Window length in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            enable: default_switch_off(),
            count_unit: default_unit(),
            max_count: default_max_count(),
            timeout_ms: 0,
            interval_ms: default_interval_ms(),
        }
    }
}

impl CounterConfig {
    /// Store round-trip timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Window length as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

fn default_switch_off() -> Switch {
    Switch::Off
}

fn default_switch_on() -> Switch {
    Switch::On
}

fn default_strategy() -> OverflowStrategy {
    OverflowStrategy::Ignore
}

fn default_unit() -> u32 {
    1
}

fn default_max() -> u32 {
    1
}

fn default_max_count() -> u64 {
    1
}

fn default_interval_ms() -> u64 {
    1000
}

/// Complete configuration for one limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Node the protected resource runs on
    pub node: String,
    /// Application the protected resource belongs to
    pub application: String,
    /// Group within the application
    pub group: String,
    /// Tag identifying the protected resource itself
    pub tag: String,

    /// Global switch; `off` bypasses all gates
    #[serde(default = "default_switch_on")]
    pub enable: Switch,

    /// Action taken when a gate reports its dimension exceeded
    #[serde(default = "default_strategy")]
    pub strategy: OverflowStrategy,

    /// Concurrency gate configuration
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    /// Rate gate configuration
    #[serde(default)]
    pub rate: RateConfig,

    /// Counter gate configuration
    #[serde(default)]
    pub counter: CounterConfig,
}

impl LimiterConfig {
    /// Deterministic join of the identity fields.
    ///
    /// Used as the registry lookup key and as the store key prefix.
    pub fn identity(&self) -> String {
        format!(
            "{}{d}{}{d}{}{d}{}",
            self.node,
            self.application,
            self.group,
            self.tag,
            d = IDENTITY_DELIMITER
        )
    }

    /// Validate the configuration.
    ///
    /// Identity fields must be non-empty and free of the delimiter; every
    /// sub-config must satisfy `unit >= 1` and `max >= unit`; the counter
    /// window must be at least one millisecond.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("node", &self.node),
            ("application", &self.application),
            ("group", &self.group),
            ("tag", &self.tag),
        ] {
            if value.is_empty() {
                return Err(FloodgateError::Config(format!(
                    "identity field '{name}' must not be empty"
                )));
            }
            if value.contains(IDENTITY_DELIMITER) {
                return Err(FloodgateError::Config(format!(
                    "identity field '{name}' must not contain '{IDENTITY_DELIMITER}'"
                )));
            }
        }

        if self.concurrency.permit_unit < 1 {
            return Err(FloodgateError::Config(
                "concurrency permit_unit must be >= 1".to_string(),
            ));
        }
        if self.concurrency.max_permit < self.concurrency.permit_unit {
            return Err(FloodgateError::Config(
                "concurrency max_permit must be >= permit_unit".to_string(),
            ));
        }

        if self.rate.rate_unit < 1 {
            return Err(FloodgateError::Config(
                "rate rate_unit must be >= 1".to_string(),
            ));
        }
        if self.rate.max_rate < self.rate.rate_unit {
            return Err(FloodgateError::Config(
                "rate max_rate must be >= rate_unit".to_string(),
            ));
        }

        if self.counter.count_unit < 1 {
            return Err(FloodgateError::Config(
                "counter count_unit must be >= 1".to_string(),
            ));
        }
        if self.counter.max_count < self.counter.count_unit as u64 {
            return Err(FloodgateError::Config(
                "counter max_count must be >= count_unit".to_string(),
            ));
        }
        if self.counter.interval_ms < 1 {
            return Err(FloodgateError::Config(
                "counter interval_ms must be >= 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse limiter config: {e}")))
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse limiter config: {e}")))
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }
}
