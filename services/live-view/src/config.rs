//! Configuration for the live view
//!
//! Display constants (chart label length, history size) and the reconnect
//! policy live here instead of being hard-coded at their use sites. A config
//! can be loaded from a JSON file; missing fields keep their defaults and a
//! missing file yields the full default configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Default number of snapshots retained by the history window.
pub const DEFAULT_HISTORY_CAPACITY: usize = 10;

/// Default maximum chart label length before truncation.
pub const DEFAULT_LABEL_MAX_CHARS: usize = 8;

/// Default marker appended to truncated labels and ids.
pub const DEFAULT_ELLIPSIS: &str = "...";

/// Errors loading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Chart label presentation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChartConfig {
    /// Labels longer than this many characters are truncated.
    pub label_max_chars: usize,
    /// Marker appended to a truncated label.
    pub ellipsis: String,
}

impl Default for ChartConfig {
    fn default() -> Self {
        Self {
            label_max_chars: DEFAULT_LABEL_MAX_CHARS,
            ellipsis: DEFAULT_ELLIPSIS.to_string(),
        }
    }
}

/// Exponential backoff policy for transport failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt (default: 1s).
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay (default: 60s).
    pub max_delay_ms: u64,
    /// Reconnect attempts before the subscription is closed (default: 5).
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given 1-based attempt: doubles from the initial delay
    /// and is capped at `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .initial_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

/// Top-level live view configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewConfig {
    /// Backend collection holding snapshot documents.
    pub collection: String,
    /// Maximum number of snapshots in the history window.
    pub history_capacity: usize,
    /// How long `open` waits for the first delivery before returning.
    pub first_delivery_timeout_ms: u64,
    /// Characters of a document id shown in the history list.
    pub short_id_chars: usize,
    pub chart: ChartConfig,
    pub reconnect: ReconnectPolicy,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            collection: "product_counts".to_string(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            first_delivery_timeout_ms: 10_000,
            short_id_chars: 12,
            chart: ChartConfig::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ViewConfig {
    /// Parse a JSON document; absent fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: ViewConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file, falling back to defaults when it does not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&raw)?;
        info!(path = %path.display(), "Loaded view config");
        Ok(config)
    }

    pub fn first_delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.first_delivery_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.history_capacity == 0 {
            return Err(ConfigError::Invalid("history_capacity must be at least 1".into()));
        }
        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            return Err(ConfigError::Invalid(
                "reconnect.initial_delay_ms exceeds reconnect.max_delay_ms".into(),
            ));
        }
        Ok(())
    }
}
