//! Engine configuration.
//!
//! Timing knobs for the interrupt retry and the supervisor's liveness
//! poll. Loaded from TOML where an embedding application has a config
//! file, or constructed in code (tests shrink the delays).

use std::time::Duration;

use serde::Deserialize;

/// Per-document engine configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DocumentConfig {
    /// Delay before re-evaluating an interrupt that arrived while the
    /// backend had not yet reported busy. Retries are unbounded; a dead
    /// backend is caught by the liveness poll instead.
    pub interrupt_retry_ms: u64,
    /// Interval of the supervisor's backend liveness poll.
    pub liveness_poll_ms: u64,
    /// Capacity of the backend's broadcast event channel.
    pub event_capacity: usize,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            interrupt_retry_ms: 500,
            liveness_poll_ms: 100,
            event_capacity: 256,
        }
    }
}

impl DocumentConfig {
    /// Parse from a TOML document. Unknown keys are rejected so a typo in
    /// a config file fails loudly.
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn interrupt_retry(&self) -> Duration {
        Duration::from_millis(self.interrupt_retry_ms)
    }

    pub fn liveness_poll(&self) -> Duration {
        Duration::from_millis(self.liveness_poll_ms)
    }
}
