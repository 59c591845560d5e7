//! Engine settings.
//!
//! ```toml
//! [engine]
//! poll_interval_ms = 50
//! availability_poll_ms = 100
//! event_feed_capacity = 256
//!
//! [logging]
//! level = "debug"
//! file = "/var/log/labflow"
//! json = true
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default interval between thread-manager polls.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

/// Default re-check interval while waiting for a target location to empty.
pub const DEFAULT_AVAILABILITY_POLL_MS: u64 = 100;

/// Default capacity of the broadcast event feed.
pub const DEFAULT_EVENT_FEED_CAPACITY: usize = 256;

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g. project-local
/// overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LabflowConfig {
    /// Execution engine tuning.
    pub engine: Option<EngineConfig>,

    /// Log output settings.
    pub logging: Option<LoggingConfig>,
}

impl LabflowConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> crate::Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    pub fn merge(&mut self, other: LabflowConfig) {
        if other.engine.is_some() {
            self.engine = other.engine;
        }

        if other.logging.is_some() {
            self.logging = other.logging;
        }
    }

    /// Effective engine settings (defaults when the section is absent).
    pub fn engine(&self) -> EngineConfig {
        self.engine.clone().unwrap_or_default()
    }

    /// Effective logging settings (defaults when the section is absent).
    pub fn logging(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Execution engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long the thread manager yields between polls.
    pub poll_interval_ms: u64,
    /// How often a thread re-checks an occupied move target.
    pub availability_poll_ms: u64,
    /// Buffered events per feed subscriber before it starts lagging.
    pub event_feed_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            availability_poll_ms: DEFAULT_AVAILABILITY_POLL_MS,
            event_feed_capacity: DEFAULT_EVENT_FEED_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> crate::Result<()> {
        let zero = [
            ("poll_interval_ms", self.poll_interval_ms == 0),
            ("availability_poll_ms", self.availability_poll_ms == 0),
            ("event_feed_capacity", self.event_feed_capacity == 0),
        ];
        match zero.iter().find(|(_, is_zero)| *is_zero) {
            Some((field, _)) => Err(crate::ConfigError::Invalid(format!(
                "engine.{field} must be greater than zero"
            ))),
            None => Ok(()),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn availability_poll(&self) -> Duration {
        Duration::from_millis(self.availability_poll_ms.max(1))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Logging configuration section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Console filter directive (e.g. "debug" or "labflow_engine=trace").
    pub level: Option<String>,
    /// Directory for rolling log files. No file output when unset.
    pub file: Option<PathBuf>,
    /// Write the file output as JSON lines.
    pub json: bool,
}
