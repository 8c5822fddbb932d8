//! Configuration for a link connection.
//!
//! The [`LinkConfig`] structure represents the contents of a
//! `link.toml` file.  Every field has a default so an empty file (or
//! no file at all) yields a usable configuration.  The structure is
//! deserialisable via `serde`, so it can be read straight from TOML.
//!
//! Example `link.toml`:
//!
//! ```toml
//! protocol = "v2"
//! max_frame_size = 16384
//! ack_window = 32
//! window_violation = "disconnect"
//! keepalive_secs = 30
//! read_timeout_secs = 90
//!
//! [scheduler]
//! max_workers = 8
//!
//! [reconnect]
//! initial_delay_ms = 500
//! max_delay_ms = 30000
//! max_attempts = 0
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Which wire variant a session speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    /// Newline-delimited JSON objects, one message per line.
    V1,
    /// Binary frames with multipart splitting and ack-based credit.
    V2,
}

/// What to do when the peer sends a v2 frame beyond the credit we
/// advertised.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowViolationPolicy {
    /// Treat the frame as a fatal framing error and drop the connection.
    #[default]
    Disconnect,
    /// Log the violation and keep processing.
    Ignore,
}

/// Top‑level configuration structure.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LinkConfig {
    pub protocol: ProtocolVersion,
    /// Largest body carried by one physical v2 frame.  Larger payloads
    /// are split into multipart sequences.  For v1 this bounds a single
    /// line at sixteen times the value.
    pub max_frame_size: usize,
    /// Number of v2 frames that may be in flight past the last ack.
    pub ack_window: u32,
    pub window_violation: WindowViolationPolicy,
    /// Keepalive interval in seconds.  Zero disables keepalives.
    pub keepalive_secs: u64,
    /// Read timeout in seconds.  Zero disables the timeout.
    pub read_timeout_secs: u64,
    pub scheduler: SchedulerSection,
    pub reconnect: ReconnectSection,
}

/// Worker pool settings.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerSection {
    /// Upper bound on scheduled tasks executing at once.
    pub max_workers: usize,
}

/// Backoff settings used between connection attempts.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ReconnectSection {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Zero means retry forever.
    pub max_attempts: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolVersion::V1,
            max_frame_size: 16 * 1024,
            ack_window: 32,
            window_violation: WindowViolationPolicy::Disconnect,
            keepalive_secs: 30,
            read_timeout_secs: 0,
            scheduler: SchedulerSection::default(),
            reconnect: ReconnectSection::default(),
        }
    }
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self { max_workers: 8 }
    }
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            max_attempts: 0,
        }
    }
}

impl LinkConfig {
    /// Load configuration from a file.  A missing file is an error;
    /// use [`LinkConfig::default`] when no file is configured.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(contents)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_size < 16 {
            return Err(ConfigError::Invalid(format!(
                "max_frame_size must be at least 16, got {}",
                self.max_frame_size
            )));
        }
        if self.ack_window == 0 {
            return Err(ConfigError::Invalid("ack_window must be positive".into()));
        }
        if self.scheduler.max_workers == 0 {
            return Err(ConfigError::Invalid("scheduler.max_workers must be positive".into()));
        }
        Ok(())
    }

    pub fn keepalive(&self) -> Option<Duration> {
        (self.keepalive_secs > 0).then(|| Duration::from_secs(self.keepalive_secs))
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_secs > 0).then(|| Duration::from_secs(self.read_timeout_secs))
    }
}
