//! Cursor configuration.
//!
//! Loadable from TOML; every field has a production default so a config file
//! only needs to name what it overrides.
//!
//! ```toml
//! persist_after_acks = 100
//! flush_interval_ms = 500
//! record_format = "compact"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tally_core::Limits;

/// Encoding of the range section of a persisted snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordFormat {
    /// Fixed-width positions, four 64-bit fields per range.
    #[default]
    Fixed,
    /// Delta varint encoding of range boundaries.
    Compact,
}

/// Persistence and rollover settings for one cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CursorConfig {
    /// Acknowledgments accumulated before a flush is triggered.
    pub persist_after_acks: u64,
    /// Period of the registry's flush timer in milliseconds.
    pub flush_interval_ms: u64,
    /// Entries written to one primary segment before rolling over.
    pub max_entries_per_segment: u64,
    /// Bytes written to one primary segment before rolling over.
    pub max_segment_bytes: u64,
    /// New segments tried per flush before falling back to the metadata store.
    pub rollover_attempts: u32,
    /// Backoff before the second rollover attempt, doubled after each failure.
    pub rollover_backoff_base_ms: u64,
    /// Upper bound on the rollover backoff.
    pub rollover_backoff_max_ms: u64,
    /// Retries of a metadata store write after connection loss.
    pub metadata_retry_attempts: u32,
    /// Encoding of persisted ranges.
    pub record_format: RecordFormat,
    /// Ranges written per snapshot; the rest are dropped with a warning.
    pub max_ranges_to_persist: u32,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            persist_after_acks: 1000,
            flush_interval_ms: 1000,
            max_entries_per_segment: 10_000,
            max_segment_bytes: 64 * 1024 * 1024, // 64MB
            rollover_attempts: 3,
            rollover_backoff_base_ms: 10,
            rollover_backoff_max_ms: 1000,
            metadata_retry_attempts: 2,
            record_format: RecordFormat::Fixed,
            max_ranges_to_persist: 10_000,
        }
    }
}

impl CursorConfig {
    /// Creates config for testing: flush on every acknowledgment, no backoff.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            persist_after_acks: 1,
            flush_interval_ms: 50,
            rollover_backoff_base_ms: 0,
            rollover_backoff_max_ms: 0,
            ..Self::default()
        }
    }

    /// Load a config from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse a config from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML cannot be parsed or the values are invalid.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the config to a TOML string.
    #[must_use]
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Checks that every threshold is usable.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let field = if self.persist_after_acks == 0 {
            "persist_after_acks"
        } else if self.max_entries_per_segment == 0 {
            "max_entries_per_segment"
        } else if self.max_segment_bytes == 0 {
            "max_segment_bytes"
        } else if self.rollover_attempts == 0 {
            "rollover_attempts"
        } else if self.rollover_backoff_base_ms > self.rollover_backoff_max_ms {
            "rollover_backoff_base_ms"
        } else {
            return Ok(());
        };
        Err(ConfigError::Invalid { field })
    }

    /// Returns a copy with every bound lowered to the matching hard limit.
    ///
    /// A snapshot written under the returned config always decodes under
    /// `limits`.
    #[must_use]
    pub fn within(&self, limits: &Limits) -> Self {
        Self {
            max_entries_per_segment: self
                .max_entries_per_segment
                .min(limits.max_entries_per_segment),
            max_segment_bytes: self.max_segment_bytes.min(limits.max_segment_bytes),
            rollover_attempts: self.rollover_attempts.min(limits.max_rollover_attempts),
            max_ranges_to_persist: self
                .max_ranges_to_persist
                .min(limits.max_ranges_per_record),
            ..self.clone()
        }
    }

    /// Returns the flush timer period.
    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Returns the backoff before rollover attempt `attempt` (0-based).
    ///
    /// The first attempt never waits; attempt `n` waits
    /// `base * 2^(n-1)`, capped at `rollover_backoff_max_ms`.
    #[must_use]
    pub fn rollover_backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
        let ms = self
            .rollover_backoff_base_ms
            .saturating_mul(factor)
            .min(self.rollover_backoff_max_ms);
        Duration::from_millis(ms)
    }
}

/// Error type for config operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading the config file.
    #[error("failed to read config from {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parse error.
    #[error("failed to parse config: {message}")]
    Parse {
        /// Error message.
        message: String,
    },

    /// A value is out of range.
    #[error("invalid config value for {field}")]
    Invalid {
        /// The offending field.
        field: &'static str,
    },
}
