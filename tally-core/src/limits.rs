//! System limits and configuration bounds.
//!
//! Following TigerStyle: put limits on everything.
//! Every persisted collection has an explicit maximum size, so a corrupted
//! or hostile record can never make a decoder allocate without bound.

use crate::{Error, Result};

/// System-wide limits for Tally.
///
/// All limits are explicit and configurable. Default values are chosen
/// to be safe for most deployments while allowing customization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    // Record limits.
    /// Maximum size of a single persisted cursor record in bytes.
    pub max_record_bytes: u32,
    /// Maximum number of deleted ranges in a single record.
    pub max_ranges_per_record: u32,
    /// Maximum number of properties attached to a cursor.
    pub max_properties: u32,
    /// Maximum length of a property key in bytes.
    pub max_property_key_bytes: u32,
    /// Maximum length of a property value in bytes.
    pub max_property_value_bytes: u32,

    // Segment limits.
    /// Hard upper bound on entries written to one cursor segment.
    pub max_entries_per_segment: u64,
    /// Hard upper bound on bytes written to one cursor segment.
    pub max_segment_bytes: u64,

    // Retry limits.
    /// Hard upper bound on rollover attempts for a single flush.
    pub max_rollover_attempts: u32,
}

impl Limits {
    /// Creates limits with safe defaults.
    ///
    /// These defaults are chosen to be conservative and safe for most
    /// deployments. Production systems should tune these based on their
    /// acknowledgment patterns.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            // Records: 64MB record, 1M ranges, 1024 properties.
            max_record_bytes: 64 * 1024 * 1024,
            max_ranges_per_record: 1_000_000,
            max_properties: 1024,
            max_property_key_bytes: 1024,
            max_property_value_bytes: 64 * 1024,

            // Segments: 1M entries, 1GB.
            max_entries_per_segment: 1_000_000,
            max_segment_bytes: 1024 * 1024 * 1024,

            // Retries: at most 16 new segments per flush.
            max_rollover_attempts: 16,
        }
    }

    /// Validates that all limits are internally consistent.
    ///
    /// # Errors
    /// Returns an error if any limits are invalid or inconsistent.
    pub const fn validate(&self) -> Result<()> {
        if self.max_record_bytes == 0 {
            return Err(Error::InvalidArgument {
                name: "max_record_bytes",
                reason: "must be positive",
            });
        }

        // A record must at least hold one maximal property.
        let property_bytes =
            self.max_property_key_bytes as u64 + self.max_property_value_bytes as u64;
        if property_bytes > self.max_record_bytes as u64 {
            return Err(Error::InvalidArgument {
                name: "max_property_value_bytes",
                reason: "key + value must fit in max_record_bytes",
            });
        }

        if self.max_entries_per_segment == 0 {
            return Err(Error::InvalidArgument {
                name: "max_entries_per_segment",
                reason: "must be positive",
            });
        }

        if self.max_segment_bytes < self.max_record_bytes as u64 {
            return Err(Error::InvalidArgument {
                name: "max_segment_bytes",
                reason: "must be >= max_record_bytes",
            });
        }

        if self.max_rollover_attempts == 0 {
            return Err(Error::InvalidArgument {
                name: "max_rollover_attempts",
                reason: "must be positive",
            });
        }

        Ok(())
    }

    /// Checks a count against a limit.
    ///
    /// # Errors
    /// Returns `LimitExceeded` if `actual > max`.
    pub const fn check(limit: &'static str, max: u64, actual: u64) -> Result<()> {
        if actual > max {
            return Err(Error::LimitExceeded { limit, max, actual });
        }
        Ok(())
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::new()
    }
}
