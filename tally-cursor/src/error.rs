//! Cursor error types.

use tally_log::LogError;
use tally_meta::MetaError;
use thiserror::Error;

/// Result type for cursor operations.
pub type CursorResult<T> = Result<T, CursorError>;

/// Errors that can occur during cursor operations.
///
/// None of these ever reach the acknowledgment path: `add_acknowledgment`
/// and `advance_mark_delete` are infallible, and persistence failures only
/// show up in counters and logs.
#[derive(Debug, Error)]
pub enum CursorError {
    /// The primary segment log failed.
    #[error("segment log: {0}")]
    Log(#[from] LogError),

    /// The metadata store failed.
    #[error("metadata store: {0}")]
    Meta(#[from] MetaError),

    /// A hard limit was exceeded.
    #[error(transparent)]
    Limit(#[from] tally_core::Error),

    /// The cursor configuration is unusable.
    #[error("config: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// A persisted record failed its checksum.
    #[error("record checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// CRC32 stored in the record.
        expected: u32,
        /// CRC32 computed over the record bytes.
        actual: u32,
    },

    /// A persisted record is structurally invalid.
    #[error("invalid record: {reason}")]
    InvalidRecord {
        /// Why the record is invalid.
        reason: &'static str,
    },

    /// A persisted record uses an unknown format version.
    #[error("unsupported record format version {version}")]
    UnsupportedFormat {
        /// The version found in the record.
        version: u32,
    },

    /// Topic or subscription name cannot be used as a cursor id.
    #[error("invalid cursor id: {reason}")]
    InvalidCursorId {
        /// Why the id is invalid.
        reason: &'static str,
    },

    /// A cursor with the same id is already open in this registry.
    #[error("cursor {cursor} is already open")]
    AlreadyOpen {
        /// The cursor id.
        cursor: String,
    },

    /// The cursor was closed.
    #[error("cursor {cursor} is closed")]
    Closed {
        /// The cursor id.
        cursor: String,
    },

    /// Metric registration or encoding failed.
    #[error("metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl CursorError {
    /// Returns true if this error means persisted bytes cannot be trusted.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        match self {
            Self::ChecksumMismatch { .. }
            | Self::InvalidRecord { .. }
            | Self::UnsupportedFormat { .. } => true,
            Self::Log(e) => e.is_corruption(),
            _ => false,
        }
    }
}
