//! Segment log error types.
//!
//! All errors are explicit and typed. Every error classifies itself as
//! transient (worth another attempt on a fresh segment), fatal (the segment
//! is gone for good) or corruption (the bytes cannot be trusted).

use thiserror::Error;

/// Result type for segment log operations.
pub type LogResult<T> = Result<T, LogError>;

/// Errors that can occur during segment log operations.
#[derive(Debug, Error)]
pub enum LogError {
    /// The operation did not complete in time.
    #[error("operation timed out: {operation}")]
    Timeout {
        /// What operation was being performed.
        operation: &'static str,
    },

    /// Not enough storage replicas acknowledged the write.
    #[error("not enough replicas for {operation}")]
    NotEnoughReplicas {
        /// What operation was being performed.
        operation: &'static str,
    },

    /// I/O error from underlying storage.
    #[error("I/O error: {operation}: {message}")]
    Io {
        /// What operation was being performed.
        operation: &'static str,
        /// Error message.
        message: String,
    },

    /// Segment not found (never created or deleted).
    #[error("segment {segment_id} not found")]
    SegmentNotFound {
        /// The segment ID that was not found.
        segment_id: u64,
    },

    /// Segment is closed or fenced and no longer accepts appends.
    #[error("segment {segment_id} is closed")]
    SegmentClosed {
        /// The closed segment.
        segment_id: u64,
    },

    /// The caller is not allowed to access the segment.
    #[error("access denied to segment {segment_id}")]
    AccessDenied {
        /// The segment that was denied.
        segment_id: u64,
    },

    /// The segment holds no entries.
    #[error("segment {segment_id} is empty")]
    EmptySegment {
        /// The empty segment.
        segment_id: u64,
    },

    /// Entry payload exceeds maximum size.
    #[error("entry too large: {size} bytes exceeds max {max} bytes")]
    EntryTooLarge {
        /// Actual size in bytes.
        size: u64,
        /// Maximum allowed size.
        max: u32,
    },

    /// CRC checksum mismatch indicates corruption.
    #[error("checksum mismatch at offset {offset}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Byte offset where corruption was detected.
        offset: u64,
        /// Expected CRC32 value.
        expected: u32,
        /// Actual CRC32 value computed.
        actual: u32,
    },

    /// Frame or segment header is invalid.
    #[error("invalid frame at offset {offset}: {reason}")]
    InvalidFrame {
        /// Byte offset of the frame.
        offset: u64,
        /// Why the frame is invalid.
        reason: &'static str,
    },

    /// A torn write left a partial entry at the tail.
    #[error("truncated entry at offset {offset}: expected {expected} bytes, found {found} bytes")]
    TruncatedEntry {
        /// Offset of the truncated entry.
        offset: u64,
        /// Expected entry size.
        expected: u32,
        /// Actual bytes found.
        found: u32,
    },
}

impl LogError {
    /// Creates an I/O error.
    pub fn io(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Io {
            operation,
            message: err.to_string(),
        }
    }

    /// Returns true if another attempt on a fresh segment may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::NotEnoughReplicas { .. } | Self::Io { .. }
        )
    }

    /// Returns true if the segment must be abandoned permanently.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SegmentNotFound { .. } | Self::SegmentClosed { .. } | Self::AccessDenied { .. }
        )
    }

    /// Returns true if this error indicates data corruption.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. } | Self::InvalidFrame { .. }
        )
    }

    /// Returns true if this error is a torn tail that recovery may skip.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::TruncatedEntry { .. })
    }
}
