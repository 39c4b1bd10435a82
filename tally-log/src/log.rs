//! The segment log contract consumed by cursor persistence.
//!
//! A segment is an append-only, sealable unit of the durable log. Cursors
//! write each snapshot as one entry and, on recovery, only ever need the
//! last entry of a segment.

use async_trait::async_trait;
use bytes::Bytes;
use tally_core::{Position, SegmentId};

use crate::error::LogResult;

/// Handle to a segment returned by [`SegmentLog::create_segment`] or
/// [`SegmentLog::open_segment`].
///
/// Handles are deliberately not `Clone`: exactly one owner closes a segment,
/// and [`SegmentLog::close_segment`] consumes the handle.
#[derive(Debug, PartialEq, Eq)]
pub struct SegmentHandle {
    segment_id: SegmentId,
    writable: bool,
}

impl SegmentHandle {
    /// Creates a handle. Only log implementations should call this.
    #[must_use]
    pub const fn new(segment_id: SegmentId, writable: bool) -> Self {
        Self {
            segment_id,
            writable,
        }
    }

    /// Returns the segment this handle refers to.
    #[must_use]
    pub const fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    /// Returns true if the handle was created for appending.
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.writable
    }
}

/// Append-only segment log.
///
/// Implementations must be `Send + Sync` for use across async tasks.
/// Every operation may suspend on I/O; errors classify themselves via
/// [`crate::LogError::is_transient`] and [`crate::LogError::is_fatal`].
#[async_trait]
pub trait SegmentLog: Send + Sync + std::fmt::Debug {
    /// Creates a new, empty, writable segment with a fresh id.
    async fn create_segment(&self) -> LogResult<SegmentHandle>;

    /// Opens an existing segment for reading.
    async fn open_segment(&self, segment_id: SegmentId) -> LogResult<SegmentHandle>;

    /// Appends one entry and returns its position.
    async fn append(&self, handle: &SegmentHandle, data: Bytes) -> LogResult<Position>;

    /// Reads the newest entry of the segment.
    async fn read_last_entry(&self, handle: &SegmentHandle) -> LogResult<Bytes>;

    /// Seals the segment and releases the handle.
    async fn close_segment(&self, handle: SegmentHandle) -> LogResult<()>;

    /// Deletes the segment and all its entries.
    async fn delete_segment(&self, segment_id: SegmentId) -> LogResult<()>;
}
