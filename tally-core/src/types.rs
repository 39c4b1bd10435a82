//! Strongly-typed identifiers and log positions.
//!
//! Following `TigerStyle`: explicit types prevent bugs from mixing up IDs.
//! All IDs are 64-bit to handle long-lived logs.

use std::fmt;

/// Macro to generate strongly-typed ID wrappers.
///
/// Each ID type wraps a u64 and provides:
/// - Type safety (can't mix `SegmentId` with `Version`)
/// - Debug/Display formatting
/// - Zero-cost abstraction (same as raw u64)
macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new ID from a raw u64 value.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw u64 value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Returns the next ID in sequence.
            ///
            /// # Panics
            /// Panics if the ID would overflow.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                assert!(self.0 < u64::MAX, "ID overflow");
                Self(self.0 + 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.get()
            }
        }
    };
}

// Log layout.
define_id!(SegmentId, "segment", "Unique identifier for a segment of an append-only log.");

// Cursor persistence.
define_id!(WriteSeq, "seq", "Monotonic sequence number of a persisted cursor snapshot.");
define_id!(Version, "v", "Version of a value held in the metadata store.");

// -----------------------------------------------------------------------------
// Position
// -----------------------------------------------------------------------------

/// Entry id used as the exclusive lower bound "before the first entry".
const BEFORE_FIRST_ENTRY: i64 = -1;

/// A totally ordered position in the append-only log.
///
/// Positions compare lexicographically on `(segment_id, entry_id)`. Entry ids
/// start at 0 within each segment; the entry id `-1` denotes the boundary
/// immediately before the first entry of a segment and is only ever used as
/// an exclusive lower bound or as an initial mark-delete position.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    segment_id: SegmentId,
    entry_id: i64,
}

impl Position {
    /// Creates a position for an entry.
    ///
    /// # Panics
    /// Panics if `entry_id < -1`.
    #[must_use]
    pub const fn new(segment_id: SegmentId, entry_id: i64) -> Self {
        assert!(entry_id >= BEFORE_FIRST_ENTRY, "entry_id must be >= -1");
        Self {
            segment_id,
            entry_id,
        }
    }

    /// Returns the boundary before the first entry of `segment_id`.
    #[must_use]
    pub const fn before_first(segment_id: SegmentId) -> Self {
        Self {
            segment_id,
            entry_id: BEFORE_FIRST_ENTRY,
        }
    }

    /// Returns the segment this position belongs to.
    #[inline]
    #[must_use]
    pub const fn segment_id(self) -> SegmentId {
        self.segment_id
    }

    /// Returns the entry id within the segment.
    #[inline]
    #[must_use]
    pub const fn entry_id(self) -> i64 {
        self.entry_id
    }

    /// Returns true if this position addresses a real entry (not a boundary).
    #[inline]
    #[must_use]
    pub const fn is_entry(self) -> bool {
        self.entry_id >= 0
    }

    /// Returns the position immediately before this one in the same segment.
    ///
    /// # Panics
    /// Panics if called on a before-first boundary.
    #[must_use]
    pub const fn previous(self) -> Self {
        assert!(self.entry_id >= 0, "no position before a segment boundary");
        Self {
            segment_id: self.segment_id,
            entry_id: self.entry_id - 1,
        }
    }

    /// Returns the position immediately after this one in the same segment.
    ///
    /// # Panics
    /// Panics if the entry id would overflow.
    #[must_use]
    pub const fn next(self) -> Self {
        assert!(self.entry_id < i64::MAX, "entry id overflow");
        Self {
            segment_id: self.segment_id,
            entry_id: self.entry_id + 1,
        }
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::before_first(SegmentId::new(0))
    }
}

impl fmt::Debug for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pos({}:{})", self.segment_id.get(), self.entry_id)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment_id.get(), self.entry_id)
    }
}
