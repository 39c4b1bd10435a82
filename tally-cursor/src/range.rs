//! Out-of-order acknowledgment tracking.
//!
//! A [`RangeTracker`] holds the cumulative mark-delete position and the set
//! of disjoint acknowledged ranges beyond it. Ranges are half-open
//! `(lower, upper]` spans of positions within one segment. Two ranges that
//! touch are always merged, and a range starting at the mark-delete position
//! is always absorbed into it.
//!
//! # Compact encoding
//!
//! ```text
//! mark_delete.segment | mark_delete.entry+1 | count | count x range
//! range = lower.segment_delta | lower.entry | upper.segment_delta | upper.entry
//! ```
//!
//! Every field is an unsigned LEB128 varint. A segment delta is relative to
//! the previous boundary; when it is zero the entry is stored as a delta from
//! the previous boundary's entry, otherwise as `entry + 1`.

use std::collections::BTreeMap;
use std::fmt;

use bytes::{Buf, Bytes, BytesMut};
use prost::encoding::{decode_varint, encode_varint};
use tally_core::{Limits, Position, SegmentId};

use crate::error::{CursorError, CursorResult};

// -----------------------------------------------------------------------------
// DeletedRange
// -----------------------------------------------------------------------------

/// A contiguous span `(lower, upper]` acknowledged out of order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeletedRange {
    lower: Position,
    upper: Position,
}

impl DeletedRange {
    /// Creates a range from its exclusive lower and inclusive upper bound.
    ///
    /// # Panics
    ///
    /// Panics if `lower >= upper`.
    #[must_use]
    pub fn new(lower: Position, upper: Position) -> Self {
        assert!(lower < upper, "range lower bound must be below upper bound");
        Self { lower, upper }
    }

    /// Returns the exclusive lower bound.
    #[must_use]
    pub const fn lower(&self) -> Position {
        self.lower
    }

    /// Returns the inclusive upper bound.
    #[must_use]
    pub const fn upper(&self) -> Position {
        self.upper
    }

    /// Returns true if `position` lies in `(lower, upper]`.
    #[must_use]
    pub fn contains(&self, position: Position) -> bool {
        self.lower < position && position <= self.upper
    }
}

impl fmt::Debug for DeletedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}..{}]", self.lower, self.upper)
    }
}

// -----------------------------------------------------------------------------
// RangeSnapshot
// -----------------------------------------------------------------------------

/// Immutable copy of a tracker's state, taken for a flush.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RangeSnapshot {
    /// Cumulative acknowledgment boundary.
    pub mark_delete: Position,
    /// Ranges beyond the boundary, ordered by lower bound.
    pub ranges: Vec<DeletedRange>,
}

impl RangeSnapshot {
    /// Checks the tracker invariants: ranges ordered, disjoint, non-adjacent
    /// and strictly beyond the mark-delete position.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRecord` naming the first violated invariant.
    pub fn validate(&self) -> CursorResult<()> {
        let mut floor = self.mark_delete;
        for range in &self.ranges {
            if range.lower < floor {
                return Err(CursorError::InvalidRecord {
                    reason: "ranges overlap or precede mark-delete",
                });
            }
            if range.lower == floor {
                return Err(CursorError::InvalidRecord {
                    reason: "range touches previous boundary",
                });
            }
            if range.lower.segment_id() != range.upper.segment_id() {
                return Err(CursorError::InvalidRecord {
                    reason: "range spans segments",
                });
            }
            floor = range.upper;
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// RangeTracker
// -----------------------------------------------------------------------------

/// Mark-delete position plus disjoint out-of-order acknowledged ranges.
///
/// Ranges are keyed by their exclusive lower bound, so finding the neighbor
/// of a position is a single ordered-map lookup.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RangeTracker {
    mark_delete: Position,
    /// lower (exclusive) -> upper (inclusive).
    ranges: BTreeMap<Position, Position>,
}

impl RangeTracker {
    /// Creates an empty tracker with the given mark-delete position.
    #[must_use]
    pub const fn new(mark_delete: Position) -> Self {
        Self {
            mark_delete,
            ranges: BTreeMap::new(),
        }
    }

    /// Rebuilds a tracker from a snapshot.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRecord` if the snapshot violates the tracker invariants.
    pub fn from_snapshot(snapshot: &RangeSnapshot) -> CursorResult<Self> {
        snapshot.validate()?;
        Ok(Self {
            mark_delete: snapshot.mark_delete,
            ranges: snapshot
                .ranges
                .iter()
                .map(|r| (r.lower, r.upper))
                .collect(),
        })
    }

    /// Returns the cumulative acknowledgment boundary.
    #[must_use]
    pub const fn mark_delete(&self) -> Position {
        self.mark_delete
    }

    /// Returns the number of disjoint ranges beyond the boundary.
    #[must_use]
    pub fn number_of_ranges(&self) -> usize {
        self.ranges.len()
    }

    /// Returns the ranges ordered by lower bound.
    pub fn ranges(&self) -> impl Iterator<Item = DeletedRange> + '_ {
        self.ranges
            .iter()
            .map(|(&lower, &upper)| DeletedRange { lower, upper })
    }

    /// Returns true if `position` is at or below the boundary or in a range.
    #[must_use]
    pub fn is_acknowledged(&self, position: Position) -> bool {
        position <= self.mark_delete || self.range_containing(position).is_some()
    }

    fn range_containing(&self, position: Position) -> Option<(Position, Position)> {
        self.ranges
            .range(..position)
            .next_back()
            .filter(|(_, &upper)| position <= upper)
            .map(|(&lower, &upper)| (lower, upper))
    }

    /// Marks `position` acknowledged.
    ///
    /// Returns false if it was already covered. Otherwise inserts a length-1
    /// range, merges it with touching neighbors and absorbs it into the
    /// mark-delete position if it now starts there.
    pub fn add(&mut self, position: Position) -> bool {
        if !position.is_entry() || self.is_acknowledged(position) {
            return false;
        }

        let mut lower = position.previous();
        let mut upper = position;

        // Left neighbor ends right before us.
        if let Some((&left_lower, &left_upper)) = self.ranges.range(..position).next_back() {
            if left_upper == lower {
                self.ranges.remove(&left_lower);
                lower = left_lower;
            }
        }

        // Right neighbor starts right after us.
        if let Some(right_upper) = self.ranges.remove(&position) {
            upper = right_upper;
        }

        self.ranges.insert(lower, upper);
        self.absorb();
        true
    }

    /// Advances the mark-delete position to `position`.
    ///
    /// No-op (returns false) unless `position` is beyond the current
    /// boundary. Ranges at or below it are dropped, a straddling range is
    /// trimmed, and a range left starting at the boundary is absorbed.
    pub fn mark_delete_to(&mut self, position: Position) -> bool {
        if position <= self.mark_delete {
            return false;
        }

        let covered: Vec<Position> = self.ranges.range(..position).map(|(&l, _)| l).collect();
        for lower in covered {
            if let Some(upper) = self.ranges.remove(&lower) {
                if upper > position {
                    self.ranges.insert(position, upper);
                }
            }
        }

        self.mark_delete = position;
        self.absorb();
        true
    }

    /// Moves the boundary through every range that starts at it.
    fn absorb(&mut self) {
        // TigerStyle: Iterative, bounded by the number of ranges.
        while let Some(upper) = self.ranges.remove(&self.mark_delete) {
            self.mark_delete = upper;
        }
    }

    /// Returns an immutable copy of the state.
    #[must_use]
    pub fn snapshot(&self) -> RangeSnapshot {
        RangeSnapshot {
            mark_delete: self.mark_delete,
            ranges: self.ranges().collect(),
        }
    }

    /// Encodes the state in the compact delta-varint form.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        encode_ranges(&self.snapshot())
    }

    /// Decodes a tracker from the compact form.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are malformed or exceed `limits`.
    pub fn decode(data: &[u8], limits: &Limits) -> CursorResult<Self> {
        let mut buf = data;
        let snapshot = decode_ranges(&mut buf, limits)?;
        if buf.has_remaining() {
            return Err(CursorError::InvalidRecord {
                reason: "trailing bytes after ranges",
            });
        }
        Self::from_snapshot(&snapshot)
    }
}

// -----------------------------------------------------------------------------
// Compact codec
// -----------------------------------------------------------------------------

/// Entry ids start at -1, so `entry + 1` covers the whole range in a `u64`.
const fn entry_to_wire(entry_id: i64) -> u64 {
    entry_id.abs_diff(-1)
}

fn entry_from_wire(value: u64) -> CursorResult<i64> {
    (-1i64)
        .checked_add_unsigned(value)
        .ok_or(CursorError::InvalidRecord {
            reason: "entry id out of range",
        })
}

/// Encodes `position` relative to `previous`.
fn encode_boundary(previous: Position, position: Position, buf: &mut BytesMut) {
    let segment_delta = position.segment_id().get() - previous.segment_id().get();
    encode_varint(segment_delta, buf);
    if segment_delta == 0 {
        debug_assert!(position.entry_id() >= previous.entry_id());
        encode_varint(position.entry_id().abs_diff(previous.entry_id()), buf);
    } else {
        encode_varint(entry_to_wire(position.entry_id()), buf);
    }
}

fn decode_boundary(previous: Position, buf: &mut &[u8]) -> CursorResult<Position> {
    let segment_delta = read_varint(buf)?;
    let raw_entry = read_varint(buf)?;
    if segment_delta == 0 {
        let entry_id = previous
            .entry_id()
            .checked_add_unsigned(raw_entry)
            .ok_or(CursorError::InvalidRecord {
                reason: "entry id overflow",
            })?;
        Ok(Position::new(previous.segment_id(), entry_id))
    } else {
        let segment = previous
            .segment_id()
            .get()
            .checked_add(segment_delta)
            .ok_or(CursorError::InvalidRecord {
                reason: "segment id overflow",
            })?;
        Ok(Position::new(SegmentId::new(segment), entry_from_wire(raw_entry)?))
    }
}

fn read_varint(buf: &mut &[u8]) -> CursorResult<u64> {
    decode_varint(buf).map_err(|_| CursorError::InvalidRecord {
        reason: "malformed varint",
    })
}

/// Encodes a snapshot's boundary and ranges in the compact form.
pub(crate) fn encode_ranges(snapshot: &RangeSnapshot) -> Bytes {
    let mut buf = BytesMut::with_capacity(16 + snapshot.ranges.len() * 8);
    encode_varint(snapshot.mark_delete.segment_id().get(), &mut buf);
    encode_varint(entry_to_wire(snapshot.mark_delete.entry_id()), &mut buf);
    encode_varint(snapshot.ranges.len() as u64, &mut buf);

    let mut previous = snapshot.mark_delete;
    for range in &snapshot.ranges {
        debug_assert!(range.lower >= previous, "ranges must be ordered");
        encode_boundary(previous, range.lower, &mut buf);
        encode_boundary(range.lower, range.upper, &mut buf);
        previous = range.upper;
    }
    buf.freeze()
}

/// Decodes a compact snapshot, advancing `buf` past it.
pub(crate) fn decode_ranges(buf: &mut &[u8], limits: &Limits) -> CursorResult<RangeSnapshot> {
    let segment = read_varint(buf)?;
    let entry = entry_from_wire(read_varint(buf)?)?;
    let mark_delete = Position::new(SegmentId::new(segment), entry);

    let count = read_varint(buf)?;
    Limits::check(
        "ranges_per_record",
        u64::from(limits.max_ranges_per_record),
        count,
    )?;

    // TigerStyle: Each range needs at least four bytes, bound before allocating.
    if count.saturating_mul(4) > buf.remaining() as u64 {
        return Err(CursorError::InvalidRecord {
            reason: "range count exceeds record size",
        });
    }

    #[allow(clippy::cast_possible_truncation)]
    let mut ranges = Vec::with_capacity(count as usize);
    let mut previous = mark_delete;
    for _ in 0..count {
        let lower = decode_boundary(previous, buf)?;
        let upper = decode_boundary(lower, buf)?;
        if lower >= upper {
            return Err(CursorError::InvalidRecord {
                reason: "empty range",
            });
        }
        ranges.push(DeletedRange { lower, upper });
        previous = upper;
    }

    Ok(RangeSnapshot {
        mark_delete,
        ranges,
    })
}
