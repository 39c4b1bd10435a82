//! Persisted cursor snapshot format.
//!
//! One schema is shared by the primary segment log and the metadata store.
//! The snapshot record is:
//!
//! ```text
//! +---------+-------------+----------+---------------------+---------+------------+-------+
//! | version | mark-delete | #ranges  | ranges              | #props  | properties | CRC32 |
//! | u32     | u64 + i64   | u32      | 4 x 64-bit per range| u32     | len-prefixed| u32  |
//! +---------+-------------+----------+---------------------+---------+------------+-------+
//! ```
//!
//! Version 2 replaces the mark-delete, count and fixed ranges with a
//! length-prefixed compact range section (see [`crate::RangeTracker`]).
//! The CRC covers every byte before it. All integers are little-endian.
//!
//! Each physical write wraps the record in an [`Envelope`] carrying the write
//! sequence number and the primary segment pointers.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tally_core::{Limits, Position, SegmentId, WriteSeq};

use crate::config::RecordFormat;
use crate::error::{CursorError, CursorResult};
use crate::range::{decode_ranges, encode_ranges, DeletedRange, RangeSnapshot};

/// Fixed-width record format.
pub const FORMAT_VERSION_FIXED: u32 = 1;

/// Compact record format.
pub const FORMAT_VERSION_COMPACT: u32 = 2;

/// Magic bytes at the start of every envelope.
pub const ENVELOPE_MAGIC: &[u8; 4] = b"TCUR";

/// Size of the envelope header in bytes.
pub const ENVELOPE_HEADER_SIZE: usize = 32; // 4 + 8 + 8 + 8 + 4

const CRC_SIZE: usize = 4;

// -----------------------------------------------------------------------------
// CursorSnapshot
// -----------------------------------------------------------------------------

/// Everything a flush persists about one cursor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CursorSnapshot {
    /// Mark-delete position and out-of-order ranges.
    pub ranges: RangeSnapshot,
    /// Arbitrary string properties attached to the cursor.
    pub properties: BTreeMap<String, String>,
}

impl CursorSnapshot {
    /// Returns the persisted mark-delete position.
    #[must_use]
    pub const fn mark_delete(&self) -> Position {
        self.ranges.mark_delete
    }

    /// Encodes the snapshot as a record.
    ///
    /// At most `max_ranges` ranges are written; the rest are dropped.
    #[must_use]
    pub fn encode(&self, format: RecordFormat, max_ranges: u32) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.ranges.ranges.len() * 32);

        let limit = (max_ranges as usize).min(self.ranges.ranges.len());
        let kept = &self.ranges.ranges[..limit];

        match format {
            RecordFormat::Fixed => {
                buf.put_u32_le(FORMAT_VERSION_FIXED);
                put_position(&mut buf, self.ranges.mark_delete);
                #[allow(clippy::cast_possible_truncation)]
                buf.put_u32_le(kept.len() as u32);
                for range in kept {
                    put_position(&mut buf, range.lower());
                    put_position(&mut buf, range.upper());
                }
            }
            RecordFormat::Compact => {
                buf.put_u32_le(FORMAT_VERSION_COMPACT);
                let compact = encode_ranges(&RangeSnapshot {
                    mark_delete: self.ranges.mark_delete,
                    ranges: kept.to_vec(),
                });
                #[allow(clippy::cast_possible_truncation)]
                buf.put_u32_le(compact.len() as u32);
                buf.put_slice(&compact);
            }
        }

        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32_le(self.properties.len() as u32);
        for (key, value) in &self.properties {
            #[allow(clippy::cast_possible_truncation)]
            buf.put_u32_le(key.len() as u32);
            buf.put_slice(key.as_bytes());
            #[allow(clippy::cast_possible_truncation)]
            buf.put_u32_le(value.len() as u32);
            buf.put_slice(value.as_bytes());
        }

        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf.freeze()
    }

    /// Decodes and validates a record.
    ///
    /// # Errors
    ///
    /// Returns `ChecksumMismatch`, `InvalidRecord` or `UnsupportedFormat`
    /// for corrupt input, and `Limit` if the record exceeds `limits`.
    pub fn decode(data: &[u8], limits: &Limits) -> CursorResult<Self> {
        Limits::check(
            "record_bytes",
            u64::from(limits.max_record_bytes),
            data.len() as u64,
        )?;
        if data.len() < 4 + CRC_SIZE {
            return Err(CursorError::InvalidRecord {
                reason: "record too short",
            });
        }

        let (body, mut trailer) = data.split_at(data.len() - CRC_SIZE);
        let expected = trailer.get_u32_le();
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(CursorError::ChecksumMismatch { expected, actual });
        }

        let mut buf = body;
        let version = buf.get_u32_le();
        let ranges = match version {
            FORMAT_VERSION_FIXED => decode_fixed_ranges(&mut buf, limits)?,
            FORMAT_VERSION_COMPACT => {
                let len = get_u32(&mut buf)? as usize;
                let mut section = take(&mut buf, len)?;
                let ranges = decode_ranges(&mut section, limits)?;
                if section.has_remaining() {
                    return Err(CursorError::InvalidRecord {
                        reason: "trailing bytes in range section",
                    });
                }
                ranges
            }
            other => return Err(CursorError::UnsupportedFormat { version: other }),
        };
        ranges.validate()?;

        let count = get_u32(&mut buf)?;
        Limits::check("properties", u64::from(limits.max_properties), u64::from(count))?;
        let mut properties = BTreeMap::new();
        for _ in 0..count {
            let key = get_string(&mut buf, limits.max_property_key_bytes, "property_key_bytes")?;
            let value =
                get_string(&mut buf, limits.max_property_value_bytes, "property_value_bytes")?;
            properties.insert(key, value);
        }

        if buf.has_remaining() {
            return Err(CursorError::InvalidRecord {
                reason: "trailing bytes after properties",
            });
        }

        Ok(Self { ranges, properties })
    }
}

fn put_position(buf: &mut BytesMut, position: Position) {
    buf.put_u64_le(position.segment_id().get());
    buf.put_i64_le(position.entry_id());
}

fn get_u32(buf: &mut &[u8]) -> CursorResult<u32> {
    if buf.remaining() < 4 {
        return Err(CursorError::InvalidRecord {
            reason: "truncated field",
        });
    }
    Ok(buf.get_u32_le())
}

fn get_position(buf: &mut &[u8]) -> CursorResult<Position> {
    if buf.remaining() < 16 {
        return Err(CursorError::InvalidRecord {
            reason: "truncated position",
        });
    }
    let segment = SegmentId::new(buf.get_u64_le());
    let entry = buf.get_i64_le();
    if entry < -1 {
        return Err(CursorError::InvalidRecord {
            reason: "entry id below -1",
        });
    }
    Ok(Position::new(segment, entry))
}

fn take<'a>(buf: &mut &'a [u8], len: usize) -> CursorResult<&'a [u8]> {
    if buf.remaining() < len {
        return Err(CursorError::InvalidRecord {
            reason: "truncated section",
        });
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

fn get_string(buf: &mut &[u8], max: u32, limit: &'static str) -> CursorResult<String> {
    let len = get_u32(buf)?;
    Limits::check(limit, u64::from(max), u64::from(len))?;
    let bytes = take(buf, len as usize)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| CursorError::InvalidRecord {
        reason: "property is not UTF-8",
    })
}

fn decode_fixed_ranges(buf: &mut &[u8], limits: &Limits) -> CursorResult<RangeSnapshot> {
    let mark_delete = get_position(buf)?;
    let count = get_u32(buf)?;
    Limits::check(
        "ranges_per_record",
        u64::from(limits.max_ranges_per_record),
        u64::from(count),
    )?;
    if u64::from(count) * 32 > buf.remaining() as u64 {
        return Err(CursorError::InvalidRecord {
            reason: "range count exceeds record size",
        });
    }

    let mut ranges = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let lower = get_position(buf)?;
        let upper = get_position(buf)?;
        if lower >= upper {
            return Err(CursorError::InvalidRecord {
                reason: "empty range",
            });
        }
        ranges.push(DeletedRange::new(lower, upper));
    }
    Ok(RangeSnapshot {
        mark_delete,
        ranges,
    })
}

// -----------------------------------------------------------------------------
// Envelope
// -----------------------------------------------------------------------------

/// Framing around every physical snapshot write.
///
/// ```text
/// +---------+----------+------------+---------------------+-------------+---------+
/// | "TCUR"  | sequence | segment id | previous segment id | payload len | payload |
/// | 4 bytes | u64      | u64        | u64                 | u32         | N bytes |
/// +---------+----------+------------+---------------------+-------------+---------+
/// ```
///
/// In the primary log `segment_id` is the segment holding the entry. In the
/// metadata store it names the current primary segment, which makes the
/// stored value the cursor's manifest. Segment id 0 means "none".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Write sequence number of the snapshot.
    pub seq: WriteSeq,
    /// Current primary segment.
    pub segment_id: SegmentId,
    /// Primary segment before the last rollover.
    pub previous_segment_id: SegmentId,
    /// Encoded [`CursorSnapshot`].
    pub payload: Bytes,
}

impl Envelope {
    /// Returns the encoded size in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        ENVELOPE_HEADER_SIZE + self.payload.len()
    }

    /// Encodes the envelope.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(ENVELOPE_MAGIC);
        buf.put_u64_le(self.seq.get());
        buf.put_u64_le(self.segment_id.get());
        buf.put_u64_le(self.previous_segment_id.get());
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decodes an envelope. The payload is not validated.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRecord` if the magic or length is wrong.
    pub fn decode(mut data: Bytes) -> CursorResult<Self> {
        if data.len() < ENVELOPE_HEADER_SIZE || &data[..4] != ENVELOPE_MAGIC {
            return Err(CursorError::InvalidRecord {
                reason: "bad envelope magic",
            });
        }
        data.advance(4);
        let seq = WriteSeq::new(data.get_u64_le());
        let segment_id = SegmentId::new(data.get_u64_le());
        let previous_segment_id = SegmentId::new(data.get_u64_le());
        let len = data.get_u32_le() as usize;
        if data.len() != len {
            return Err(CursorError::InvalidRecord {
                reason: "envelope payload length mismatch",
            });
        }
        Ok(Self {
            seq,
            segment_id,
            previous_segment_id,
            payload: data,
        })
    }

    /// Decodes the payload as a snapshot.
    ///
    /// # Errors
    ///
    /// See [`CursorSnapshot::decode`].
    pub fn snapshot(&self, limits: &Limits) -> CursorResult<CursorSnapshot> {
        CursorSnapshot::decode(&self.payload, limits)
    }
}
