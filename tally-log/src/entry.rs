//! Entry frames of file-backed segments.
//!
//! ```text
//! length u32 | entry id u64 | payload | crc32 u32
//! ```
//!
//! The CRC covers the entry id and the payload. Entry ids are dense from 0
//! within a segment, so a frame out of sequence is treated as corruption.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{LogError, LogResult};
use crate::limits::ENTRY_PAYLOAD_SIZE_BYTES_MAX;

/// Bytes a frame adds around its payload.
pub(crate) const FRAME_OVERHEAD: usize = 16; // 4 + 8 + 4

/// Length and entry id, the part read before the payload.
const FRAME_PREFIX: usize = 12;

fn checksum(entry_id: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&entry_id.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Appends the frame of entry `entry_id` to `buf`.
///
/// # Errors
/// Returns `EntryTooLarge` if the payload exceeds the entry size limit.
pub(crate) fn put_frame(buf: &mut BytesMut, entry_id: u64, payload: &[u8]) -> LogResult<()> {
    let length = u32::try_from(payload.len())
        .ok()
        .filter(|length| *length <= ENTRY_PAYLOAD_SIZE_BYTES_MAX)
        .ok_or(LogError::EntryTooLarge {
            size: payload.len() as u64,
            max: ENTRY_PAYLOAD_SIZE_BYTES_MAX,
        })?;

    buf.reserve(FRAME_OVERHEAD + payload.len());
    buf.put_u32_le(length);
    buf.put_u64_le(entry_id);
    buf.put_slice(payload);
    buf.put_u32_le(checksum(entry_id, payload));
    Ok(())
}

/// Reads the frames of one segment body in order.
#[derive(Debug)]
pub(crate) struct FrameScanner {
    data: Bytes,
    /// File offset of the next frame, for error reports.
    offset: u64,
    next_entry_id: u64,
}

impl FrameScanner {
    /// Scans `data`, which starts at file offset `offset`.
    pub(crate) const fn new(data: Bytes, offset: u64) -> Self {
        Self {
            data,
            offset,
            next_entry_id: 0,
        }
    }

    /// File offset of the next unread frame.
    pub(crate) const fn offset(&self) -> u64 {
        self.offset
    }

    /// Returns the next payload, or `None` once the body is consumed.
    ///
    /// # Errors
    /// `TruncatedEntry` for a torn tail; `ChecksumMismatch` or
    /// `InvalidFrame` for a damaged frame.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn next_payload(&mut self) -> LogResult<Option<Bytes>> {
        let remaining = self.data.remaining();
        if remaining == 0 {
            return Ok(None);
        }
        if remaining < FRAME_PREFIX {
            return Err(LogError::TruncatedEntry {
                offset: self.offset,
                expected: FRAME_OVERHEAD as u32,
                found: remaining as u32,
            });
        }

        let length = u32::from_le_bytes([self.data[0], self.data[1], self.data[2], self.data[3]]);
        if length > ENTRY_PAYLOAD_SIZE_BYTES_MAX {
            return Err(LogError::InvalidFrame {
                offset: self.offset,
                reason: "length exceeds maximum",
            });
        }
        let total = FRAME_OVERHEAD + length as usize;
        if remaining < total {
            return Err(LogError::TruncatedEntry {
                offset: self.offset,
                expected: total as u32,
                found: remaining as u32,
            });
        }

        let mut frame = self.data.split_to(total);
        frame.advance(4);
        let entry_id = frame.get_u64_le();
        let payload = frame.split_to(length as usize);
        let stored = frame.get_u32_le();

        let computed = checksum(entry_id, &payload);
        if stored != computed {
            return Err(LogError::ChecksumMismatch {
                offset: self.offset,
                expected: stored,
                actual: computed,
            });
        }
        if entry_id != self.next_entry_id {
            return Err(LogError::InvalidFrame {
                offset: self.offset,
                reason: "entry id out of sequence",
            });
        }

        self.offset += total as u64;
        self.next_entry_id += 1;
        Ok(Some(payload))
    }
}
