//! File-backed segment log.
//!
//! Each segment is one file holding a small header followed by
//! CRC-checked entry frames.
//!
//! # Directory Structure
//!
//! Segments are stored at: `{base_path}/segment-{segment_id:016x}.log`
//!
//! A segment accepts appends only while the process that created it holds it
//! open. After a restart every existing segment is read-only, which is what
//! cursor recovery expects: it reads the newest entry and rolls to a fresh
//! segment before writing again.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tally_core::{Position, SegmentId};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::entry::{put_frame, FrameScanner, FRAME_OVERHEAD};
use crate::error::{LogError, LogResult};
use crate::log::{SegmentHandle, SegmentLog};

/// Magic bytes at the start of every segment file.
const SEGMENT_MAGIC: &[u8; 8] = b"TALLYSEG";

/// Segment file format version.
const SEGMENT_FORMAT_VERSION: u32 = 1;

/// Size of the segment file header in bytes.
const SEGMENT_HEADER_SIZE: usize = 12; // 8 + 4

// -----------------------------------------------------------------------------
// Configuration
// -----------------------------------------------------------------------------

/// Configuration for the file-backed segment log.
#[derive(Debug, Clone)]
pub struct FileLogConfig {
    /// Directory holding all segment files.
    pub base_path: PathBuf,

    /// Whether to call fsync after every append.
    ///
    /// Default: `true` for safety. Set to `false` for faster tests.
    pub sync_on_write: bool,
}

impl FileLogConfig {
    /// Creates a new configuration with the given base path.
    #[must_use]
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            sync_on_write: true,
        }
    }

    /// Creates a configuration optimized for testing (no fsync).
    #[must_use]
    pub fn for_testing(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            sync_on_write: false,
        }
    }
}

// -----------------------------------------------------------------------------
// FileSegmentLog
// -----------------------------------------------------------------------------

#[derive(Debug)]
struct SegmentWriter {
    file: tokio::fs::File,
    next_entry_id: u64,
}

/// Segment log storing one file per segment.
#[derive(Debug)]
pub struct FileSegmentLog {
    config: FileLogConfig,
    next_segment_id: AtomicU64,
    writers: Mutex<HashMap<SegmentId, SegmentWriter>>,
}

impl FileSegmentLog {
    /// Opens the log directory, creating it if missing.
    ///
    /// New segment ids continue after the highest id found on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or listed.
    ///
    /// # Panics
    ///
    /// Panics if `base_path` is empty.
    pub async fn open(config: FileLogConfig) -> LogResult<Self> {
        assert!(
            !config.base_path.as_os_str().is_empty(),
            "base_path must not be empty"
        );

        tokio::fs::create_dir_all(&config.base_path)
            .await
            .map_err(|e| LogError::io("create_base_dir", e))?;

        let mut highest = 0u64;
        let mut dir = tokio::fs::read_dir(&config.base_path)
            .await
            .map_err(|e| LogError::io("read_dir", e))?;
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| LogError::io("read_dir", e))?
        {
            if let Some(id) = parse_segment_file_name(&entry.file_name().to_string_lossy()) {
                highest = highest.max(id);
            }
        }

        debug!(
            base_path = %config.base_path.display(),
            highest_segment = highest,
            "opened file segment log"
        );

        Ok(Self {
            config,
            next_segment_id: AtomicU64::new(highest + 1),
            writers: Mutex::new(HashMap::new()),
        })
    }

    fn segment_path(&self, segment_id: SegmentId) -> PathBuf {
        self.config
            .base_path
            .join(format!("segment-{:016x}.log", segment_id.get()))
    }

    fn not_found(segment_id: SegmentId) -> LogError {
        LogError::SegmentNotFound {
            segment_id: segment_id.get(),
        }
    }

    async fn read_segment_file(&self, segment_id: SegmentId) -> LogResult<Bytes> {
        match tokio::fs::read(self.segment_path(segment_id)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Self::not_found(segment_id)),
            Err(e) => Err(LogError::io("read_segment", e)),
        }
    }
}

fn parse_segment_file_name(name: &str) -> Option<u64> {
    let hex = name.strip_prefix("segment-")?.strip_suffix(".log")?;
    u64::from_str_radix(hex, 16).ok()
}

fn segment_header() -> [u8; SEGMENT_HEADER_SIZE] {
    let mut header = [0u8; SEGMENT_HEADER_SIZE];
    header[..8].copy_from_slice(SEGMENT_MAGIC);
    header[8..].copy_from_slice(&SEGMENT_FORMAT_VERSION.to_le_bytes());
    header
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}

#[async_trait]
impl SegmentLog for FileSegmentLog {
    async fn create_segment(&self) -> LogResult<SegmentHandle> {
        let segment_id = SegmentId::new(self.next_segment_id.fetch_add(1, Ordering::SeqCst));
        let path = self.segment_path(segment_id);

        let mut file = tokio::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .await
            .map_err(|e| LogError::io("create_segment", e))?;
        file.write_all(&segment_header())
            .await
            .map_err(|e| LogError::io("write_segment_header", e))?;
        if self.config.sync_on_write {
            file.sync_all()
                .await
                .map_err(|e| LogError::io("sync_segment_header", e))?;
        }

        self.writers.lock().await.insert(
            segment_id,
            SegmentWriter {
                file,
                next_entry_id: 0,
            },
        );
        debug!(%segment_id, path = %path.display(), "created segment file");
        Ok(SegmentHandle::new(segment_id, true))
    }

    async fn open_segment(&self, segment_id: SegmentId) -> LogResult<SegmentHandle> {
        if !path_exists(&self.segment_path(segment_id)).await {
            return Err(Self::not_found(segment_id));
        }
        Ok(SegmentHandle::new(segment_id, false))
    }

    async fn append(&self, handle: &SegmentHandle, data: Bytes) -> LogResult<Position> {
        let segment_id = handle.segment_id();
        let mut writers = self.writers.lock().await;
        if !handle.is_writable() || !writers.contains_key(&segment_id) {
            drop(writers);
            if path_exists(&self.segment_path(segment_id)).await {
                return Err(LogError::SegmentClosed {
                    segment_id: segment_id.get(),
                });
            }
            return Err(Self::not_found(segment_id));
        }
        let writer = writers
            .get_mut(&segment_id)
            .ok_or_else(|| Self::not_found(segment_id))?;

        let mut buf = BytesMut::with_capacity(FRAME_OVERHEAD + data.len());
        put_frame(&mut buf, writer.next_entry_id, &data)?;

        writer
            .file
            .write_all(&buf)
            .await
            .map_err(|e| LogError::io("append", e))?;
        if self.config.sync_on_write {
            writer
                .file
                .sync_data()
                .await
                .map_err(|e| LogError::io("sync", e))?;
        }

        #[allow(clippy::cast_possible_wrap)]
        let position = Position::new(segment_id, writer.next_entry_id as i64);
        writer.next_entry_id += 1;
        Ok(position)
    }

    async fn read_last_entry(&self, handle: &SegmentHandle) -> LogResult<Bytes> {
        let segment_id = handle.segment_id();
        let mut data = self.read_segment_file(segment_id).await?;

        if data.len() < SEGMENT_HEADER_SIZE || &data[..8] != SEGMENT_MAGIC {
            return Err(LogError::InvalidFrame {
                offset: 0,
                reason: "bad segment magic",
            });
        }
        data.advance(8);
        if data.get_u32_le() != SEGMENT_FORMAT_VERSION {
            return Err(LogError::InvalidFrame {
                offset: 8,
                reason: "unsupported segment version",
            });
        }

        let mut frames = FrameScanner::new(data, SEGMENT_HEADER_SIZE as u64);
        let mut last = None;
        loop {
            match frames.next_payload() {
                Ok(Some(payload)) => last = Some(payload),
                Ok(None) => break,
                Err(e) if e.is_recoverable() => {
                    // Torn tail from a crash mid-append.
                    warn!(%segment_id, offset = frames.offset(), error = %e, "ignoring truncated tail entry");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        last.ok_or(LogError::EmptySegment {
            segment_id: segment_id.get(),
        })
    }

    async fn close_segment(&self, handle: SegmentHandle) -> LogResult<()> {
        let writer = self.writers.lock().await.remove(&handle.segment_id());
        if let Some(writer) = writer {
            writer
                .file
                .sync_all()
                .await
                .map_err(|e| LogError::io("close_segment", e))?;
        }
        Ok(())
    }

    async fn delete_segment(&self, segment_id: SegmentId) -> LogResult<()> {
        self.writers.lock().await.remove(&segment_id);
        match tokio::fs::remove_file(self.segment_path(segment_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Self::not_found(segment_id)),
            Err(e) => Err(LogError::io("delete_segment", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_log(dir: &Path) -> FileSegmentLog {
        FileSegmentLog::open(FileLogConfig::for_testing(dir))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_append_and_read_last() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path()).await;

        let handle = log.create_segment().await.unwrap();
        let p0 = log.append(&handle, Bytes::from("first")).await.unwrap();
        let p1 = log.append(&handle, Bytes::from("second")).await.unwrap();
        assert_eq!(p0.entry_id(), 0);
        assert_eq!(p1.entry_id(), 1);

        let last = log.read_last_entry(&handle).await.unwrap();
        assert_eq!(last, Bytes::from("second"));
    }

    #[tokio::test]
    async fn test_segments_survive_reopen_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let segment_id = {
            let log = open_log(dir.path()).await;
            let handle = log.create_segment().await.unwrap();
            log.append(&handle, Bytes::from("state")).await.unwrap();
            let id = handle.segment_id();
            log.close_segment(handle).await.unwrap();
            id
        };

        let log = open_log(dir.path()).await;
        let handle = log.open_segment(segment_id).await.unwrap();
        assert_eq!(log.read_last_entry(&handle).await.unwrap(), Bytes::from("state"));

        let err = log.append(&handle, Bytes::from("more")).await.unwrap_err();
        assert!(err.is_fatal());

        let fresh = log.create_segment().await.unwrap();
        assert!(fresh.segment_id() > segment_id);
    }

    #[tokio::test]
    async fn test_torn_tail_returns_previous_entry() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path()).await;
        let handle = log.create_segment().await.unwrap();
        log.append(&handle, Bytes::from("complete")).await.unwrap();
        log.append(&handle, Bytes::from("torn-write")).await.unwrap();

        let path = log.segment_path(handle.segment_id());
        let mut data = std::fs::read(&path).unwrap();
        data.truncate(data.len() - 3);
        std::fs::write(&path, data).unwrap();

        assert_eq!(
            log.read_last_entry(&handle).await.unwrap(),
            Bytes::from("complete")
        );
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path()).await;
        let handle = log.create_segment().await.unwrap();
        log.append(&handle, Bytes::from("payload")).await.unwrap();

        let path = log.segment_path(handle.segment_id());
        let mut data = std::fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        std::fs::write(&path, data).unwrap();

        let err = log.read_last_entry(&handle).await.unwrap_err();
        assert!(err.is_corruption());
    }

    #[tokio::test]
    async fn test_missing_and_empty_segments() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path()).await;

        assert!(matches!(
            log.open_segment(SegmentId::new(99)).await,
            Err(LogError::SegmentNotFound { .. })
        ));

        let handle = log.create_segment().await.unwrap();
        assert!(matches!(
            log.read_last_entry(&handle).await,
            Err(LogError::EmptySegment { .. })
        ));

        log.delete_segment(handle.segment_id()).await.unwrap();
        assert!(log.delete_segment(handle.segment_id()).await.is_err());
    }

    #[test]
    fn test_parse_segment_file_name() {
        assert_eq!(parse_segment_file_name("segment-000000000000002a.log"), Some(42));
        assert_eq!(parse_segment_file_name("segment-xyz.log"), None);
        assert_eq!(parse_segment_file_name("other.txt"), None);
    }
}
