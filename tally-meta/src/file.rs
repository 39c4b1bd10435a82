//! Filesystem-based metadata store for local runs.
//!
//! Each path is stored as one file: an 8-byte little-endian version followed
//! by the value bytes. Writes go to a temporary file that is renamed into
//! place, so a crash never leaves a half-written value behind.
//!
//! # Directory Structure
//!
//! The value at `/cursors/{topic}/{subscription}` is stored at
//! `{base_path}/cursors/{topic}/{subscription}.meta`.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use tally_core::Version;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{MetaError, MetaResult};
use crate::store::{next_version, MetadataStore, Versioned};

/// Size of the version prefix in bytes.
const VERSION_PREFIX_SIZE: usize = 8;

/// Metadata store keeping one file per path.
#[derive(Debug)]
pub struct FileMetadataStore {
    base_path: PathBuf,
    /// Serializes compare-and-set against concurrent writers in this process.
    write_lock: Mutex<()>,
}

impl FileMetadataStore {
    /// Opens the store rooted at `base_path`, creating the directory if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn open(base_path: impl Into<PathBuf>) -> MetaResult<Self> {
        let base_path = base_path.into();
        tokio::fs::create_dir_all(&base_path)
            .await
            .map_err(|e| MetaError::io("create_base_dir", e))?;
        info!(base_path = %base_path.display(), "Opened file metadata store");
        Ok(Self {
            base_path,
            write_lock: Mutex::new(()),
        })
    }

    fn file_path(&self, path: &str) -> MetaResult<PathBuf> {
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let Some((last, parents)) = components.split_last() else {
            return Err(MetaError::io("resolve_path", "empty path"));
        };
        if components.iter().any(|c| *c == "." || *c == "..") {
            return Err(MetaError::io("resolve_path", format!("invalid path '{path}'")));
        }

        let mut file_path = self.base_path.clone();
        file_path.extend(parents);
        file_path.push(format!("{last}.meta"));
        Ok(file_path)
    }

    async fn read(&self, path: &str) -> MetaResult<Option<Versioned>> {
        let file_path = self.file_path(path)?;
        let raw = match tokio::fs::read(&file_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(MetaError::io("read", e)),
        };
        if raw.len() < VERSION_PREFIX_SIZE {
            warn!(path, bytes = raw.len(), "Truncated metadata value");
            return Err(MetaError::io("read", format!("truncated value at '{path}'")));
        }
        let mut prefix = [0u8; VERSION_PREFIX_SIZE];
        prefix.copy_from_slice(&raw[..VERSION_PREFIX_SIZE]);
        Ok(Some(Versioned {
            version: Version::new(u64::from_le_bytes(prefix)),
            data: Bytes::copy_from_slice(&raw[VERSION_PREFIX_SIZE..]),
        }))
    }
}

#[async_trait]
impl MetadataStore for FileMetadataStore {
    async fn get(&self, path: &str) -> MetaResult<Versioned> {
        self.read(path).await?.ok_or_else(|| MetaError::NotFound {
            path: path.to_string(),
        })
    }

    async fn compare_and_set(
        &self,
        path: &str,
        expected: Option<Version>,
        data: Bytes,
    ) -> MetaResult<Version> {
        let _guard = self.write_lock.lock().await;

        let actual = self.read(path).await?.map(|v| v.version);
        let version = next_version(path, expected, actual).map_err(|e| {
            debug!(path, ?expected, ?actual, "Metadata version conflict");
            e
        })?;

        let file_path = self.file_path(path)?;
        if let Some(parent) = file_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| MetaError::io("create_parent_dirs", e))?;
        }

        let tmp_path = file_path.with_extension("meta.tmp");
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| MetaError::io("create_tmp", e))?;
        file.write_all(&version.get().to_le_bytes())
            .await
            .map_err(|e| MetaError::io("write", e))?;
        file.write_all(&data)
            .await
            .map_err(|e| MetaError::io("write", e))?;
        file.sync_all()
            .await
            .map_err(|e| MetaError::io("sync", e))?;
        drop(file);

        tokio::fs::rename(&tmp_path, &file_path)
            .await
            .map_err(|e| MetaError::io("rename", e))?;
        debug!(path, %version, bytes = data.len(), "Metadata value written");
        Ok(version)
    }

    async fn delete(&self, path: &str) -> MetaResult<()> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.file_path(path)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(MetaError::NotFound {
                path: path.to_string(),
            }),
            Err(e) => Err(MetaError::io("delete", e)),
        }
    }
}
