//! The metadata store contract.

use async_trait::async_trait;
use bytes::Bytes;
use tally_core::Version;

use crate::error::MetaResult;

/// A value together with the version it was stored under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    /// Stored bytes.
    pub data: Bytes,
    /// Version assigned by the store on the last successful write.
    pub version: Version,
}

/// Strongly consistent small-object store.
///
/// Versions start at 1 and increase by one on every successful write to a
/// path. Implementations must be `Send + Sync` for use across async tasks.
#[async_trait]
pub trait MetadataStore: Send + Sync + std::fmt::Debug {
    /// Reads the value at `path`.
    ///
    /// Returns `NotFound` if no value exists.
    async fn get(&self, path: &str) -> MetaResult<Versioned>;

    /// Writes `data` at `path` if the stored version equals `expected`.
    ///
    /// `expected = None` requires that no value exists yet. Returns the new
    /// version, or `BadVersion` if another writer got there first.
    async fn compare_and_set(
        &self,
        path: &str,
        expected: Option<Version>,
        data: Bytes,
    ) -> MetaResult<Version>;

    /// Removes the value at `path`.
    async fn delete(&self, path: &str) -> MetaResult<()>;
}

/// Validates a compare-and-set and returns the version to store.
pub(crate) fn next_version(
    path: &str,
    expected: Option<Version>,
    actual: Option<Version>,
) -> MetaResult<Version> {
    if expected != actual {
        return Err(crate::MetaError::BadVersion {
            path: path.to_string(),
            expected: expected.map(Version::get),
            actual: actual.map(Version::get),
        });
    }
    Ok(actual.map_or(Version::new(1), Version::next))
}
