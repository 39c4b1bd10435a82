//! In-memory metadata store with deterministic fault injection.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use tally_core::Version;
use tracing::debug;

use crate::error::{MetaError, MetaResult};
use crate::store::{next_version, MetadataStore, Versioned};

// -----------------------------------------------------------------------------
// Fault configuration
// -----------------------------------------------------------------------------

/// Configuration for fault injection in the in-memory metadata store.
///
/// Used for deterministic simulation testing of cursor fallback paths.
#[derive(Debug, Clone, Default)]
pub struct MetaFaultConfig {
    /// Probability of get failing with connection loss. Range: 0.0 - 1.0.
    pub get_fail_rate: f64,
    /// Probability of compare-and-set failing with connection loss. Range: 0.0 - 1.0.
    pub set_fail_rate: f64,
    /// If true, every operation fails with connection loss.
    pub unavailable: bool,
    /// Number of upcoming writes that fail with connection loss.
    pub force_connection_loss: u32,
    /// If true, a concurrent writer bumps the version before the next write.
    pub force_bad_version: bool,
}

impl MetaFaultConfig {
    /// Creates a fault config with no faults.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Creates a fault config that simulates a flaky metadata store.
    #[must_use]
    pub fn flaky() -> Self {
        Self {
            get_fail_rate: 0.02,
            set_fail_rate: 0.05,
            ..Self::default()
        }
    }

    /// Sets the get failure rate.
    #[must_use]
    pub const fn with_get_fail_rate(mut self, rate: f64) -> Self {
        self.get_fail_rate = rate;
        self
    }

    /// Sets the compare-and-set failure rate.
    #[must_use]
    pub const fn with_set_fail_rate(mut self, rate: f64) -> Self {
        self.set_fail_rate = rate;
        self
    }

    /// Makes the whole store unavailable.
    #[must_use]
    pub const fn with_unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    /// Forces the next `count` writes to lose their connection.
    #[must_use]
    pub const fn with_force_connection_loss(mut self, count: u32) -> Self {
        self.force_connection_loss = count;
        self
    }

    /// Forces the next write to race a concurrent writer.
    #[must_use]
    pub const fn with_force_bad_version(mut self) -> Self {
        self.force_bad_version = true;
        self
    }
}

/// Operation counts for inspection in tests.
#[derive(Debug, Default, Clone)]
pub struct MetaStats {
    /// Successful reads.
    pub gets: u64,
    /// Successful writes.
    pub sets: u64,
    /// Writes rejected with `BadVersion`.
    pub bad_versions: u64,
    /// Operations failed with connection loss.
    pub connection_losses: u64,
}

// -----------------------------------------------------------------------------
// InMemoryMetadataStore
// -----------------------------------------------------------------------------

/// In-memory metadata store for testing.
///
/// All data is kept in memory and lost when the store is dropped.
/// Clones share the same underlying data (via `Arc`).
#[derive(Debug, Clone)]
pub struct InMemoryMetadataStore {
    values: Arc<Mutex<BTreeMap<String, Versioned>>>,
    fault_config: Arc<Mutex<MetaFaultConfig>>,
    seed: u64,
    counter: Arc<AtomicU64>,
    stats: Arc<Mutex<MetaStats>>,
}

impl Default for InMemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::missing_panics_doc, clippy::significant_drop_tightening)]
impl InMemoryMetadataStore {
    /// Creates a new in-memory metadata store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_faults(0, MetaFaultConfig::default())
    }

    /// Creates a new metadata store with fault injection enabled.
    #[must_use]
    pub fn with_faults(seed: u64, config: MetaFaultConfig) -> Self {
        Self {
            values: Arc::new(Mutex::new(BTreeMap::new())),
            fault_config: Arc::new(Mutex::new(config)),
            seed,
            counter: Arc::new(AtomicU64::new(0)),
            stats: Arc::new(Mutex::new(MetaStats::default())),
        }
    }

    /// Returns a reference to the fault configuration for modification.
    pub fn fault_config(&self) -> MutexGuard<'_, MetaFaultConfig> {
        self.fault_config.lock().expect("fault config lock poisoned")
    }

    /// Makes the whole store available or unavailable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.fault_config().unavailable = unavailable;
    }

    /// Returns a copy of the operation counts.
    #[must_use]
    pub fn stats(&self) -> MetaStats {
        self.stats.lock().expect("stats lock poisoned").clone()
    }

    /// Reads a value bypassing fault injection.
    #[must_use]
    pub fn raw(&self, path: &str) -> Option<Versioned> {
        self.values.lock().expect("values lock poisoned").get(path).cloned()
    }

    /// Overwrites a value bypassing versioning and faults (for corruption tests).
    pub fn put_raw(&self, path: &str, data: Bytes) {
        let mut values = self.values.lock().expect("values lock poisoned");
        let version = values
            .get(path)
            .map_or(Version::new(1), |v| v.version.next());
        values.insert(path.to_string(), Versioned { data, version });
    }

    /// Returns all stored paths in order.
    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        self.values
            .lock()
            .expect("values lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Deterministic RNG based on seed and counter.
    fn should_inject_fault(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let hash = self.seed.wrapping_add(counter).wrapping_mul(0x517c_c1b7_2722_0a95);
        #[allow(clippy::cast_precision_loss)]
        let normalized = (hash as f64) / (u64::MAX as f64);
        normalized < rate
    }

    fn connection_loss(&self, operation: &'static str) -> MetaError {
        debug!(operation, "Injecting metadata store connection loss");
        self.stats.lock().expect("stats lock poisoned").connection_losses += 1;
        MetaError::ConnectionLoss { operation }
    }
}

#[async_trait]
#[allow(clippy::significant_drop_tightening)]
impl MetadataStore for InMemoryMetadataStore {
    async fn get(&self, path: &str) -> MetaResult<Versioned> {
        let (unavailable, rate) = {
            let config = self.fault_config();
            (config.unavailable, config.get_fail_rate)
        };
        if unavailable || self.should_inject_fault(rate) {
            return Err(self.connection_loss("get"));
        }

        let value = self
            .values
            .lock()
            .expect("values lock poisoned")
            .get(path)
            .cloned()
            .ok_or_else(|| MetaError::NotFound {
                path: path.to_string(),
            })?;
        self.stats.lock().expect("stats lock poisoned").gets += 1;
        Ok(value)
    }

    async fn compare_and_set(
        &self,
        path: &str,
        expected: Option<Version>,
        data: Bytes,
    ) -> MetaResult<Version> {
        let (unavailable, forced_loss, forced_race, rate) = {
            let mut config = self.fault_config();
            let forced_loss = config.force_connection_loss > 0;
            if forced_loss {
                config.force_connection_loss -= 1;
            }
            (
                config.unavailable,
                forced_loss,
                std::mem::take(&mut config.force_bad_version),
                config.set_fail_rate,
            )
        };
        if unavailable || forced_loss || self.should_inject_fault(rate) {
            return Err(self.connection_loss("compare_and_set"));
        }

        let mut values = self.values.lock().expect("values lock poisoned");
        if forced_race {
            // A concurrent writer stores the same bytes under a newer version.
            if let Some(current) = values.get_mut(path) {
                current.version = current.version.next();
                debug!(path, version = %current.version, "Injecting concurrent metadata write");
            }
        }

        let actual = values.get(path).map(|v| v.version);
        let version = match next_version(path, expected, actual) {
            Ok(version) => version,
            Err(e) => {
                drop(values);
                debug!(path, ?expected, ?actual, "Metadata version conflict");
                self.stats.lock().expect("stats lock poisoned").bad_versions += 1;
                return Err(e);
            }
        };
        values.insert(path.to_string(), Versioned { data, version });
        drop(values);

        self.stats.lock().expect("stats lock poisoned").sets += 1;
        Ok(version)
    }

    async fn delete(&self, path: &str) -> MetaResult<()> {
        if self.fault_config().unavailable {
            return Err(self.connection_loss("delete"));
        }
        self.values
            .lock()
            .expect("values lock poisoned")
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| MetaError::NotFound {
                path: path.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATH: &str = "/cursors/orders/billing";

    #[tokio::test]
    async fn test_create_then_update() {
        let store = InMemoryMetadataStore::new();

        let v1 = store
            .compare_and_set(PATH, None, Bytes::from("a"))
            .await
            .unwrap();
        assert_eq!(v1, Version::new(1));

        let v2 = store
            .compare_and_set(PATH, Some(v1), Bytes::from("b"))
            .await
            .unwrap();
        assert_eq!(v2, Version::new(2));

        let value = store.get(PATH).await.unwrap();
        assert_eq!(value.data, Bytes::from("b"));
        assert_eq!(value.version, v2);
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let store = InMemoryMetadataStore::new();
        let v1 = store
            .compare_and_set(PATH, None, Bytes::from("a"))
            .await
            .unwrap();
        store
            .compare_and_set(PATH, Some(v1), Bytes::from("b"))
            .await
            .unwrap();

        let err = store
            .compare_and_set(PATH, Some(v1), Bytes::from("c"))
            .await
            .unwrap_err();
        assert!(err.is_bad_version());

        let err = store
            .compare_and_set(PATH, None, Bytes::from("c"))
            .await
            .unwrap_err();
        assert!(err.is_bad_version());
        assert_eq!(store.stats().bad_versions, 2);
    }

    #[tokio::test]
    async fn test_missing_value() {
        let store = InMemoryMetadataStore::new();
        assert!(matches!(
            store.get(PATH).await,
            Err(MetaError::NotFound { .. })
        ));
        assert!(store.delete(PATH).await.is_err());
    }

    #[tokio::test]
    async fn test_forced_connection_loss_counts_down() {
        let store =
            InMemoryMetadataStore::with_faults(1, MetaFaultConfig::none().with_force_connection_loss(2));

        for _ in 0..2 {
            let err = store
                .compare_and_set(PATH, None, Bytes::from("a"))
                .await
                .unwrap_err();
            assert!(err.is_retryable());
        }
        assert!(store
            .compare_and_set(PATH, None, Bytes::from("a"))
            .await
            .is_ok());
        assert_eq!(store.stats().connection_losses, 2);
    }

    #[tokio::test]
    async fn test_forced_bad_version_simulates_concurrent_writer() {
        let store = InMemoryMetadataStore::new();
        let v1 = store
            .compare_and_set(PATH, None, Bytes::from("a"))
            .await
            .unwrap();
        store.fault_config().force_bad_version = true;

        let err = store
            .compare_and_set(PATH, Some(v1), Bytes::from("b"))
            .await
            .unwrap_err();
        assert!(err.is_bad_version());

        // Re-read and retry succeeds.
        let current = store.get(PATH).await.unwrap();
        assert_eq!(current.data, Bytes::from("a"));
        assert!(store
            .compare_and_set(PATH, Some(current.version), Bytes::from("b"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_clone_shares_state() {
        let store = InMemoryMetadataStore::new();
        let store2 = store.clone();

        store
            .compare_and_set(PATH, None, Bytes::from("a"))
            .await
            .unwrap();
        assert!(store2.get(PATH).await.is_ok());

        store2.delete(PATH).await.unwrap();
        assert!(store.raw(PATH).is_none());
        assert!(store.paths().is_empty());
    }
}
