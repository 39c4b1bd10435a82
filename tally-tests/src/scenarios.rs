//! Reusable test scenarios for Tally cursors.
//!
//! Fixtures bundle a cursor registry with a pair of simulated backends so a
//! test can open, crash and reopen cursors against the same durable state.

use std::sync::Arc;

use tally_core::{Limits, Position, SegmentId};
use tally_cursor::{
    CursorBackends, CursorConfig, CursorId, CursorRegistry, CursorResult, ManagedCursor,
    MetricsCollector, OpenOutcome,
};
use tally_log::{LogFaultConfig, SimulatedSegmentLog};
use tally_meta::InMemoryMetadataStore;

/// Topic every fixture cursor lives on.
pub const TOPIC: &str = "orders";

/// Returns entry `entry_id` of the given segment.
#[must_use]
pub const fn entry(segment: u64, entry_id: i64) -> Position {
    Position::new(SegmentId::new(segment), entry_id)
}

/// Returns entry `entry_id` of segment 0, where fixture messages live.
#[must_use]
pub const fn msg(entry_id: i64) -> Position {
    entry(0, entry_id)
}

/// A broker-side registry plus the durable backends its cursors use.
///
/// Clones of the backends share state, so [`Fixture::restart`] models a
/// broker restart: a fresh registry over the same log and metadata store.
#[derive(Debug, Clone)]
pub struct Fixture {
    /// Registry of the current broker instance.
    pub registry: Arc<CursorRegistry>,
    /// Simulated primary log.
    pub log: SimulatedSegmentLog,
    /// In-memory metadata store.
    pub meta: InMemoryMetadataStore,
}

impl Fixture {
    /// Creates a fixture with fault-free backends.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot register its metric families.
    pub fn new(seed: u64) -> CursorResult<Self> {
        Self::with_log_faults(seed, LogFaultConfig::none())
    }

    /// Creates a fixture whose log injects faults per `faults`.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot register its metric families.
    pub fn with_log_faults(seed: u64, faults: LogFaultConfig) -> CursorResult<Self> {
        Ok(Self {
            registry: Arc::new(CursorRegistry::new()?),
            log: SimulatedSegmentLog::with_faults(seed, faults),
            meta: InMemoryMetadataStore::new(),
        })
    }

    /// Creates a fixture whose registry applies `limits`.
    ///
    /// # Errors
    ///
    /// Returns an error if `limits` is inconsistent.
    pub fn with_limits(seed: u64, limits: Limits) -> CursorResult<Self> {
        Ok(Self {
            registry: Arc::new(CursorRegistry::with_limits(limits)?),
            log: SimulatedSegmentLog::new(seed),
            meta: InMemoryMetadataStore::new(),
        })
    }

    /// Returns a fixture over the same backends with a fresh registry under
    /// the same limits.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot register its metric families.
    pub fn restart(&self) -> CursorResult<Self> {
        Ok(Self {
            registry: Arc::new(CursorRegistry::with_limits(*self.registry.limits())?),
            log: self.log.clone(),
            meta: self.meta.clone(),
        })
    }

    /// Returns backends sharing this fixture's state.
    #[must_use]
    pub fn backends(&self) -> CursorBackends {
        CursorBackends::new(Arc::new(self.log.clone()), Arc::new(self.meta.clone()))
    }

    /// Returns a collector over this fixture's registry.
    #[must_use]
    pub fn collector(&self) -> MetricsCollector {
        MetricsCollector::new(Arc::clone(&self.registry))
    }

    /// Opens the cursor `subscription` on [`TOPIC`].
    ///
    /// # Errors
    ///
    /// Returns an error if the cursor cannot be opened.
    pub async fn open(
        &self,
        subscription: &str,
        config: CursorConfig,
    ) -> CursorResult<(ManagedCursor, OpenOutcome)> {
        let id = CursorId::new(TOPIC, subscription)?;
        ManagedCursor::open(id, self.backends(), config, &self.registry).await
    }
}

/// Cursor configs used across scenarios.
pub mod configs {
    use tally_cursor::CursorConfig;

    /// Persists only on explicit flushes or the flush timer.
    #[must_use]
    pub fn manual_flush() -> CursorConfig {
        CursorConfig {
            persist_after_acks: 1_000_000,
            ..CursorConfig::for_testing()
        }
    }

    /// Rolls over to a new segment after every `entries` writes.
    #[must_use]
    pub fn small_segments(entries: u64) -> CursorConfig {
        CursorConfig {
            max_entries_per_segment: entries,
            ..manual_flush()
        }
    }
}

/// Seeds for reproducible testing.
pub mod seeds {
    /// Seeds that have found bugs in the past.
    /// Always run these in CI.
    pub const REGRESSION_SEEDS: &[u64] = &[
        42,
        12345,
        0xDEAD_BEEF,
        999,
        7777,
        0x1337,
        0xCAFE_BABE,
        1,
        u64::MAX,
        0,
    ];
}
