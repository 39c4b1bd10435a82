//! The managed cursor: acknowledgment API over a tracker and its persistence.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tally_core::{Limits, Position};
use tally_log::SegmentLog;
use tally_meta::MetadataStore;
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use crate::config::CursorConfig;
use crate::error::{CursorError, CursorResult};
use crate::metrics::{CounterSet, StatsSlot};
use crate::persist::{FlushState, LiveState, PersistenceManager};
use crate::range::RangeTracker;
use crate::recovery::{OpenOutcome, RecoveryLoader};
use crate::registry::CursorRegistry;

/// Maximum length of a topic or subscription name in bytes.
pub const CURSOR_NAME_BYTES_MAX: usize = 255;

// -----------------------------------------------------------------------------
// CursorId
// -----------------------------------------------------------------------------

/// Topic and subscription a cursor belongs to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CursorId {
    topic: String,
    subscription: String,
}

impl CursorId {
    /// Creates a cursor id.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCursorId` if either name is empty, too long, contains
    /// `/` or is a relative path component.
    pub fn new(topic: impl Into<String>, subscription: impl Into<String>) -> CursorResult<Self> {
        let topic = topic.into();
        let subscription = subscription.into();
        validate_name(&topic)?;
        validate_name(&subscription)?;
        Ok(Self {
            topic,
            subscription,
        })
    }

    /// Returns the topic name.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns the subscription name.
    #[must_use]
    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    /// Returns the metadata store path of the cursor's manifest.
    #[must_use]
    pub fn metadata_path(&self) -> String {
        format!("/cursors/{}/{}", self.topic, self.subscription)
    }
}

fn validate_name(name: &str) -> CursorResult<()> {
    let reason = if name.is_empty() {
        "name is empty"
    } else if name.len() > CURSOR_NAME_BYTES_MAX {
        "name is too long"
    } else if name.contains('/') {
        "name contains '/'"
    } else if name == "." || name == ".." {
        "name is a relative path component"
    } else {
        return Ok(());
    };
    Err(CursorError::InvalidCursorId { reason })
}

impl fmt::Display for CursorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.subscription)
    }
}

/// The two durable backends a cursor persists to.
#[derive(Debug, Clone)]
pub struct CursorBackends {
    /// Primary append-only log.
    pub log: Arc<dyn SegmentLog>,
    /// Fallback store, also holding the cursor's manifest.
    pub metadata: Arc<dyn MetadataStore>,
}

impl CursorBackends {
    /// Bundles the two backends.
    #[must_use]
    pub fn new(log: Arc<dyn SegmentLog>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self { log, metadata }
    }
}

// -----------------------------------------------------------------------------
// ManagedCursor
// -----------------------------------------------------------------------------

/// A subscription's durable acknowledgment state.
///
/// Acknowledgment calls are synchronous and infallible: they mutate memory,
/// then at most schedule a flush on the runtime the cursor was opened on.
/// Persistence failures are visible only through [`Self::snapshot_metrics`]
/// and logs.
///
/// Dropping a cursor without [`Self::close`] unregisters it and schedules a
/// final flush in the background.
#[derive(Debug)]
pub struct ManagedCursor {
    id: CursorId,
    live: Arc<LiveState>,
    manager: Arc<PersistenceManager>,
    registry: Arc<CursorRegistry>,
}

impl ManagedCursor {
    /// Opens a cursor, recovering its state from the backends.
    ///
    /// A cursor with no valid persisted state starts at
    /// [`Position::default()`], before the first entry of segment 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid, the cursor is already open
    /// in `registry`, or the metadata store is unreachable.
    pub async fn open(
        id: CursorId,
        backends: CursorBackends,
        config: CursorConfig,
        registry: &Arc<CursorRegistry>,
    ) -> CursorResult<(Self, OpenOutcome)> {
        Self::open_at(id, Position::default(), backends, config, registry).await
    }

    /// Opens a cursor; a newly created cursor starts at `start`.
    ///
    /// # Errors
    ///
    /// See [`Self::open`].
    pub async fn open_at(
        id: CursorId,
        start: Position,
        backends: CursorBackends,
        config: CursorConfig,
        registry: &Arc<CursorRegistry>,
    ) -> CursorResult<(Self, OpenOutcome)> {
        config.validate()?;
        if registry.contains(&id) {
            return Err(CursorError::AlreadyOpen {
                cursor: id.to_string(),
            });
        }

        let limits = *registry.limits();
        if config.within(&limits) != config {
            warn!(cursor = %id, "Cursor config exceeds registry limits, clamping");
        }
        let loader = RecoveryLoader::new(
            Arc::clone(&backends.log),
            Arc::clone(&backends.metadata),
            limits,
            config.metadata_retry_attempts,
        );
        let recovery = loader.open(&id).await?;

        let (tracker, properties) = match recovery.snapshot {
            Some(snapshot) => (
                RangeTracker::from_snapshot(&snapshot.ranges)?,
                snapshot.properties,
            ),
            None => (RangeTracker::new(start), BTreeMap::new()),
        };
        let range_count = tracker.number_of_ranges();
        let live = Arc::new(LiveState::new(tracker, properties));

        let stats = StatsSlot::new(Arc::clone(registry.metrics()), id.topic(), id.subscription());
        if recovery.bytes_read > 0 {
            let materialized = stats.materialize();
            materialized.record_read(recovery.bytes_read);
            materialized.set_ranges(range_count);
        }

        let manager = Arc::new(PersistenceManager::new(
            id.clone(),
            backends.log,
            backends.metadata,
            config,
            limits,
            Arc::clone(&live),
            stats,
            recovery.manifest,
            Handle::current(),
        ));
        registry.register(Arc::clone(&manager))?;

        debug!(cursor = %id, outcome = ?recovery.outcome, "Cursor opened");
        let cursor = Self {
            id,
            live,
            manager,
            registry: Arc::clone(registry),
        };
        Ok((cursor, recovery.outcome))
    }

    /// Returns the cursor id.
    #[must_use]
    pub const fn id(&self) -> &CursorId {
        &self.id
    }

    /// Returns the topic name.
    #[must_use]
    pub fn topic(&self) -> &str {
        self.id.topic()
    }

    /// Returns the subscription name.
    #[must_use]
    pub fn subscription(&self) -> &str {
        self.id.subscription()
    }

    // -------------------------------------------------------------------------
    // Acknowledgment path
    // -------------------------------------------------------------------------

    /// Marks one position acknowledged.
    pub fn add_acknowledgment(&self, position: Position) {
        let (changed, ranges) = self.live.with_tracker(|tracker| tracker.add(position));
        self.manager.stats().materialize().set_ranges(ranges);
        trace!(cursor = %self.id, %position, changed, "Acknowledged");
        self.manager.note_acks(1);
    }

    /// Marks a batch of positions acknowledged under one lock.
    pub fn add_acknowledgments(&self, positions: impl IntoIterator<Item = Position>) {
        let (count, ranges) = self.live.with_tracker(|tracker| {
            let mut count = 0u64;
            for position in positions {
                tracker.add(position);
                count += 1;
            }
            count
        });
        self.manager.stats().materialize().set_ranges(ranges);
        trace!(cursor = %self.id, count, "Acknowledged batch");
        self.manager.note_acks(count);
    }

    /// Acknowledges everything up to and including `position`.
    ///
    /// A position behind the current mark-delete position is ignored.
    pub fn advance_mark_delete(&self, position: Position) {
        let (changed, ranges) = self
            .live
            .with_tracker(|tracker| tracker.mark_delete_to(position));
        self.manager.stats().materialize().set_ranges(ranges);
        trace!(cursor = %self.id, %position, changed, "Mark-delete advanced");
        self.manager.note_acks(1);
    }

    /// Returns the cumulative acknowledgment boundary.
    #[must_use]
    pub fn get_mark_delete_position(&self) -> Position {
        self.live.read_tracker(RangeTracker::mark_delete)
    }

    /// Returns the number of ranges acknowledged out of order.
    #[must_use]
    pub fn get_number_of_non_contiguous_deleted_ranges(&self) -> usize {
        self.live.read_tracker(RangeTracker::number_of_ranges)
    }

    /// Returns true if `position` is at or before the mark-delete position
    /// or inside an acknowledged range.
    #[must_use]
    pub fn is_acknowledged(&self, position: Position) -> bool {
        self.live.read_tracker(|tracker| tracker.is_acknowledged(position))
    }

    // -------------------------------------------------------------------------
    // Properties
    // -------------------------------------------------------------------------

    /// Sets a property, persisted with the next flush.
    ///
    /// # Errors
    ///
    /// Returns `Limit` if the key, the value or the property count exceeds
    /// the registry's limits.
    pub fn set_property(&self, key: impl Into<String>, value: impl Into<String>) -> CursorResult<()> {
        let key = key.into();
        let value = value.into();
        let limits: &Limits = self.manager.limits();
        Limits::check(
            "property_key_bytes",
            u64::from(limits.max_property_key_bytes),
            key.len() as u64,
        )?;
        Limits::check(
            "property_value_bytes",
            u64::from(limits.max_property_value_bytes),
            value.len() as u64,
        )?;

        let max_properties = u64::from(limits.max_properties);
        self.live.with_properties(|properties| {
            let count = properties.len() as u64 + u64::from(!properties.contains_key(&key));
            Limits::check("properties", max_properties, count)?;
            properties.insert(key, value);
            Ok(())
        })
    }

    /// Returns a copy of the cursor's properties.
    #[must_use]
    pub fn properties(&self) -> BTreeMap<String, String> {
        self.live.properties()
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Returns this cursor's named-field counters.
    #[must_use]
    pub fn snapshot_metrics(&self) -> CounterSet {
        self.manager.stats().counter_set()
    }

    /// Returns true if memory holds changes no backend has yet.
    #[must_use]
    pub fn has_unpersisted_changes(&self) -> bool {
        self.manager.is_dirty()
    }

    /// Returns the mark-delete position of the newest durable snapshot
    /// written by this instance.
    #[must_use]
    pub fn persisted_mark_delete_position(&self) -> Option<Position> {
        self.manager.persisted_mark_delete()
    }

    /// Returns the state of the write protocol.
    #[must_use]
    pub fn flush_state(&self) -> FlushState {
        self.manager.flush_state()
    }

    /// Triggers a flush without waiting for it.
    pub fn trigger_flush(&self) {
        self.manager.trigger_persist();
    }

    /// Persists unflushed state and waits until no write is in flight.
    ///
    /// Succeeds even if both backends failed; check the counters.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the cursor was closed.
    pub async fn flush(&self) -> CursorResult<()> {
        self.manager.flush().await
    }

    /// Writes any unflushed state, waits for in-flight writes, releases the
    /// primary segment and unregisters the cursor. Metric series are kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the primary segment could not be closed. The
    /// cursor is unregistered either way.
    pub async fn close(self) -> CursorResult<()> {
        let result = self.manager.close().await;
        self.registry.unregister(&self.id);
        result
    }

    /// Closes the cursor and removes its manifest, its segments and its
    /// metric series.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata store refuses the delete.
    pub async fn delete(self) -> CursorResult<()> {
        let result = self.manager.delete().await;
        self.registry.unregister(&self.id);
        result
    }
}

impl Drop for ManagedCursor {
    fn drop(&mut self) {
        if !self.manager.is_closed() {
            self.registry.unregister(&self.id);
            self.manager.close_in_background();
        }
    }
}
