//! Single-flight snapshot persistence.
//!
//! # Write protocol
//!
//! ```text
//!            trigger                      trigger
//!   Idle ─────────────► Writing ─────────────────► WritingWithPending
//!    ▲                     │  ▲                            │
//!    │   flush done,       │  │  flush done, re-snapshot   │
//!    └─────────────────────┘  └────────────────────────────┘
//!        nothing pending
//! ```
//!
//! Each flush writes one envelope to the current primary segment. On failure
//! the manager rolls over to a fresh segment (bounded attempts with backoff),
//! and if that fails too it writes the same snapshot to the metadata store.
//! The metadata store value doubles as the cursor's manifest: it always names
//! the current and previous primary segment, so recovery knows where to look.
//!
//! Rollover order is: create segment, append full snapshot, compare-and-set
//! the manifest, close the old segment. A crash between any two steps leaves
//! a readable snapshot in the segment the manifest names or the one before.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tally_core::{Limits, Position, SegmentId, Version, WriteSeq};
use tally_log::{LogResult, SegmentHandle, SegmentLog};
use tally_meta::{MetaError, MetaResult, MetadataStore};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::config::CursorConfig;
use crate::cursor::CursorId;
use crate::error::{CursorError, CursorResult};
use crate::metrics::{CursorStats, PersistOutcome, PersistTarget, StatsSlot};
use crate::range::RangeTracker;
use crate::record::{CursorSnapshot, Envelope};

/// State of the flush state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    /// No write in flight.
    Idle,
    /// One write in flight.
    Writing,
    /// One write in flight and newer state waiting behind it.
    WritingWithPending,
}

// -----------------------------------------------------------------------------
// LiveState
// -----------------------------------------------------------------------------

/// In-memory cursor state shared by the acknowledgment path and flushes.
///
/// Every mutation bumps `change`; a flush remembers the change number of the
/// snapshot it wrote, so the cursor is dirty while `change` is ahead of it.
#[derive(Debug)]
pub(crate) struct LiveState {
    tracker: Mutex<RangeTracker>,
    properties: Mutex<BTreeMap<String, String>>,
    change: AtomicU64,
}

impl LiveState {
    pub(crate) fn new(tracker: RangeTracker, properties: BTreeMap<String, String>) -> Self {
        Self {
            tracker: Mutex::new(tracker),
            properties: Mutex::new(properties),
            change: AtomicU64::new(0),
        }
    }

    /// Runs `mutate` on the tracker and returns its result plus the new
    /// range count.
    pub(crate) fn with_tracker<R>(
        &self,
        mutate: impl FnOnce(&mut RangeTracker) -> R,
    ) -> (R, usize) {
        let mut tracker = self.tracker.lock().unwrap_or_else(PoisonError::into_inner);
        let result = mutate(&mut tracker);
        self.change.fetch_add(1, Ordering::SeqCst);
        (result, tracker.number_of_ranges())
    }

    /// Reads the tracker without marking the state dirty.
    pub(crate) fn read_tracker<R>(&self, read: impl FnOnce(&RangeTracker) -> R) -> R {
        let tracker = self.tracker.lock().unwrap_or_else(PoisonError::into_inner);
        read(&tracker)
    }

    pub(crate) fn with_properties<R>(
        &self,
        mutate: impl FnOnce(&mut BTreeMap<String, String>) -> R,
    ) -> R {
        let mut properties = self.properties.lock().unwrap_or_else(PoisonError::into_inner);
        let result = mutate(&mut properties);
        self.change.fetch_add(1, Ordering::SeqCst);
        result
    }

    pub(crate) fn properties(&self) -> BTreeMap<String, String> {
        self.properties
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Takes an immutable copy for a flush.
    ///
    /// The change number is read before the properties are copied, so a
    /// property set concurrently leaves the cursor dirty rather than lost.
    pub(crate) fn snapshot(&self) -> (CursorSnapshot, u64) {
        let (ranges, change) = {
            let tracker = self.tracker.lock().unwrap_or_else(PoisonError::into_inner);
            (tracker.snapshot(), self.change.load(Ordering::SeqCst))
        };
        let snapshot = CursorSnapshot {
            ranges,
            properties: self.properties(),
        };
        (snapshot, change)
    }

    pub(crate) fn change(&self) -> u64 {
        self.change.load(Ordering::SeqCst)
    }
}

// -----------------------------------------------------------------------------
// SegmentLease
// -----------------------------------------------------------------------------

/// Writable primary segment, closed on every exit path.
///
/// [`SegmentLease::release`] closes it in place; dropping the lease closes it
/// in the background.
#[derive(Debug)]
pub(crate) struct SegmentLease {
    log: Arc<dyn SegmentLog>,
    segment_id: SegmentId,
    handle: Option<SegmentHandle>,
    runtime: Handle,
}

impl SegmentLease {
    pub(crate) fn new(log: Arc<dyn SegmentLog>, handle: SegmentHandle, runtime: Handle) -> Self {
        Self {
            log,
            segment_id: handle.segment_id(),
            handle: Some(handle),
            runtime,
        }
    }

    pub(crate) const fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    pub(crate) async fn append(&self, data: Bytes) -> LogResult<Position> {
        match &self.handle {
            Some(handle) => self.log.append(handle, data).await,
            None => Err(tally_log::LogError::SegmentClosed {
                segment_id: self.segment_id.get(),
            }),
        }
    }

    /// Closes the segment and waits for the log to confirm.
    pub(crate) async fn release(mut self) -> LogResult<()> {
        match self.handle.take() {
            Some(handle) => self.log.close_segment(handle).await,
            None => Ok(()),
        }
    }
}

impl Drop for SegmentLease {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let log = Arc::clone(&self.log);
            let segment_id = self.segment_id;
            self.runtime.spawn(async move {
                if let Err(e) = log.close_segment(handle).await {
                    warn!(%segment_id, error = %e, "Failed to close cursor segment");
                }
            });
        }
    }
}

/// Returns the flush state machine to `Idle` if a flush panics, so waiters
/// are released and a later trigger starts a new flush.
struct IdleOnPanic<'a>(&'a watch::Sender<FlushState>);

impl Drop for IdleOnPanic<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.send_replace(FlushState::Idle);
        }
    }
}

// -----------------------------------------------------------------------------
// PersistenceManager
// -----------------------------------------------------------------------------

/// Segment bookkeeping, only touched by the flush in flight.
#[derive(Debug, Default)]
struct PersistIo {
    segment: Option<SegmentLease>,
    segment_entries: u64,
    segment_bytes: u64,
    /// Set after a failed append or on recovery: the next flush starts a
    /// fresh segment.
    needs_rollover: bool,
    manifest_version: Option<Version>,
    /// Primary segment named by the manifest (0 = none).
    manifest_segment: SegmentId,
    /// Segment before `manifest_segment` (0 = none).
    manifest_previous: SegmentId,
}

/// Where a manager starts after recovery.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ManifestState {
    pub version: Option<Version>,
    pub segment: SegmentId,
    pub previous: SegmentId,
    pub next_seq: WriteSeq,
}

/// Owns the write protocol of one cursor.
#[derive(Debug)]
pub(crate) struct PersistenceManager {
    id: CursorId,
    log: Arc<dyn SegmentLog>,
    meta: Arc<dyn MetadataStore>,
    config: CursorConfig,
    limits: Limits,
    live: Arc<LiveState>,
    stats: StatsSlot,
    state: watch::Sender<FlushState>,
    io: tokio::sync::Mutex<PersistIo>,
    next_seq: AtomicU64,
    persisted_change: AtomicU64,
    persisted_mark_delete: Mutex<Option<Position>>,
    acks_since_trigger: AtomicU64,
    closed: AtomicBool,
    runtime: Handle,
}

impl PersistenceManager {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: CursorId,
        log: Arc<dyn SegmentLog>,
        meta: Arc<dyn MetadataStore>,
        config: CursorConfig,
        limits: Limits,
        live: Arc<LiveState>,
        stats: StatsSlot,
        manifest: ManifestState,
        runtime: Handle,
    ) -> Self {
        let (state, _) = watch::channel(FlushState::Idle);
        let persisted_change = live.change();
        Self {
            id,
            log,
            meta,
            config: config.within(&limits),
            limits,
            live,
            stats,
            state,
            io: tokio::sync::Mutex::new(PersistIo {
                // TigerStyle: Never append to a segment we did not create in
                // this process; a recovered cursor always starts a new one.
                needs_rollover: true,
                manifest_version: manifest.version,
                manifest_segment: manifest.segment,
                manifest_previous: manifest.previous,
                ..PersistIo::default()
            }),
            next_seq: AtomicU64::new(manifest.next_seq.get().max(1)),
            persisted_change: AtomicU64::new(persisted_change),
            persisted_mark_delete: Mutex::new(None),
            acks_since_trigger: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            runtime,
        }
    }

    pub(crate) const fn id(&self) -> &CursorId {
        &self.id
    }

    pub(crate) const fn stats(&self) -> &StatsSlot {
        &self.stats
    }

    pub(crate) const fn limits(&self) -> &Limits {
        &self.limits
    }

    pub(crate) fn flush_state(&self) -> FlushState {
        *self.state.borrow()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns true if in-memory state is ahead of the last durable write.
    pub(crate) fn is_dirty(&self) -> bool {
        self.live.change() > self.persisted_change.load(Ordering::SeqCst)
    }

    /// Mark-delete position of the newest durable snapshot.
    pub(crate) fn persisted_mark_delete(&self) -> Option<Position> {
        *self
            .persisted_mark_delete
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Counts acknowledgments and triggers a flush once enough accumulated.
    ///
    /// Only the caller that crosses the threshold triggers; it subtracts the
    /// threshold, so acknowledgments counted concurrently carry over.
    pub(crate) fn note_acks(self: &Arc<Self>, count: u64) {
        let threshold = self.config.persist_after_acks;
        let crossed = self
            .acks_since_trigger
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |acks| {
                let total = acks.saturating_add(count);
                Some(if total >= threshold { total - threshold } else { total })
            })
            .is_ok_and(|acks| acks.saturating_add(count) >= threshold);
        if crossed {
            self.trigger_persist();
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_acks(&self) -> u64 {
        self.acks_since_trigger.load(Ordering::SeqCst)
    }

    /// Starts a flush, or marks one pending if a write is in flight.
    ///
    /// Never blocks and never starts a second concurrent write.
    pub(crate) fn trigger_persist(self: &Arc<Self>) {
        if self.is_closed() {
            trace!(cursor = %self.id, "Ignoring flush trigger on closed cursor");
            return;
        }
        self.schedule_flush();
    }

    fn schedule_flush(self: &Arc<Self>) {
        let mut start = false;
        self.state.send_if_modified(|state| match *state {
            FlushState::Idle => {
                *state = FlushState::Writing;
                start = true;
                true
            }
            FlushState::Writing => {
                *state = FlushState::WritingWithPending;
                true
            }
            FlushState::WritingWithPending => false,
        });

        if start {
            let snapshot = self.live.snapshot();
            let manager = Arc::clone(self);
            self.runtime.spawn(manager.run_flushes(snapshot));
        }
    }

    async fn run_flushes(self: Arc<Self>, first: (CursorSnapshot, u64)) {
        let _guard = IdleOnPanic(&self.state);
        let mut next = first;
        loop {
            let (snapshot, change) = next;
            self.flush_once(snapshot, change).await;

            let mut again = false;
            self.state.send_modify(|state| {
                if *state == FlushState::WritingWithPending {
                    *state = FlushState::Writing;
                    again = true;
                } else {
                    *state = FlushState::Idle;
                }
            });
            if !again {
                break;
            }
            next = self.live.snapshot();
        }
    }

    /// Waits until no write is in flight.
    pub(crate) async fn wait_idle(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|state| *state == FlushState::Idle).await;
    }

    /// Persists any dirty state and waits for the write to finish.
    pub(crate) async fn flush(self: &Arc<Self>) -> CursorResult<()> {
        if self.is_closed() {
            return Err(CursorError::Closed {
                cursor: self.id.to_string(),
            });
        }
        if self.is_dirty() {
            self.trigger_persist();
        }
        self.wait_idle().await;
        Ok(())
    }

    /// Lets the in-flight write finish, writes dirty state one last time and
    /// releases the primary segment. Idempotent.
    pub(crate) async fn close(self: &Arc<Self>) -> CursorResult<()> {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first && self.is_dirty() {
            self.schedule_flush();
        }
        self.wait_idle().await;

        let lease = self.io.lock().await.segment.take();
        let released = match lease {
            Some(lease) => lease.release().await,
            None => Ok(()),
        };
        if first {
            info!(cursor = %self.id, dirty = self.is_dirty(), "Cursor closed");
        }
        released.map_err(CursorError::from)
    }

    /// Schedules a final flush without waiting, for cursors dropped unclosed.
    pub(crate) fn close_in_background(self: &Arc<Self>) {
        if !self.closed.swap(true, Ordering::AcqRel) && self.is_dirty() {
            self.schedule_flush();
        }
    }

    /// Removes all durable state of the cursor.
    pub(crate) async fn delete(self: &Arc<Self>) -> CursorResult<()> {
        if let Err(e) = self.close().await {
            warn!(cursor = %self.id, error = %e, "Failed to close cursor segment before delete");
        }

        let path = self.id.metadata_path();
        match self.meta.delete(&path).await {
            Ok(()) | Err(MetaError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        let (current, previous) = {
            let io = self.io.lock().await;
            (io.manifest_segment, io.manifest_previous)
        };
        for segment_id in [current, previous] {
            if segment_id.get() == 0 {
                continue;
            }
            if let Err(e) = self.log.delete_segment(segment_id).await {
                debug!(cursor = %self.id, %segment_id, error = %e, "Segment already gone");
            }
        }

        self.stats.remove();
        info!(cursor = %self.id, "Cursor deleted");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Flush
    // -------------------------------------------------------------------------

    async fn flush_once(&self, snapshot: CursorSnapshot, change: u64) {
        let stats = self.stats.materialize();
        let mut io = self.io.lock().await;

        let seq = WriteSeq::new(self.next_seq.fetch_add(1, Ordering::SeqCst));
        let range_count = snapshot.ranges.ranges.len();
        if range_count > self.config.max_ranges_to_persist as usize {
            warn!(
                cursor = %self.id,
                ranges = range_count,
                max = self.config.max_ranges_to_persist,
                "Too many ranges to persist, truncating snapshot"
            );
        }
        let payload = snapshot.encode(self.config.record_format, self.config.max_ranges_to_persist);
        if payload.len() as u64 > u64::from(self.limits.max_record_bytes) {
            // Recovery would reject the record, so it is never written.
            stats.record_persist(PersistTarget::PrimaryLog, PersistOutcome::Fail);
            error!(
                cursor = %self.id,
                %seq,
                bytes = payload.len(),
                max = self.limits.max_record_bytes,
                "Snapshot exceeds record size limit, not persisted"
            );
            return;
        }

        let persisted = self.write_primary(&mut io, seq, &payload, stats).await
            || self.write_metadata(&mut io, seq, &payload, stats).await;
        drop(io);

        if persisted {
            self.persisted_change.fetch_max(change, Ordering::SeqCst);
            let mut persisted_md = self
                .persisted_mark_delete
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            debug_assert!(
                persisted_md.map_or(true, |md| md <= snapshot.mark_delete()),
                "persisted mark-delete went backwards"
            );
            *persisted_md = Some(snapshot.mark_delete());
            trace!(cursor = %self.id, %seq, mark_delete = %snapshot.mark_delete(), "Snapshot persisted");
        }
    }

    fn needs_rollover(&self, io: &PersistIo) -> bool {
        io.segment.is_none()
            || io.needs_rollover
            || io.segment_entries >= self.config.max_entries_per_segment
            || io.segment_bytes >= self.config.max_segment_bytes
    }

    /// Writes to the current segment, rolling over when needed. Returns true
    /// if the snapshot reached the primary log.
    async fn write_primary(
        &self,
        io: &mut PersistIo,
        seq: WriteSeq,
        payload: &Bytes,
        stats: &CursorStats,
    ) -> bool {
        if !self.needs_rollover(io) {
            if let Some(lease) = io.segment.as_ref() {
                let envelope = Envelope {
                    seq,
                    segment_id: lease.segment_id(),
                    previous_segment_id: io.manifest_previous,
                    payload: payload.clone(),
                };
                let bytes = envelope.encode();
                let written = bytes.len() as u64;
                match lease.append(bytes).await {
                    Ok(_) => {
                        io.segment_entries += 1;
                        io.segment_bytes += written;
                        stats.record_persist(PersistTarget::PrimaryLog, PersistOutcome::Succeed);
                        stats.record_write(written, payload.len() as u64);
                        return true;
                    }
                    Err(e) => {
                        stats.record_persist(PersistTarget::PrimaryLog, PersistOutcome::Fail);
                        if e.is_fatal() {
                            warn!(cursor = %self.id, segment_id = %lease.segment_id(), error = %e, "Abandoning cursor segment");
                        } else {
                            warn!(cursor = %self.id, segment_id = %lease.segment_id(), error = %e, "Cursor segment append failed");
                        }
                        io.needs_rollover = true;
                    }
                }
            }
        }

        for attempt in 0..self.config.rollover_attempts {
            let backoff = self.config.rollover_backoff(attempt);
            if !backoff.is_zero() {
                tokio::time::sleep(backoff).await;
            }
            match self.rollover(io, seq, payload).await {
                Ok(written) => {
                    stats.record_persist(PersistTarget::PrimaryLog, PersistOutcome::Succeed);
                    stats.record_write(written, payload.len() as u64);
                    return true;
                }
                Err(e) => {
                    stats.record_persist(PersistTarget::PrimaryLog, PersistOutcome::Fail);
                    warn!(cursor = %self.id, attempt, error = %e, "Cursor segment rollover failed");
                }
            }
        }
        false
    }

    /// Starts a new segment holding the full snapshot and points the manifest
    /// at it. Returns the bytes appended.
    async fn rollover(
        &self,
        io: &mut PersistIo,
        seq: WriteSeq,
        payload: &Bytes,
    ) -> CursorResult<u64> {
        let handle = self.log.create_segment().await?;
        let lease = SegmentLease::new(Arc::clone(&self.log), handle, self.runtime.clone());
        let new_id = lease.segment_id();
        let old_id = io.manifest_segment;

        let envelope = Envelope {
            seq,
            segment_id: new_id,
            previous_segment_id: old_id,
            payload: payload.clone(),
        };
        let bytes = envelope.encode();
        let written = bytes.len() as u64;

        if let Err(e) = lease.append(bytes.clone()).await {
            self.abandon(lease).await;
            return Err(e.into());
        }
        if let Err(e) = self.compare_and_set_manifest(io, seq, bytes).await {
            self.abandon(lease).await;
            return Err(e.into());
        }

        // The manifest no longer references the segment before `old_id`.
        let retired = io.manifest_previous;
        if retired.get() != 0 && retired != old_id && retired != new_id {
            let log = Arc::clone(&self.log);
            self.runtime.spawn(async move {
                if let Err(e) = log.delete_segment(retired).await {
                    debug!(segment_id = %retired, error = %e, "Failed to delete retired cursor segment");
                }
            });
        }

        // Dropping the old lease closes it in the background.
        drop(io.segment.replace(lease));
        io.segment_entries = 1;
        io.segment_bytes = written;
        io.needs_rollover = false;
        io.manifest_segment = new_id;
        io.manifest_previous = old_id;

        info!(cursor = %self.id, segment_id = %new_id, previous = %old_id, "Cursor segment rolled over");
        Ok(written)
    }

    async fn abandon(&self, lease: SegmentLease) {
        let segment_id = lease.segment_id();
        let _ = lease.release().await;
        if let Err(e) = self.log.delete_segment(segment_id).await {
            debug!(cursor = %self.id, %segment_id, error = %e, "Failed to delete abandoned segment");
        }
    }

    /// Writes the snapshot to the metadata store. Terminal: no further
    /// fallback exists.
    async fn write_metadata(
        &self,
        io: &mut PersistIo,
        seq: WriteSeq,
        payload: &Bytes,
        stats: &CursorStats,
    ) -> bool {
        let envelope = Envelope {
            seq,
            segment_id: io.manifest_segment,
            previous_segment_id: io.manifest_previous,
            payload: payload.clone(),
        };
        match self.compare_and_set_manifest(io, seq, envelope.encode()).await {
            Ok(version) => {
                stats.record_persist(PersistTarget::MetadataStore, PersistOutcome::Succeed);
                info!(cursor = %self.id, %seq, %version, "Snapshot persisted to metadata store");
                true
            }
            Err(e) => {
                stats.record_persist(PersistTarget::MetadataStore, PersistOutcome::Fail);
                warn!(cursor = %self.id, %seq, error = %e, "Failed to persist snapshot anywhere");
                false
            }
        }
    }

    /// Compare-and-set of the cursor's metadata value.
    ///
    /// Connection loss is retried. A version conflict re-reads the value: if
    /// it already holds our bytes the write had landed, if it holds an older
    /// sequence we adopt its version and retry once, and a newer sequence
    /// means another owner wrote it, which is an error.
    async fn compare_and_set_manifest(
        &self,
        io: &mut PersistIo,
        seq: WriteSeq,
        data: Bytes,
    ) -> MetaResult<Version> {
        let path = self.id.metadata_path();
        let mut retries = 0;
        let mut reconciled = false;
        loop {
            match self
                .meta
                .compare_and_set(&path, io.manifest_version, data.clone())
                .await
            {
                Ok(version) => {
                    io.manifest_version = Some(version);
                    return Ok(version);
                }
                Err(e) if e.is_retryable() && retries < self.config.metadata_retry_attempts => {
                    retries += 1;
                    debug!(cursor = %self.id, retries, error = %e, "Retrying metadata write");
                }
                Err(e) if e.is_bad_version() && !reconciled => {
                    reconciled = true;
                    match self.meta.get(&path).await {
                        Ok(current) => {
                            if current.data == data {
                                io.manifest_version = Some(current.version);
                                return Ok(current.version);
                            }
                            let stored = Envelope::decode(current.data).map(|env| env.seq);
                            if stored.is_ok_and(|stored| stored >= seq) {
                                return Err(e);
                            }
                            debug!(cursor = %self.id, version = %current.version, "Adopting metadata version");
                            io.manifest_version = Some(current.version);
                        }
                        Err(MetaError::NotFound { .. }) => io.manifest_version = None,
                        Err(get_err) => return Err(get_err),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::CursorMetrics;
    use tally_log::{LogFaultConfig, SimulatedSegmentLog};
    use tally_meta::InMemoryMetadataStore;

    struct Harness {
        log: SimulatedSegmentLog,
        meta: InMemoryMetadataStore,
        live: Arc<LiveState>,
        manager: Arc<PersistenceManager>,
    }

    fn harness(config: CursorConfig, log: SimulatedSegmentLog) -> Harness {
        harness_with_limits(config, log, Limits::default())
    }

    fn harness_with_limits(
        config: CursorConfig,
        log: SimulatedSegmentLog,
        limits: Limits,
    ) -> Harness {
        let meta = InMemoryMetadataStore::new();
        let id = CursorId::new("orders", "billing").unwrap();
        let live = Arc::new(LiveState::new(
            RangeTracker::new(Position::default()),
            BTreeMap::new(),
        ));
        let metrics = Arc::new(CursorMetrics::new().unwrap());
        let manager = Arc::new(PersistenceManager::new(
            id,
            Arc::new(log.clone()),
            Arc::new(meta.clone()),
            config,
            limits,
            Arc::clone(&live),
            StatsSlot::new(metrics, "orders", "billing"),
            ManifestState::default(),
            Handle::current(),
        ));
        Harness {
            log,
            meta,
            live,
            manager,
        }
    }

    fn ack(h: &Harness, entry: i64) {
        h.live
            .with_tracker(|t| t.add(Position::new(SegmentId::new(0), entry)));
    }

    #[tokio::test]
    async fn test_first_flush_creates_segment_and_manifest() {
        let h = harness(CursorConfig::for_testing(), SimulatedSegmentLog::new(1));
        ack(&h, 0);
        h.manager.flush().await.unwrap();

        assert!(!h.manager.is_dirty());
        assert_eq!(h.log.segment_ids(), vec![SegmentId::new(1)]);
        let manifest = h.meta.raw("/cursors/orders/billing").unwrap();
        let envelope = Envelope::decode(manifest.data).unwrap();
        assert_eq!(envelope.segment_id, SegmentId::new(1));

        let counters = h.manager.stats().counter_set();
        assert_eq!(counters.persist_log_succeed, 1);
        assert_eq!(counters.persist_metadata_succeed, 0);
        assert!(counters.write_log_size > counters.write_log_logical_size);
    }

    #[tokio::test]
    async fn test_subsequent_flushes_append_to_same_segment() {
        let h = harness(CursorConfig::for_testing(), SimulatedSegmentLog::new(2));
        for entry in 0..5 {
            ack(&h, entry);
            h.manager.flush().await.unwrap();
        }
        assert_eq!(h.log.segment_ids().len(), 1);
        assert_eq!(h.log.entry_count(SegmentId::new(1)), Some(5));
        assert_eq!(h.manager.stats().counter_set().persist_log_succeed, 5);
        assert_eq!(
            h.manager.persisted_mark_delete(),
            Some(Position::new(SegmentId::new(0), 4))
        );
    }

    #[tokio::test]
    async fn test_entry_threshold_rolls_over_and_retires_old_segments() {
        let config = CursorConfig {
            max_entries_per_segment: 2,
            ..CursorConfig::for_testing()
        };
        let h = harness(config, SimulatedSegmentLog::new(3));
        for entry in 0..7 {
            ack(&h, entry);
            h.manager.flush().await.unwrap();
        }
        tokio::task::yield_now().await;

        // Segments 1..=4 were created; only the newest two stay referenced.
        let manifest = Envelope::decode(h.meta.raw("/cursors/orders/billing").unwrap().data).unwrap();
        assert_eq!(manifest.segment_id, SegmentId::new(4));
        assert_eq!(manifest.previous_segment_id, SegmentId::new(3));
        assert!(h.log.is_closed(SegmentId::new(3)));
        assert!(!h.log.segment_ids().contains(&SegmentId::new(1)));
    }

    #[tokio::test]
    async fn test_append_failure_rolls_over() {
        let h = harness(CursorConfig::for_testing(), SimulatedSegmentLog::new(4));
        ack(&h, 0);
        h.manager.flush().await.unwrap();

        h.log.fault_config().force_append_timeout = true;
        ack(&h, 1);
        h.manager.flush().await.unwrap();

        let counters = h.manager.stats().counter_set();
        assert_eq!(counters.persist_log_errors, 1);
        assert_eq!(counters.persist_log_succeed, 2);
        assert_eq!(h.log.segment_ids(), vec![SegmentId::new(1), SegmentId::new(2)]);
    }

    #[tokio::test]
    async fn test_unavailable_log_falls_back_to_metadata_store() {
        let log = SimulatedSegmentLog::with_faults(5, LogFaultConfig::none().with_unavailable());
        let h = harness(CursorConfig::for_testing(), log);
        ack(&h, 0);
        h.manager.flush().await.unwrap();

        let counters = h.manager.stats().counter_set();
        assert_eq!(counters.persist_log_errors, 3);
        assert_eq!(counters.persist_metadata_succeed, 1);
        assert_eq!(counters.persist_metadata_errors, 0);
        assert_eq!(counters.write_log_size, 0);
        assert!(!h.manager.is_dirty());

        let envelope = Envelope::decode(h.meta.raw("/cursors/orders/billing").unwrap().data).unwrap();
        let snapshot = envelope.snapshot(&Limits::default()).unwrap();
        assert_eq!(snapshot.mark_delete(), Position::new(SegmentId::new(0), 0));
    }

    #[tokio::test]
    async fn test_both_backends_down_keeps_state_dirty() {
        let log = SimulatedSegmentLog::with_faults(6, LogFaultConfig::none().with_unavailable());
        let h = harness(CursorConfig::for_testing(), log);
        h.meta.set_unavailable(true);
        ack(&h, 0);
        h.manager.flush().await.unwrap();

        assert!(h.manager.is_dirty());
        assert_eq!(h.manager.flush_state(), FlushState::Idle);
        assert_eq!(h.manager.stats().counter_set().persist_metadata_errors, 1);

        h.log.set_unavailable(false);
        h.meta.set_unavailable(false);
        h.manager.flush().await.unwrap();
        assert!(!h.manager.is_dirty());
    }

    #[tokio::test]
    async fn test_triggers_coalesce_into_single_flight() {
        let log = SimulatedSegmentLog::with_faults(7, LogFaultConfig::none().with_append_latency_ms(20));
        let h = harness(CursorConfig::for_testing(), log);
        for entry in 0..10 {
            ack(&h, entry);
            h.manager.trigger_persist();
        }
        assert_eq!(h.manager.flush_state(), FlushState::WritingWithPending);
        h.manager.wait_idle().await;

        let stats = h.log.fault_stats();
        assert_eq!(stats.max_in_flight_appends, 1);
        // First snapshot plus one coalesced follow-up.
        assert_eq!(stats.appends, 2);
        assert!(!h.manager.is_dirty());
    }

    #[tokio::test]
    async fn test_close_writes_final_snapshot_and_releases_segment() {
        let config = CursorConfig {
            persist_after_acks: 100,
            ..CursorConfig::for_testing()
        };
        let h = harness(config, SimulatedSegmentLog::new(8));
        ack(&h, 0);
        h.manager.note_acks(1);
        assert_eq!(h.manager.flush_state(), FlushState::Idle);

        h.manager.close().await.unwrap();
        assert!(!h.manager.is_dirty());
        assert!(h.log.is_closed(SegmentId::new(1)));

        ack(&h, 1);
        h.manager.trigger_persist();
        assert_eq!(h.manager.flush_state(), FlushState::Idle);
        assert!(h.manager.flush().await.is_err());
    }

    #[tokio::test]
    async fn test_connection_loss_retried_on_fallback() {
        let log = SimulatedSegmentLog::with_faults(9, LogFaultConfig::none().with_unavailable());
        let h = harness(CursorConfig::for_testing(), log);
        h.meta.fault_config().force_connection_loss = 2;
        ack(&h, 0);
        h.manager.flush().await.unwrap();

        let counters = h.manager.stats().counter_set();
        assert_eq!(counters.persist_metadata_succeed, 1);
        assert_eq!(counters.persist_metadata_errors, 0);
    }

    #[tokio::test]
    async fn test_bad_version_reconciles_with_older_value() {
        let h = harness(CursorConfig::for_testing(), SimulatedSegmentLog::new(10));
        ack(&h, 0);
        h.manager.flush().await.unwrap();

        h.meta.fault_config().force_bad_version = true;
        h.log.fault_config().force_append_timeout = true;
        ack(&h, 1);
        h.manager.flush().await.unwrap();

        let counters = h.manager.stats().counter_set();
        assert_eq!(counters.persist_log_succeed, 2);
        assert!(!h.manager.is_dirty());
    }

    #[tokio::test]
    async fn test_fenced_segment_rolls_over_without_fallback() {
        let h = harness(CursorConfig::for_testing(), SimulatedSegmentLog::new(11));
        ack(&h, 0);
        h.manager.flush().await.unwrap();
        h.log.fence_segment(SegmentId::new(1));

        ack(&h, 1);
        h.manager.flush().await.unwrap();
        ack(&h, 2);
        h.manager.flush().await.unwrap();

        let counters = h.manager.stats().counter_set();
        assert_eq!(counters.persist_log_errors, 1);
        assert_eq!(counters.persist_log_succeed, 3);
        assert_eq!(counters.persist_metadata_succeed, 0);
        assert!(!h.manager.is_dirty());

        // The fenced segment keeps its single entry; later writes go to the new one.
        assert_eq!(h.log.entry_count(SegmentId::new(1)), Some(1));
        assert_eq!(h.log.entry_count(SegmentId::new(2)), Some(2));
        let manifest = Envelope::decode(h.meta.raw("/cursors/orders/billing").unwrap().data).unwrap();
        assert_eq!(manifest.segment_id, SegmentId::new(2));
        assert_eq!(manifest.previous_segment_id, SegmentId::new(1));
    }

    #[tokio::test]
    async fn test_range_cap_clamped_to_record_limit() {
        let limits = Limits {
            max_ranges_per_record: 2,
            ..Limits::default()
        };
        let h = harness_with_limits(CursorConfig::for_testing(), SimulatedSegmentLog::new(12), limits);
        for entry in [0, 2, 4, 6] {
            ack(&h, entry);
        }
        h.manager.flush().await.unwrap();

        let envelope = Envelope::decode(h.meta.raw("/cursors/orders/billing").unwrap().data).unwrap();
        let snapshot = envelope.snapshot(&limits).unwrap();
        assert_eq!(snapshot.mark_delete(), Position::new(SegmentId::new(0), 0));
        assert_eq!(snapshot.ranges.ranges.len(), 2);
    }

    #[tokio::test]
    async fn test_oversized_record_is_not_written() {
        let limits = Limits {
            max_record_bytes: 256,
            max_property_key_bytes: 16,
            max_property_value_bytes: 200,
            ..Limits::default()
        };
        let h = harness_with_limits(CursorConfig::for_testing(), SimulatedSegmentLog::new(13), limits);
        ack(&h, 0);
        h.manager.flush().await.unwrap();

        h.live.with_properties(|properties| {
            properties.insert("a".to_string(), "x".repeat(200));
            properties.insert("b".to_string(), "y".repeat(200));
        });
        h.manager.flush().await.unwrap();

        let counters = h.manager.stats().counter_set();
        assert_eq!(counters.persist_log_succeed, 1);
        assert_eq!(counters.persist_log_errors, 1);
        assert_eq!(counters.persist_metadata_errors, 0);
        assert_eq!(h.log.entry_count(SegmentId::new(1)), Some(1));
        assert!(h.manager.is_dirty());
        assert_eq!(h.manager.flush_state(), FlushState::Idle);
        assert_eq!(
            h.manager.persisted_mark_delete(),
            Some(Position::new(SegmentId::new(0), 0))
        );
    }

    #[tokio::test]
    async fn test_acks_past_threshold_carry_over() {
        let config = CursorConfig {
            persist_after_acks: 10,
            ..CursorConfig::for_testing()
        };
        let h = harness(config, SimulatedSegmentLog::new(14));
        h.manager.note_acks(7);
        assert_eq!(h.manager.pending_acks(), 7);
        assert_eq!(h.manager.flush_state(), FlushState::Idle);

        ack(&h, 0);
        h.manager.note_acks(7);
        assert_eq!(h.manager.pending_acks(), 4);
        assert_ne!(h.manager.flush_state(), FlushState::Idle);
        h.manager.wait_idle().await;
        assert!(!h.manager.is_dirty());
    }

    /// Log whose `create_segment` panics while `panic` is set.
    #[derive(Debug)]
    struct PanickingLog {
        inner: SimulatedSegmentLog,
        panic: AtomicBool,
    }

    #[async_trait::async_trait]
    impl SegmentLog for PanickingLog {
        async fn create_segment(&self) -> LogResult<SegmentHandle> {
            assert!(!self.panic.load(Ordering::SeqCst), "log bug");
            self.inner.create_segment().await
        }

        async fn open_segment(&self, segment_id: SegmentId) -> LogResult<SegmentHandle> {
            self.inner.open_segment(segment_id).await
        }

        async fn append(&self, handle: &SegmentHandle, data: Bytes) -> LogResult<Position> {
            self.inner.append(handle, data).await
        }

        async fn read_last_entry(&self, handle: &SegmentHandle) -> LogResult<Bytes> {
            self.inner.read_last_entry(handle).await
        }

        async fn close_segment(&self, handle: SegmentHandle) -> LogResult<()> {
            self.inner.close_segment(handle).await
        }

        async fn delete_segment(&self, segment_id: SegmentId) -> LogResult<()> {
            self.inner.delete_segment(segment_id).await
        }
    }

    #[tokio::test]
    async fn test_panicking_flush_returns_to_idle() {
        let log = Arc::new(PanickingLog {
            inner: SimulatedSegmentLog::new(15),
            panic: AtomicBool::new(true),
        });
        let live = Arc::new(LiveState::new(
            RangeTracker::new(Position::default()),
            BTreeMap::new(),
        ));
        let manager = Arc::new(PersistenceManager::new(
            CursorId::new("orders", "billing").unwrap(),
            Arc::clone(&log) as Arc<dyn SegmentLog>,
            Arc::new(InMemoryMetadataStore::new()),
            CursorConfig::for_testing(),
            Limits::default(),
            Arc::clone(&live),
            StatsSlot::new(Arc::new(CursorMetrics::new().unwrap()), "orders", "billing"),
            ManifestState::default(),
            Handle::current(),
        ));

        live.with_tracker(|t| t.add(Position::new(SegmentId::new(0), 0)));
        tokio::time::timeout(std::time::Duration::from_secs(2), manager.flush())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(manager.flush_state(), FlushState::Idle);
        assert!(manager.is_dirty());

        log.panic.store(false, Ordering::SeqCst);
        manager.flush().await.unwrap();
        assert!(!manager.is_dirty());
        assert_eq!(log.inner.segment_ids(), vec![SegmentId::new(1)]);
    }
}
