//! Simulated segment log for deterministic simulation testing.
//!
//! Keeps every segment in memory and supports configurable fault injection:
//! probabilistic failures per operation, one-shot forced failures, injected
//! append latency, fenced segments and corrupted entries.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tally_core::{Position, SegmentId};

use crate::error::{LogError, LogResult};
use crate::log::{SegmentHandle, SegmentLog};

// -----------------------------------------------------------------------------
// Fault configuration
// -----------------------------------------------------------------------------

/// Configuration for fault injection in the simulated log.
#[derive(Debug, Clone, Default)]
pub struct LogFaultConfig {
    /// Probability of segment creation failing. Range: 0.0 - 1.0.
    pub create_fail_rate: f64,
    /// Probability of an append failing with a timeout. Range: 0.0 - 1.0.
    pub append_fail_rate: f64,
    /// Probability of a read failing. Range: 0.0 - 1.0.
    pub read_fail_rate: f64,
    /// Probability of a close failing. Range: 0.0 - 1.0.
    pub close_fail_rate: f64,
    /// Latency added to every append, in milliseconds.
    pub append_latency_ms: u64,
    /// If true, every operation fails with `NotEnoughReplicas`.
    pub unavailable: bool,
    /// If true, the next append fails with a timeout.
    pub force_append_timeout: bool,
    /// If true, the next segment creation fails.
    pub force_create_fail: bool,
}

impl LogFaultConfig {
    /// Creates a fault config with no faults.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Creates a fault config that simulates a flaky bookkeeping cluster.
    #[must_use]
    pub fn flaky() -> Self {
        Self {
            create_fail_rate: 0.05,
            append_fail_rate: 0.1,
            read_fail_rate: 0.02,
            close_fail_rate: 0.02,
            ..Default::default()
        }
    }

    /// Sets the create fail rate.
    #[must_use]
    pub const fn with_create_fail_rate(mut self, rate: f64) -> Self {
        self.create_fail_rate = rate;
        self
    }

    /// Sets the append fail rate.
    #[must_use]
    pub const fn with_append_fail_rate(mut self, rate: f64) -> Self {
        self.append_fail_rate = rate;
        self
    }

    /// Sets the read fail rate.
    #[must_use]
    pub const fn with_read_fail_rate(mut self, rate: f64) -> Self {
        self.read_fail_rate = rate;
        self
    }

    /// Sets the append latency.
    #[must_use]
    pub const fn with_append_latency_ms(mut self, latency_ms: u64) -> Self {
        self.append_latency_ms = latency_ms;
        self
    }

    /// Makes the whole log unavailable.
    #[must_use]
    pub const fn with_unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    /// Forces the next append to time out.
    #[must_use]
    pub const fn with_force_append_timeout(mut self) -> Self {
        self.force_append_timeout = true;
        self
    }

    /// Forces the next segment creation to fail.
    #[must_use]
    pub const fn with_force_create_fail(mut self) -> Self {
        self.force_create_fail = true;
        self
    }
}

/// Type of fault being injected.
#[derive(Debug, Clone, Copy)]
enum FaultType {
    CreateFail,
    AppendFail,
    ReadFail,
    CloseFail,
}

/// Statistics for operations and injected faults.
#[derive(Debug, Default, Clone)]
pub struct LogFaultStats {
    /// Segments created.
    pub creates: u64,
    /// Entries appended successfully.
    pub appends: u64,
    /// Last-entry reads served successfully.
    pub reads: u64,
    /// Segments closed.
    pub closes: u64,
    /// Number of create failures injected.
    pub create_failures: u64,
    /// Number of append failures injected.
    pub append_failures: u64,
    /// Number of read failures injected.
    pub read_failures: u64,
    /// Number of close failures injected.
    pub close_failures: u64,
    /// Highest number of appends observed in flight at once.
    pub max_in_flight_appends: u64,
    /// Total log operations attempted.
    pub total_ops: u64,
}

impl LogFaultStats {
    /// Returns the total number of faults injected.
    #[must_use]
    pub const fn total_faults(&self) -> u64 {
        self.create_failures + self.append_failures + self.read_failures + self.close_failures
    }
}

// -----------------------------------------------------------------------------
// SimulatedSegmentLog
// -----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SegmentState {
    entries: Vec<Bytes>,
    closed: bool,
}

#[derive(Debug)]
struct LogState {
    segments: BTreeMap<SegmentId, SegmentState>,
    next_segment_id: u64,
}

/// In-memory segment log for deterministic testing.
///
/// Clones share state, so a test can keep one clone for inspection and fault
/// control while the cursor under test owns another.
///
/// # Panics
///
/// Methods may panic if internal mutex locks are poisoned, which indicates
/// a previous panic in a critical section. This is acceptable for test code.
#[derive(Debug, Clone)]
#[allow(clippy::significant_drop_tightening, clippy::missing_panics_doc)]
pub struct SimulatedSegmentLog {
    state: Arc<Mutex<LogState>>,
    fault_config: Arc<Mutex<LogFaultConfig>>,
    /// RNG seed for deterministic fault injection.
    seed: u64,
    op_counter: Arc<AtomicU64>,
    in_flight_appends: Arc<AtomicU64>,
    fault_stats: Arc<Mutex<LogFaultStats>>,
}

impl Default for SimulatedSegmentLog {
    fn default() -> Self {
        Self::new(0)
    }
}

#[allow(clippy::missing_panics_doc, clippy::significant_drop_tightening)]
impl SimulatedSegmentLog {
    /// Creates a new simulated log with the given seed and no faults.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self::with_faults(seed, LogFaultConfig::default())
    }

    /// Creates a new simulated log with fault injection enabled.
    #[must_use]
    pub fn with_faults(seed: u64, config: LogFaultConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(LogState {
                segments: BTreeMap::new(),
                next_segment_id: 1,
            })),
            fault_config: Arc::new(Mutex::new(config)),
            seed,
            op_counter: Arc::new(AtomicU64::new(0)),
            in_flight_appends: Arc::new(AtomicU64::new(0)),
            fault_stats: Arc::new(Mutex::new(LogFaultStats::default())),
        }
    }

    /// Returns a reference to the fault configuration for modification.
    pub fn fault_config(&self) -> MutexGuard<'_, LogFaultConfig> {
        self.fault_config.lock().expect("fault config lock poisoned")
    }

    /// Makes the whole log available or unavailable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.fault_config().unavailable = unavailable;
    }

    /// Returns a copy of the current statistics.
    #[must_use]
    pub fn fault_stats(&self) -> LogFaultStats {
        self.fault_stats.lock().expect("fault stats lock poisoned").clone()
    }

    /// Returns the ids of all existing segments in ascending order.
    #[must_use]
    pub fn segment_ids(&self) -> Vec<SegmentId> {
        let state = self.state.lock().expect("log state lock poisoned");
        state.segments.keys().copied().collect()
    }

    /// Returns the number of entries in a segment, if it exists.
    #[must_use]
    pub fn entry_count(&self, segment_id: SegmentId) -> Option<usize> {
        let state = self.state.lock().expect("log state lock poisoned");
        state.segments.get(&segment_id).map(|s| s.entries.len())
    }

    /// Returns true if the segment exists and is closed or fenced.
    #[must_use]
    pub fn is_closed(&self, segment_id: SegmentId) -> bool {
        let state = self.state.lock().expect("log state lock poisoned");
        state.segments.get(&segment_id).is_some_and(|s| s.closed)
    }

    /// Fences a segment: further appends fail with `SegmentClosed`.
    pub fn fence_segment(&self, segment_id: SegmentId) {
        let mut state = self.state.lock().expect("log state lock poisoned");
        if let Some(segment) = state.segments.get_mut(&segment_id) {
            segment.closed = true;
        }
    }

    /// Flips the last byte of the newest entry of a segment.
    pub fn corrupt_last_entry(&self, segment_id: SegmentId) {
        let mut state = self.state.lock().expect("log state lock poisoned");
        if let Some(last) = state
            .segments
            .get_mut(&segment_id)
            .and_then(|s| s.entries.last_mut())
        {
            let mut bytes = last.to_vec();
            if let Some(byte) = bytes.last_mut() {
                *byte ^= 0xFF;
            }
            *last = Bytes::from(bytes);
        }
    }

    /// Drops the newest entry of a segment, simulating a lost write.
    pub fn drop_last_entry(&self, segment_id: SegmentId) {
        let mut state = self.state.lock().expect("log state lock poisoned");
        if let Some(segment) = state.segments.get_mut(&segment_id) {
            segment.entries.pop();
        }
    }

    /// Simple deterministic RNG for fault injection.
    fn should_inject_fault(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        let counter = self.op_counter.fetch_add(1, Ordering::Relaxed);
        let hash = self
            .seed
            .wrapping_add(counter)
            .wrapping_mul(0x5851_f42d_4c95_7f2d);
        #[allow(clippy::cast_precision_loss)]
        let normalized = (hash as f64) / (u64::MAX as f64);
        normalized < rate
    }

    fn record_fault(&self, fault_type: FaultType) {
        let mut stats = self.fault_stats.lock().expect("fault stats lock poisoned");
        match fault_type {
            FaultType::CreateFail => stats.create_failures += 1,
            FaultType::AppendFail => stats.append_failures += 1,
            FaultType::ReadFail => stats.read_failures += 1,
            FaultType::CloseFail => stats.close_failures += 1,
        }
    }

    fn record_op(&self, update: impl FnOnce(&mut LogFaultStats)) {
        let mut stats = self.fault_stats.lock().expect("fault stats lock poisoned");
        stats.total_ops += 1;
        update(&mut stats);
    }

    /// Applies the configured faults for one operation.
    fn check_faults(&self, fault_type: FaultType, operation: &'static str) -> LogResult<()> {
        let mut config = self.fault_config.lock().expect("fault config lock poisoned");
        if config.unavailable {
            drop(config);
            self.record_fault(fault_type);
            return Err(LogError::NotEnoughReplicas { operation });
        }

        let (rate, forced) = match fault_type {
            FaultType::CreateFail => (
                config.create_fail_rate,
                std::mem::take(&mut config.force_create_fail),
            ),
            FaultType::AppendFail => (
                config.append_fail_rate,
                std::mem::take(&mut config.force_append_timeout),
            ),
            FaultType::ReadFail => (config.read_fail_rate, false),
            FaultType::CloseFail => (config.close_fail_rate, false),
        };
        drop(config);

        if forced || self.should_inject_fault(rate) {
            self.record_fault(fault_type);
            return Err(LogError::Timeout { operation });
        }
        Ok(())
    }

    fn append_latency(&self) -> Duration {
        Duration::from_millis(self.fault_config().append_latency_ms)
    }
}

#[async_trait]
#[allow(clippy::significant_drop_tightening)]
impl SegmentLog for SimulatedSegmentLog {
    async fn create_segment(&self) -> LogResult<SegmentHandle> {
        self.check_faults(FaultType::CreateFail, "create_segment")?;

        let mut state = self.state.lock().expect("log state lock poisoned");
        let segment_id = SegmentId::new(state.next_segment_id);
        state.next_segment_id += 1;
        state.segments.insert(segment_id, SegmentState::default());
        drop(state);

        self.record_op(|s| s.creates += 1);
        Ok(SegmentHandle::new(segment_id, true))
    }

    async fn open_segment(&self, segment_id: SegmentId) -> LogResult<SegmentHandle> {
        self.check_faults(FaultType::ReadFail, "open_segment")?;

        let state = self.state.lock().expect("log state lock poisoned");
        if !state.segments.contains_key(&segment_id) {
            return Err(LogError::SegmentNotFound {
                segment_id: segment_id.get(),
            });
        }
        Ok(SegmentHandle::new(segment_id, false))
    }

    async fn append(&self, handle: &SegmentHandle, data: Bytes) -> LogResult<Position> {
        let in_flight = self.in_flight_appends.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut stats = self.fault_stats.lock().expect("fault stats lock poisoned");
            stats.max_in_flight_appends = stats.max_in_flight_appends.max(in_flight);
        }

        let latency = self.append_latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let result = self
            .check_faults(FaultType::AppendFail, "append")
            .and_then(|()| {
                let mut state = self.state.lock().expect("log state lock poisoned");
                let segment_id = handle.segment_id();
                let segment = state
                    .segments
                    .get_mut(&segment_id)
                    .ok_or(LogError::SegmentNotFound {
                        segment_id: segment_id.get(),
                    })?;
                if segment.closed || !handle.is_writable() {
                    return Err(LogError::SegmentClosed {
                        segment_id: segment_id.get(),
                    });
                }
                #[allow(clippy::cast_possible_wrap)]
                let entry_id = segment.entries.len() as i64;
                segment.entries.push(data);
                Ok(Position::new(segment_id, entry_id))
            });

        self.in_flight_appends.fetch_sub(1, Ordering::SeqCst);
        if result.is_ok() {
            self.record_op(|s| s.appends += 1);
        }
        result
    }

    async fn read_last_entry(&self, handle: &SegmentHandle) -> LogResult<Bytes> {
        self.check_faults(FaultType::ReadFail, "read_last_entry")?;

        let state = self.state.lock().expect("log state lock poisoned");
        let segment_id = handle.segment_id();
        let segment = state
            .segments
            .get(&segment_id)
            .ok_or(LogError::SegmentNotFound {
                segment_id: segment_id.get(),
            })?;
        let last = segment
            .entries
            .last()
            .cloned()
            .ok_or(LogError::EmptySegment {
                segment_id: segment_id.get(),
            })?;
        drop(state);

        self.record_op(|s| s.reads += 1);
        Ok(last)
    }

    async fn close_segment(&self, handle: SegmentHandle) -> LogResult<()> {
        self.check_faults(FaultType::CloseFail, "close_segment")?;

        if handle.is_writable() {
            let mut state = self.state.lock().expect("log state lock poisoned");
            if let Some(segment) = state.segments.get_mut(&handle.segment_id()) {
                segment.closed = true;
            }
        }
        self.record_op(|s| s.closes += 1);
        Ok(())
    }

    async fn delete_segment(&self, segment_id: SegmentId) -> LogResult<()> {
        let mut state = self.state.lock().expect("log state lock poisoned");
        state
            .segments
            .remove(&segment_id)
            .map(|_| ())
            .ok_or(LogError::SegmentNotFound {
                segment_id: segment_id.get(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_assigns_sequential_entry_ids() {
        let log = SimulatedSegmentLog::new(42);
        let handle = log.create_segment().await.unwrap();

        let p0 = log.append(&handle, Bytes::from("a")).await.unwrap();
        let p1 = log.append(&handle, Bytes::from("b")).await.unwrap();

        assert_eq!(p0, Position::new(handle.segment_id(), 0));
        assert_eq!(p1, Position::new(handle.segment_id(), 1));
        assert_eq!(log.read_last_entry(&handle).await.unwrap(), Bytes::from("b"));
    }

    #[tokio::test]
    async fn test_segment_ids_increase() {
        let log = SimulatedSegmentLog::new(0);
        let a = log.create_segment().await.unwrap();
        let b = log.create_segment().await.unwrap();
        assert!(b.segment_id() > a.segment_id());
        assert_eq!(log.segment_ids(), vec![a.segment_id(), b.segment_id()]);
    }

    #[tokio::test]
    async fn test_closed_segment_rejects_appends() {
        let log = SimulatedSegmentLog::new(0);
        let handle = log.create_segment().await.unwrap();
        let segment_id = handle.segment_id();
        log.close_segment(handle).await.unwrap();
        assert!(log.is_closed(segment_id));

        let reopened = log.open_segment(segment_id).await.unwrap();
        let err = log.append(&reopened, Bytes::from("x")).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_fenced_segment_is_fatal() {
        let log = SimulatedSegmentLog::new(0);
        let handle = log.create_segment().await.unwrap();
        log.fence_segment(handle.segment_id());

        let err = log.append(&handle, Bytes::from("x")).await.unwrap_err();
        assert!(matches!(err, LogError::SegmentClosed { .. }));
    }

    #[tokio::test]
    async fn test_forced_timeout_is_one_shot() {
        let log = SimulatedSegmentLog::with_faults(
            7,
            LogFaultConfig::none().with_force_append_timeout(),
        );
        let handle = log.create_segment().await.unwrap();

        let err = log.append(&handle, Bytes::from("x")).await.unwrap_err();
        assert!(err.is_transient());
        assert!(log.append(&handle, Bytes::from("x")).await.is_ok());
        assert_eq!(log.fault_stats().append_failures, 1);
    }

    #[tokio::test]
    async fn test_unavailable_fails_everything() {
        let log = SimulatedSegmentLog::new(0);
        let handle = log.create_segment().await.unwrap();
        log.set_unavailable(true);

        assert!(log.create_segment().await.is_err());
        assert!(log.append(&handle, Bytes::from("x")).await.is_err());

        log.set_unavailable(false);
        assert!(log.append(&handle, Bytes::from("x")).await.is_ok());
    }

    #[tokio::test]
    async fn test_empty_and_missing_segments() {
        let log = SimulatedSegmentLog::new(0);
        let handle = log.create_segment().await.unwrap();
        assert!(matches!(
            log.read_last_entry(&handle).await,
            Err(LogError::EmptySegment { .. })
        ));

        log.delete_segment(handle.segment_id()).await.unwrap();
        assert!(matches!(
            log.open_segment(handle.segment_id()).await,
            Err(LogError::SegmentNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_corrupt_last_entry() {
        let log = SimulatedSegmentLog::new(0);
        let handle = log.create_segment().await.unwrap();
        log.append(&handle, Bytes::from_static(&[1, 2, 3])).await.unwrap();
        log.corrupt_last_entry(handle.segment_id());

        let last = log.read_last_entry(&handle).await.unwrap();
        assert_eq!(last.as_ref(), &[1, 2, 0xFC]);
    }

    #[test]
    fn test_fault_rate_is_deterministic() {
        let a = SimulatedSegmentLog::new(99);
        let b = SimulatedSegmentLog::new(99);
        let pattern_a: Vec<bool> = (0..64).map(|_| a.should_inject_fault(0.3)).collect();
        let pattern_b: Vec<bool> = (0..64).map(|_| b.should_inject_fault(0.3)).collect();
        assert_eq!(pattern_a, pattern_b);
    }
}
