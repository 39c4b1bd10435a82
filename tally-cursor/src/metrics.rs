//! Per-cursor persistence metrics.
//!
//! Counters live in a prometheus [`Registry`] owned by the
//! [`CursorRegistry`]. Two views read the same counter children, so they
//! always agree:
//!
//! | View | Entry point | Shape |
//! |------|-------------|-------|
//! | Named fields | [`MetricsCollector::generate`] | one [`CounterSet`] per cursor |
//! | Dimensional | [`MetricsCollector::generate_dimensional`] | `target`/`outcome` labels on one series |
//!
//! Both collector views list the same open cursors. The raw exposition
//! ([`CursorMetrics::gather_samples`], [`CursorMetrics::encode_text`]) also
//! keeps the series of closed cursors until they are deleted, so cumulative
//! counters never reset under a scraper.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `tally_cursor_persist_operations_total` | Counter | `topic`, `subscription`, `target`, `outcome` |
//! | `tally_cursor_outgoing_bytes_total` | Counter | `topic`, `subscription` |
//! | `tally_cursor_outgoing_logical_bytes_total` | Counter | `topic`, `subscription` |
//! | `tally_cursor_incoming_bytes_total` | Counter | `topic`, `subscription` |
//! | `tally_cursor_non_contiguous_ranges` | Gauge | `topic`, `subscription` |
//!
//! Series are created lazily, the first time a cursor is acknowledged or has
//! to replay state on open. An idle cursor exports nothing.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, OnceLock};

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::error::{CursorError, CursorResult};
use crate::registry::CursorRegistry;

const PERSIST_OPERATIONS: &str = "tally_cursor_persist_operations_total";
const OUTGOING_BYTES: &str = "tally_cursor_outgoing_bytes_total";
const OUTGOING_LOGICAL_BYTES: &str = "tally_cursor_outgoing_logical_bytes_total";
const INCOMING_BYTES: &str = "tally_cursor_incoming_bytes_total";
const NON_CONTIGUOUS_RANGES: &str = "tally_cursor_non_contiguous_ranges";

// -----------------------------------------------------------------------------
// Labels
// -----------------------------------------------------------------------------

/// Durable backend a snapshot was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PersistTarget {
    /// The cursor's own segment in the append-only log.
    PrimaryLog,
    /// The metadata store fallback.
    MetadataStore,
}

impl PersistTarget {
    /// Returns the `target` label value.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::PrimaryLog => "primary_log",
            Self::MetadataStore => "metadata_store",
        }
    }
}

/// Result of one persistence attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PersistOutcome {
    /// The write was acknowledged by the backend.
    Succeed,
    /// The write failed.
    Fail,
}

impl PersistOutcome {
    /// Returns the `outcome` label value.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Succeed => "succeed",
            Self::Fail => "fail",
        }
    }
}

// -----------------------------------------------------------------------------
// CursorMetrics
// -----------------------------------------------------------------------------

/// Prometheus families for every cursor of one registry.
#[derive(Clone)]
pub struct CursorMetrics {
    registry: Registry,
    persist_operations: IntCounterVec,
    outgoing_bytes: IntCounterVec,
    outgoing_logical_bytes: IntCounterVec,
    incoming_bytes: IntCounterVec,
    non_contiguous_ranges: IntGaugeVec,
}

impl CursorMetrics {
    /// Creates the metric families in a fresh registry.
    ///
    /// # Errors
    ///
    /// Returns an error if a family fails to register.
    pub fn new() -> CursorResult<Self> {
        let registry = Registry::new();

        let persist_operations = IntCounterVec::new(
            Opts::new(PERSIST_OPERATIONS, "Cursor snapshot writes by backend and outcome"),
            &["topic", "subscription", "target", "outcome"],
        )?;
        registry.register(Box::new(persist_operations.clone()))?;

        let outgoing_bytes = IntCounterVec::new(
            Opts::new(OUTGOING_BYTES, "Bytes written to the primary log"),
            &["topic", "subscription"],
        )?;
        registry.register(Box::new(outgoing_bytes.clone()))?;

        let outgoing_logical_bytes = IntCounterVec::new(
            Opts::new(
                OUTGOING_LOGICAL_BYTES,
                "Snapshot bytes written to the primary log before framing",
            ),
            &["topic", "subscription"],
        )?;
        registry.register(Box::new(outgoing_logical_bytes.clone()))?;

        let incoming_bytes = IntCounterVec::new(
            Opts::new(INCOMING_BYTES, "Bytes read while recovering a cursor"),
            &["topic", "subscription"],
        )?;
        registry.register(Box::new(incoming_bytes.clone()))?;

        let non_contiguous_ranges = IntGaugeVec::new(
            Opts::new(
                NON_CONTIGUOUS_RANGES,
                "Acknowledged ranges beyond the mark-delete position",
            ),
            &["topic", "subscription"],
        )?;
        registry.register(Box::new(non_contiguous_ranges.clone()))?;

        Ok(Self {
            registry,
            persist_operations,
            outgoing_bytes,
            outgoing_logical_bytes,
            incoming_bytes,
            non_contiguous_ranges,
        })
    }

    /// Returns the underlying registry, for wiring into an exporter.
    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encodes all series in the prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> CursorResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|_| {
            CursorError::Metrics(prometheus::Error::Msg(
                "text exposition is not UTF-8".to_string(),
            ))
        })
    }

    /// Returns every exported sample with its labels.
    #[must_use]
    pub fn gather_samples(&self) -> Vec<DimensionalSample> {
        let mut samples = Vec::new();
        for family in self.registry.gather() {
            for metric in family.get_metric() {
                let labels = metric
                    .get_label()
                    .iter()
                    .map(|pair| (pair.get_name().to_string(), pair.get_value().to_string()))
                    .collect();
                let value = if metric.has_gauge() {
                    metric.get_gauge().get_value()
                } else {
                    metric.get_counter().get_value()
                };
                samples.push(DimensionalSample {
                    name: family.get_name().to_string(),
                    labels,
                    value,
                });
            }
        }
        samples
    }

    /// Creates (or reattaches to) the series of one cursor.
    fn stats_for(&self, topic: &str, subscription: &str) -> CursorStats {
        let persist = |target: PersistTarget, outcome: PersistOutcome| {
            self.persist_operations.with_label_values(&[
                topic,
                subscription,
                target.label(),
                outcome.label(),
            ])
        };
        let labels = [topic, subscription];
        CursorStats {
            log_succeed: persist(PersistTarget::PrimaryLog, PersistOutcome::Succeed),
            log_errors: persist(PersistTarget::PrimaryLog, PersistOutcome::Fail),
            meta_succeed: persist(PersistTarget::MetadataStore, PersistOutcome::Succeed),
            meta_errors: persist(PersistTarget::MetadataStore, PersistOutcome::Fail),
            write_bytes: self.outgoing_bytes.with_label_values(&labels),
            write_logical_bytes: self.outgoing_logical_bytes.with_label_values(&labels),
            read_bytes: self.incoming_bytes.with_label_values(&labels),
            ranges: self.non_contiguous_ranges.with_label_values(&labels),
        }
    }

    /// Drops every series of one cursor.
    fn remove(&self, topic: &str, subscription: &str) {
        for target in [PersistTarget::PrimaryLog, PersistTarget::MetadataStore] {
            for outcome in [PersistOutcome::Succeed, PersistOutcome::Fail] {
                let _ = self.persist_operations.remove_label_values(&[
                    topic,
                    subscription,
                    target.label(),
                    outcome.label(),
                ]);
            }
        }
        let labels = [topic, subscription];
        let _ = self.outgoing_bytes.remove_label_values(&labels);
        let _ = self.outgoing_logical_bytes.remove_label_values(&labels);
        let _ = self.incoming_bytes.remove_label_values(&labels);
        let _ = self.non_contiguous_ranges.remove_label_values(&labels);
    }
}

impl fmt::Debug for CursorMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorMetrics").finish_non_exhaustive()
    }
}

/// One exported sample of the dimensional view.
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionalSample {
    /// Metric family name.
    pub name: String,
    /// Label name to value.
    pub labels: BTreeMap<String, String>,
    /// Current value.
    pub value: f64,
}

impl DimensionalSample {
    /// Returns the value of a label, if present.
    #[must_use]
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }
}

// -----------------------------------------------------------------------------
// CursorStats
// -----------------------------------------------------------------------------

/// Handles to the series of one cursor.
#[derive(Clone)]
pub struct CursorStats {
    log_succeed: IntCounter,
    log_errors: IntCounter,
    meta_succeed: IntCounter,
    meta_errors: IntCounter,
    write_bytes: IntCounter,
    write_logical_bytes: IntCounter,
    read_bytes: IntCounter,
    ranges: IntGauge,
}

impl CursorStats {
    /// Counts one persistence attempt.
    pub fn record_persist(&self, target: PersistTarget, outcome: PersistOutcome) {
        let counter = match (target, outcome) {
            (PersistTarget::PrimaryLog, PersistOutcome::Succeed) => &self.log_succeed,
            (PersistTarget::PrimaryLog, PersistOutcome::Fail) => &self.log_errors,
            (PersistTarget::MetadataStore, PersistOutcome::Succeed) => &self.meta_succeed,
            (PersistTarget::MetadataStore, PersistOutcome::Fail) => &self.meta_errors,
        };
        counter.inc();
    }

    /// Counts bytes placed on the primary log and their unframed size.
    pub fn record_write(&self, written: u64, logical: u64) {
        self.write_bytes.inc_by(written);
        self.write_logical_bytes.inc_by(logical);
    }

    /// Counts bytes read from either backend during recovery.
    pub fn record_read(&self, bytes: u64) {
        self.read_bytes.inc_by(bytes);
    }

    /// Updates the fragmentation gauge.
    pub fn set_ranges(&self, ranges: usize) {
        self.ranges.set(i64::try_from(ranges).unwrap_or(i64::MAX));
    }

    fn counter_set(&self, topic: &str, subscription: &str) -> CounterSet {
        CounterSet {
            topic: topic.to_string(),
            subscription: subscription.to_string(),
            persist_log_succeed: self.log_succeed.get(),
            persist_log_errors: self.log_errors.get(),
            persist_metadata_succeed: self.meta_succeed.get(),
            persist_metadata_errors: self.meta_errors.get(),
            non_contiguous_deleted_ranges: u64::try_from(self.ranges.get()).unwrap_or(0),
            write_log_size: self.write_bytes.get(),
            write_log_logical_size: self.write_logical_bytes.get(),
            read_log_size: self.read_bytes.get(),
        }
    }
}

impl fmt::Debug for CursorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorStats")
            .field("persist_log_succeed", &self.log_succeed.get())
            .field("persist_log_errors", &self.log_errors.get())
            .field("ranges", &self.ranges.get())
            .finish_non_exhaustive()
    }
}

/// Lazily materialized series of one cursor.
#[derive(Debug)]
pub(crate) struct StatsSlot {
    metrics: Arc<CursorMetrics>,
    topic: String,
    subscription: String,
    stats: OnceLock<CursorStats>,
}

impl StatsSlot {
    pub(crate) fn new(metrics: Arc<CursorMetrics>, topic: &str, subscription: &str) -> Self {
        Self {
            metrics,
            topic: topic.to_string(),
            subscription: subscription.to_string(),
            stats: OnceLock::new(),
        }
    }

    /// Returns the series, creating them on first use.
    pub(crate) fn materialize(&self) -> &CursorStats {
        self.stats
            .get_or_init(|| self.metrics.stats_for(&self.topic, &self.subscription))
    }

    pub(crate) fn get(&self) -> Option<&CursorStats> {
        self.stats.get()
    }

    /// Returns the named-field record, all zero if never materialized.
    pub(crate) fn counter_set(&self) -> CounterSet {
        self.get().map_or_else(
            || CounterSet {
                topic: self.topic.clone(),
                subscription: self.subscription.clone(),
                ..CounterSet::default()
            },
            |stats| stats.counter_set(&self.topic, &self.subscription),
        )
    }

    /// Drops the cursor's series from the registry.
    pub(crate) fn remove(&self) {
        if self.get().is_some() {
            self.metrics.remove(&self.topic, &self.subscription);
        }
    }
}

// -----------------------------------------------------------------------------
// CounterSet
// -----------------------------------------------------------------------------

/// Named-field counters of one cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct CounterSet {
    /// Topic name.
    pub topic: String,
    /// Subscription name.
    pub subscription: String,
    /// Successful writes to the primary log.
    pub persist_log_succeed: u64,
    /// Failed writes to the primary log, including failed rollovers.
    pub persist_log_errors: u64,
    /// Successful fallback writes to the metadata store.
    pub persist_metadata_succeed: u64,
    /// Failed fallback writes to the metadata store.
    pub persist_metadata_errors: u64,
    /// Ranges currently tracked beyond the mark-delete position.
    pub non_contiguous_deleted_ranges: u64,
    /// Bytes written to the primary log.
    pub write_log_size: u64,
    /// Snapshot bytes written to the primary log before framing.
    pub write_log_logical_size: u64,
    /// Bytes read while recovering.
    pub read_log_size: u64,
}

impl CounterSet {
    /// Returns the counters under their exported names.
    #[must_use]
    pub fn fields(&self) -> [(&'static str, u64); 8] {
        [
            ("tally_cursor_persist_log_succeed", self.persist_log_succeed),
            ("tally_cursor_persist_log_errors", self.persist_log_errors),
            (
                "tally_cursor_persist_metadata_succeed",
                self.persist_metadata_succeed,
            ),
            (
                "tally_cursor_persist_metadata_errors",
                self.persist_metadata_errors,
            ),
            (
                "tally_cursor_non_contiguous_deleted_ranges",
                self.non_contiguous_deleted_ranges,
            ),
            ("tally_cursor_write_log_size", self.write_log_size),
            (
                "tally_cursor_write_log_logical_size",
                self.write_log_logical_size,
            ),
            ("tally_cursor_read_log_size", self.read_log_size),
        ]
    }
}

// -----------------------------------------------------------------------------
// MetricsCollector
// -----------------------------------------------------------------------------

/// Produces the named-field view for every materialized cursor of a registry.
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    registry: Arc<CursorRegistry>,
}

impl MetricsCollector {
    /// Creates a collector over `registry`.
    #[must_use]
    pub const fn new(registry: Arc<CursorRegistry>) -> Self {
        Self { registry }
    }

    /// Returns one record per materialized cursor, ordered by topic and
    /// subscription. Empty until some cursor has been touched.
    #[must_use]
    pub fn generate(&self) -> Vec<CounterSet> {
        self.registry
            .managers()
            .iter()
            .filter(|manager| manager.stats().get().is_some())
            .map(|manager| manager.stats().counter_set())
            .collect()
    }

    /// Returns the dimensional view of the same counters, restricted to the
    /// cursors [`Self::generate`] reports.
    #[must_use]
    pub fn generate_dimensional(&self) -> Vec<DimensionalSample> {
        let open: BTreeSet<(String, String)> = self
            .registry
            .managers()
            .iter()
            .map(|manager| {
                let id = manager.id();
                (id.topic().to_string(), id.subscription().to_string())
            })
            .collect();
        self.registry
            .metrics()
            .gather_samples()
            .into_iter()
            .filter(|sample| match (sample.label("topic"), sample.label("subscription")) {
                (Some(topic), Some(subscription)) => {
                    open.contains(&(topic.to_string(), subscription.to_string()))
                }
                _ => false,
            })
            .collect()
    }
}
