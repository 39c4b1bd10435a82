//! Persistent consumption cursors for Tally.
//!
//! A cursor durably records how far a subscription has acknowledged an
//! append-only log, including acknowledgments that arrive out of order.
//!
//! # Overview
//!
//! - [`RangeTracker`]: the mark-delete position plus disjoint acknowledged
//!   ranges beyond it. Adjacent ranges merge; a range reaching the
//!   mark-delete position is absorbed into it.
//! - Persistence: a single-flight write protocol. Snapshots go to the
//!   cursor's primary segment, roll over to a fresh segment on failure or
//!   when the segment is full, and fall back to the metadata store when the
//!   log is unavailable. At most one write per cursor is ever in flight.
//! - [`RecoveryLoader`]: on open, picks the newest valid snapshot from both
//!   backends and reports [`OpenOutcome::Created`] when there is none.
//! - [`MetricsCollector`]: named-field [`CounterSet`]s per cursor, backed by
//!   the same prometheus series exported through [`CursorMetrics`].
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tally_cursor::{CursorBackends, CursorConfig, CursorId, CursorRegistry, ManagedCursor};
//! use tally_log::SimulatedSegmentLog;
//! use tally_meta::InMemoryMetadataStore;
//!
//! let registry = Arc::new(CursorRegistry::new()?);
//! let backends = CursorBackends::new(
//!     Arc::new(SimulatedSegmentLog::new(42)),
//!     Arc::new(InMemoryMetadataStore::new()),
//! );
//! let (cursor, outcome) = ManagedCursor::open(
//!     CursorId::new("orders", "billing")?,
//!     backends,
//!     CursorConfig::default(),
//!     &registry,
//! ).await?;
//!
//! // Acknowledgments never wait on I/O.
//! cursor.add_acknowledgment(position);
//!
//! // Periodic persistence of cursors below the acknowledgment threshold.
//! let timer = registry.spawn_flush_timer(CursorConfig::default().flush_interval());
//!
//! cursor.close().await?;
//! timer.shutdown().await;
//! ```
//!
//! # Testing
//!
//! Both backends have simulated implementations with deterministic fault
//! injection (`tally_log::SimulatedSegmentLog`,
//! `tally_meta::InMemoryMetadataStore`).

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
// Allow these for cleaner code in this crate.
#![allow(clippy::module_name_repetitions)]

mod config;
mod cursor;
mod error;
mod metrics;
mod persist;
mod range;
mod record;
mod recovery;
mod registry;

// Re-export public API.
pub use config::{ConfigError, CursorConfig, RecordFormat};
pub use cursor::{CursorBackends, CursorId, ManagedCursor, CURSOR_NAME_BYTES_MAX};
pub use error::{CursorError, CursorResult};
pub use metrics::{
    CounterSet, CursorMetrics, CursorStats, DimensionalSample, MetricsCollector, PersistOutcome,
    PersistTarget,
};
pub use persist::FlushState;
pub use range::{DeletedRange, RangeSnapshot, RangeTracker};
pub use record::{
    CursorSnapshot, Envelope, ENVELOPE_HEADER_SIZE, ENVELOPE_MAGIC, FORMAT_VERSION_COMPACT,
    FORMAT_VERSION_FIXED,
};
pub use recovery::{OpenOutcome, Recovery, RecoveryLoader, RecoverySource};
pub use registry::{CursorRegistry, FlushTimer};
