//! Tally Log - Append-only segment log used to persist cursor snapshots.
//!
//! This crate defines the small contract a cursor consumes from the durable
//! log service ([`SegmentLog`]): create, open, append, read the last entry,
//! close and delete a segment. Two implementations are provided:
//!
//! - [`SimulatedSegmentLog`]: In-memory log with deterministic fault injection
//! - [`FileSegmentLog`]: One file per segment on the local filesystem
//!
//! # Design Principles (`TigerStyle`)
//!
//! - **Checksums**: CRC32 on every framed entry to detect corruption
//! - **Explicit limits**: Bounded entry payload sizes
//! - **Classified errors**: Every failure is transient, fatal or corruption
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod entry;
mod error;
mod file;
mod log;
mod simulated;

pub use error::{LogError, LogResult};
pub use file::{FileLogConfig, FileSegmentLog};
pub use log::{SegmentHandle, SegmentLog};
pub use simulated::{LogFaultConfig, LogFaultStats, SimulatedSegmentLog};

/// Log configuration limits.
pub mod limits {
    /// Maximum size of a single entry payload in bytes (128 MB).
    pub const ENTRY_PAYLOAD_SIZE_BYTES_MAX: u32 = 128 * 1024 * 1024;
}
