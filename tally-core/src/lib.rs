//! Tally Core - Strongly-typed identifiers, positions and limits for Tally.
//!
//! This crate provides the vocabulary shared by every Tally crate: the
//! [`Position`] of an entry in the append-only log, typed identifiers for
//! segments, write sequences and metadata versions, and the explicit
//! [`Limits`] that bound every persisted structure.
//!
//! # Design Principles (TigerStyle)
//!
//! - **Strongly-typed IDs**: Prevent mixing up a `SegmentId` with a `Version`
//! - **Explicit limits**: Every persisted collection has a bounded maximum
//! - **Explicit types**: Use u32/u64/i64, not usize, for anything persisted
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod limits;
mod types;

pub use error::{Error, Result};
pub use limits::Limits;
pub use types::{Position, SegmentId, Version, WriteSeq};
