//! Tally Meta - Strongly consistent small-object store for cursor state.
//!
//! Cursors use the metadata store for two things: the manifest naming the
//! current primary segment, and the fallback snapshot written when the
//! primary log is unavailable. Every write is a compare-and-set against the
//! version the writer last observed.
//!
//! # Implementations
//!
//! - [`InMemoryMetadataStore`]: For testing, with deterministic fault injection
//! - [`FileMetadataStore`]: One file per path on the local filesystem

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod file;
mod memory;
mod store;

pub use error::{MetaError, MetaResult};
pub use file::FileMetadataStore;
pub use memory::{InMemoryMetadataStore, MetaFaultConfig, MetaStats};
pub use store::{MetadataStore, Versioned};
