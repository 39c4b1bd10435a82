//! Tally Tests - Scenario and property testing for Tally cursors.
//!
//! This crate holds the tests that span more than one Tally crate. Unit
//! tests stay inline in each crate under `#[cfg(test)]`.
//!
//! ## Test Organization
//!
//! - `cursor_tests`: acknowledgment, flush and metric scenarios against
//!   simulated backends, including primary log failure and fallback
//! - `range_properties`: seeded random acknowledgment streams checked
//!   against a set-based model of the tracker
//! - `recovery_tests`: reopen after corruption, lost writes, interrupted
//!   rollovers, and with the file-backed log
//!
//! **Support Modules**:
//! - `scenarios`: regression seeds and shared cursor fixtures
//!
//! ## Naming Conventions
//!
//! - Scenario tests: `test_scenario_<letter>_<behavior>`
//! - Property tests: `test_property_<property>`
//! - Integration tests: `test_<component>_<scenario>`

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod scenarios;

#[cfg(test)]
mod cursor_tests;
#[cfg(test)]
mod range_properties;
