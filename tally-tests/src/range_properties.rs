//! Seeded property tests for acknowledgment tracking.
//!
//! A `BTreeSet` of acknowledged entry ids is the model. Every random
//! operation is applied to both the model and a `RangeTracker`, and the
//! tracker must agree with the model after each step:
//! - MarkDeleteSupremum: mark-delete is the end of the acknowledged prefix
//! - RangesAreRuns: ranges are exactly the maximal runs beyond the prefix
//! - Membership: `is_acknowledged` matches the model for every position

// Test-specific lint allowances.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]

use std::collections::BTreeSet;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tally_core::{Limits, Position};
use tally_cursor::{CursorConfig, CursorSnapshot, RangeTracker, RecordFormat};
use tally_log::LogFaultConfig;

use crate::scenarios::seeds::REGRESSION_SEEDS;
use crate::scenarios::{entry, msg, Fixture};

/// Entries per segment in the random streams.
const ENTRIES: i64 = 64;

/// Operations per seed.
const OPS_PER_SEED: usize = 500;

// ============================================================================
// Model
// ============================================================================

/// Acknowledged entries of segment 0.
#[derive(Debug, Default)]
struct Model {
    acked: BTreeSet<i64>,
}

impl Model {
    fn add(&mut self, entry_id: i64) {
        self.acked.insert(entry_id);
    }

    fn mark_delete_to(&mut self, entry_id: i64) {
        self.acked.extend(0..=entry_id);
    }

    /// End of the acknowledged prefix, -1 if entry 0 is outstanding.
    fn mark_delete(&self) -> i64 {
        let mut md = -1;
        while self.acked.contains(&(md + 1)) {
            md += 1;
        }
        md
    }

    /// Maximal runs of acknowledged entries beyond the prefix, as
    /// `(exclusive lower, inclusive upper)`.
    fn runs(&self) -> Vec<(i64, i64)> {
        let md = self.mark_delete();
        let mut runs: Vec<(i64, i64)> = Vec::new();
        for &id in self.acked.range(md + 1..) {
            match runs.last_mut() {
                Some((_, upper)) if *upper + 1 == id => *upper = id,
                _ => runs.push((id - 1, id)),
            }
        }
        runs
    }
}

fn check_against_model(seed: u64, step: usize, tracker: &RangeTracker, model: &Model) {
    assert_eq!(
        tracker.mark_delete(),
        msg(model.mark_delete()),
        "seed {} step {}: mark-delete",
        seed,
        step
    );

    let ranges: Vec<(i64, i64)> = tracker
        .ranges()
        .map(|r| (r.lower().entry_id(), r.upper().entry_id()))
        .collect();
    assert_eq!(ranges, model.runs(), "seed {} step {}: ranges", seed, step);

    for id in 0..ENTRIES {
        assert_eq!(
            tracker.is_acknowledged(msg(id)),
            model.acked.contains(&id),
            "seed {} step {}: membership of {}",
            seed,
            step,
            id
        );
    }
    assert!(tracker.snapshot().validate().is_ok());
}

fn random_tracker(rng: &mut StdRng, ops: usize) -> RangeTracker {
    let mut tracker = RangeTracker::new(Position::default());
    for _ in 0..ops {
        let segment = rng.gen_range(0..3);
        let id = rng.gen_range(0..ENTRIES);
        if rng.gen_bool(0.05) {
            tracker.mark_delete_to(entry(segment, id));
        } else {
            tracker.add(entry(segment, id));
        }
    }
    tracker
}

// ============================================================================
// Tracker Properties
// ============================================================================

#[test]
fn test_property_tracker_matches_model() {
    for &seed in REGRESSION_SEEDS {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut tracker = RangeTracker::new(Position::default());
        let mut model = Model::default();

        for step in 0..OPS_PER_SEED {
            let id = rng.gen_range(0..ENTRIES);
            if rng.gen_bool(0.03) {
                tracker.mark_delete_to(msg(id));
                model.mark_delete_to(id);
            } else {
                tracker.add(msg(id));
                model.add(id);
            }
            check_against_model(seed, step, &tracker, &model);
        }
    }
}

#[test]
fn test_property_add_is_idempotent() {
    for &seed in REGRESSION_SEEDS {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut tracker = random_tracker(&mut rng, 200);

        for _ in 0..100 {
            let position = entry(rng.gen_range(0..3), rng.gen_range(0..ENTRIES));
            if tracker.is_acknowledged(position) {
                let before = tracker.clone();
                assert!(!tracker.add(position), "seed {}: {}", seed, position);
                assert_eq!(tracker, before, "seed {}: {}", seed, position);
            }
        }
    }
}

#[test]
fn test_property_order_independent() {
    for &seed in REGRESSION_SEEDS {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut positions: Vec<Position> = (0..ENTRIES)
            .filter(|_| rng.gen_bool(0.6))
            .map(msg)
            .collect();

        let mut in_order = RangeTracker::new(Position::default());
        for &position in &positions {
            in_order.add(position);
        }

        positions.shuffle(&mut rng);
        let mut shuffled = RangeTracker::new(Position::default());
        for &position in &positions {
            shuffled.add(position);
        }

        assert_eq!(in_order.snapshot(), shuffled.snapshot(), "seed {}", seed);
    }
}

#[test]
fn test_property_ranges_never_span_segments() {
    for &seed in REGRESSION_SEEDS {
        let mut rng = StdRng::seed_from_u64(seed);
        let tracker = random_tracker(&mut rng, OPS_PER_SEED);

        let snapshot = tracker.snapshot();
        assert!(snapshot.validate().is_ok(), "seed {}: {:?}", seed, snapshot);
        for range in &snapshot.ranges {
            assert_eq!(range.lower().segment_id(), range.upper().segment_id());
            assert!(range.lower() > tracker.mark_delete());
        }
    }
}

#[test]
fn test_property_encodings_preserve_state() {
    let limits = Limits::default();
    for &seed in REGRESSION_SEEDS {
        let mut rng = StdRng::seed_from_u64(seed);
        let tracker = random_tracker(&mut rng, OPS_PER_SEED);

        let decoded = RangeTracker::decode(&tracker.encode(), &limits).unwrap();
        assert_eq!(decoded, tracker, "seed {}: compact", seed);

        let snapshot = CursorSnapshot {
            ranges: tracker.snapshot(),
            properties: [("seed".to_string(), seed.to_string())].into(),
        };
        for format in [RecordFormat::Fixed, RecordFormat::Compact] {
            let bytes = snapshot.encode(format, u32::MAX);
            let decoded = CursorSnapshot::decode(&bytes, &limits).unwrap();
            assert_eq!(decoded, snapshot, "seed {}: {:?}", seed, format);
        }
    }
}

// ============================================================================
// Persistence Properties
// ============================================================================

#[tokio::test]
async fn test_property_persisted_mark_delete_is_monotonic() {
    for &seed in REGRESSION_SEEDS {
        let fixture = Fixture::with_log_faults(seed, LogFaultConfig::flaky()).unwrap();
        let config = CursorConfig {
            persist_after_acks: 8,
            max_entries_per_segment: 16,
            ..CursorConfig::for_testing()
        };
        let (cursor, _) = fixture.open("billing", config).await.unwrap();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut last = None;

        for round in 0..20 {
            for _ in 0..rng.gen_range(1..20) {
                cursor.add_acknowledgment(msg(rng.gen_range(0..ENTRIES * 4)));
            }
            cursor.flush().await.unwrap();

            let persisted = cursor.persisted_mark_delete_position();
            assert!(
                persisted >= last,
                "seed {} round {}: {:?} < {:?}",
                seed,
                round,
                persisted,
                last
            );
            if let Some(md) = persisted {
                assert!(md <= cursor.get_mark_delete_position());
            }
            last = persisted;
        }

        // The metadata store never fails here, so nothing stays dirty.
        assert!(!cursor.has_unpersisted_changes(), "seed {}", seed);
        let final_md = cursor.get_mark_delete_position();
        let final_ranges = cursor.get_number_of_non_contiguous_deleted_ranges();

        *fixture.log.fault_config() = LogFaultConfig::none();
        cursor.close().await.unwrap();

        let restarted = fixture.restart().unwrap();
        let (cursor, outcome) = restarted
            .open("billing", CursorConfig::for_testing())
            .await
            .unwrap();
        assert!(outcome.is_recovered(), "seed {}", seed);
        assert_eq!(cursor.get_mark_delete_position(), final_md, "seed {}", seed);
        assert_eq!(
            cursor.get_number_of_non_contiguous_deleted_ranges(),
            final_ranges,
            "seed {}",
            seed
        );
        cursor.close().await.unwrap();
    }
}
