//! Cursor acknowledgment, persistence and metric scenarios.
//!
//! Every scenario runs a real `ManagedCursor` against simulated backends and
//! observes it only through the public surface: the cursor's queries, the
//! `MetricsCollector` views and the backends' own bookkeeping.

// Test-specific lint allowances.
#![allow(clippy::too_many_lines)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::float_cmp)]

use std::time::Duration;

use tally_core::Position;
use tally_cursor::{
    CounterSet, CursorConfig, CursorError, FlushState, OpenOutcome, PersistOutcome, PersistTarget,
    RecoverySource,
};
use tally_log::LogFaultConfig;

use crate::scenarios::configs::{manual_flush, small_segments};
use crate::scenarios::seeds::REGRESSION_SEEDS;
use crate::scenarios::{msg, Fixture, TOPIC};

/// Waits until `done` holds, polling for up to a second.
async fn eventually(mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    done()
}

fn only(records: &[CounterSet]) -> &CounterSet {
    assert_eq!(records.len(), 1, "expected one record, got {:?}", records);
    &records[0]
}

// ============================================================================
// Metric Scenarios
// ============================================================================

#[tokio::test]
async fn test_scenario_a_untouched_cursor_reports_nothing() {
    let fixture = Fixture::new(42).unwrap();
    let (cursor, outcome) = fixture.open("billing", manual_flush()).await.unwrap();

    assert_eq!(outcome, OpenOutcome::Created);
    assert!(fixture.collector().generate().is_empty());
    assert!(fixture.collector().generate_dimensional().is_empty());

    cursor.close().await.unwrap();
}

#[tokio::test]
async fn test_scenario_b_first_ack_materializes_zero_record() {
    let fixture = Fixture::new(42).unwrap();
    let (cursor, _) = fixture.open("billing", manual_flush()).await.unwrap();

    cursor.add_acknowledgment(msg(0));

    let records = fixture.collector().generate();
    let record = only(&records);
    assert_eq!(record.topic, TOPIC);
    assert_eq!(record.subscription, "billing");
    assert!(
        record.fields().iter().all(|(_, value)| *value == 0),
        "expected all zero, got {:?}",
        record
    );

    cursor.close().await.unwrap();
}

#[tokio::test]
async fn test_scenario_c_gap_persists_disjoint_range() {
    let fixture = Fixture::new(42).unwrap();
    let (cursor, _) = fixture.open("billing", manual_flush()).await.unwrap();

    cursor.add_acknowledgments((0..10).map(msg));
    cursor.add_acknowledgments((21..30).map(msg));
    cursor.flush().await.unwrap();

    let records = fixture.collector().generate();
    let record = only(&records);
    assert!(record.persist_log_succeed > 0);
    assert!(record.non_contiguous_deleted_ranges > 0);
    assert_eq!(cursor.get_mark_delete_position(), msg(9));
    assert_eq!(cursor.get_number_of_non_contiguous_deleted_ranges(), 1);
    assert!(!cursor.is_acknowledged(msg(15)));
    assert!(cursor.is_acknowledged(msg(25)));

    cursor.close().await.unwrap();
}

#[tokio::test]
async fn test_scenario_d_filling_gap_collapses_ranges() {
    let fixture = Fixture::new(42).unwrap();
    let (cursor, _) = fixture.open("billing", manual_flush()).await.unwrap();

    cursor.add_acknowledgments((0..10).map(msg));
    cursor.add_acknowledgments((21..30).map(msg));
    cursor.flush().await.unwrap();

    cursor.add_acknowledgments((10..21).map(msg));
    cursor.flush().await.unwrap();

    let records = fixture.collector().generate();
    let record = only(&records);
    assert_eq!(record.non_contiguous_deleted_ranges, 0);
    assert_eq!(record.persist_log_succeed, 2);
    assert_eq!(cursor.get_mark_delete_position(), msg(29));
    assert_eq!(cursor.persisted_mark_delete_position(), Some(msg(29)));

    cursor.close().await.unwrap();
}

#[tokio::test]
async fn test_scenario_e_log_failure_falls_back_to_metadata_store() {
    let fixture = Fixture::new(42).unwrap();
    let (cursor, _) = fixture.open("billing", manual_flush()).await.unwrap();

    cursor.add_acknowledgments((0..5).map(msg));
    cursor.flush().await.unwrap();

    fixture.log.set_unavailable(true);
    cursor.add_acknowledgments((5..10).map(msg));
    cursor.flush().await.unwrap();

    let record = cursor.snapshot_metrics();
    assert_eq!(record.persist_log_succeed, 1);
    assert!(record.persist_log_errors > 0);
    assert!(record.persist_metadata_succeed > 0);
    assert_eq!(record.persist_metadata_errors, 0);
    assert!(!cursor.has_unpersisted_changes());
    assert_eq!(cursor.persisted_mark_delete_position(), Some(msg(9)));

    // Once the log is back, the next flush rolls over to a fresh segment.
    fixture.log.set_unavailable(false);
    cursor.add_acknowledgment(msg(10));
    cursor.flush().await.unwrap();
    assert_eq!(cursor.snapshot_metrics().persist_log_succeed, 2);

    cursor.close().await.unwrap();
}

#[tokio::test]
async fn test_scenario_f_cursors_report_independently() {
    let fixture = Fixture::new(42).unwrap();
    let (alpha, _) = fixture.open("alpha", manual_flush()).await.unwrap();
    let (beta, _) = fixture.open("beta", manual_flush()).await.unwrap();

    alpha.add_acknowledgments((0..3).map(msg));
    beta.add_acknowledgments((0..7).map(msg));
    alpha.flush().await.unwrap();
    beta.flush().await.unwrap();

    let records = fixture.collector().generate();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].subscription, "alpha");
    assert_eq!(records[1].subscription, "beta");
    for record in &records {
        assert!(record.write_log_size > 0, "{:?}", record);
        assert!(record.write_log_logical_size > 0, "{:?}", record);
        assert!(record.write_log_size > record.write_log_logical_size);
        assert_eq!(record.read_log_size, 0);
    }

    // Only the cursor that replays durable state counts read bytes.
    beta.close().await.unwrap();
    let (beta, outcome) = fixture.open("beta", manual_flush()).await.unwrap();
    assert!(outcome.is_recovered());
    assert_eq!(beta.get_mark_delete_position(), msg(6));

    let records = fixture.collector().generate();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].read_log_size, 0);
    assert!(records[1].read_log_size > 0);

    alpha.close().await.unwrap();
    beta.close().await.unwrap();
}

#[tokio::test]
async fn test_named_and_dimensional_views_agree() {
    let fixture = Fixture::new(7).unwrap();
    let (cursor, _) = fixture.open("billing", manual_flush()).await.unwrap();

    cursor.add_acknowledgments([msg(0), msg(1), msg(5)]);
    cursor.flush().await.unwrap();

    let record = cursor.snapshot_metrics();
    let samples = fixture.collector().generate_dimensional();
    let value = |name: &str, target: Option<PersistTarget>, outcome: Option<PersistOutcome>| {
        samples
            .iter()
            .find(|s| {
                s.name == name
                    && s.label("subscription") == Some("billing")
                    && target.map_or(true, |t| s.label("target") == Some(t.label()))
                    && outcome.map_or(true, |o| s.label("outcome") == Some(o.label()))
            })
            .map(|s| s.value)
    };

    assert_eq!(
        value(
            "tally_cursor_persist_operations_total",
            Some(PersistTarget::PrimaryLog),
            Some(PersistOutcome::Succeed)
        ),
        Some(record.persist_log_succeed as f64)
    );
    assert_eq!(
        value("tally_cursor_outgoing_bytes_total", None, None),
        Some(record.write_log_size as f64)
    );
    assert_eq!(
        value("tally_cursor_outgoing_logical_bytes_total", None, None),
        Some(record.write_log_logical_size as f64)
    );
    assert_eq!(
        value("tally_cursor_non_contiguous_ranges", None, None),
        Some(1.0)
    );

    let text = fixture.registry.metrics().encode_text().unwrap();
    assert!(text.contains("tally_cursor_persist_operations_total"));
    assert!(text.contains("subscription=\"billing\""));

    cursor.close().await.unwrap();
}

// ============================================================================
// Write Protocol
// ============================================================================

#[tokio::test]
async fn test_single_flight_coalesces_acknowledgment_bursts() {
    for &seed in REGRESSION_SEEDS {
        let fixture =
            Fixture::with_log_faults(seed, LogFaultConfig::none().with_append_latency_ms(5))
                .unwrap();
        let (cursor, _) = fixture
            .open("billing", CursorConfig::for_testing())
            .await
            .unwrap();

        for i in 0..50 {
            cursor.add_acknowledgment(msg(i));
        }
        assert_ne!(cursor.flush_state(), FlushState::Idle);
        cursor.flush().await.unwrap();

        let stats = fixture.log.fault_stats();
        assert_eq!(stats.max_in_flight_appends, 1, "seed {}", seed);
        assert!(stats.appends < 50, "seed {}: {} appends", seed, stats.appends);
        assert_eq!(cursor.persisted_mark_delete_position(), Some(msg(49)));
        assert_eq!(cursor.flush_state(), FlushState::Idle);

        cursor.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_threshold_triggers_flush_without_explicit_call() {
    let fixture = Fixture::new(3).unwrap();
    let config = CursorConfig {
        persist_after_acks: 10,
        ..CursorConfig::for_testing()
    };
    let (cursor, _) = fixture.open("billing", config).await.unwrap();

    cursor.add_acknowledgments((0..9).map(msg));
    tokio::task::yield_now().await;
    assert_eq!(cursor.snapshot_metrics().persist_log_succeed, 0);

    cursor.add_acknowledgment(msg(9));
    assert!(eventually(|| cursor.snapshot_metrics().persist_log_succeed == 1).await);
    assert!(eventually(|| !cursor.has_unpersisted_changes()).await);

    cursor.close().await.unwrap();
}

#[tokio::test]
async fn test_segment_rollover_keeps_latest_state_recoverable() {
    let fixture = Fixture::new(11).unwrap();
    let (cursor, _) = fixture.open("billing", small_segments(2)).await.unwrap();

    for i in 0..10 {
        cursor.add_acknowledgment(msg(i));
        cursor.flush().await.unwrap();
    }
    assert_eq!(cursor.snapshot_metrics().persist_log_succeed, 10);
    cursor.close().await.unwrap();

    // Retired segments are deleted; at most the current and previous remain.
    assert!(eventually(|| fixture.log.segment_ids().len() <= 2).await);

    let restarted = fixture.restart().unwrap();
    let (cursor, outcome) = restarted.open("billing", manual_flush()).await.unwrap();
    assert_eq!(
        outcome,
        OpenOutcome::Recovered {
            source: RecoverySource::PrimaryLog
        }
    );
    assert_eq!(cursor.get_mark_delete_position(), msg(9));
    cursor.close().await.unwrap();
}

#[tokio::test]
async fn test_both_backends_down_keeps_changes_dirty() {
    let fixture = Fixture::new(5).unwrap();
    let (cursor, _) = fixture.open("billing", manual_flush()).await.unwrap();

    cursor.add_acknowledgments((0..3).map(msg));
    cursor.flush().await.unwrap();

    fixture.log.set_unavailable(true);
    fixture.meta.set_unavailable(true);
    cursor.add_acknowledgments((3..6).map(msg));
    cursor.flush().await.unwrap();

    let record = cursor.snapshot_metrics();
    assert!(record.persist_log_errors > 0);
    assert!(record.persist_metadata_errors > 0);
    assert!(cursor.has_unpersisted_changes());
    assert_eq!(cursor.persisted_mark_delete_position(), Some(msg(2)));
    // Acknowledgments still land in memory.
    assert_eq!(cursor.get_mark_delete_position(), msg(5));

    fixture.log.set_unavailable(false);
    fixture.meta.set_unavailable(false);
    cursor.flush().await.unwrap();
    assert!(!cursor.has_unpersisted_changes());
    assert_eq!(cursor.persisted_mark_delete_position(), Some(msg(5)));

    cursor.close().await.unwrap();
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_close_writes_final_snapshot() {
    let fixture = Fixture::new(21).unwrap();
    let (cursor, _) = fixture.open("billing", manual_flush()).await.unwrap();

    cursor.add_acknowledgments((0..4).map(msg));
    cursor.set_property("owner", "team-a").unwrap();
    cursor.close().await.unwrap();
    assert!(fixture.registry.is_empty());

    let restarted = fixture.restart().unwrap();
    let (cursor, outcome) = restarted.open("billing", manual_flush()).await.unwrap();
    assert!(outcome.is_recovered());
    assert_eq!(cursor.get_mark_delete_position(), msg(3));
    assert_eq!(
        cursor.properties().get("owner").map(String::as_str),
        Some("team-a")
    );
    cursor.close().await.unwrap();
}

#[tokio::test]
async fn test_dropped_cursor_flushes_in_background() {
    let fixture = Fixture::new(22).unwrap();
    let (cursor, _) = fixture.open("billing", manual_flush()).await.unwrap();

    cursor.add_acknowledgments((0..8).map(msg));
    drop(cursor);
    assert!(fixture.registry.is_empty());
    assert!(eventually(|| fixture.meta.raw("/cursors/orders/billing").is_some()).await);

    let restarted = fixture.restart().unwrap();
    let (cursor, _) = restarted.open("billing", manual_flush()).await.unwrap();
    assert_eq!(cursor.get_mark_delete_position(), msg(7));
    cursor.close().await.unwrap();
}

#[tokio::test]
async fn test_open_twice_is_rejected() {
    let fixture = Fixture::new(23).unwrap();
    let (cursor, _) = fixture.open("billing", manual_flush()).await.unwrap();

    let err = fixture.open("billing", manual_flush()).await.unwrap_err();
    assert!(matches!(err, CursorError::AlreadyOpen { .. }), "{:?}", err);

    cursor.close().await.unwrap();
    let (cursor, _) = fixture.open("billing", manual_flush()).await.unwrap();
    cursor.close().await.unwrap();
}

#[tokio::test]
async fn test_close_keeps_metric_series() {
    let fixture = Fixture::new(24).unwrap();
    let (cursor, _) = fixture.open("billing", manual_flush()).await.unwrap();

    cursor.add_acknowledgment(msg(0));
    cursor.flush().await.unwrap();
    cursor.close().await.unwrap();

    let samples = fixture.registry.metrics().gather_samples();
    assert!(samples
        .iter()
        .any(|s| s.label("subscription") == Some("billing")));
    // Both collector views enumerate only open cursors.
    assert!(fixture.collector().generate().is_empty());
    assert!(fixture.collector().generate_dimensional().is_empty());
}

#[tokio::test]
async fn test_collector_views_list_the_same_cursors() {
    let fixture = Fixture::new(27).unwrap();
    let (billing, _) = fixture.open("billing", manual_flush()).await.unwrap();
    let (audit, _) = fixture.open("audit", manual_flush()).await.unwrap();
    billing.add_acknowledgment(msg(0));
    audit.add_acknowledgment(msg(0));
    billing.flush().await.unwrap();
    audit.flush().await.unwrap();
    billing.close().await.unwrap();

    let collector = fixture.collector();
    let named: Vec<_> = collector
        .generate()
        .into_iter()
        .map(|record| record.subscription)
        .collect();
    assert_eq!(named, vec!["audit".to_string()]);

    let dimensional = collector.generate_dimensional();
    assert!(!dimensional.is_empty());
    assert!(dimensional
        .iter()
        .all(|s| s.label("topic") == Some(TOPIC) && s.label("subscription") == Some("audit")));

    audit.close().await.unwrap();
}

#[tokio::test]
async fn test_delete_removes_state_and_series() {
    let fixture = Fixture::new(25).unwrap();
    let (cursor, _) = fixture.open("billing", manual_flush()).await.unwrap();

    cursor.add_acknowledgments((0..4).map(msg));
    cursor.flush().await.unwrap();
    assert!(fixture.meta.raw("/cursors/orders/billing").is_some());

    cursor.delete().await.unwrap();
    assert!(fixture.meta.raw("/cursors/orders/billing").is_none());
    assert!(fixture
        .registry
        .metrics()
        .gather_samples()
        .iter()
        .all(|s| s.label("subscription") != Some("billing")));

    let (cursor, outcome) = fixture.open("billing", manual_flush()).await.unwrap();
    assert_eq!(outcome, OpenOutcome::Created);
    assert_eq!(cursor.get_mark_delete_position(), Position::default());
    cursor.close().await.unwrap();
}

#[tokio::test]
async fn test_flush_timer_persists_below_threshold() {
    let fixture = Fixture::new(26).unwrap();
    let config = CursorConfig {
        persist_after_acks: 1000,
        flush_interval_ms: 10,
        ..CursorConfig::for_testing()
    };
    let (cursor, _) = fixture.open("billing", config.clone()).await.unwrap();
    let timer = fixture.registry.spawn_flush_timer(config.flush_interval());

    cursor.add_acknowledgments((0..3).map(msg));
    assert!(eventually(|| !cursor.has_unpersisted_changes()).await);
    assert_eq!(cursor.persisted_mark_delete_position(), Some(msg(2)));

    timer.shutdown().await;
    cursor.close().await.unwrap();
}
