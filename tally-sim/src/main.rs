//! Tally cursor simulation binary.
//!
//! Produces `--messages` entries on one segment and acknowledges them with a
//! gap withheld, then fills the gap. Both metric views are printed after each
//! phase.
//!
//! ```bash
//! tally-sim --messages 30 --gap-start 10 --gap-len 11
//! tally-sim --data-dir /tmp/tally --config cursor.toml
//! tally-sim --fail-log-after 20 --log-level debug
//! ```
//!
//! Without `--data-dir` both backends are simulated in memory and
//! `--fail-log-after N` makes the log unavailable after the Nth
//! acknowledgment, forcing the metadata store fallback.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tally_core::{Position, SegmentId};
use tally_cursor::{
    CursorBackends, CursorConfig, CursorId, CursorRegistry, ManagedCursor, MetricsCollector,
};
use tally_log::{FileLogConfig, FileSegmentLog, SimulatedSegmentLog};
use tally_meta::{FileMetadataStore, InMemoryMetadataStore};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Tally cursor workload simulator.
#[derive(Parser, Debug)]
#[command(name = "tally-sim")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cursor config file (TOML). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of messages produced.
    #[arg(long, default_value = "30")]
    messages: u32,

    /// Index of the first message withheld in the first pass.
    #[arg(long, default_value = "10")]
    gap_start: u32,

    /// Number of messages withheld in the first pass.
    #[arg(long, default_value = "11")]
    gap_len: u32,

    /// Topic of the cursor.
    #[arg(long, default_value = "sim")]
    topic: String,

    /// Subscription of the cursor.
    #[arg(long, default_value = "workload")]
    subscription: String,

    /// Data directory for file-backed storage.
    /// If not specified, uses simulated in-memory storage.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Make the simulated log unavailable after this many acknowledgments.
    #[arg(long)]
    fail_log_after: Option<u32>,

    /// Seed of the simulated log.
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: Level,
}

impl Args {
    fn in_gap(&self, index: u32) -> bool {
        index >= self.gap_start && index - self.gap_start < self.gap_len
    }
}

/// Opens the backends; the simulated log is returned for fault control.
async fn open_backends(
    args: &Args,
) -> Result<(CursorBackends, Option<SimulatedSegmentLog>), Box<dyn std::error::Error>> {
    if let Some(data_dir) = &args.data_dir {
        if args.fail_log_after.is_some() {
            return Err("--fail-log-after requires the simulated log (omit --data-dir)".into());
        }
        let log = FileSegmentLog::open(FileLogConfig::new(data_dir.join("log"))).await?;
        let meta = FileMetadataStore::open(data_dir.join("meta")).await?;
        info!(data_dir = %data_dir.display(), "Using file-backed storage");
        return Ok((CursorBackends::new(Arc::new(log), Arc::new(meta)), None));
    }

    let log = SimulatedSegmentLog::new(args.seed);
    let backends = CursorBackends::new(
        Arc::new(log.clone()),
        Arc::new(InMemoryMetadataStore::new()),
    );
    Ok((backends, Some(log)))
}

fn print_report(
    phase: &str,
    registry: &CursorRegistry,
    collector: &MetricsCollector,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("== {phase} ==");
    for record in collector.generate() {
        println!("{}/{}", record.topic, record.subscription);
        for (name, value) in record.fields() {
            println!("  {name} {value}");
        }
    }
    println!();
    print!("{}", registry.metrics().encode_text()?);
    println!();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Logs go to stderr so stdout holds only the reports.
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &args.config {
        Some(path) => CursorConfig::from_file(path)?,
        None => CursorConfig::default(),
    };
    if args.gap_start.saturating_add(args.gap_len) > args.messages {
        return Err(format!(
            "gap {}+{} exceeds {} messages",
            args.gap_start, args.gap_len, args.messages
        )
        .into());
    }

    info!(
        messages = args.messages,
        gap_start = args.gap_start,
        gap_len = args.gap_len,
        persist_after_acks = config.persist_after_acks,
        record_format = ?config.record_format,
        "Starting cursor simulation"
    );

    let (backends, simulated_log) = open_backends(&args).await?;
    let registry = Arc::new(CursorRegistry::new()?);
    let collector = MetricsCollector::new(Arc::clone(&registry));
    let timer = registry.spawn_flush_timer(config.flush_interval());

    let id = CursorId::new(args.topic.clone(), args.subscription.clone())?;
    let (cursor, outcome) = ManagedCursor::open(id, backends, config, &registry).await?;
    info!(
        ?outcome,
        mark_delete = %cursor.get_mark_delete_position(),
        "Cursor opened"
    );

    let position = |index: u32| Position::new(SegmentId::new(0), i64::from(index));
    let mut acked = 0u32;

    // First pass: everything outside the gap.
    for index in (0..args.messages).filter(|&index| !args.in_gap(index)) {
        if args.fail_log_after == Some(acked) {
            if let Some(log) = &simulated_log {
                warn!(acked, "Making the primary log unavailable");
                log.set_unavailable(true);
            }
        }
        cursor.add_acknowledgment(position(index));
        acked += 1;
    }
    cursor.flush().await?;
    print_report("gap withheld", &registry, &collector)?;

    // Second pass: fill the gap.
    for index in (0..args.messages).filter(|&index| args.in_gap(index)) {
        cursor.add_acknowledgment(position(index));
    }
    cursor.flush().await?;
    print_report("gap filled", &registry, &collector)?;

    info!(
        mark_delete = %cursor.get_mark_delete_position(),
        ranges = cursor.get_number_of_non_contiguous_deleted_ranges(),
        dirty = cursor.has_unpersisted_changes(),
        "Simulation finished"
    );

    timer.shutdown().await;
    cursor.close().await?;
    Ok(())
}
