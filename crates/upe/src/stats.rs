//! Observability thread.
//!
//! Once a second, aggregates per-rule counters across workers and prints a
//! table, rules in match order. Reads are relaxed-atomic snapshots:
//! possibly a beat behind the workers, never torn, and never synchronizing
//! with the data path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use upe_core::rules::{Action, RuleTable};
use upe_core::stats::{CountersSnapshot, RuleStats, WorkerCounters};

/// The live stats handles of one worker.
pub struct WorkerStats {
    /// Packet counters.
    pub counters: Arc<WorkerCounters>,
    /// Per-rule hit counters.
    pub rule_stats: Arc<RuleStats>,
}

/// Spawns the stats printer; it exits once `stop` is raised.
pub fn spawn(
    rules: Arc<RuleTable>,
    workers: Vec<WorkerStats>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("upe-stats".to_string())
        .spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_secs(1));
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                print_table(&rules, &workers);
            }
        })
        .expect("failed to spawn stats thread")
}

/// Sums every worker's counters.
pub fn aggregate(workers: &[WorkerStats]) -> CountersSnapshot {
    workers
        .iter()
        .fold(CountersSnapshot::default(), |acc, worker| {
            acc.merged(&worker.counters.snapshot())
        })
}

fn print_table(rules: &RuleTable, workers: &[WorkerStats]) {
    // Clear screen and home the cursor, like a tiny top(1).
    print!("\x1b[2J\x1b[H");
    println!("=== UPE Statistics ===");
    println!(
        "{:<6} {:<8} {:<10} {:<15} {:<15}",
        "RuleID", "Priority", "Action", "Packets", "Bytes"
    );
    println!("-------------------------------------------------------------");

    let mut total_pkts = 0u64;
    let mut total_bytes = 0u64;

    for rule in rules {
        let (pkts, bytes) = workers.iter().fold((0u64, 0u64), |(p, b), worker| {
            let (wp, wb) = worker.rule_stats.get(rule.rule_id());
            (p + wp, b + wb)
        });
        if pkts == 0 {
            continue;
        }

        let action = match rule.action {
            Action::Drop => "DROP",
            Action::Forward { .. } => "FWD",
        };
        println!(
            "{:<6} {:<8} {:<10} {:<15} {:<15}",
            rule.rule_id(),
            rule.priority,
            action,
            pkts,
            bytes
        );
        total_pkts += pkts;
        total_bytes += bytes;
    }

    println!("-------------------------------------------------------------");
    println!("TOTAL: {total_pkts} packets, {total_bytes} bytes");

    let engine = aggregate(workers);
    println!(
        "in={} parsed={} matched={} forwarded={} dropped={}",
        engine.pkts_in,
        engine.pkts_parsed,
        engine.pkts_matched,
        engine.pkts_forwarded,
        engine.pkts_dropped
    );
}
