//! Engine wiring and lifecycle.
//!
//! Build order: TX sinks → rule table → pool, rings, neighbor tables →
//! workers → stats thread → capture loop on the calling thread. Shutdown
//! runs the same list backwards: the capture loop returns (signal,
//! duration, or end of file), the stop flag goes up, workers drain their
//! rings and exit, and their latency histograms are merged into the final
//! report.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::info;

use upe_core::neighbor::{ArpTable, NdpTable};
use upe_core::pool::BufferPool;
use upe_core::ring::SpscRing;
use upe_core::rules::{ipv4_mask_from_prefix, Action, Rule, RuleAddrs, RuleTable};
use upe_core::stats::LatencyHistogram;
use upe_core::worker::{WorkerConfig, WorkerContext, WorkerHandle};
use upe_core::BufHandle;

use crate::capture::{self, CaptureSource};
use crate::rules_file;
use crate::signal;
use crate::stats::{self, WorkerStats};
use crate::tx::AfPacketSink;

const RULE_TABLE_CAPACITY: usize = 1024;
const NEIGHBOR_TABLE_CAPACITY: usize = 1024;

/// Validated engine configuration.
#[derive(Debug)]
pub struct EngineConfig {
    /// Frame source.
    pub source: CaptureSource,
    /// Egress interface.
    pub tx_iface: String,
    /// Rules file; demo rules when absent.
    pub rules_file: Option<PathBuf>,
    /// Worker count; also the ring count, so it must be a power of two
    /// for the hash-mask ring selection.
    pub workers: usize,
    /// Per-worker ring capacity.
    pub ring_capacity: usize,
    /// Buffer pool capacity.
    pub pool_capacity: usize,
    /// First CPU for worker pinning; `None` leaves workers floating.
    pub cpu_start: Option<usize>,
    /// Run time; zero means until a stop signal.
    pub duration: Duration,
}

impl EngineConfig {
    /// Rejects configurations the dataplane cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 || !self.workers.is_power_of_two() {
            bail!("--workers must be a power of two, got {}", self.workers);
        }
        if !self.ring_capacity.is_power_of_two() {
            bail!(
                "--ring-capacity must be a power of two, got {}",
                self.ring_capacity
            );
        }
        if self.pool_capacity == 0 {
            bail!("--pool-capacity must be > 0");
        }
        Ok(())
    }
}

/// Runs the engine to completion.
pub fn run(config: &EngineConfig) -> Result<()> {
    config.validate()?;
    signal::install()?;

    let cores = num_cpus::get();
    if config.workers > cores {
        tracing::warn!(
            workers = config.workers,
            cores,
            "more workers than cores, expect scheduling jitter"
        );
    }

    // One TX socket per worker; they share the interface, the kernel
    // serializes the sends.
    let mut sinks = Vec::with_capacity(config.workers);
    for _ in 0..config.workers {
        sinks.push(AfPacketSink::open(&config.tx_iface)?);
    }
    let out_ifindex = sinks[0].ifindex();

    let rules = Arc::new(match &config.rules_file {
        Some(path) => rules_file::load_rules(path, RULE_TABLE_CAPACITY, &rules_file::system_resolver)?,
        None => {
            info!("no rules file given, installing demo rules");
            demo_rules(out_ifindex)?
        }
    });

    let pool = Arc::new(BufferPool::with_capacity(config.pool_capacity)?);
    let arp = Arc::new(ArpTable::with_capacity(NEIGHBOR_TABLE_CAPACITY));
    let ndp = Arc::new(NdpTable::with_capacity(NEIGHBOR_TABLE_CAPACITY));
    let stop = Arc::new(AtomicBool::new(false));

    let mut rings = Vec::with_capacity(config.workers);
    for _ in 0..config.workers {
        rings.push(Arc::new(SpscRing::<BufHandle>::with_capacity(
            config.ring_capacity,
        )?));
    }

    let mut workers = Vec::with_capacity(config.workers);
    for (worker_id, sink) in sinks.into_iter().enumerate() {
        let ctx = WorkerContext {
            rx_ring: Arc::clone(&rings[worker_id]),
            pool: Arc::clone(&pool),
            rules: Arc::clone(&rules),
            arp: Arc::clone(&arp),
            ndp: Arc::clone(&ndp),
            stop: Arc::clone(&stop),
        };
        let handle = WorkerHandle::spawn(
            WorkerConfig {
                worker_id,
                core_id: config.cpu_start.map(|start| start + worker_id),
            },
            ctx,
            Box::new(sink),
        )
        .context("spawning worker")?;
        workers.push(handle);
    }

    let stats_of = |worker: &WorkerHandle| WorkerStats {
        counters: worker.counters(),
        rule_stats: worker.rule_stats(),
    };
    let live_stats: Vec<WorkerStats> = workers.iter().map(stats_of).collect();
    let stats_thread = stats::spawn(
        Arc::clone(&rules),
        workers.iter().map(stats_of).collect(),
        Arc::clone(&stop),
    );

    // This thread is the ingress thread until capture ends.
    let ingress = capture::run(&config.source, &pool, &rings, config.duration)?;

    // Shutdown: workers drain in-flight packets, then observe the flag.
    stop.store(true, Ordering::Relaxed);
    let _ = stats_thread.join();

    let mut latency = LatencyHistogram::new();
    for worker in workers {
        let report = worker.join()?;
        latency.merge(&report.latency);
    }

    let totals = stats::aggregate(&live_stats);
    info!(
        frames = ingress.frames,
        ingress_dropped = ingress.pool_exhausted + ingress.ring_full,
        pkts_in = totals.pkts_in,
        forwarded = totals.pkts_forwarded,
        dropped = totals.pkts_dropped,
        "engine stopped"
    );
    if latency.count() > 0 {
        info!(
            p50_ns = latency.percentile(0.50),
            p99_ns = latency.percentile(0.99),
            max_ns = latency.max_ns(),
            mean_ns = latency.mean_ns(),
            "per-packet processing latency"
        );
    }

    Ok(())
}

/// The built-in ruleset used when no rules file is given: drop SSH, forward
/// TCP from the lab prefix, drop the rest.
fn demo_rules(out_ifindex: u32) -> Result<RuleTable> {
    let mut table = RuleTable::with_capacity(RULE_TABLE_CAPACITY)?;

    let mut drop_ssh = Rule::new(10, Action::Drop);
    drop_ssh.protocol = 6;
    drop_ssh.dst_port = 22;
    table.add(drop_ssh)?;

    let mut fwd_lab = Rule::new(100, Action::Forward { out_ifindex });
    fwd_lab.protocol = 6;
    fwd_lab.addrs = RuleAddrs::V4 {
        src: u32::from_be_bytes([10, 0, 0, 0]),
        src_mask: ipv4_mask_from_prefix(8).expect("static prefix"),
        dst: 0,
        dst_mask: 0,
    };
    table.add(fwd_lab)?;

    // Implicit deny.
    table.add(Rule::new(10_000, Action::Drop))?;

    Ok(table)
}
