//! UPE standalone engine.
//!
//! Captures raw Ethernet frames from an interface or a capture file, fans
//! them out to worker threads over lock-free rings, classifies against a
//! rule table, rewrites L3 headers, and transmits via a batched raw
//! socket.

mod capture;
mod engine;
mod rules_file;
mod signal;
mod stats;
mod tx;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use capture::CaptureSource;
use engine::EngineConfig;

/// UPE - userspace L2/L3 packet forwarder
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Network interface to capture from (live mode)
    #[arg(long, conflicts_with = "pcap")]
    iface: Option<String>,

    /// Capture file to replay (offline mode)
    #[arg(long)]
    pcap: Option<PathBuf>,

    /// Rules file; built-in demo rules when omitted
    #[arg(long)]
    rules: Option<PathBuf>,

    /// Interface for transmission (defaults to the capture interface, or
    /// "lo" in offline mode)
    #[arg(long)]
    tx_iface: Option<String>,

    /// Worker threads; must be a power of two
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Per-worker ring capacity; must be a power of two
    #[arg(long, default_value_t = 1024)]
    ring_capacity: usize,

    /// Packet buffer pool capacity
    #[arg(long, default_value_t = 4096)]
    pool_capacity: usize,

    /// Pin workers to consecutive cores starting at this CPU
    #[arg(long)]
    cpu_start: Option<usize>,

    /// Run time in seconds (0 = until SIGINT/SIGTERM)
    #[arg(long, default_value_t = 0)]
    duration: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("upe={}", args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting UPE");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let source = match (&args.iface, &args.pcap) {
        (Some(iface), None) => CaptureSource::Interface(iface.clone()),
        (None, Some(path)) => CaptureSource::File(path.clone()),
        _ => bail!("exactly one of --iface or --pcap is required"),
    };
    let tx_iface = args
        .tx_iface
        .or_else(|| args.iface.clone())
        .unwrap_or_else(|| "lo".to_string());

    let config = EngineConfig {
        source,
        tx_iface,
        rules_file: args.rules,
        workers: args.workers,
        ring_capacity: args.ring_capacity,
        pool_capacity: args.pool_capacity,
        cpu_start: args.cpu_start,
        duration: Duration::from_secs(args.duration),
    };

    engine::run(&config)
}
