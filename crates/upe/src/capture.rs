//! Ingress: libpcap capture feeding the worker rings.
//!
//! The capture thread is the sole producer on every ring. Per frame:
//! allocate a buffer, copy the frame in, pick a ring by symmetric flow
//! hash (round-robin for unclassifiable frames, which still reach a worker
//! so ARP/NDP can be snooped), push the handle. Pool exhaustion drops the
//! frame after a short sleep; a full ring returns the buffer to the pool.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use pcap::{Activated, Capture};

use upe_core::packet::{flow_hash, parse_flow_key};
use upe_core::pool::BufferPool;
use upe_core::ring::SpscRing;
use upe_core::BufHandle;

use crate::signal;

/// Where frames come from.
#[derive(Debug, Clone)]
pub enum CaptureSource {
    /// Live capture on a named interface.
    Interface(String),
    /// Replay of a capture file.
    File(PathBuf),
}

/// Ingress-side counters, reported once at exit.
#[derive(Debug, Default, Clone, Copy)]
pub struct IngressStats {
    /// Frames seen by the capture handle.
    pub frames: u64,
    /// Frames dropped because the pool was empty.
    pub pool_exhausted: u64,
    /// Frames dropped because the target ring was full.
    pub ring_full: u64,
    /// Frames routed round-robin because they did not parse.
    pub unclassified: u64,
}

/// Runs the capture loop until a stop signal, duration expiry, or end of
/// file. Blocking; the caller is the ingress thread.
pub fn run(
    source: &CaptureSource,
    pool: &Arc<BufferPool>,
    rings: &[Arc<SpscRing<BufHandle>>],
    duration: Duration,
) -> Result<IngressStats> {
    match source {
        CaptureSource::Interface(iface) => {
            let cap = Capture::from_device(iface.as_str())
                .with_context(|| format!("opening capture device {iface}"))?
                .promisc(true)
                .snaplen(65535)
                // Short timeout so the loop can observe the stop flag.
                .timeout(1)
                .open()
                .with_context(|| format!("activating capture on {iface}"))?;
            tracing::info!(iface, "RX started");
            pump(cap, pool, rings, duration)
        }
        CaptureSource::File(path) => {
            let cap = Capture::from_file(path)
                .with_context(|| format!("opening capture file {}", path.display()))?;
            tracing::info!(file = %path.display(), "RX started (offline)");
            pump(cap, pool, rings, duration)
        }
    }
}

fn pump<S: Activated + ?Sized>(
    mut cap: Capture<S>,
    pool: &Arc<BufferPool>,
    rings: &[Arc<SpscRing<BufHandle>>],
    duration: Duration,
) -> Result<IngressStats> {
    let mask = rings.len() - 1;
    let start = Instant::now();
    let mut stats = IngressStats::default();
    let mut round_robin = 0usize;

    loop {
        if signal::stop_requested() {
            break;
        }
        if !duration.is_zero() && start.elapsed() >= duration {
            tracing::info!("run duration reached");
            signal::request_stop();
            break;
        }

        let packet = match cap.next_packet() {
            Ok(packet) => packet,
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(pcap::Error::NoMorePackets) => {
                tracing::info!("capture file exhausted");
                break;
            }
            Err(e) => return Err(e).context("capture read failed"),
        };
        stats.frames += 1;

        let Some(handle) = pool.alloc() else {
            // All buffers are in flight; drop the frame and give the
            // workers a moment to free some.
            stats.pool_exhausted += 1;
            thread::sleep(Duration::from_micros(10));
            continue;
        };

        // SAFETY: freshly allocated handle, owned by the ingress thread
        // until pushed onto a ring.
        let buf = unsafe { pool.buffer_mut(handle) };
        buf.fill(packet.data);
        #[allow(clippy::cast_possible_truncation)] // engine uptime ns fit u64
        buf.set_ingress_ts_ns(start.elapsed().as_nanos() as u64);

        // Flow-hash RSS keeps both directions of a flow on one worker;
        // unclassifiable frames round-robin instead.
        let ring_idx = match parse_flow_key(buf.as_slice()) {
            Ok(key) => flow_hash(&key) as usize & mask,
            Err(_) => {
                stats.unclassified += 1;
                round_robin = round_robin.wrapping_add(1);
                round_robin & mask
            }
        };

        if !rings[ring_idx].push(handle) {
            pool.free(handle);
            stats.ring_full += 1;
        }
    }

    tracing::info!(
        frames = stats.frames,
        pool_exhausted = stats.pool_exhausted,
        ring_full = stats.ring_full,
        unclassified = stats.unclassified,
        "RX stopped"
    );
    Ok(stats)
}
