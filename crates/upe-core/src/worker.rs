//! # Worker
//!
//! The per-core packet processing pipeline.
//!
//! Each worker owns one rx ring (as its sole consumer), a TX sink handle,
//! private counters and per-rule stats, and one-entry last-hit neighbor
//! caches. The main loop:
//!
//! 1. Pop a burst from the ring; on empty, observe the stop flag or sleep
//!    ~1 µs
//! 2. Per packet: control-plane snoop (ARP/NDP learning) → parse → rule
//!    match → stats → DROP, or L3 rewrite (TTL/hop-limit decrement, IPv4
//!    checksum, neighbor MAC rewrite) and TX-batch accumulate
//! 3. Flush the TX batch with one batched send; free every buffer
//!    afterwards; the sink has consumed the payloads by the time the call
//!    returns
//!
//! A neighbor lookup miss does not drop the packet: it is sent with its
//! original L2 addresses (transparent bridging).

use std::mem::MaybeUninit;
use std::net::Ipv4Addr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arrayvec::ArrayVec;

use crate::affinity;
use crate::neighbor::{ArpTable, NdpTable};
use crate::packet::checksum::internet_checksum;
use crate::packet::headers::{
    self as hdr, arp, eth, ipv4, ipv6, ndp, read_addr16, read_mac, read_u16_be, read_u32_be,
    write_u16_be, MacAddr,
};
use crate::packet::parser::{parse_flow_key, FlowAddrs};
use crate::pool::{BufHandle, BufferPool};
use crate::ring::SpscRing;
use crate::rules::{Action, RuleTable};
use crate::stats::{LatencyHistogram, RuleStats, WorkerCounters};

/// Packets a worker pops (and batches for TX) per ring drain.
pub const WORKER_BURST: usize = 32;

/// Sleep when the ring is empty and the stop flag is clear.
const IDLE_SLEEP: Duration = Duration::from_micros(1);

/// Errors from worker lifecycle management.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The OS could not spawn the worker thread.
    #[error("failed to spawn worker {worker_id}: {source}")]
    Spawn {
        /// Worker that failed to start.
        worker_id: usize,
        /// OS error.
        source: std::io::Error,
    },

    /// The worker thread panicked.
    #[error("worker {worker_id} panicked")]
    Panicked {
        /// Worker that died.
        worker_id: usize,
    },
}

/// Batched transmit sink.
///
/// Each worker owns its sink handle; serializing concurrent sends on a
/// shared underlying socket is the sink's concern, not the worker's.
pub trait TxSink: Send {
    /// MAC address of the egress interface, written into the Ethernet
    /// source field on forward.
    fn mac(&self) -> MacAddr;

    /// Sends `frames` in one batch and returns the number accepted.
    ///
    /// Partial-send semantics: a return of `sent` means frames
    /// `[0, sent)` were accepted and `[sent, len)` were not. The payloads
    /// are consumed by the time the call returns; callers may reuse the
    /// frame memory immediately.
    fn send_batch(&mut self, frames: &[&[u8]]) -> usize;
}

/// Static configuration for one worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Worker index (names the thread, keys the logs).
    pub worker_id: usize,
    /// CPU to pin to; `None` disables pinning. Pinning failure is a
    /// warning, not an error.
    pub core_id: Option<usize>,
}

/// Shared dataplane state handed to every worker.
#[derive(Clone)]
pub struct WorkerContext {
    /// This worker's rx ring; the worker is its sole consumer.
    pub rx_ring: Arc<SpscRing<BufHandle>>,
    /// The buffer pool.
    pub pool: Arc<BufferPool>,
    /// Frozen rule table.
    pub rules: Arc<RuleTable>,
    /// Shared ARP table (read for forwards, written by snooping).
    pub arp: Arc<ArpTable>,
    /// Shared NDP table.
    pub ndp: Arc<NdpTable>,
    /// Process-wide stop flag; observed only when the ring is empty, so
    /// in-flight work always drains first.
    pub stop: Arc<AtomicBool>,
}

/// What a worker hands back when it exits.
#[derive(Debug)]
pub struct WorkerReport {
    /// Per-packet processing latency of this worker.
    pub latency: LatencyHistogram,
}

/// Handle to a running worker thread.
pub struct WorkerHandle {
    worker_id: usize,
    counters: Arc<WorkerCounters>,
    rule_stats: Arc<RuleStats>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<WorkerReport>>,
}

impl WorkerHandle {
    /// Spawns a worker thread.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Spawn`] if the OS rejects the thread.
    pub fn spawn(
        config: WorkerConfig,
        ctx: WorkerContext,
        sink: Box<dyn TxSink>,
    ) -> Result<Self, WorkerError> {
        let worker_id = config.worker_id;
        let counters = Arc::new(WorkerCounters::default());
        let rule_stats = Arc::new(RuleStats::new(ctx.rules.capacity()));
        let stop = Arc::clone(&ctx.stop);

        let worker = Worker::new(config, ctx, sink, Arc::clone(&counters), Arc::clone(&rule_stats));

        let thread = thread::Builder::new()
            .name(format!("upe-worker-{worker_id}"))
            .spawn(move || worker.run())
            .map_err(|source| WorkerError::Spawn { worker_id, source })?;

        Ok(Self {
            worker_id,
            counters,
            rule_stats,
            stop,
            thread: Some(thread),
        })
    }

    /// Worker index.
    #[must_use]
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// This worker's counters (live; values lag the worker slightly).
    #[must_use]
    pub fn counters(&self) -> Arc<WorkerCounters> {
        Arc::clone(&self.counters)
    }

    /// This worker's per-rule stats (live).
    #[must_use]
    pub fn rule_stats(&self) -> Arc<RuleStats> {
        Arc::clone(&self.rule_stats)
    }

    /// Waits for the worker to exit. The caller must have set the stop
    /// flag, or this blocks until traffic stops arriving forever.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Panicked`] if the worker thread panicked.
    pub fn join(mut self) -> Result<WorkerReport, WorkerError> {
        let worker_id = self.worker_id;
        self.thread
            .take()
            .map_or(Err(WorkerError::Panicked { worker_id }), |handle| {
                handle.join().map_err(|_| WorkerError::Panicked { worker_id })
            })
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        // Backstop for a handle dropped without an explicit join: raise
        // the (process-wide) stop flag so the thread can exit, then join.
        if let Some(handle) = self.thread.take() {
            self.stop.store(true, Ordering::Relaxed);
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("worker_id", &self.worker_id)
            .field("running", &self.thread.is_some())
            .finish_non_exhaustive()
    }
}

/// Thread-side worker state. Everything here is private to the worker for
/// its lifetime.
struct Worker {
    worker_id: usize,
    core_id: Option<usize>,
    rx_ring: Arc<SpscRing<BufHandle>>,
    pool: Arc<BufferPool>,
    rules: Arc<RuleTable>,
    arp: Arc<ArpTable>,
    ndp: Arc<NdpTable>,
    sink: Box<dyn TxSink>,
    stop: Arc<AtomicBool>,
    counters: Arc<WorkerCounters>,
    rule_stats: Arc<RuleStats>,
    /// Egress MAC, cached off the sink at startup.
    tx_mac: MacAddr,
    /// Last-hit ARP cache: skips the shared table on back-to-back packets
    /// to the same destination.
    last_arp: Option<(u32, MacAddr)>,
    /// Last-hit NDP cache.
    last_ndp: Option<([u8; 16], MacAddr)>,
    /// Buffers accumulated for the next batched send.
    tx_batch: ArrayVec<BufHandle, WORKER_BURST>,
    latency: LatencyHistogram,
}

impl Worker {
    fn new(
        config: WorkerConfig,
        ctx: WorkerContext,
        sink: Box<dyn TxSink>,
        counters: Arc<WorkerCounters>,
        rule_stats: Arc<RuleStats>,
    ) -> Self {
        let tx_mac = sink.mac();
        Self {
            worker_id: config.worker_id,
            core_id: config.core_id,
            rx_ring: ctx.rx_ring,
            pool: ctx.pool,
            rules: ctx.rules,
            arp: ctx.arp,
            ndp: ctx.ndp,
            sink,
            stop: ctx.stop,
            counters,
            rule_stats,
            tx_mac,
            last_arp: None,
            last_ndp: None,
            tx_batch: ArrayVec::new(),
            latency: LatencyHistogram::new(),
        }
    }

    /// The worker main loop; runs until the ring is empty with the stop
    /// flag set.
    fn run(mut self) -> WorkerReport {
        if let Some(core) = self.core_id {
            match affinity::pin_current_thread(core) {
                Ok(()) => tracing::info!(worker = self.worker_id, core, "worker pinned"),
                Err(e) => {
                    tracing::warn!(worker = self.worker_id, core, error = %e, "pinning failed");
                }
            }
        }
        tracing::info!(worker = self.worker_id, "worker started");

        let mut batch = [MaybeUninit::<BufHandle>::uninit(); WORKER_BURST];
        loop {
            let n = self.rx_ring.pop_burst(&mut batch);
            if n == 0 {
                if self.stop.load(Ordering::Relaxed) {
                    break;
                }
                thread::sleep(IDLE_SLEEP);
                continue;
            }

            WorkerCounters::add(&self.counters.pkts_in, n as u64);

            for slot in &batch[..n] {
                // SAFETY: pop_burst initialized the first n slots.
                let handle = unsafe { slot.assume_init() };
                let started = Instant::now();
                self.process_packet(handle);
                #[allow(clippy::cast_possible_truncation)] // per-packet ns fit u64
                self.latency.record_ns(started.elapsed().as_nanos() as u64);
            }

            if !self.tx_batch.is_empty() {
                self.flush_tx();
            }
        }

        tracing::info!(
            worker = self.worker_id,
            processed = self.counters.pkts_in.load(Ordering::Relaxed),
            "worker stopped"
        );
        WorkerReport {
            latency: self.latency,
        }
    }

    /// Runs one packet through snoop → parse → match → dispatch.
    ///
    /// Owns `handle` on entry; every path either frees it or moves it into
    /// the TX batch.
    fn process_packet(&mut self, handle: BufHandle) {
        // SAFETY: the handle arrived over this worker's rx ring, making
        // the worker its sole owner until freed or batched.
        let buf = unsafe { self.pool.buffer_mut(handle) };
        let frame_len = buf.len() as u64;

        // Control-plane snoop: ARP and NDP packets feed the neighbor
        // tables and are consumed.
        if snoop_control(&self.arp, &self.ndp, buf.as_slice()) {
            self.pool.free(handle);
            return;
        }

        let key = match parse_flow_key(buf.as_slice()) {
            Ok(key) => key,
            Err(_) => {
                WorkerCounters::add(&self.counters.parse_errors, 1);
                WorkerCounters::add(&self.counters.pkts_dropped, 1);
                self.pool.free(handle);
                return;
            }
        };
        WorkerCounters::add(&self.counters.pkts_parsed, 1);

        let Some(rule) = self.rules.lookup(&key) else {
            WorkerCounters::add(&self.counters.rule_misses, 1);
            WorkerCounters::add(&self.counters.pkts_dropped, 1);
            self.pool.free(handle);
            return;
        };
        WorkerCounters::add(&self.counters.pkts_matched, 1);
        self.rule_stats.record(rule.rule_id(), frame_len);

        match rule.action {
            Action::Drop => {
                WorkerCounters::add(&self.counters.pkts_dropped, 1);
                self.pool.free(handle);
            }
            Action::Forward { .. } => {
                let frame = buf.as_mut_slice();
                let alive = match key.addrs {
                    FlowAddrs::V4 { dst, .. } => {
                        rewrite_ipv4(frame) && {
                            let mac = resolve_v4(&mut self.last_arp, &self.arp, dst);
                            apply_l2(frame, mac, self.tx_mac, &self.counters);
                            true
                        }
                    }
                    FlowAddrs::V6 { dst, .. } => {
                        rewrite_ipv6(frame) && {
                            let mac = resolve_v6(&mut self.last_ndp, &self.ndp, dst);
                            apply_l2(frame, mac, self.tx_mac, &self.counters);
                            true
                        }
                    }
                };

                if alive {
                    // Cannot overflow: the batch is flushed after every
                    // burst and a burst is at most WORKER_BURST packets.
                    self.tx_batch.push(handle);
                } else {
                    WorkerCounters::add(&self.counters.ttl_expired, 1);
                    WorkerCounters::add(&self.counters.pkts_dropped, 1);
                    self.pool.free(handle);
                }
            }
        }
    }

    /// Sends the accumulated batch and frees every buffer in it.
    fn flush_tx(&mut self) {
        let batch_len = self.tx_batch.len();

        let mut frames = ArrayVec::<&[u8], WORKER_BURST>::new();
        for &handle in &self.tx_batch {
            // SAFETY: batched handles are owned by this worker; the
            // borrows end before the buffers are freed below.
            frames.push(unsafe { self.pool.buffer(handle) }.as_slice());
        }

        let sent = self.sink.send_batch(&frames).min(batch_len);
        drop(frames);

        WorkerCounters::add(&self.counters.pkts_forwarded, sent as u64);
        let rejected = (batch_len - sent) as u64;
        if rejected > 0 {
            WorkerCounters::add(&self.counters.send_rejected, rejected);
            WorkerCounters::add(&self.counters.pkts_dropped, rejected);
        }

        // Free everything, sent or not: the sink consumed the payloads it
        // accepted during the call, and rejected frames are disposable.
        for &handle in &self.tx_batch {
            self.pool.free(handle);
        }
        self.tx_batch.clear();
    }
}

/// Learns from ARP and NDP control packets. Returns true if the packet
/// was consumed (the caller frees it).
fn snoop_control(arp_table: &ArpTable, ndp_table: &NdpTable, frame: &[u8]) -> bool {
    if frame.len() < eth::LEN {
        return false;
    }

    match read_u16_be(frame, eth::ETHERTYPE) {
        hdr::ETHERTYPE_ARP => {
            if frame.len() >= eth::LEN + arp::LEN {
                let payload = &frame[eth::LEN..];
                if read_u16_be(payload, arp::HTYPE) == arp::HTYPE_ETHERNET
                    && read_u16_be(payload, arp::PTYPE) == hdr::ETHERTYPE_IPV4
                    && payload[arp::HLEN] == 6
                    && payload[arp::PLEN] == 4
                {
                    let sender_ip = read_u32_be(payload, arp::SPA);
                    let sender_mac = read_mac(payload, arp::SHA);
                    arp_table.update(sender_ip, sender_mac);
                    tracing::debug!(ip = %Ipv4Addr::from(sender_ip), mac = %sender_mac, "learned ARP neighbor");
                }
            }
            // ARP never reaches the classifier.
            true
        }
        hdr::ETHERTYPE_IPV6 if frame.len() >= eth::LEN + ipv6::LEN + ndp::LEN => {
            let ip6 = &frame[eth::LEN..];
            if ip6[ipv6::NEXT_HEADER] != hdr::IPPROTO_ICMPV6 {
                return false;
            }
            let icmp6 = &ip6[ipv6::LEN..];
            let msg_type = icmp6[ndp::TYPE];
            if msg_type != ndp::TYPE_NEIGHBOR_SOLICITATION
                && msg_type != ndp::TYPE_NEIGHBOR_ADVERTISEMENT
            {
                return false;
            }

            // Walk the options in 8-octet units.
            let mut off = ndp::LEN;
            while off + 2 <= icmp6.len() {
                let opt_type = icmp6[off];
                let opt_len = usize::from(icmp6[off + 1]) * 8;
                if opt_len == 0 || off + opt_len > icmp6.len() {
                    break;
                }
                if msg_type == ndp::TYPE_NEIGHBOR_SOLICITATION
                    && opt_type == ndp::OPT_SOURCE_LINK_ADDR
                    && opt_len >= 8
                {
                    let mac = read_mac(icmp6, off + 2);
                    ndp_table.update(read_addr16(ip6, ipv6::SRC), mac);
                    tracing::debug!(%mac, "learned NDP neighbor (NS)");
                    break;
                }
                if msg_type == ndp::TYPE_NEIGHBOR_ADVERTISEMENT
                    && opt_type == ndp::OPT_TARGET_LINK_ADDR
                    && opt_len >= 8
                {
                    let mac = read_mac(icmp6, off + 2);
                    ndp_table.update(read_addr16(icmp6, ndp::TARGET), mac);
                    tracing::debug!(%mac, "learned NDP neighbor (NA)");
                    break;
                }
                off += opt_len;
            }
            true
        }
        _ => false,
    }
}

/// Decrements the IPv4 TTL and recomputes the header checksum.
///
/// Returns false (drop) if the TTL is already spent.
fn rewrite_ipv4(frame: &mut [u8]) -> bool {
    let ip = eth::LEN;
    let ttl = frame[ip + ipv4::TTL];
    if ttl <= 1 {
        return false;
    }
    frame[ip + ipv4::TTL] = ttl - 1;

    // Checksum field must be zero while summing.
    write_u16_be(frame, ip + ipv4::CHECKSUM, 0);
    let header_len = usize::from(frame[ip + ipv4::VER_IHL] & 0x0f) * 4;
    let csum = internet_checksum(&frame[ip..ip + header_len]);
    write_u16_be(frame, ip + ipv4::CHECKSUM, csum);
    true
}

/// Decrements the IPv6 hop limit. Returns false (drop) if already spent.
fn rewrite_ipv6(frame: &mut [u8]) -> bool {
    let hop_limit = frame[eth::LEN + ipv6::HOP_LIMIT];
    if hop_limit <= 1 {
        return false;
    }
    frame[eth::LEN + ipv6::HOP_LIMIT] = hop_limit - 1;
    true
}

/// Destination MAC via the last-hit cache, then the shared ARP table.
fn resolve_v4(
    cache: &mut Option<(u32, MacAddr)>,
    table: &ArpTable,
    dst_ip: u32,
) -> Option<MacAddr> {
    if let Some((cached_ip, cached_mac)) = cache {
        if *cached_ip == dst_ip {
            return Some(*cached_mac);
        }
    }
    let mac = table.lookup(dst_ip)?;
    *cache = Some((dst_ip, mac));
    Some(mac)
}

/// Destination MAC via the last-hit cache, then the shared NDP table.
fn resolve_v6(
    cache: &mut Option<([u8; 16], MacAddr)>,
    table: &NdpTable,
    dst_ip: [u8; 16],
) -> Option<MacAddr> {
    if let Some((cached_ip, cached_mac)) = cache {
        if *cached_ip == dst_ip {
            return Some(*cached_mac);
        }
    }
    let mac = table.lookup(dst_ip)?;
    *cache = Some((dst_ip, mac));
    Some(mac)
}

/// Rewrites the Ethernet addresses when the neighbor is known; otherwise
/// leaves the frame untouched (transparent bridging) and counts the miss.
fn apply_l2(frame: &mut [u8], dst_mac: Option<MacAddr>, src_mac: MacAddr, counters: &WorkerCounters) {
    if let Some(mac) = dst_mac {
        frame[eth::DST..eth::DST + 6].copy_from_slice(&mac.octets());
        frame[eth::SRC..eth::SRC + 6].copy_from_slice(&src_mac.octets());
    } else {
        WorkerCounters::add(&counters.neighbor_misses, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const SINK_MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x01]);

    /// In-memory sink recording what it was asked to send.
    struct MockSink {
        /// Frames accepted per batch; `usize::MAX` accepts everything.
        accept: usize,
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl MockSink {
        fn accepting_all() -> (Box<Self>, Arc<Mutex<Vec<Vec<u8>>>>) {
            let sent = Arc::new(Mutex::new(Vec::new()));
            (
                Box::new(Self {
                    accept: usize::MAX,
                    sent: Arc::clone(&sent),
                }),
                sent,
            )
        }
    }

    impl TxSink for MockSink {
        fn mac(&self) -> MacAddr {
            SINK_MAC
        }

        fn send_batch(&mut self, frames: &[&[u8]]) -> usize {
            let sent = frames.len().min(self.accept);
            let mut log = self.sent.lock().unwrap();
            for frame in &frames[..sent] {
                log.push(frame.to_vec());
            }
            sent
        }
    }

    fn tcp4_frame(src: [u8; 4], dst: [u8; 4], dst_port: u16, ttl: u8) -> Vec<u8> {
        let mut f = vec![0u8; eth::LEN + ipv4::MIN_LEN + 20];
        f[eth::ETHERTYPE..eth::LEN].copy_from_slice(&hdr::ETHERTYPE_IPV4.to_be_bytes());
        let ip = eth::LEN;
        f[ip + ipv4::VER_IHL] = 0x45;
        f[ip + ipv4::TTL] = ttl;
        f[ip + ipv4::PROTOCOL] = hdr::IPPROTO_TCP;
        f[ip + ipv4::SRC..ip + ipv4::SRC + 4].copy_from_slice(&src);
        f[ip + ipv4::DST..ip + ipv4::DST + 4].copy_from_slice(&dst);
        let l4 = ip + ipv4::MIN_LEN;
        f[l4..l4 + 2].copy_from_slice(&40000u16.to_be_bytes());
        f[l4 + 2..l4 + 4].copy_from_slice(&dst_port.to_be_bytes());
        f[l4 + 12] = 5 << 4;
        f
    }

    fn arp_reply_frame(sender_ip: [u8; 4], sender_mac: [u8; 6]) -> Vec<u8> {
        let mut f = vec![0u8; eth::LEN + arp::LEN];
        f[eth::ETHERTYPE..eth::LEN].copy_from_slice(&hdr::ETHERTYPE_ARP.to_be_bytes());
        let a = eth::LEN;
        f[a + arp::HTYPE..a + arp::HTYPE + 2].copy_from_slice(&1u16.to_be_bytes());
        f[a + arp::PTYPE..a + arp::PTYPE + 2]
            .copy_from_slice(&hdr::ETHERTYPE_IPV4.to_be_bytes());
        f[a + arp::HLEN] = 6;
        f[a + arp::PLEN] = 4;
        f[a + arp::SHA..a + arp::SHA + 6].copy_from_slice(&sender_mac);
        f[a + arp::SPA..a + arp::SPA + 4].copy_from_slice(&sender_ip);
        f
    }

    /// Builds a worker with direct (non-threaded) access for pipeline
    /// tests.
    fn make_worker(rules: RuleTable, sink: Box<dyn TxSink>) -> Worker {
        let ctx = WorkerContext {
            rx_ring: Arc::new(SpscRing::with_capacity(64).unwrap()),
            pool: Arc::new(BufferPool::with_capacity(64).unwrap()),
            rules: Arc::new(rules),
            arp: Arc::new(ArpTable::with_capacity(64)),
            ndp: Arc::new(NdpTable::with_capacity(64)),
            stop: Arc::new(AtomicBool::new(false)),
        };
        Worker::new(
            WorkerConfig {
                worker_id: 0,
                core_id: None,
            },
            ctx,
            sink,
            Arc::new(WorkerCounters::default()),
            Arc::new(RuleStats::new(16)),
        )
    }

    fn inject(worker: &Worker, frame: &[u8]) -> BufHandle {
        let handle = worker.pool.alloc().unwrap();
        // SAFETY: freshly allocated, owned here.
        unsafe { worker.pool.buffer_mut(handle) }.fill(frame);
        handle
    }

    fn drop_tcp_port(port: u16) -> RuleTable {
        let mut table = RuleTable::with_capacity(16).unwrap();
        let mut rule = crate::rules::Rule::new(10, Action::Drop);
        rule.protocol = hdr::IPPROTO_TCP;
        rule.dst_port = port;
        table.add(rule).unwrap();
        table
    }

    fn forward_all_tcp() -> RuleTable {
        let mut table = RuleTable::with_capacity(16).unwrap();
        let mut rule = crate::rules::Rule::new(100, Action::Forward { out_ifindex: 3 });
        rule.protocol = hdr::IPPROTO_TCP;
        table.add(rule).unwrap();
        table
    }

    #[test]
    fn test_drop_by_rule() {
        let (sink, sent) = MockSink::accepting_all();
        let mut worker = make_worker(drop_tcp_port(22), sink);

        let handle = inject(&worker, &tcp4_frame([10, 0, 0, 1], [10, 0, 0, 2], 22, 64));
        worker.process_packet(handle);

        let snap = worker.counters.snapshot();
        assert_eq!(snap.pkts_parsed, 1);
        assert_eq!(snap.pkts_matched, 1);
        assert_eq!(snap.pkts_dropped, 1);
        assert_eq!(snap.pkts_forwarded, 0);
        assert!(sent.lock().unwrap().is_empty());
        assert!(worker.tx_batch.is_empty());
    }

    #[test]
    fn test_forward_decrements_ttl_and_fixes_checksum() {
        let (sink, sent) = MockSink::accepting_all();
        let mut worker = make_worker(forward_all_tcp(), sink);

        let handle = inject(&worker, &tcp4_frame([10, 0, 0, 1], [10, 0, 0, 2], 80, 64));
        worker.process_packet(handle);
        worker.flush_tx();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let frame = &sent[0];
        assert_eq!(frame[eth::LEN + ipv4::TTL], 63);
        // Verifying the checksum over the rewritten header sums to zero.
        assert_eq!(
            internet_checksum(&frame[eth::LEN..eth::LEN + ipv4::MIN_LEN]),
            0
        );
        assert_eq!(worker.counters.snapshot().pkts_forwarded, 1);
    }

    #[test]
    fn test_ttl_expired_drops() {
        let (sink, sent) = MockSink::accepting_all();
        let mut worker = make_worker(forward_all_tcp(), sink);

        let handle = inject(&worker, &tcp4_frame([10, 0, 0, 1], [10, 0, 0, 2], 80, 1));
        worker.process_packet(handle);

        let snap = worker.counters.snapshot();
        assert_eq!(snap.ttl_expired, 1);
        assert_eq!(snap.pkts_dropped, 1);
        assert_eq!(snap.pkts_forwarded, 0);
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unparseable_drops() {
        let (sink, _) = MockSink::accepting_all();
        let mut worker = make_worker(forward_all_tcp(), sink);

        let handle = inject(&worker, &[0u8; 10]);
        worker.process_packet(handle);

        let snap = worker.counters.snapshot();
        assert_eq!(snap.parse_errors, 1);
        assert_eq!(snap.pkts_dropped, 1);
        assert_eq!(snap.pkts_parsed, 0);
    }

    #[test]
    fn test_rule_miss_drops() {
        let (sink, _) = MockSink::accepting_all();
        // Table only matches dst_port 22; feed port 80.
        let mut worker = make_worker(drop_tcp_port(22), sink);

        let handle = inject(&worker, &tcp4_frame([1, 1, 1, 1], [2, 2, 2, 2], 80, 64));
        worker.process_packet(handle);

        let snap = worker.counters.snapshot();
        assert_eq!(snap.pkts_parsed, 1);
        assert_eq!(snap.rule_misses, 1);
        assert_eq!(snap.pkts_matched, 0);
    }

    #[test]
    fn test_arp_learn_then_rewrite() {
        let (sink, sent) = MockSink::accepting_all();
        let mut worker = make_worker(forward_all_tcp(), sink);

        let neighbor_mac = [0xaa, 0x00, 0x00, 0x00, 0x00, 0xbb];
        let arp_frame = arp_reply_frame([10, 128, 0, 2], neighbor_mac);
        let handle = inject(&worker, &arp_frame);
        worker.process_packet(handle);
        // Consumed by the snoop, nothing parsed or matched.
        assert_eq!(worker.counters.snapshot().pkts_parsed, 0);

        let data = tcp4_frame([10, 0, 0, 1], [10, 128, 0, 2], 80, 64);
        let handle = inject(&worker, &data);
        worker.process_packet(handle);
        worker.flush_tx();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let frame = &sent[0];
        assert_eq!(&frame[eth::DST..eth::DST + 6], &neighbor_mac);
        assert_eq!(&frame[eth::SRC..eth::SRC + 6], &SINK_MAC.octets());
        // The second identical destination would hit the last-hit cache.
        assert_eq!(worker.last_arp, Some((u32::from_be_bytes([10, 128, 0, 2]), MacAddr(neighbor_mac))));
    }

    #[test]
    fn test_neighbor_miss_bridges_transparently() {
        let (sink, sent) = MockSink::accepting_all();
        let mut worker = make_worker(forward_all_tcp(), sink);

        let mut frame = tcp4_frame([10, 0, 0, 1], [10, 0, 0, 99], 80, 64);
        frame[eth::DST..eth::DST + 6].copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        let handle = inject(&worker, &frame);
        worker.process_packet(handle);
        worker.flush_tx();

        let snap = worker.counters.snapshot();
        assert_eq!(snap.neighbor_misses, 1);
        assert_eq!(snap.pkts_forwarded, 1);
        // Original L2 addresses preserved.
        let sent = sent.lock().unwrap();
        assert_eq!(&sent[0][eth::DST..eth::DST + 6], &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_partial_send_counts_prefix() {
        let sent_log = Arc::new(Mutex::new(Vec::new()));
        let sink = Box::new(MockSink {
            accept: 1,
            sent: Arc::clone(&sent_log),
        });
        let mut worker = make_worker(forward_all_tcp(), sink);

        for i in 0..3u8 {
            let handle = inject(&worker, &tcp4_frame([10, 0, 0, i], [10, 0, 0, 2], 80, 64));
            worker.process_packet(handle);
        }
        worker.flush_tx();

        let snap = worker.counters.snapshot();
        assert_eq!(snap.pkts_forwarded, 1);
        assert_eq!(snap.send_rejected, 2);
        assert_eq!(snap.pkts_dropped, 2);
        // Only the accepted prefix was consumed.
        assert_eq!(sent_log.lock().unwrap().len(), 1);
        assert!(worker.tx_batch.is_empty());
    }

    #[test]
    fn test_spawned_worker_lifecycle() {
        let stop = Arc::new(AtomicBool::new(false));
        let ring = Arc::new(SpscRing::with_capacity(64).unwrap());
        let pool = Arc::new(BufferPool::with_capacity(64).unwrap());
        let ctx = WorkerContext {
            rx_ring: Arc::clone(&ring),
            pool: Arc::clone(&pool),
            rules: Arc::new(drop_tcp_port(22)),
            arp: Arc::new(ArpTable::with_capacity(16)),
            ndp: Arc::new(NdpTable::with_capacity(16)),
            stop: Arc::clone(&stop),
        };
        let (sink, _) = MockSink::accepting_all();
        let handle = WorkerHandle::spawn(
            WorkerConfig {
                worker_id: 7,
                core_id: None,
            },
            ctx,
            sink,
        )
        .unwrap();
        assert_eq!(handle.worker_id(), 7);
        let counters = handle.counters();

        let buf = pool.alloc().unwrap();
        // SAFETY: freshly allocated, owned here.
        unsafe { pool.buffer_mut(buf) }.fill(&tcp4_frame([1, 1, 1, 1], [2, 2, 2, 2], 22, 64));
        assert!(ring.push(buf));

        // The worker drains in-flight work before honoring the stop flag.
        let deadline = Instant::now() + Duration::from_secs(5);
        while counters.snapshot().pkts_in < 1 {
            assert!(Instant::now() < deadline, "worker never drained the ring");
            thread::sleep(Duration::from_millis(1));
        }

        stop.store(true, Ordering::Relaxed);
        let report = handle.join().unwrap();
        assert_eq!(report.latency.count(), 1);
        assert_eq!(counters.snapshot().pkts_dropped, 1);
    }
}
