//! # Interface (Transport) Abstraction
//!
//! One packet-delivery contract consumed by the core and implemented by the
//! physical carriers (UDP sockets, LoRa radios, serial links — all outside
//! this crate). A transport:
//!
//! - transmits opaque byte frames (`send`)
//! - delivers received frames through a [`FrameSink`] handed to it at attach
//!   time (the non-owning back-reference into the node)
//! - reports `online`, its [`InterfaceMode`], and a bandwidth estimate
//!
//! Around each attached transport the node keeps an [`Iface`] record: the
//! hop-prioritised announce queue, the token-bucket announce budget, and the
//! tx/rx counters. Transports are addressed by [`IfaceId`], a stable index
//! into the node's registry — never by reference, so there are no ownership
//! cycles between node and transport.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::DEFAULT_ANNOUNCE_BUDGET_PERCENT;

/// Interface operation mode; controls announce forwarding behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceMode {
    /// Full mesh participation; forward all announces.
    Full,
    /// Bridge segments (e.g. LoRa ↔ internet); forward everything.
    Gateway,
    /// Connect different networks; forward only local announces (≤ 3 hops).
    Boundary,
    /// Quiet mode; never forward announces.
    AccessPoint,
    /// Mobile node; short-lived paths.
    Roaming,
}

/// BOUNDARY interfaces forward announces only up to this hop count.
pub const BOUNDARY_MAX_HOPS: u8 = 3;

/// Stable handle to an attached transport. Indexes the node's registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IfaceId(pub u32);

impl std::fmt::Display for IfaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "iface{}", self.0)
    }
}

// ============================================================================
// Transport contract
// ============================================================================

/// Receiver half of the node ↔ transport relation.
///
/// Implemented by the node; transports only ever hold it behind a
/// [`FrameSink`].
pub trait FrameDispatch: Send + Sync {
    fn dispatch_frame(&self, frame: &[u8], from: IfaceId);
}

/// Non-owning back-reference a transport invokes when a frame arrives.
///
/// Cheap to clone; safe to call from a transport RX thread or from within a
/// cooperative `tick()`. Delivery after the node is dropped is a no-op.
#[derive(Clone)]
pub struct FrameSink {
    dispatch: Weak<dyn FrameDispatch>,
    iface: IfaceId,
}

impl FrameSink {
    pub(crate) fn new(dispatch: Weak<dyn FrameDispatch>, iface: IfaceId) -> Self {
        Self { dispatch, iface }
    }

    /// Hand a received frame to the node.
    pub fn deliver(&self, frame: &[u8]) {
        if let Some(node) = self.dispatch.upgrade() {
            node.dispatch_frame(frame, self.iface);
        }
    }

    /// Which attached interface this sink feeds.
    pub fn iface(&self) -> IfaceId {
        self.iface
    }
}

impl std::fmt::Debug for FrameSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FrameSink({})", self.iface)
    }
}

/// The physical-layer contract.
///
/// `send` must be callable both from the thread running `Node::poll()` and
/// from the transport's own RX context; the node never holds its state lock
/// across a `send`.
pub trait Transport: Send + Sync {
    /// Human-readable interface name for logs and stats.
    fn name(&self) -> &str;

    /// Bring the carrier up. Returns false if it could not start.
    fn start(&self) -> bool;

    /// Tear the carrier down.
    fn stop(&self);

    /// Transmit one frame. Returns false on failure.
    fn send(&self, frame: &[u8]) -> bool;

    /// Whether the carrier is currently usable.
    fn online(&self) -> bool;

    fn mode(&self) -> InterfaceMode;

    /// Carrier bandwidth estimate in bits per second.
    fn bandwidth_bps(&self) -> u64;

    /// Share of bandwidth granted to forwarded announces. LoRa-class
    /// transports typically override this down to 1.0.
    fn announce_budget_percent(&self) -> f64 {
        DEFAULT_ANNOUNCE_BUDGET_PERCENT
    }

    /// Receive the sink to deliver inbound frames through. Called once at
    /// attach time.
    fn set_sink(&self, sink: FrameSink);

    /// Cooperative hook: drain buffered RX, poke hardware. Called from
    /// `Node::poll()`; transports with their own RX threads leave it empty.
    fn tick(&self) {}
}

// ============================================================================
// Counters
// ============================================================================

/// Per-interface traffic counters. Atomics so the send path can bump them
/// without the node lock.
#[derive(Debug, Default)]
pub struct IfaceCounters {
    tx_frames: AtomicU64,
    tx_bytes: AtomicU64,
    rx_frames: AtomicU64,
    rx_bytes: AtomicU64,
}

impl IfaceCounters {
    pub fn record_tx(&self, bytes: usize) {
        self.tx_frames.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_rx(&self, bytes: usize) {
        self.rx_frames.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn tx_frames(&self) -> u64 {
        self.tx_frames.load(Ordering::Relaxed)
    }

    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    pub fn rx_frames(&self) -> u64 {
        self.rx_frames.load(Ordering::Relaxed)
    }

    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }
}

/// Snapshot of one interface's state, via [`Node::iface_stats`](crate::Node::iface_stats).
#[derive(Debug, Clone)]
pub struct IfaceStats {
    pub id: IfaceId,
    pub name: String,
    pub online: bool,
    pub mode: InterfaceMode,
    pub bandwidth_bps: u64,
    pub announce_budget_bps: f64,
    pub announce_queue_len: usize,
    pub tx_frames: u64,
    pub tx_bytes: u64,
    pub rx_frames: u64,
    pub rx_bytes: u64,
}

// ============================================================================
// Announce queue + token bucket
// ============================================================================

/// One queued announce awaiting budget.
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueuedAnnounce {
    hop_count: u8,
    seq: u64,
    frame: Vec<u8>,
}

// Priority: lowest hop count first, then enqueue order.
impl Ord for QueuedAnnounce {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.hop_count, self.seq).cmp(&(other.hop_count, other.seq))
    }
}

impl PartialOrd for QueuedAnnounce {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Registry record for one attached transport: the transport handle plus the
/// announce-forwarding state the node keeps on its behalf.
pub(crate) struct Iface {
    pub id: IfaceId,
    pub transport: Arc<dyn Transport>,
    pub counters: Arc<IfaceCounters>,
    queue: BinaryHeap<Reverse<QueuedAnnounce>>,
    next_seq: u64,
    /// Token bucket: accumulated transmit credit in bits.
    available_bits: f64,
    last_service_ms: u64,
    announce_budget_bps: f64,
}

impl Iface {
    pub fn new(id: IfaceId, transport: Arc<dyn Transport>, now_ms: u64) -> Self {
        let announce_budget_bps =
            transport.bandwidth_bps() as f64 * transport.announce_budget_percent() / 100.0;
        Self {
            id,
            transport,
            counters: Arc::new(IfaceCounters::default()),
            queue: BinaryHeap::new(),
            next_seq: 0,
            available_bits: 0.0,
            last_service_ms: now_ms,
            announce_budget_bps,
        }
    }

    pub fn announce_budget_bps(&self) -> f64 {
        self.announce_budget_bps
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Queue a serialized announce for forwarding, prioritised by hop count.
    pub fn enqueue_announce(&mut self, frame: Vec<u8>, hop_count: u8) {
        let seq = self.next_seq;
        self.next_seq += 1;
        trace!(iface = %self.id, hop_count, seq, "announce queued");
        self.queue.push(Reverse(QueuedAnnounce {
            hop_count,
            seq,
            frame,
        }));
    }

    /// Advance the token bucket to `now_ms` and dequeue every announce the
    /// budget allows. Returned frames are transmitted by the caller *after*
    /// the node lock is released.
    pub fn service_announce_queue(&mut self, now_ms: u64) -> Vec<Vec<u8>> {
        let elapsed_ms = now_ms.saturating_sub(self.last_service_ms);
        self.last_service_ms = now_ms;

        // Burst cap: one second of budget.
        self.available_bits = (self.available_bits
            + elapsed_ms as f64 / 1000.0 * self.announce_budget_bps)
            .min(self.announce_budget_bps);

        let mut out = Vec::new();
        while let Some(Reverse(head)) = self.queue.peek() {
            let frame_bits = head.frame.len() as f64 * 8.0;
            // A frame larger than the burst cap transmits once the bucket is
            // saturated; otherwise it would pin the queue forever.
            let sendable = frame_bits <= self.available_bits
                || (frame_bits > self.announce_budget_bps
                    && self.available_bits >= self.announce_budget_bps);
            if !sendable {
                break;
            }
            self.available_bits = (self.available_bits - frame_bits).max(0.0);
            let Reverse(entry) = self.queue.pop().expect("peeked entry present");
            out.push(entry.frame);
        }
        out
    }

    /// Drop all queued announces (used on `stop()`).
    pub fn drain_queue(&mut self) {
        self.queue.clear();
    }

    pub fn stats(&self) -> IfaceStats {
        IfaceStats {
            id: self.id,
            name: self.transport.name().to_string(),
            online: self.transport.online(),
            mode: self.transport.mode(),
            bandwidth_bps: self.transport.bandwidth_bps(),
            announce_budget_bps: self.announce_budget_bps,
            announce_queue_len: self.queue.len(),
            tx_frames: self.counters.tx_frames(),
            tx_bytes: self.counters.tx_bytes(),
            rx_frames: self.counters.rx_frames(),
            rx_bytes: self.counters.rx_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    struct NullTransport {
        bandwidth_bps: u64,
        online: AtomicBool,
        sink: Mutex<Option<FrameSink>>,
    }

    impl NullTransport {
        fn new(bandwidth_bps: u64) -> Self {
            Self {
                bandwidth_bps,
                online: AtomicBool::new(true),
                sink: Mutex::new(None),
            }
        }
    }

    impl Transport for NullTransport {
        fn name(&self) -> &str {
            "null"
        }
        fn start(&self) -> bool {
            self.online.store(true, Ordering::SeqCst);
            true
        }
        fn stop(&self) {
            self.online.store(false, Ordering::SeqCst);
        }
        fn send(&self, _frame: &[u8]) -> bool {
            true
        }
        fn online(&self) -> bool {
            self.online.load(Ordering::SeqCst)
        }
        fn mode(&self) -> InterfaceMode {
            InterfaceMode::Full
        }
        fn bandwidth_bps(&self) -> u64 {
            self.bandwidth_bps
        }
        fn set_sink(&self, sink: FrameSink) {
            *self.sink.lock().unwrap() = Some(sink);
        }
    }

    fn test_iface(bandwidth_bps: u64) -> Iface {
        Iface::new(IfaceId(0), Arc::new(NullTransport::new(bandwidth_bps)), 0)
    }

    #[test]
    fn budget_is_percentage_of_bandwidth() {
        let iface = test_iface(1_000_000);
        assert_eq!(iface.announce_budget_bps(), 20_000.0); // 2% of 1 Mbps
    }

    #[test]
    fn queue_orders_by_hop_count_then_arrival() {
        let mut iface = test_iface(1_000_000_000); // effectively unlimited
        iface.enqueue_announce(vec![5; 10], 5);
        iface.enqueue_announce(vec![1; 10], 1);
        iface.enqueue_announce(vec![2; 10], 1);
        iface.enqueue_announce(vec![0; 10], 0);

        let sent = iface.service_announce_queue(1_000);
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[0], vec![0; 10]);
        assert_eq!(sent[1], vec![1; 10]); // hop 1, queued before the other hop-1
        assert_eq!(sent[2], vec![2; 10]);
        assert_eq!(sent[3], vec![5; 10]);
    }

    #[test]
    fn token_bucket_meters_dequeues() {
        // 8000 bps budget = 1000 bytes/s. 100-byte frames, 100 ms ticks:
        // one frame every tick, not more.
        let mut iface = test_iface(400_000); // 2% → 8000 bps
        for i in 0..10 {
            iface.enqueue_announce(vec![i; 100], 0);
        }

        let mut sent = 0;
        for tick in 1..=5u64 {
            sent += iface.service_announce_queue(tick * 100).len();
        }
        assert_eq!(sent, 5);
        assert_eq!(iface.queue_len(), 5);
    }

    #[test]
    fn token_bucket_burst_is_capped_at_one_second() {
        let mut iface = test_iface(400_000); // 8000 bps budget = 1000 B/s
        for i in 0..20 {
            iface.enqueue_announce(vec![i; 100], 0);
        }

        // A long idle gap must not bank more than one second of credit.
        let sent = iface.service_announce_queue(60_000);
        assert_eq!(sent.len(), 10); // 1000 bytes of credit / 100-byte frames
    }

    #[test]
    fn oversize_frame_sends_when_bucket_saturated() {
        let mut iface = test_iface(4_000); // 80 bps budget = 10 B/s
        iface.enqueue_announce(vec![0; 500], 0); // 4000 bits ≫ cap

        assert!(iface.service_announce_queue(10).is_empty());
        // Bucket saturates after one second; the oversize frame goes out.
        let sent = iface.service_announce_queue(2_000);
        assert_eq!(sent.len(), 1);
    }

    #[test]
    fn drain_clears_queue() {
        let mut iface = test_iface(1_000_000);
        iface.enqueue_announce(vec![0; 10], 0);
        iface.enqueue_announce(vec![1; 10], 1);
        iface.drain_queue();
        assert_eq!(iface.queue_len(), 0);
    }
}
