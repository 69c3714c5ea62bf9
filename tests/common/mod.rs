//! Shared test harness: in-memory loopback transports, a manual clock pump,
//! and an event recorder.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use mycorrhizal::{
    Address, ColonyId, CompletedTransfer, FrameSink, InterfaceMode, ManualClock, Node, NodeEvents,
    Packet, PublicIdentity, TransferId, Transport,
};

/// A fixed test epoch so schedules are deterministic.
pub const T0: u64 = 1_700_000_000_000;

pub fn init_tracing() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// Loopback transport
// ============================================================================

/// One end of an in-memory point-to-point link. `send` appends to the peer's
/// inbox; `tick` drains our own inbox into the node.
pub struct LoopbackTransport {
    name: String,
    mode: InterfaceMode,
    bandwidth_bps: u64,
    budget_percent: f64,
    online: AtomicBool,
    sink: Mutex<Option<FrameSink>>,
    peer: Mutex<Option<Arc<LoopbackTransport>>>,
    inbox: Mutex<VecDeque<Vec<u8>>>,
}

impl LoopbackTransport {
    pub fn new(name: &str, mode: InterfaceMode, bandwidth_bps: u64) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            mode,
            bandwidth_bps,
            budget_percent: 2.0,
            online: AtomicBool::new(false),
            sink: Mutex::new(None),
            peer: Mutex::new(None),
            inbox: Mutex::new(VecDeque::new()),
        })
    }

    pub fn with_budget(
        name: &str,
        mode: InterfaceMode,
        bandwidth_bps: u64,
        budget_percent: f64,
    ) -> Arc<Self> {
        Arc::new(Self {
            budget_percent,
            ..Self::unlinked(name, mode, bandwidth_bps)
        })
    }

    fn unlinked(name: &str, mode: InterfaceMode, bandwidth_bps: u64) -> Self {
        Self {
            name: name.to_string(),
            mode,
            bandwidth_bps,
            budget_percent: 2.0,
            online: AtomicBool::new(false),
            sink: Mutex::new(None),
            peer: Mutex::new(None),
            inbox: Mutex::new(VecDeque::new()),
        }
    }

    /// Create a linked pair: frames sent on one end arrive at the other.
    pub fn pair(name_a: &str, name_b: &str) -> (Arc<Self>, Arc<Self>) {
        let a = Self::new(name_a, InterfaceMode::Full, 100_000_000);
        let b = Self::new(name_b, InterfaceMode::Full, 100_000_000);
        Self::link(&a, &b);
        (a, b)
    }

    /// Cross-wire two ends into a link.
    pub fn link(a: &Arc<Self>, b: &Arc<Self>) {
        *a.peer.lock().unwrap() = Some(b.clone());
        *b.peer.lock().unwrap() = Some(a.clone());
    }

    /// Push a raw frame straight into this end's inbox, as if the peer had
    /// transmitted it. For crafted-frame tests.
    pub fn inject(&self, frame: Vec<u8>) {
        self.inbox.lock().unwrap().push_back(frame);
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl Transport for LoopbackTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) -> bool {
        self.online.store(true, Ordering::SeqCst);
        true
    }

    fn stop(&self) {
        self.online.store(false, Ordering::SeqCst);
    }

    fn send(&self, frame: &[u8]) -> bool {
        if !self.online() {
            return false;
        }
        let peer = self.peer.lock().unwrap().clone();
        match peer {
            Some(peer) => {
                peer.inbox.lock().unwrap().push_back(frame.to_vec());
                true
            }
            None => false,
        }
    }

    fn online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn mode(&self) -> InterfaceMode {
        self.mode
    }

    fn bandwidth_bps(&self) -> u64 {
        self.bandwidth_bps
    }

    fn announce_budget_percent(&self) -> f64 {
        self.budget_percent
    }

    fn set_sink(&self, sink: FrameSink) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    fn tick(&self) {
        loop {
            // Pop one frame at a time: delivery may send, which re-enters an
            // inbox lock somewhere.
            let frame = self.inbox.lock().unwrap().pop_front();
            let Some(frame) = frame else { break };
            let sink = self.sink.lock().unwrap().clone();
            if let Some(sink) = sink {
                sink.deliver(&frame);
            }
        }
    }
}

/// Advance time and poll every node until the mesh settles.
pub fn pump(clock: &ManualClock, nodes: &[&Node], rounds: usize, step_ms: u64) {
    for _ in 0..rounds {
        clock.advance(step_ms);
        for node in nodes {
            node.poll();
        }
    }
}

// ============================================================================
// Event recorder
// ============================================================================

#[derive(Debug, Clone)]
pub struct DataEvent {
    pub payload: Vec<u8>,
    pub source: Option<Address>,
    pub hop_count: u8,
}

#[derive(Debug, Clone)]
pub struct ColonyEvent {
    pub colony_id: ColonyId,
    pub sender: Option<Address>,
    pub sender_name: String,
    pub message: Vec<u8>,
}

/// Records every callback for later assertions.
#[derive(Default)]
pub struct Recorder {
    pub data: Mutex<Vec<DataEvent>>,
    pub announces: Mutex<Vec<(Address, u8)>>,
    pub files: Mutex<Vec<CompletedTransfer>>,
    pub progress: Mutex<Vec<(TransferId, f64)>>,
    pub colony_messages: Mutex<Vec<ColonyEvent>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn data_events(&self) -> Vec<DataEvent> {
        self.data.lock().unwrap().clone()
    }

    pub fn announce_events(&self) -> Vec<(Address, u8)> {
        self.announces.lock().unwrap().clone()
    }

    pub fn file_events(&self) -> Vec<CompletedTransfer> {
        self.files.lock().unwrap().clone()
    }

    pub fn progress_events(&self) -> Vec<(TransferId, f64)> {
        self.progress.lock().unwrap().clone()
    }

    pub fn colony_events(&self) -> Vec<ColonyEvent> {
        self.colony_messages.lock().unwrap().clone()
    }
}

impl NodeEvents for Recorder {
    fn on_data(&self, payload: &[u8], source: Option<Address>, packet: &Packet) {
        self.data.lock().unwrap().push(DataEvent {
            payload: payload.to_vec(),
            source,
            hop_count: packet.hop_count,
        });
    }

    fn on_announce(&self, identity: &PublicIdentity, hop_count: u8, _iface: mycorrhizal::IfaceId) {
        self.announces
            .lock()
            .unwrap()
            .push((identity.address(), hop_count));
    }

    fn on_file_received(&self, transfer: &CompletedTransfer) {
        self.files.lock().unwrap().push(transfer.clone());
    }

    fn on_transfer_progress(&self, transfer_id: TransferId, percent: f64) {
        self.progress.lock().unwrap().push((transfer_id, percent));
    }

    fn on_colony_message(
        &self,
        colony_id: ColonyId,
        sender: Option<Address>,
        sender_name: &str,
        message: &[u8],
    ) {
        self.colony_messages.lock().unwrap().push(ColonyEvent {
            colony_id,
            sender,
            sender_name: sender_name.to_string(),
            message: message.to_vec(),
        });
    }
}
