//! # Node (Orchestrator)
//!
//! A [`Node`] glues the stack together: it owns the transport registry, the
//! identity cache, the route table, the dedupe window, in-flight transfers,
//! and colony state, and runs the inbound pipeline:
//!
//! 1. content-hash the raw frame, drop duplicates seen in the dedupe window
//! 2. decode; malformed frames are counted and dropped silently
//! 3. ANNOUNCE → verify, learn identity + route, forward per policy
//! 4. addressed to us → colony demux → fragment demux → `on_data`
//! 5. otherwise forward (hop-count gated) or drop
//!
//! ## Concurrency
//!
//! All mutable state sits behind one mutex. A dispatch acquires it once,
//! computes its transmissions and user events, releases, and only then
//! touches transports and callbacks — the lock is never held across a
//! physical `send` or a user callback. Single-threaded hosts drive
//! everything through [`Node::poll`]; multi-threaded hosts let transport RX
//! threads enter through their [`FrameSink`]s and run a maintenance thread
//! that loops `poll()`. `Node` itself is a cheap-to-clone handle.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, info, trace, warn};

use crate::cache::IdentityCache;
use crate::clock::{Clock, SystemClock};
use crate::colony::{Colony, ColonyId, ColonyKeyMaterial, INVITE_PREFIX};
use crate::config::NodeConfig;
use crate::crypto::{self, CryptoError};
use crate::fragment::{
    CompletedTransfer, FragmentError, FragmentOutcome, Fragmenter, Metadata, TransferId,
    TransferManager,
};
use crate::iface::{
    FrameDispatch, FrameSink, Iface, IfaceCounters, IfaceId, IfaceStats, InterfaceMode, Transport,
    BOUNDARY_MAX_HOPS,
};
use crate::identity::{Address, Identity, Keystore, PublicIdentity};
use crate::packet::{FrameError, Packet, PacketType, FLAG_FRAGMENTED};
use crate::routing::{RouteEntry, RouteTable};

// ============================================================================
// Errors
// ============================================================================

/// Error type for outbound sends. Everything here is synchronous; a send that
/// returns `Ok` has been handed to at least one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// No online transport to carry the frame.
    NoTransportOnline,
    /// Every selected transport refused the frame.
    TransmitFailed,
    /// The frame could not be encoded.
    Frame(FrameError),
    /// Sender-side fragmentation failure.
    Fragment(FragmentError),
    /// Encryption failure building a colony payload.
    Crypto(CryptoError),
    /// The colony id is not known to this node.
    UnknownColony,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::NoTransportOnline => write!(f, "no transport online"),
            SendError::TransmitFailed => write!(f, "all transports refused the frame"),
            SendError::Frame(e) => write!(f, "frame encoding failed: {e}"),
            SendError::Fragment(e) => write!(f, "fragmentation failed: {e}"),
            SendError::Crypto(e) => write!(f, "encryption failed: {e}"),
            SendError::UnknownColony => write!(f, "unknown colony"),
        }
    }
}

impl std::error::Error for SendError {}

impl From<FrameError> for SendError {
    fn from(e: FrameError) -> Self {
        SendError::Frame(e)
    }
}

impl From<FragmentError> for SendError {
    fn from(e: FragmentError) -> Self {
        SendError::Fragment(e)
    }
}

// ============================================================================
// Events
// ============================================================================

/// User-facing callbacks, one handler for all event kinds, supplied at build
/// time. Callbacks run outside the node lock and must not block; calling
/// back into the node (e.g. `send_data`) is allowed.
pub trait NodeEvents: Send + Sync {
    /// A DATA payload addressed to us (not a fragment, not colony traffic).
    /// `source` is the verified sender when the signature matched a cached
    /// identity.
    fn on_data(&self, payload: &[u8], source: Option<Address>, packet: &Packet) {
        let _ = (payload, source, packet);
    }

    /// A verified announce was absorbed into the identity cache.
    fn on_announce(&self, identity: &PublicIdentity, hop_count: u8, iface: IfaceId) {
        let _ = (identity, hop_count, iface);
    }

    /// A fragmented transfer completed reassembly.
    fn on_file_received(&self, transfer: &CompletedTransfer) {
        let _ = transfer;
    }

    /// A transfer made progress (fires per received fragment).
    fn on_transfer_progress(&self, transfer_id: TransferId, percent: f64) {
        let _ = (transfer_id, percent);
    }

    /// A colony message decrypted successfully.
    fn on_colony_message(
        &self,
        colony_id: ColonyId,
        sender: Option<Address>,
        sender_name: &str,
        message: &[u8],
    ) {
        let _ = (colony_id, sender, sender_name, message);
    }
}

/// Handler that ignores every event.
pub struct NoEvents;

impl NodeEvents for NoEvents {}

enum Event {
    Data {
        payload: Vec<u8>,
        source: Option<Address>,
        packet: Packet,
    },
    Announce {
        identity: PublicIdentity,
        hop_count: u8,
        iface: IfaceId,
    },
    File(CompletedTransfer),
    Progress {
        transfer_id: TransferId,
        percent: f64,
    },
    ColonyMessage {
        colony_id: ColonyId,
        sender: Option<Address>,
        sender_name: String,
        message: Vec<u8>,
    },
}

/// A transmission computed under the lock, executed after it is released.
struct Transmit {
    transport: Arc<dyn Transport>,
    counters: Arc<IfaceCounters>,
    frame: Vec<u8>,
}

impl Transmit {
    fn execute(&self) -> bool {
        let ok = self.transport.send(&self.frame);
        if ok {
            self.counters.record_tx(self.frame.len());
        }
        ok
    }
}

// ============================================================================
// Stats
// ============================================================================

/// Node-level counters, snapshotted by [`Node::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStats {
    pub rx_frames: u64,
    pub invalid_frames: u64,
    pub duplicate_frames: u64,
    pub verify_failures: u64,
    pub decrypt_failures: u64,
    pub data_delivered: u64,
    pub files_received: u64,
    pub forwarded_data: u64,
    pub announces_enqueued: u64,
    pub announces_sent: u64,
}

// ============================================================================
// Dedupe window
// ============================================================================

/// Short-term memory of recently seen frame digests. When full, the oldest
/// half is purged in one sweep.
struct SeenCache {
    set: HashSet<[u8; 32]>,
    order: VecDeque<[u8; 32]>,
    capacity: usize,
}

impl SeenCache {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            set: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a digest. Returns false if it was already present.
    fn insert(&mut self, digest: [u8; 32]) -> bool {
        if !self.set.insert(digest) {
            return false;
        }
        self.order.push_back(digest);
        if self.order.len() > self.capacity {
            for _ in 0..self.capacity / 2 {
                if let Some(old) = self.order.pop_front() {
                    self.set.remove(&old);
                }
            }
        }
        true
    }
}

// ============================================================================
// Node
// ============================================================================

struct NodeState {
    ifaces: Vec<Iface>,
    identity_cache: IdentityCache,
    routes: RouteTable,
    seen: SeenCache,
    transfers: TransferManager,
    colonies: HashMap<ColonyId, Colony>,
    /// Last hop-0 announcer per interface; the best next-hop guess for
    /// routes learned through that interface.
    direct_neighbors: HashMap<IfaceId, Address>,
    last_announce_ms: u64,
    auto_announce: bool,
    stats: NodeStats,
}

impl NodeState {
    fn iface(&self, id: IfaceId) -> Option<&Iface> {
        self.ifaces.get(id.0 as usize)
    }
}

struct NodeShared {
    identity: Identity,
    config: NodeConfig,
    clock: Arc<dyn Clock>,
    events: Arc<dyn NodeEvents>,
    state: Mutex<NodeState>,
}

/// A mesh network node. Cheap to clone; all clones share one underlying
/// state.
#[derive(Clone)]
pub struct Node {
    shared: Arc<NodeShared>,
}

/// Builder for [`Node`]. Identity comes from an explicit [`Identity`], a
/// [`Keystore`], or (by default) a fresh throwaway keypair.
pub struct NodeBuilder {
    identity: Option<Identity>,
    keystore: Option<Arc<dyn Keystore>>,
    config: NodeConfig,
    events: Option<Arc<dyn NodeEvents>>,
    clock: Option<Arc<dyn Clock>>,
}

impl NodeBuilder {
    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Load-or-generate the identity through a keystore at build time.
    /// Ignored when an explicit identity is set.
    pub fn keystore(mut self, keystore: Arc<dyn Keystore>) -> Self {
        self.keystore = Some(keystore);
        self
    }

    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn events(mut self, events: Arc<dyn NodeEvents>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> anyhow::Result<Node> {
        let identity = match (self.identity, self.keystore) {
            (Some(identity), _) => identity,
            (None, Some(keystore)) => crate::identity::load_or_generate(keystore.as_ref())?,
            (None, None) => Identity::generate(),
        };

        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let events = self.events.unwrap_or_else(|| Arc::new(NoEvents));
        let now = clock.now_ms();

        info!(
            name = %config.name,
            address = %identity.address(),
            "node initialized"
        );

        let state = NodeState {
            ifaces: Vec::new(),
            identity_cache: IdentityCache::new(config.max_cache_entries),
            routes: RouteTable::new(config.max_cache_entries, config.route_timeout_ms()),
            seen: SeenCache::new(config.dedupe_window),
            transfers: TransferManager::new(
                config.max_concurrent_transfers,
                config.transfer_timeout_ms(),
            ),
            colonies: HashMap::new(),
            direct_neighbors: HashMap::new(),
            last_announce_ms: now,
            auto_announce: false,
            stats: NodeStats::default(),
        };

        Ok(Node {
            shared: Arc::new(NodeShared {
                identity,
                config,
                clock,
                events,
                state: Mutex::new(state),
            }),
        })
    }
}

impl Node {
    pub fn builder() -> NodeBuilder {
        NodeBuilder {
            identity: None,
            keystore: None,
            config: NodeConfig::default(),
            events: None,
            clock: None,
        }
    }

    /// This node's 128-bit address.
    pub fn address(&self) -> Address {
        self.shared.identity.address()
    }

    /// The shareable public half of this node's identity.
    pub fn public_identity(&self) -> PublicIdentity {
        self.shared.identity.public()
    }

    pub fn name(&self) -> String {
        self.shared.config.name.clone()
    }

    pub(crate) fn identity(&self) -> &Identity {
        &self.shared.identity
    }

    // ------------------------------------------------------------------
    // Transports
    // ------------------------------------------------------------------

    /// Register a transport. The transport receives its [`FrameSink`]
    /// immediately and may start delivering as soon as it is online.
    pub fn attach_transport(&self, transport: Arc<dyn Transport>) -> IfaceId {
        let now = self.shared.clock.now_ms();
        let id = {
            let mut st = self.shared.lock_state();
            let id = IfaceId(st.ifaces.len() as u32);
            st.ifaces.push(Iface::new(id, transport.clone(), now));
            id
        };
        let weak: Weak<NodeShared> = Arc::downgrade(&self.shared);
        transport.set_sink(FrameSink::new(weak, id));
        info!(iface = %id, name = transport.name(), "transport attached");
        id
    }

    /// Bring all transports up; enables periodic announces and sends the
    /// first one immediately.
    pub fn start(&self) {
        let transports = self.transport_snapshot();
        for transport in &transports {
            let ok = transport.start();
            info!(
                name = transport.name(),
                online = ok,
                "transport {}",
                if ok { "online" } else { "failed to start" }
            );
        }
        {
            let mut st = self.shared.lock_state();
            st.auto_announce = true;
            st.last_announce_ms = self.shared.clock.now_ms();
        }
        if let Err(err) = self.announce() {
            warn!(error = %err, "initial announce failed");
        }
    }

    /// Stop all transports, drain announce queues, disable announcing.
    pub fn stop(&self) {
        let transports = {
            let mut st = self.shared.lock_state();
            st.auto_announce = false;
            for iface in &mut st.ifaces {
                iface.drain_queue();
            }
            st.ifaces
                .iter()
                .map(|i| i.transport.clone())
                .collect::<Vec<_>>()
        };
        for transport in transports {
            transport.stop();
        }
        info!(name = %self.shared.config.name, "node stopped");
    }

    fn transport_snapshot(&self) -> Vec<Arc<dyn Transport>> {
        self.shared
            .lock_state()
            .ifaces
            .iter()
            .map(|i| i.transport.clone())
            .collect()
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Send a DATA payload. Uses the route table when a live route exists,
    /// otherwise broadcasts on every online transport.
    pub fn send_data(
        &self,
        destination: Address,
        payload: Vec<u8>,
        sign: bool,
    ) -> Result<(), SendError> {
        self.send_data_with_flags(destination, payload, sign, 0)
    }

    /// [`send_data`](Self::send_data) with extra flag bits (e.g.
    /// [`FLAG_FRAGMENTED`]).
    pub fn send_data_with_flags(
        &self,
        destination: Address,
        payload: Vec<u8>,
        sign: bool,
        flags: u8,
    ) -> Result<(), SendError> {
        let mut packet = Packet::new(
            PacketType::Data,
            destination,
            payload,
            self.shared.config.max_hops,
        );
        packet.flags |= flags;
        if sign {
            packet.sign(&self.shared.identity);
        }
        let frame = packet.encode()?;

        let now = self.shared.clock.now_ms();
        let transmits = {
            let mut st = self.shared.lock_state();
            let route = st.routes.get(&destination, now);
            let routed = route.and_then(|route| {
                let iface = st.iface(route.iface)?;
                if iface.transport.online() {
                    Some(Transmit {
                        transport: iface.transport.clone(),
                        counters: iface.counters.clone(),
                        frame: frame.clone(),
                    })
                } else {
                    None
                }
            });
            match routed {
                Some(tx) => {
                    trace!(dest = %destination.short(), "sending via route");
                    vec![tx]
                }
                None => {
                    trace!(dest = %destination.short(), "no usable route, broadcasting");
                    Self::broadcast_transmits(&st, &frame)
                }
            }
        };

        Self::execute_transmits(transmits)
    }

    /// Announce our public identity on every online transport. Sent directly
    /// (self-announces are not subject to the forwarding budget).
    pub fn announce(&self) -> Result<(), SendError> {
        let mut packet = Packet::new(
            PacketType::Announce,
            self.address(),
            self.shared.identity.public().to_announce_payload().to_vec(),
            self.shared.config.max_hops,
        );
        packet.sign(&self.shared.identity);
        let frame = packet.encode()?;

        let transmits = {
            let mut st = self.shared.lock_state();
            st.last_announce_ms = self.shared.clock.now_ms();
            st.stats.announces_sent += 1;
            Self::broadcast_transmits(&st, &frame)
        };

        debug!(address = %self.address().short(), "announcing");
        Self::execute_transmits(transmits)
    }

    /// Send a payload of up to 64 KiB as a fragmented transfer. Returns the
    /// transfer id; there is no delivery acknowledgement.
    pub fn send_file(
        &self,
        destination: Address,
        data: &[u8],
        filename: Option<&str>,
        mime_type: Option<&str>,
    ) -> Result<TransferId, SendError> {
        let mut metadata = Metadata::new();
        metadata.insert("size".into(), data.len().to_string());
        if let Some(filename) = filename {
            metadata.insert("filename".into(), filename.to_string());
        }
        if let Some(mime_type) = mime_type {
            metadata.insert("mime_type".into(), mime_type.to_string());
        }

        let (fragments, transfer_id) = Fragmenter::fragment(
            data,
            &metadata,
            self.shared.config.frag_data_size,
            self.shared.clock.now_ms(),
        )?;

        info!(
            transfer = %transfer_id,
            bytes = data.len(),
            fragments = fragments.len(),
            "sending file"
        );
        for fragment in fragments {
            self.send_data_with_flags(destination, fragment, true, FLAG_FRAGMENTED)?;
        }
        Ok(transfer_id)
    }

    fn broadcast_transmits(st: &NodeState, frame: &[u8]) -> Vec<Transmit> {
        st.ifaces
            .iter()
            .filter(|i| i.transport.online())
            .map(|i| Transmit {
                transport: i.transport.clone(),
                counters: i.counters.clone(),
                frame: frame.to_vec(),
            })
            .collect()
    }

    fn execute_transmits(transmits: Vec<Transmit>) -> Result<(), SendError> {
        if transmits.is_empty() {
            return Err(SendError::NoTransportOnline);
        }
        let mut any_ok = false;
        for tx in &transmits {
            any_ok |= tx.execute();
        }
        if any_ok {
            Ok(())
        } else {
            Err(SendError::TransmitFailed)
        }
    }

    // ------------------------------------------------------------------
    // Colonies
    // ------------------------------------------------------------------

    /// Create a new colony; we become its first member.
    pub fn create_colony(&self, name: impl Into<String>) -> ColonyId {
        let mut colony = Colony::create(name);
        colony.add_member(
            self.address(),
            Some(self.public_identity()),
            Some(self.shared.config.name.clone()),
        );
        let id = colony.colony_id();
        info!(colony = %id, name = colony.name(), "created colony");
        self.shared.lock_state().colonies.insert(id, colony);
        id
    }

    /// Join a colony from shared key material.
    pub fn join_colony(&self, material: ColonyKeyMaterial) -> ColonyId {
        let id = material.colony_id;
        let name = material.name.clone();
        {
            let mut st = self.shared.lock_state();
            st.colonies
                .entry(id)
                .or_insert_with(|| Colony::from_key_material(material));
        }
        info!(colony = %id, name = %name, "joined colony");
        id
    }

    /// Join a colony from a textual `COLONY_INVITE:` payload.
    pub fn join_colony_invite(&self, invite: &str) -> Option<ColonyId> {
        ColonyKeyMaterial::parse_invite(invite).map(|material| self.join_colony(material))
    }

    /// The invitation string for one of our colonies.
    pub fn colony_invite(&self, colony_id: ColonyId) -> Option<String> {
        self.shared
            .lock_state()
            .colonies
            .get(&colony_id)
            .map(|c| c.invite())
    }

    /// Record a member of a colony explicitly (e.g. learned out-of-band).
    /// The identity cache fills in the member's keys when it has them.
    pub fn colony_add_member(&self, colony_id: ColonyId, address: Address) -> bool {
        let mut st = self.shared.lock_state();
        let identity = st.identity_cache.get(&address).cloned();
        match st.colonies.get_mut(&colony_id) {
            Some(colony) => {
                colony.add_member(address, identity, None);
                true
            }
            None => false,
        }
    }

    /// Known member addresses of a colony.
    pub fn colony_members(&self, colony_id: ColonyId) -> Vec<Address> {
        self.shared
            .lock_state()
            .colonies
            .get(&colony_id)
            .map(|c| c.member_addresses())
            .unwrap_or_default()
    }

    /// Send a message to every known colony member (unicast fan-out, signed,
    /// self-suppressed).
    pub fn colony_send(&self, colony_id: ColonyId, message: &[u8]) -> Result<(), SendError> {
        let (payload, members) = {
            let st = self.shared.lock_state();
            let colony = st
                .colonies
                .get(&colony_id)
                .ok_or(SendError::UnknownColony)?;
            let payload = colony.encrypt_message(message).map_err(SendError::Crypto)?;
            (payload, colony.member_addresses())
        };

        let own = self.address();
        let mut sent = 0usize;
        let mut last_err = None;
        for member in members.into_iter().filter(|m| *m != own) {
            match self.send_data(member, payload.clone(), true) {
                Ok(()) => sent += 1,
                Err(err) => last_err = Some(err),
            }
        }
        match (sent, last_err) {
            (0, Some(err)) => Err(err),
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// One cooperative scheduling pass: drain transport RX buffers, service
    /// announce queues against their budgets, expire transfers and routes,
    /// and fire the periodic announce when due. Single-threaded hosts call
    /// this in their main loop; multi-threaded hosts from a maintenance
    /// thread.
    pub fn poll(&self) {
        for transport in self.transport_snapshot() {
            transport.tick();
        }
        self.service_announce_queues();
        let now = self.shared.clock.now_ms();
        {
            let mut st = self.shared.lock_state();
            st.transfers.sweep_expired(now);
            st.routes.cleanup_expired(now);
        }
        self.check_announce();
    }

    /// Send the periodic announce if the interval has elapsed.
    pub fn check_announce(&self) {
        let due = {
            let st = self.shared.lock_state();
            st.auto_announce
                && self
                    .shared
                    .clock
                    .now_ms()
                    .saturating_sub(st.last_announce_ms)
                    >= self.shared.config.announce_interval_ms()
        };
        if due {
            if let Err(err) = self.announce() {
                debug!(error = %err, "periodic announce failed");
            }
        }
    }

    /// Service every interface's announce queue against its token bucket.
    fn service_announce_queues(&self) {
        let now = self.shared.clock.now_ms();
        let batches = {
            let mut st = self.shared.lock_state();
            let mut batches = Vec::new();
            for iface in &mut st.ifaces {
                if !iface.transport.online() {
                    continue;
                }
                let frames = iface.service_announce_queue(now);
                if !frames.is_empty() {
                    batches.push((iface.transport.clone(), iface.counters.clone(), frames));
                }
            }
            batches
        };

        for (transport, counters, frames) in batches {
            for frame in frames {
                if transport.send(&frame) {
                    counters.record_tx(frame.len());
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn stats(&self) -> NodeStats {
        self.shared.lock_state().stats.clone()
    }

    pub fn iface_stats(&self) -> Vec<IfaceStats> {
        self.shared
            .lock_state()
            .ifaces
            .iter()
            .map(|i| i.stats())
            .collect()
    }

    /// Number of identities currently cached.
    pub fn known_identities(&self) -> usize {
        self.shared.lock_state().identity_cache.len()
    }

    /// Cached public identity for an address, if any.
    pub fn lookup_identity(&self, address: &Address) -> Option<PublicIdentity> {
        self.shared
            .lock_state()
            .identity_cache
            .get(address)
            .cloned()
    }

    /// Number of live routes.
    pub fn route_count(&self) -> usize {
        self.shared.lock_state().routes.len()
    }

    /// The current route to `destination`, if one is live.
    pub fn route_to(&self, destination: &Address) -> Option<RouteEntry> {
        let now = self.shared.clock.now_ms();
        self.shared.lock_state().routes.get(destination, now)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Node(name='{}', address={})",
            self.shared.config.name,
            self.address().short()
        )
    }
}

// ============================================================================
// Inbound pipeline
// ============================================================================

impl NodeShared {
    fn lock_state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().expect("node state lock poisoned")
    }

    fn fire_events(&self, events: Vec<Event>) {
        for event in events {
            match event {
                Event::Data {
                    payload,
                    source,
                    packet,
                } => self.events.on_data(&payload, source, &packet),
                Event::Announce {
                    identity,
                    hop_count,
                    iface,
                } => self.events.on_announce(&identity, hop_count, iface),
                Event::File(transfer) => self.events.on_file_received(&transfer),
                Event::Progress {
                    transfer_id,
                    percent,
                } => self.events.on_transfer_progress(transfer_id, percent),
                Event::ColonyMessage {
                    colony_id,
                    sender,
                    sender_name,
                    message,
                } => self
                    .events
                    .on_colony_message(colony_id, sender, &sender_name, &message),
            }
        }
    }

    /// Verified-announce absorption: cache the identity, learn the route.
    fn handle_announce(
        &self,
        st: &mut NodeState,
        packet: &Packet,
        from: IfaceId,
        now: u64,
        events: &mut Vec<Event>,
    ) -> bool {
        if packet.payload.len() < 64 {
            st.stats.invalid_frames += 1;
            debug!(len = packet.payload.len(), "announce payload too short");
            return false;
        }
        let announced =
            PublicIdentity::from_announce_payload(&packet.payload).expect("length checked above");

        if !packet.is_signed() {
            st.stats.invalid_frames += 1;
            debug!("unsigned announce dropped");
            return false;
        }
        if packet.verify(&announced).is_err() {
            st.stats.verify_failures += 1;
            debug!(claimed = %packet.destination.short(), "announce signature invalid");
            return false;
        }
        if announced.address() != packet.destination {
            st.stats.invalid_frames += 1;
            debug!(
                claimed = %packet.destination.short(),
                derived = %announced.address().short(),
                "announce address does not match key"
            );
            return false;
        }

        // Echoes of our own announce come back through forwarders.
        if packet.destination == self.identity.address() {
            return false;
        }

        st.identity_cache
            .add(packet.destination, announced.clone(), from, now);

        let next_hop = if packet.hop_count == 0 {
            st.direct_neighbors.insert(from, packet.destination);
            None
        } else {
            st.direct_neighbors
                .get(&from)
                .copied()
                .or(Some(packet.destination))
        };
        st.routes
            .add_or_update(packet.destination, next_hop, from, packet.hop_count, now);

        debug!(
            address = %packet.destination.short(),
            hops = packet.hop_count,
            iface = %from,
            identities = st.identity_cache.len(),
            routes = st.routes.len(),
            "announce absorbed"
        );
        events.push(Event::Announce {
            identity: announced,
            hop_count: packet.hop_count,
            iface: from,
        });
        true
    }

    /// Queue a verified announce for forwarding on every other interface the
    /// mode policy allows.
    fn forward_announce(&self, st: &mut NodeState, packet: &Packet, from: IfaceId) {
        let mut forwarded = packet.clone();
        forwarded.increment_hop();
        if forwarded.hop_count >= self.config.max_hops || forwarded.is_expired() {
            return;
        }
        let frame = match forwarded.encode() {
            Ok(frame) => frame,
            Err(err) => {
                debug!(error = %err, "cannot re-encode announce for forwarding");
                return;
            }
        };

        for iface in &mut st.ifaces {
            if iface.id == from || !iface.transport.online() {
                continue;
            }
            match iface.transport.mode() {
                InterfaceMode::AccessPoint => continue,
                InterfaceMode::Boundary if forwarded.hop_count > BOUNDARY_MAX_HOPS => continue,
                _ => {}
            }
            iface.enqueue_announce(frame.clone(), forwarded.hop_count);
            st.stats.announces_enqueued += 1;
        }
    }

    /// Forward a DATA packet along its route. No route means drop: DATA
    /// never floods from a forwarder.
    fn forward_data(
        &self,
        st: &mut NodeState,
        packet: &Packet,
        now: u64,
        transmits: &mut Vec<Transmit>,
    ) {
        let mut forwarded = packet.clone();
        forwarded.increment_hop();
        if forwarded.hop_count >= self.config.max_hops || forwarded.is_expired() {
            trace!(dest = %forwarded.destination.short(), "hop limit reached, dropping");
            return;
        }

        let Some(route) = st.routes.get(&forwarded.destination, now) else {
            trace!(dest = %forwarded.destination.short(), "no route, dropping");
            return;
        };
        let Some((transport, counters)) = st.iface(route.iface).and_then(|iface| {
            iface
                .transport
                .online()
                .then(|| (iface.transport.clone(), iface.counters.clone()))
        }) else {
            trace!(
                dest = %forwarded.destination.short(),
                iface = %route.iface,
                "route iface missing or offline"
            );
            return;
        };
        match forwarded.encode() {
            Ok(frame) => {
                st.stats.forwarded_data += 1;
                transmits.push(Transmit {
                    transport,
                    counters,
                    frame,
                });
            }
            Err(err) => debug!(error = %err, "cannot re-encode packet for forwarding"),
        }
    }

    /// A DATA packet addressed to us: resolve the source, then demux in
    /// order — fragment, colony, invite, plain data.
    fn handle_local_data(
        &self,
        st: &mut NodeState,
        packet: Packet,
        now: u64,
        events: &mut Vec<Event>,
    ) {
        let source = if packet.is_signed() {
            let found = st
                .identity_cache
                .iter()
                .find(|(_, identity)| packet.verify(identity).is_ok())
                .map(|(address, _)| *address);
            if found.is_none() {
                // Signer unknown: deliver anonymously rather than drop.
                st.stats.verify_failures += 1;
            }
            found
        } else {
            None
        };

        if packet.is_fragmented() {
            match st.transfers.handle_fragment(&packet.payload, source, now) {
                Ok(FragmentOutcome::Completed(transfer)) => {
                    st.stats.files_received += 1;
                    events.push(Event::File(transfer));
                }
                Ok(FragmentOutcome::Progress {
                    transfer_id,
                    percent,
                }) => events.push(Event::Progress {
                    transfer_id,
                    percent,
                }),
                Err(err) => {
                    st.stats.invalid_frames += 1;
                    debug!(error = %err, "bad fragment");
                }
            }
            return;
        }

        // Colony demux: leading 16 payload bytes against known colony ids.
        if packet.payload.len() >= 16 {
            if let Some(colony_id) = ColonyId::from_slice(&packet.payload[..16]) {
                if st.colonies.contains_key(&colony_id) {
                    self.handle_colony_message(st, colony_id, &packet, source, events);
                    return;
                }
            }
        }

        // In-band invitation: auto-join, then still deliver the payload.
        if let Ok(text) = std::str::from_utf8(&packet.payload) {
            if text.starts_with(INVITE_PREFIX) {
                if let Some(material) = ColonyKeyMaterial::parse_invite(text) {
                    let id = material.colony_id;
                    let name = material.name.clone();
                    st.colonies
                        .entry(id)
                        .or_insert_with(|| Colony::from_key_material(material));
                    info!(colony = %id, name = %name, "auto-joined colony from invite");
                }
            }
        }

        st.stats.data_delivered += 1;
        events.push(Event::Data {
            payload: packet.payload.clone(),
            source,
            packet,
        });
    }

    fn handle_colony_message(
        &self,
        st: &mut NodeState,
        colony_id: ColonyId,
        packet: &Packet,
        source: Option<Address>,
        events: &mut Vec<Event>,
    ) {
        let identity_of_source = source.and_then(|address| st.identity_cache.get(&address).cloned());
        let colony = st
            .colonies
            .get_mut(&colony_id)
            .expect("caller checked membership");

        let plaintext = match colony.decrypt_message(&packet.payload) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                st.stats.decrypt_failures += 1;
                debug!(colony = %colony_id, "colony message failed to decrypt");
                return;
            }
        };

        // Decryption proved key possession: the sender is a member.
        if let Some(address) = source {
            if !colony.is_member(&address) {
                colony.add_member(address, identity_of_source, None);
                debug!(colony = %colony_id, member = %address.short(), "member auto-added");
            }
        }

        let sender_name = match &source {
            Some(address) => colony.member_name(address),
            None => "unknown".to_string(),
        };
        events.push(Event::ColonyMessage {
            colony_id,
            sender: source,
            sender_name,
            message: plaintext,
        });
    }
}

impl FrameDispatch for NodeShared {
    fn dispatch_frame(&self, frame: &[u8], from: IfaceId) {
        let now = self.clock.now_ms();
        let mut events: Vec<Event> = Vec::new();
        let mut transmits: Vec<Transmit> = Vec::new();

        {
            let mut st = self.lock_state();
            st.stats.rx_frames += 1;
            if let Some(iface) = st.iface(from) {
                iface.counters.record_rx(frame.len());
            }

            let digest = crypto::frame_digest(frame);
            if !st.seen.insert(digest) {
                st.stats.duplicate_frames += 1;
                trace!(iface = %from, "duplicate frame dropped");
                return;
            }

            let packet = match Packet::decode(frame) {
                Ok(packet) => packet,
                Err(err) => {
                    st.stats.invalid_frames += 1;
                    debug!(iface = %from, error = %err, "invalid frame dropped");
                    return;
                }
            };

            match packet.packet_type {
                PacketType::Announce => {
                    // Announces are absorbed regardless of addressing, and
                    // only verified ones propagate.
                    let accepted = self.handle_announce(&mut st, &packet, from, now, &mut events);
                    if accepted
                        && self.config.enable_forwarding
                        && packet.hop_count < self.config.max_hops
                    {
                        self.forward_announce(&mut st, &packet, from);
                    }
                }
                PacketType::Data => {
                    if packet.destination == self.identity.address() {
                        self.handle_local_data(&mut st, packet, now, &mut events);
                    } else if self.config.enable_forwarding
                        && packet.hop_count < self.config.max_hops
                    {
                        self.forward_data(&mut st, &packet, now, &mut transmits);
                    } else {
                        trace!(dest = %packet.destination.short(), "not ours, forwarding disabled");
                    }
                }
                other => {
                    trace!(packet_type = ?other, "unhandled packet type ignored");
                }
            }
        }

        for tx in &transmits {
            tx.execute();
        }
        self.fire_events(events);
    }
}
