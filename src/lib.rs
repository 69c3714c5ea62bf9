//! # Mycorrhizal - Mesh Networking Stack
//!
//! Mycorrhizal is a mesh-networking stack that scales from 512 KB-RAM
//! microcontrollers to gateway servers:
//!
//! - **Identity**: Ed25519 + X25519 keypairs; 128-bit cryptographic
//!   addresses (`sha256(signing_pub)[0..16]`)
//! - **Discovery**: self-signed announcements build an identity cache and a
//!   distance-vector route table
//! - **Forwarding**: hop-prioritised announce propagation under per-interface
//!   bandwidth budgets; route-gated DATA forwarding with a TTL
//! - **Messaging**: end-to-end encrypted 1:1 channels and shared-key group
//!   conversations ("colonies")
//! - **Transfers**: payloads up to 64 KiB fragmented and reassembled with
//!   multi-transfer concurrency
//!
//! ## Architecture
//!
//! The core consumes physical carriers (UDP sockets, LoRa radios, serial
//! links) through one [`Transport`] contract and stays agnostic of the
//! deployment mode: cooperative single-threaded hosts drive the stack with
//! [`Node::poll`]; multi-threaded hosts deliver frames from transport RX
//! threads and loop `poll()` on a maintenance thread. All time flows through
//! a [`Clock`], which is what keeps those two modes on one code path.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `node` | High-level API: dispatch, forwarding, announces, colonies |
//! | `identity` | Keypairs, addresses, persistence blob, `Keystore` seam |
//! | `packet` | Wire codec: 32-byte header, integrity hash, signatures |
//! | `crypto` | E2EE and group AEAD, hashing, frame digests |
//! | `cache` | LRU identity cache |
//! | `routing` | Fewest-hops route table with age-out |
//! | `fragment` | Fragmentation protocol and reassembly state machine |
//! | `iface` | Transport contract, modes, announce queue + token bucket |
//! | `channel` | 1:1 encrypted conversations |
//! | `colony` | Group conversations and invitations |
//! | `config` | Tunables and platform tiers |
//! | `clock` | Time source abstraction |
//!
//! ## Security Model
//!
//! - No plaintext source address on the wire; senders are identified by
//!   signature against cached identities
//! - Packet signatures cover a canonical header view (`ttl` and `hop_count`
//!   zeroed) so they survive forwarding
//! - Announce acceptance requires a valid signature *and* the address
//!   deriving from the announced key
//! - Colony membership is group-key possession, by design
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::builder()
//!     .config(NodeConfig::for_tier(NodeTier::Edge).with_name("gateway-1"))
//!     .events(Arc::new(MyHandler))
//!     .build()?;
//! node.attach_transport(udp_transport);
//! node.start();
//! loop {
//!     node.poll();
//!     std::thread::sleep(Duration::from_millis(50));
//! }
//! ```

mod cache;
mod channel;
mod clock;
mod colony;
mod config;
mod crypto;
mod fragment;
mod iface;
mod identity;
mod node;
mod packet;
mod routing;

pub use channel::Channel;
pub use clock::{Clock, ManualClock, SystemClock};
pub use colony::{Colony, ColonyId, ColonyKeyMaterial, INVITE_PREFIX};
pub use config::{
    NodeConfig, NodeTier, DEFAULT_ANNOUNCE_BUDGET_PERCENT, DEFAULT_ANNOUNCE_INTERVAL_SECS,
    DEFAULT_DEDUPE_WINDOW, DEFAULT_FRAG_DATA_SIZE, DEFAULT_MAX_HOPS, DEFAULT_ROUTE_TIMEOUT_SECS,
    DEFAULT_TRANSFER_TIMEOUT_SECS, LORA_ANNOUNCE_BUDGET_PERCENT,
};
pub use crypto::{CryptoError, SignatureError};
pub use fragment::{
    CompletedTransfer, Fragment, FragmentError, Fragmenter, Metadata, TransferId,
    FRAGMENT_HEADER_SIZE, MAX_FRAGMENTS, MAX_TRANSFER_SIZE,
};
pub use iface::{
    FrameSink, IfaceCounters, IfaceId, IfaceStats, InterfaceMode, Transport, BOUNDARY_MAX_HOPS,
};
pub use identity::{Address, Identity, IdentityError, Keystore, PublicIdentity};
pub use node::{NoEvents, Node, NodeBuilder, NodeEvents, NodeStats, SendError};
pub use packet::{
    FrameError, Packet, PacketType, FLAG_ENCRYPTED, FLAG_FRAGMENTED, FLAG_PRIORITY, FLAG_SIGNED,
    HEADER_SIZE,
};
pub use routing::RouteEntry;
