//! # Node Configuration
//!
//! All tunable knobs of the stack core live in [`NodeConfig`], with defaults
//! matching the wire-compatible reference behaviour. Capacity-related
//! defaults come from the [`NodeTier`] the node is built for:
//!
//! | Tier | Identity/route cache | Concurrent transfers |
//! |---|---|---|
//! | `Mcu` | 50 | 5 |
//! | `Edge` | 1,000 | 10 |
//! | `Gateway` | 50,000 | 10 |
//!
//! The config is plain data (serde-derived) so host applications can load it
//! from a file; nothing in the core reads the environment or a CLI.

use serde::{Deserialize, Serialize};

/// Default period between self-announces (§ announce_interval), in seconds.
pub const DEFAULT_ANNOUNCE_INTERVAL_SECS: u64 = 300;

/// Default hop-count ceiling. Packets at or above this are dropped instead of
/// forwarded.
pub const DEFAULT_MAX_HOPS: u8 = 128;

/// Default route age-out, in seconds (30 minutes).
pub const DEFAULT_ROUTE_TIMEOUT_SECS: u64 = 1800;

/// Default reassembly timeout for a fragmented transfer, in seconds.
pub const DEFAULT_TRANSFER_TIMEOUT_SECS: u64 = 60;

/// Default share of interface bandwidth granted to forwarded announces.
pub const DEFAULT_ANNOUNCE_BUDGET_PERCENT: f64 = 2.0;

/// Announce budget used for LoRa-class links.
pub const LORA_ANNOUNCE_BUDGET_PERCENT: f64 = 1.0;

/// Default per-fragment data bytes. Sized so a signed fragment fits a 255-byte
/// LoRa frame: 255 - header(32) - signature(64) - fragment header(18) = 141.
pub const DEFAULT_FRAG_DATA_SIZE: usize = 140;

/// Default number of recent frame digests kept for duplicate suppression.
pub const DEFAULT_DEDUPE_WINDOW: usize = 1000;

/// Capacity tier of the host platform.
///
/// Mirrors the deployment classes the stack targets: 512 KB-RAM
/// microcontrollers, edge boxes, and gateway servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeTier {
    Mcu,
    Edge,
    Gateway,
}

impl NodeTier {
    /// Identity-cache / route-table capacity for this tier.
    pub fn max_cache_entries(self) -> usize {
        match self {
            NodeTier::Mcu => 50,
            NodeTier::Edge => 1_000,
            NodeTier::Gateway => 50_000,
        }
    }

    /// Concurrent in-flight reassembly cap for this tier.
    pub fn max_concurrent_transfers(self) -> usize {
        match self {
            NodeTier::Mcu => 5,
            NodeTier::Edge | NodeTier::Gateway => 10,
        }
    }
}

/// Configuration for a [`Node`](crate::Node).
///
/// `NodeConfig::default()` is an Edge-tier node with the reference defaults;
/// `NodeConfig::for_tier()` picks capacity limits for a specific platform
/// class.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Human-readable node name, used only in logs.
    pub name: String,
    /// Period for periodic self-announces, seconds.
    pub announce_interval_secs: u64,
    /// Whether this node forwards traffic for others.
    pub enable_forwarding: bool,
    /// Hop-count ceiling for forwarded packets.
    pub max_hops: u8,
    /// Route entry age-out, seconds.
    pub route_timeout_secs: u64,
    /// Reassembly timeout per transfer, seconds.
    pub transfer_timeout_secs: u64,
    /// Concurrent in-flight reassemblies.
    pub max_concurrent_transfers: usize,
    /// Identity cache and route table capacity.
    pub max_cache_entries: usize,
    /// Data bytes per fragment.
    pub frag_data_size: usize,
    /// Recent-frame digests kept for duplicate suppression.
    pub dedupe_window: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::for_tier(NodeTier::Edge)
    }
}

impl NodeConfig {
    /// Reference defaults with capacity limits for `tier`.
    pub fn for_tier(tier: NodeTier) -> Self {
        Self {
            name: "node".to_string(),
            announce_interval_secs: DEFAULT_ANNOUNCE_INTERVAL_SECS,
            enable_forwarding: true,
            max_hops: DEFAULT_MAX_HOPS,
            route_timeout_secs: DEFAULT_ROUTE_TIMEOUT_SECS,
            transfer_timeout_secs: DEFAULT_TRANSFER_TIMEOUT_SECS,
            max_concurrent_transfers: tier.max_concurrent_transfers(),
            max_cache_entries: tier.max_cache_entries(),
            frag_data_size: DEFAULT_FRAG_DATA_SIZE,
            dedupe_window: DEFAULT_DEDUPE_WINDOW,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub(crate) fn announce_interval_ms(&self) -> u64 {
        self.announce_interval_secs * 1000
    }

    pub(crate) fn route_timeout_ms(&self) -> u64 {
        self.route_timeout_secs * 1000
    }

    pub(crate) fn transfer_timeout_ms(&self) -> u64 {
        self.transfer_timeout_secs * 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_capacities() {
        assert_eq!(NodeTier::Mcu.max_cache_entries(), 50);
        assert_eq!(NodeTier::Edge.max_cache_entries(), 1_000);
        assert_eq!(NodeTier::Gateway.max_cache_entries(), 50_000);
        assert_eq!(NodeTier::Mcu.max_concurrent_transfers(), 5);
        assert_eq!(NodeTier::Gateway.max_concurrent_transfers(), 10);
    }

    #[test]
    fn defaults_match_reference_values() {
        let config = NodeConfig::default();
        assert_eq!(config.announce_interval_secs, 300);
        assert_eq!(config.max_hops, 128);
        assert_eq!(config.route_timeout_secs, 1800);
        assert_eq!(config.transfer_timeout_secs, 60);
        assert_eq!(config.frag_data_size, 140);
        assert_eq!(config.dedupe_window, 1000);
        assert!(config.enable_forwarding);
    }

    #[test]
    fn with_name_overrides_only_the_name() {
        let config = NodeConfig::for_tier(NodeTier::Mcu).with_name("sensor-7");
        assert_eq!(config.name, "sensor-7");
        assert_eq!(config.max_cache_entries, 50);
    }
}
