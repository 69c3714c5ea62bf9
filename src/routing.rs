//! # Route Table
//!
//! Distance-vector route store populated from announces. Each destination
//! keeps at most one route: the fewest-hops path seen so far. Entries age out
//! after `route_timeout` (checked lazily on lookup) and the table is
//! LRU-bounded so a gateway hearing fifty thousand nodes and an MCU hearing
//! fifty both stay inside their memory budget.
//!
//! Update rules for an incoming `(destination, hops)` observation:
//! - unknown destination → insert (evicting the stalest entry when full)
//! - strictly fewer hops → overwrite
//! - equal hops over the same next hop → refresh the timestamp only
//! - anything worse → ignore

use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::trace;

use crate::iface::IfaceId;
use crate::identity::Address;

/// One route to a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub destination: Address,
    /// `None` means the destination is a directly reachable neighbour.
    pub next_hop: Option<Address>,
    /// Interface to transmit on when using this route.
    pub iface: IfaceId,
    pub hop_count: u8,
    /// Epoch ms of the announce that installed or refreshed this route.
    pub last_refresh_ms: u64,
}

/// Capacity-bounded, TTL-aged route table.
pub struct RouteTable {
    routes: LruCache<Address, RouteEntry>,
    route_timeout_ms: u64,
}

impl RouteTable {
    pub fn new(capacity: usize, route_timeout_ms: u64) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("max(1) is nonzero");
        Self {
            routes: LruCache::new(capacity),
            route_timeout_ms,
        }
    }

    /// Apply one routing observation. Returns true if the table changed
    /// (insert, better path, or refresh).
    pub fn add_or_update(
        &mut self,
        destination: Address,
        next_hop: Option<Address>,
        iface: IfaceId,
        hop_count: u8,
        now_ms: u64,
    ) -> bool {
        if let Some(existing) = self.routes.peek(&destination) {
            if hop_count < existing.hop_count {
                trace!(
                    dest = %destination.short(),
                    old_hops = existing.hop_count,
                    new_hops = hop_count,
                    "route improved"
                );
            } else if hop_count == existing.hop_count && next_hop == existing.next_hop {
                // Same path seen again: keep it alive, change nothing else.
                let mut refreshed = existing.clone();
                refreshed.last_refresh_ms = now_ms;
                self.routes.put(destination, refreshed);
                return true;
            } else {
                return false;
            }
        }

        self.routes.put(
            destination,
            RouteEntry {
                destination,
                next_hop,
                iface,
                hop_count,
                last_refresh_ms: now_ms,
            },
        );
        true
    }

    /// Look up the route to `destination`. An entry older than the route
    /// timeout is removed and `None` returned.
    pub fn get(&mut self, destination: &Address, now_ms: u64) -> Option<RouteEntry> {
        let expired = match self.routes.peek(destination) {
            Some(route) => now_ms.saturating_sub(route.last_refresh_ms) > self.route_timeout_ms,
            None => return None,
        };
        if expired {
            trace!(dest = %destination.short(), "route expired");
            self.routes.pop(destination);
            return None;
        }
        self.routes.peek(destination).cloned()
    }

    /// Drop a route outright (e.g. after repeated send failures).
    pub fn remove(&mut self, destination: &Address) {
        self.routes.pop(destination);
    }

    /// Sweep all expired routes; returns how many were removed.
    pub fn cleanup_expired(&mut self, now_ms: u64) -> usize {
        let expired: Vec<Address> = self
            .routes
            .iter()
            .filter(|(_, r)| now_ms.saturating_sub(r.last_refresh_ms) > self.route_timeout_ms)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in &expired {
            self.routes.pop(addr);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
