//! # Identity Cache
//!
//! Bounded store of public identities learned from announces. A cached
//! identity lets the node verify signatures from that sender and encrypt
//! traffic to it; the interface the announce arrived on is kept as a
//! return-path *hint* (it is never authoritative routing state — the route
//! table is).
//!
//! Eviction is LRU on insertion/update time: reads do not refresh an entry's
//! position, announces do.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::iface::IfaceId;
use crate::identity::{Address, PublicIdentity};

/// One cached remote identity.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub identity: PublicIdentity,
    /// Epoch ms of the announce that installed or refreshed this entry.
    pub last_seen_ms: u64,
    /// Interface the announce arrived on.
    pub receiving_iface: IfaceId,
}

/// Capacity-bounded LRU of address → public identity.
pub struct IdentityCache {
    entries: LruCache<Address, CacheEntry>,
}

impl IdentityCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("max(1) is nonzero");
        Self {
            entries: LruCache::new(capacity),
        }
    }

    /// Insert or refresh an identity. Evicts the least-recently-announced
    /// entry when at capacity.
    pub fn add(
        &mut self,
        address: Address,
        identity: PublicIdentity,
        receiving_iface: IfaceId,
        now_ms: u64,
    ) {
        self.entries.put(
            address,
            CacheEntry {
                identity,
                last_seen_ms: now_ms,
                receiving_iface,
            },
        );
    }

    /// Look up an identity without touching its eviction position.
    pub fn get(&self, address: &Address) -> Option<&PublicIdentity> {
        self.entries.peek(address).map(|e| &e.identity)
    }

    /// The interface we last heard this node on, if cached.
    pub fn receiving_iface(&self, address: &Address) -> Option<IfaceId> {
        self.entries.peek(address).map(|e| e.receiving_iface)
    }

    /// Iterate all cached (address, identity) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&Address, &PublicIdentity)> {
        self.entries.iter().map(|(addr, e)| (addr, &e.identity))
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.entries.contains(address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    fn fresh() -> (Address, PublicIdentity) {
        let id = Identity::generate();
        (id.address(), id.public())
    }

    #[test]
    fn add_and_get() {
        let mut cache = IdentityCache::new(10);
        let (addr, identity) = fresh();
        cache.add(addr, identity.clone(), IfaceId(0), 1_000);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&addr), Some(&identity));
        assert_eq!(cache.receiving_iface(&addr), Some(IfaceId(0)));
    }

    #[test]
    fn missing_address_is_none() {
        let cache = IdentityCache::new(10);
        let (addr, _) = fresh();
        assert!(cache.get(&addr).is_none());
        assert!(cache.receiving_iface(&addr).is_none());
    }

    #[test]
    fn re_announce_updates_iface_and_timestamp() {
        let mut cache = IdentityCache::new(10);
        let (addr, identity) = fresh();
        cache.add(addr, identity.clone(), IfaceId(0), 1_000);
        cache.add(addr, identity, IfaceId(3), 2_000);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.receiving_iface(&addr), Some(IfaceId(3)));
    }

    #[test]
    fn evicts_least_recently_announced() {
        let mut cache = IdentityCache::new(3);
        let entries: Vec<_> = (0..4).map(|_| fresh()).collect();

        for (i, (addr, identity)) in entries.iter().take(3).enumerate() {
            cache.add(*addr, identity.clone(), IfaceId(0), i as u64);
        }
        // Refresh the oldest, then overflow: the second-oldest must go.
        cache.add(entries[0].0, entries[0].1.clone(), IfaceId(0), 10);
        cache.add(entries[3].0, entries[3].1.clone(), IfaceId(0), 11);

        assert_eq!(cache.len(), 3);
        assert!(cache.contains(&entries[0].0));
        assert!(!cache.contains(&entries[1].0));
        assert!(cache.contains(&entries[2].0));
        assert!(cache.contains(&entries[3].0));
    }

    #[test]
    fn reads_do_not_refresh_eviction_position() {
        let mut cache = IdentityCache::new(2);
        let a = fresh();
        let b = fresh();
        let c = fresh();

        cache.add(a.0, a.1.clone(), IfaceId(0), 1);
        cache.add(b.0, b.1.clone(), IfaceId(0), 2);
        // Reading `a` must not save it from eviction.
        let _ = cache.get(&a.0);
        cache.add(c.0, c.1.clone(), IfaceId(0), 3);

        assert!(!cache.contains(&a.0));
        assert!(cache.contains(&b.0));
        assert!(cache.contains(&c.0));
    }
}
