//! Listen-port allocation for outbound tunnel interfaces.

use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;
use tracing::warn;

/// Hands out one UDP listen port per outbound-tunnel public key.
///
/// The mapping is bijective and stable: repeated `acquire` calls for the
/// same key return the same port, so an outbound tunnel keeps its source
/// port across reconciliations until the peer is removed.
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    assigned: Mutex<HashMap<String, u16>>,
}

impl PortAllocator {
    /// Creates an allocator handing out ports starting at `base`.
    #[must_use]
    pub fn new(base: u16) -> Self {
        Self {
            base,
            assigned: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the port assigned to `pubkey`, assigning the smallest free
    /// port at or above the base on first use.
    pub fn acquire(&self, pubkey: &str) -> u16 {
        let mut assigned = self.assigned.lock();
        if let Some(port) = assigned.get(pubkey) {
            return *port;
        }

        let used: BTreeSet<u16> = assigned.values().copied().collect();
        let mut port = self.base;
        while used.contains(&port) {
            port += 1;
        }
        assigned.insert(pubkey.to_string(), port);
        port
    }

    /// Drops the mapping for `pubkey`. Releasing an unknown key is logged
    /// and otherwise a no-op.
    pub fn release(&self, pubkey: &str) {
        if self.assigned.lock().remove(pubkey).is_none() {
            warn!(pubkey, "release of unassigned listen port");
        }
    }

    /// The port currently assigned to `pubkey`, if any.
    #[must_use]
    pub fn get(&self, pubkey: &str) -> Option<u16> {
        self.assigned.lock().get(pubkey).copied()
    }

    /// Number of live assignments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.assigned.lock().len()
    }

    /// Whether no port is assigned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.assigned.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_is_stable() {
        let ports = PortAllocator::new(51821);
        let port = ports.acquire("KA");
        assert_eq!(port, 51821);
        assert_eq!(ports.acquire("KA"), port);
        assert_eq!(ports.acquire("KA"), port);
    }

    #[test]
    fn acquire_hands_out_minimum_free() {
        let ports = PortAllocator::new(51821);
        assert_eq!(ports.acquire("KA"), 51821);
        assert_eq!(ports.acquire("KB"), 51822);
        assert_eq!(ports.acquire("KC"), 51823);

        ports.release("KB");
        assert_eq!(ports.acquire("KD"), 51822);
    }

    #[test]
    fn ports_never_collide() {
        let ports = PortAllocator::new(51821);
        let a = ports.acquire("KA");
        let b = ports.acquire("KB");
        ports.release("KA");
        let c = ports.acquire("KC");
        assert_ne!(b, c);
        // KA may get a new port, but never one held by another key.
        let a2 = ports.acquire("KA");
        assert_ne!(a2, b);
        assert_ne!(a2, c);
        let _ = a;
    }

    #[test]
    fn release_is_idempotent() {
        let ports = PortAllocator::new(51821);
        ports.acquire("KA");
        ports.release("KA");
        ports.release("KA");
        assert!(ports.is_empty());
    }
}
