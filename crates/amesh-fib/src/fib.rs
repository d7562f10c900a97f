//! FIB construction and diff-based reconciliation.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;

use amesh_kernel::Kernel;
use amesh_node::{Node, NodeTable};
use ipnet::IpNet;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::peer::Peer;
use crate::ports::PortAllocator;
use crate::route::Route;

/// Local parameters the builder needs beyond the self-descriptor.
#[derive(Clone, Debug)]
pub struct BuildParams {
    /// The shared inbound interface, when this agent is a server.
    pub inbound_dev: Option<String>,
    /// Private key configured on every outbound interface.
    pub prvkey_path: PathBuf,
}

/// Name of the dedicated outbound interface for a peer public key.
///
/// A digest keeps the name deterministic and inside the kernel's 15-byte
/// interface-name limit; unlike a truncated key prefix, two keys only
/// collide if their SHA-256 digests share the leading 40 bits.
#[must_use]
pub fn outbound_ifname(pubkey: &str) -> String {
    let digest = Sha256::digest(pubkey.as_bytes());
    format!("wg-{}", hex::encode(&digest[..5]))
}

/// The peering predicate over two group sets.
///
/// Symmetric: `any` on either side is a wildcard, otherwise the sets must
/// intersect.
#[must_use]
pub fn check_group(a: &BTreeSet<String>, b: &BTreeSet<String>) -> bool {
    a.contains("any") || b.contains("any") || !a.is_disjoint(b)
}

/// The desired kernel state: WireGuard peers and IP routes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Fib {
    /// Desired peers.
    pub peers: HashSet<Peer>,
    /// Desired routes.
    pub routes: HashSet<Route>,
}

impl Fib {
    /// An empty FIB (nothing installed).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the FIB holds no peers and no routes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty() && self.routes.is_empty()
    }

    /// Computes the desired state from the self-descriptor and the node
    /// table.
    ///
    /// Pure with respect to its inputs: two tables equal as maps produce
    /// equal FIBs, and nexthop order follows the table's node-id order.
    /// Listen ports for outbound interfaces come from `ports`, which keeps
    /// them stable across rebuilds.
    #[must_use]
    pub fn build(
        self_node: &Node,
        table: &NodeTable,
        ports: &PortAllocator,
        params: &BuildParams,
    ) -> Self {
        let mut peers = HashSet::new();
        let mut index: HashMap<IpNet, Route> = HashMap::new();

        for (node_id, node) in table.iter() {
            let Some(pubkey) = &node.pubkey else {
                continue;
            };

            if !check_group(&self_node.groups, &node.groups) {
                debug!(node_id = %node_id, "node filtered by group membership");
                continue;
            }

            // Pure client-to-client pairs cannot peer.
            if node.endpoint.is_none() && self_node.endpoint.is_none() {
                continue;
            }

            let mut nexthop = None;

            if node.endpoint.is_some() {
                let wg_dev = outbound_ifname(pubkey);
                let listen_port = ports.acquire(pubkey);
                peers.insert(Peer {
                    wg_dev: wg_dev.clone(),
                    outbound: true,
                    pubkey: pubkey.clone(),
                    endpoint: node.endpoint.clone(),
                    allowed_ips: node.allowed_ips.clone(),
                    keepalive: node.keepalive,
                    listen_port: Some(listen_port),
                    prvkey_path: Some(params.prvkey_path.clone()),
                });
                nexthop = Some(wg_dev);
            }

            if self_node.endpoint.is_some() {
                if let Some(inbound) = &params.inbound_dev {
                    peers.insert(Peer {
                        wg_dev: inbound.clone(),
                        outbound: false,
                        pubkey: pubkey.clone(),
                        endpoint: node.endpoint.clone(),
                        allowed_ips: node.allowed_ips.clone(),
                        keepalive: node.keepalive,
                        listen_port: None,
                        prvkey_path: None,
                    });
                    if nexthop.is_none() {
                        nexthop = Some(inbound.clone());
                    }
                }
            }

            let Some(nexthop) = nexthop else {
                continue;
            };

            for prefix in &node.allowed_ips {
                index
                    .entry(*prefix)
                    .and_modify(|route| route.add_nexthop(nexthop.clone()))
                    .or_insert_with(|| Route::new(*prefix, nexthop.clone()));
            }
        }

        Self {
            peers,
            routes: index.into_values().collect(),
        }
    }

    /// Applies the delta from `old` (the installed state) to `self` (the
    /// freshly built state) through the kernel.
    ///
    /// Fixed phase order: remove peers, then stale routes, then add peers,
    /// then routes. Removing an outbound peer deletes its interface, which
    /// implicitly drops kernel routes via that interface; surviving routes
    /// that used one are therefore re-added even when the desired entry is
    /// unchanged.
    pub async fn reconcile<K: Kernel>(
        &self,
        old: &Fib,
        kernel: &K,
        ports: &PortAllocator,
        vrf: Option<&str>,
    ) {
        // Phase 1: peers that left the desired set, inbound first so the
        // shared device forgets the peer before its tunnel disappears.
        let surviving_outbound: HashSet<&str> = self
            .peers
            .iter()
            .filter(|p| p.outbound)
            .map(|p| p.pubkey.as_str())
            .collect();

        let mut deleted_ifaces = BTreeSet::new();
        for peer in removal_order(old.peers.difference(&self.peers)) {
            if peer.outbound {
                if !surviving_outbound.contains(peer.pubkey.as_str()) {
                    ports.release(&peer.pubkey);
                }
                deleted_ifaces.insert(peer.wg_dev.clone());
            }
            peer.uninstall(kernel).await;
        }

        // Phase 2: desired routes whose kernel entry vanished with a
        // deleted interface become distinct from the installed entry and
        // fall into the add set below.
        let desired: HashSet<Route> = self
            .routes
            .iter()
            .map(|route| {
                if route.uses_any(&deleted_ifaces) {
                    route.marked_removed()
                } else {
                    route.clone()
                }
            })
            .collect();

        // Phase 3: routes that left the desired set, unless the kernel
        // already dropped them together with an interface.
        for route in route_order(old.routes.iter()) {
            if !self.routes.contains(route) && !route.uses_any(&deleted_ifaces) {
                route.uninstall(kernel).await;
            }
        }

        // Phase 4: new peers, outbound first so nexthop interfaces exist
        // before any route references them.
        for peer in install_order(self.peers.difference(&old.peers)) {
            peer.install(kernel, vrf).await;
        }

        // Phase 5: new routes, including implicitly removed ones.
        for route in route_order(desired.iter()) {
            if !old.routes.contains(route) {
                route.install(kernel).await;
            }
        }
    }

    /// Removes every installed peer and route (shutdown path).
    pub async fn uninstall<K: Kernel>(&self, kernel: &K, ports: &PortAllocator) {
        let mut deleted_ifaces = BTreeSet::new();
        for peer in removal_order(self.peers.iter()) {
            if peer.outbound {
                ports.release(&peer.pubkey);
                deleted_ifaces.insert(peer.wg_dev.clone());
            }
            peer.uninstall(kernel).await;
        }
        for route in route_order(self.routes.iter()) {
            if !route.uses_any(&deleted_ifaces) {
                route.uninstall(kernel).await;
            }
        }
    }
}

/// Stable uninstall order: inbound peers first, then by device and key.
fn removal_order<'a>(peers: impl Iterator<Item = &'a Peer>) -> Vec<&'a Peer> {
    let mut ordered: Vec<_> = peers.collect();
    ordered.sort_by(|a, b| {
        (a.outbound, &a.wg_dev, &a.pubkey).cmp(&(b.outbound, &b.wg_dev, &b.pubkey))
    });
    ordered
}

/// Stable install order: outbound peers first, then by device and key.
fn install_order<'a>(peers: impl Iterator<Item = &'a Peer>) -> Vec<&'a Peer> {
    let mut ordered: Vec<_> = peers.collect();
    ordered.sort_by(|a, b| {
        (!a.outbound, &a.wg_dev, &a.pubkey).cmp(&(!b.outbound, &b.wg_dev, &b.pubkey))
    });
    ordered
}

/// Stable route order by prefix.
fn route_order<'a>(routes: impl Iterator<Item = &'a Route>) -> Vec<&'a Route> {
    let mut ordered: Vec<_> = routes.collect();
    ordered.sort_by_key(|r| r.prefix);
    ordered
}
