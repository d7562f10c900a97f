//! Desired WireGuard peer state.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use amesh_kernel::Kernel;
use ipnet::IpNet;
use tracing::error;

/// A desired WireGuard peer on a specific interface.
///
/// Value equality over every field makes set difference between two FIBs
/// the install/uninstall plan. An outbound peer owns a dedicated per-peer
/// interface with its own listen port and device key; an inbound peer
/// lives on the shared server interface.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Peer {
    /// Interface the peer is configured on.
    pub wg_dev: String,
    /// Whether `wg_dev` is a dedicated per-peer outbound interface.
    pub outbound: bool,
    /// The peer's public key.
    pub pubkey: String,
    /// The peer's `host:port`, when it is a server.
    pub endpoint: Option<String>,
    /// Prefixes routed into the tunnel.
    pub allowed_ips: BTreeSet<IpNet>,
    /// Persistent keepalive seconds; 0 disables.
    pub keepalive: u32,
    /// Listen port of the outbound interface.
    pub listen_port: Option<u16>,
    /// Private key configured on the outbound interface.
    pub prvkey_path: Option<PathBuf>,
}

impl Peer {
    /// Drives the kernel toward this peer existing.
    ///
    /// For an outbound peer the per-peer interface is created, optionally
    /// enslaved to the VRF, brought up and keyed before the peer is set.
    /// Kernel failures are logged and swallowed; the next reconciliation
    /// reissues the same plan.
    pub async fn install<K: Kernel>(&self, kernel: &K, vrf: Option<&str>) {
        if self.outbound {
            log_failure(kernel.iface_create(&self.wg_dev).await);
            if let Some(vrf) = vrf {
                log_failure(kernel.iface_set_master(&self.wg_dev, vrf).await);
            }
            log_failure(kernel.iface_set_up(&self.wg_dev).await);
            if let (Some(port), Some(prvkey)) = (self.listen_port, self.prvkey_path.as_ref()) {
                log_failure(kernel.wg_set_device(&self.wg_dev, prvkey, port).await);
            }
        }
        log_failure(
            kernel
                .wg_set_peer(
                    &self.wg_dev,
                    &self.pubkey,
                    self.endpoint.as_deref(),
                    &self.allowed_ips,
                    self.keepalive,
                )
                .await,
        );
    }

    /// Drives the kernel toward this peer being gone.
    ///
    /// Deleting the outbound interface also implicitly drops every kernel
    /// route whose nexthop it was; the differ compensates by reinstalling
    /// surviving routes.
    pub async fn uninstall<K: Kernel>(&self, kernel: &K) {
        log_failure(kernel.wg_remove_peer(&self.wg_dev, &self.pubkey).await);
        if self.outbound {
            log_failure(kernel.iface_delete(&self.wg_dev).await);
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Peer dev={} pubkey={} endpoint={}>",
            self.wg_dev,
            self.pubkey,
            self.endpoint.as_deref().unwrap_or("None"),
        )
    }
}

pub(crate) fn log_failure(result: amesh_kernel::Result<()>) {
    if let Err(err) = result {
        error!(error = %err, "kernel action failed");
    }
}
