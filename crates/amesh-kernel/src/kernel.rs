//! The kernel action trait and its recording fake.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ipnet::IpNet;
use parking_lot::Mutex;

use crate::error::KernelError;
use crate::Result;

/// Abstract surface over the kernel actions the reconciler may take.
///
/// Each method maps to exactly one observable kernel mutation. Callers on
/// the reconciliation path log failures and continue; the next
/// reconciliation reissues whatever is still part of the desired state.
#[allow(async_fn_in_trait)]
pub trait Kernel {
    /// Whether a network interface with this name exists.
    async fn iface_exists(&self, name: &str) -> bool;

    /// Creates a WireGuard interface.
    async fn iface_create(&self, name: &str) -> Result<()>;

    /// Deletes an interface. Routes via the interface disappear with it.
    async fn iface_delete(&self, name: &str) -> Result<()>;

    /// Brings an interface up.
    async fn iface_set_up(&self, name: &str) -> Result<()>;

    /// Enslaves an interface to a VRF device.
    async fn iface_set_master(&self, name: &str, vrf: &str) -> Result<()>;

    /// Adds an address to an interface.
    async fn iface_addr_add(&self, name: &str, cidr: &str) -> Result<()>;

    /// Flushes all addresses from an interface.
    async fn iface_addr_flush(&self, name: &str) -> Result<()>;

    /// Sets the private key and listen port of a WireGuard device.
    async fn wg_set_device(&self, name: &str, prvkey_path: &Path, listen_port: u16)
    -> Result<()>;

    /// Creates or updates a peer on a WireGuard device.
    async fn wg_set_peer(
        &self,
        name: &str,
        pubkey: &str,
        endpoint: Option<&str>,
        allowed_ips: &BTreeSet<IpNet>,
        keepalive: u32,
    ) -> Result<()>;

    /// Removes a peer from a WireGuard device.
    async fn wg_remove_peer(&self, name: &str, pubkey: &str) -> Result<()>;

    /// Installs a route; multiple nexthop devices produce an ECMP entry.
    async fn route_add(&self, prefix: &IpNet, nexthops: &[String]) -> Result<()>;

    /// Removes a route by prefix.
    async fn route_del(&self, prefix: &IpNet) -> Result<()>;
}

/// A value-typed record of one kernel action, as captured by [`FakeKernel`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KernelAction {
    /// `iface_create(name)`
    IfaceCreate(String),
    /// `iface_delete(name)`
    IfaceDelete(String),
    /// `iface_set_up(name)`
    IfaceSetUp(String),
    /// `iface_set_master(name, vrf)`
    IfaceSetMaster(String, String),
    /// `iface_addr_add(name, cidr)`
    IfaceAddrAdd(String, String),
    /// `iface_addr_flush(name)`
    IfaceAddrFlush(String),
    /// `wg_set_device(name, prvkey_path, listen_port)`
    WgSetDevice(String, PathBuf, u16),
    /// `wg_set_peer(name, pubkey, endpoint, allowed_ips, keepalive)`
    WgSetPeer {
        /// Device the peer is set on.
        dev: String,
        /// Peer public key.
        pubkey: String,
        /// Peer endpoint, if any.
        endpoint: Option<String>,
        /// Allowed IPs in canonical order.
        allowed_ips: Vec<String>,
        /// Persistent keepalive seconds (0 disables).
        keepalive: u32,
    },
    /// `wg_remove_peer(name, pubkey)`
    WgRemovePeer(String, String),
    /// `route_add(prefix, nexthops)`
    RouteAdd(String, Vec<String>),
    /// `route_del(prefix)`
    RouteDel(String),
}

/// A [`Kernel`] that records every action instead of touching the system.
///
/// Tests assert reconciliation plans as the ordered action list. A number
/// of upcoming failures can be injected; failing actions are still
/// recorded so retry behavior stays observable.
#[derive(Clone, Default)]
pub struct FakeKernel {
    actions: Arc<Mutex<Vec<KernelAction>>>,
    ifaces: Arc<Mutex<BTreeSet<String>>>,
    fail_next: Arc<AtomicUsize>,
}

impl FakeKernel {
    /// Creates an empty fake.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every recorded action, in order.
    #[must_use]
    pub fn actions(&self) -> Vec<KernelAction> {
        self.actions.lock().clone()
    }

    /// Drains the recorded actions.
    #[must_use]
    pub fn take_actions(&self) -> Vec<KernelAction> {
        std::mem::take(&mut *self.actions.lock())
    }

    /// Pre-seeds an interface so `iface_exists` reports it.
    pub fn add_existing_iface(&self, name: &str) {
        self.ifaces.lock().insert(name.to_string());
    }

    /// Names of interfaces currently existing in the fake.
    #[must_use]
    pub fn ifaces(&self) -> BTreeSet<String> {
        self.ifaces.lock().clone()
    }

    /// Makes the next `n` actions fail with [`KernelError::Injected`].
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    fn record(&self, action: KernelAction) -> Result<()> {
        self.actions.lock().push(action);
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(KernelError::Injected);
        }
        Ok(())
    }
}

impl Kernel for FakeKernel {
    async fn iface_exists(&self, name: &str) -> bool {
        self.ifaces.lock().contains(name)
    }

    async fn iface_create(&self, name: &str) -> Result<()> {
        self.record(KernelAction::IfaceCreate(name.to_string()))?;
        self.ifaces.lock().insert(name.to_string());
        Ok(())
    }

    async fn iface_delete(&self, name: &str) -> Result<()> {
        self.record(KernelAction::IfaceDelete(name.to_string()))?;
        self.ifaces.lock().remove(name);
        Ok(())
    }

    async fn iface_set_up(&self, name: &str) -> Result<()> {
        self.record(KernelAction::IfaceSetUp(name.to_string()))
    }

    async fn iface_set_master(&self, name: &str, vrf: &str) -> Result<()> {
        self.record(KernelAction::IfaceSetMaster(name.to_string(), vrf.to_string()))
    }

    async fn iface_addr_add(&self, name: &str, cidr: &str) -> Result<()> {
        self.record(KernelAction::IfaceAddrAdd(name.to_string(), cidr.to_string()))
    }

    async fn iface_addr_flush(&self, name: &str) -> Result<()> {
        self.record(KernelAction::IfaceAddrFlush(name.to_string()))
    }

    async fn wg_set_device(
        &self,
        name: &str,
        prvkey_path: &Path,
        listen_port: u16,
    ) -> Result<()> {
        self.record(KernelAction::WgSetDevice(
            name.to_string(),
            prvkey_path.to_path_buf(),
            listen_port,
        ))
    }

    async fn wg_set_peer(
        &self,
        name: &str,
        pubkey: &str,
        endpoint: Option<&str>,
        allowed_ips: &BTreeSet<IpNet>,
        keepalive: u32,
    ) -> Result<()> {
        self.record(KernelAction::WgSetPeer {
            dev: name.to_string(),
            pubkey: pubkey.to_string(),
            endpoint: endpoint.map(ToString::to_string),
            allowed_ips: allowed_ips.iter().map(ToString::to_string).collect(),
            keepalive,
        })
    }

    async fn wg_remove_peer(&self, name: &str, pubkey: &str) -> Result<()> {
        self.record(KernelAction::WgRemovePeer(name.to_string(), pubkey.to_string()))
    }

    async fn route_add(&self, prefix: &IpNet, nexthops: &[String]) -> Result<()> {
        self.record(KernelAction::RouteAdd(prefix.to_string(), nexthops.to_vec()))
    }

    async fn route_del(&self, prefix: &IpNet) -> Result<()> {
        self.record(KernelAction::RouteDel(prefix.to_string()))
    }
}
