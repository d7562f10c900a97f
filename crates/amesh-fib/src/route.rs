//! Desired IP route state.

use std::collections::BTreeSet;
use std::fmt;

use amesh_kernel::Kernel;
use ipnet::IpNet;

use crate::peer::log_failure;

/// A desired route: one prefix reached over one or more tunnel interfaces.
///
/// The nexthop list is ordered as built (several devices make an ECMP
/// entry). `removed_implicitly` participates in equality: when an
/// interface deletion drops a kernel route out from under a prefix that is
/// still desired, the differ marks the surviving route so it compares
/// unequal to the installed one and is re-added.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Route {
    /// Destination prefix.
    pub prefix: IpNet,
    /// Nexthop interfaces, in build order.
    pub wg_devs: Vec<String>,
    /// Set when the kernel route vanished with a deleted interface.
    pub removed_implicitly: bool,
}

impl Route {
    /// Creates a route with a single nexthop.
    #[must_use]
    pub fn new(prefix: IpNet, wg_dev: String) -> Self {
        Self {
            prefix,
            wg_devs: vec![wg_dev],
            removed_implicitly: false,
        }
    }

    /// Appends a nexthop device, ignoring duplicates.
    pub fn add_nexthop(&mut self, wg_dev: String) {
        if !self.wg_devs.contains(&wg_dev) {
            self.wg_devs.push(wg_dev);
        }
    }

    /// Whether any nexthop is among `ifaces`.
    #[must_use]
    pub fn uses_any(&self, ifaces: &BTreeSet<String>) -> bool {
        self.wg_devs.iter().any(|dev| ifaces.contains(dev))
    }

    /// A copy flagged as implicitly removed.
    #[must_use]
    pub fn marked_removed(&self) -> Self {
        Self {
            removed_implicitly: true,
            ..self.clone()
        }
    }

    /// Installs the route. Failures are logged and swallowed.
    pub async fn install<K: Kernel>(&self, kernel: &K) {
        log_failure(kernel.route_add(&self.prefix, &self.wg_devs).await);
    }

    /// Removes the route. Failures are logged and swallowed.
    pub async fn uninstall<K: Kernel>(&self, kernel: &K) {
        log_failure(kernel.route_del(&self.prefix).await);
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Route {} via {}>", self.prefix, self.wg_devs.join(","))
    }
}
