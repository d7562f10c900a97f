//! The agent supervisor.
//!
//! Two workers over shared, mutex-guarded state: the *maintainer* keeps
//! this node registered in the directory under a renewable lease and folds
//! tracked address changes into the advertised descriptor; the *watcher*
//! mirrors the directory into the node table and reconciles the kernel
//! after every observed change. Neither worker holds the state mutex
//! across directory I/O or kernel actions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use amesh_directory::{
    Directory, DirectoryClient, DirectoryError, EventType, Watcher, derive_lease_id, events_of,
};
use amesh_fib::{BuildParams, Fib, PortAllocator};
use amesh_kernel::{AddrAction, AddrEvent, DevTracker, Kernel};
use amesh_node::{Node, NodeTable, codec};
use ipnet::IpNet;
use parking_lot::Mutex;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::error::{AgentError, ConfigError};

/// Seconds between lease refreshes.
pub const LEASE_KEEPALIVE: u64 = 5;
/// Lease TTL: three missed refreshes and the registration expires.
pub const LEASE_TTL: i64 = LEASE_KEEPALIVE as i64 * 3;
/// Back-off after a transient directory failure.
const RETRY_INTERVAL: Duration = Duration::from_secs(1);
/// Maintainer tick.
const TICK: Duration = Duration::from_secs(1);

/// State shared between the workers, guarded by one agent-wide mutex.
struct Shared {
    self_node: Node,
    node_table: NodeTable,
    fib: Fib,
    watch_cancel: Option<Watcher>,
}

/// The agent: configuration, directory access, kernel surface, and the
/// two worker loops.
pub struct Agent<K> {
    config: AgentConfig,
    directory: Directory,
    kernel: K,
    ports: PortAllocator,
    params: BuildParams,
    shared: Mutex<Shared>,
    shutdown: broadcast::Sender<()>,
    stopped: AtomicBool,
}

impl<K: Kernel> Agent<K> {
    /// Creates an agent from validated configuration.
    pub fn new(config: AgentConfig, kernel: K) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let shared = Shared {
            self_node: config.self_node(),
            node_table: NodeTable::new(),
            fib: Fib::new(),
            watch_cancel: None,
        };
        Self {
            directory: Directory::new(config.directory.clone()),
            ports: PortAllocator::new(config.portbase),
            params: config.build_params(),
            kernel,
            shared: Mutex::new(shared),
            shutdown,
            stopped: AtomicBool::new(false),
            config,
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Runs until SIGINT or SIGTERM, then tears down every installed peer
    /// and route.
    pub async fn run(&self) -> Result<(), AgentError> {
        info!(
            node_id = %self.config.node_id,
            prefix = %self.directory.prefix(),
            "starting agent"
        );

        self.init_inbound_device().await?;

        let mut tracker = DevTracker::new(self.config.tracked_devices.iter().cloned());
        if !self.config.tracked_devices.is_empty() {
            tracker.start().await?;
        }

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        let workers = async {
            tokio::join!(self.maintainer_loop(&tracker), self.watcher_loop());
        };
        tokio::pin!(workers);

        let workers_done = tokio::select! {
            () = &mut workers => {
                warn!("workers exited before any shutdown signal");
                true
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down");
                false
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down");
                false
            }
        };

        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(());

        // Wake the watcher out of its blocking stream read.
        let cancel = self.shared.lock().watch_cancel.take();
        if let Some(mut watcher) = cancel {
            let _ = watcher.cancel().await;
        }

        if !workers_done {
            workers.await;
        }

        let fib = std::mem::take(&mut self.shared.lock().fib);
        fib.uninstall(&self.kernel, &self.ports).await;

        info!("agent stopped");
        Ok(())
    }

    /// Validates the VRF and (re)creates the shared inbound interface.
    ///
    /// Unlike reconciliation-path actions, failures here are fatal: an
    /// agent that cannot set up its own device has nothing to converge to.
    async fn init_inbound_device(&self) -> Result<(), AgentError> {
        if let Some(vrf) = &self.config.vrf {
            if !self.kernel.iface_exists(vrf).await {
                return Err(
                    ConfigError::Invalid(format!("vrf interface {vrf} does not exist")).into(),
                );
            }
        }

        let Some(device) = &self.config.device else {
            return Ok(());
        };

        info!(device = %device, "setting up inbound wireguard interface");

        if self.kernel.iface_exists(device).await {
            self.kernel.iface_delete(device).await?;
        }
        self.kernel.iface_create(device).await?;
        if let Some(vrf) = &self.config.vrf {
            self.kernel.iface_set_master(device, vrf).await?;
        }
        self.kernel.iface_set_up(device).await?;
        if let Some(address) = &self.config.address {
            self.kernel.iface_addr_flush(device).await?;
            self.kernel.iface_addr_add(device, address).await?;
        }
        self.kernel
            .wg_set_device(device, &self.config.prvkey_path, self.config.port)
            .await?;
        Ok(())
    }

    // ---- maintainer ----

    async fn maintainer_loop(&self, tracker: &DevTracker) {
        let mut shutdown = self.shutdown.subscribe();
        let mut cycle_shutdown = self.shutdown.subscribe();
        let mut failing = false;
        loop {
            if self.is_stopped() {
                return;
            }
            let result = tokio::select! {
                _ = shutdown.recv() => return,
                result = self.maintain_cycle(tracker, &mut cycle_shutdown, &mut failing) => result,
            };
            match result {
                Ok(()) => return,
                Err(err) => {
                    if !failing {
                        error!(error = %err, "directory registration failed, retrying");
                        failing = true;
                    }
                }
            }
            tokio::select! {
                _ = shutdown.recv() => return,
                () = tokio::time::sleep(RETRY_INTERVAL) => {}
            }
        }
    }

    /// One registration lifetime: allocate the deterministic lease, put
    /// every descriptor field under it, then tick at 1 Hz draining tracker
    /// events and refreshing the lease. Returns `Ok` only on shutdown.
    async fn maintain_cycle(
        &self,
        tracker: &DevTracker,
        shutdown: &mut broadcast::Receiver<()>,
        failing: &mut bool,
    ) -> Result<(), DirectoryError> {
        let mut client = self.directory.connect().await?;
        let lease = client
            .lease_allocate(LEASE_TTL, derive_lease_id(&self.config.node_id))
            .await?;
        self.register(&mut client, lease).await?;
        *failing = false;
        info!(node_id = %self.config.node_id, "registered in directory");

        let mut ticks: u64 = 0;
        loop {
            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                () = tokio::time::sleep(TICK) => {}
            }
            if self.is_stopped() {
                return Ok(());
            }

            self.drain_tracker(&mut client, tracker, lease).await?;

            ticks += 1;
            if ticks % LEASE_KEEPALIVE == 0 {
                client.lease_refresh(lease).await?;
                debug!("lease refreshed");
            }
        }
    }

    /// Puts every serialized field of the self-descriptor under the lease.
    async fn register(&self, client: &mut DirectoryClient, lease: i64) -> Result<(), DirectoryError> {
        let fields = self.shared.lock().self_node.serialize();
        for (field, value) in fields {
            let key = codec::node_key(self.directory.prefix(), &self.config.node_id, field);
            client.put(&key, &value, Some(lease)).await?;
        }
        Ok(())
    }

    /// Folds queued address-tracker events into the self-descriptor,
    /// re-putting the advertised prefixes once per observed change.
    async fn drain_tracker(
        &self,
        client: &mut DirectoryClient,
        tracker: &DevTracker,
        lease: i64,
    ) -> Result<(), DirectoryError> {
        while let Some(event) = tracker.pop() {
            let Some(value) = self.apply_addr_event(&event) else {
                continue;
            };
            info!(
                device = %event.device,
                prefix = %event.prefix,
                action = ?event.action,
                "tracked address change, re-advertising prefixes"
            );
            let key = codec::node_key(self.directory.prefix(), &self.config.node_id, "allowed_ips");
            client.put(&key, &value, Some(lease)).await?;
        }
        Ok(())
    }

    /// Applies one tracker event to the self-descriptor, returning the new
    /// advertised `allowed_ips` value when it actually changed.
    fn apply_addr_event(&self, event: &AddrEvent) -> Option<String> {
        let mut shared = self.shared.lock();
        let prefix = IpNet::V4(event.prefix);
        let changed = match event.action {
            AddrAction::Add => shared.self_node.allowed_ips.insert(prefix),
            AddrAction::Del => shared.self_node.allowed_ips.remove(&prefix),
        };
        if !changed {
            return None;
        }
        shared
            .self_node
            .serialize()
            .into_iter()
            .find(|(field, _)| *field == "allowed_ips")
            .map(|(_, value)| value)
    }

    // ---- watcher ----

    async fn watcher_loop(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let mut cycle_shutdown = self.shutdown.subscribe();
        let mut failing = false;
        loop {
            if self.is_stopped() {
                return;
            }
            let result = tokio::select! {
                _ = shutdown.recv() => return,
                result = self.watch_cycle(&mut cycle_shutdown, &mut failing) => result,
            };
            match result {
                Ok(()) => return,
                Err(err) => {
                    self.shared.lock().watch_cancel = None;
                    if !failing {
                        error!(error = %err, "directory watch failed, retrying");
                        failing = true;
                    }
                }
            }
            tokio::select! {
                _ = shutdown.recv() => return,
                () = tokio::time::sleep(RETRY_INTERVAL) => {}
            }
        }
    }

    /// One watch lifetime: resynchronize the node table from a prefix
    /// snapshot, then apply ordered watch events until the stream breaks
    /// or shutdown cancels it. Returns `Ok` only on shutdown.
    async fn watch_cycle(
        &self,
        shutdown: &mut broadcast::Receiver<()>,
        failing: &mut bool,
    ) -> Result<(), DirectoryError> {
        let mut client = self.directory.connect().await?;

        self.shared.lock().node_table.clear();
        let snapshot = client.get_prefix().await?;
        self.apply_snapshot(&snapshot).await;

        let (watcher, mut stream) = client.watch_prefix().await?;
        self.shared.lock().watch_cancel = Some(watcher);
        *failing = false;
        info!(nodes = self.shared.lock().node_table.len(), "watching directory");

        loop {
            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                message = stream.message() => {
                    let response = match message? {
                        Some(response) => response,
                        None => {
                            if self.is_stopped() {
                                return Ok(());
                            }
                            return Err(DirectoryError::WatchClosed);
                        }
                    };
                    if response.canceled() {
                        if self.is_stopped() {
                            return Ok(());
                        }
                        return Err(DirectoryError::WatchClosed);
                    }
                    for event in events_of(&response) {
                        self.apply_event(event.event_type, &event.key, &event.value).await;
                    }
                }
            }
        }
    }

    /// Applies a full snapshot, reconciling the kernel once at the end
    /// rather than after every key, so a resynchronization does not churn
    /// through half-observed nodes.
    pub async fn apply_snapshot(&self, kvs: &[(String, String)]) {
        for (key, value) in kvs {
            let _ = self.apply_to_table(EventType::Put, key, value);
        }
        self.rebuild_fib().await;
    }

    /// Applies one watch event; an observable change reconciles the
    /// kernel against a freshly built FIB.
    pub async fn apply_event(&self, event_type: EventType, key: &str, value: &str) {
        if self.apply_to_table(event_type, key, value) {
            self.rebuild_fib().await;
        }
    }

    /// Routes one directory event into the node table (or, for our own
    /// node id, into the self-descriptor). Returns whether the FIB inputs
    /// changed.
    fn apply_to_table(&self, event_type: EventType, key: &str, value: &str) -> bool {
        let Some((node_id, field)) = codec::split_key(self.directory.prefix(), key) else {
            debug!(key, "ignoring key outside the directory schema");
            return false;
        };

        if node_id == self.config.node_id {
            return self.update_self(event_type, field, value);
        }

        debug!(node_id, field, event = ?event_type, "directory event");
        let mut shared = self.shared.lock();
        match event_type {
            EventType::Put => shared.node_table.update(node_id, field, value),
            EventType::Delete => shared.node_table.remove(node_id),
        }
    }

    /// Handles a directory event for our own node id.
    ///
    /// Self-changes originate locally, so the table is never touched and
    /// re-puts of the current registration are no-ops. A `groups` value
    /// that actually differs updates the descriptor and forces a FIB
    /// rebuild; `allowed_ips` follows the descriptor without a rebuild
    /// (the FIB does not depend on it). Self-deletes are left to the
    /// maintainer, whose next refresh failure re-registers.
    fn update_self(&self, event_type: EventType, field: &str, value: &str) -> bool {
        if event_type != EventType::Put {
            return false;
        }
        match field {
            "groups" => {
                let changed = self.shared.lock().self_node.update("groups", value);
                if changed {
                    info!(groups = value, "self group membership changed");
                }
                changed
            }
            "allowed_ips" => {
                self.shared.lock().self_node.update("allowed_ips", value);
                false
            }
            _ => false,
        }
    }

    /// Builds the FIB from the current shared state and drives the kernel
    /// from the installed FIB to it. The mutex is never held across the
    /// kernel actions.
    async fn rebuild_fib(&self) {
        let (new, old) = {
            let shared = self.shared.lock();
            let new = Fib::build(&shared.self_node, &shared.node_table, &self.ports, &self.params);
            (new, shared.fib.clone())
        };
        new.reconcile(&old, &self.kernel, &self.ports, self.config.vrf.as_deref())
            .await;
        self.shared.lock().fib = new;
    }

    /// The currently installed FIB (for inspection).
    pub fn current_fib(&self) -> Fib {
        self.shared.lock().fib.clone()
    }

    /// The current self-descriptor (for inspection).
    pub fn self_node(&self) -> Node {
        self.shared.lock().self_node.clone()
    }

    /// Number of remote nodes currently known.
    pub fn node_count(&self) -> usize {
        self.shared.lock().node_table.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amesh_directory::DirectoryConfig;
    use amesh_fib::outbound_ifname;
    use amesh_kernel::{FakeKernel, KernelAction};
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    const PRVKEY: &str = "/etc/amesh/private.key";

    fn test_config(endpoint: Option<&str>, groups: &[&str]) -> AgentConfig {
        AgentConfig {
            directory: DirectoryConfig {
                endpoint: "127.0.0.1:2379".to_string(),
                prefix: "m".to_string(),
                username: None,
                password: None,
            },
            node_id: "A".to_string(),
            groups: groups.iter().map(ToString::to_string).collect(),
            tracked_devices: Vec::new(),
            vrf: None,
            device: endpoint.map(|_| "wg0".to_string()),
            endpoint: endpoint.map(ToString::to_string),
            port: 51820,
            address: None,
            pubkey: "KA".to_string(),
            prvkey_path: PathBuf::from(PRVKEY),
            keepalive: 0,
            allowed_ips: BTreeSet::new(),
            portbase: 51821,
        }
    }

    fn server_agent() -> Agent<FakeKernel> {
        Agent::new(test_config(Some("10.0.0.1:51820"), &["any"]), FakeKernel::new())
    }

    fn node_b_keys() -> Vec<(String, String)> {
        vec![
            ("m/B/pubkey".to_string(), "KB".to_string()),
            ("m/B/endpoint".to_string(), "1.2.3.4:51820".to_string()),
            ("m/B/allowed_ips".to_string(), "10.0.2.0/24".to_string()),
            ("m/B/groups".to_string(), "any".to_string()),
            ("m/B/keepalive".to_string(), "0".to_string()),
        ]
    }

    #[tokio::test]
    async fn snapshot_join_installs_expected_actions() {
        let agent = server_agent();
        agent.apply_snapshot(&node_b_keys()).await;

        let dev = outbound_ifname("KB");
        assert_eq!(
            agent.kernel.actions(),
            vec![
                KernelAction::IfaceCreate(dev.clone()),
                KernelAction::IfaceSetUp(dev.clone()),
                KernelAction::WgSetDevice(dev.clone(), PathBuf::from(PRVKEY), 51821),
                KernelAction::WgSetPeer {
                    dev: dev.clone(),
                    pubkey: "KB".into(),
                    endpoint: Some("1.2.3.4:51820".into()),
                    allowed_ips: vec!["10.0.2.0/24".into()],
                    keepalive: 0,
                },
                KernelAction::WgSetPeer {
                    dev: "wg0".into(),
                    pubkey: "KB".into(),
                    endpoint: Some("1.2.3.4:51820".into()),
                    allowed_ips: vec!["10.0.2.0/24".into()],
                    keepalive: 0,
                },
                KernelAction::RouteAdd("10.0.2.0/24".into(), vec![dev]),
            ]
        );
        assert_eq!(agent.node_count(), 1);
    }

    #[tokio::test]
    async fn lease_expiry_deletes_uninstall_everything() {
        let agent = server_agent();
        agent.apply_snapshot(&node_b_keys()).await;
        let _ = agent.kernel.take_actions();

        // Lease expiry removes all five keys; the first delete tears the
        // node down, the rest are no-ops.
        for (key, _) in node_b_keys() {
            agent.apply_event(EventType::Delete, &key, "").await;
        }

        let dev = outbound_ifname("KB");
        assert_eq!(
            agent.kernel.actions(),
            vec![
                KernelAction::WgRemovePeer("wg0".into(), "KB".into()),
                KernelAction::WgRemovePeer(dev.clone(), "KB".into()),
                KernelAction::IfaceDelete(dev),
            ]
        );
        assert_eq!(agent.node_count(), 0);
        assert!(agent.current_fib().is_empty());
    }

    #[tokio::test]
    async fn incremental_events_converge_to_snapshot_state() {
        let incremental = server_agent();
        for (key, value) in node_b_keys() {
            incremental.apply_event(EventType::Put, &key, &value).await;
        }

        let snapshot = server_agent();
        snapshot.apply_snapshot(&node_b_keys()).await;

        assert_eq!(incremental.current_fib(), snapshot.current_fib());
    }

    #[tokio::test]
    async fn self_events_never_touch_the_table() {
        let agent = server_agent();
        agent.apply_event(EventType::Put, "m/A/pubkey", "KA").await;
        agent
            .apply_event(EventType::Put, "m/A/allowed_ips", "10.9.0.0/24")
            .await;

        assert_eq!(agent.node_count(), 0);
        assert!(agent.kernel.actions().is_empty());
        // allowed_ips still followed into the self-descriptor.
        assert!(
            agent
                .self_node()
                .allowed_ips
                .contains(&"10.9.0.0/24".parse().expect("net"))
        );
    }

    #[tokio::test]
    async fn self_group_change_rebuilds_fib() {
        let agent = Agent::new(test_config(Some("10.0.0.1:51820"), &["blue"]), FakeKernel::new());
        let keys = vec![
            ("m/B/pubkey".to_string(), "KB".to_string()),
            ("m/B/endpoint".to_string(), "1.2.3.4:51820".to_string()),
            ("m/B/groups".to_string(), "blue".to_string()),
        ];
        agent.apply_snapshot(&keys).await;
        assert!(!agent.current_fib().is_empty());
        let _ = agent.kernel.take_actions();

        // Leaving the shared group tears the peering down; the table entry
        // stays.
        agent.apply_event(EventType::Put, "m/A/groups", "red").await;
        assert!(agent.current_fib().is_empty());
        assert_eq!(agent.node_count(), 1);
        assert!(
            agent
                .kernel
                .actions()
                .iter()
                .any(|a| matches!(a, KernelAction::WgRemovePeer(..)))
        );

        // Re-putting the same groups is a no-op.
        let _ = agent.kernel.take_actions();
        agent.apply_event(EventType::Put, "m/A/groups", "red").await;
        assert!(agent.kernel.actions().is_empty());
    }

    #[tokio::test]
    async fn group_mismatch_produces_no_actions() {
        let agent = Agent::new(test_config(Some("10.0.0.1:51820"), &["blue"]), FakeKernel::new());
        let keys = vec![
            ("m/D/pubkey".to_string(), "KD".to_string()),
            ("m/D/endpoint".to_string(), "1.2.3.4:51820".to_string()),
            ("m/D/groups".to_string(), "red".to_string()),
        ];
        agent.apply_snapshot(&keys).await;
        assert!(agent.kernel.actions().is_empty());
        assert_eq!(agent.node_count(), 1);
    }

    #[tokio::test]
    async fn malformed_keys_are_ignored() {
        let agent = server_agent();
        agent.apply_event(EventType::Put, "m/garbage", "x").await;
        agent.apply_event(EventType::Put, "other/B/pubkey", "KB").await;
        assert_eq!(agent.node_count(), 0);
        assert!(agent.kernel.actions().is_empty());
    }

    #[tokio::test]
    async fn addr_events_update_advertised_prefixes() {
        let agent = server_agent();
        let event = AddrEvent {
            action: AddrAction::Add,
            device: "eth0".to_string(),
            prefix: "192.168.5.0/24".parse().expect("net"),
        };

        let value = agent.apply_addr_event(&event).expect("changed");
        assert!(value.contains("192.168.5.0/24"));
        // Re-applying the same event is a no-op.
        assert!(agent.apply_addr_event(&event).is_none());

        let del = AddrEvent {
            action: AddrAction::Del,
            ..event
        };
        let value = agent.apply_addr_event(&del).expect("changed");
        assert!(!value.contains("192.168.5.0/24"));
        // No kernel action for local address changes.
        assert!(agent.kernel.actions().is_empty());
    }

    #[tokio::test]
    async fn inbound_device_init_rebuilds_existing_interface() {
        let mut config = test_config(Some("10.0.0.1:51820"), &["any"]);
        config.address = Some("10.0.0.1/24".to_string());
        let kernel = FakeKernel::new();
        kernel.add_existing_iface("wg0");

        let agent = Agent::new(config, kernel);
        agent.init_inbound_device().await.expect("init");

        assert_eq!(
            agent.kernel.actions(),
            vec![
                KernelAction::IfaceDelete("wg0".into()),
                KernelAction::IfaceCreate("wg0".into()),
                KernelAction::IfaceSetUp("wg0".into()),
                KernelAction::IfaceAddrFlush("wg0".into()),
                KernelAction::IfaceAddrAdd("wg0".into(), "10.0.0.1/24".into()),
                KernelAction::WgSetDevice("wg0".into(), PathBuf::from(PRVKEY), 51820),
            ]
        );
    }

    #[tokio::test]
    async fn missing_vrf_is_a_configuration_error() {
        let mut config = test_config(None, &["any"]);
        config.vrf = Some("vrf-mesh".to_string());
        let agent = Agent::new(config, FakeKernel::new());
        assert!(matches!(
            agent.init_inbound_device().await,
            Err(AgentError::Config(_))
        ));
    }
}
