//! Interface address tracker.
//!
//! Watches a configured set of physical interfaces for IPv4 address
//! changes through a netlink multicast subscription and turns them into a
//! bounded queue of add/delete events. The agent's maintainer drains the
//! queue at 1 Hz and folds the prefixes into the advertised
//! self-descriptor.

use std::collections::{BTreeSet, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use ipnet::Ipv4Net;
use netlink_packet_core::NetlinkPayload;
use netlink_packet_route::RouteNetlinkMessage;
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use netlink_packet_route::AddressFamily;
use parking_lot::Mutex;
use netlink_sys::AsyncSocket;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Events queued beyond this are dropped with a log entry.
const QUEUE_CAP: usize = 1024;

/// Errors raised while starting the tracker.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// The netlink connection could not be opened or bound.
    #[error("netlink connection failed: {0}")]
    Connection(#[from] std::io::Error),

    /// The initial address enumeration failed.
    #[error("address enumeration failed: {0}")]
    Enumerate(#[from] rtnetlink::Error),
}

/// Whether an address appeared or disappeared.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddrAction {
    /// Address added (or present at startup).
    Add,
    /// Address removed.
    Del,
}

/// One IPv4 network prefix change on a tracked interface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddrEvent {
    /// Add or delete.
    pub action: AddrAction,
    /// Interface the address lives on.
    pub device: String,
    /// The network prefix of the address (host bits cleared).
    pub prefix: Ipv4Net,
}

/// Tracks IPv4 addresses of a fixed interface set.
///
/// `start` enumerates current addresses (as synthetic add events) and then
/// listens for kernel address notifications on an internal task. Only IPv4
/// is tracked; events for other families are dropped.
pub struct DevTracker {
    devices: BTreeSet<String>,
    queue: Arc<Mutex<VecDeque<AddrEvent>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl DevTracker {
    /// Creates a tracker for the given interface names.
    #[must_use]
    pub fn new(devices: impl IntoIterator<Item = String>) -> Self {
        Self {
            devices: devices.into_iter().collect(),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            tasks: Vec::new(),
        }
    }

    /// The tracked interface names.
    #[must_use]
    pub fn devices(&self) -> &BTreeSet<String> {
        &self.devices
    }

    /// Opens the netlink subscription, enqueues one add event per current
    /// IPv4 address on a tracked interface, and spawns the event task.
    pub async fn start(&mut self) -> Result<(), TrackerError> {
        let (mut conn, handle, mut messages) = rtnetlink::new_connection()?;

        let groups = libc::RTMGRP_IPV4_IFADDR as u32;
        conn.socket_mut()
            .socket_mut()
            .bind(&netlink_sys::SocketAddr::new(0, groups))?;

        self.tasks.push(tokio::spawn(conn));

        debug!(devices = ?self.devices, "tracking interface addresses");

        let mut dump = handle.address().get().execute();
        while let Some(msg) = dump.try_next().await? {
            if let Some(ev) = translate(&self.devices, AddrAction::Add, &msg) {
                push(&self.queue, ev);
            }
        }

        let queue = Arc::clone(&self.queue);
        let devices = self.devices.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some((message, _addr)) = messages.next().await {
                let (action, msg) = match message.payload {
                    NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewAddress(m)) => {
                        (AddrAction::Add, m)
                    }
                    NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelAddress(m)) => {
                        (AddrAction::Del, m)
                    }
                    _ => continue,
                };
                if let Some(ev) = translate(&devices, action, &msg) {
                    push(&queue, ev);
                }
            }
        }));

        Ok(())
    }

    /// Stops the internal tasks. Queued events stay poppable.
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    /// Whether any event is queued.
    #[must_use]
    pub fn queued(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    /// Pops the oldest queued event, if any. Never blocks.
    #[must_use]
    pub fn pop(&self) -> Option<AddrEvent> {
        self.queue.lock().pop_front()
    }
}

impl Drop for DevTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Maps a kernel address message to a tracker event.
///
/// Requires the IPv4 family, an interface label naming a tracked device,
/// and an address attribute; anything else is dropped.
fn translate(
    devices: &BTreeSet<String>,
    action: AddrAction,
    msg: &AddressMessage,
) -> Option<AddrEvent> {
    if msg.header.family != AddressFamily::Inet {
        return None;
    }

    let mut device = None;
    let mut address = None;
    for attr in &msg.attributes {
        match attr {
            AddressAttribute::Label(label) if devices.contains(label) => {
                device = Some(label.clone());
            }
            AddressAttribute::Address(IpAddr::V4(addr)) => address = Some(*addr),
            _ => {}
        }
    }

    let device = device?;
    let address = address?;
    let prefix = Ipv4Net::new(address, msg.header.prefix_len).ok()?.trunc();

    Some(AddrEvent {
        action,
        device,
        prefix,
    })
}

fn push(queue: &Mutex<VecDeque<AddrEvent>>, ev: AddrEvent) {
    let mut q = queue.lock();
    if q.len() >= QUEUE_CAP {
        warn!(device = %ev.device, prefix = %ev.prefix, "address event queue full, dropping");
        return;
    }
    debug!(device = %ev.device, prefix = %ev.prefix, action = ?ev.action, "address event");
    q.push_back(ev);
}
