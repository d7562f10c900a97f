//! Node descriptors and the watcher's node table.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use ipnet::IpNet;
use tracing::{debug, warn};

/// The directory encodes an unset field as this literal string.
///
/// The sentinel never leaves this module: [`Node::update`] maps it to
/// `None`/empty on the way in, [`Node::serialize`] emits it on the way out.
const UNSET: &str = "None";

/// One mesh member as advertised in the directory.
///
/// All fields are observed piecemeal (one directory key each), so every
/// field has a neutral default and the descriptor is usable at any stage of
/// partial observation. A node without a public key is never installable.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Node {
    /// WireGuard public key. Opaque to the control plane; identity for the
    /// dataplane.
    pub pubkey: Option<String>,
    /// `host:port` the peer listens on. Presence means the peer is a server
    /// reachable from outside.
    pub endpoint: Option<String>,
    /// Network prefixes the peer owns behind the tunnel, canonicalized.
    pub allowed_ips: BTreeSet<IpNet>,
    /// Persistent keepalive in seconds; 0 disables.
    pub keepalive: u32,
    /// Group tags. The tag `any` matches every group set.
    pub groups: BTreeSet<String>,
    /// True once any field has been observed for this node.
    pub present: bool,
}

impl Node {
    /// Creates an empty descriptor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one directory field to the descriptor.
    ///
    /// Returns whether an observable change occurred. Total over arbitrary
    /// input: a value that fails to parse is logged and discarded, leaving
    /// the descriptor untouched; an unknown key is logged and ignored so
    /// newer agents can publish fields this one does not know about.
    pub fn update(&mut self, key: &str, value: &str) -> bool {
        let changed = match key {
            "pubkey" => assign(&mut self.pubkey, parse_opt(value)),
            "endpoint" => assign(&mut self.endpoint, parse_opt(value)),
            "allowed_ips" => match parse_prefixes(value) {
                Some(ips) => assign(&mut self.allowed_ips, ips),
                None => {
                    warn!(key, value, "malformed allowed_ips value, ignored");
                    return false;
                }
            },
            "keepalive" => match parse_keepalive(value) {
                Some(secs) => assign(&mut self.keepalive, secs),
                None => {
                    warn!(key, value, "malformed keepalive value, ignored");
                    return false;
                }
            },
            "groups" => assign(&mut self.groups, parse_groups(value)),
            _ => {
                debug!(key, value, "unknown node field, ignored");
                return false;
            }
        };

        self.present = true;
        changed
    }

    /// Emits every field as directory values, unset fields as the
    /// `"None"` literal and empty sets as empty strings, so a delete is
    /// expressible as a put.
    #[must_use]
    pub fn serialize(&self) -> Vec<(&'static str, String)> {
        vec![
            ("pubkey", opt_to_value(self.pubkey.as_deref())),
            ("endpoint", opt_to_value(self.endpoint.as_deref())),
            ("allowed_ips", join_prefixes(&self.allowed_ips)),
            ("keepalive", self.keepalive.to_string()),
            ("groups", join_set(&self.groups)),
        ]
    }

    /// Human-readable multiline rendering for administrative output.
    #[must_use]
    pub fn format(&self, indent: usize) -> String {
        let pad = " ".repeat(indent);
        let lines = [
            format!("pubkey:      {}", opt_to_value(self.pubkey.as_deref())),
            format!("endpoint:    {}", opt_to_value(self.endpoint.as_deref())),
            format!(
                "allowed_ips: {}",
                self.allowed_ips
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            format!("keepalive:   {}", self.keepalive),
            format!(
                "groups:      {}",
                self.groups.iter().cloned().collect::<Vec<_>>().join(", ")
            ),
        ];
        lines
            .iter()
            .map(|l| format!("{pad}{l}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Node pubkey={} endpoint={} groups={}>",
            opt_to_value(self.pubkey.as_deref()),
            opt_to_value(self.endpoint.as_deref()),
            join_set(&self.groups),
        )
    }
}

/// Writes `new` into `slot` iff it differs, reporting whether it did.
fn assign<T: PartialEq>(slot: &mut T, new: T) -> bool {
    if *slot == new {
        false
    } else {
        *slot = new;
        true
    }
}

fn parse_opt(value: &str) -> Option<String> {
    if value == UNSET {
        None
    } else {
        Some(value.to_string())
    }
}

fn opt_to_value(value: Option<&str>) -> String {
    value.unwrap_or(UNSET).to_string()
}

/// Parses a comma-separated CIDR list into canonical network prefixes.
///
/// Host bits are truncated (`10.0.0.7/24` becomes `10.0.0.0/24`) so that
/// two spellings of the same network compare equal. Returns `None` if any
/// element fails to parse.
fn parse_prefixes(value: &str) -> Option<BTreeSet<IpNet>> {
    let mut ips = BTreeSet::new();
    if value.is_empty() || value == UNSET {
        return Some(ips);
    }
    for token in value.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let net: IpNet = token.parse().ok()?;
        ips.insert(net.trunc());
    }
    Some(ips)
}

fn parse_keepalive(value: &str) -> Option<u32> {
    if value == UNSET {
        return Some(0);
    }
    value.trim().parse().ok()
}

fn parse_groups(value: &str) -> BTreeSet<String> {
    if value.is_empty() || value == UNSET {
        return BTreeSet::new();
    }
    value
        .split(',')
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn join_prefixes(ips: &BTreeSet<IpNet>) -> String {
    ips.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn join_set(set: &BTreeSet<String>) -> String {
    set.iter().cloned().collect::<Vec<_>>().join(",")
}

/// The watcher's view of every remote mesh member, keyed by node id.
///
/// Rebuilt from scratch on every directory (re)synchronization and mutated
/// only by the watcher; iteration order is the node-id order so downstream
/// output is deterministic.
#[derive(Clone, Debug, Default)]
pub struct NodeTable {
    nodes: BTreeMap<String, Node>,
}

impl NodeTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one directory field to a node, creating the node on first
    /// observation. Returns whether an observable change occurred.
    pub fn update(&mut self, node_id: &str, field: &str, value: &str) -> bool {
        self.nodes
            .entry(node_id.to_string())
            .or_default()
            .update(field, value)
    }

    /// Inserts a fully-formed descriptor, replacing any previous one.
    pub fn insert(&mut self, node_id: String, node: Node) {
        self.nodes.insert(node_id, node);
    }

    /// Drops a node, reporting whether it was present.
    pub fn remove(&mut self, node_id: &str) -> bool {
        self.nodes.remove(node_id).is_some()
    }

    /// Looks up a node by id.
    #[must_use]
    pub fn get(&self, node_id: &str) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    /// Whether a node id is known.
    #[must_use]
    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Iterates nodes in id order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Node)> {
        self.nodes.iter()
    }

    /// Iterates node ids in order.
    pub fn node_ids(&self) -> impl Iterator<Item = &String> {
        self.nodes.keys()
    }

    /// Forgets every node.
    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    /// Number of known nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(cidr: &str) -> IpNet {
        cidr.parse().expect("valid cidr")
    }

    #[test]
    fn update_sets_fields() {
        let mut node = Node::new();
        assert!(node.update("pubkey", "KB"));
        assert!(node.update("endpoint", "1.2.3.4:51820"));
        assert!(node.update("allowed_ips", "10.0.2.0/24"));
        assert!(node.update("keepalive", "25"));
        assert!(node.update("groups", "any"));

        assert_eq!(node.pubkey.as_deref(), Some("KB"));
        assert_eq!(node.endpoint.as_deref(), Some("1.2.3.4:51820"));
        assert!(node.allowed_ips.contains(&parsed("10.0.2.0/24")));
        assert_eq!(node.keepalive, 25);
        assert!(node.groups.contains("any"));
        assert!(node.present);
    }

    #[test]
    fn update_is_idempotent() {
        let mut node = Node::new();
        assert!(node.update("pubkey", "KB"));
        assert!(!node.update("pubkey", "KB"));

        assert!(node.update("allowed_ips", "10.0.2.0/24,10.0.3.0/24"));
        assert!(!node.update("allowed_ips", "10.0.3.0/24, 10.0.2.0/24"));

        let snapshot = node.clone();
        node.update("allowed_ips", "10.0.2.0/24,10.0.3.0/24");
        assert_eq!(node, snapshot);
    }

    #[test]
    fn update_none_literal_unsets() {
        let mut node = Node::new();
        node.update("endpoint", "1.2.3.4:51820");
        assert!(node.update("endpoint", "None"));
        assert_eq!(node.endpoint, None);
        assert!(!node.update("endpoint", "None"));
    }

    #[test]
    fn update_empty_string_means_empty_set() {
        let mut node = Node::new();
        node.update("allowed_ips", "10.0.2.0/24");
        node.update("groups", "blue");
        assert!(node.update("allowed_ips", ""));
        assert!(node.update("groups", ""));
        assert!(node.allowed_ips.is_empty());
        assert!(node.groups.is_empty());
    }

    #[test]
    fn update_canonicalizes_prefixes() {
        let mut node = Node::new();
        assert!(node.update("allowed_ips", "10.0.2.7/24"));
        assert!(node.allowed_ips.contains(&parsed("10.0.2.0/24")));
        // Another spelling of the same network is not a change.
        assert!(!node.update("allowed_ips", "10.0.2.9/24"));
    }

    #[test]
    fn update_malformed_value_leaves_state_unchanged() {
        let mut node = Node::new();
        node.update("allowed_ips", "10.0.2.0/24");
        node.update("keepalive", "25");
        let snapshot = node.clone();

        assert!(!node.update("allowed_ips", "not-a-prefix"));
        assert!(!node.update("allowed_ips", "10.0.2.0/24,999.0.0.0/8"));
        assert!(!node.update("keepalive", "soon"));
        assert_eq!(node, snapshot);
    }

    #[test]
    fn update_unknown_key_is_ignored() {
        let mut node = Node::new();
        let snapshot = node.clone();
        assert!(!node.update("color", "purple"));
        assert_eq!(node, snapshot);
    }

    #[test]
    fn update_ipv6_prefixes_accepted() {
        let mut node = Node::new();
        assert!(node.update("allowed_ips", "fd00:1::/64,10.0.2.0/24"));
        assert!(node.allowed_ips.contains(&parsed("fd00:1::/64")));
        assert_eq!(node.allowed_ips.len(), 2);
    }

    #[test]
    fn serialize_roundtrip() {
        let mut node = Node::new();
        node.update("pubkey", "KB");
        node.update("endpoint", "1.2.3.4:51820");
        node.update("allowed_ips", "10.0.2.0/24,fd00:1::/64");
        node.update("keepalive", "10");
        node.update("groups", "blue,red");

        let mut copy = Node::new();
        for (field, value) in node.serialize() {
            copy.update(field, &value);
        }
        assert_eq!(node, copy);
    }

    #[test]
    fn serialize_emits_unset_as_none_literal() {
        let node = Node::new();
        let fields: BTreeMap<_, _> = node.serialize().into_iter().collect();
        assert_eq!(fields["pubkey"], "None");
        assert_eq!(fields["endpoint"], "None");
        assert_eq!(fields["allowed_ips"], "");
        assert_eq!(fields["keepalive"], "0");
        assert_eq!(fields["groups"], "");
    }

    #[test]
    fn format_renders_every_field() {
        let mut node = Node::new();
        node.update("pubkey", "KB");
        node.update("groups", "blue,red");
        let out = node.format(4);
        assert!(out.contains("pubkey:      KB"));
        assert!(out.contains("groups:      blue, red"));
        assert!(out.lines().all(|l| l.starts_with("    ")));
    }

    #[test]
    fn table_update_creates_and_removes() {
        let mut table = NodeTable::new();
        assert!(table.update("B", "pubkey", "KB"));
        assert!(table.contains("B"));
        assert!(table.remove("B"));
        assert!(!table.remove("B"));
        assert!(table.is_empty());
    }

    #[test]
    fn table_iterates_in_id_order() {
        let mut table = NodeTable::new();
        table.update("C", "pubkey", "KC");
        table.update("A", "pubkey", "KA");
        table.update("B", "pubkey", "KB");
        let ids: Vec<_> = table.node_ids().cloned().collect();
        assert_eq!(ids, ["A", "B", "C"]);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_prefix() -> impl Strategy<Value = IpNet> {
            (any::<u32>(), 0u8..=32).prop_map(|(addr, len)| {
                IpNet::new(std::net::Ipv4Addr::from(addr).into(), len)
                    .expect("prefix length in range")
                    .trunc()
            })
        }

        proptest! {
            #[test]
            fn serialize_roundtrip_prop(
                pubkey in proptest::option::of("[A-Za-z0-9+/]{8,16}"),
                endpoint in proptest::option::of("[a-z0-9.]{4,12}:[0-9]{2,5}"),
                ips in proptest::collection::btree_set(arb_prefix(), 0..4),
                keepalive in 0u32..600,
                groups in proptest::collection::btree_set("[a-z]{1,8}", 0..4),
            ) {
                let mut node = Node::new();
                if let Some(ref pk) = pubkey {
                    node.update("pubkey", pk);
                }
                if let Some(ref ep) = endpoint {
                    node.update("endpoint", ep);
                }
                node.allowed_ips = ips;
                node.keepalive = keepalive;
                node.groups = groups;
                node.present = true;

                let mut copy = Node::new();
                for (field, value) in node.serialize() {
                    copy.update(field, &value);
                }
                prop_assert_eq!(node, copy);
            }

            #[test]
            fn update_never_panics(key in "[a-z_]{1,12}", value in ".{0,40}") {
                let mut node = Node::new();
                let _ = node.update(&key, &value);
            }

            #[test]
            fn second_update_reports_no_change(value in "[a-z0-9,./: ]{0,40}") {
                for field in ["pubkey", "endpoint", "allowed_ips", "keepalive", "groups"] {
                    let mut node = Node::new();
                    let first = node.update(field, &value);
                    let second = node.update(field, &value);
                    prop_assert!(!second, "field {} changed twice on {:?} (first={})", field, value, first);
                }
            }
        }
    }
}
