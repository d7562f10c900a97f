//! Directory key layout.
//!
//! Every node field is one flat key, `<prefix>/<node_id>/<field>`, so the
//! model tolerates partial observation: there is no batching and no
//! transactional grouping on the wire.

/// Builds the directory key for one field of one node.
#[must_use]
pub fn node_key(prefix: &str, node_id: &str, field: &str) -> String {
    format!("{prefix}/{node_id}/{field}")
}

/// Builds the key prefix covering every field of one node.
#[must_use]
pub fn node_prefix(prefix: &str, node_id: &str) -> String {
    format!("{prefix}/{node_id}/")
}

/// Splits a watched key into `(node_id, field)`.
///
/// The key must start with `<prefix>/` and carry at least two further
/// `/`-separated components; everything after the second separator is the
/// field name. Returns `None` for keys outside the prefix or with a
/// truncated tail.
#[must_use]
pub fn split_key<'a>(prefix: &str, key: &'a str) -> Option<(&'a str, &'a str)> {
    let rest = key.strip_prefix(prefix)?.strip_prefix('/')?;
    let (node_id, field) = rest.split_once('/')?;
    if node_id.is_empty() || field.is_empty() {
        return None;
    }
    Some((node_id, field))
}
