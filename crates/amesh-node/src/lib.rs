//! Mesh node descriptors for amesh.
//!
//! A [`Node`] is the value type for one mesh member as advertised in the
//! shared directory: public key, optional endpoint, tunneled prefixes,
//! keepalive and group tags. [`NodeTable`] is the watcher's in-memory view
//! of every remote member, and [`codec`] maps nodes to and from the flat
//! `<prefix>/<node_id>/<field>` key layout used on the wire.

pub mod codec;
mod node;

pub use node::{Node, NodeTable};
