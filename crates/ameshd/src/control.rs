//! Administrative seeding of the directory.
//!
//! The control tool reads one or more configuration files whose non-agent
//! sections each describe a node (at minimum a `pubkey`), and puts,
//! prints or deletes the corresponding directory entries. Control puts
//! carry no lease: seeded nodes stay until explicitly removed.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use amesh_directory::{Directory, DirectoryConfig, derive_node_id};
use amesh_node::{Node, NodeTable, codec};
use tracing::debug;

use crate::config::EtcdSection;
use crate::error::{ConfigError, ControlError};

/// Sections that configure the tools rather than describe nodes.
const RESERVED_SECTIONS: [&str; 3] = ["etcd", "amesh", "wireguard"];

/// Where `get` reads node descriptors from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Source {
    /// The live directory.
    Etcd,
    /// The local configuration file(s).
    Config,
}

/// The control tool: directory access plus the node set from config.
pub struct Control {
    directory: Directory,
    node_table: NodeTable,
}

impl Control {
    /// Parses the configuration files, later files extending (and for the
    /// `[etcd]` section, overriding) earlier ones.
    pub fn from_files(paths: &[PathBuf]) -> Result<Self, ConfigError> {
        let mut etcd = EtcdSection::default();
        let mut node_table = NodeTable::new();
        let mut seen = BTreeSet::new();

        for path in paths {
            if !seen.insert(path.clone()) {
                continue;
            }
            load_file(path, &mut etcd, &mut node_table)?;
        }

        Ok(Self {
            directory: Directory::new(DirectoryConfig {
                endpoint: etcd.etcd_endpoint,
                prefix: etcd.etcd_prefix,
                username: etcd.etcd_username,
                password: etcd.etcd_password,
            }),
            node_table,
        })
    }

    /// The node descriptors read from config.
    #[must_use]
    pub fn node_table(&self) -> &NodeTable {
        &self.node_table
    }

    /// Prints every node from the chosen source.
    pub async fn get(&self, source: Source) -> Result<(), ControlError> {
        let table = match source {
            Source::Config => self.node_table.clone(),
            Source::Etcd => {
                let mut client = self.directory.connect().await?;
                let mut table = NodeTable::new();
                for (key, value) in client.get_prefix().await? {
                    if let Some((node_id, field)) =
                        codec::split_key(self.directory.prefix(), &key)
                    {
                        table.update(node_id, field, &value);
                    }
                }
                table
            }
        };

        for (node_id, node) in table.iter() {
            println!("{node_id}");
            println!("{}", node.format(4));
            println!();
        }
        Ok(())
    }

    /// Puts the selected nodes into the directory; with `sync`, also
    /// removes directory nodes absent from config.
    pub async fn put(
        &self,
        node_ids: &[String],
        all_node: bool,
        sync: bool,
    ) -> Result<(), ControlError> {
        let all_node = all_node || sync;
        let mut client = self.directory.connect().await?;

        let mut put_ids = Vec::new();
        for (node_id, node) in self.node_table.iter() {
            if !all_node && !node_ids.contains(node_id) {
                continue;
            }
            for (field, value) in node.serialize() {
                let key = codec::node_key(self.directory.prefix(), node_id, field);
                client.put(&key, &value, None).await?;
            }
            put_ids.push(node_id.clone());
        }
        println!("Put {} nodes. ({}).", put_ids.len(), put_ids.join(" and "));

        if sync {
            let mut stale = BTreeSet::new();
            for (key, _) in client.get_prefix().await? {
                if let Some((node_id, _)) = codec::split_key(self.directory.prefix(), &key) {
                    if !self.node_table.contains(node_id) {
                        stale.insert(node_id.to_string());
                    }
                }
            }
            for node_id in &stale {
                client
                    .delete_prefix(&codec::node_prefix(self.directory.prefix(), node_id))
                    .await?;
            }
            if !stale.is_empty() {
                let names: Vec<_> = stale.iter().cloned().collect();
                println!("Deleted {} nodes. ({}).", stale.len(), names.join(" and "));
            }
        }
        Ok(())
    }

    /// Deletes the selected nodes from the directory.
    pub async fn delete(&self, node_ids: &[String], all_node: bool) -> Result<(), ControlError> {
        let ids: BTreeSet<String> = if all_node {
            self.node_table.node_ids().cloned().collect()
        } else {
            node_ids.iter().cloned().collect()
        };

        let mut client = self.directory.connect().await?;
        for node_id in &ids {
            client
                .delete_prefix(&codec::node_prefix(self.directory.prefix(), node_id))
                .await?;
        }

        let names: Vec<_> = ids.iter().cloned().collect();
        println!("Deleted {} nodes. ({}).", ids.len(), names.join(" and "));
        Ok(())
    }
}

fn load_file(
    path: &Path,
    etcd: &mut EtcdSection,
    node_table: &mut NodeTable,
) -> Result<(), ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let table: toml::Table = toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    if let Some(section) = table.get("etcd") {
        *etcd = section
            .clone()
            .try_into()
            .map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
    }

    for (section, value) in &table {
        if RESERVED_SECTIONS.contains(&section.as_str()) {
            continue;
        }
        let Some(fields) = value.as_table() else {
            continue;
        };

        let mut node = Node::new();
        for (key, field_value) in fields {
            node.update(key, &value_to_string(field_value));
        }

        let node_id = match fields.get("node_id").and_then(toml::Value::as_str) {
            Some(id) => id.to_string(),
            None => match &node.pubkey {
                Some(pubkey) => derive_node_id(pubkey),
                None => {
                    return Err(ConfigError::Invalid(format!(
                        "section [{section}] needs node_id or pubkey"
                    )));
                }
            },
        };

        debug!(node_id = %node_id, section = %section, "loaded node from config");
        node_table.insert(node_id, node);
    }
    Ok(())
}

/// Renders a TOML scalar the way the directory stores it.
fn value_to_string(value: &toml::Value) -> String {
    match value.as_str() {
        Some(s) => s.to_string(),
        None => value.to_string(),
    }
}
