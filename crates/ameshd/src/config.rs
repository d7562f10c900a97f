//! Agent configuration.
//!
//! An INI-style file with `[etcd]`, `[amesh]` and `[wireguard]` sections.
//! Comma-separated list values stay strings in the file, mirroring the
//! directory value syntax, and are split at load time. Other sections are
//! ignored here; the control tool reads them as node definitions.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use amesh_directory::DirectoryConfig;
use amesh_fib::BuildParams;
use amesh_node::Node;
use ipnet::IpNet;
use serde::Deserialize;

use crate::error::ConfigError;

/// Default inbound listen port.
const DEFAULT_PORT: u16 = 51820;
/// Default first listen port for outbound tunnel interfaces.
const DEFAULT_PORTBASE: u16 = 51821;

/// Raw file contents before validation.
#[derive(Debug, Default, Deserialize)]
pub struct RawConfig {
    /// `[etcd]` section.
    #[serde(default)]
    pub etcd: EtcdSection,
    /// `[amesh]` section.
    #[serde(default)]
    pub amesh: AmeshSection,
    /// `[wireguard]` section.
    #[serde(default)]
    pub wireguard: WireguardSection,
}

/// The `[etcd]` section: where the directory lives.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EtcdSection {
    /// `host:port` of the etcd endpoint.
    pub etcd_endpoint: String,
    /// Key prefix the mesh lives under.
    pub etcd_prefix: String,
    /// Optional authentication user.
    pub etcd_username: Option<String>,
    /// Optional authentication password.
    pub etcd_password: Option<String>,
}

impl Default for EtcdSection {
    fn default() -> Self {
        Self {
            etcd_endpoint: "127.0.0.1:2379".to_string(),
            etcd_prefix: "amesh".to_string(),
            etcd_username: None,
            etcd_password: None,
        }
    }
}

/// The `[amesh]` section: this agent's identity.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct AmeshSection {
    /// Node id; derived from the public key when absent.
    pub node_id: Option<String>,
    /// Comma-separated group tags.
    pub groups: Option<String>,
    /// Comma-separated interfaces whose addresses feed `allowed_ips`.
    pub tracked_devices: Option<String>,
    /// VRF every tunnel interface is enslaved to. Must already exist.
    pub vrf: Option<String>,
}

/// The `[wireguard]` section: the local dataplane.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct WireguardSection {
    /// Shared inbound interface; required when `endpoint` is set.
    pub device: Option<String>,
    /// Advertised `host:port`; presence makes this node a server.
    pub endpoint: Option<String>,
    /// Inbound listen port.
    pub port: u16,
    /// Address (CIDR) assigned to the inbound interface.
    pub address: Option<String>,
    /// File holding the public key.
    pub pubkey_path: Option<PathBuf>,
    /// File holding the private key, readable at runtime.
    pub prvkey_path: Option<PathBuf>,
    /// Advertised persistent keepalive; 0 disables.
    pub keepalive: u32,
    /// Comma-separated prefixes advertised behind this node.
    pub allowed_ips: Option<String>,
    /// First listen port handed to outbound tunnel interfaces.
    pub portbase: u16,
}

impl Default for WireguardSection {
    fn default() -> Self {
        Self {
            device: None,
            endpoint: None,
            port: DEFAULT_PORT,
            address: None,
            pubkey_path: None,
            prvkey_path: None,
            keepalive: 0,
            allowed_ips: None,
            portbase: DEFAULT_PORTBASE,
        }
    }
}

/// Validated agent configuration.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Directory connection parameters.
    pub directory: DirectoryConfig,
    /// This agent's node id.
    pub node_id: String,
    /// This agent's group tags.
    pub groups: BTreeSet<String>,
    /// Interfaces the address tracker watches.
    pub tracked_devices: Vec<String>,
    /// VRF for tunnel interfaces, if any.
    pub vrf: Option<String>,
    /// Shared inbound interface, if any.
    pub device: Option<String>,
    /// Advertised endpoint, if this node is a server.
    pub endpoint: Option<String>,
    /// Inbound listen port.
    pub port: u16,
    /// Address assigned to the inbound interface.
    pub address: Option<String>,
    /// This node's public key (file contents, trimmed).
    pub pubkey: String,
    /// Private key path passed to the dataplane.
    pub prvkey_path: PathBuf,
    /// Advertised keepalive seconds.
    pub keepalive: u32,
    /// Statically advertised prefixes.
    pub allowed_ips: BTreeSet<IpNet>,
    /// First outbound listen port.
    pub portbase: u16,
}

impl AgentConfig {
    /// Loads and validates the configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_raw(raw)
    }

    /// Validates raw file contents.
    pub fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let wireguard = raw.wireguard;
        let amesh = raw.amesh;

        let pubkey_path = wireguard
            .pubkey_path
            .ok_or_else(|| ConfigError::Invalid("pubkey_path in [wireguard] is required".into()))?;
        let pubkey = fs::read_to_string(&pubkey_path)
            .map_err(|source| ConfigError::Io {
                path: pubkey_path.clone(),
                source,
            })?
            .trim()
            .to_string();
        if pubkey.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "public key file {} is empty",
                pubkey_path.display()
            )));
        }

        let prvkey_path = wireguard
            .prvkey_path
            .ok_or_else(|| ConfigError::Invalid("prvkey_path in [wireguard] is required".into()))?;
        if !prvkey_path.is_file() {
            return Err(ConfigError::Invalid(format!(
                "private key file {} is not readable",
                prvkey_path.display()
            )));
        }

        if wireguard.endpoint.is_some() && wireguard.device.is_none() {
            return Err(ConfigError::Invalid(
                "endpoint in [wireguard] requires device (a server needs an inbound interface)"
                    .into(),
            ));
        }

        let allowed_ips = parse_prefix_list(wireguard.allowed_ips.as_deref().unwrap_or(""))?;

        let node_id = amesh
            .node_id
            .unwrap_or_else(|| amesh_directory::derive_node_id(&pubkey));

        Ok(Self {
            directory: DirectoryConfig {
                endpoint: raw.etcd.etcd_endpoint,
                prefix: raw.etcd.etcd_prefix,
                username: raw.etcd.etcd_username,
                password: raw.etcd.etcd_password,
            },
            node_id,
            groups: split_list(amesh.groups.as_deref().unwrap_or("")).into_iter().collect(),
            tracked_devices: split_list(amesh.tracked_devices.as_deref().unwrap_or("")),
            vrf: amesh.vrf,
            device: wireguard.device,
            endpoint: wireguard.endpoint,
            port: wireguard.port,
            address: wireguard.address,
            pubkey,
            prvkey_path,
            keepalive: wireguard.keepalive,
            allowed_ips,
            portbase: wireguard.portbase,
        })
    }

    /// The self-descriptor advertised into the directory.
    #[must_use]
    pub fn self_node(&self) -> Node {
        Node {
            pubkey: Some(self.pubkey.clone()),
            endpoint: self.endpoint.clone(),
            allowed_ips: self.allowed_ips.clone(),
            keepalive: self.keepalive,
            groups: self.groups.clone(),
            present: true,
        }
    }

    /// Builder parameters derived from the local dataplane options.
    #[must_use]
    pub fn build_params(&self) -> BuildParams {
        BuildParams {
            inbound_dev: self.device.clone(),
            prvkey_path: self.prvkey_path.clone(),
        }
    }
}

/// Splits a comma-separated option value, trimming whitespace.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_prefix_list(value: &str) -> Result<BTreeSet<IpNet>, ConfigError> {
    let mut prefixes = BTreeSet::new();
    for token in split_list(value) {
        let net: IpNet = token
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid allowed_ips prefix '{token}'")))?;
        prefixes.insert(net.trunc());
    }
    Ok(prefixes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn key_files(dir: &TempDir) -> (PathBuf, PathBuf) {
        let pubkey = dir.path().join("public.key");
        let prvkey = dir.path().join("private.key");
        let mut f = fs::File::create(&pubkey).expect("create pubkey");
        writeln!(f, "KA").expect("write pubkey");
        fs::File::create(&prvkey).expect("create prvkey");
        (pubkey, prvkey)
    }

    fn write_config(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("amesh.conf");
        fs::write(&path, body).expect("write config");
        path
    }

    #[test]
    fn load_full_config() {
        let dir = TempDir::new().expect("tempdir");
        let (pubkey, prvkey) = key_files(&dir);
        let path = write_config(
            &dir,
            &format!(
                r#"
[etcd]
etcd_endpoint = "10.0.0.5:2379"
etcd_prefix = "m"

[amesh]
node_id = "A"
groups = "any, blue"
tracked_devices = "eth0,eth1"

[wireguard]
device = "wg0"
endpoint = "10.0.0.1:51820"
address = "10.0.0.1/24"
pubkey_path = "{}"
prvkey_path = "{}"
allowed_ips = "10.0.1.7/24"
keepalive = 25
"#,
                pubkey.display(),
                prvkey.display()
            ),
        );

        let config = AgentConfig::load(&path).expect("config loads");
        assert_eq!(config.directory.endpoint, "10.0.0.5:2379");
        assert_eq!(config.directory.prefix, "m");
        assert_eq!(config.node_id, "A");
        assert_eq!(
            config.groups,
            BTreeSet::from(["any".to_string(), "blue".to_string()])
        );
        assert_eq!(config.tracked_devices, ["eth0", "eth1"]);
        assert_eq!(config.pubkey, "KA");
        assert_eq!(config.port, 51820);
        assert_eq!(config.portbase, 51821);
        // allowed_ips canonicalized to the network prefix.
        assert!(config.allowed_ips.contains(&"10.0.1.0/24".parse().expect("net")));

        let node = config.self_node();
        assert_eq!(node.keepalive, 25);
        assert!(node.present);
    }

    #[test]
    fn defaults_apply_when_sections_missing() {
        let dir = TempDir::new().expect("tempdir");
        let (pubkey, prvkey) = key_files(&dir);
        let path = write_config(
            &dir,
            &format!(
                "[wireguard]\npubkey_path = \"{}\"\nprvkey_path = \"{}\"\n",
                pubkey.display(),
                prvkey.display()
            ),
        );

        let config = AgentConfig::load(&path).expect("config loads");
        assert_eq!(config.directory.endpoint, "127.0.0.1:2379");
        assert_eq!(config.directory.prefix, "amesh");
        // node_id falls back to the uuid derived from the public key.
        assert_eq!(config.node_id, amesh_directory::derive_node_id("KA"));
        assert!(config.groups.is_empty());
        assert!(config.endpoint.is_none());
    }

    #[test]
    fn endpoint_without_device_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let (pubkey, prvkey) = key_files(&dir);
        let path = write_config(
            &dir,
            &format!(
                "[wireguard]\nendpoint = \"1.2.3.4:51820\"\npubkey_path = \"{}\"\nprvkey_path = \"{}\"\n",
                pubkey.display(),
                prvkey.display()
            ),
        );
        assert!(matches!(
            AgentConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn missing_key_files_are_fatal() {
        let dir = TempDir::new().expect("tempdir");
        let path = write_config(
            &dir,
            "[wireguard]\npubkey_path = \"/nonexistent/public.key\"\nprvkey_path = \"/nonexistent/private.key\"\n",
        );
        assert!(AgentConfig::load(&path).is_err());
    }

    #[test]
    fn unknown_sections_are_ignored() {
        let dir = TempDir::new().expect("tempdir");
        let (pubkey, prvkey) = key_files(&dir);
        let path = write_config(
            &dir,
            &format!(
                "[node-b]\npubkey = \"KB\"\n\n[wireguard]\npubkey_path = \"{}\"\nprvkey_path = \"{}\"\n",
                pubkey.display(),
                prvkey.display()
            ),
        );
        assert!(AgentConfig::load(&path).is_ok());
    }

    #[test]
    fn split_list_trims_and_drops_empties() {
        assert_eq!(split_list("a, b ,,c"), ["a", "b", "c"]);
        assert!(split_list("").is_empty());
        assert!(split_list(" , ").is_empty());
    }
}
