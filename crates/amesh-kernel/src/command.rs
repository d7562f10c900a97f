//! Kernel surface backed by the `ip` and `wg` command-line tools.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use ipnet::IpNet;
use tokio::process::Command;
use tracing::debug;

use crate::Result;
use crate::error::KernelError;
use crate::kernel::Kernel;

/// Default path of the `ip` tool.
pub const IP_CMD: &str = "/bin/ip";
/// Default path of the `wg` tool.
pub const WG_CMD: &str = "/usr/bin/wg";

/// A [`Kernel`] that spawns one external command per action.
///
/// Interface existence is checked through sysfs rather than by parsing
/// `ip` output.
#[derive(Clone, Debug)]
pub struct CommandKernel {
    ip: PathBuf,
    wg: PathBuf,
}

impl Default for CommandKernel {
    fn default() -> Self {
        Self {
            ip: PathBuf::from(IP_CMD),
            wg: PathBuf::from(WG_CMD),
        }
    }
}

impl CommandKernel {
    /// Creates a kernel surface using the default tool paths.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the tool paths (container images move them around).
    #[must_use]
    pub fn with_paths(ip: impl Into<PathBuf>, wg: impl Into<PathBuf>) -> Self {
        Self {
            ip: ip.into(),
            wg: wg.into(),
        }
    }

    async fn run(&self, program: &Path, args: Vec<String>) -> Result<()> {
        let rendered = format!("{} {}", program.display(), args.join(" "));
        debug!(command = %rendered, "exec");

        let output = Command::new(program)
            .args(&args)
            .output()
            .await
            .map_err(|source| KernelError::Spawn {
                command: rendered.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(KernelError::CommandFailed {
                command: rendered,
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(ToString::to_string).collect()
}

/// Arguments for `wg set <dev> peer <pubkey> …`. Empty allowed-ips and a
/// zero keepalive are omitted, matching the tool's own defaults.
fn wg_peer_args(
    dev: &str,
    pubkey: &str,
    endpoint: Option<&str>,
    allowed_ips: &BTreeSet<IpNet>,
    keepalive: u32,
) -> Vec<String> {
    let mut args = strings(&["set", dev, "peer", pubkey]);
    if let Some(endpoint) = endpoint {
        args.push("endpoint".to_string());
        args.push(endpoint.to_string());
    }
    if !allowed_ips.is_empty() {
        args.push("allowed-ips".to_string());
        args.push(
            allowed_ips
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(","),
        );
    }
    if keepalive > 0 {
        args.push("persistent-keepalive".to_string());
        args.push(keepalive.to_string());
    }
    args
}

/// Arguments for `ip route add`. A single nexthop uses the plain `dev`
/// form; several produce an equal-weight ECMP entry.
fn route_add_args(prefix: &IpNet, nexthops: &[String]) -> Vec<String> {
    let mut args = strings(&["route", "add", "to", &prefix.to_string()]);
    if let [nexthop] = nexthops {
        args.push("dev".to_string());
        args.push(nexthop.clone());
    } else {
        for nexthop in nexthops {
            args.extend(strings(&["nexthop", "dev", nexthop, "weight", "1"]));
        }
    }
    args
}

impl Kernel for CommandKernel {
    async fn iface_exists(&self, name: &str) -> bool {
        Path::new("/sys/class/net").join(name).exists()
    }

    async fn iface_create(&self, name: &str) -> Result<()> {
        self.run(&self.ip, strings(&["link", "add", name, "type", "wireguard"]))
            .await
    }

    async fn iface_delete(&self, name: &str) -> Result<()> {
        self.run(&self.ip, strings(&["link", "del", "dev", name])).await
    }

    async fn iface_set_up(&self, name: &str) -> Result<()> {
        self.run(&self.ip, strings(&["link", "set", "dev", name, "up"]))
            .await
    }

    async fn iface_set_master(&self, name: &str, vrf: &str) -> Result<()> {
        self.run(&self.ip, strings(&["link", "set", "dev", name, "master", vrf]))
            .await
    }

    async fn iface_addr_add(&self, name: &str, cidr: &str) -> Result<()> {
        self.run(&self.ip, strings(&["addr", "add", "dev", name, cidr]))
            .await
    }

    async fn iface_addr_flush(&self, name: &str) -> Result<()> {
        self.run(&self.ip, strings(&["addr", "flush", "dev", name])).await
    }

    async fn wg_set_device(
        &self,
        name: &str,
        prvkey_path: &Path,
        listen_port: u16,
    ) -> Result<()> {
        self.run(
            &self.wg,
            strings(&[
                "set",
                name,
                "private-key",
                &prvkey_path.display().to_string(),
                "listen-port",
                &listen_port.to_string(),
            ]),
        )
        .await
    }

    async fn wg_set_peer(
        &self,
        name: &str,
        pubkey: &str,
        endpoint: Option<&str>,
        allowed_ips: &BTreeSet<IpNet>,
        keepalive: u32,
    ) -> Result<()> {
        self.run(&self.wg, wg_peer_args(name, pubkey, endpoint, allowed_ips, keepalive))
            .await
    }

    async fn wg_remove_peer(&self, name: &str, pubkey: &str) -> Result<()> {
        self.run(&self.wg, strings(&["set", name, "peer", pubkey, "remove"]))
            .await
    }

    async fn route_add(&self, prefix: &IpNet, nexthops: &[String]) -> Result<()> {
        self.run(&self.ip, route_add_args(prefix, nexthops)).await
    }

    async fn route_del(&self, prefix: &IpNet) -> Result<()> {
        self.run(
            &self.ip,
            strings(&["route", "del", "to", &prefix.to_string()]),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().expect("valid cidr")
    }

    #[test]
    fn wg_peer_args_full() {
        let ips: BTreeSet<IpNet> = [net("10.0.2.0/24"), net("10.0.3.0/24")].into();
        let args = wg_peer_args("wg0", "KB", Some("1.2.3.4:51820"), &ips, 25);
        assert_eq!(
            args,
            [
                "set",
                "wg0",
                "peer",
                "KB",
                "endpoint",
                "1.2.3.4:51820",
                "allowed-ips",
                "10.0.2.0/24,10.0.3.0/24",
                "persistent-keepalive",
                "25",
            ]
        );
    }

    #[test]
    fn wg_peer_args_omit_optionals() {
        let args = wg_peer_args("wg0", "KB", None, &BTreeSet::new(), 0);
        assert_eq!(args, ["set", "wg0", "peer", "KB"]);
    }

    #[test]
    fn route_add_args_single_nexthop() {
        let args = route_add_args(&net("10.0.2.0/24"), &["wg-abc".to_string()]);
        assert_eq!(args, ["route", "add", "to", "10.0.2.0/24", "dev", "wg-abc"]);
    }

    #[test]
    fn route_add_args_ecmp() {
        let nexthops = vec!["wg-ab".to_string(), "wg-cd".to_string()];
        let args = route_add_args(&net("10.0.2.0/24"), &nexthops);
        assert_eq!(
            args,
            [
                "route", "add", "to", "10.0.2.0/24", //
                "nexthop", "dev", "wg-ab", "weight", "1", //
                "nexthop", "dev", "wg-cd", "weight", "1",
            ]
        );
    }
}
