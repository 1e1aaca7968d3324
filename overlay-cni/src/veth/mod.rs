//! Veth pair management.
//!
//! Links are driven through iproute2. Work inside a container namespace runs
//! on a dedicated thread that `setns`-es into it, so the main thread (and
//! `/proc/<pid>/ns/net`) always stays in the host namespace.

pub mod config;

pub use config::{InterfaceConfig, InterfaceError};

use nix::sched::{setns, CloneFlags};
use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use thiserror::Error;
use tracing::{debug, info};

use crate::types::Interface;

#[derive(Debug, Error)]
pub enum VethError {
    #[error("open-netns {path}: {source}")]
    OpenNetns {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("setns {path}: {source}")]
    Setns {
        path: String,
        #[source]
        source: nix::Error,
    },

    #[error("{command}: {source}")]
    Exec {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("{command}: {stderr}")]
    Command { command: String, stderr: String },

    #[error("read link {name}: {reason}")]
    LinkInfo { name: String, reason: String },

    #[error("network namespace worker panicked")]
    Worker,
}

/// Both ends of a created pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub host: Interface,
    pub container: Interface,
}

/// Outcome of removing the container end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detached {
    Removed,
    /// Nothing to remove; usually the runtime already destroyed the namespace contents.
    LinkNotFound,
}

/// Creates and removes the container's link.
pub trait LinkManager {
    fn attach(&self, netns: &Path, config: &InterfaceConfig) -> Result<Attachment, VethError>;
    fn detach(&self, netns: &Path, if_name: &str) -> Result<Detached, VethError>;
}

/// [`LinkManager`] backed by the `ip` command.
#[derive(Debug, Clone)]
pub struct VethManager {
    ip_binary: PathBuf,
}

impl Default for VethManager {
    fn default() -> Self {
        Self {
            ip_binary: PathBuf::from("ip"),
        }
    }
}

impl VethManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific iproute2 binary.
    pub fn with_ip_binary(ip_binary: PathBuf) -> Self {
        Self { ip_binary }
    }

    fn ip(&self, args: &[&str]) -> Result<String, VethError> {
        let command = format!("ip {}", args.join(" "));
        debug!(command = %command, "running");

        let output = Command::new(&self.ip_binary)
            .args(args)
            .output()
            .map_err(|source| VethError::Exec {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(VethError::Command {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// MAC address of a link in the current namespace.
    fn link_mac(&self, name: &str) -> Result<String, VethError> {
        let stdout = self.ip(&["-j", "link", "show", "dev", name])?;
        let links: serde_json::Value =
            serde_json::from_str(&stdout).map_err(|e| VethError::LinkInfo {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        links[0]["address"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| VethError::LinkInfo {
                name: name.to_string(),
                reason: "no address in link info".to_string(),
            })
    }

    /// Runs inside the container namespace.
    fn setup_container_side(&self, config: &InterfaceConfig, host_pid: &str) -> Result<String, VethError> {
        let container = config.container_if_name.as_str();
        let host = config.host_if_name.as_str();
        let mtu = config.mtu.to_string();

        // ip link add <ctr> mtu <mtu> type veth peer name <host> mtu <mtu>
        let mut add = vec!["link", "add", container];
        if config.mtu > 0 {
            add.extend(["mtu", mtu.as_str()]);
        }
        add.extend(["type", "veth", "peer", "name", host]);
        if config.mtu > 0 {
            add.extend(["mtu", mtu.as_str()]);
        }
        self.ip(&add)?;

        // move the host end back to the namespace we were started in
        self.ip(&["link", "set", "dev", host, "netns", host_pid])?;

        for ip in &config.addressing.ips {
            self.ip(&["addr", "add", &ip.address.to_string(), "dev", container])?;
        }
        self.ip(&["link", "set", "dev", container, "up"])?;

        let default_gw = config.addressing.primary().and_then(|ip| ip.gateway);
        for route in &config.addressing.routes {
            let dst = route.dst.to_string();
            match route.gw.or(default_gw) {
                Some(gw) => {
                    let gw = gw.to_string();
                    self.ip(&["route", "add", &dst, "via", &gw, "dev", container])?
                }
                None => self.ip(&["route", "add", &dst, "dev", container])?,
            };
        }

        self.link_mac(container)
    }

    fn setup_host_side(&self, config: &InterfaceConfig) -> Result<String, VethError> {
        let host = config.host_if_name.as_str();
        self.ip(&["link", "set", "dev", host, "up"])?;

        // the host end answers for the container's gateway
        if let Some(gw) = config.addressing.primary().and_then(|ip| ip.gateway) {
            self.ip(&["addr", "add", &format!("{}/32", gw), "dev", host])?;
        }
        for ip in &config.addressing.ips {
            self.ip(&["route", "add", &format!("{}/32", ip.address.ip()), "dev", host])?;
        }

        self.link_mac(host)
    }
}

impl LinkManager for VethManager {
    fn attach(&self, netns: &Path, config: &InterfaceConfig) -> Result<Attachment, VethError> {
        let host_pid = std::process::id().to_string();
        let worker = self.clone();
        let worker_config = config.clone();
        let container_mac = in_netns(netns, move || {
            worker.setup_container_side(&worker_config, &host_pid)
        })?;

        let host_mac = self.setup_host_side(config)?;
        info!(
            host = %config.host_if_name,
            container = %config.container_if_name,
            netns = %netns.display(),
            "veth pair created"
        );

        Ok(Attachment {
            host: Interface {
                name: config.host_if_name.clone(),
                mac: Some(host_mac),
                sandbox: None,
            },
            container: Interface {
                name: config.container_if_name.clone(),
                mac: Some(container_mac),
                sandbox: Some(netns.display().to_string()),
            },
        })
    }

    fn detach(&self, netns: &Path, if_name: &str) -> Result<Detached, VethError> {
        let worker = self.clone();
        let name = if_name.to_string();
        in_netns(netns, move || {
            match worker.ip(&["link", "show", "dev", &name]) {
                Ok(_) => {}
                Err(VethError::Command { stderr, .. }) if stderr.contains("does not exist") => {
                    return Ok(Detached::LinkNotFound)
                }
                Err(err) => return Err(err),
            }
            // deleting one end removes the peer on the host too
            worker.ip(&["link", "del", "dev", &name])?;
            Ok(Detached::Removed)
        })
    }
}

/// Run `f` on a fresh thread that has joined the network namespace at `netns`.
pub fn in_netns<F, T>(netns: &Path, f: F) -> Result<T, VethError>
where
    F: FnOnce() -> Result<T, VethError> + Send + 'static,
    T: Send + 'static,
{
    let path = netns.display().to_string();
    let file = File::open(netns).map_err(|source| VethError::OpenNetns {
        path: path.clone(),
        source,
    })?;

    let handle = thread::spawn(move || {
        setns(file.as_raw_fd(), CloneFlags::CLONE_NEWNET)
            .map_err(|source| VethError::Setns { path, source })?;
        f()
    });

    handle.join().map_err(|_| VethError::Worker)?
}
