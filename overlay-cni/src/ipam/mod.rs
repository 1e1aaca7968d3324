//! IPAM delegation.
//!
//! Address management is handed to an external CNI plugin, found by name on
//! `CNI_PATH` and run with the same environment and a config that carries an
//! `ipam` section for the resolved subnet.

use ipnetwork::IpNetwork;
use itertools::Itertools;
use serde::Deserialize;
use serde_json::json;
use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::debug;

use crate::config::NetConf;
use crate::netinfo::NetworkInfo;
use crate::types::{CmdArgs, Dns, IpAssignment, IpConfig, Route};

#[derive(Debug, Error)]
pub enum DelegateError {
    #[error("failed to find plugin \"{plugin}\" in path [{paths}]")]
    NotFound { plugin: String, paths: String },

    #[error("exec {plugin}: {source}")]
    Spawn {
        plugin: String,
        #[source]
        source: io::Error,
    },

    #[error("communicate with {plugin}: {source}")]
    Io {
        plugin: String,
        #[source]
        source: io::Error,
    },

    /// Error text reported by the plugin itself.
    #[error("{0}")]
    Plugin(String),

    #[error("decode ipam result: {0}")]
    Result(String),

    #[error("build ipam config: {0}")]
    Config(String),
}

/// Allocates and releases addresses for one attachment.
pub trait AddressDelegate {
    fn add(&self, config: &[u8]) -> Result<IpConfig, DelegateError>;
    fn del(&self, config: &[u8]) -> Result<(), DelegateError>;
}

/// Runs a CNI IPAM plugin binary.
#[derive(Debug, Clone)]
pub struct ExecDelegate {
    plugin: String,
    search_path: Vec<PathBuf>,
    envs: Vec<(String, String)>,
}

impl ExecDelegate {
    pub fn new(plugin: &str, args: &CmdArgs) -> Self {
        let search_path = args
            .path
            .split(':')
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .collect();
        let envs = vec![
            ("CNI_CONTAINERID".to_string(), args.container_id.clone()),
            ("CNI_NETNS".to_string(), args.netns.clone()),
            ("CNI_IFNAME".to_string(), args.ifname.clone()),
            ("CNI_PATH".to_string(), args.path.clone()),
        ];
        Self {
            plugin: plugin.to_string(),
            search_path,
            envs,
        }
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Locate the plugin binary in the search path.
    pub fn find_plugin(&self) -> Result<PathBuf, DelegateError> {
        self.search_path
            .iter()
            .map(|dir| dir.join(&self.plugin))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| DelegateError::NotFound {
                plugin: self.plugin.clone(),
                paths: self.search_path.iter().map(|p| p.display()).join(" "),
            })
    }

    fn exec(&self, command: &str, config: &[u8]) -> Result<Vec<u8>, DelegateError> {
        let binary = self.find_plugin()?;
        debug!(plugin = %binary.display(), command, "running ipam plugin");

        let mut child = Command::new(&binary)
            .env("CNI_COMMAND", command)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| DelegateError::Spawn {
                plugin: self.plugin.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(config).map_err(|source| DelegateError::Io {
                plugin: self.plugin.clone(),
                source,
            })?;
        }

        let output = child.wait_with_output().map_err(|source| DelegateError::Io {
            plugin: self.plugin.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(plugin_failure(&output.stdout));
        }
        Ok(output.stdout)
    }
}

impl AddressDelegate for ExecDelegate {
    fn add(&self, config: &[u8]) -> Result<IpConfig, DelegateError> {
        let stdout = self.exec("ADD", config)?;
        parse_result(&stdout)
    }

    fn del(&self, config: &[u8]) -> Result<(), DelegateError> {
        self.exec("DEL", config).map(|_| ())
    }
}

#[derive(Deserialize)]
struct PluginError {
    #[serde(default)]
    msg: String,
    #[serde(default)]
    details: String,
}

/// Turn a failed plugin's stdout into its error text.
fn plugin_failure(stdout: &[u8]) -> DelegateError {
    match serde_json::from_slice::<PluginError>(stdout) {
        Ok(err) if err.details.is_empty() => DelegateError::Plugin(err.msg),
        Ok(err) => DelegateError::Plugin(format!("{}; {}", err.msg, err.details)),
        Err(_) => {
            let text = String::from_utf8_lossy(stdout);
            let text = text.trim();
            if text.is_empty() {
                DelegateError::Plugin("netplugin failed with no error message".to_string())
            } else {
                DelegateError::Plugin(format!("netplugin failed: {:?}", text))
            }
        }
    }
}

/// Config handed to the delegate: the caller's config with an `ipam`
/// section for `info`'s subnet.
pub fn delegate_config(
    stdin: &[u8],
    conf: &NetConf,
    info: &NetworkInfo,
) -> Result<Vec<u8>, DelegateError> {
    let mut value: serde_json::Value =
        serde_json::from_slice(stdin).map_err(|e| DelegateError::Config(e.to_string()))?;

    let mut ipam = json!({
        "type": conf.ipam_type(),
        "ranges": [[{ "subnet": info.overlay_subnet }]],
        "routes": [{ "dst": "0.0.0.0/0" }],
    });
    if !conf.data_dir.is_empty() {
        ipam["dataDir"] = json!(conf.data_dir);
    }

    value
        .as_object_mut()
        .ok_or_else(|| DelegateError::Config("network configuration is not an object".to_string()))?
        .insert("ipam".to_string(), ipam);

    serde_json::to_vec(&value).map_err(|e| DelegateError::Config(e.to_string()))
}

#[derive(Deserialize)]
struct RawResult {
    #[serde(default)]
    ips: Vec<RawIp>,
    #[serde(default)]
    routes: Vec<RawRoute>,
    ip4: Option<RawLegacyIp>,
    #[serde(default)]
    dns: Dns,
}

#[derive(Deserialize)]
struct RawIp {
    address: String,
    gateway: Option<String>,
}

#[derive(Deserialize)]
struct RawLegacyIp {
    ip: String,
    gateway: Option<String>,
    #[serde(default)]
    routes: Vec<RawRoute>,
}

#[derive(Deserialize)]
struct RawRoute {
    dst: String,
    gw: Option<String>,
}

/// Decode a delegate ADD result in either the current or the `ip4` form.
/// IPv6 entries are dropped.
pub fn parse_result(stdout: &[u8]) -> Result<IpConfig, DelegateError> {
    let raw: RawResult =
        serde_json::from_slice(stdout).map_err(|e| DelegateError::Result(e.to_string()))?;

    let (ips, routes) = match raw.ip4 {
        Some(legacy) => (
            vec![RawIp {
                address: legacy.ip,
                gateway: legacy.gateway,
            }],
            legacy.routes,
        ),
        None => (raw.ips, raw.routes),
    };

    let mut config = IpConfig {
        dns: raw.dns,
        ..Default::default()
    };

    for ip in ips {
        let IpNetwork::V4(address) = parse_network(&ip.address)? else {
            debug!(address = %ip.address, "skipping non-IPv4 address");
            continue;
        };
        let gateway = ip.gateway.as_deref().map(parse_v4).transpose()?;
        config.ips.push(IpAssignment { address, gateway });
    }

    for route in routes {
        let IpNetwork::V4(dst) = parse_network(&route.dst)? else {
            continue;
        };
        let gw = route.gw.as_deref().map(parse_v4).transpose()?;
        config.routes.push(Route { dst, gw });
    }

    if config.ips.is_empty() {
        return Err(DelegateError::Result("no IPv4 address in result".to_string()));
    }
    Ok(config)
}

fn parse_network(s: &str) -> Result<IpNetwork, DelegateError> {
    s.parse()
        .map_err(|e| DelegateError::Result(format!("invalid address {}: {}", s, e)))
}

fn parse_v4(s: &str) -> Result<Ipv4Addr, DelegateError> {
    match s.parse::<IpAddr>() {
        Ok(IpAddr::V4(addr)) => Ok(addr),
        Ok(IpAddr::V6(_)) => Err(DelegateError::Result(format!("gateway {} is not IPv4", s))),
        Err(e) => Err(DelegateError::Result(format!("invalid gateway {}: {}", s, e))),
    }
}
