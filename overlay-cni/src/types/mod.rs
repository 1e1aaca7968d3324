use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// CNI versions this plugin can emit results for.
pub const SUPPORTED_VERSIONS: &[&str] = &["0.1.0", "0.2.0", "0.3.0", "0.3.1", "0.4.0", "1.0.0"];

/// CNI command arguments
#[derive(Debug, Clone)]
pub struct CmdArgs {
    /// Container ID
    pub container_id: String,
    /// Network namespace path
    pub netns: String,
    /// Interface name
    pub ifname: String,
    /// Arguments
    pub args: HashMap<String, String>,
    /// Plugin search path
    pub path: String,
    /// Standard input data
    pub stdin_data: Vec<u8>,
}

/// Canonical addressing handed out by the IPAM delegate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpConfig {
    pub ips: Vec<IpAssignment>,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub dns: Dns,
}

/// One assigned address with its prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAssignment {
    pub address: Ipv4Network,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
}

/// Route configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Destination CIDR
    pub dst: Ipv4Network,
    /// Gateway for this route
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<Ipv4Addr>,
}

/// DNS configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dns {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl IpConfig {
    /// First assigned address, which names the host side of the pair.
    pub fn primary(&self) -> Option<&IpAssignment> {
        self.ips.first()
    }
}

/// Interface information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    /// Interface name
    pub name: String,
    /// MAC address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Sandbox path (network namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

/// IP entry of a 0.3.0+ result
#[derive(Debug, Clone, Serialize)]
pub struct IpResult {
    /// Only emitted below 1.0.0
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub address: Ipv4Network,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    /// Index into `interfaces`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
}

/// Result format for 0.3.0 and later
#[derive(Debug, Clone, Serialize)]
pub struct CurrentResult {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub interfaces: Vec<Interface>,
    pub ips: Vec<IpResult>,
    pub routes: Vec<Route>,
    pub dns: Dns,
}

/// `ip4` block of a 0.1.0/0.2.0 result
#[derive(Debug, Clone, Serialize)]
pub struct LegacyIp {
    pub ip: Ipv4Network,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
}

/// Result format for 0.1.0 and 0.2.0
#[derive(Debug, Clone, Serialize)]
pub struct LegacyResult {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip4: Option<LegacyIp>,
    pub dns: Dns,
}

/// Result of a successful ADD, shaped for the requested version.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum CniResult {
    Current(CurrentResult),
    Legacy(LegacyResult),
}

impl CniResult {
    /// Build the result for `cni_version`. `interfaces` are ordered host
    /// first, container second; addresses point at the container entry.
    pub fn new(cni_version: &str, interfaces: Vec<Interface>, ip_config: &IpConfig) -> Self {
        match cni_version {
            "0.1.0" | "0.2.0" => CniResult::Legacy(LegacyResult {
                cni_version: cni_version.to_string(),
                ip4: ip_config.primary().map(|ip| LegacyIp {
                    ip: ip.address,
                    gateway: ip.gateway,
                    routes: ip_config.routes.clone(),
                }),
                dns: ip_config.dns.clone(),
            }),
            _ => {
                let version = (cni_version != "1.0.0").then(|| "4".to_string());
                let container_index = interfaces.len().checked_sub(1);
                CniResult::Current(CurrentResult {
                    cni_version: cni_version.to_string(),
                    interfaces,
                    ips: ip_config
                        .ips
                        .iter()
                        .map(|ip| IpResult {
                            version: version.clone(),
                            address: ip.address,
                            gateway: ip.gateway,
                            interface: container_index,
                        })
                        .collect(),
                    routes: ip_config.routes.clone(),
                    dns: ip_config.dns.clone(),
                })
            }
        }
    }

    /// Print result as JSON
    pub fn print(&self) -> serde_json::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        println!("{}", json);
        Ok(())
    }
}

/// Output of the VERSION command
#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    #[serde(rename = "supportedVersions")]
    pub supported_versions: Vec<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            cni_version: "1.0.0".to_string(),
            supported_versions: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
        }
    }
}
