use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::types::SUPPORTED_VERSIONS;

/// Address the daemon is queried on when `daemonHost` is not set.
pub const DEFAULT_DAEMON_HOST: &str = "127.0.0.1";

/// IPAM plugin used when the config carries no `ipam.type`.
pub const DEFAULT_IPAM_TYPE: &str = "host-local";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("parse network configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("incompatible CNI version {0}")]
    UnsupportedVersion(String),

    #[error("network info source missing: set either subnetFile or daemonPort")]
    MissingSource,
}

/// Network configuration for the overlay CNI, read from stdin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConf {
    /// CNI specification version
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Name of the network
    pub name: String,
    /// Type of CNI plugin
    #[serde(rename = "type")]
    pub plugin_type: String,
    /// Directory handed to the IPAM plugin for its own state
    #[serde(rename = "dataDir", default)]
    pub data_dir: String,
    /// Path of the container metadata store
    #[serde(default)]
    pub datastore: String,
    /// Port of the network-info daemon
    #[serde(rename = "daemonPort", default, skip_serializing_if = "Option::is_none")]
    pub daemon_port: Option<u16>,
    /// Host of the network-info daemon
    #[serde(rename = "daemonHost", default, skip_serializing_if = "Option::is_none")]
    pub daemon_host: Option<String>,
    /// Path of a flannel-style subnet environment file
    #[serde(rename = "subnetFile", default, skip_serializing_if = "Option::is_none")]
    pub subnet_file: Option<PathBuf>,
    /// IPAM delegate selection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipam: Option<IpamConf>,
    /// Keep the stored record when a DEL step fails
    #[serde(rename = "retainMetadataOnFailure", default)]
    pub retain_metadata_on_failure: bool,
}

/// IPAM (IP Address Management) delegate selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpamConf {
    /// Type of IPAM plugin
    #[serde(rename = "type")]
    pub ipam_type: String,
}

/// Where network info comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkInfoSource {
    LocalFile(PathBuf),
    RemoteDaemon { host: String, port: u16 },
}

impl NetConf {
    /// Parse NetConf from bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, ConfigError> {
        let conf: NetConf = serde_json::from_slice(bytes)?;

        if !SUPPORTED_VERSIONS.contains(&conf.cni_version.as_str()) {
            return Err(ConfigError::UnsupportedVersion(conf.cni_version));
        }

        // fail early so both ADD and DEL see the same error
        conf.source()?;

        Ok(conf)
    }

    /// The network info source; a subnet file wins over a daemon port.
    pub fn source(&self) -> Result<NetworkInfoSource, ConfigError> {
        match (&self.subnet_file, self.daemon_port) {
            (Some(path), _) if !path.as_os_str().is_empty() => {
                Ok(NetworkInfoSource::LocalFile(path.clone()))
            }
            (_, Some(port)) => Ok(NetworkInfoSource::RemoteDaemon {
                host: self
                    .daemon_host
                    .clone()
                    .unwrap_or_else(|| DEFAULT_DAEMON_HOST.to_string()),
                port,
            }),
            _ => Err(ConfigError::MissingSource),
        }
    }

    /// Name of the IPAM delegate plugin.
    pub fn ipam_type(&self) -> &str {
        self.ipam
            .as_ref()
            .map(|ipam| ipam.ipam_type.as_str())
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_IPAM_TYPE)
    }
}
