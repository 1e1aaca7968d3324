//! Overlay network discovery.
//!
//! The host's slice of the overlay comes either from a flannel-style
//! `subnet.env` file or from the companion daemon's HTTP endpoint. Both
//! sources produce the same [`NetworkInfo`] and the same error type, so the
//! caller reports them under one stage.

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

use crate::config::NetworkInfoSource;

/// MTU assumed when the subnet file does not carry one.
pub const DEFAULT_MTU: u32 = 1450;

const SUBNET_KEY: &str = "FLANNEL_SUBNET";
const MTU_KEY: &str = "FLANNEL_MTU";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("unable to parse flannel subnet file")]
    ParseSubnetFile,

    #[error("{0}")]
    Transport(#[from] reqwest::Error),

    #[error("unmarshal network info: {0}")]
    Unmarshal(#[from] serde_json::Error),
}

/// Subnet and MTU of this host's slice of the overlay.
///
/// The subnet is kept as text: the IPAM delegate is the authority on whether
/// it is a valid range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub overlay_subnet: String,
    pub mtu: u32,
}

/// Resolves [`NetworkInfo`] from a configured source.
#[derive(Debug, Default, Clone)]
pub struct NetworkInfoResolver;

impl NetworkInfoResolver {
    pub fn new() -> Self {
        Self
    }

    pub async fn resolve(&self, source: &NetworkInfoSource) -> Result<NetworkInfo, ResolveError> {
        match source {
            NetworkInfoSource::LocalFile(path) => read_subnet_file(path),
            NetworkInfoSource::RemoteDaemon { host, port } => query_daemon(host, *port).await,
        }
    }
}

/// Read and parse a subnet environment file.
pub fn read_subnet_file(path: &Path) -> Result<NetworkInfo, ResolveError> {
    let contents = fs::read_to_string(path).map_err(|source| ResolveError::Open {
        path: path.display().to_string(),
        source,
    })?;
    let info = parse_subnet_env(&contents)?;
    debug!(path = %path.display(), subnet = %info.overlay_subnet, mtu = info.mtu, "read subnet file");
    Ok(info)
}

/// Parse `KEY=VALUE` lines. Blank lines and `#` comments are skipped; any
/// other line without `=` makes the whole file invalid.
pub fn parse_subnet_env(contents: &str) -> Result<NetworkInfo, ResolveError> {
    let mut vars = HashMap::new();
    for line in contents.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or(ResolveError::ParseSubnetFile)?;
        vars.insert(key.trim(), value.trim());
    }

    let subnet: Ipv4Network = vars
        .get(SUBNET_KEY)
        .and_then(|v| v.parse().ok())
        .ok_or(ResolveError::ParseSubnetFile)?;

    let mtu = match vars.get(MTU_KEY) {
        Some(v) => v.parse().map_err(|_| ResolveError::ParseSubnetFile)?,
        None => DEFAULT_MTU,
    };

    // flanneld writes the gateway address; IPAM ranges want the network
    let network = Ipv4Network::new(subnet.network(), subnet.prefix())
        .map_err(|_| ResolveError::ParseSubnetFile)?;

    Ok(NetworkInfo {
        overlay_subnet: network.to_string(),
        mtu,
    })
}

/// URL the daemon serves network info on.
pub fn daemon_url(host: &str, port: u16) -> String {
    format!("http://{}:{}/", host, port)
}

async fn query_daemon(host: &str, port: u16) -> Result<NetworkInfo, ResolveError> {
    let url = daemon_url(host, port);
    let client = reqwest::Client::builder().no_proxy().build()?;

    let response = client.get(&url).send().await?;
    debug!(url = %url, status = %response.status(), "queried network info daemon");

    // the body is decoded whatever the status; the daemon only ever answers with info
    let body = response.bytes().await?;
    let info = serde_json::from_slice(&body)?;
    Ok(info)
}
