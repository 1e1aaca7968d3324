use std::net::Ipv4Addr;
use thiserror::Error;

use crate::types::IpConfig;

/// Kernel limit on interface names, excluding the trailing NUL.
pub const MAX_IFNAME_LEN: usize = 15;

/// Prefix of host-side veth names.
pub const HOST_IFNAME_PREFIX: &str = "s-";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("IfName cannot be longer than 15 characters")]
    NameTooLong,

    #[error("IfName cannot be empty")]
    EmptyName,

    #[error("ipam result carries no address")]
    NoAddress,
}

/// Everything the veth manager needs to build one attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub container_if_name: String,
    pub host_if_name: String,
    pub mtu: u32,
    pub addressing: IpConfig,
}

impl InterfaceConfig {
    /// Validate the requested name and derive the host side from the first
    /// assigned address. Runs before any kernel operation.
    pub fn new(container_if_name: &str, mtu: u32, addressing: IpConfig) -> Result<Self, InterfaceError> {
        validate_ifname(container_if_name)?;
        let primary = addressing.primary().ok_or(InterfaceError::NoAddress)?;
        let host_if_name = host_ifname(primary.address.ip());

        Ok(Self {
            container_if_name: container_if_name.to_string(),
            host_if_name,
            mtu,
            addressing,
        })
    }
}

pub fn validate_ifname(name: &str) -> Result<(), InterfaceError> {
    if name.is_empty() {
        return Err(InterfaceError::EmptyName);
    }
    if name.len() > MAX_IFNAME_LEN {
        return Err(InterfaceError::NameTooLong);
    }
    Ok(())
}

/// `10.255.30.4` => `s-010255030004`
pub fn host_ifname(ip: Ipv4Addr) -> String {
    let [a, b, c, d] = ip.octets();
    format!("{}{:03}{:03}{:03}{:03}", HOST_IFNAME_PREFIX, a, b, c, d)
}
