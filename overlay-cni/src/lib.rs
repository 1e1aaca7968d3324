//! Overlay CNI plugin
//!
//! Attaches containers to this host's slice of an overlay network:
//! - Discovers the overlay subnet and MTU from a subnet file or the daemon
//! - Delegates address assignment to an IPAM plugin
//! - Creates a veth pair between the container namespace and the host
//! - Records each attachment so teardown can undo it

pub mod commands;
pub mod config;
pub mod error;
pub mod ipam;
pub mod netinfo;
pub mod plugin;
pub mod store;
pub mod types;
pub mod veth;

// Re-export commonly used items
pub use commands::{cmd_add, cmd_del, cmd_version, run_cni};
pub use config::{NetConf, NetworkInfoSource};
pub use error::{CniError, Stage};
pub use plugin::OverlayPlugin;
