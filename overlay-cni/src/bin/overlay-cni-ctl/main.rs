use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use overlay_cni::config::NetworkInfoSource;
use overlay_cni::netinfo::NetworkInfoResolver;
use overlay_cni::store::MetadataStore;
use overlay_cni::veth::config::HOST_IFNAME_PREFIX;

/// A command line tool to inspect overlay CNI attachments
#[derive(Parser)]
#[command(name = "overlay-cni-ctl", author, version, about)]
struct Cli {
    /// Path to the container metadata store
    #[arg(long, default_value = "/var/lib/overlay-cni/container-metadata.json")]
    datastore: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List recorded attachments
    List {
        /// Show addressing details
        #[arg(long)]
        detailed: bool,
    },

    /// Print the record of one container as JSON
    Show { container_id: String },

    /// Drop the record of one container without touching its links
    Forget { container_id: String },

    /// Resolve and print the overlay network info
    Netinfo(SourceArgs),

    /// Generate a network configuration
    Generate {
        /// Network name
        #[arg(long, default_value = "overlay")]
        name: String,

        /// IPAM data directory
        #[arg(long, default_value = "/var/lib/overlay-cni/ipam")]
        data_dir: String,

        #[command(flatten)]
        source: SourceArgs,

        /// Output file path
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Host-side veth links and whether a record covers them
    Status,
}

#[derive(Args)]
struct SourceArgs {
    /// Flannel-style subnet file
    #[arg(long, conflicts_with = "daemon_port")]
    subnet_file: Option<PathBuf>,

    /// Network-info daemon port
    #[arg(long)]
    daemon_port: Option<u16>,

    /// Network-info daemon host
    #[arg(long, default_value = "127.0.0.1")]
    daemon_host: String,
}

impl SourceArgs {
    fn source(&self) -> Result<NetworkInfoSource> {
        match (&self.subnet_file, self.daemon_port) {
            (Some(path), _) => Ok(NetworkInfoSource::LocalFile(path.clone())),
            (None, Some(port)) => Ok(NetworkInfoSource::RemoteDaemon {
                host: self.daemon_host.clone(),
                port,
            }),
            (None, None) => anyhow::bail!("either --subnet-file or --daemon-port is required"),
        }
    }
}

#[derive(Serialize)]
struct NetworkConfig {
    #[serde(rename = "cniVersion")]
    cni_version: String,
    name: String,
    #[serde(rename = "type")]
    plugin_type: String,
    #[serde(rename = "dataDir")]
    data_dir: String,
    datastore: String,
    #[serde(rename = "subnetFile", skip_serializing_if = "Option::is_none")]
    subnet_file: Option<PathBuf>,
    #[serde(rename = "daemonPort", skip_serializing_if = "Option::is_none")]
    daemon_port: Option<u16>,
    #[serde(rename = "daemonHost", skip_serializing_if = "Option::is_none")]
    daemon_host: Option<String>,
}

struct HostLink {
    name: String,
    state: String,
}

fn host_links() -> Result<Vec<HostLink>> {
    let output = Command::new("ip")
        .args(["-j", "link", "show", "type", "veth"])
        .output()
        .context("Failed to execute ip link show command")?;

    if !output.status.success() {
        anyhow::bail!(
            "Failed to get interface status: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    let links: Vec<serde_json::Value> =
        serde_json::from_slice(&output.stdout).context("Failed to parse ip link output")?;

    Ok(links
        .iter()
        .filter_map(|link| {
            let name = link.get("ifname")?.as_str()?;
            name.starts_with(HOST_IFNAME_PREFIX).then(|| HostLink {
                name: name.to_string(),
                state: link
                    .get("operstate")
                    .and_then(|v| v.as_str())
                    .unwrap_or("UNKNOWN")
                    .to_string(),
            })
        })
        .collect())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(log_level))
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set default subscriber")?;

    let store = MetadataStore::new(&cli.datastore);

    match cli.command {
        Commands::List { detailed } => {
            let records = store.list()?;
            if records.is_empty() {
                println!("No attachments recorded in {}", cli.datastore.display());
            }
            for record in records {
                println!("{} {} -> {} ({})", record.container_id, record.host_if_name, record.if_name, record.namespace_path);
                if detailed {
                    for ip in &record.ip_config.ips {
                        match ip.gateway {
                            Some(gw) => println!("    address {} via {}", ip.address, gw),
                            None => println!("    address {}", ip.address),
                        }
                    }
                    for route in &record.ip_config.routes {
                        println!("    route {}", route.dst);
                    }
                }
            }
        }

        Commands::Show { container_id } => match store.read(&container_id)? {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
            None => anyhow::bail!("No record for container {}", container_id),
        },

        Commands::Forget { container_id } => match store.delete(&container_id)? {
            Some(record) => println!("Forgot {} ({})", container_id, record.host_if_name),
            None => println!("No record for container {}", container_id),
        },

        Commands::Netinfo(source) => {
            let info = NetworkInfoResolver::new().resolve(&source.source()?).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }

        Commands::Generate { name, data_dir, source, output } => {
            let (subnet_file, daemon_port, daemon_host) = match source.source()? {
                NetworkInfoSource::LocalFile(path) => (Some(path), None, None),
                NetworkInfoSource::RemoteDaemon { host, port } => (None, Some(port), Some(host)),
            };
            let config = NetworkConfig {
                cni_version: "1.0.0".to_string(),
                name,
                plugin_type: "overlay-cni".to_string(),
                data_dir,
                datastore: cli.datastore.display().to_string(),
                subnet_file,
                daemon_port,
                daemon_host,
            };

            let config_json = serde_json::to_string_pretty(&config)?;

            if let Some(path) = output {
                fs::write(&path, config_json)?;
                println!("Network configuration written to {}", path.display());
            } else {
                println!("{}", config_json);
            }
        }

        Commands::Status => {
            let recorded: HashSet<String> = store
                .list()?
                .into_iter()
                .map(|record| record.host_if_name)
                .collect();
            let links = host_links()?;

            if links.is_empty() {
                println!("No host-side veth links found");
            }
            for link in links {
                let note = if recorded.contains(&link.name) { "recorded" } else { "no record" };
                println!("  {} {} ({})", link.name, link.state, note);
            }
        }
    }

    Ok(())
}
