use std::path::Path;
use tracing::{debug, error, info};

use crate::config::NetConf;
use crate::error::{CniError, Stage};
use crate::ipam::{self, AddressDelegate, ExecDelegate};
use crate::netinfo::{NetworkInfo, NetworkInfoResolver};
use crate::store::{AttachmentRecord, MetadataStore};
use crate::types::{CmdArgs, CniResult};
use crate::veth::{Detached, InterfaceConfig, LinkManager, VethError, VethManager};

/// One DEL step that failed and was logged instead of aborting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
    pub step: &'static str,
    pub error: String,
}

/// What a DEL got done.
#[derive(Debug, Clone, Default)]
pub struct TeardownReport {
    pub failures: Vec<TeardownFailure>,
    /// Record found in the store, if any.
    pub record: Option<AttachmentRecord>,
    pub record_removed: bool,
    pub link_missing: bool,
}

impl TeardownReport {
    fn fail(&mut self, step: &'static str, err: impl std::fmt::Display) {
        let error = err.to_string();
        error!(message = step, error = %error);
        self.failures.push(TeardownFailure { step, error });
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Overlay network plugin: sequences discovery, IPAM, veth and metadata.
pub struct OverlayPlugin<D = ExecDelegate, L = VethManager> {
    config: NetConf,
    args: CmdArgs,
    resolver: NetworkInfoResolver,
    delegate: D,
    links: L,
    store: MetadataStore,
}

impl OverlayPlugin {
    /// Create a plugin that runs the configured IPAM binary and drives `ip`.
    pub fn new(config: NetConf, args: CmdArgs) -> Self {
        let delegate = ExecDelegate::new(config.ipam_type(), &args);
        Self::with_parts(config, args, delegate, VethManager::new())
    }
}

impl<D, L> OverlayPlugin<D, L>
where
    D: AddressDelegate,
    L: LinkManager,
{
    pub fn with_parts(config: NetConf, args: CmdArgs, delegate: D, links: L) -> Self {
        let store = MetadataStore::new(&config.datastore);
        Self {
            config,
            args,
            resolver: NetworkInfoResolver::new(),
            delegate,
            links,
            store,
        }
    }

    async fn resolve(&self) -> Result<NetworkInfo, CniError> {
        let source = self
            .config
            .source()
            .map_err(|e| CniError::from_err(Stage::LoadConfig, e))?;
        self.resolver
            .resolve(&source)
            .await
            .map_err(|e| CniError::from_err(Stage::DiscoverNetworkInfo, e))
    }

    fn delegate_config(&self, info: &NetworkInfo) -> Result<Vec<u8>, ipam::DelegateError> {
        ipam::delegate_config(&self.args.stdin_data, &self.config, info)
    }

    /// Attach the container. The first failing stage ends the call.
    pub async fn add_network(&self) -> Result<CniResult, CniError> {
        let info = self.resolve().await?;
        debug!(subnet = %info.overlay_subnet, mtu = info.mtu, "resolved network info");

        self.store
            .probe()
            .map_err(|e| CniError::from_err(Stage::WriteContainerMetadata, e))?;

        let ip_config = self
            .delegate_config(&info)
            .and_then(|conf| self.delegate.add(&conf))
            .map_err(|e| CniError::from_err(Stage::RunIpamPlugin, e))?;

        let interface = InterfaceConfig::new(&self.args.ifname, info.mtu, ip_config)
            .map_err(|e| CniError::from_err(Stage::CreateConfig, e))?;

        let attachment = self
            .links
            .attach(Path::new(&self.args.netns), &interface)
            .map_err(|e| CniError::from_err(Stage::CreateVethPair, e))?;

        let record = AttachmentRecord {
            container_id: self.args.container_id.clone(),
            if_name: interface.container_if_name.clone(),
            namespace_path: self.args.netns.clone(),
            host_if_name: interface.host_if_name.clone(),
            ip_config: interface.addressing.clone(),
        };
        self.store
            .write(&record)
            .map_err(|e| CniError::from_err(Stage::WriteContainerMetadata, e))?;

        info!(container_id = %self.args.container_id, host = %interface.host_if_name, "container attached");
        Ok(CniResult::new(
            &self.config.cni_version,
            vec![attachment.host, attachment.container],
            &interface.addressing,
        ))
    }

    /// Detach the container. Only network discovery can fail the call; every
    /// later step is logged and skipped past.
    pub async fn del_network(&self) -> Result<TeardownReport, CniError> {
        let info = self.resolve().await?;
        let mut report = TeardownReport::default();
        let container_id = self.args.container_id.as_str();

        let store_ok = match self.store.probe() {
            Ok(()) => true,
            Err(err) => {
                report.fail("write-container-metadata", err);
                false
            }
        };

        if store_ok {
            match self.store.read(container_id) {
                Ok(record) => report.record = record,
                Err(err) => report.fail("read-container-metadata", err),
            }
        }

        if let Err(err) = self
            .delegate_config(&info)
            .and_then(|conf| self.delegate.del(&conf))
        {
            report.fail("ipam-del", err);
        }

        // the runtime's view wins; the record fills in what it left out
        let netns = non_empty(&self.args.netns)
            .or_else(|| report.record.as_ref().map(|r| r.namespace_path.clone()));
        let if_name = non_empty(&self.args.ifname)
            .or_else(|| report.record.as_ref().map(|r| r.if_name.clone()));

        match (netns, if_name) {
            (Some(netns), Some(if_name)) => match self.links.detach(Path::new(&netns), &if_name) {
                Ok(Detached::Removed) => debug!(deviceName = %if_name, "link removed"),
                Ok(Detached::LinkNotFound) => {
                    info!(deviceName = %if_name, message = "Link not found");
                    report.link_missing = true;
                }
                Err(err @ VethError::OpenNetns { .. }) => report.fail("open-netns", err),
                Err(err) => report.fail("del-veth", err),
            },
            _ => debug!(container_id, "no namespace or interface to clean up"),
        }

        if store_ok {
            if !report.is_clean() && self.config.retain_metadata_on_failure {
                info!(container_id, "keeping container metadata after failed teardown");
            } else {
                match self.store.delete(container_id) {
                    Ok(removed) => report.record_removed = removed.is_some(),
                    Err(err) => report.fail("write-container-metadata", err),
                }
            }
        }

        Ok(report)
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}
