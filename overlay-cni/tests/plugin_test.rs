use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use overlay_cni::config::NetConf;
use overlay_cni::error::Stage;
use overlay_cni::ipam::{AddressDelegate, DelegateError};
use overlay_cni::plugin::OverlayPlugin;
use overlay_cni::store::MetadataStore;
use overlay_cni::types::{CmdArgs, CniResult, Interface, IpAssignment, IpConfig, Route};
use overlay_cni::veth::{Attachment, Detached, InterfaceConfig, LinkManager, VethError};
use tempfile::TempDir;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::FmtSubscriber;

#[derive(Default)]
struct FakeDelegate {
    fail_with: Option<String>,
    calls: RefCell<Vec<(String, serde_json::Value)>>,
}

impl FakeDelegate {
    fn failing(msg: &str) -> Self {
        Self {
            fail_with: Some(msg.to_string()),
            ..Default::default()
        }
    }
}

impl AddressDelegate for FakeDelegate {
    fn add(&self, config: &[u8]) -> Result<IpConfig, DelegateError> {
        self.calls
            .borrow_mut()
            .push(("ADD".to_string(), serde_json::from_slice(config).unwrap()));
        if let Some(msg) = &self.fail_with {
            return Err(DelegateError::Plugin(msg.clone()));
        }
        Ok(IpConfig {
            ips: vec![IpAssignment {
                address: "10.255.30.4/24".parse().unwrap(),
                gateway: Some(Ipv4Addr::new(10, 255, 30, 1)),
            }],
            routes: vec![Route {
                dst: "0.0.0.0/0".parse().unwrap(),
                gw: None,
            }],
            dns: Default::default(),
        })
    }

    fn del(&self, config: &[u8]) -> Result<(), DelegateError> {
        self.calls
            .borrow_mut()
            .push(("DEL".to_string(), serde_json::from_slice(config).unwrap()));
        match &self.fail_with {
            Some(msg) => Err(DelegateError::Plugin(msg.clone())),
            None => Ok(()),
        }
    }
}

#[derive(Clone, Copy, Default, PartialEq)]
enum NetnsState {
    #[default]
    Present,
    LinkGone,
    Missing,
}

#[derive(Default)]
struct FakeLinks {
    netns: NetnsState,
    attached: RefCell<Vec<(PathBuf, InterfaceConfig)>>,
    detached: RefCell<Vec<(PathBuf, String)>>,
}

impl FakeLinks {
    fn with(netns: NetnsState) -> Self {
        Self {
            netns,
            ..Default::default()
        }
    }

    fn missing_netns(path: &Path) -> VethError {
        VethError::OpenNetns {
            path: path.display().to_string(),
            source: io::Error::from_raw_os_error(2),
        }
    }
}

impl LinkManager for FakeLinks {
    fn attach(&self, netns: &Path, config: &InterfaceConfig) -> Result<Attachment, VethError> {
        if self.netns == NetnsState::Missing {
            return Err(Self::missing_netns(netns));
        }
        self.attached
            .borrow_mut()
            .push((netns.to_path_buf(), config.clone()));
        Ok(Attachment {
            host: Interface {
                name: config.host_if_name.clone(),
                mac: Some("aa:aa:0a:ff:1e:04".to_string()),
                sandbox: None,
            },
            container: Interface {
                name: config.container_if_name.clone(),
                mac: Some("ee:ee:0a:ff:1e:04".to_string()),
                sandbox: Some(netns.display().to_string()),
            },
        })
    }

    fn detach(&self, netns: &Path, if_name: &str) -> Result<Detached, VethError> {
        self.detached
            .borrow_mut()
            .push((netns.to_path_buf(), if_name.to_string()));
        match self.netns {
            NetnsState::Present => Ok(Detached::Removed),
            NetnsState::LinkGone => Ok(Detached::LinkNotFound),
            NetnsState::Missing => Err(Self::missing_netns(netns)),
        }
    }
}

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("subnet.env"),
            "FLANNEL_NETWORK=10.255.0.0/16\nFLANNEL_SUBNET=10.255.30.0/24\nFLANNEL_MTU=1350\n",
        )
        .unwrap();
        Self { dir }
    }

    fn datastore(&self) -> PathBuf {
        self.dir.path().join("metadata.json")
    }

    fn stdin(&self, extra: serde_json::Value) -> Vec<u8> {
        let mut conf = serde_json::json!({
            "cniVersion": "0.3.1",
            "name": "my-overlay",
            "type": "overlay-cni",
            "dataDir": self.dir.path().join("ipam").display().to_string(),
            "datastore": self.datastore().display().to_string(),
            "subnetFile": self.dir.path().join("subnet.env").display().to_string(),
        });
        if let (Some(conf), Some(extra)) = (conf.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                conf.insert(k.clone(), v.clone());
            }
        }
        serde_json::to_vec(&conf).unwrap()
    }

    fn args(&self, stdin: Vec<u8>, netns: &str, ifname: &str) -> CmdArgs {
        CmdArgs {
            container_id: "container-1".to_string(),
            netns: netns.to_string(),
            ifname: ifname.to_string(),
            args: HashMap::new(),
            path: "/opt/cni/bin".to_string(),
            stdin_data: stdin,
        }
    }

    fn plugin<'a>(
        &self,
        extra: serde_json::Value,
        netns: &str,
        ifname: &str,
        delegate: &'a FakeDelegate,
        links: &'a FakeLinks,
    ) -> OverlayPlugin<&'a FakeDelegate, &'a FakeLinks> {
        let stdin = self.stdin(extra);
        let conf = NetConf::parse(&stdin).unwrap();
        OverlayPlugin::with_parts(conf, self.args(stdin, netns, ifname), delegate, links)
    }
}

impl AddressDelegate for &FakeDelegate {
    fn add(&self, config: &[u8]) -> Result<IpConfig, DelegateError> {
        (**self).add(config)
    }
    fn del(&self, config: &[u8]) -> Result<(), DelegateError> {
        (**self).del(config)
    }
}

impl LinkManager for &FakeLinks {
    fn attach(&self, netns: &Path, config: &InterfaceConfig) -> Result<Attachment, VethError> {
        (**self).attach(netns, config)
    }
    fn detach(&self, netns: &Path, if_name: &str) -> Result<Detached, VethError> {
        (**self).detach(netns, if_name)
    }
}

/// Log output captured with the plugin binary's JSON format.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

const NETNS: &str = "/var/run/netns/container-1";

#[tokio::test]
async fn test_add_attaches_and_records() {
    let fx = Fixture::new();
    let (delegate, links) = (FakeDelegate::default(), FakeLinks::default());
    let plugin = fx.plugin(serde_json::json!({}), NETNS, "eth0", &delegate, &links);

    let result = plugin.add_network().await.unwrap();

    let CniResult::Current(result) = result else {
        panic!("expected a 0.3.1 result");
    };
    assert_eq!(result.interfaces[0].name, "s-010255030004");
    assert_eq!(result.interfaces[1].name, "eth0");
    assert_eq!(result.ips[0].interface, Some(1));

    let ipam_conf = &delegate.calls.borrow()[0].1;
    assert_eq!(ipam_conf["ipam"]["type"], "host-local");
    assert_eq!(ipam_conf["ipam"]["ranges"][0][0]["subnet"], "10.255.30.0/24");
    assert_eq!(ipam_conf["name"], "my-overlay");

    let attached = links.attached.borrow();
    assert_eq!(attached[0].0, PathBuf::from(NETNS));
    assert_eq!(attached[0].1.mtu, 1350);

    let record = MetadataStore::new(fx.datastore())
        .read("container-1")
        .unwrap()
        .unwrap();
    assert_eq!(record.if_name, "eth0");
    assert_eq!(record.namespace_path, NETNS);
    assert_eq!(record.host_if_name, "s-010255030004");
    assert_eq!(record.ip_config, attached[0].1.addressing);
}

#[tokio::test]
async fn test_add_hands_ipam_the_network_of_a_flannel_subnet() {
    let fx = Fixture::new();
    std::fs::write(
        fx.dir.path().join("subnet.env"),
        "FLANNEL_NETWORK=10.255.0.0/16\nFLANNEL_SUBNET=10.255.30.1/24\nFLANNEL_MTU=1350\n",
    )
    .unwrap();
    let (delegate, links) = (FakeDelegate::default(), FakeLinks::default());
    let plugin = fx.plugin(serde_json::json!({}), NETNS, "eth0", &delegate, &links);

    plugin.add_network().await.unwrap();

    let ipam_conf = &delegate.calls.borrow()[0].1;
    assert_eq!(ipam_conf["ipam"]["type"], "host-local");
    assert_eq!(ipam_conf["ipam"]["ranges"][0][0]["subnet"], "10.255.30.0/24");
}

#[tokio::test]
async fn test_add_stops_at_ipam_failure() {
    let fx = Fixture::new();
    let delegate = FakeDelegate::failing("invalid CIDR address: 10.255.30.0/33");
    let links = FakeLinks::default();
    let plugin = fx.plugin(serde_json::json!({}), NETNS, "eth0", &delegate, &links);

    let err = plugin.add_network().await.unwrap_err();

    assert_eq!(err.code, 100);
    assert_eq!(err.msg, "run ipam plugin");
    assert_eq!(err.details, "invalid CIDR address: 10.255.30.0/33");
    assert!(links.attached.borrow().is_empty());
    assert!(MetadataStore::new(fx.datastore()).list().unwrap().is_empty());
}

#[tokio::test]
async fn test_add_rejects_long_interface_name_before_touching_links() {
    let fx = Fixture::new();
    let (delegate, links) = (FakeDelegate::default(), FakeLinks::default());
    let plugin = fx.plugin(serde_json::json!({}), NETNS, "some-bad-eth-name", &delegate, &links);

    let err = plugin.add_network().await.unwrap_err();

    assert!(err.is_stage(Stage::CreateConfig));
    assert_eq!(err.details, "IfName cannot be longer than 15 characters");
    assert!(links.attached.borrow().is_empty());
}

#[tokio::test]
async fn test_add_reports_missing_namespace() {
    let fx = Fixture::new();
    let delegate = FakeDelegate::default();
    let links = FakeLinks::with(NetnsState::Missing);
    let plugin = fx.plugin(serde_json::json!({}), "/tmp/not/there", "eth0", &delegate, &links);

    let err = plugin.add_network().await.unwrap_err();

    assert!(err.is_stage(Stage::CreateVethPair));
    assert!(err.details.starts_with("open-netns /tmp/not/there: "), "{}", err.details);
    assert!(MetadataStore::new(fx.datastore()).list().unwrap().is_empty());
}

#[tokio::test]
async fn test_add_with_empty_datastore_fails_before_ipam() {
    let fx = Fixture::new();
    let (delegate, links) = (FakeDelegate::default(), FakeLinks::default());
    let plugin = fx.plugin(serde_json::json!({"datastore": ""}), NETNS, "eth0", &delegate, &links);

    let err = plugin.add_network().await.unwrap_err();

    assert!(err.is_stage(Stage::WriteContainerMetadata));
    assert_eq!(
        err.details,
        "open lock: open : No such file or directory (os error 2)"
    );
    assert!(delegate.calls.borrow().is_empty());
}

#[tokio::test]
async fn test_add_fails_when_network_info_is_missing() {
    let fx = Fixture::new();
    let (delegate, links) = (FakeDelegate::default(), FakeLinks::default());
    let plugin = fx.plugin(
        serde_json::json!({"subnetFile": "/path/does/not/exist"}),
        NETNS,
        "eth0",
        &delegate,
        &links,
    );

    let err = plugin.add_network().await.unwrap_err();

    assert!(err.is_stage(Stage::DiscoverNetworkInfo));
    assert_eq!(
        err.details,
        "open /path/does/not/exist: No such file or directory (os error 2)"
    );
    assert!(delegate.calls.borrow().is_empty());
}

#[tokio::test]
async fn test_del_undoes_add() {
    let fx = Fixture::new();
    let (delegate, links) = (FakeDelegate::default(), FakeLinks::default());
    let plugin = fx.plugin(serde_json::json!({}), NETNS, "eth0", &delegate, &links);
    plugin.add_network().await.unwrap();

    let report = plugin.del_network().await.unwrap();

    assert!(report.is_clean(), "{:?}", report.failures);
    assert!(report.record_removed);
    assert_eq!(report.record.unwrap().namespace_path, NETNS);
    assert_eq!(delegate.calls.borrow()[1].0, "DEL");
    assert_eq!(
        links.detached.borrow()[0],
        (PathBuf::from(NETNS), "eth0".to_string())
    );
    assert!(MetadataStore::new(fx.datastore()).list().unwrap().is_empty());
}

#[tokio::test]
async fn test_del_falls_back_to_the_record() {
    let fx = Fixture::new();
    let (delegate, links) = (FakeDelegate::default(), FakeLinks::default());
    fx.plugin(serde_json::json!({}), NETNS, "eth0", &delegate, &links)
        .add_network()
        .await
        .unwrap();

    // runtimes may leave CNI_NETNS and CNI_IFNAME empty on DEL
    let plugin = fx.plugin(serde_json::json!({}), "", "", &delegate, &links);
    plugin.del_network().await.unwrap();

    assert_eq!(
        links.detached.borrow()[0],
        (PathBuf::from(NETNS), "eth0".to_string())
    );
}

#[tokio::test]
async fn test_del_twice_is_clean() {
    let fx = Fixture::new();
    let (delegate, links) = (FakeDelegate::default(), FakeLinks::default());
    let plugin = fx.plugin(serde_json::json!({}), NETNS, "eth0", &delegate, &links);
    plugin.add_network().await.unwrap();

    plugin.del_network().await.unwrap();
    let second = plugin.del_network().await.unwrap();

    assert!(second.is_clean());
    assert!(second.record.is_none());
    assert!(!second.record_removed);
}

#[tokio::test]
async fn test_del_continues_past_ipam_failure() {
    let fx = Fixture::new();
    let delegate = FakeDelegate::failing("invalid CIDR address: 10.255.30.0/33");
    let links = FakeLinks::default();
    let plugin = fx.plugin(serde_json::json!({}), NETNS, "eth0", &delegate, &links);

    let report = plugin.del_network().await.unwrap();

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].step, "ipam-del");
    assert_eq!(report.failures[0].error, "invalid CIDR address: 10.255.30.0/33");
    assert_eq!(links.detached.borrow().len(), 1);
}

#[tokio::test]
async fn test_del_tolerates_missing_namespace_and_link() {
    let fx = Fixture::new();
    let delegate = FakeDelegate::default();

    let links = FakeLinks::with(NetnsState::Missing);
    let plugin = fx.plugin(serde_json::json!({}), "/tmp/not/there", "eth0", &delegate, &links);
    let report = plugin.del_network().await.unwrap();
    assert_eq!(report.failures[0].step, "open-netns");
    assert!(report.failures[0].error.contains("/tmp/not/there"));

    let links = FakeLinks::with(NetnsState::LinkGone);
    let plugin = fx.plugin(serde_json::json!({}), NETNS, "not-there", &delegate, &links);
    let report = plugin.del_network().await.unwrap();
    assert!(report.is_clean());
    assert!(report.link_missing);
}

#[tokio::test]
async fn test_del_record_retention_follows_config() {
    let fx = Fixture::new();
    let ok = FakeDelegate::default();
    let links = FakeLinks::default();
    fx.plugin(serde_json::json!({}), NETNS, "eth0", &ok, &links)
        .add_network()
        .await
        .unwrap();

    let failing = FakeDelegate::failing("ipam store locked");
    let retaining = fx.plugin(
        serde_json::json!({"retainMetadataOnFailure": true}),
        NETNS,
        "eth0",
        &failing,
        &links,
    );
    let report = retaining.del_network().await.unwrap();
    assert!(!report.is_clean());
    assert!(!report.record_removed);
    assert!(MetadataStore::new(fx.datastore()).read("container-1").unwrap().is_some());

    let default = fx.plugin(serde_json::json!({}), NETNS, "eth0", &failing, &links);
    let report = default.del_network().await.unwrap();
    assert!(!report.is_clean());
    assert!(report.record_removed);
}

#[tokio::test]
async fn test_del_with_empty_datastore_is_logged_only() {
    let fx = Fixture::new();
    let (delegate, links) = (FakeDelegate::default(), FakeLinks::default());
    let plugin = fx.plugin(serde_json::json!({"datastore": ""}), NETNS, "eth0", &delegate, &links);

    let report = plugin.del_network().await.unwrap();

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].step, "write-container-metadata");
    assert_eq!(
        report.failures[0].error,
        "open lock: open : No such file or directory (os error 2)"
    );
    assert_eq!(delegate.calls.borrow().len(), 1);
    assert_eq!(links.detached.borrow().len(), 1);
}

#[tokio::test]
async fn test_del_fails_when_network_info_is_corrupt() {
    let fx = Fixture::new();
    std::fs::write(fx.dir.path().join("subnet.env"), "FLANNEL_SUBNET=bad-subnet\n").unwrap();
    let (delegate, links) = (FakeDelegate::default(), FakeLinks::default());
    let plugin = fx.plugin(serde_json::json!({}), NETNS, "eth0", &delegate, &links);

    let err = plugin.del_network().await.unwrap_err();

    assert!(err.is_stage(Stage::DiscoverNetworkInfo));
    assert_eq!(err.details, "unable to parse flannel subnet file");
    assert!(delegate.calls.borrow().is_empty());
    assert!(links.detached.borrow().is_empty());
}

#[tokio::test]
async fn test_del_logs_missing_link_by_device_name() {
    let logs = CapturedLogs::default();
    let subscriber = FmtSubscriber::builder()
        .json()
        .flatten_event(true)
        .with_writer(logs.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let fx = Fixture::new();
    let delegate = FakeDelegate::default();
    let links = FakeLinks::with(NetnsState::LinkGone);
    let plugin = fx.plugin(serde_json::json!({}), NETNS, "not-there", &delegate, &links);

    let report = plugin.del_network().await.unwrap();

    assert!(report.link_missing);
    let output = logs.contents();
    assert!(
        output.contains(r#""deviceName":"not-there","message":"Link not found""#),
        "{output}"
    );
}
