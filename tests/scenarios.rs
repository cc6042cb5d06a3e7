//! End-to-end scenarios: the master reconcilers and a node view running
//! against a live registry and a recording dataplane.

use std::sync::Arc;
use std::time::Duration;

use tenant_sdn::admin::{self, ProjectOptions};
use tenant_sdn::dataplane::recording::{HookCall, RecordingDataplane};
use tenant_sdn::master::{self, MasterConfig};
use tenant_sdn::netid;
use tenant_sdn::netutils;
use tenant_sdn::node::{NodeConfig, NodeView};
use tenant_sdn::registry::{
    Endpoints, Namespace, Node, Pod, PodPhase, Protocol, Registry, Service, ServicePort,
};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const CLUSTER_CIDR: &str = "10.128.0.0/14";
const SERVICE_CIDR: &str = "172.30.0.0/16";

struct Cluster {
    registry: Arc<Registry>,
    dataplane: Arc<RecordingDataplane>,
    cancel: CancellationToken,
}

impl Cluster {
    async fn start_master() -> Self {
        let registry = Arc::new(Registry::new());
        let dataplane = Arc::new(RecordingDataplane::new());
        let cancel = CancellationToken::new();

        let mut config = MasterConfig::new(CLUSTER_CIDR, 9, SERVICE_CIDR);
        config.vnid_min = 10;
        config.vnid_max = 50;
        tokio::spawn(master::start(
            config,
            registry.clone(),
            dataplane.clone(),
            cancel.child_token(),
        ));
        // the cluster network record is the first thing the master persists
        eventually(|| registry.network_info().is_ok()).await;

        Self {
            registry,
            dataplane,
            cancel,
        }
    }

    async fn start_node(&self, node_name: &str, node_ip: &str) -> NodeView {
        self.registry
            .nodes()
            .create(Node::new(node_name, node_ip))
            .unwrap();

        let mut config = NodeConfig::new(node_name, 1450);
        config.subnet_attempts = 200;
        config.subnet_retry_interval = Duration::from_millis(10);
        config.vnid_retries = 100;
        config.vnid_retry_interval = Duration::from_millis(10);
        config.ready_attempts = 100;
        config.ready_log_interval = Duration::from_millis(50);

        let view = NodeView::new(config, self.registry.clone(), self.dataplane.clone());
        tokio::spawn(view.clone().run(self.cancel.child_token()));
        view.wait_for_pod_network_ready().await.unwrap();
        view
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

fn assert_host_subnet_invariants(registry: &Registry) {
    let cluster: ipnetwork::Ipv4Network = CLUSTER_CIDR.parse().unwrap();
    let subnets: Vec<_> = registry
        .host_subnets()
        .list()
        .into_iter()
        .map(|stored| stored.record)
        .collect();
    for subnet in &subnets {
        assert!(
            cluster.contains(subnet.subnet.network()),
            "{} outside {}",
            subnet.subnet,
            cluster
        );
    }
    for (i, a) in subnets.iter().enumerate() {
        for b in &subnets[i + 1..] {
            assert!(
                !netutils::networks_overlap(a.subnet, b.subnet),
                "{} overlaps {}",
                a.subnet,
                b.subnet
            );
        }
    }
}

fn assert_vnid_invariants(registry: &Registry) {
    for stored in registry.net_namespaces().list() {
        let id = stored.record.net_id;
        assert!(
            id == netid::GLOBAL_VNID || (netid::MIN_VNID..=netid::MAX_VNID).contains(&id),
            "vnid {id} out of range"
        );
    }
}

#[tokio::test]
async fn scenario_subnet_allocation() {
    let cluster = Cluster::start_master().await;
    let registry = &cluster.registry;

    registry.nodes().create(Node::new("n1", "192.168.1.10")).unwrap();
    registry.nodes().create(Node::new("n2", "192.168.1.11")).unwrap();
    eventually(|| {
        registry.host_subnets().get("n1").is_ok() && registry.host_subnets().get("n2").is_ok()
    })
    .await;

    let s1 = registry.host_subnets().get("n1").unwrap().record;
    let s2 = registry.host_subnets().get("n2").unwrap().record;
    assert_eq!(s1.subnet.prefix(), 23);
    assert_eq!(s2.subnet.prefix(), 23);
    assert_ne!(s1.subnet, s2.subnet);
    assert_host_subnet_invariants(registry);

    registry.nodes().delete("n1").unwrap();
    eventually(|| registry.host_subnets().get("n1").is_err()).await;
    assert_host_subnet_invariants(registry);
}

#[tokio::test]
async fn scenario_node_ip_change() {
    let cluster = Cluster::start_master().await;
    let registry = &cluster.registry;

    registry.nodes().create(Node::new("n1", "192.168.1.10")).unwrap();
    eventually(|| registry.host_subnets().get("n1").is_ok()).await;
    let before = registry.host_subnets().get("n1").unwrap().record;

    let stored = registry.nodes().get("n1").unwrap();
    registry
        .nodes()
        .update(stored.revision, Node::new("n1", "192.168.1.20"))
        .unwrap();
    eventually(|| {
        registry
            .host_subnets()
            .get("n1")
            .map(|s| s.record.host_ip == "192.168.1.20")
            .unwrap_or(false)
    })
    .await;
    let after = registry.host_subnets().get("n1").unwrap().record;
    assert_eq!(after.subnet, before.subnet);
}

#[tokio::test]
async fn scenario_vnid_auto_assignment() {
    let cluster = Cluster::start_master().await;
    let registry = &cluster.registry;

    for name in ["a", "b", "c"] {
        registry.namespaces().create(Namespace::new(name)).unwrap();
    }
    eventually(|| ["a", "b", "c"].iter().all(|n| registry.get_net_namespace(n).is_ok())).await;

    let mut ids: Vec<u32> = ["a", "b", "c"]
        .iter()
        .map(|n| registry.get_net_namespace(n).unwrap().net_id)
        .collect();
    assert!(ids.iter().all(|id| (10..=50).contains(id)));
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3);
    assert_vnid_invariants(registry);
}

#[tokio::test]
async fn scenario_requested_vnid_sharing() {
    let cluster = Cluster::start_master().await;
    let registry = &cluster.registry;

    registry.namespaces().create(Namespace::new("a")).unwrap();
    eventually(|| registry.get_net_namespace("a").is_ok()).await;
    let id = registry.get_net_namespace("a").unwrap().net_id;

    registry.namespaces().create(Namespace::new("b")).unwrap();
    eventually(|| registry.get_net_namespace("b").is_ok()).await;

    admin::request_vnid(registry, &ProjectOptions::for_projects(["b"]), id).unwrap();
    eventually(|| registry.get_net_namespace("b").map(|n| n.net_id) == Ok(id)).await;
    let b = registry.namespaces().get("b").unwrap().record;
    assert_eq!(netid::requested_vnid(&b).unwrap(), None);
    assert_eq!(netid::vnid(&b).unwrap(), Some(id));

    // deleting one holder keeps the shared vnid; a new namespace cannot get
    // it back from the allocator while "b" holds it
    registry.namespaces().delete("a").unwrap();
    eventually(|| registry.get_net_namespace("a").is_err()).await;
    assert_eq!(registry.get_net_namespace("b").unwrap().net_id, id);

    // deleting the last holder releases it: the next namespace may be
    // handed the freed id again
    registry.namespaces().delete("b").unwrap();
    eventually(|| registry.get_net_namespace("b").is_err()).await;

    registry.namespaces().create(Namespace::new("c")).unwrap();
    eventually(|| registry.get_net_namespace("c").is_ok()).await;
    assert_vnid_invariants(registry);
}

#[tokio::test]
async fn scenario_global_namespaces() {
    let cluster = Cluster::start_master().await;
    let registry = &cluster.registry;

    registry.namespaces().create(Namespace::new("default")).unwrap();
    eventually(|| registry.get_net_namespace("default").is_ok()).await;
    assert_eq!(
        registry.get_net_namespace("default").unwrap().net_id,
        netid::GLOBAL_VNID
    );

    registry.namespaces().create(Namespace::new("x")).unwrap();
    eventually(|| registry.get_net_namespace("x").is_ok()).await;
    assert_ne!(registry.get_net_namespace("x").unwrap().net_id, netid::GLOBAL_VNID);

    admin::make_global(registry, &ProjectOptions::for_projects(["x"])).unwrap();
    eventually(|| {
        registry.get_net_namespace("x").map(|n| n.net_id) == Ok(netid::GLOBAL_VNID)
    })
    .await;
    assert_vnid_invariants(registry);
}

#[tokio::test]
async fn scenario_node_view_convergence() {
    let cluster = Cluster::start_master().await;
    let registry = &cluster.registry;
    let view = cluster.start_node("n1", "192.168.1.10").await;

    for name in ["a", "b", "c"] {
        registry.namespaces().create(Namespace::new(name)).unwrap();
    }
    registry.namespaces().create(Namespace::new("gone")).unwrap();
    eventually(|| registry.get_net_namespace("gone").is_ok()).await;
    registry.namespaces().delete("gone").unwrap();

    // the local table converges to the registry's NetNamespace set
    eventually(|| {
        let want: Vec<(String, u32)> = registry
            .net_namespaces()
            .list()
            .into_iter()
            .map(|stored| (stored.record.name.clone(), stored.record.net_id))
            .collect();
        view.vnid_table().snapshot() == want && !want.is_empty()
    })
    .await;
}

#[tokio::test]
async fn scenario_service_before_netnamespace() {
    let cluster = Cluster::start_master().await;
    let registry = &cluster.registry;
    let dataplane = &cluster.dataplane;
    let _view = cluster.start_node("n1", "192.168.1.10").await;

    // the service event is delivered before the namespace has a vnid; the
    // service watcher's bounded lookup retry bridges the gap
    registry
        .services()
        .create(Service {
            name: "svc".into(),
            namespace: "late".into(),
            uid: "uid-late".into(),
            cluster_ip: Some("172.30.0.10".parse().unwrap()),
            ports: vec![ServicePort {
                protocol: Protocol::Tcp,
                port: 80,
            }],
        })
        .unwrap();
    sleep(Duration::from_millis(50)).await;
    registry.namespaces().create(Namespace::new("late")).unwrap();

    eventually(|| registry.get_net_namespace("late").is_ok()).await;
    let id = registry.get_net_namespace("late").unwrap().net_id;
    eventually(|| {
        dataplane.count(
            |c| matches!(c, HookCall::AddServiceRules { uid, vnid } if uid == "uid-late" && *vnid == id),
        ) == 1
    })
    .await;
}

#[tokio::test]
async fn scenario_remote_subnet_rules() {
    let cluster = Cluster::start_master().await;
    let registry = &cluster.registry;
    let dataplane = &cluster.dataplane;
    let _view = cluster.start_node("n1", "192.168.1.10").await;

    registry.nodes().create(Node::new("n2", "192.168.1.11")).unwrap();
    eventually(|| {
        dataplane.count(|c| matches!(c, HookCall::AddHostSubnetRules { host, .. } if host == "n2")) == 1
    })
    .await;
    // no rules are installed for the local node's own subnet
    assert_eq!(
        dataplane.count(|c| matches!(c, HookCall::AddHostSubnetRules { host, .. } if host == "n1")),
        0
    );

    registry.nodes().delete("n2").unwrap();
    eventually(|| {
        dataplane.count(|c| matches!(c, HookCall::DeleteHostSubnetRules { host } if host == "n2")) == 1
    })
    .await;
}

#[tokio::test]
async fn scenario_endpoint_filtering() {
    let cluster = Cluster::start_master().await;
    let registry = &cluster.registry;
    let view = cluster.start_node("n1", "192.168.1.10").await;

    for (name, namespace, ip) in [("p1", "ns2", "10.128.3.4"), ("p2", "ns1", "10.128.3.5")] {
        registry
            .pods()
            .create(Pod {
                name: name.into(),
                namespace: namespace.into(),
                node_name: "n1".into(),
                phase: PodPhase::Running,
                ip: Some(ip.parse().unwrap()),
                container_id: format!("{name}-container"),
            })
            .unwrap();
    }
    eventually(|| {
        view.filter_endpoints(&[Endpoints {
            name: "probe".into(),
            namespace: "ns1".into(),
            addresses: vec!["10.128.3.5".parse().unwrap()],
        }])
        .map(|f| !f.is_empty())
        .unwrap_or(false)
    })
    .await;

    let endpoints = [Endpoints {
        name: "svc".into(),
        namespace: "ns1".into(),
        addresses: vec![
            "172.30.0.5".parse().unwrap(), // inside the service network
            "10.128.3.4".parse().unwrap(), // another tenant's pod
            "10.128.3.5".parse().unwrap(), // our own pod
            "8.8.8.8".parse().unwrap(),    // external
        ],
    }];
    let filtered = view.filter_endpoints(&endpoints).unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(
        filtered[0].addresses,
        vec![
            "10.128.3.5".parse::<std::net::Ipv4Addr>().unwrap(),
            "8.8.8.8".parse().unwrap()
        ]
    );
}

#[tokio::test]
async fn scenario_master_restart_rebuilds_allocators() {
    let registry;
    {
        let cluster = Cluster::start_master().await;
        registry = cluster.registry.clone();
        registry.nodes().create(Node::new("n1", "192.168.1.10")).unwrap();
        registry.namespaces().create(Namespace::new("web")).unwrap();
        eventually(|| {
            registry.host_subnets().get("n1").is_ok() && registry.get_net_namespace("web").is_ok()
        })
        .await;
    }

    // a second master over the same registry must not reuse what is taken
    let dataplane = Arc::new(RecordingDataplane::new());
    let cancel = CancellationToken::new();
    let mut config = MasterConfig::new(CLUSTER_CIDR, 9, SERVICE_CIDR);
    config.vnid_min = 10;
    config.vnid_max = 50;
    tokio::spawn(master::start(
        config,
        registry.clone(),
        dataplane,
        cancel.child_token(),
    ));

    let taken_subnet = registry.host_subnets().get("n1").unwrap().record.subnet;
    let taken_vnid = registry.get_net_namespace("web").unwrap().net_id;

    registry.nodes().create(Node::new("n2", "192.168.1.11")).unwrap();
    registry.namespaces().create(Namespace::new("api")).unwrap();
    eventually(|| {
        registry.host_subnets().get("n2").is_ok() && registry.get_net_namespace("api").is_ok()
    })
    .await;

    assert_ne!(registry.host_subnets().get("n2").unwrap().record.subnet, taken_subnet);
    assert_ne!(registry.get_net_namespace("api").unwrap().net_id, taken_vnid);
    assert_host_subnet_invariants(&registry);
    assert_vnid_invariants(&registry);
    cancel.cancel();
}
