use std::path::Path;
use std::sync::Arc;

use ovnstack::ovnstack::ovsdb::Tool;
use ovnstack::ovnstack::test_support::{overlay_config_in, FakeControlPlane};
use ovnstack::ovnstack::topology::{ClusterParams, TopologyProvisioner};
use tempfile::TempDir;

fn provisioner(fake: &Arc<FakeControlPlane>, root: &Path) -> TopologyProvisioner {
    TopologyProvisioner::new(fake.clone(), overlay_config_in(root))
}

fn params(node: &str) -> ClusterParams {
    ClusterParams::new(node, "10.1.0.0/24", "10.0.0.0/14").expect("valid params")
}

#[test]
fn bootstrap_builds_router_join_switch_and_balancers() {
    let temp = TempDir::new().expect("tempdir");
    let fake = FakeControlPlane::shared();
    let report = provisioner(&fake, temp.path())
        .cluster_bootstrap(&params("master"))
        .expect("bootstrap");

    assert_eq!(report.router, "master");
    assert_eq!(report.join_switch, "join");
    assert_eq!(report.join_address.to_string(), "100.64.1.1/24");

    let state = fake.snapshot();
    let router = state.router("master").expect("router");
    assert_eq!(router.get("external_ids:k8s-cluster-router"), Some("yes"));

    let join_port = state.router_port("rtoj-master").expect("join router port");
    assert_eq!(join_port.get("networks"), Some("100.64.1.1/24"));
    assert_eq!(join_port.get("external_ids:connect_to_join"), Some("yes"));

    let peer = state.switch_port("jtor-master").expect("join switch port");
    assert_eq!(peer.parent.as_deref(), Some("join"));
    assert_eq!(peer.get("type"), Some("router"));
    assert_eq!(peer.get("options:router-port"), Some("rtoj-master"));
    assert_eq!(peer.get("addresses"), join_port.get("mac"));

    let tcp = state
        .load_balancer_tagged("external_ids:k8s-cluster-lb-tcp", "yes")
        .expect("tcp balancer");
    let udp = state
        .load_balancer_tagged("external_ids:k8s-cluster-lb-udp", "yes")
        .expect("udp balancer");
    assert_eq!(udp.get("protocol"), Some("udp"));
    assert_eq!(report.load_balancers.tcp, tcp.uuid);
    assert_eq!(report.load_balancers.udp, udp.uuid);

    let attached = state
        .switch_load_balancers
        .get("master")
        .expect("balancers attached to node switch");
    assert!(attached.contains(&tcp.uuid));
    assert!(attached.contains(&udp.uuid));

    assert_eq!(report.node.router_address.to_string(), "10.1.0.1/24");
    assert_eq!(report.node.management_address.to_string(), "10.1.0.2/24");
}

#[test]
fn bootstrap_twice_leaves_the_topology_unchanged() {
    let temp = TempDir::new().expect("tempdir");
    let fake = FakeControlPlane::shared();
    let provisioner = provisioner(&fake, temp.path());

    let first = provisioner
        .cluster_bootstrap(&params("master"))
        .expect("first run");
    let after_first = fake.snapshot();
    let second = provisioner
        .cluster_bootstrap(&params("master"))
        .expect("second run");

    assert_eq!(fake.snapshot(), after_first);
    assert_eq!(first, second);
}

#[test]
fn a_second_cluster_router_is_refused() {
    let temp = TempDir::new().expect("tempdir");
    let fake = FakeControlPlane::shared();
    let provisioner = provisioner(&fake, temp.path());
    provisioner
        .cluster_bootstrap(&params("master"))
        .expect("bootstrap");
    let before = fake.snapshot();

    let err = provisioner
        .cluster_bootstrap(&params("other"))
        .expect_err("different router name");
    assert_eq!(err.kind(), "config");
    assert!(err.to_string().contains("master"));
    assert_eq!(fake.snapshot(), before);
    assert!(fake.snapshot().router("other").is_none());
}

#[test]
fn missing_northbound_address_fails_before_any_northbound_command() {
    let temp = TempDir::new().expect("tempdir");
    let fake = FakeControlPlane::shared();
    fake.set_system_id("ovn-nb", None);

    let err = provisioner(&fake, temp.path())
        .cluster_bootstrap(&params("master"))
        .expect_err("no ovn-nb");
    assert_eq!(err.kind(), "config");
    assert!(fake
        .invocations()
        .iter()
        .all(|(tool, _)| *tool == Tool::Switch));
}

#[test]
fn invalid_subnets_are_rejected_up_front() {
    let err = ClusterParams::new("master", "10.1.0.0/24", "not-a-subnet").expect_err("bad cidr");
    assert_eq!(err.kind(), "config");
    assert!(err.to_string().contains("cluster-subnet"));
}
