use std::fs;
use std::path::Path;
use std::sync::Arc;

use ovnstack::ovnstack::ovsdb::Tool;
use ovnstack::ovnstack::test_support::{overlay_config_in, FakeControlPlane};
use ovnstack::ovnstack::topology::{ClusterParams, HostPlatform, NodeParams, TopologyProvisioner};
use tempfile::TempDir;

fn provisioner(fake: &Arc<FakeControlPlane>, root: &Path) -> TopologyProvisioner {
    TopologyProvisioner::new(fake.clone(), overlay_config_in(root))
}

fn bootstrapped(root: &Path) -> (Arc<FakeControlPlane>, TopologyProvisioner) {
    let fake = FakeControlPlane::shared();
    let provisioner = provisioner(&fake, root);
    provisioner
        .cluster_bootstrap(&ClusterParams::new("master", "10.1.0.0/24", "10.0.0.0/14").unwrap())
        .expect("bootstrap");
    fake.clear_invocations();
    (fake, provisioner)
}

fn node_1() -> NodeParams {
    NodeParams::new("node-1", "10.1.1.0/24", "10.0.0.0/14").expect("valid params")
}

#[test]
fn node_join_wires_switch_management_port_and_host_route() {
    let temp = TempDir::new().expect("tempdir");
    let interfaces = temp.path().join("etc/network/interfaces");
    fs::create_dir_all(interfaces.parent().unwrap()).unwrap();
    fs::write(&interfaces, "auto lo\niface lo inet loopback\n").unwrap();
    let (fake, provisioner) = bootstrapped(temp.path());

    let report = provisioner.node_join(&node_1()).expect("node join");
    assert_eq!(report.platform, HostPlatform::Debian);
    assert_eq!(report.management_interface, "k8s-node-1");

    let state = fake.snapshot();
    let rtos = state.router_port("rtos-node-1").expect("router port");
    assert_eq!(rtos.parent.as_deref(), Some("master"));
    assert_eq!(rtos.get("networks"), Some("10.1.1.1/24"));
    assert!(fake
        .commands()
        .iter()
        .any(|command| command.contains("lrp-add master rtos-node-1") && command.contains("10.1.1.1\\24")));

    let switch = state.switch("node-1").expect("node switch");
    assert_eq!(switch.get("other_config:subnet"), Some("10.1.1.0/24"));
    assert_eq!(switch.get("external_ids:gateway_ip"), Some("10.1.1.1\\24"));

    let stor = state.switch_port("stor-node-1").expect("router peer");
    assert_eq!(stor.get("options:router-port"), Some("rtos-node-1"));

    let management = state.switch_port("k8s-node-1").expect("management port");
    let expected = format!("{} 10.1.1.2", report.management_mac);
    assert_eq!(management.get("addresses"), Some(expected.as_str()));
    let interface = state.interfaces.get("k8s-node-1").expect("ovs interface");
    assert_eq!(interface.get("type"), Some("internal"));
    assert_eq!(interface.get("mtu_request"), Some("1400"));
    assert_eq!(interface.get("external_ids:iface-id"), Some("k8s-node-1"));

    let link = state.link(None, "k8s-node-1").expect("host link");
    assert!(link.up);
    assert_eq!(link.addresses, vec!["10.1.1.2/24".to_string()]);
    let route = state
        .host_routes
        .iter()
        .find(|route| route.prefix == "10.0.0.0/14")
        .expect("cluster route");
    assert_eq!(route.via.as_deref(), Some("10.1.1.1"));

    let balancers = state.switch_load_balancers.get("node-1").expect("balancers");
    assert_eq!(balancers.len(), 2);

    let persisted = fs::read_to_string(&interfaces).unwrap();
    assert!(persisted.starts_with("auto lo\n"));
    assert!(persisted.contains("allow-ovs br-int"));
    assert!(persisted.contains("allow-br-int k8s-node-1"));
    assert!(persisted.contains("address 10.1.1.2"));
    assert!(persisted.contains("up route add -net 10.0.0.0 netmask 255.252.0.0 gw 10.1.1.1"));
}

#[test]
fn node_join_without_a_cluster_fails_without_mutation() {
    let temp = TempDir::new().expect("tempdir");
    let fake = FakeControlPlane::shared();
    let before = fake.snapshot();

    let err = provisioner(&fake, temp.path())
        .node_join(&node_1())
        .expect_err("no cluster");
    assert_eq!(err.kind(), "config");
    assert!(err.to_string().contains("cluster not bootstrapped"));
    assert_eq!(fake.snapshot(), before);
    assert!(fake
        .invocations()
        .iter()
        .all(|(tool, args)| *tool != Tool::Ip && !args.iter().any(|arg| arg.ends_with("-add"))));
}

#[test]
fn node_join_is_idempotent() {
    let temp = TempDir::new().expect("tempdir");
    let interfaces = temp.path().join("etc/network/interfaces");
    fs::create_dir_all(interfaces.parent().unwrap()).unwrap();
    fs::write(&interfaces, "").unwrap();
    let (fake, provisioner) = bootstrapped(temp.path());

    let first = provisioner.node_join(&node_1()).expect("first join");
    let state = fake.snapshot();
    let persisted = fs::read_to_string(&interfaces).unwrap();

    let second = provisioner.node_join(&node_1()).expect("second join");
    assert_eq!(first, second);
    assert_eq!(fake.snapshot(), state);
    assert_eq!(fs::read_to_string(&interfaces).unwrap(), persisted);
}

#[test]
fn redhat_hosts_get_interface_scripts() {
    let temp = TempDir::new().expect("tempdir");
    let scripts = temp.path().join("etc/sysconfig/network-scripts");
    fs::create_dir_all(&scripts).unwrap();
    fs::write(scripts.join("ifup-ovs"), "#!/bin/sh\n").unwrap();
    let (_fake, provisioner) = bootstrapped(temp.path());

    let report = provisioner.node_join(&node_1()).expect("node join");
    assert_eq!(report.platform, HostPlatform::Redhat);
    let ifcfg = fs::read_to_string(scripts.join("ifcfg-k8s-node-1")).unwrap();
    assert!(ifcfg.contains("IPADDR=10.1.1.2"));
    let routes = fs::read_to_string(scripts.join("route-k8s-node-1")).unwrap();
    assert_eq!(routes, "10.0.0.0/14 via 10.1.1.1\n");
}

#[test]
fn control_plane_failures_name_the_step() {
    let temp = TempDir::new().expect("tempdir");
    let (fake, provisioner) = bootstrapped(temp.path());
    fake.fail_on(Tool::Switch, "add-port br-int k8s-node-1");

    let err = provisioner.node_join(&node_1()).expect_err("injected failure");
    assert_eq!(err.kind(), "control-plane");
    assert!(err.to_string().contains("k8s-node-1"));
}
