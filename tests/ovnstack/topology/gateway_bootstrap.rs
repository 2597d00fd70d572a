use std::path::Path;
use std::sync::Arc;

use ovnstack::ovnstack::ovsdb::Tool;
use ovnstack::ovnstack::test_support::{overlay_config_in, FakeControlPlane};
use ovnstack::ovnstack::topology::{
    ClusterParams, GatewayParams, TopologyProvisioner, Uplink,
};
use tempfile::TempDir;

const ETH1_MAC: &str = "52:54:00:00:01:01";
const ETH2_MAC: &str = "52:54:00:00:01:02";

fn bootstrapped(root: &Path) -> (Arc<FakeControlPlane>, TopologyProvisioner) {
    let fake = FakeControlPlane::shared();
    fake.add_link(None, "eth1", ETH1_MAC);
    fake.add_link(None, "eth2", ETH2_MAC);
    let provisioner = TopologyProvisioner::new(fake.clone(), overlay_config_in(root));
    provisioner
        .cluster_bootstrap(&ClusterParams::new("master", "10.1.0.0/24", "10.0.0.0/14").unwrap())
        .expect("bootstrap");
    fake.clear_invocations();
    (fake, provisioner)
}

fn physical(node: &str, interface: &str, ip: &str) -> GatewayParams {
    GatewayParams::new(node, "10.0.0.0/14", ip, Uplink::Physical(interface.to_string()))
        .expect("valid params")
}

#[test]
fn uplink_flags_must_name_exactly_one_interface() {
    let temp = TempDir::new().expect("tempdir");
    let (fake, _provisioner) = bootstrapped(temp.path());

    let both = Uplink::from_flags(Some("eth1"), Some("breth0")).expect_err("both set");
    assert_eq!(both.kind(), "config");
    let neither = Uplink::from_flags(None, Some("")).expect_err("neither set");
    assert_eq!(neither.kind(), "config");
    assert!(fake.invocations().is_empty());
}

#[test]
fn first_gateway_takes_the_next_join_address_and_carries_egress() {
    let temp = TempDir::new().expect("tempdir");
    let (fake, provisioner) = bootstrapped(temp.path());

    let report = provisioner
        .gateway_bootstrap(&physical("gw-1", "eth1", "192.168.1.10/24"))
        .expect("gateway");
    assert_eq!(report.router, "GR_gw-1");
    assert_eq!(report.external_switch, "ext_gw-1");
    assert_eq!(report.join_address.to_string(), "100.64.1.2/24");
    assert!(report.first_gateway);
    assert!(report.join_port_created);
    assert_eq!(report.uplink_mac, ETH1_MAC);

    let state = fake.snapshot();
    let router = state.router("GR_gw-1").expect("gateway router");
    assert_eq!(router.get("options:chassis"), Some("chassis-1"));
    assert_eq!(router.get("external_ids:physical_ip"), Some("192.168.1.10"));
    assert_eq!(router.get("external_ids:first_gateway"), Some("yes"));
    assert_eq!(router.get("options:lb_force_snat_ip"), Some("100.64.1.2"));

    let gateway_routes = state.routes_of("GR_gw-1");
    assert!(gateway_routes
        .iter()
        .any(|route| route.prefix == "10.0.0.0/14" && route.nexthop == "100.64.1.1"));
    let egress = state
        .routes_of("master")
        .iter()
        .find(|route| route.prefix == "0.0.0.0/0")
        .expect("distributed default route");
    assert_eq!(egress.nexthop, "100.64.1.2");

    let nat = state.nat_of("GR_gw-1");
    assert_eq!(nat.len(), 1);
    assert_eq!(nat[0].kind, "snat");
    assert_eq!(nat[0].external_ip, "192.168.1.10");
    assert_eq!(nat[0].logical_ip, "10.0.0.0/14");

    let external = state.router_port("rtoe-GR_gw-1").expect("external router port");
    assert_eq!(external.get("mac"), Some(ETH1_MAC));
    assert_eq!(external.get("networks"), Some("192.168.1.10/24"));
    let learning = state.switch_port("eth1_gw-1").expect("external switch port");
    assert_eq!(learning.parent.as_deref(), Some("ext_gw-1"));
    assert_eq!(learning.get("addresses"), Some("unknown"));
    assert_eq!(
        state.interfaces.get("eth1").and_then(|row| row.get("external_ids:iface-id")),
        Some("eth1_gw-1")
    );
    assert!(fake
        .commands()
        .iter()
        .any(|command| command == "ip addr flush dev eth1"));

    let tcp = state
        .load_balancer_tagged("external_ids:TCP_lb_gateway_router", "GR_gw-1")
        .expect("north-south tcp balancer");
    let udp = state
        .load_balancer_tagged("external_ids:UDP_lb_gateway_router", "GR_gw-1")
        .expect("north-south udp balancer");
    assert_eq!(udp.get("protocol"), Some("udp"));
    let attached = state.router_load_balancers.get("GR_gw-1").expect("attached");
    assert_eq!(attached, &vec![tcp.uuid.clone(), udp.uuid.clone()]);
}

#[test]
fn second_gateway_keeps_egress_on_the_first() {
    let temp = TempDir::new().expect("tempdir");
    let (fake, provisioner) = bootstrapped(temp.path());

    provisioner
        .gateway_bootstrap(&physical("gw-1", "eth1", "192.168.1.10/24"))
        .expect("first gateway");
    let second = provisioner
        .gateway_bootstrap(&physical("gw-2", "eth2", "192.168.1.11/24"))
        .expect("second gateway");

    assert_eq!(second.join_address.to_string(), "100.64.1.3/24");
    assert!(!second.first_gateway);
    let state = fake.snapshot();
    assert_eq!(
        state.router("GR_gw-2").and_then(|row| row.get("external_ids:first_gateway")),
        Some("no")
    );
    let egress: Vec<_> = state
        .routes_of("master")
        .iter()
        .filter(|route| route.prefix == "0.0.0.0/0")
        .collect();
    assert_eq!(egress.len(), 1);
    assert_eq!(egress[0].nexthop, "100.64.1.2");
}

#[test]
fn rampout_subnets_route_through_the_new_gateway_and_bad_entries_warn() {
    let temp = TempDir::new().expect("tempdir");
    let (fake, provisioner) = bootstrapped(temp.path());

    let params = physical("gw-1", "eth1", "192.168.1.10/24")
        .with_default_gateway(Some("192.168.1.1"))
        .unwrap()
        .with_rampout_subnets(Some("10.2.0.0/16, bogus ,10.3.0.5/16"));
    let report = provisioner.gateway_bootstrap(&params).expect("gateway");

    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("bogus"));

    let state = fake.snapshot();
    let rampout: Vec<_> = state
        .routes_of("master")
        .iter()
        .filter(|route| route.policy == "src-ip")
        .map(|route| (route.prefix.as_str(), route.nexthop.as_str()))
        .collect();
    assert_eq!(
        rampout,
        vec![("10.2.0.0/16", "100.64.1.2"), ("10.3.0.0/16", "100.64.1.2")]
    );
    assert!(state
        .routes_of("GR_gw-1")
        .iter()
        .any(|route| route.prefix == "0.0.0.0/0" && route.nexthop == "192.168.1.1"));
}

#[test]
fn gateway_bootstrap_is_idempotent() {
    let temp = TempDir::new().expect("tempdir");
    let (fake, provisioner) = bootstrapped(temp.path());
    let params = physical("gw-1", "eth1", "192.168.1.10/24")
        .with_rampout_subnets(Some("10.2.0.0/16"));

    let first = provisioner.gateway_bootstrap(&params).expect("first run");
    let state = fake.snapshot();
    let second = provisioner.gateway_bootstrap(&params).expect("second run");

    assert_eq!(fake.snapshot(), state);
    assert_eq!(second.join_address, first.join_address);
    assert!(second.first_gateway);
    assert!(!second.join_port_created);
}

#[test]
fn rerun_after_a_failed_step_completes_snat_and_rampout() {
    let temp = TempDir::new().expect("tempdir");
    let (fake, provisioner) = bootstrapped(temp.path());
    let params = physical("gw-1", "eth1", "192.168.1.10/24")
        .with_rampout_subnets(Some("10.2.0.0/16"));

    fake.fail_on(Tool::Northbound, "lr-nat-add");
    let err = provisioner
        .gateway_bootstrap(&params)
        .expect_err("SNAT step fails");
    assert_eq!(err.kind(), "control-plane");
    assert!(fake.snapshot().router_port("rtoj-GR_gw-1").is_some());

    fake.clear_failures();
    let report = provisioner.gateway_bootstrap(&params).expect("rerun");
    assert!(!report.join_port_created);
    assert_eq!(report.join_address.to_string(), "100.64.1.2/24");

    let state = fake.snapshot();
    let router = state.router("GR_gw-1").expect("gateway router");
    assert_eq!(router.get("options:lb_force_snat_ip"), Some("100.64.1.2"));
    assert_eq!(state.nat_of("GR_gw-1").len(), 1);
    let rampout: Vec<_> = state
        .routes_of("master")
        .iter()
        .filter(|route| route.policy == "src-ip")
        .map(|route| (route.prefix.as_str(), route.nexthop.as_str()))
        .collect();
    assert_eq!(rampout, vec![("10.2.0.0/16", "100.64.1.2")]);
}

#[test]
fn bridge_uplink_is_patched_into_the_integration_bridge() {
    let temp = TempDir::new().expect("tempdir");
    let (fake, provisioner) = bootstrapped(temp.path());
    fake.add_bridge("breth0", "52:54:00:00:02:01");

    let params = GatewayParams::new(
        "gw-1",
        "10.0.0.0/14",
        "192.168.1.10/24",
        Uplink::Bridge("breth0".to_string()),
    )
    .unwrap();
    let report = provisioner.gateway_bootstrap(&params).expect("gateway");
    assert_eq!(report.uplink_mac, "52:54:00:00:02:01");

    let state = fake.snapshot();
    assert_eq!(
        state.bridges.get("breth0").and_then(|row| row.get("other_config:hwaddr")),
        Some("52:54:00:00:02:01")
    );
    let outer = state
        .interfaces
        .get("k8s-patch-breth0-br-int")
        .expect("outer patch port");
    assert_eq!(outer.parent.as_deref(), Some("breth0"));
    assert_eq!(outer.get("options:peer"), Some("k8s-patch-br-int-breth0"));
    let inner = state
        .interfaces
        .get("k8s-patch-br-int-breth0")
        .expect("inner patch port");
    assert_eq!(inner.parent.as_deref(), Some("br-int"));
    assert_eq!(inner.get("external_ids:iface-id"), Some("breth0_gw-1"));
    assert!(state.switch_port("breth0_gw-1").is_some());
}

#[test]
fn gateway_without_a_chassis_id_fails() {
    let temp = TempDir::new().expect("tempdir");
    let (fake, provisioner) = bootstrapped(temp.path());
    fake.set_system_id("system-id", None);

    let err = provisioner
        .gateway_bootstrap(&physical("gw-1", "eth1", "192.168.1.10/24"))
        .expect_err("no chassis");
    assert_eq!(err.kind(), "control-plane");
    assert!(fake.snapshot().router("GR_gw-1").is_none());
}
