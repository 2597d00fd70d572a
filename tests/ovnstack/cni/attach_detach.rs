use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use ovnstack::ovnstack::cni::metadata::{Annotations, MetadataFuture, MetadataResolver};
use ovnstack::ovnstack::cni::{CniPlugin, InterfaceAttacher, OvnCniPlugin};
use ovnstack::ovnstack::ovsdb::Tool;
use ovnstack::ovnstack::test_support::{
    overlay_config_in, FakeControlPlane, FakeNamespaces, NamespaceEvent,
};
use serde_json::json;
use tempfile::TempDir;

const CONTAINER_ID: &str = "3f9c1d2e4b5a69788796a5b4c3d2e1f0a1b2c3d4";
const HOST_INTERFACE: &str = "3f9c1d2e4b5a697";
const NETNS: &str = "/var/run/netns/cni-test";
const POD_MAC: &str = "0a:58:0a:01:01:05";

struct StaticResolver {
    annotations: Annotations,
}

impl MetadataResolver for StaticResolver {
    fn resolve<'a>(&'a self, _namespace: &'a str, _pod: &'a str) -> MetadataFuture<'a> {
        let annotations = self.annotations.clone();
        Box::pin(async move { Ok(annotations) })
    }
}

struct Harness {
    fake: Arc<FakeControlPlane>,
    namespaces: Arc<FakeNamespaces>,
    plugin: OvnCniPlugin,
    temp: TempDir,
}

fn harness() -> Harness {
    harness_with(json!({
        "ovn": {
            "mac_address": POD_MAC,
            "ip_address": "10.1.1.5/24",
            "gateway_ip": "10.1.1.1/24"
        }
    }))
}

fn harness_with(annotations: serde_json::Value) -> Harness {
    let temp = TempDir::new().expect("tempdir");
    let config = overlay_config_in(temp.path());
    let fake = FakeControlPlane::shared();
    let namespaces = Arc::new(FakeNamespaces::new());
    namespaces.add(NETNS);

    let annotations = annotations.as_object().cloned().unwrap();
    let attacher = InterfaceAttacher::new(fake.clone(), namespaces.clone(), config.clone());
    let plugin = OvnCniPlugin::new(attacher, Arc::new(StaticResolver { annotations }), config);
    Harness {
        fake,
        namespaces,
        plugin,
        temp,
    }
}

fn env(command: &str) -> HashMap<String, String> {
    [
        ("CNI_COMMAND", command),
        ("CNI_CONTAINERID", CONTAINER_ID),
        ("CNI_NETNS", NETNS),
        ("CNI_IFNAME", "eth0"),
        (
            "CNI_ARGS",
            "IgnoreUnknown=1;K8S_POD_NAMESPACE=default;K8S_POD_NAME=web",
        ),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn netconf(routes: serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "cniVersion": "0.3.1",
        "name": "ovn-kubernetes",
        "type": "ovn_cni",
        "bridge": "br-int",
        "isGateway": "true",
        "ipMasq": false,
        "ipam": {"type": "host-local", "subnet": "10.1.1.0/24", "routes": routes}
    }))
    .unwrap()
}

#[tokio::test]
async fn add_wires_the_pod_into_its_namespace_and_the_bridge() {
    let h = harness();
    let env = env("ADD");
    let result = h
        .plugin
        .add(&env, netconf(json!([{"dst": "10.96.0.0/12"}])))
        .await
        .expect("add");

    assert_eq!(result.cni_version, "0.3.1");
    assert_eq!(result.interfaces[0].name, HOST_INTERFACE);
    assert_eq!(result.interfaces[1].name, "eth0");
    assert_eq!(result.interfaces[1].mac, POD_MAC);
    assert_eq!(result.interfaces[1].sandbox, NETNS);
    assert_eq!(result.ips[0].address, "10.1.1.5/24");
    assert_eq!(result.ips[0].gateway, "10.1.1.1");
    assert_eq!(result.ips[0].interface, 1);
    let routes: Vec<_> = result.routes.iter().map(|r| (r.dst.as_str(), r.gw.as_deref())).collect();
    assert_eq!(
        routes,
        vec![("0.0.0.0/0", Some("10.1.1.1")), ("10.96.0.0/12", None)]
    );

    let state = h.fake.snapshot();
    let inside = state.link(Some(NETNS), "eth0").expect("container end");
    assert!(inside.up);
    assert_eq!(inside.mac.as_deref(), Some(POD_MAC));
    assert_eq!(inside.addresses, vec!["10.1.1.5/24".to_string()]);
    let outside = state.link(None, HOST_INTERFACE).expect("host end");
    assert!(outside.up);
    assert!(outside.hairpin);

    let container_routes: Vec<_> = state
        .host_routes
        .iter()
        .filter(|route| route.namespace.as_deref() == Some(NETNS))
        .map(|route| (route.prefix.as_str(), route.via.as_deref()))
        .collect();
    assert_eq!(
        container_routes,
        vec![("0.0.0.0/0", Some("10.1.1.1")), ("10.96.0.0/12", None)]
    );

    let port = state.interfaces.get(HOST_INTERFACE).expect("bridge port");
    assert_eq!(port.parent.as_deref(), Some("br-int"));
    assert_eq!(port.get("external_ids:iface-id"), Some("default_web"));
    assert_eq!(port.get("external_ids:attached_mac"), Some(POD_MAC));
    assert_eq!(port.get("external_ids:ip_address"), Some("10.1.1.5/24"));
}

#[tokio::test]
async fn namespaced_commands_run_on_a_pinned_thread() {
    let h = harness();
    let env = env("ADD");
    h.plugin.add(&env, netconf(json!([]))).await.expect("add");

    let caller = thread::current().id();
    let events = h.namespaces.events();
    assert!(!events.is_empty());
    for pair in events.chunks(2) {
        match pair {
            [NamespaceEvent::Enter { thread: entered, .. }, NamespaceEvent::Leave { thread: left, .. }] => {
                assert_eq!(entered, left);
                assert_ne!(*entered, caller);
            }
            other => panic!("unbalanced namespace events: {other:?}"),
        }
    }
}

#[tokio::test]
async fn conflicting_default_route_fails_before_any_change() {
    let h = harness();
    let env = env("ADD");
    let before = h.fake.snapshot();

    let err = h
        .plugin
        .add(&env, netconf(json!([{"dst": "0.0.0.0/0", "gw": "10.1.1.254"}])))
        .await
        .expect_err("conflicting default route");
    assert_eq!(err.kind(), "config");
    assert!(err.to_string().contains("conflicts"));
    assert_eq!(h.fake.snapshot(), before);
    assert!(h.fake.invocations().is_empty());
    assert!(h.namespaces.events().is_empty());
}

#[tokio::test]
async fn metadata_timeout_leaves_namespace_and_links_untouched() {
    let h = harness_with(json!({"other": "annotation"}));
    let before = h.fake.snapshot();

    let err = h
        .plugin
        .add(&env("ADD"), netconf(json!([])))
        .await
        .expect_err("annotation never appears");
    assert_eq!(err.kind(), "metadata-timeout");
    assert_eq!(h.fake.snapshot(), before);
    assert!(h.fake.invocations().is_empty());
    assert!(h.namespaces.events().is_empty());
}

#[tokio::test]
async fn failed_host_interface_lookup_aborts_add() {
    let h = harness();
    h.fake
        .fail_on(Tool::Ip, &format!("link show {HOST_INTERFACE}"));

    let err = h
        .plugin
        .add(&env("ADD"), netconf(json!([])))
        .await
        .expect_err("lookup failure is not an absent link");
    assert_eq!(err.kind(), "namespace");
    assert!(err.to_string().contains(HOST_INTERFACE));
    assert!(!h
        .fake
        .commands()
        .iter()
        .any(|command| command.starts_with("ip link add")));
    assert!(h.fake.snapshot().link(Some(NETNS), "eth0").is_none());
}

#[tokio::test]
async fn stale_host_interface_is_replaced() {
    let h = harness();
    h.fake.add_link(None, HOST_INTERFACE, "52:54:00:aa:bb:cc");
    let env = env("ADD");
    h.plugin.add(&env, netconf(json!([]))).await.expect("add");

    let commands = h.fake.commands();
    assert!(commands.contains(&format!("ip link delete {HOST_INTERFACE}")));
    let state = h.fake.snapshot();
    let host = state.link(None, HOST_INTERFACE).expect("fresh host end");
    assert_eq!(host.peer.as_deref(), Some("eth0"));
}

#[tokio::test]
async fn delete_after_add_removes_everything() {
    let h = harness();
    h.plugin
        .add(&env("ADD"), netconf(json!([])))
        .await
        .expect("add");
    std::fs::create_dir_all(h.temp.path().join("var/run/netns")).unwrap();
    let handle = h.temp.path().join("var/run/netns").join(HOST_INTERFACE);
    std::fs::write(&handle, "").unwrap();

    h.plugin
        .delete(&env("DEL"), netconf(json!([])))
        .await
        .expect("delete");
    let state = h.fake.snapshot();
    assert!(state.link(Some(NETNS), "eth0").is_none());
    assert!(state.link(None, HOST_INTERFACE).is_none());
    assert!(!state.interfaces.contains_key(HOST_INTERFACE));
    assert!(!handle.exists());

    h.plugin
        .delete(&env("DEL"), Vec::new())
        .await
        .expect("second delete is a no-op");
}

#[tokio::test]
async fn delete_tolerates_a_vanished_namespace() {
    let h = harness();
    h.plugin
        .add(&env("ADD"), netconf(json!([])))
        .await
        .expect("add");
    h.namespaces.remove(NETNS);

    h.plugin
        .delete(&env("DEL"), Vec::new())
        .await
        .expect("delete with namespace gone");
    assert!(!h.fake.snapshot().interfaces.contains_key(HOST_INTERFACE));
    assert!(h
        .fake
        .commands()
        .iter()
        .any(|command| command.contains(&format!("del-port {HOST_INTERFACE}"))));
}

#[tokio::test]
async fn link_delete_failure_inside_the_namespace_is_reported() {
    let h = harness();
    h.plugin
        .add(&env("ADD"), netconf(json!([])))
        .await
        .expect("add");
    h.fake.fail_on(Tool::Ip, "link delete eth0");

    let err = h
        .plugin
        .delete(&env("DEL"), Vec::new())
        .await
        .expect_err("link delete fails");
    assert_eq!(err.kind(), "namespace");
    assert!(h.fake.snapshot().interfaces.contains_key(HOST_INTERFACE));
}

#[tokio::test]
async fn failed_link_lookup_inside_the_namespace_is_reported() {
    let h = harness();
    h.plugin
        .add(&env("ADD"), netconf(json!([])))
        .await
        .expect("add");
    h.fake.fail_on(Tool::Ip, "link show eth0");

    let err = h
        .plugin
        .delete(&env("DEL"), Vec::new())
        .await
        .expect_err("lookup failure is not an absent link");
    assert_eq!(err.kind(), "namespace");
    let state = h.fake.snapshot();
    assert!(state.link(Some(NETNS), "eth0").is_some());
    assert!(state.interfaces.contains_key(HOST_INTERFACE));
}

#[tokio::test]
async fn delete_after_the_link_is_gone_still_cleans_the_port() {
    let h = harness();
    h.plugin
        .add(&env("ADD"), netconf(json!([])))
        .await
        .expect("add");
    h.fake.remove_link(Some(NETNS), "eth0");

    h.plugin
        .delete(&env("DEL"), Vec::new())
        .await
        .expect("missing link counts as removed");
    assert!(!h.fake.snapshot().interfaces.contains_key(HOST_INTERFACE));
}

#[test]
fn detach_without_a_namespace_only_cleans_the_host() {
    let temp = TempDir::new().expect("tempdir");
    let fake = FakeControlPlane::shared();
    let attacher = InterfaceAttacher::new(
        fake.clone(),
        Arc::new(FakeNamespaces::new()),
        overlay_config_in(temp.path()),
    );
    attacher
        .detach(CONTAINER_ID, None::<&Path>, "eth0")
        .expect("detach");
    assert_eq!(
        fake.commands(),
        vec![format!("ovs-vsctl --if-exists del-port {HOST_INTERFACE}")]
    );
}
