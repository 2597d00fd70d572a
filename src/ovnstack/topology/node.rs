/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */


use super::management::{HostPlatform, ManagementPort};
use super::{mandatory, parse_subnet, require_node_name, ClusterLoadBalancers, TopologyProvisioner};
use crate::ovnstack::cni::types::truncate_bytes;
use crate::ovnstack::error::{OverlayError, StepContext};
use crate::ovnstack::ipam::{next_ipv4, Cidr};
use crate::ovnstack::logger::log_info;
use crate::ovnstack::observability::tracing::with_span;
use crate::ovnstack::ovsdb::nbctl::{pair, LOGICAL_SWITCH};

/// Validated NodeJoin inputs.
#[derive(Clone, Debug)]
pub struct NodeParams {
    pub node_name: String,
    pub node_subnet: Cidr,
    pub cluster_subnet: Cidr,
}

impl NodeParams {
    pub fn new(node_name: &str, node_subnet: &str, cluster_subnet: &str) -> Result<Self, OverlayError> {
        Ok(NodeParams {
            node_name: require_node_name(node_name)?.to_string(),
            node_subnet: parse_subnet("node-switch-subnet", node_subnet)?,
            cluster_subnet: parse_subnet("cluster-subnet", cluster_subnet)?,
        })
    }
}

/// What NodeJoin resolved for the node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeReport {
    pub switch: String,
    pub router_port: String,
    pub router_address: Cidr,
    pub management_port: String,
    pub management_interface: String,
    pub management_mac: String,
    pub management_address: Cidr,
    pub platform: HostPlatform,
}

/// `k8s-` plus at most 11 characters of the node name, keeping the host
/// interface name within the kernel limit.
pub fn management_interface_name(node_name: &str) -> String {
    format!("k8s-{}", truncate_bytes(node_name, 11))
}

impl TopologyProvisioner {
    /// Connects a node to an already bootstrapped cluster.
    pub fn node_join(&self, params: &NodeParams) -> Result<NodeReport, OverlayError> {
        with_span("topology", "node-join", || -> Result<NodeReport, OverlayError> {
            self.require_northbound()?;
            let router = self.require_cluster()?;
            let balancers = self.require_cluster_load_balancers()?;
            self.join_node(&router, &balancers, params)
        })
    }

    pub(crate) fn join_node(
        &self,
        cluster_router: &str,
        balancers: &ClusterLoadBalancers,
        params: &NodeParams,
    ) -> Result<NodeReport, OverlayError> {
        let node = params.node_name.as_str();
        let nb = self.northbound();

        let router_address = params.node_subnet.with_address(params.node_subnet.first_host());
        let router_port = format!("rtos-{node}");
        let port = self.ensure_router_port(
            cluster_router,
            &router_port,
            || Ok(router_address.escaped()),
            &[],
        )?;

        let switch_batch = nb.batch().command(["--may-exist", "ls-add", node]).command([
            "set".to_string(),
            LOGICAL_SWITCH.to_string(),
            node.to_string(),
            pair("other_config:subnet", params.node_subnet.network_cidr().to_string()),
            pair("external_ids:gateway_ip", router_address.escaped()),
        ]);
        nb.apply(&switch_batch)
            .step(format!("ensure node switch {node}"))?;

        let switch_port = format!("stor-{node}");
        self.ensure_router_peer(node, &switch_port, &router_port, &port.mac)?;

        let interface = management_interface_name(node);
        let iface_id = format!("k8s-{node}");
        let bridge = self.config().integration_bridge.clone();
        self.switch_db()
            .add_port(
                &bridge,
                &interface,
                &[
                    "type=internal".to_string(),
                    format!("mtu_request={}", self.config().management_mtu),
                    pair("external_ids:iface-id", &iface_id),
                ],
            )
            .step(format!("create management interface {interface} on {bridge}"))?;
        let management_mac = self
            .switch_db()
            .interface_mac(&interface)
            .step(format!("read MAC of {interface}"))?
            .ok_or_else(|| {
                mandatory(
                    format!("read MAC of {interface}"),
                    format!("ovs-vsctl --if-exists get interface {interface} mac_in_use"),
                )
            })?;

        let management_address =
            params.node_subnet.with_address(next_ipv4(router_address.address));
        let addresses = format!("{management_mac} {}", management_address.address);
        let lsp_batch = nb
            .batch()
            .command(["--may-exist", "lsp-add", node, iface_id.as_str()])
            .command(["lsp-set-addresses", iface_id.as_str(), addresses.as_str()]);
        nb.apply(&lsp_batch)
            .step(format!("ensure management port {iface_id}"))?;

        let platform = self.configure_management_host(&ManagementPort {
            node,
            interface: &interface,
            address: management_address,
            router_ip: router_address.address,
            cluster_subnet: params.cluster_subnet,
        })?;

        for lb in [&balancers.tcp, &balancers.udp] {
            nb.attach_switch_lb(node, lb)
                .step(format!("attach load balancer {lb} to {node}"))?;
        }

        log_info(
            "topology",
            "Node joined",
            &[
                ("node", node),
                ("router_port", &router_port),
                ("router_address", &router_address.to_string()),
                ("management_address", &management_address.to_string()),
                ("mac_created", if port.created { "true" } else { "false" }),
            ],
        );

        Ok(NodeReport {
            switch: node.to_string(),
            router_port,
            router_address,
            management_port: iface_id,
            management_interface: interface,
            management_mac,
            management_address,
            platform,
        })
    }
}
