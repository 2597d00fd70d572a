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


use super::{
    join_port_name, join_switch_port_name, mandatory, parse_subnet, require_node_name,
    TopologyProvisioner, CONNECT_TO_JOIN_TAG,
};
use crate::ovnstack::error::{OverlayError, StepContext};
use crate::ovnstack::ipam::{first_unused, Cidr};
use crate::ovnstack::logger::{log_info, log_warn};
use crate::ovnstack::observability::tracing::with_span;
use crate::ovnstack::ovsdb::nbctl::{
    pair, LOAD_BALANCER, LOGICAL_ROUTER, LOGICAL_ROUTER_PORT,
};
use crate::ovnstack::ovsdb::Tool;
use std::net::Ipv4Addr;

const FIRST_GATEWAY_TAG: &str = "external_ids:first_gateway";
const DEFAULT_ROUTE: &str = "0.0.0.0/0";

/// The host link that carries north-south traffic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Uplink {
    /// A NIC handed over to the integration bridge.
    Physical(String),
    /// An existing OVS bridge patched to the integration bridge.
    Bridge(String),
}

impl Uplink {
    /// Exactly one of the two flags must be given; empty values count as
    /// absent.
    pub fn from_flags(physical: Option<&str>, bridge: Option<&str>) -> Result<Self, OverlayError> {
        let physical = physical.map(str::trim).filter(|v| !v.is_empty());
        let bridge = bridge.map(str::trim).filter(|v| !v.is_empty());
        match (physical, bridge) {
            (Some(physical), None) => Ok(Uplink::Physical(physical.to_string())),
            (None, Some(bridge)) => Ok(Uplink::Bridge(bridge.to_string())),
            (Some(_), Some(_)) => Err(OverlayError::config(
                "--physical-interface and --bridge-interface are mutually exclusive",
            )),
            (None, None) => Err(OverlayError::config(
                "one of --physical-interface or --bridge-interface is required",
            )),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Uplink::Physical(name) | Uplink::Bridge(name) => name,
        }
    }
}

/// Validated GatewayBootstrap inputs.
#[derive(Clone, Debug)]
pub struct GatewayParams {
    pub node_name: String,
    pub cluster_subnet: Cidr,
    pub physical_ip: Cidr,
    pub uplink: Uplink,
    pub default_gateway: Option<Ipv4Addr>,
    /// Raw comma-separated entries; unparsable ones are skipped with a
    /// warning when the routes are installed.
    pub rampout_subnets: Vec<String>,
}

impl GatewayParams {
    pub fn new(
        node_name: &str,
        cluster_subnet: &str,
        physical_ip: &str,
        uplink: Uplink,
    ) -> Result<Self, OverlayError> {
        Ok(GatewayParams {
            node_name: require_node_name(node_name)?.to_string(),
            cluster_subnet: parse_subnet("cluster-subnet", cluster_subnet)?,
            physical_ip: parse_subnet("physical-ip", physical_ip)?,
            uplink,
            default_gateway: None,
            rampout_subnets: Vec::new(),
        })
    }

    pub fn with_default_gateway(mut self, gateway: Option<&str>) -> Result<Self, OverlayError> {
        self.default_gateway = match gateway.map(str::trim).filter(|v| !v.is_empty()) {
            Some(value) => Some(value.parse::<Ipv4Addr>().map_err(|err| {
                OverlayError::config(format!("--default-gw '{value}': {err}"))
            })?),
            None => None,
        };
        Ok(self)
    }

    pub fn with_rampout_subnets(mut self, subnets: Option<&str>) -> Self {
        self.rampout_subnets = subnets
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::to_string)
            .collect();
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewayReport {
    pub router: String,
    pub external_switch: String,
    pub join_address: Cidr,
    pub first_gateway: bool,
    /// Whether this run created the join port and its address.
    pub join_port_created: bool,
    pub uplink_mac: String,
    pub warnings: Vec<String>,
}

impl TopologyProvisioner {
    pub fn gateway_bootstrap(&self, params: &GatewayParams) -> Result<GatewayReport, OverlayError> {
        with_span("topology", "gateway-bootstrap", || self.bootstrap_gateway(params))
    }

    fn bootstrap_gateway(&self, params: &GatewayParams) -> Result<GatewayReport, OverlayError> {
        self.require_northbound()?;
        let cluster_router = self.require_cluster()?;
        let node = params.node_name.as_str();
        let nb = self.northbound();

        let chassis = self
            .switch_db()
            .system_external_id("system-id")
            .step("read external_ids:system-id")?
            .ok_or_else(|| {
                mandatory(
                    "read external_ids:system-id",
                    "ovs-vsctl --if-exists get Open_vSwitch . external_ids:system-id".to_string(),
                )
            })?;

        let router = format!("GR_{node}");
        let first_gateway = self.is_first_gateway(&router)?;
        let router_batch = nb.batch().command(["--may-exist", "lr-add", router.as_str()]).command([
            "set".to_string(),
            LOGICAL_ROUTER.to_string(),
            router.clone(),
            pair("options:chassis", &chassis),
            pair("external_ids:physical_ip", params.physical_ip.address.to_string()),
            pair(FIRST_GATEWAY_TAG, if first_gateway { "yes" } else { "no" }),
        ]);
        nb.apply(&router_batch)
            .step(format!("ensure gateway router {router}"))?;

        let pool = self.config().join_pool;
        let join_port = join_port_name(&router);
        let port = self.ensure_router_port(
            &router,
            &join_port,
            || {
                let in_use = self.join_addresses_in_use()?;
                let address = first_unused(&pool, &in_use)?;
                Ok(pool.with_address(address).escaped())
            },
            &[pair(CONNECT_TO_JOIN_TAG, "yes")],
        )?;
        let join_address = self.join_address_of(&join_port)?;
        let join_switch = self.config().join_switch.clone();
        self.ensure_router_peer(
            &join_switch,
            &join_switch_port_name(&router),
            &join_port,
            &port.mac,
        )?;

        let distributed_join = self.join_address_of(&join_port_name(&cluster_router))?;
        let cluster = params.cluster_subnet.network_cidr().to_string();
        nb.add_route(&router, &cluster, &distributed_join.address.to_string(), None)
            .step(format!("route {cluster} from {router} to the distributed router"))?;
        if let Some(gateway) = params.default_gateway {
            nb.add_route(&router, DEFAULT_ROUTE, &gateway.to_string(), None)
                .step(format!("default route of {router}"))?;
        }

        let egress = if first_gateway {
            join_address.address
        } else {
            self.first_gateway_join_address()?
                .unwrap_or(join_address.address)
        };
        nb.add_route(&cluster_router, DEFAULT_ROUTE, &egress.to_string(), None)
            .step(format!("default route of {cluster_router}"))?;

        for (tag, protocol) in [
            ("external_ids:TCP_lb_gateway_router", None),
            ("external_ids:UDP_lb_gateway_router", Some("udp")),
        ] {
            let lb = self.ensure_gateway_load_balancer(tag, &router, protocol)?;
            nb.attach_router_lb(&router, &lb)
                .step(format!("attach load balancer {lb} to {router}"))?;
        }

        let external_switch = format!("ext_{node}");
        let ext_batch = nb
            .batch()
            .command(["--may-exist", "ls-add", external_switch.as_str()]);
        nb.apply(&ext_batch)
            .step(format!("ensure external switch {external_switch}"))?;

        let iface_id = format!("{}_{node}", params.uplink.name());
        let uplink_mac = self.attach_uplink(&params.uplink, &iface_id)?;

        let learning_batch = nb
            .batch()
            .command(["--may-exist", "lsp-add", external_switch.as_str(), iface_id.as_str()])
            .command(["lsp-set-addresses", iface_id.as_str(), "unknown"]);
        nb.apply(&learning_batch)
            .step(format!("ensure external port {iface_id}"))?;

        let external_port = format!("rtoe-{router}");
        let external_network = params.physical_ip.escaped();
        let external_batch = nb
            .batch()
            .command([
                "--may-exist",
                "lrp-add",
                router.as_str(),
                external_port.as_str(),
                uplink_mac.as_str(),
                external_network.as_str(),
            ])
            .command([
                "set".to_string(),
                LOGICAL_ROUTER_PORT.to_string(),
                external_port.clone(),
                pair("external_ids:gateway-physical-ip", "yes"),
            ]);
        nb.apply(&external_batch)
            .step(format!("ensure router port {external_port}"))?;
        self.ensure_router_peer(
            &external_switch,
            &format!("etor-{router}"),
            &external_port,
            &uplink_mac,
        )?;

        let physical = params.physical_ip.address.to_string();
        nb.add_snat(&router, &physical, &cluster)
            .step(format!("default SNAT on {router}"))?;

        // Applied on every run so a retry after a failed step converges.
        let join_ip = join_address.address.to_string();
        nb.set(
            LOGICAL_ROUTER,
            &router,
            &[pair("options:lb_force_snat_ip", &join_ip)],
        )
        .step(format!("force load balancer SNAT on {router}"))?;
        let mut warnings = Vec::new();
        for entry in &params.rampout_subnets {
            match Cidr::parse(entry) {
                Ok(subnet) => {
                    let prefix = subnet.network_cidr().to_string();
                    nb.add_route(&cluster_router, &prefix, &join_ip, Some("src-ip"))
                        .step(format!("rampout route {prefix} via {router}"))?;
                }
                Err(err) => {
                    log_warn(
                        "topology",
                        "Skipping unparsable rampout subnet",
                        &[
                            ("router", &router),
                            ("subnet", entry),
                            ("error", &err.to_string()),
                        ],
                    );
                    warnings.push(format!("skipped rampout subnet '{entry}': {err}"));
                }
            }
        }

        log_info(
            "topology",
            "Gateway router ready",
            &[
                ("router", &router),
                ("join_address", &join_address.to_string()),
                ("first_gateway", if first_gateway { "true" } else { "false" }),
                ("uplink", params.uplink.name()),
            ],
        );

        Ok(GatewayReport {
            router,
            external_switch,
            join_address,
            first_gateway,
            join_port_created: port.created,
            uplink_mac,
            warnings,
        })
    }

    /// A router keeps the flag it was created with; otherwise it is first when
    /// no router is bound to a chassis yet.
    fn is_first_gateway(&self, router: &str) -> Result<bool, OverlayError> {
        let nb = self.northbound();
        if let Some(flag) = nb
            .get(LOGICAL_ROUTER, router, FIRST_GATEWAY_TAG)
            .step(format!("read first-gateway flag of {router}"))?
        {
            return Ok(flag == "yes");
        }
        let bound = nb
            .find(LOGICAL_ROUTER, "name", &["options:chassis!=null".to_string()])
            .step("list chassis-bound routers")?;
        Ok(bound.is_empty())
    }

    fn first_gateway_join_address(&self) -> Result<Option<Ipv4Addr>, OverlayError> {
        let first = self
            .northbound()
            .find_first(LOGICAL_ROUTER, "name", &[pair(FIRST_GATEWAY_TAG, "yes")])
            .step("look up first gateway router")?;
        match first {
            Some(name) => Ok(Some(self.join_address_of(&join_port_name(&name))?.address)),
            None => Ok(None),
        }
    }

    fn ensure_gateway_load_balancer(
        &self,
        tag: &str,
        router: &str,
        protocol: Option<&str>,
    ) -> Result<String, OverlayError> {
        let nb = self.northbound();
        if let Some(uuid) = nb
            .find_first(LOAD_BALANCER, "_uuid", &[pair(tag, router)])
            .step(format!("look up load balancer {tag}={router}"))?
        {
            return Ok(uuid);
        }
        let mut settings = vec![pair(tag, router)];
        if let Some(protocol) = protocol {
            settings.push(pair("protocol", protocol));
        }
        nb.create(LOAD_BALANCER, &settings)
            .step(format!("create load balancer {tag}={router}"))
    }

    /// Wires the uplink into the integration bridge and returns the MAC the
    /// gateway router uses on the external switch.
    fn attach_uplink(&self, uplink: &Uplink, iface_id: &str) -> Result<String, OverlayError> {
        let vs = self.switch_db();
        let bridge = self.config().integration_bridge.clone();
        let read_mac = |interface: &str| -> Result<String, OverlayError> {
            vs.interface_mac(interface)
                .step(format!("read MAC of {interface}"))?
                .ok_or_else(|| {
                    mandatory(
                        format!("read MAC of {interface}"),
                        format!("ovs-vsctl --if-exists get interface {interface} mac_in_use"),
                    )
                })
        };

        match uplink {
            Uplink::Physical(interface) => {
                vs.add_port(&bridge, interface, &[pair("external_ids:iface-id", iface_id)])
                    .step(format!("add {interface} to {bridge}"))?;
                let mac = read_mac(interface)?;
                self.driver()
                    .run(
                        Tool::Ip,
                        &["addr".to_string(), "flush".to_string(), "dev".to_string(), interface.clone()],
                    )
                    .step(format!("flush addresses of {interface}"))?;
                Ok(mac)
            }
            Uplink::Bridge(external) => {
                let mac = read_mac(external)?;
                vs.set_bridge(external, &[format!("other_config:hwaddr=\"{mac}\"")])
                    .step(format!("pin MAC of {external}"))?;
                let outer = format!("k8s-patch-{external}-{bridge}");
                let inner = format!("k8s-patch-{bridge}-{external}");
                vs.add_port(
                    external,
                    &outer,
                    &["type=patch".to_string(), pair("options:peer", &inner)],
                )
                .step(format!("create patch port {outer}"))?;
                vs.add_port(
                    &bridge,
                    &inner,
                    &[
                        "type=patch".to_string(),
                        pair("options:peer", &outer),
                        pair("external_ids:iface-id", iface_id),
                    ],
                )
                .step(format!("create patch port {inner}"))?;
                Ok(mac)
            }
        }
    }
}
