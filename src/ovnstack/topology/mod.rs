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


//! Idempotent provisioning of the logical topology: the distributed router
//! and join switch ([`cluster`]), per-node switches and management ports
//! ([`node`]), and per-node gateway routers ([`gateway`]).
//!
//! Every step looks a resource up before creating it and uses `--may-exist`
//! on creation, so any procedure can be re-run. A failing step aborts the
//! remaining chain and nothing is compensated.

pub mod cluster;
pub mod gateway;
pub mod management;
pub mod node;

pub use cluster::{ClusterParams, ClusterReport};
pub use gateway::{GatewayParams, GatewayReport, Uplink};
pub use management::HostPlatform;
pub use node::{NodeParams, NodeReport};

use crate::ovnstack::config::OverlayConfig;
use crate::ovnstack::error::{OverlayError, StepContext};
use crate::ovnstack::ipam::{bare_address, generate_mac, Cidr};
use crate::ovnstack::ovsdb::nbctl::{
    pair, quoted_addresses, LOAD_BALANCER, LOGICAL_ROUTER, LOGICAL_ROUTER_PORT, LOGICAL_SWITCH,
    LOGICAL_SWITCH_PORT,
};
use crate::ovnstack::ovsdb::{ControlPlaneDriver, DriverError, Northbound, SwitchDb};
use std::collections::HashSet;
use std::sync::Arc;

const CLUSTER_ROUTER_TAG: &str = "external_ids:k8s-cluster-router";
const CLUSTER_LB_TCP_TAG: &str = "external_ids:k8s-cluster-lb-tcp";
const CLUSTER_LB_UDP_TAG: &str = "external_ids:k8s-cluster-lb-udp";
const CONNECT_TO_JOIN_TAG: &str = "external_ids:connect_to_join";

/// Drives the provisioning procedures against one control-plane driver.
pub struct TopologyProvisioner {
    driver: Arc<dyn ControlPlaneDriver>,
    config: OverlayConfig,
}

/// The two east-west load balancers shared by every node switch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterLoadBalancers {
    pub tcp: String,
    pub udp: String,
}

/// A router port after the ensure step.
struct RouterPort {
    mac: String,
    created: bool,
}

impl TopologyProvisioner {
    pub fn new(driver: Arc<dyn ControlPlaneDriver>, config: OverlayConfig) -> Self {
        TopologyProvisioner { driver, config }
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    fn northbound(&self) -> Northbound<'_> {
        Northbound::new(self.driver.as_ref())
    }

    fn switch_db(&self) -> SwitchDb<'_> {
        SwitchDb::new(self.driver.as_ref())
    }

    fn driver(&self) -> &dyn ControlPlaneDriver {
        self.driver.as_ref()
    }

    /// The local switch database must know where the northbound database is.
    fn require_northbound(&self) -> Result<String, OverlayError> {
        self.switch_db()
            .system_external_id("ovn-nb")
            .step("read external_ids:ovn-nb")?
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                OverlayError::config(
                    "OVN northbound database address is not set in external_ids:ovn-nb",
                )
            })
    }

    fn find_cluster_router(&self) -> Result<Option<String>, OverlayError> {
        self.northbound()
            .find_first(LOGICAL_ROUTER, "name", &[pair(CLUSTER_ROUTER_TAG, "yes")])
            .step("look up distributed router")
    }

    /// Name of the distributed router; fails when the cluster has not been
    /// bootstrapped or the join switch is missing.
    fn require_cluster(&self) -> Result<String, OverlayError> {
        let router = self.find_cluster_router()?.ok_or_else(|| {
            OverlayError::config("cluster not bootstrapped: no distributed router found")
        })?;
        let join = self
            .northbound()
            .find_first(
                LOGICAL_SWITCH,
                "name",
                &[pair("name", &self.config.join_switch)],
            )
            .step("look up join switch")?;
        if join.is_none() {
            return Err(OverlayError::config(format!(
                "cluster not bootstrapped: join switch '{}' missing",
                self.config.join_switch
            )));
        }
        Ok(router)
    }

    fn find_cluster_load_balancer(&self, tag: &str) -> Result<Option<String>, OverlayError> {
        self.northbound()
            .find_first(LOAD_BALANCER, "_uuid", &[pair(tag, "yes")])
            .step(format!("look up load balancer {tag}"))
    }

    fn require_cluster_load_balancers(&self) -> Result<ClusterLoadBalancers, OverlayError> {
        let missing = |proto: &str| {
            OverlayError::config(format!(
                "cluster not bootstrapped: {proto} east-west load balancer missing"
            ))
        };
        let tcp = self
            .find_cluster_load_balancer(CLUSTER_LB_TCP_TAG)?
            .ok_or_else(|| missing("tcp"))?;
        let udp = self
            .find_cluster_load_balancer(CLUSTER_LB_UDP_TAG)?
            .ok_or_else(|| missing("udp"))?;
        Ok(ClusterLoadBalancers { tcp, udp })
    }

    /// Looks the port up by name and creates it with a fresh MAC only when it
    /// is absent. `network` is evaluated on the creation path alone.
    fn ensure_router_port(
        &self,
        router: &str,
        port: &str,
        network: impl FnOnce() -> Result<String, OverlayError>,
        tags: &[String],
    ) -> Result<RouterPort, OverlayError> {
        let nb = self.northbound();
        if let Some(mac) = nb
            .get(LOGICAL_ROUTER_PORT, port, "mac")
            .step(format!("read MAC of router port {port}"))?
        {
            return Ok(RouterPort {
                mac,
                created: false,
            });
        }

        let mac = generate_mac();
        let network = network()?;
        let mut batch = nb
            .batch()
            .command(["--may-exist", "lrp-add", router, port, mac.as_str(), network.as_str()]);
        if !tags.is_empty() {
            let mut set = vec![
                "set".to_string(),
                LOGICAL_ROUTER_PORT.to_string(),
                port.to_string(),
            ];
            set.extend(tags.iter().cloned());
            batch = batch.command(set);
        }
        nb.apply(&batch)
            .step(format!("create router port {port} on {router}"))?;
        Ok(RouterPort { mac, created: true })
    }

    /// Switch-side peer of a router port, addressed with the router port's MAC.
    fn ensure_router_peer(
        &self,
        switch: &str,
        port: &str,
        router_port: &str,
        mac: &str,
    ) -> Result<(), OverlayError> {
        let nb = self.northbound();
        let batch = nb
            .batch()
            .command(["--may-exist", "lsp-add", switch, port])
            .command([
                "set".to_string(),
                LOGICAL_SWITCH_PORT.to_string(),
                port.to_string(),
                "type=router".to_string(),
                pair("options:router-port", router_port),
                quoted_addresses(mac),
            ]);
        nb.apply(&batch)
            .step(format!("connect switch port {port} on {switch} to {router_port}"))
            .map(|_| ())
    }

    /// Address of a join-connected router port, read back from the database.
    fn join_address_of(&self, port: &str) -> Result<Cidr, OverlayError> {
        let networks = self
            .northbound()
            .get_all(LOGICAL_ROUTER_PORT, port, "networks")
            .step(format!("read networks of {port}"))?;
        let first = networks.first().ok_or_else(|| {
            mandatory(
                format!("read networks of {port}"),
                format!("ovn-nbctl --if-exists get {LOGICAL_ROUTER_PORT} {port} networks"),
            )
        })?;
        Cidr::parse(first)
    }

    /// Bare addresses already held by join-connected router ports.
    fn join_addresses_in_use(&self) -> Result<HashSet<String>, OverlayError> {
        let reply = self
            .northbound()
            .find(
                LOGICAL_ROUTER_PORT,
                "networks",
                &[pair(CONNECT_TO_JOIN_TAG, "yes")],
            )
            .step("list join subnet addresses")?;
        Ok(reply
            .values()
            .map(bare_address)
            .filter(|value| !value.is_empty())
            .collect())
    }
}

/// A query that must return a value came back empty.
pub(crate) fn mandatory(step: impl Into<String>, command: String) -> OverlayError {
    OverlayError::control_plane(step, DriverError::Empty { command })
}

pub(crate) fn join_port_name(router: &str) -> String {
    format!("rtoj-{router}")
}

pub(crate) fn join_switch_port_name(router: &str) -> String {
    format!("jtor-{router}")
}

/// Validates a node name used to derive resource names.
pub(crate) fn require_node_name(node_name: &str) -> Result<&str, OverlayError> {
    let trimmed = node_name.trim();
    if trimmed.is_empty() {
        return Err(OverlayError::config("node name must not be empty"));
    }
    if trimmed.chars().any(|c| c.is_whitespace()) {
        return Err(OverlayError::config(format!(
            "node name '{trimmed}' must not contain whitespace"
        )));
    }
    Ok(trimmed)
}

pub(crate) fn parse_subnet(flag: &str, value: &str) -> Result<Cidr, OverlayError> {
    if value.trim().is_empty() {
        return Err(OverlayError::config(format!("--{flag} must not be empty")));
    }
    Cidr::parse(value)
        .map_err(|err| OverlayError::config(format!("--{flag}: {err}")))
}
