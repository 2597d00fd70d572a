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


use super::node::{NodeParams, NodeReport};
use super::{
    join_port_name, join_switch_port_name, ClusterLoadBalancers, TopologyProvisioner,
    CLUSTER_LB_TCP_TAG, CLUSTER_LB_UDP_TAG, CLUSTER_ROUTER_TAG, CONNECT_TO_JOIN_TAG,
};
use crate::ovnstack::error::{OverlayError, StepContext};
use crate::ovnstack::ipam::Cidr;
use crate::ovnstack::logger::log_info;
use crate::ovnstack::observability::tracing::with_span;
use crate::ovnstack::ovsdb::nbctl::{pair, LOAD_BALANCER, LOGICAL_ROUTER};

/// ClusterBootstrap inputs. The bootstrap node names the distributed router
/// and is joined to the cluster in the same run.
#[derive(Clone, Debug)]
pub struct ClusterParams {
    pub node: NodeParams,
}

impl ClusterParams {
    pub fn new(node_name: &str, node_subnet: &str, cluster_subnet: &str) -> Result<Self, OverlayError> {
        Ok(ClusterParams {
            node: NodeParams::new(node_name, node_subnet, cluster_subnet)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterReport {
    pub router: String,
    pub join_switch: String,
    pub join_address: Cidr,
    pub load_balancers: ClusterLoadBalancers,
    pub node: NodeReport,
}

impl TopologyProvisioner {
    pub fn cluster_bootstrap(&self, params: &ClusterParams) -> Result<ClusterReport, OverlayError> {
        with_span("topology", "cluster-bootstrap", || self.bootstrap_cluster(params))
    }

    fn bootstrap_cluster(&self, params: &ClusterParams) -> Result<ClusterReport, OverlayError> {
        self.require_northbound()?;
        let router = params.node.node_name.as_str();
        if let Some(existing) = self.find_cluster_router()? {
            if existing != router {
                return Err(OverlayError::config(format!(
                    "cluster already bootstrapped with distributed router '{existing}'"
                )));
            }
        }

        let nb = self.northbound();
        let router_batch = nb.batch().command(["--may-exist", "lr-add", router]).command([
            "set".to_string(),
            LOGICAL_ROUTER.to_string(),
            router.to_string(),
            pair(CLUSTER_ROUTER_TAG, "yes"),
        ]);
        nb.apply(&router_batch)
            .step(format!("ensure distributed router {router}"))?;

        let load_balancers = self.ensure_cluster_load_balancers()?;

        let join_switch = self.config().join_switch.clone();
        let join_batch = nb
            .batch()
            .command(["--may-exist", "ls-add", join_switch.as_str()]);
        nb.apply(&join_batch)
            .step(format!("ensure join switch {join_switch}"))?;

        let pool = self.config().join_pool;
        let router_port = join_port_name(router);
        let port = self.ensure_router_port(
            router,
            &router_port,
            || Ok(pool.with_address(pool.first_host()).escaped()),
            &[pair(CONNECT_TO_JOIN_TAG, "yes")],
        )?;
        self.ensure_router_peer(
            &join_switch,
            &join_switch_port_name(router),
            &router_port,
            &port.mac,
        )?;
        let join_address = self.join_address_of(&router_port)?;

        log_info(
            "topology",
            "Distributed router ready",
            &[
                ("router", router),
                ("join_switch", &join_switch),
                ("join_address", &join_address.to_string()),
            ],
        );

        let node = self.join_node(router, &load_balancers, &params.node)?;
        Ok(ClusterReport {
            router: router.to_string(),
            join_switch,
            join_address,
            load_balancers,
            node,
        })
    }

    fn ensure_cluster_load_balancers(&self) -> Result<ClusterLoadBalancers, OverlayError> {
        let tcp = self.ensure_cluster_load_balancer(CLUSTER_LB_TCP_TAG, None)?;
        let udp = self.ensure_cluster_load_balancer(CLUSTER_LB_UDP_TAG, Some("udp"))?;
        Ok(ClusterLoadBalancers { tcp, udp })
    }

    fn ensure_cluster_load_balancer(
        &self,
        tag: &str,
        protocol: Option<&str>,
    ) -> Result<String, OverlayError> {
        if let Some(uuid) = self.find_cluster_load_balancer(tag)? {
            return Ok(uuid);
        }
        let mut settings = vec![pair(tag, "yes")];
        if let Some(protocol) = protocol {
            settings.push(pair("protocol", protocol));
        }
        self.northbound()
            .create(LOAD_BALANCER, &settings)
            .step(format!("create load balancer {tag}"))
    }
}
