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


use super::metadata::{wait_for_pod_network, MetadataResolver};
use super::network::{InterfaceAttacher, PortBinding};
use super::types::{
    plan_routes, CniCommand, CniEnv, CniResult, Interface, Ip, NetConf, Route,
};
use crate::ovnstack::config::OverlayConfig;
use crate::ovnstack::error::OverlayError;
use crate::ovnstack::logger::{log_info, set_log_level, LogLevel};
use crate::ovnstack::observability::tracing::{with_span, with_span_async};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type CniFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, OverlayError>> + Send + 'a>>;

/// The CNI-style entry points, driven by the `CNI_*` environment and the
/// network configuration bytes read from stdin.
pub trait CniPlugin: Send + Sync {
    fn add<'a>(&'a self, env: &'a HashMap<String, String>, config: Vec<u8>) -> CniFuture<'a, CniResult>;
    fn delete<'a>(&'a self, env: &'a HashMap<String, String>, config: Vec<u8>) -> CniFuture<'a, ()>;
}

/// Attaches pods to their node switch using the address the controller
/// assigned in the pod's `ovn` annotation.
pub struct OvnCniPlugin {
    attacher: InterfaceAttacher,
    resolver: Arc<dyn MetadataResolver>,
    config: OverlayConfig,
}

impl OvnCniPlugin {
    pub fn new(
        attacher: InterfaceAttacher,
        resolver: Arc<dyn MetadataResolver>,
        config: OverlayConfig,
    ) -> Self {
        OvnCniPlugin {
            attacher,
            resolver,
            config,
        }
    }

    async fn run_add(
        &self,
        env: &HashMap<String, String>,
        config: Vec<u8>,
    ) -> Result<CniResult, OverlayError> {
        let cni = CniEnv::from_map(env)?;
        expect_command(&cni, CniCommand::Add)?;
        let conf = NetConf::parse(&config)?;
        apply_log_level(&conf);
        with_span_async("cni", "add", self.attach_pod(&cni, &conf)).await
    }

    async fn attach_pod(&self, cni: &CniEnv, conf: &NetConf) -> Result<CniResult, OverlayError> {
        let netns = cni.require_netns()?;
        let (namespace, pod) = cni.pod()?;

        let network = wait_for_pod_network(
            self.resolver.as_ref(),
            namespace,
            pod,
            self.config.metadata_attempts,
            self.config.metadata_interval,
        )
        .await?;
        let routes = plan_routes(&conf.ipam.routes, conf.is_gateway, network.gateway)?;

        let container_id = cni.container_id();
        let host_interface = self
            .attacher
            .attach(container_id, netns, &cni.ifname, &network.mac)?;
        self.attacher
            .configure(netns, &cni.ifname, &network.address, &routes)?;
        let iface_id = format!("{namespace}_{pod}");
        self.attacher.bind(&PortBinding {
            bridge: &conf.bridge,
            host_interface: &host_interface,
            mac: &network.mac,
            iface_id: &iface_id,
            address: &network.address,
        })?;

        log_info(
            "cni",
            "Pod attached",
            &[
                ("pod", &format!("{namespace}/{pod}")),
                ("address", &network.address.to_string()),
                ("host_interface", &host_interface),
            ],
        );

        Ok(CniResult {
            cni_version: conf.cni_version.clone(),
            interfaces: vec![
                Interface {
                    name: host_interface,
                    mac: String::new(),
                    sandbox: String::new(),
                },
                Interface {
                    name: cni.ifname.clone(),
                    mac: network.mac.clone(),
                    sandbox: netns.display().to_string(),
                },
            ],
            ips: vec![Ip {
                version: "4".to_string(),
                address: network.address.to_string(),
                gateway: network.gateway.to_string(),
                interface: 1,
            }],
            routes: routes
                .iter()
                .map(|route| Route {
                    dst: route.dst.network_cidr().to_string(),
                    gw: route.gw.map(|gw| gw.to_string()),
                })
                .collect(),
        })
    }

    fn run_delete(&self, env: &HashMap<String, String>, config: &[u8]) -> Result<(), OverlayError> {
        let cni = CniEnv::from_map(env)?;
        expect_command(&cni, CniCommand::Del)?;
        if !config.is_empty() {
            apply_log_level(&NetConf::parse(config)?);
        }
        with_span("cni", "del", || {
            self.attacher
                .detach(cni.container_id(), cni.netns.as_deref(), &cni.ifname)
        })
    }
}

impl CniPlugin for OvnCniPlugin {
    fn add<'a>(&'a self, env: &'a HashMap<String, String>, config: Vec<u8>) -> CniFuture<'a, CniResult> {
        Box::pin(self.run_add(env, config))
    }

    fn delete<'a>(&'a self, env: &'a HashMap<String, String>, config: Vec<u8>) -> CniFuture<'a, ()> {
        Box::pin(async move { self.run_delete(env, &config) })
    }
}

fn expect_command(cni: &CniEnv, expected: CniCommand) -> Result<(), OverlayError> {
    if cni.command == expected {
        Ok(())
    } else {
        Err(OverlayError::config(format!(
            "CNI_COMMAND {:?} does not match the requested operation {:?}",
            cni.command, expected
        )))
    }
}

fn apply_log_level(conf: &NetConf) {
    if let Some(level) = conf.log_level.as_deref().and_then(LogLevel::parse) {
        set_log_level(level);
    }
}
