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


//! Host-side setup of a node's management interface: persistent interface
//! configuration for the detected distribution, then the live address and
//! route applied with `ip`.

use super::TopologyProvisioner;
use crate::ovnstack::config::OverlayConfig;
use crate::ovnstack::error::{OverlayError, StepContext};
use crate::ovnstack::ipam::Cidr;
use crate::ovnstack::logger::{log_debug, log_info};
use crate::ovnstack::ovsdb::{words, Tool};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::Path;

/// Which persistent network configuration style the host uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostPlatform {
    Debian,
    Redhat,
    Unsupported,
}

impl HostPlatform {
    pub fn detect(config: &OverlayConfig) -> Self {
        if config.debian_interfaces.is_file() {
            HostPlatform::Debian
        } else if config.redhat_marker().exists() {
            HostPlatform::Redhat
        } else {
            HostPlatform::Unsupported
        }
    }
}

impl fmt::Display for HostPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HostPlatform::Debian => "debian",
            HostPlatform::Redhat => "redhat",
            HostPlatform::Unsupported => "unsupported",
        })
    }
}

/// The management port as the host sees it.
#[derive(Clone, Debug)]
pub(crate) struct ManagementPort<'a> {
    pub node: &'a str,
    pub interface: &'a str,
    pub address: Cidr,
    pub router_ip: Ipv4Addr,
    pub cluster_subnet: Cidr,
}

impl ManagementPort<'_> {
    fn iface_id(&self) -> String {
        format!("k8s-{}", self.node)
    }
}

impl TopologyProvisioner {
    pub(crate) fn configure_management_host(
        &self,
        port: &ManagementPort<'_>,
    ) -> Result<HostPlatform, OverlayError> {
        let config = self.config();
        let platform = HostPlatform::detect(config);
        match platform {
            HostPlatform::Debian => {
                persist_debian(&config.debian_interfaces, &config.integration_bridge, port)?
            }
            HostPlatform::Redhat => {
                persist_redhat(&config.redhat_scripts, &config.integration_bridge, port)?
            }
            HostPlatform::Unsupported => log_debug(
                "topology",
                "No persistent network configuration style detected; skipping",
                &[("interface", port.interface)],
            ),
        }

        let address = port.address.to_string();
        let cluster = port.cluster_subnet.network_cidr().to_string();
        let router_ip = port.router_ip.to_string();
        let steps: [(&str, Vec<String>); 5] = [
            (
                "bring management interface up",
                words(["link", "set", port.interface, "up"]),
            ),
            (
                "flush management interface addresses",
                words(["addr", "flush", "dev", port.interface]),
            ),
            (
                "assign management interface address",
                words(["addr", "add", address.as_str(), "dev", port.interface]),
            ),
            (
                "flush cluster route",
                words(["route", "flush", cluster.as_str()]),
            ),
            (
                "add cluster route via node router",
                words(["route", "add", cluster.as_str(), "via", router_ip.as_str()]),
            ),
        ];
        for (step, args) in steps.iter() {
            self.driver().run(Tool::Ip, args).step(*step)?;
        }

        log_info(
            "topology",
            "Configured management interface",
            &[
                ("interface", port.interface),
                ("address", &address),
                ("platform", &platform.to_string()),
            ],
        );
        Ok(platform)
    }
}

/// Whether an `allow-*` line with exactly `keyword` names `interface`.
fn has_allow_stanza(contents: &str, keyword: &str, interface: &str) -> bool {
    contents.lines().any(|line| {
        let mut tokens = line.split_whitespace();
        tokens.next() == Some(keyword) && tokens.any(|token| token == interface)
    })
}

fn persist_debian(path: &Path, bridge: &str, port: &ManagementPort<'_>) -> Result<(), OverlayError> {
    let existing = fs::read_to_string(path)
        .map_err(|err| OverlayError::io(format!("read {}", path.display()), err))?;
    let mut additions = String::new();

    let has_bridge = has_allow_stanza(&existing, "allow-ovs", bridge);
    if !has_bridge {
        additions.push_str(&format!(
            "\nallow-ovs {bridge}\niface {bridge} inet manual\n    ovs_type OVSBridge\n    ovs_ports {iface}\n",
            iface = port.interface
        ));
    }

    let has_port = has_allow_stanza(&existing, &format!("allow-{bridge}"), port.interface);
    if !has_port {
        additions.push_str(&format!(
            "\nallow-{bridge} {iface}\niface {iface} inet static\n    address {address}\n    netmask {netmask}\n    ovs_type OVSIntPort\n    ovs_bridge {bridge}\n    ovs_extra set interface $IFACE external-ids:iface-id={iface_id}\n    up route add -net {cluster} netmask {cluster_mask} gw {router}\n    down route del -net {cluster} netmask {cluster_mask} gw {router}\n",
            iface = port.interface,
            address = port.address.address,
            netmask = port.address.netmask(),
            iface_id = port.iface_id(),
            cluster = port.cluster_subnet.network(),
            cluster_mask = port.cluster_subnet.netmask(),
            router = port.router_ip,
        ));
    }

    if additions.is_empty() {
        log_debug(
            "topology",
            "Management stanzas already present",
            &[("path", &path.display().to_string())],
        );
        return Ok(());
    }
    if !existing.is_empty() && !existing.ends_with('\n') {
        additions.insert(0, '\n');
    }
    let mut file = OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(|err| OverlayError::io(format!("open {}", path.display()), err))?;
    file.write_all(additions.as_bytes())
        .map_err(|err| OverlayError::io(format!("append to {}", path.display()), err))
}

fn persist_redhat(dir: &Path, bridge: &str, port: &ManagementPort<'_>) -> Result<(), OverlayError> {
    let ifcfg = dir.join(format!("ifcfg-{}", port.interface));
    let ifcfg_body = format!(
        "DEVICE={iface}\nDEVICETYPE=ovs\nTYPE=OVSIntPort\nOVS_BRIDGE={bridge}\nIPADDR={address}\nNETMASK={netmask}\nOVS_EXTRA=\"set interface $DEVICE external-ids:iface-id={iface_id}\"\nONBOOT=yes\nBOOTPROTO=static\n",
        iface = port.interface,
        address = port.address.address,
        netmask = port.address.netmask(),
        iface_id = port.iface_id(),
    );
    write_if_absent(&ifcfg, &ifcfg_body)?;

    let route = dir.join(format!("route-{}", port.interface));
    let route_body = format!(
        "{cluster} via {router}\n",
        cluster = port.cluster_subnet.network_cidr(),
        router = port.router_ip
    );
    write_if_absent(&route, &route_body)
}

fn write_if_absent(path: &Path, body: &str) -> Result<(), OverlayError> {
    if path.exists() {
        log_debug(
            "topology",
            "Interface file already present",
            &[("path", &path.display().to_string())],
        );
        return Ok(());
    }
    fs::write(path, body).map_err(|err| OverlayError::io(format!("write {}", path.display()), err))
}
