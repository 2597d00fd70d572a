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


//! Per-container interface wiring: the veth pair, its addresses and routes,
//! and the integration-bridge port that binds it to the logical switch.

use super::netns::{run_pinned, NamespaceSwitch};
use super::types::{host_interface_name, PlannedRoute};
use crate::ovnstack::config::OverlayConfig;
use crate::ovnstack::error::{OverlayError, StepContext};
use crate::ovnstack::ipam::Cidr;
use crate::ovnstack::logger::{log_debug, log_info};
use crate::ovnstack::ovsdb::nbctl::pair;
use crate::ovnstack::ovsdb::{words, ControlPlaneDriver, DriverError, SwitchDb, Tool};
use rand::RngCore;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

/// Creates and removes container interfaces. Holds no per-container state;
/// everything lives in the kernel and the switch port table.
pub struct InterfaceAttacher {
    driver: Arc<dyn ControlPlaneDriver>,
    namespaces: Arc<dyn NamespaceSwitch>,
    config: OverlayConfig,
}

/// Switch-port identity of an attached container.
#[derive(Clone, Debug)]
pub struct PortBinding<'a> {
    pub bridge: &'a str,
    pub host_interface: &'a str,
    pub mac: &'a str,
    pub iface_id: &'a str,
    pub address: &'a Cidr,
}

impl InterfaceAttacher {
    pub fn new(
        driver: Arc<dyn ControlPlaneDriver>,
        namespaces: Arc<dyn NamespaceSwitch>,
        config: OverlayConfig,
    ) -> Self {
        InterfaceAttacher {
            driver,
            namespaces,
            config,
        }
    }

    fn ip(&self, args: Vec<String>) -> Result<Vec<String>, DriverError> {
        self.driver.run(Tool::Ip, &args)
    }

    /// Looks `name` up in the current namespace. Only a "no such device"
    /// reply means absent; every other failure is returned.
    fn link_exists(&self, name: &str) -> Result<bool, OverlayError> {
        match self.ip(words(["link", "show", name])) {
            Ok(_) => Ok(true),
            Err(err) if err.is_missing_device() => Ok(false),
            Err(err) => Err(OverlayError::namespace(format!("look up link {name}"), err)),
        }
    }

    /// Creates the veth pair from inside `netns`, gives the container end
    /// `mac`, and returns the host end renamed to the truncated container
    /// identifier.
    pub fn attach(
        &self,
        container_id: &str,
        netns: &Path,
        ifname: &str,
        mac: &str,
    ) -> Result<String, OverlayError> {
        let host_interface = host_interface_name(container_id);
        if self.link_exists(&host_interface)? {
            log_debug(
                "cni",
                "Removing stale host interface",
                &[("interface", &host_interface)],
            );
            self.ip(words(["link", "delete", host_interface.as_str()]))
                .map_err(|err| {
                    OverlayError::namespace(format!("delete stale link {host_interface}"), err)
                })?;
        }

        let peer = temporary_peer_name();
        let pid = std::process::id().to_string();
        run_pinned(self.namespaces.as_ref(), netns, || {
            let steps = [
                (
                    format!("create veth pair {ifname}/{peer}"),
                    words([
                        "link", "add", ifname, "type", "veth", "peer", "name", peer.as_str(),
                        "netns", pid.as_str(),
                    ]),
                ),
                (
                    format!("set address of {ifname}"),
                    words(["link", "set", "dev", ifname, "address", mac]),
                ),
                (
                    format!("bring {ifname} up"),
                    words(["link", "set", "dev", ifname, "up"]),
                ),
            ];
            for (context, args) in steps {
                self.ip(args)
                    .map_err(|err| OverlayError::namespace(context, err))?;
            }
            Ok(())
        })?;

        // The peer's index changed when it crossed into this namespace.
        let host_steps = [
            (
                Tool::Ip,
                format!("look up host link {peer}"),
                words(["link", "show", peer.as_str()]),
            ),
            (
                Tool::Bridge,
                format!("enable hairpin on {peer}"),
                words(["link", "set", "dev", peer.as_str(), "hairpin", "on"]),
            ),
            (
                Tool::Ip,
                format!("rename {peer} to {host_interface}"),
                words([
                    "link", "set", "dev", peer.as_str(), "name", host_interface.as_str(),
                ]),
            ),
            (
                Tool::Ip,
                format!("bring {host_interface} up"),
                words(["link", "set", "dev", host_interface.as_str(), "up"]),
            ),
        ];
        for (tool, context, args) in host_steps {
            self.driver
                .run(tool, &args)
                .map_err(|err| OverlayError::namespace(context, err))?;
        }

        log_info(
            "cni",
            "Attached container interface",
            &[
                ("container", container_id),
                ("interface", ifname),
                ("host_interface", &host_interface),
                ("mac", mac),
            ],
        );
        Ok(host_interface)
    }

    /// Assigns the container address and installs the planned routes.
    pub fn configure(
        &self,
        netns: &Path,
        ifname: &str,
        address: &Cidr,
        routes: &[PlannedRoute],
    ) -> Result<(), OverlayError> {
        let address_text = address.to_string();
        run_pinned(self.namespaces.as_ref(), netns, || {
            self.ip(words(["addr", "add", address_text.as_str(), "dev", ifname]))
                .map_err(|err| {
                    OverlayError::namespace(format!("assign {address_text} to {ifname}"), err)
                })?;
            for route in routes {
                self.ip(route.ip_args(ifname)).map_err(|err| {
                    OverlayError::namespace(format!("add route {} on {ifname}", route.dst), err)
                })?;
            }
            Ok(())
        })
    }

    /// Adds the host interface to the bridge, tagged so the logical switch
    /// port `iface_id` binds to it.
    pub fn bind(&self, binding: &PortBinding<'_>) -> Result<(), OverlayError> {
        SwitchDb::new(self.driver.as_ref())
            .add_port(
                binding.bridge,
                binding.host_interface,
                &[
                    pair("external_ids:attached_mac", binding.mac),
                    pair("external_ids:iface-id", binding.iface_id),
                    pair("external_ids:ip_address", binding.address.to_string()),
                ],
            )
            .step(format!(
                "bind {} to {}",
                binding.host_interface, binding.bridge
            ))
            .map(|_| ())
    }

    /// Removes the container interface, its switch port and any leftover
    /// namespace handle. A namespace that is already gone is not an error.
    pub fn detach(
        &self,
        container_id: &str,
        netns: Option<&Path>,
        ifname: &str,
    ) -> Result<(), OverlayError> {
        let host_interface = host_interface_name(container_id);

        if let Some(path) = netns {
            let outcome = run_pinned(self.namespaces.as_ref(), path, || {
                if !self.link_exists(ifname)? {
                    return Ok(false);
                }
                self.ip(words(["link", "delete", ifname]))
                    .map_err(|err| OverlayError::namespace(format!("delete link {ifname}"), err))?;
                Ok(true)
            });
            match outcome {
                Ok(true) => {}
                Ok(false) => log_debug(
                    "cni",
                    "Container interface already removed",
                    &[("container", container_id), ("interface", ifname)],
                ),
                Err(OverlayError::NamespaceGone { path }) => log_info(
                    "cni",
                    "Network namespace already gone",
                    &[
                        ("container", container_id),
                        ("netns", &path.display().to_string()),
                    ],
                ),
                Err(err) => return Err(err),
            }
        }

        SwitchDb::new(self.driver.as_ref())
            .del_port(&host_interface)
            .step(format!("remove switch port {host_interface}"))?;

        let handle = self.config.netns_dir.join(&host_interface);
        match fs::remove_file(&handle) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(OverlayError::io(
                    format!("remove namespace handle {}", handle.display()),
                    err,
                ))
            }
        }

        log_info(
            "cni",
            "Detached container",
            &[("container", container_id), ("host_interface", &host_interface)],
        );
        Ok(())
    }
}

/// `veth` plus eight random hex digits, unique enough to avoid clashing with
/// concurrent attachments before the rename.
fn temporary_peer_name() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    let suffix: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("veth{suffix}")
}
