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


use crate::ovnstack::ipam::Cidr;
use std::env;
use std::path::{Component, PathBuf};
use std::time::Duration;

/// Host paths the overlay touches, each overridable from the environment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Config {
    CniConfDir,
    CniBinDir,
    NetnsDir,
    DebianInterfaces,
    RedhatScripts,
}

impl Config {
    /// Returns the associated environment variable for the config parameter.
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::CniConfDir => "OVNSTACK_CNI_CONF_DIR",
            Config::CniBinDir => "OVNSTACK_CNI_BIN_DIR",
            Config::NetnsDir => "OVNSTACK_NETNS_DIR",
            Config::DebianInterfaces => "OVNSTACK_DEBIAN_INTERFACES",
            Config::RedhatScripts => "OVNSTACK_REDHAT_SCRIPTS",
        }
    }

    pub fn default_path(&self) -> &'static str {
        match self {
            Config::CniConfDir => {
                #[cfg(test)]
                {
                    "/tmp/ovnstack-test/cni/net.d"
                }
                #[cfg(not(test))]
                {
                    "/etc/cni/net.d"
                }
            }
            Config::CniBinDir => {
                #[cfg(test)]
                {
                    "/tmp/ovnstack-test/cni/bin"
                }
                #[cfg(not(test))]
                {
                    "/opt/cni/bin"
                }
            }
            Config::NetnsDir => "/var/run/netns",
            Config::DebianInterfaces => "/etc/network/interfaces",
            Config::RedhatScripts => "/etc/sysconfig/network-scripts",
        }
    }

    /// Returns the effective value, either from environment or default.
    pub fn get_path(&self) -> PathBuf {
        env::var(self.env_var()).map_or_else(
            |_| Self::normalize_path(self.default_path()),
            |value| Self::normalize_path(&value),
        )
    }

    /// Expand `~`, make relative paths absolute and collapse `.`/`..`.
    fn normalize_path(input: &str) -> PathBuf {
        let path: PathBuf = match input {
            _ if input.starts_with("~/") => env::var("HOME")
                .ok()
                .map(|home| PathBuf::from(home).join(&input[2..])),
            _ if !input.starts_with('/') => env::current_dir().ok().map(|cwd| cwd.join(input)),
            _ => None,
        }
        .unwrap_or_else(|| PathBuf::from(input));

        path.components()
            .fold(PathBuf::new(), |mut normalized, component| {
                match component {
                    Component::CurDir => {}
                    Component::ParentDir => {
                        normalized.pop();
                    }
                    _ => normalized.push(component),
                }
                normalized
            })
    }
}

/// Everything the provisioner and the CNI plugin need to know about the
/// host, handed to each component when it is constructed.
#[derive(Clone, Debug)]
pub struct OverlayConfig {
    pub integration_bridge: String,
    pub join_switch: String,
    pub join_pool: Cidr,
    pub management_mtu: u32,
    pub cni_conf_dir: PathBuf,
    pub cni_conf_file: String,
    pub cni_bin_dir: PathBuf,
    pub cni_plugin_binary: String,
    pub cni_plugin_link: String,
    pub netns_dir: PathBuf,
    pub debian_interfaces: PathBuf,
    pub redhat_scripts: PathBuf,
    pub metadata_attempts: u32,
    pub metadata_interval: Duration,
    /// Takes precedence over `external_ids:k8s-api-server`.
    pub api_server: Option<String>,
}

impl OverlayConfig {
    pub fn from_env() -> Self {
        OverlayConfig {
            cni_conf_dir: Config::CniConfDir.get_path(),
            cni_bin_dir: Config::CniBinDir.get_path(),
            netns_dir: Config::NetnsDir.get_path(),
            debian_interfaces: Config::DebianInterfaces.get_path(),
            redhat_scripts: Config::RedhatScripts.get_path(),
            api_server: env::var("OVNSTACK_API_SERVER")
                .ok()
                .filter(|value| !value.trim().is_empty()),
            ..Self::default()
        }
    }

    /// The `ifup-ovs` helper whose presence marks a RedHat style host.
    pub fn redhat_marker(&self) -> PathBuf {
        self.redhat_scripts.join("ifup-ovs")
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        OverlayConfig {
            integration_bridge: "br-int".to_string(),
            join_switch: "join".to_string(),
            join_pool: Cidr {
                address: std::net::Ipv4Addr::new(100, 64, 1, 0),
                prefix: 24,
            },
            management_mtu: 1400,
            cni_conf_dir: PathBuf::from(Config::CniConfDir.default_path()),
            cni_conf_file: "10-net.conf".to_string(),
            cni_bin_dir: PathBuf::from(Config::CniBinDir.default_path()),
            cni_plugin_binary: "ovn-cni".to_string(),
            cni_plugin_link: "ovn_cni".to_string(),
            netns_dir: PathBuf::from(Config::NetnsDir.default_path()),
            debian_interfaces: PathBuf::from(Config::DebianInterfaces.default_path()),
            redhat_scripts: PathBuf::from(Config::RedhatScripts.default_path()),
            metadata_attempts: 30,
            metadata_interval: Duration::from_millis(100),
            api_server: None,
        }
    }
}
