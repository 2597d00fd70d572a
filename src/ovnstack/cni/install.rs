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


//! Installs the CNI plugin on a node: the plugin binary link and the network
//! configuration the container runtime reads.

use super::types::{IpamConf, NetConf, DEFAULT_CNI_VERSION};
use crate::ovnstack::config::OverlayConfig;
use crate::ovnstack::error::OverlayError;
use crate::ovnstack::ipam::Cidr;
use crate::ovnstack::logger::{log_debug, log_info};
use std::env;
use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PluginInstall {
    pub link: PathBuf,
    pub link_created: bool,
    pub conf: PathBuf,
    pub conf_written: bool,
}

/// Links the plugin binary into the CNI bin directory and writes the network
/// configuration. Neither is touched when already present.
pub fn install_plugin(config: &OverlayConfig, node_subnet: &Cidr) -> Result<PluginInstall, OverlayError> {
    let link = config.cni_bin_dir.join(&config.cni_plugin_link);
    let link_created = if link.symlink_metadata().is_ok() {
        log_debug(
            "cni",
            "Plugin link already present",
            &[("path", &link.display().to_string())],
        );
        false
    } else {
        let binary = find_in_path(&config.cni_plugin_binary).ok_or_else(|| {
            OverlayError::config(format!(
                "CNI plugin executable '{}' not found in PATH",
                config.cni_plugin_binary
            ))
        })?;
        create_dir(&config.cni_bin_dir)?;
        symlink(&binary, &link).map_err(|err| {
            OverlayError::io(
                format!("link {} -> {}", link.display(), binary.display()),
                err,
            )
        })?;
        true
    };

    let conf = config.cni_conf_dir.join(&config.cni_conf_file);
    let conf_written = if conf.exists() {
        log_debug(
            "cni",
            "Network configuration already present",
            &[("path", &conf.display().to_string())],
        );
        false
    } else {
        create_dir(&config.cni_conf_dir)?;
        let rendered = serde_json::to_string_pretty(&network_conf(config, node_subnet))
            .map_err(|err| OverlayError::config(format!("render network configuration: {err}")))?;
        fs::write(&conf, rendered)
            .map_err(|err| OverlayError::io(format!("write {}", conf.display()), err))?;
        true
    };

    log_info(
        "cni",
        "CNI plugin installed",
        &[
            ("link", &link.display().to_string()),
            ("conf", &conf.display().to_string()),
            ("conf_written", if conf_written { "true" } else { "false" }),
        ],
    );
    Ok(PluginInstall {
        link,
        link_created,
        conf,
        conf_written,
    })
}

fn network_conf(config: &OverlayConfig, node_subnet: &Cidr) -> NetConf {
    NetConf {
        cni_version: DEFAULT_CNI_VERSION.to_string(),
        name: "net".to_string(),
        plugin_type: config.cni_plugin_link.clone(),
        bridge: config.integration_bridge.clone(),
        ipam: IpamConf {
            ipam_type: "host-local".to_string(),
            subnet: Some(node_subnet.network_cidr().to_string()),
            routes: Vec::new(),
        },
        ip_masq: false,
        is_gateway: true,
        log_level: None,
    }
}

fn create_dir(dir: &Path) -> Result<(), OverlayError> {
    fs::create_dir_all(dir).map_err(|err| OverlayError::io(format!("create {}", dir.display()), err))
}

pub fn find_in_path(name: &str) -> Option<PathBuf> {
    if Path::new(name).components().count() > 1 {
        return Path::new(name).canonicalize().ok();
    }

    env::var_os("PATH").and_then(|paths| {
        env::split_paths(&paths).find_map(|dir| {
            let candidate = dir.join(name);
            if !candidate.is_file() {
                return None;
            }

            match candidate.metadata() {
                Ok(metadata) if metadata.permissions().mode() & 0o111 != 0 => Some(candidate),
                _ => None,
            }
        })
    })
}
