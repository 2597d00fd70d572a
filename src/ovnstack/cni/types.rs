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


use crate::ovnstack::error::OverlayError;
use crate::ovnstack::ipam::Cidr;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

pub const SUPPORTED_CNI_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];
pub const DEFAULT_CNI_VERSION: &str = "0.3.1";

/// Kernel limit on interface names.
pub const MAX_INTERFACE_NAME: usize = 15;

/// Network configuration read from stdin.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NetConf {
    #[serde(rename = "cniVersion", default = "default_cni_version")]
    pub cni_version: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub plugin_type: String,
    #[serde(default = "default_bridge")]
    pub bridge: String,
    #[serde(default)]
    pub ipam: IpamConf,
    #[serde(rename = "ipMasq", default, deserialize_with = "flexible_bool")]
    pub ip_masq: bool,
    #[serde(rename = "isGateway", default, deserialize_with = "flexible_bool")]
    pub is_gateway: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct IpamConf {
    #[serde(rename = "type", default)]
    pub ipam_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteConf>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RouteConf {
    pub dst: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<String>,
}

fn default_cni_version() -> String {
    DEFAULT_CNI_VERSION.to_string()
}

fn default_bridge() -> String {
    "br-int".to_string()
}

/// Accepts `true` / `false` or their string spellings.
fn flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    match Flag::deserialize(deserializer)? {
        Flag::Bool(value) => Ok(value),
        Flag::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" | "" => Ok(false),
            other => Err(de::Error::custom(format!("invalid boolean '{other}'"))),
        },
    }
}

impl NetConf {
    pub fn parse(bytes: &[u8]) -> Result<Self, OverlayError> {
        let conf: NetConf = serde_json::from_slice(bytes)
            .map_err(|err| OverlayError::config(format!("invalid network configuration: {err}")))?;
        validate_cni_version(&conf.cni_version)?;
        Ok(conf)
    }
}

pub fn validate_cni_version(version: &str) -> Result<(), OverlayError> {
    if SUPPORTED_CNI_VERSIONS.contains(&version) {
        Ok(())
    } else {
        Err(OverlayError::config(format!(
            "unsupported cniVersion '{}'; supported versions: {}",
            version,
            SUPPORTED_CNI_VERSIONS.join(", ")
        )))
    }
}

pub fn validate_interface_name(name: &str, context: &str) -> Result<(), OverlayError> {
    if name.is_empty() {
        return Err(OverlayError::config(format!("{context} must not be empty")));
    }
    if name.chars().count() > MAX_INTERFACE_NAME {
        return Err(OverlayError::config(format!(
            "{context} '{name}' exceeds the {MAX_INTERFACE_NAME} character interface name limit"
        )));
    }
    if name.contains('/') || name.chars().any(char::is_whitespace) {
        return Err(OverlayError::config(format!(
            "{context} '{name}' contains invalid characters"
        )));
    }
    Ok(())
}

/// Host-side interface name: the container identifier cut to the kernel
/// name limit.
pub fn host_interface_name(container_id: &str) -> String {
    truncate_bytes(container_id, MAX_INTERFACE_NAME).to_string()
}

/// Longest prefix of `name` that fits in `limit` bytes without splitting a
/// character. The kernel limit on link names counts bytes.
pub fn truncate_bytes(name: &str, limit: usize) -> &str {
    if name.len() <= limit {
        return name;
    }
    let mut end = limit;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CniCommand {
    Add,
    Del,
    Version,
}

impl CniCommand {
    pub fn parse(value: &str) -> Result<Self, OverlayError> {
        match value.trim() {
            "ADD" => Ok(CniCommand::Add),
            "DEL" => Ok(CniCommand::Del),
            "VERSION" => Ok(CniCommand::Version),
            other => Err(OverlayError::config(format!(
                "unsupported CNI_COMMAND '{other}'"
            ))),
        }
    }
}

/// The `CNI_*` environment of one invocation.
#[derive(Clone, Debug)]
pub struct CniEnv {
    pub command: CniCommand,
    container_id: String,
    pub netns: Option<PathBuf>,
    pub ifname: String,
    args: HashMap<String, String>,
}

impl CniEnv {
    pub fn from_map(env: &HashMap<String, String>) -> Result<Self, OverlayError> {
        let value = |key: &str| {
            env.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let command = CniCommand::parse(
            &value("CNI_COMMAND").ok_or_else(|| OverlayError::config("CNI_COMMAND not set"))?,
        )?;
        let args = parse_cni_args(&value("CNI_ARGS").unwrap_or_default());
        let container_id = args
            .get("K8S_POD_INFRA_CONTAINER_ID")
            .filter(|v| !v.is_empty())
            .cloned()
            .or_else(|| value("CNI_CONTAINERID"))
            .unwrap_or_default();
        let ifname = value("CNI_IFNAME").unwrap_or_else(|| "eth0".to_string());

        let parsed = CniEnv {
            command,
            container_id,
            netns: value("CNI_NETNS").map(PathBuf::from),
            ifname,
            args,
        };
        if parsed.command != CniCommand::Version {
            if parsed.container_id.is_empty() {
                return Err(OverlayError::config("CNI_CONTAINERID not set"));
            }
            validate_interface_name(&parsed.ifname, "CNI_IFNAME")?;
        }
        Ok(parsed)
    }

    /// `K8S_POD_INFRA_CONTAINER_ID` when present, otherwise `CNI_CONTAINERID`.
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn pod(&self) -> Result<(&str, &str), OverlayError> {
        let get = |key: &str| {
            self.args
                .get(key)
                .map(String::as_str)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| OverlayError::config(format!("{key} missing from CNI_ARGS")))
        };
        Ok((get("K8S_POD_NAMESPACE")?, get("K8S_POD_NAME")?))
    }

    pub fn require_netns(&self) -> Result<&PathBuf, OverlayError> {
        self.netns
            .as_ref()
            .ok_or_else(|| OverlayError::config("CNI_NETNS not set"))
    }
}

/// `K1=V1;K2=V2`; entries without `=` are ignored.
pub fn parse_cni_args(raw: &str) -> HashMap<String, String> {
    raw.split(';')
        .filter_map(|entry| entry.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

/// A route to install inside the container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedRoute {
    pub dst: Cidr,
    pub gw: Option<Ipv4Addr>,
}

impl PlannedRoute {
    pub fn is_default(&self) -> bool {
        self.dst.prefix == 0
    }

    /// Arguments for `ip route add` inside the container.
    pub fn ip_args(&self, ifname: &str) -> Vec<String> {
        let mut args = vec![
            "route".to_string(),
            "add".to_string(),
            self.dst.network_cidr().to_string(),
        ];
        if let Some(gw) = self.gw {
            args.push("via".to_string());
            args.push(gw.to_string());
        }
        args.push("dev".to_string());
        args.push(ifname.to_string());
        args
    }
}

/// Combines IPAM routes with the gateway default route. Fails when IPAM
/// already carries a default route through a different gateway while the
/// gateway flag is set.
pub fn plan_routes(
    ipam_routes: &[RouteConf],
    is_gateway: bool,
    gateway: Ipv4Addr,
) -> Result<Vec<PlannedRoute>, OverlayError> {
    let mut planned = Vec::new();
    if is_gateway {
        planned.push(PlannedRoute {
            dst: Cidr {
                address: Ipv4Addr::UNSPECIFIED,
                prefix: 0,
            },
            gw: Some(gateway),
        });
    }
    for route in ipam_routes {
        let dst = Cidr::parse(&route.dst)
            .map_err(|err| OverlayError::config(format!("invalid IPAM route: {err}")))?;
        let gw = match route.gw.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            Some(value) => Some(value.parse::<Ipv4Addr>().map_err(|err| {
                OverlayError::config(format!("invalid gateway '{value}' in IPAM route: {err}"))
            })?),
            None => None,
        };
        let route = PlannedRoute { dst, gw };
        if is_gateway && route.is_default() {
            match route.gw {
                Some(other) if other != gateway => {
                    return Err(OverlayError::config(format!(
                        "IPAM default route via {other} conflicts with the pod gateway {gateway}"
                    )));
                }
                _ => continue,
            }
        }
        planned.push(route);
    }
    Ok(planned)
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct CniResult {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub interfaces: Vec<Interface>,
    pub ips: Vec<Ip>,
    pub routes: Vec<Route>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sandbox: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Ip {
    pub version: String,
    pub address: String,
    pub gateway: String,
    pub interface: u8,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Route {
    pub dst: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<String>,
}

/// Error object printed on stdout when an invocation fails.
#[derive(Clone, Debug, Serialize)]
pub struct CniErrorReply {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
}

impl CniErrorReply {
    pub fn from_error(cni_version: &str, err: &OverlayError) -> Self {
        let code = match err {
            OverlayError::Config(_) => 7,
            OverlayError::MetadataTimeout { .. } => 11,
            _ => 100,
        };
        CniErrorReply {
            cni_version: cni_version.to_string(),
            code,
            msg: err.to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct VersionReply {
    #[serde(rename = "cniVersion")]
    pub cni_version: &'static str,
    #[serde(rename = "supportedVersions")]
    pub supported_versions: &'static [&'static str],
}

impl Default for VersionReply {
    fn default() -> Self {
        VersionReply {
            cni_version: DEFAULT_CNI_VERSION,
            supported_versions: SUPPORTED_CNI_VERSIONS,
        }
    }
}
