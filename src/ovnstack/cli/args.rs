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


use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::ovnstack::logger::LogFormat;

/// Provision the OVN overlay network on a Kubernetes node.
#[derive(Parser)]
#[command(name = "ovnctl")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct OvnCtl {
    /// Log line format
    #[arg(long, global = true, value_enum, default_value_t = LogFormatArg::Text)]
    pub log_format: LogFormatArg,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the distributed router, join switch and cluster load
    /// balancers, then join this node
    ClusterBootstrap(NodeArgs),

    /// Join this node to an already bootstrapped cluster
    NodeJoin(NodeArgs),

    /// Make this node a north-south gateway for the cluster
    NodeGatewayBootstrap(GatewayArgs),
}

#[derive(Args)]
pub struct NodeArgs {
    /// The subnet all pods in the cluster draw from, e.g. 10.0.0.0/14
    #[arg(long)]
    pub cluster_subnet: String,

    /// The subnet assigned to this node's logical switch, e.g. 10.1.1.0/24
    #[arg(long)]
    pub node_switch_subnet: String,

    /// The Kubernetes node name
    #[arg(long)]
    pub node_name: String,
}

#[derive(Args)]
pub struct GatewayArgs {
    /// The subnet all pods in the cluster draw from
    #[arg(long)]
    pub cluster_subnet: String,

    /// Physical interface to hand to OVS as the gateway uplink
    #[arg(long)]
    pub physical_interface: Option<String>,

    /// Existing OVS bridge that carries the gateway uplink
    #[arg(long)]
    pub bridge_interface: Option<String>,

    /// Address and prefix of the uplink, e.g. 192.168.1.10/24
    #[arg(long)]
    pub physical_ip: String,

    /// The Kubernetes node name
    #[arg(long)]
    pub node_name: String,

    /// Upstream default gateway for north-south traffic
    #[arg(long)]
    pub default_gw: Option<String>,

    /// Comma-separated source subnets whose egress leaves through this gateway
    #[arg(long)]
    pub rampout_ip_subnets: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

/// Flags of the CNI plugin binary. Everything else arrives through the
/// `CNI_*` environment and stdin.
#[derive(Parser)]
#[command(name = "ovn-cni")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct OvnCni {
    /// Log at debug level
    #[arg(short, long)]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_flags_parse() {
        let cli = OvnCtl::try_parse_from([
            "ovnctl",
            "node-gateway-bootstrap",
            "--cluster-subnet",
            "10.0.0.0/14",
            "--physical-interface",
            "eth1",
            "--physical-ip",
            "192.168.1.10/24",
            "--node-name",
            "gw-1",
            "--rampout-ip-subnets",
            "10.2.0.0/16,10.3.0.0/16",
        ])
        .expect("parses");
        match cli.command {
            Commands::NodeGatewayBootstrap(args) => {
                assert_eq!(args.physical_interface.as_deref(), Some("eth1"));
                assert_eq!(args.bridge_interface, None);
                assert_eq!(args.rampout_ip_subnets.as_deref(), Some("10.2.0.0/16,10.3.0.0/16"));
            }
            _ => panic!("unexpected subcommand"),
        }
        assert_eq!(cli.log_format, LogFormatArg::Text);
    }

    #[test]
    fn node_flags_are_required() {
        assert!(OvnCtl::try_parse_from(["ovnctl", "node-join", "--node-name", "n1"]).is_err());
        let cli = OvnCtl::try_parse_from([
            "ovnctl",
            "--log-format",
            "json",
            "cluster-bootstrap",
            "--cluster-subnet",
            "10.0.0.0/14",
            "--node-switch-subnet",
            "10.1.1.0/24",
            "--node-name",
            "node-1",
        ])
        .expect("parses");
        assert_eq!(cli.log_format, LogFormatArg::Json);
        assert!(matches!(cli.command, Commands::ClusterBootstrap(_)));
    }
}
