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


use crate::ovnstack::cli::args::{GatewayArgs, NodeArgs};
use crate::ovnstack::cli::Terminal;
use crate::ovnstack::cni::install::{install_plugin, PluginInstall};
use crate::ovnstack::error::OverlayError;
use crate::ovnstack::topology::{
    ClusterParams, GatewayParams, NodeParams, NodeReport, TopologyProvisioner, Uplink,
};

pub(super) fn handle_cluster_bootstrap(
    provisioner: &TopologyProvisioner,
    args: &NodeArgs,
) -> Result<(), OverlayError> {
    let params = ClusterParams::new(
        &args.node_name,
        &args.node_switch_subnet,
        &args.cluster_subnet,
    )?;
    let report = provisioner.cluster_bootstrap(&params)?;
    Terminal::stdout(format_args!(
        "Cluster router {} is up; join switch {} reaches it at {}",
        report.router, report.join_switch, report.join_address
    ));
    print_node(&report.node);

    let install = install_plugin(provisioner.config(), &params.node.node_subnet)?;
    print_install(&install);
    Ok(())
}

pub(super) fn handle_node_join(
    provisioner: &TopologyProvisioner,
    args: &NodeArgs,
) -> Result<(), OverlayError> {
    let params = NodeParams::new(
        &args.node_name,
        &args.node_switch_subnet,
        &args.cluster_subnet,
    )?;
    let report = provisioner.node_join(&params)?;
    print_node(&report);

    let install = install_plugin(provisioner.config(), &params.node_subnet)?;
    print_install(&install);
    Ok(())
}

pub(super) fn handle_gateway_bootstrap(
    provisioner: &TopologyProvisioner,
    args: &GatewayArgs,
) -> Result<(), OverlayError> {
    let uplink = Uplink::from_flags(
        args.physical_interface.as_deref(),
        args.bridge_interface.as_deref(),
    )?;
    let params = GatewayParams::new(
        &args.node_name,
        &args.cluster_subnet,
        &args.physical_ip,
        uplink,
    )?
    .with_default_gateway(args.default_gw.as_deref())?
    .with_rampout_subnets(args.rampout_ip_subnets.as_deref());

    let report = provisioner.gateway_bootstrap(&params)?;
    Terminal::stdout(format_args!(
        "Gateway router {} is up at {} on {}{}",
        report.router,
        report.join_address,
        report.external_switch,
        if report.first_gateway {
            " (first gateway)"
        } else {
            ""
        }
    ));
    for warning in &report.warnings {
        Terminal::warn(format_args!("{warning}"));
    }
    Ok(())
}

fn print_node(report: &NodeReport) {
    Terminal::stdout(format_args!(
        "Node switch {} routed through {} at {}",
        report.switch, report.router_port, report.router_address
    ));
    Terminal::stdout(format_args!(
        "Management port {} ({} {}) configured for {} hosts",
        report.management_interface,
        report.management_mac,
        report.management_address,
        report.platform
    ));
}

fn print_install(install: &PluginInstall) {
    let link = if install.link_created {
        "Linked"
    } else {
        "Kept existing"
    };
    Terminal::stdout(format_args!("{link} CNI plugin {}", install.link.display()));
    let conf = if install.conf_written {
        "Wrote"
    } else {
        "Kept existing"
    };
    Terminal::stdout(format_args!("{conf} CNI configuration {}", install.conf.display()));
}
