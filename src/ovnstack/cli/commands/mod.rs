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


mod cni;
mod provision;

use std::sync::Arc;

use crate::ovnstack::config::OverlayConfig;
use crate::ovnstack::error::OverlayError;
use crate::ovnstack::logger;
use crate::ovnstack::observability::tracing;
use crate::ovnstack::ovsdb::{ControlPlaneDriver, HostDriver};
use crate::ovnstack::topology::TopologyProvisioner;

use super::args::{Commands, OvnCtl};

pub use cni::run_cni;

pub fn run(cli: &OvnCtl) -> Result<(), OverlayError> {
    logger::set_log_format(cli.log_format.into());
    tracing::init();

    let driver: Arc<dyn ControlPlaneDriver> = Arc::new(HostDriver::new());
    let provisioner = TopologyProvisioner::new(driver, OverlayConfig::from_env());
    match &cli.command {
        Commands::ClusterBootstrap(args) => provision::handle_cluster_bootstrap(&provisioner, args),
        Commands::NodeJoin(args) => provision::handle_node_join(&provisioner, args),
        Commands::NodeGatewayBootstrap(args) => {
            provision::handle_gateway_bootstrap(&provisioner, args)
        }
    }
}
