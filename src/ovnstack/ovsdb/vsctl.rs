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


use super::driver::{ControlPlaneDriver, DriverError, Tool};
use super::{run_decoded, words, Batch, Reply};

/// Typed command vocabulary for `ovs-vsctl`.
#[derive(Clone, Copy)]
pub struct SwitchDb<'a> {
    driver: &'a dyn ControlPlaneDriver,
}

impl<'a> SwitchDb<'a> {
    pub fn new(driver: &'a dyn ControlPlaneDriver) -> Self {
        SwitchDb { driver }
    }

    /// Reads `external_ids:<key>` of the local `Open_vSwitch` record.
    pub fn system_external_id(&self, key: &str) -> Result<Option<String>, DriverError> {
        self.get("Open_vSwitch", ".", &format!("external_ids:{key}"))
    }

    pub fn interface_mac(&self, interface: &str) -> Result<Option<String>, DriverError> {
        self.get("interface", interface, "mac_in_use")
    }

    pub fn get(
        &self,
        table: &str,
        record: &str,
        column: &str,
    ) -> Result<Option<String>, DriverError> {
        let args = words(["--if-exists", "get", table, record, column]);
        Ok(run_decoded(self.driver, Tool::Switch, &args)?
            .first()
            .map(str::to_string))
    }

    /// Adds `port` to `bridge` if missing and applies interface settings in
    /// the same transaction.
    pub fn add_port(
        &self,
        bridge: &str,
        port: &str,
        interface_settings: &[String],
    ) -> Result<Reply, DriverError> {
        let mut batch = Batch::new(Tool::Switch).command(["--may-exist", "add-port", bridge, port]);
        if !interface_settings.is_empty() {
            let mut set = words(["set", "interface", port]);
            set.extend(interface_settings.iter().cloned());
            batch = batch.command(set);
        }
        batch.run(self.driver)
    }

    pub fn set_bridge(&self, bridge: &str, settings: &[String]) -> Result<(), DriverError> {
        let mut args = words(["set", "bridge", bridge]);
        args.extend(settings.iter().cloned());
        run_decoded(self.driver, Tool::Switch, &args).map(|_| ())
    }

    pub fn del_port(&self, port: &str) -> Result<(), DriverError> {
        let args = words(["--if-exists", "del-port", port]);
        run_decoded(self.driver, Tool::Switch, &args).map(|_| ())
    }
}
