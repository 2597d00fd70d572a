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


use super::driver::{render_command, ControlPlaneDriver, DriverError, Tool};
use super::{run_decoded, words, Batch, Reply};

pub const LOGICAL_ROUTER: &str = "logical_router";
pub const LOGICAL_SWITCH: &str = "logical_switch";
pub const LOGICAL_ROUTER_PORT: &str = "logical_router_port";
pub const LOGICAL_SWITCH_PORT: &str = "logical_switch_port";
pub const LOAD_BALANCER: &str = "load_balancer";

/// Typed command vocabulary for `ovn-nbctl`.
#[derive(Clone, Copy)]
pub struct Northbound<'a> {
    driver: &'a dyn ControlPlaneDriver,
}

impl<'a> Northbound<'a> {
    pub fn new(driver: &'a dyn ControlPlaneDriver) -> Self {
        Northbound { driver }
    }

    pub fn batch(&self) -> Batch {
        Batch::new(Tool::Northbound)
    }

    pub fn apply(&self, batch: &Batch) -> Result<Reply, DriverError> {
        batch.run(self.driver)
    }

    /// `find` with bare output of a single column.
    pub fn find(
        &self,
        table: &str,
        column: &str,
        conditions: &[String],
    ) -> Result<Reply, DriverError> {
        let mut args = words([
            "--data=bare".to_string(),
            "--no-heading".to_string(),
            format!("--columns={column}"),
            "find".to_string(),
            table.to_string(),
        ]);
        args.extend(conditions.iter().cloned());
        run_decoded(self.driver, Tool::Northbound, &args)
    }

    pub fn find_first(
        &self,
        table: &str,
        column: &str,
        conditions: &[String],
    ) -> Result<Option<String>, DriverError> {
        Ok(self
            .find(table, column, conditions)?
            .first()
            .map(str::to_string))
    }

    /// `--if-exists get`; `None` when the record or key is absent.
    pub fn get(
        &self,
        table: &str,
        record: &str,
        column: &str,
    ) -> Result<Option<String>, DriverError> {
        Ok(self.get_reply(table, record, column)?.first().map(str::to_string))
    }

    pub fn get_all(
        &self,
        table: &str,
        record: &str,
        column: &str,
    ) -> Result<Vec<String>, DriverError> {
        Ok(self
            .get_reply(table, record, column)?
            .values()
            .map(str::to_string)
            .collect())
    }

    fn get_reply(&self, table: &str, record: &str, column: &str) -> Result<Reply, DriverError> {
        let args = words(["--if-exists", "get", table, record, column]);
        run_decoded(self.driver, Tool::Northbound, &args)
    }

    /// Creates a record and returns its uuid.
    pub fn create(&self, table: &str, settings: &[String]) -> Result<String, DriverError> {
        let mut args = words(["create", table]);
        args.extend(settings.iter().cloned());
        let reply = run_decoded(self.driver, Tool::Northbound, &args)?;
        reply
            .first()
            .map(str::to_string)
            .ok_or_else(|| DriverError::Empty {
                command: render_command(Tool::Northbound, &args),
            })
    }

    pub fn set(&self, table: &str, record: &str, settings: &[String]) -> Result<(), DriverError> {
        let mut args = words(["set", table, record]);
        args.extend(settings.iter().cloned());
        run_decoded(self.driver, Tool::Northbound, &args).map(|_| ())
    }

    pub fn add_route(
        &self,
        router: &str,
        prefix: &str,
        nexthop: &str,
        policy: Option<&str>,
    ) -> Result<(), DriverError> {
        let mut args = words(["--may-exist"]);
        if let Some(policy) = policy {
            args.push(format!("--policy={policy}"));
        }
        args.extend(words(["lr-route-add", router, prefix, nexthop]));
        run_decoded(self.driver, Tool::Northbound, &args).map(|_| ())
    }

    pub fn attach_switch_lb(&self, switch: &str, lb: &str) -> Result<(), DriverError> {
        let args = words(["--may-exist", "ls-lb-add", switch, lb]);
        run_decoded(self.driver, Tool::Northbound, &args).map(|_| ())
    }

    pub fn attach_router_lb(&self, router: &str, lb: &str) -> Result<(), DriverError> {
        let args = words(["--may-exist", "lr-lb-add", router, lb]);
        run_decoded(self.driver, Tool::Northbound, &args).map(|_| ())
    }

    pub fn add_snat(
        &self,
        router: &str,
        external_ip: &str,
        logical_ip: &str,
    ) -> Result<(), DriverError> {
        let args = words([
            "--may-exist",
            "lr-nat-add",
            router,
            "snat",
            external_ip,
            logical_ip,
        ]);
        run_decoded(self.driver, Tool::Northbound, &args).map(|_| ())
    }
}

/// `key=value` condition or setting.
pub fn pair(key: &str, value: impl AsRef<str>) -> String {
    format!("{}={}", key, value.as_ref())
}

/// Quoted `addresses=` setting for router-type switch ports.
pub fn quoted_addresses(mac: &str) -> String {
    format!("addresses=\"{mac}\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Canned {
        reply: Vec<String>,
        seen: Mutex<Vec<Vec<String>>>,
    }

    impl Canned {
        fn new(reply: &[&str]) -> Self {
            Canned {
                reply: reply.iter().map(|s| s.to_string()).collect(),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl ControlPlaneDriver for Canned {
        fn run(&self, tool: Tool, args: &[String]) -> Result<Vec<String>, DriverError> {
            assert_eq!(tool, Tool::Northbound);
            self.seen.lock().unwrap().push(args.to_vec());
            Ok(self.reply.clone())
        }
    }

    #[test]
    fn find_requests_bare_single_column_output() {
        let driver = Canned::new(&["abc-uuid"]);
        let nb = Northbound::new(&driver);
        let found = nb
            .find_first(
                LOAD_BALANCER,
                "_uuid",
                &[pair("external_ids:k8s-cluster-lb-tcp", "yes")],
            )
            .expect("find");
        assert_eq!(found.as_deref(), Some("abc-uuid"));
        let seen = driver.seen.lock().unwrap();
        assert_eq!(
            seen[0],
            vec![
                "--data=bare",
                "--no-heading",
                "--columns=_uuid",
                "find",
                "load_balancer",
                "external_ids:k8s-cluster-lb-tcp=yes"
            ]
        );
    }

    #[test]
    fn create_without_uuid_is_an_empty_reply_error() {
        let driver = Canned::new(&[]);
        let nb = Northbound::new(&driver);
        let err = nb
            .create(LOAD_BALANCER, &[pair("protocol", "udp")])
            .expect_err("empty reply");
        assert!(matches!(err, DriverError::Empty { .. }));
    }

    #[test]
    fn batches_separate_commands() {
        let driver = Canned::new(&[]);
        let nb = Northbound::new(&driver);
        let batch = nb
            .batch()
            .command(["--may-exist", "lr-add", "node-1"])
            .command(["set", LOGICAL_ROUTER, "node-1", "external_ids:k8s-cluster-router=yes"]);
        nb.apply(&batch).expect("apply");
        assert_eq!(
            batch.args(),
            &[
                "--",
                "--may-exist",
                "lr-add",
                "node-1",
                "--",
                "set",
                "logical_router",
                "node-1",
                "external_ids:k8s-cluster-router=yes"
            ]
        );
    }

    #[test]
    fn policy_routes_carry_the_policy_flag() {
        let driver = Canned::new(&[]);
        let nb = Northbound::new(&driver);
        nb.add_route("node-1", "10.2.0.0/16", "100.64.1.2", Some("src-ip"))
            .expect("route");
        let seen = driver.seen.lock().unwrap();
        assert_eq!(
            seen[0],
            vec![
                "--may-exist",
                "--policy=src-ip",
                "lr-route-add",
                "node-1",
                "10.2.0.0/16",
                "100.64.1.2"
            ]
        );
    }
}
