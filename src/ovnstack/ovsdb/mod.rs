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


//! Typed access to the OVN/OVS command-line databases.

pub mod driver;
pub mod nbctl;
pub mod reply;
pub mod vsctl;

pub use driver::{render_command, ControlPlaneDriver, DriverError, HostDriver, Tool};
pub use nbctl::Northbound;
pub use reply::Reply;
pub use vsctl::SwitchDb;

/// A `--`-separated sequence of commands sent as one invocation, so the
/// database applies them in a single transaction.
#[derive(Clone, Debug)]
pub struct Batch {
    tool: Tool,
    args: Vec<String>,
}

impl Batch {
    pub fn new(tool: Tool) -> Self {
        Batch {
            tool,
            args: Vec::new(),
        }
    }

    /// Appends one command, preceded by the `--` separator.
    pub fn command<I, S>(mut self, words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.push("--".to_string());
        self.args.extend(words.into_iter().map(Into::into));
        self
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn run(&self, driver: &dyn ControlPlaneDriver) -> Result<Reply, DriverError> {
        run_decoded(driver, self.tool, &self.args)
    }
}

pub(crate) fn run_decoded(
    driver: &dyn ControlPlaneDriver,
    tool: Tool,
    args: &[String],
) -> Result<Reply, DriverError> {
    let lines = driver.run(tool, args)?;
    Reply::decode(&render_command(tool, args), &lines)
}

pub(crate) fn words<I, S>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    values.into_iter().map(Into::into).collect()
}
