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


//! Boundary to the logical-network database, the switch database and the
//! host link tooling. Higher layers only ever see [`ControlPlaneDriver`].

use crate::ovnstack::logger::log_debug;
use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};

const RECORD_ENV: &str = "OVNSTACK_COMMAND_RECORD";

/// Command-line tools reachable through the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tool {
    /// `ovn-nbctl`, the logical-network (northbound) database.
    Northbound,
    /// `ovs-vsctl`, the local virtual switch database.
    Switch,
    Ip,
    Bridge,
}

impl Tool {
    pub fn binary(self) -> &'static str {
        match self {
            Tool::Northbound => "ovn-nbctl",
            Tool::Switch => "ovs-vsctl",
            Tool::Ip => "ip",
            Tool::Bridge => "bridge",
        }
    }

    fn override_var(self) -> &'static str {
        match self {
            Tool::Northbound => "OVNSTACK_NBCTL",
            Tool::Switch => "OVNSTACK_VSCTL",
            Tool::Ip => "OVNSTACK_IP",
            Tool::Bridge => "OVNSTACK_BRIDGE",
        }
    }

    const ALL: [Tool; 4] = [Tool::Northbound, Tool::Switch, Tool::Ip, Tool::Bridge];
}

/// Renders an invocation the way it would be typed in a shell, for logs and errors.
pub fn render_command(tool: Tool, args: &[String]) -> String {
    let mut rendered = tool.binary().to_string();
    for arg in args {
        rendered.push(' ');
        rendered.push_str(arg);
    }
    rendered
}

#[derive(Debug)]
pub enum DriverError {
    Spawn {
        command: String,
        source: io::Error,
    },
    Failed {
        command: String,
        status: String,
        stderr: String,
    },
    /// The reply could not be decoded into values.
    Malformed {
        command: String,
        detail: String,
    },
    /// The reply was empty where a value was mandatory.
    Empty {
        command: String,
    },
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverError::Spawn { command, source } => {
                write!(f, "failed to execute `{command}`: {source}")
            }
            DriverError::Failed {
                command,
                status,
                stderr,
            } => {
                if stderr.is_empty() {
                    write!(f, "`{command}` exited with status {status}")
                } else {
                    write!(f, "`{command}` exited with status {status}: {stderr}")
                }
            }
            DriverError::Malformed { command, detail } => {
                write!(f, "malformed reply from `{command}`: {detail}")
            }
            DriverError::Empty { command } => write!(f, "`{command}` returned no value"),
        }
    }
}

impl DriverError {
    /// `ip` reported that the named link is absent. Any other failure,
    /// including one to spawn the tool, is not.
    pub fn is_missing_device(&self) -> bool {
        match self {
            DriverError::Failed { stderr, .. } => {
                stderr.contains("does not exist") || stderr.contains("Cannot find device")
            }
            _ => false,
        }
    }
}

impl Error for DriverError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DriverError::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Issues one command and returns its stdout split into lines.
///
/// An empty reply is a valid answer ("nothing matched"), never an error.
pub trait ControlPlaneDriver: Send + Sync {
    fn run(&self, tool: Tool, args: &[String]) -> Result<Vec<String>, DriverError>;
}

/// Runs the real binaries found on `PATH`.
///
/// Each binary can be replaced through `OVNSTACK_NBCTL`, `OVNSTACK_VSCTL`,
/// `OVNSTACK_IP` and `OVNSTACK_BRIDGE`. When `OVNSTACK_COMMAND_RECORD` names a
/// file, invocations are appended there and nothing is executed.
pub struct HostDriver {
    binaries: HashMap<Tool, String>,
    record_path: Option<PathBuf>,
}

impl HostDriver {
    pub fn new() -> Self {
        let binaries = Tool::ALL
            .iter()
            .map(|tool| {
                let binary =
                    env::var(tool.override_var()).unwrap_or_else(|_| tool.binary().to_string());
                (*tool, binary)
            })
            .collect();
        HostDriver {
            binaries,
            record_path: env::var_os(RECORD_ENV).map(PathBuf::from),
        }
    }

    pub fn with_binary(mut self, tool: Tool, binary: impl Into<String>) -> Self {
        self.binaries.insert(tool, binary.into());
        self
    }

    pub fn recording(mut self, path: impl Into<PathBuf>) -> Self {
        self.record_path = Some(path.into());
        self
    }

    fn binary(&self, tool: Tool) -> &str {
        self.binaries
            .get(&tool)
            .map(String::as_str)
            .unwrap_or_else(|| tool.binary())
    }

    fn record(&self, path: &PathBuf, command: &str) -> Result<(), DriverError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| DriverError::Spawn {
                command: command.to_string(),
                source,
            })?;
        writeln!(file, "{command}").map_err(|source| DriverError::Spawn {
            command: command.to_string(),
            source,
        })
    }
}

impl Default for HostDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlPlaneDriver for HostDriver {
    fn run(&self, tool: Tool, args: &[String]) -> Result<Vec<String>, DriverError> {
        let binary = self.binary(tool);
        let mut command = binary.to_string();
        for arg in args {
            command.push(' ');
            command.push_str(arg);
        }

        if let Some(path) = self.record_path.as_ref() {
            self.record(path, &command)?;
            return Ok(Vec::new());
        }

        log_debug("driver", "Running command", &[("command", command.as_str())]);
        let output = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|source| DriverError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            let status = output
                .status
                .code()
                .map(|code| code.to_string())
                .unwrap_or_else(|| "terminated by signal".to_string());
            return Err(DriverError::Failed {
                command,
                status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect())
    }
}
