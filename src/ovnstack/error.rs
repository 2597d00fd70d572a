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


use crate::ovnstack::ovsdb::DriverError;
use std::error::Error;
use std::fmt;
use std::io;
use std::path::PathBuf;

pub type DynError = Box<dyn Error + Send + Sync>;

/// Failure surfaced by provisioning and attachment procedures.
///
/// Every variant names the step or resource that failed. Nothing is retried
/// and nothing already applied is rolled back; re-running the procedure is the
/// recovery path.
#[derive(Debug)]
pub enum OverlayError {
    /// Missing or invalid parameter, violated flag combination, or an unmet
    /// precondition such as an unbootstrapped cluster.
    Config(String),
    ControlPlane {
        step: String,
        source: DriverError,
    },
    PoolExhausted {
        pool: String,
    },
    MetadataTimeout {
        namespace: String,
        pod: String,
        attempts: u32,
    },
    Metadata {
        context: String,
        source: DynError,
    },
    Namespace {
        context: String,
        source: DynError,
    },
    /// The namespace handle could not be opened because it no longer exists.
    NamespaceGone {
        path: PathBuf,
    },
    Io {
        context: String,
        source: io::Error,
    },
}

impl OverlayError {
    pub fn config(message: impl Into<String>) -> Self {
        OverlayError::Config(message.into())
    }

    pub fn control_plane(step: impl Into<String>, source: DriverError) -> Self {
        OverlayError::ControlPlane {
            step: step.into(),
            source,
        }
    }

    pub fn namespace(context: impl Into<String>, source: impl Into<DynError>) -> Self {
        OverlayError::Namespace {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn metadata(context: impl Into<String>, source: impl Into<DynError>) -> Self {
        OverlayError::Metadata {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        OverlayError::Io {
            context: context.into(),
            source,
        }
    }

    /// Short category label used in log metadata and CNI error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            OverlayError::Config(_) => "config",
            OverlayError::ControlPlane { .. } => "control-plane",
            OverlayError::PoolExhausted { .. } => "pool-exhausted",
            OverlayError::MetadataTimeout { .. } => "metadata-timeout",
            OverlayError::Metadata { .. } => "metadata",
            OverlayError::Namespace { .. } | OverlayError::NamespaceGone { .. } => "namespace",
            OverlayError::Io { .. } => "io",
        }
    }
}

impl fmt::Display for OverlayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverlayError::Config(message) => f.write_str(message),
            OverlayError::ControlPlane { step, source } => write!(f, "{step}: {source}"),
            OverlayError::PoolExhausted { pool } => {
                write!(f, "address pool {pool} has no unused addresses")
            }
            OverlayError::MetadataTimeout {
                namespace,
                pod,
                attempts,
            } => write!(
                f,
                "pod {namespace}/{pod} has no ovn annotation after {attempts} attempts"
            ),
            OverlayError::Metadata { context, source }
            | OverlayError::Namespace { context, source } => write!(f, "{context}: {source}"),
            OverlayError::NamespaceGone { path } => {
                write!(f, "network namespace {} does not exist", path.display())
            }
            OverlayError::Io { context, source } => write!(f, "{context}: {source}"),
        }
    }
}

impl Error for OverlayError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            OverlayError::ControlPlane { source, .. } => Some(source),
            OverlayError::Metadata { source, .. } | OverlayError::Namespace { source, .. } => {
                Some(source.as_ref())
            }
            OverlayError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Attaches the provisioning step name to a driver failure.
pub trait StepContext<T> {
    fn step(self, step: impl Into<String>) -> Result<T, OverlayError>;
}

impl<T> StepContext<T> for Result<T, DriverError> {
    fn step(self, step: impl Into<String>) -> Result<T, OverlayError> {
        self.map_err(|source| OverlayError::control_plane(step, source))
    }
}

#[derive(Debug)]
struct Detail(String);

impl fmt::Display for Detail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for Detail {}

/// Boxes a plain message so it can serve as an error source.
pub fn detail(message: impl Into<String>) -> DynError {
    Box::new(Detail(message.into()))
}
