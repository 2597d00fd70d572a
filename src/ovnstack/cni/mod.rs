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


//! Container network attachment: the CNI entry points, the pinned namespace
//! context, the pod address lookup, and plugin installation.

pub mod install;
pub mod metadata;
pub mod netns;
pub mod network;
pub mod provider;
pub mod types;

pub use metadata::{HostMetadataResolver, HttpMetadataResolver, MetadataResolver, PodNetwork};
pub use netns::{run_pinned, EnteredNamespace, HostNamespaces, NamespaceSwitch};
pub use network::{InterfaceAttacher, PortBinding};
pub use provider::{CniPlugin, OvnCniPlugin};
pub use types::{CniResult, NetConf};
