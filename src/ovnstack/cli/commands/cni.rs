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


use std::collections::HashMap;
use std::env;
use std::io::{self, Read};
use std::sync::Arc;

use serde::Serialize;

use crate::ovnstack::cli::args::OvnCni;
use crate::ovnstack::cli::Terminal;
use crate::ovnstack::cni::types::{CniCommand, CniErrorReply, VersionReply, DEFAULT_CNI_VERSION};
use crate::ovnstack::cni::{
    CniPlugin, HostMetadataResolver, HostNamespaces, InterfaceAttacher, OvnCniPlugin,
};
use crate::ovnstack::config::OverlayConfig;
use crate::ovnstack::error::OverlayError;
use crate::ovnstack::logger::{
    log_error, set_log_destination, set_log_level, LogDestination, LogLevel,
};
use crate::ovnstack::observability::tracing;
use crate::ovnstack::ovsdb::{ControlPlaneDriver, HostDriver};

/// Runs one CNI invocation and returns the process exit code. The result or
/// error document is the only thing written to stdout.
pub async fn run_cni(cli: &OvnCni) -> i32 {
    set_log_destination(LogDestination::Stderr);
    if cli.verbose {
        set_log_level(LogLevel::Debug);
    }
    tracing::init();

    let env: HashMap<String, String> = env::vars().collect();
    let command = match CniCommand::parse(env.get("CNI_COMMAND").map(String::as_str).unwrap_or("")) {
        Ok(command) => command,
        Err(err) => return report_error(DEFAULT_CNI_VERSION, &err),
    };
    if command == CniCommand::Version {
        print_json(&VersionReply::default());
        return 0;
    }

    let mut config = Vec::new();
    if let Err(source) = io::stdin().read_to_end(&mut config) {
        let err = OverlayError::io("read network configuration from stdin", source);
        return report_error(DEFAULT_CNI_VERSION, &err);
    }
    let version = requested_version(&config);

    let plugin = host_plugin(OverlayConfig::from_env());
    let outcome = match command {
        CniCommand::Add => plugin.add(&env, config).await.map(|result| print_json(&result)),
        _ => plugin.delete(&env, config).await,
    };
    match outcome {
        Ok(()) => 0,
        Err(err) => report_error(&version, &err),
    }
}

fn host_plugin(config: OverlayConfig) -> OvnCniPlugin {
    let driver: Arc<dyn ControlPlaneDriver> = Arc::new(HostDriver::new());
    let resolver = Arc::new(HostMetadataResolver::new(
        Arc::clone(&driver),
        config.api_server.clone(),
    ));
    let attacher = InterfaceAttacher::new(driver, Arc::new(HostNamespaces), config.clone());
    OvnCniPlugin::new(attacher, resolver, config)
}

fn requested_version(config: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(config)
        .ok()
        .and_then(|value| {
            value
                .get("cniVersion")
                .and_then(|version| version.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| DEFAULT_CNI_VERSION.to_string())
}

fn report_error(version: &str, err: &OverlayError) -> i32 {
    log_error("cni", "CNI command failed", &[("error", &err.to_string())]);
    print_json(&CniErrorReply::from_error(version, err));
    1
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(body) => Terminal::stdout(format_args!("{body}")),
        Err(err) => Terminal::error(format_args!("failed to encode CNI reply: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_version_follows_the_request() {
        assert_eq!(requested_version(br#"{"cniVersion":"0.4.0"}"#), "0.4.0");
        assert_eq!(requested_version(b"not json"), DEFAULT_CNI_VERSION);
        assert_eq!(requested_version(b""), DEFAULT_CNI_VERSION);
    }
}
