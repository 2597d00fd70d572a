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


//! Pod network assignment lookup. The controller writes the pod's MAC, IP
//! and gateway into its `ovn` annotation; the plugin polls the API server
//! until that annotation appears.

use crate::ovnstack::error::{detail, OverlayError, StepContext};
use crate::ovnstack::ipam::{bare_address, Cidr};
use crate::ovnstack::logger::log_debug;
use crate::ovnstack::ovsdb::{ControlPlaneDriver, SwitchDb};
use reqwest::{Client, StatusCode, Url};
use serde_json::{Map, Value};
use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

pub const OVN_ANNOTATION: &str = "ovn";

pub type Annotations = Map<String, Value>;
pub type MetadataFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Annotations, OverlayError>> + Send + 'a>>;

/// Fetches a pod's annotations.
pub trait MetadataResolver: Send + Sync {
    fn resolve<'a>(&'a self, namespace: &'a str, pod: &'a str) -> MetadataFuture<'a>;
}

/// Reads annotations from the Kubernetes API server.
pub struct HttpMetadataResolver {
    client: Client,
    base_url: Url,
}

impl HttpMetadataResolver {
    pub fn new(server: &str) -> Result<Self, OverlayError> {
        let normalized = normalize_server(server);
        let base_url = Url::parse(&normalized).map_err(|err| {
            OverlayError::config(format!("invalid API server address '{server}': {err}"))
        })?;
        let client = Client::builder()
            .build()
            .map_err(|err| OverlayError::metadata("build HTTP client", err))?;
        Ok(HttpMetadataResolver { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn pod_url(&self, namespace: &str, pod: &str) -> Result<Url, OverlayError> {
        let path = format!("api/v1/namespaces/{namespace}/pods/{pod}");
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            let with_slash = format!("{}/", base.path());
            base.set_path(&with_slash);
        }
        base.join(&path)
            .map_err(|err| OverlayError::config(format!("invalid pod URL for {namespace}/{pod}: {err}")))
    }

    async fn fetch(&self, namespace: &str, pod: &str) -> Result<Annotations, OverlayError> {
        let url = self.pod_url(namespace, pod)?;
        let context = format!("GET {url}");
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|err| OverlayError::metadata(context.clone(), err))?;
        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(OverlayError::metadata(
                context,
                detail(format!("unexpected status {status}: {}", body.trim())),
            ));
        }
        let document: Value = response
            .json()
            .await
            .map_err(|err| OverlayError::metadata(context.clone(), err))?;
        Ok(document
            .get("metadata")
            .and_then(|metadata| metadata.get("annotations"))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default())
    }
}

impl MetadataResolver for HttpMetadataResolver {
    fn resolve<'a>(&'a self, namespace: &'a str, pod: &'a str) -> MetadataFuture<'a> {
        Box::pin(self.fetch(namespace, pod))
    }
}

pub const API_SERVER_KEY: &str = "k8s-api-server";

/// Finds the API server on first use: the configured address when set,
/// otherwise `external_ids:k8s-api-server` of the local switch database.
pub struct HostMetadataResolver {
    driver: Arc<dyn ControlPlaneDriver>,
    configured: Option<String>,
    http: Mutex<Option<Arc<HttpMetadataResolver>>>,
}

impl HostMetadataResolver {
    pub fn new(driver: Arc<dyn ControlPlaneDriver>, configured: Option<String>) -> Self {
        HostMetadataResolver {
            driver,
            configured,
            http: Mutex::new(None),
        }
    }

    fn http(&self) -> Result<Arc<HttpMetadataResolver>, OverlayError> {
        let mut cached = self
            .http
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(http) = cached.as_ref() {
            return Ok(Arc::clone(http));
        }
        let server = match self.configured.clone() {
            Some(server) => server,
            None => SwitchDb::new(self.driver.as_ref())
                .system_external_id(API_SERVER_KEY)
                .step("read k8s-api-server")?
                .ok_or_else(|| {
                    OverlayError::config(format!(
                        "API server unknown: set OVNSTACK_API_SERVER or external_ids:{API_SERVER_KEY}"
                    ))
                })?,
        };
        let http = Arc::new(HttpMetadataResolver::new(&server)?);
        *cached = Some(Arc::clone(&http));
        Ok(http)
    }
}

impl MetadataResolver for HostMetadataResolver {
    fn resolve<'a>(&'a self, namespace: &'a str, pod: &'a str) -> MetadataFuture<'a> {
        Box::pin(async move {
            let http = self.http()?;
            http.fetch(namespace, pod).await
        })
    }
}

/// Prefixes `http://` when the address carries no scheme.
pub fn normalize_server(server: &str) -> String {
    let trimmed = server.trim().trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

/// Addresses assigned to a pod by the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodNetwork {
    pub mac: String,
    pub address: Cidr,
    pub gateway: Ipv4Addr,
}

/// Extracts the pod network from annotations. `Ok(None)` means the
/// annotation has not been written yet; a present but incomplete annotation
/// is a configuration error.
pub fn pod_network(annotations: &Annotations) -> Result<Option<PodNetwork>, OverlayError> {
    let Some(raw) = annotations.get(OVN_ANNOTATION) else {
        return Ok(None);
    };
    let decoded;
    let fields = match raw {
        Value::Object(map) => map,
        Value::String(text) => {
            decoded = serde_json::from_str::<Value>(text).map_err(|err| {
                OverlayError::config(format!("ovn annotation is not valid JSON: {err}"))
            })?;
            decoded.as_object().ok_or_else(|| {
                OverlayError::config("ovn annotation must be a JSON object")
            })?
        }
        _ => return Err(OverlayError::config("ovn annotation must be a JSON object")),
    };
    let field = |key: &str| {
        fields
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| OverlayError::config(format!("ovn annotation is missing {key}")))
    };

    let mac = field("mac_address")?.to_string();
    let address = Cidr::parse(field("ip_address")?)?;
    let gateway_raw = field("gateway_ip")?;
    let gateway = bare_address(gateway_raw).parse::<Ipv4Addr>().map_err(|err| {
        OverlayError::config(format!("invalid gateway_ip '{gateway_raw}': {err}"))
    })?;
    Ok(Some(PodNetwork {
        mac,
        address,
        gateway,
    }))
}

/// Polls until the pod's `ovn` annotation is present, at most `attempts`
/// times, `interval` apart. Fetch failures end the wait immediately.
pub async fn wait_for_pod_network(
    resolver: &dyn MetadataResolver,
    namespace: &str,
    pod: &str,
    attempts: u32,
    interval: Duration,
) -> Result<PodNetwork, OverlayError> {
    for attempt in 1..=attempts {
        let annotations = resolver.resolve(namespace, pod).await?;
        if let Some(network) = pod_network(&annotations)? {
            return Ok(network);
        }
        log_debug(
            "metadata",
            "Pod annotation not yet present",
            &[
                ("namespace", namespace),
                ("pod", pod),
                ("attempt", &attempt.to_string()),
            ],
        );
        if attempt < attempts {
            sleep(interval).await;
        }
    }
    Err(OverlayError::MetadataTimeout {
        namespace: namespace.to_string(),
        pod: pod.to_string(),
        attempts,
    })
}
