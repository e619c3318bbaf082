//! Where workers come from.
//!
//! A [`WorkerSource`] yields worker declarations; [`run_discovery`] feeds
//! them into the registry on a fixed interval. Workers that disappear from
//! a source are left in place and fall out of rotation through failed
//! health probes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use charforge_core::worker::{Capability, WorkerSpec};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::registry::WorkerRegistry;

/// RunPod GraphQL endpoint.
pub const RUNPOD_GRAPHQL_URL: &str = "https://api.runpod.io/graphql";

/// Port ComfyUI listens on inside a pod.
const COMFYUI_PORT: u16 = 8188;

const LIST_PODS_QUERY: &str = "query { myself { pods { id name desiredStatus \
    runtime { ports { ip isIpPublic privatePort publicPort } } } } }";

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// The static worker list is not valid JSON.
    #[error("Invalid worker list: {0}")]
    InvalidConfig(#[from] serde_json::Error),

    /// The discovery service could not be reached.
    #[error("Discovery request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The discovery service returned an error payload.
    #[error("Discovery service error: {0}")]
    Service(String),
}

#[async_trait]
pub trait WorkerSource: Send + Sync {
    fn name(&self) -> &str;

    async fn discover(&self) -> Result<Vec<WorkerSpec>, DiscoveryError>;
}

// ---------------------------------------------------------------------------
// Static list
// ---------------------------------------------------------------------------

/// Workers declared in configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticWorkers {
    specs: Vec<WorkerSpec>,
}

impl StaticWorkers {
    pub fn new(specs: Vec<WorkerSpec>) -> Self {
        Self { specs }
    }

    /// Parse a JSON array of worker specs, e.g.
    /// `[{"id":"gpu-01","base_url":"http://10.0.0.5:8188","capabilities":["image"]}]`.
    pub fn from_json(json: &str) -> Result<Self, DiscoveryError> {
        Ok(Self::new(serde_json::from_str(json)?))
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

#[async_trait]
impl WorkerSource for StaticWorkers {
    fn name(&self) -> &str {
        "static"
    }

    async fn discover(&self) -> Result<Vec<WorkerSpec>, DiscoveryError> {
        Ok(self.specs.clone())
    }
}

// ---------------------------------------------------------------------------
// RunPod
// ---------------------------------------------------------------------------

/// Lists RunPod pods and exposes each running pod's public ComfyUI port as
/// a worker.
pub struct RunPodDiscovery {
    http: reqwest::Client,
    api_key: String,
    endpoint: String,
    capabilities: Vec<Capability>,
}

impl RunPodDiscovery {
    /// Pods are assumed to offer every capability.
    pub fn new(http: reqwest::Client, api_key: impl Into<String>) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            endpoint: RUNPOD_GRAPHQL_URL.to_string(),
            capabilities: vec![Capability::Training, Capability::Image, Capability::Video],
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    fn specs_from_pods(&self, pods: Vec<Pod>) -> Vec<WorkerSpec> {
        pods.into_iter()
            .filter(|pod| pod.desired_status.as_deref() == Some("RUNNING"))
            .filter_map(|pod| {
                let url = pod.comfyui_url()?;
                Some(WorkerSpec::new(
                    format!("runpod-{}", pod.id),
                    url,
                    self.capabilities.clone(),
                ))
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    data: Option<PodsData>,
    errors: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct PodsData {
    myself: Option<Myself>,
}

#[derive(Debug, Deserialize)]
struct Myself {
    #[serde(default)]
    pods: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Pod {
    id: String,
    desired_status: Option<String>,
    runtime: Option<PodRuntime>,
}

#[derive(Debug, Deserialize)]
struct PodRuntime {
    #[serde(default)]
    ports: Vec<PodPort>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodPort {
    ip: Option<String>,
    #[serde(default)]
    is_ip_public: bool,
    private_port: Option<u16>,
    public_port: Option<u16>,
}

impl Pod {
    fn comfyui_url(&self) -> Option<String> {
        self.runtime
            .as_ref()?
            .ports
            .iter()
            .filter(|p| p.private_port == Some(COMFYUI_PORT) && p.is_ip_public)
            .find_map(|p| Some(format!("http://{}:{}", p.ip.as_deref()?, p.public_port?)))
    }
}

#[async_trait]
impl WorkerSource for RunPodDiscovery {
    fn name(&self) -> &str {
        "runpod"
    }

    async fn discover(&self) -> Result<Vec<WorkerSpec>, DiscoveryError> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "query": LIST_PODS_QUERY }))
            .send()
            .await?
            .error_for_status()?
            .json::<GraphQlResponse>()
            .await?;

        if let Some(errors) = response.errors {
            return Err(DiscoveryError::Service(errors.to_string()));
        }

        let pods = response
            .data
            .and_then(|d| d.myself)
            .map(|m| m.pods)
            .unwrap_or_default();
        Ok(self.specs_from_pods(pods))
    }
}

// ---------------------------------------------------------------------------
// Refresh loop
// ---------------------------------------------------------------------------

/// Run every source once and register what they return.
///
/// Returns the number of workers registered. Source failures and invalid
/// declarations are logged and skipped.
pub async fn refresh_once(registry: &WorkerRegistry, sources: &[Arc<dyn WorkerSource>]) -> usize {
    let mut registered = 0;
    for source in sources {
        match source.discover().await {
            Ok(specs) => {
                for spec in specs {
                    let id = spec.id.clone();
                    match registry.register(spec) {
                        Ok(()) => registered += 1,
                        Err(e) => tracing::warn!(
                            source = source.name(),
                            worker_id = %id,
                            error = %e,
                            "Ignoring invalid worker declaration",
                        ),
                    }
                }
            }
            Err(e) => {
                tracing::error!(source = source.name(), error = %e, "Worker discovery failed");
            }
        }
    }
    registered
}

/// Refresh the registry from `sources` every `interval` until `cancel`
/// fires.
pub async fn run_discovery(
    registry: Arc<WorkerRegistry>,
    sources: Vec<Arc<dyn WorkerSource>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Worker discovery shutting down");
                break;
            }
            _ = ticker.tick() => {
                let registered = refresh_once(&registry, &sources).await;
                tracing::debug!(registered, "Worker discovery refreshed");
            }
        }
    }
}
