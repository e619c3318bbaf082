#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use charforge_api::config::ServerConfig;
use charforge_api::router::build_app_router;
use charforge_api::state::AppState;
use charforge_comfyui::driver::{DriverConfig, RemoteJobDriver};
use charforge_core::job::{Job, RemoteArtifact};
use charforge_core::ledger::MemoryLedger;
use charforge_core::worker::{Capability, WorkerSpec};
use charforge_pipeline::{Orchestrator, OrchestratorConfig, RegistryConfig, WorkerRegistry};
use charforge_storage::{ArtifactStore, StorageBackend};
use charforge_testkit::{MemoryBackend, MockWorkerClient};
use http_body_util::BodyExt;
use tower::ServiceExt;

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..ServerConfig::default()
    }
}

pub struct TestApp {
    pub router: Router,
    pub orchestrator: Arc<Orchestrator>,
    pub client: Arc<MockWorkerClient>,
}

impl TestApp {
    pub fn app(&self) -> Router {
        self.router.clone()
    }
}

pub fn artifact() -> RemoteArtifact {
    RemoteArtifact {
        filename: "out.png".into(),
        subfolder: String::new(),
        folder_type: "output".into(),
    }
}

/// Build the application router over in-memory doubles.
///
/// The scheduling loop is not started, so submitted jobs stay `queued`
/// unless a test drives them. `seed` jobs are loaded as if the process had
/// just restarted.
pub async fn build_test_app(seed: Vec<Job>) -> TestApp {
    let client = Arc::new(MockWorkerClient::completing_with(artifact()));
    let registry = Arc::new(WorkerRegistry::new(client.clone(), RegistryConfig::default()));
    registry
        .register(WorkerSpec::new(
            "gpu-01",
            "http://gpu-01:8188",
            vec![Capability::Image, Capability::Video],
        ))
        .unwrap();
    registry
        .register(WorkerSpec::new("gpu-02", "http://gpu-02:8188", vec![Capability::Training]))
        .unwrap();
    registry.check_all().await;

    let backends: Vec<Arc<dyn StorageBackend>> = vec![Arc::new(MemoryBackend::new("primary"))];
    let driver = Arc::new(RemoteJobDriver::new(client.clone(), DriverConfig::default()));
    let orchestrator = Orchestrator::new(
        OrchestratorConfig::default(),
        Arc::new(MemoryLedger::with_jobs(seed)),
        registry,
        driver,
        ArtifactStore::new(backends),
    );
    orchestrator.resume().await.unwrap();

    let config = test_config();
    let state = AppState {
        orchestrator: orchestrator.clone(),
        db: None,
        config: Arc::new(config.clone()),
    };

    TestApp {
        router: build_app_router(state, &config),
        orchestrator,
        client,
    }
}

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    send(app, Method::GET, uri, Body::empty()).await
}

pub async fn post(app: Router, uri: &str) -> Response<Body> {
    send(app, Method::POST, uri, Body::empty()).await
}

pub async fn post_json(app: Router, uri: &str, body: serde_json::Value) -> Response<Body> {
    send(app, Method::POST, uri, Body::from(body.to_string())).await
}

async fn send(app: Router, method: Method, uri: &str, body: Body) -> Response<Body> {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body)
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
