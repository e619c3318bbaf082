use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use charforge_comfyui::client::{ComfyUIWorkerClient, WorkerClient};
use charforge_comfyui::driver::RemoteJobDriver;
use charforge_core::ledger::{JobLedger, MemoryLedger};
use charforge_db::ledger::PgJobLedger;
use charforge_db::DbPool;
use charforge_pipeline::discovery::{
    refresh_once, run_discovery, RunPodDiscovery, StaticWorkers, WorkerSource,
};
use charforge_pipeline::{Orchestrator, WorkerRegistry};
use charforge_storage::build_store;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use charforge_api::config::AppConfig;
use charforge_api::router::build_app_router;
use charforge_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Configuration ---
    let config = AppConfig::from_env().context("Invalid configuration")?;

    // --- Tracing ---
    init_tracing(config.log_json);
    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        workers = config.workers.len(),
        runpod = config.runpod_api_key.is_some(),
        "Loaded configuration",
    );

    // --- Ledger ---
    let (ledger, db) = open_ledger(config.database_url.as_deref()).await?;

    // --- Artifact storage ---
    let http = reqwest::Client::new();
    let store = build_store(&config.storage, http.clone())
        .await
        .context("Failed to configure artifact storage")?;

    // --- Workers ---
    let client: Arc<dyn WorkerClient> = Arc::new(ComfyUIWorkerClient::with_client(
        http.clone(),
        config.probe_timeout,
    ));
    let registry = Arc::new(WorkerRegistry::new(client.clone(), config.registry.clone()));

    let mut sources: Vec<Arc<dyn WorkerSource>> =
        vec![Arc::new(StaticWorkers::new(config.workers.clone()))];
    if let Some(api_key) = &config.runpod_api_key {
        sources.push(Arc::new(RunPodDiscovery::new(http.clone(), api_key.clone())));
    }
    let registered = refresh_once(&registry, &sources).await;
    registry.check_all().await;
    tracing::info!(registered, "Initial worker discovery complete");

    // --- Orchestrator ---
    let driver = Arc::new(RemoteJobDriver::new(client, config.driver.clone()));
    let orchestrator = Orchestrator::new(
        config.orchestrator.clone(),
        ledger,
        registry.clone(),
        driver,
        store,
    );
    let resumed = orchestrator
        .resume()
        .await
        .context("Failed to resume jobs from the ledger")?;
    tracing::info!(resumed, "Resumed active jobs");

    // --- Background loops ---
    let background = CancellationToken::new();
    let scheduler_handle = tokio::spawn(orchestrator.clone().run());
    let monitor_handle = {
        let registry = registry.clone();
        let cancel = background.clone();
        let interval = config.health_check_interval;
        tokio::spawn(async move { registry.run_health_monitor(interval, cancel).await })
    };
    let discovery_handle = tokio::spawn(run_discovery(
        registry.clone(),
        sources,
        config.discovery_interval,
        background.clone(),
    ));

    // --- App state ---
    let state = AppState {
        orchestrator: orchestrator.clone(),
        db,
        config: Arc::new(config.server.clone()),
    };
    let app = build_app_router(state, &config.server);

    // --- Start server ---
    let host: IpAddr = config
        .server
        .host
        .parse()
        .with_context(|| format!("Invalid HOST address '{}'", config.server.host))?;
    let addr = SocketAddr::new(host, config.server.port);
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    let drain = Duration::from_secs(config.server.shutdown_timeout_secs);
    if orchestrator.shutdown(drain).await {
        tracing::info!("Job tasks stopped");
    } else {
        tracing::warn!(
            timeout_secs = drain.as_secs(),
            "Job tasks still running at shutdown; their jobs resume on next start",
        );
    }

    background.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), scheduler_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), monitor_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), discovery_handle).await;
    tracing::info!("Background loops stopped");

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "charforge_api=debug,charforge_pipeline=debug,tower_http=debug".into()
    });
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Postgres when `database_url` is set, otherwise a process-local ledger.
async fn open_ledger(
    database_url: Option<&str>,
) -> anyhow::Result<(Arc<dyn JobLedger>, Option<DbPool>)> {
    let Some(url) = database_url else {
        tracing::warn!("DATABASE_URL not set, jobs will not survive a restart");
        let ledger: Arc<dyn JobLedger> = Arc::new(MemoryLedger::new());
        return Ok((ledger, None));
    };

    let pool = charforge_db::create_pool(url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connection pool created");

    charforge_db::health_check(&pool)
        .await
        .context("Database health check failed")?;

    charforge_db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations applied");

    let ledger: Arc<dyn JobLedger> = Arc::new(PgJobLedger::new(pool.clone()));
    Ok((ledger, Some(pool)))
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
