use std::sync::Arc;

use charforge_db::DbPool;
use charforge_pipeline::{Orchestrator, WorkerRegistry};

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable; everything inside is behind an `Arc` or already `Clone`.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Set when the ledger is backed by Postgres.
    pub db: Option<DbPool>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        self.orchestrator.registry()
    }
}
