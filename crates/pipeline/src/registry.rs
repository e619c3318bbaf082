//! Registry of GPU workers, their health and their current load.
//!
//! Each worker sits behind its own mutex inside a read-mostly map, so
//! reserving a slot on one worker never blocks another. Locks are only
//! held for field updates; probes run with no lock held.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use charforge_comfyui::client::WorkerClient;
use charforge_core::error::CoreError;
use charforge_core::types::WorkerId;
use charforge_core::worker::{Capability, Worker, WorkerHealth, WorkerSpec};
use chrono::Utc;
use tokio_util::sync::CancellationToken;

/// Default number of consecutive failed probes before a worker is
/// considered unreachable.
pub const DEFAULT_UNREACHABLE_AFTER: u32 = 2;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub unreachable_after: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            unreachable_after: DEFAULT_UNREACHABLE_AFTER,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No worker with this id is registered.
    #[error("Worker '{0}' is not registered")]
    NotFound(WorkerId),

    /// The worker is not healthy.
    #[error("Worker '{0}' is not healthy")]
    Unavailable(WorkerId),

    /// Every slot of the worker is taken.
    #[error("Worker '{0}' has no free slot")]
    Saturated(WorkerId),

    /// The worker declaration is invalid.
    #[error(transparent)]
    Invalid(#[from] CoreError),
}

fn lock(worker: &Mutex<Worker>) -> MutexGuard<'_, Worker> {
    worker.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct WorkerRegistry {
    workers: RwLock<HashMap<WorkerId, Arc<Mutex<Worker>>>>,
    client: Arc<dyn WorkerClient>,
    config: RegistryConfig,
}

impl WorkerRegistry {
    pub fn new(client: Arc<dyn WorkerClient>, config: RegistryConfig) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            client,
            config,
        }
    }

    fn entry(&self, id: &str) -> Option<Arc<Mutex<Worker>>> {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn entries(&self) -> Vec<Arc<Mutex<Worker>>> {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    /// Add a worker, or update the address, capabilities and slots of an
    /// existing one. Load and health of an existing entry are kept.
    pub fn register(&self, spec: WorkerSpec) -> Result<(), RegistryError> {
        spec.validate()?;

        if let Some(existing) = self.entry(&spec.id) {
            let mut worker = lock(&existing);
            if worker.base_url != spec.base_url {
                tracing::info!(
                    worker_id = %spec.id,
                    old_url = %worker.base_url,
                    new_url = %spec.base_url,
                    "Worker address changed",
                );
            }
            worker.base_url = spec.base_url;
            worker.capabilities = spec.capabilities;
            worker.slots = spec.slots;
            return Ok(());
        }

        let mut workers = self.workers.write().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have inserted the same id since the read above.
        if let Some(existing) = workers.get(&spec.id) {
            let mut worker = lock(existing);
            worker.base_url = spec.base_url;
            worker.capabilities = spec.capabilities;
            worker.slots = spec.slots;
            return Ok(());
        }

        tracing::info!(
            worker_id = %spec.id,
            base_url = %spec.base_url,
            capabilities = ?spec.capabilities,
            slots = spec.slots,
            "Worker registered",
        );
        let id = spec.id.clone();
        workers.insert(id, Arc::new(Mutex::new(Worker::from_spec(spec))));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Worker> {
        self.entry(id).map(|w| lock(&w).clone())
    }

    /// Snapshot of every worker, ordered by id.
    pub fn list(&self) -> Vec<Worker> {
        let mut workers: Vec<Worker> = self.entries().iter().map(|w| lock(w).clone()).collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        workers
    }

    /// Healthy workers with `capability` and a free slot, least loaded
    /// first, then most recently confirmed healthy.
    pub fn list_healthy(&self, capability: Capability) -> Vec<Worker> {
        let mut healthy: Vec<Worker> = self
            .entries()
            .iter()
            .map(|w| lock(w).clone())
            .filter(|w| {
                w.health == WorkerHealth::Healthy && w.has_capability(capability) && w.has_free_slot()
            })
            .collect();
        healthy.sort_by(|a, b| {
            a.load
                .cmp(&b.load)
                .then_with(|| b.last_healthy_at.cmp(&a.last_healthy_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        healthy
    }

    // -----------------------------------------------------------------------
    // Load accounting
    // -----------------------------------------------------------------------

    /// Take one slot on a healthy worker.
    pub fn reserve(&self, id: &str) -> Result<Worker, RegistryError> {
        let entry = self
            .entry(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        let mut worker = lock(&entry);
        if worker.health != WorkerHealth::Healthy {
            return Err(RegistryError::Unavailable(worker.id.clone()));
        }
        if !worker.has_free_slot() {
            return Err(RegistryError::Saturated(worker.id.clone()));
        }
        worker.load += 1;
        Ok(worker.clone())
    }

    /// Reserve a slot on the best worker for `capability`, if any.
    pub fn reserve_for(&self, capability: Capability) -> Option<Worker> {
        // A candidate can be taken between listing and reserving; try the next.
        self.list_healthy(capability)
            .into_iter()
            .find_map(|candidate| self.reserve(&candidate.id).ok())
    }

    /// Restore a reservation for a job that was already running on the
    /// worker before a restart. Health and free slots are not checked.
    pub fn adopt(&self, id: &str) -> Result<Worker, RegistryError> {
        let entry = self
            .entry(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        let mut worker = lock(&entry);
        worker.load += 1;
        Ok(worker.clone())
    }

    /// Give back one slot. Never underflows.
    pub fn release(&self, id: &str) {
        let Some(entry) = self.entry(id) else {
            tracing::warn!(worker_id = %id, "Release for unknown worker ignored");
            return;
        };
        let mut worker = lock(&entry);
        if worker.load == 0 {
            tracing::warn!(worker_id = %id, "Release with zero load ignored");
            return;
        }
        worker.load -= 1;
    }

    // -----------------------------------------------------------------------
    // Health
    // -----------------------------------------------------------------------

    /// Probe one worker and record the result.
    ///
    /// A failed probe never touches jobs already assigned to the worker.
    pub async fn health_check(&self, id: &str) -> Result<WorkerHealth, RegistryError> {
        let entry = self
            .entry(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        let snapshot = lock(&entry).clone();

        let result = self.client.probe(&snapshot).await;
        let now = Utc::now();

        let mut worker = lock(&entry);
        let previous = worker.health;
        worker.last_health_check = Some(now);

        match result {
            Ok(()) => {
                worker.consecutive_failures = 0;
                worker.last_healthy_at = Some(now);
                worker.health = WorkerHealth::Healthy;
                if previous != WorkerHealth::Healthy {
                    tracing::info!(worker_id = %worker.id, "Worker is healthy");
                }
            }
            Err(e) => {
                worker.consecutive_failures += 1;
                if worker.consecutive_failures >= self.config.unreachable_after {
                    worker.health = WorkerHealth::Unreachable;
                }
                if previous != WorkerHealth::Unreachable
                    && worker.health == WorkerHealth::Unreachable
                {
                    tracing::warn!(
                        worker_id = %worker.id,
                        failures = worker.consecutive_failures,
                        load = worker.load,
                        error = %e,
                        "Worker marked unreachable",
                    );
                } else {
                    tracing::debug!(
                        worker_id = %worker.id,
                        failures = worker.consecutive_failures,
                        error = %e,
                        "Health probe failed",
                    );
                }
            }
        }

        Ok(worker.health)
    }

    /// Probe every registered worker concurrently.
    pub async fn check_all(&self) {
        let ids: Vec<WorkerId> = self.list().into_iter().map(|w| w.id).collect();
        let checks = ids.iter().map(|id| self.health_check(id));
        futures::future::join_all(checks).await;
    }

    /// Run [`check_all`](Self::check_all) every `interval` until `cancel`
    /// fires.
    pub async fn run_health_monitor(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            interval_secs = interval.as_secs(),
            "Worker health monitor started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Worker health monitor shutting down");
                    break;
                }
                _ = ticker.tick() => self.check_all().await,
            }
        }
    }
}

/// A slot held on a worker, given back when dropped.
pub struct Reservation {
    registry: Arc<WorkerRegistry>,
    worker: Worker,
}

impl Reservation {
    /// Wrap a slot already taken with [`WorkerRegistry::reserve`] or
    /// [`WorkerRegistry::adopt`].
    pub fn new(registry: Arc<WorkerRegistry>, worker: Worker) -> Self {
        Self { registry, worker }
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.registry.release(&self.worker.id);
    }
}
