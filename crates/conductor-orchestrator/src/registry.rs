use conductor_core::{ConductorError, ConductorResult};
use futures_util::future::join_all;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{info, warn};

use crate::monitor::WorkerMonitor;
use crate::types::Task;
use crate::worker::{Worker, WorkerDescriptor};

/// Registration-ordered collection of workers.
///
/// Read-mostly: lookups take a shared lock and clone the `Arc`s out, so no
/// lock is held while a worker runs.
pub struct WorkerRegistry {
    workers: RwLock<Vec<Arc<dyn Worker>>>,
    monitor: Arc<WorkerMonitor>,
}

impl WorkerRegistry {
    /// Empty registry with its own monitor.
    pub fn new() -> Self {
        Self {
            workers: RwLock::new(Vec::new()),
            monitor: Arc::new(WorkerMonitor::new()),
        }
    }

    /// Health and metrics of the registered workers.
    pub fn monitor(&self) -> &Arc<WorkerMonitor> {
        &self.monitor
    }

    /// Add a worker. Ids must be unique and non-empty.
    pub fn register(&self, worker: Arc<dyn Worker>) -> ConductorResult<()> {
        let profile = worker.profile();
        if profile.id.trim().is_empty() {
            return Err(ConductorError::InvalidArgument(
                "worker id must not be empty".into(),
            ));
        }
        if profile.worker_type.trim().is_empty() {
            return Err(ConductorError::InvalidArgument(format!(
                "worker '{}' has an empty worker type",
                profile.id
            )));
        }
        let mut workers = self.workers.write();
        if workers.iter().any(|w| w.profile().id == profile.id) {
            return Err(ConductorError::InvalidArgument(format!(
                "worker '{}' is already registered",
                profile.id
            )));
        }
        self.monitor.track(&profile.id);
        info!(worker = %profile.id, worker_type = %profile.worker_type, "Worker registered");
        workers.push(worker);
        Ok(())
    }

    /// Remove a worker and forget its health state.
    pub fn unregister(&self, worker_id: &str) -> Option<Arc<dyn Worker>> {
        let mut workers = self.workers.write();
        let pos = workers.iter().position(|w| w.profile().id == worker_id)?;
        self.monitor.forget(worker_id);
        info!(worker = %worker_id, "Worker unregistered");
        Some(workers.remove(pos))
    }

    /// Worker with id `worker_id`, healthy or not.
    pub fn get(&self, worker_id: &str) -> Option<Arc<dyn Worker>> {
        self.workers
            .read()
            .iter()
            .find(|w| w.profile().id == worker_id)
            .cloned()
    }

    /// Whether `worker_id` is registered.
    pub fn has(&self, worker_id: &str) -> bool {
        self.get(worker_id).is_some()
    }

    /// Available, healthy workers of `worker_type`, in registration order.
    pub fn get_by_type(&self, worker_type: &str) -> Vec<Arc<dyn Worker>> {
        self.workers
            .read()
            .iter()
            .filter(|w| {
                w.profile().worker_type == worker_type
                    && w.is_available()
                    && self.monitor.is_healthy(&w.profile().id)
            })
            .cloned()
            .collect()
    }

    /// Workers that may run `task` right now.
    pub fn eligible(&self, task: &Task) -> Vec<Arc<dyn Worker>> {
        self.get_by_type(&task.worker_type)
            .into_iter()
            .filter(|w| w.can_handle(task))
            .collect()
    }

    /// Resolve the worker type for a request.
    ///
    /// An explicit type wins. Otherwise the type of the first available
    /// worker covering every required capability is used.
    pub fn suggest_worker_type(
        &self,
        worker_type: Option<&str>,
        required_capabilities: &[String],
    ) -> Option<String> {
        if let Some(t) = worker_type.filter(|t| !t.trim().is_empty()) {
            return Some(t.to_string());
        }
        if required_capabilities.is_empty() {
            return None;
        }
        self.workers
            .read()
            .iter()
            .find(|w| w.is_available() && w.profile().covers(required_capabilities))
            .map(|w| w.profile().worker_type.clone())
    }

    /// Every worker, in registration order.
    pub fn all(&self) -> Vec<Arc<dyn Worker>> {
        self.workers.read().clone()
    }

    /// Routing snapshots of every worker.
    pub fn descriptors(&self) -> Vec<WorkerDescriptor> {
        self.workers
            .read()
            .iter()
            .map(|w| WorkerDescriptor::of(w.as_ref()))
            .collect()
    }

    /// Number of registered workers.
    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    /// Whether no worker is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call `initialize` on every worker in registration order, stopping at
    /// the first failure.
    pub async fn initialize_all(&self) -> ConductorResult<()> {
        for worker in self.all() {
            let id = worker.profile().id.clone();
            worker.initialize().await.map_err(|e| {
                ConductorError::Lifecycle(format!("worker '{id}' failed to initialize: {e}"))
            })?;
        }
        Ok(())
    }

    /// Call `shutdown` on every worker. Failures are logged, not returned.
    pub async fn shutdown_all(&self) {
        for worker in self.all() {
            if let Err(e) = worker.shutdown().await {
                warn!(worker = %worker.profile().id, error = %e, "Worker shutdown failed");
            }
        }
    }

    /// Probe every worker concurrently and record the results in the monitor.
    /// Returns `true` if at least one worker recovered.
    pub async fn check_health(&self) -> bool {
        let workers = self.all();
        let probes = workers.iter().map(|w| async move {
            let healthy = w.health_check().await;
            (w.profile().id.clone(), healthy)
        });
        let mut recovered = false;
        for (id, healthy) in join_all(probes).await {
            if !healthy {
                warn!(worker = %id, "Worker failed health check");
            }
            if self.monitor.set_health(&id, healthy) {
                info!(worker = %id, "Worker recovered");
                recovered = true;
            }
        }
        recovered
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
