//! Control surface: owns the component tree (pool, catalog, store, error
//! plane), spawns the engine for a run, and exposes the start/stop/status
//! calls the outside world uses.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::catalog::{ColoCatalog, ColoInfo, FilterMode};
use crate::engine::colo_probe::ColoProber;
use crate::engine::speed_probe::SpeedProber;
use crate::engine::TestEngine;
use crate::error::{ErrorPlane, ScanError};
use crate::model::{ResultRecord, RunConfig, RunOutcome, RunStats, SortKey, TestEvent};
use crate::pool::{IpPool, PoolHealth};
use crate::results::ResultStore;
use crate::sources;

/// Capacity of the event channel handed to callers of `start`.
const EVENT_CAPACITY: usize = 2048;

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub running: bool,
    pub stats: RunStats,
    pub missing_files: Vec<String>,
    pub last_outcome: Option<RunOutcome>,
}

struct ActiveRun {
    cancel: CancellationToken,
    task: Option<JoinHandle<RunOutcome>>,
}

pub struct TestController {
    cfg: RunConfig,
    pool: Arc<IpPool>,
    catalog: Arc<ColoCatalog>,
    store: Arc<ResultStore>,
    errors: Arc<ErrorPlane>,
    running: Arc<AtomicBool>,
    active: Mutex<Option<ActiveRun>>,
    last_outcome: Mutex<Option<RunOutcome>>,
    colo_override: Option<Arc<dyn ColoProber>>,
    speed_override: Option<Arc<dyn SpeedProber>>,
}

impl TestController {
    pub fn new(cfg: RunConfig) -> Self {
        Self::build(cfg, None, None)
    }

    /// Construct with injected probers. Lets tests drive the full pipeline
    /// without touching the network.
    pub fn with_probers(
        cfg: RunConfig,
        colo: Arc<dyn ColoProber>,
        speed: Arc<dyn SpeedProber>,
    ) -> Self {
        Self::build(cfg, Some(colo), Some(speed))
    }

    fn build(
        cfg: RunConfig,
        colo_override: Option<Arc<dyn ColoProber>>,
        speed_override: Option<Arc<dyn SpeedProber>>,
    ) -> Self {
        let pool = Arc::new(IpPool::new(
            cfg.ip_family,
            cfg.base_retries,
            cfg.exhaustion_threshold,
        ));
        let catalog = Arc::new(ColoCatalog::new(&cfg.data_dir));
        let store = Arc::new(ResultStore::new(cfg.max_results));
        Self {
            cfg,
            pool,
            catalog,
            store,
            errors: Arc::new(ErrorPlane::new()),
            running: Arc::new(AtomicBool::new(false)),
            active: Mutex::new(None),
            last_outcome: Mutex::new(None),
            colo_override,
            speed_override,
        }
    }

    /// Kick off a run. Returns the event stream for progress reporting, or
    /// an error when a run is already active.
    pub async fn start(&self) -> Result<mpsc::Receiver<TestEvent>, ScanError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ScanError::Validation("test already running".into()));
        }

        let cancel = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);

        let engine = TestEngine::new(
            self.cfg.clone(),
            self.pool.clone(),
            self.catalog.clone(),
            self.store.clone(),
            self.errors.clone(),
            self.running.clone(),
            cancel.clone(),
            self.colo_override.clone(),
            self.speed_override.clone(),
        );

        let running = self.running.clone();
        let task = tokio::spawn(async move {
            let outcome = engine.run(event_tx).await;
            running.store(false, Ordering::SeqCst);
            outcome
        });

        *self.active.lock().await = Some(ActiveRun {
            cancel,
            task: Some(task),
        });
        Ok(event_rx)
    }

    /// Request a stop and return immediately; workers drain asynchronously.
    /// Safe to call when no run is active.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(active) = self.active.lock().await.as_ref() {
            active.cancel.cancel();
        }
    }

    /// Wait for the active run to finish and return its outcome. Also
    /// records it for `status()`.
    pub async fn wait(&self) -> Option<RunOutcome> {
        let task = {
            let mut active = self.active.lock().await;
            active.as_mut().and_then(|a| a.task.take())
        };
        let outcome = match task {
            Some(handle) => handle.await.ok(),
            None => None,
        };
        if let Some(outcome) = &outcome {
            *self.last_outcome.lock().await = Some(outcome.clone());
        }
        outcome
    }

    pub async fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            running: self.running.load(Ordering::SeqCst),
            stats: self.store.stats().await,
            missing_files: sources::missing_files(&self.cfg.data_dir, self.cfg.ip_family),
            last_outcome: self.last_outcome.lock().await.clone(),
        }
    }

    pub async fn results(&self) -> Vec<ResultRecord> {
        self.store.list().await
    }

    pub async fn results_sorted(&self, key: SortKey, ascending: bool) -> Vec<ResultRecord> {
        self.store.sorted(key, ascending).await
    }

    pub async fn results_qualified(&self) -> Vec<ResultRecord> {
        self.store.qualified().await
    }

    pub async fn clear_results(&self) {
        self.store.clear().await;
    }

    pub async fn set_filter(&self, mode: FilterMode, codes: Vec<String>) {
        self.catalog.set_filter(mode, codes).await;
    }

    pub async fn colos(&self) -> Vec<ColoInfo> {
        self.catalog.list().await
    }

    pub async fn pool_health(&self) -> PoolHealth {
        self.pool.health().await
    }

    pub fn error_plane(&self) -> Arc<ErrorPlane> {
        self.errors.clone()
    }

    pub async fn stats(&self) -> RunStats {
        self.store.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_is_idempotent_without_a_run() {
        let controller = TestController::new(RunConfig::default());
        controller.stop().await;
        controller.stop().await;
        assert!(!controller.status().await.running);
    }

    #[tokio::test]
    async fn status_reports_missing_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = RunConfig {
            data_dir: dir.path().to_path_buf(),
            ..RunConfig::default()
        };
        let controller = TestController::new(cfg);
        let status = controller.status().await;
        assert!(status
            .missing_files
            .iter()
            .any(|f| f == "ips-v4.txt"));
        assert!(!status.running);
    }
}
