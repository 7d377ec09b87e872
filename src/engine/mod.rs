//! Two-phase test pipeline: a concurrent colo-detection phase over a worker
//! pool, then a strictly serial bandwidth phase, iterated in batches until
//! enough qualified servers exist or the candidate stream dries up.

pub mod colo_probe;
pub mod speed_probe;
pub mod window;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::catalog::ColoCatalog;
use crate::engine::colo_probe::{ColoProber, HttpColoProber};
use crate::engine::speed_probe::{HttpSpeedProber, SpeedProber};
use crate::error::{ErrorPlane, RetryPolicy, ScanError};
use crate::model::{
    ProbeOutcome, ResultRecord, ResultStatus, RunConfig, RunOutcome, TestEvent,
};
use crate::pool::{Candidate, IpPool};
use crate::results::ResultStore;
use crate::sources;

/// Hard bound on waiting for phase-1 workers to drain after a stop.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between serial measurements to reduce congestion interference.
const MEASUREMENT_GAP: Duration = Duration::from_millis(100);

/// Phase-1 survivor: a candidate with its detected colo and latency.
#[derive(Debug, Clone)]
pub struct ColoDetection {
    pub ip: String,
    pub colo: String,
    pub latency_ms: f64,
}

enum PhaseResult {
    TargetReached,
    Stopped,
    Continue,
}

pub struct TestEngine {
    cfg: RunConfig,
    pool: Arc<IpPool>,
    catalog: Arc<ColoCatalog>,
    store: Arc<ResultStore>,
    errors: Arc<ErrorPlane>,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
    colo_override: Option<Arc<dyn ColoProber>>,
    speed_override: Option<Arc<dyn SpeedProber>>,
}

impl TestEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: RunConfig,
        pool: Arc<IpPool>,
        catalog: Arc<ColoCatalog>,
        store: Arc<ResultStore>,
        errors: Arc<ErrorPlane>,
        running: Arc<AtomicBool>,
        cancel: CancellationToken,
        colo_override: Option<Arc<dyn ColoProber>>,
        speed_override: Option<Arc<dyn SpeedProber>>,
    ) -> Self {
        Self {
            cfg,
            pool,
            catalog,
            store,
            errors,
            running,
            cancel,
            colo_override,
            speed_override,
        }
    }

    fn stop_requested(&self) -> bool {
        !self.running.load(Ordering::Relaxed) || self.cancel.is_cancelled()
    }

    /// Execute one full run. Loader failures end the run without results;
    /// individual probe failures are data points, never faults.
    pub async fn run(&self, event_tx: mpsc::Sender<TestEvent>) -> RunOutcome {
        let subnets = match sources::read_subnets(&self.cfg.data_dir, self.cfg.ip_family) {
            Ok(s) => s,
            Err(e) => return self.fail_load(e.to_string(), &event_tx).await,
        };
        let urls = match sources::read_urls(&self.cfg.data_dir) {
            Ok(u) => u,
            Err(e) => return self.fail_load(e.to_string(), &event_tx).await,
        };
        let (domain, file_path) = sources::split_url(&urls[0]);
        if let Err(e) = self.catalog.load().await {
            return self.fail_load(e.to_string(), &event_tx).await;
        }

        self.pool.reset().await;
        self.pool.register(&subnets).await;

        let colo_prober: Arc<dyn ColoProber> = match &self.colo_override {
            Some(p) => p.clone(),
            None => Arc::new(HttpColoProber::new(&domain, &self.cfg)),
        };
        let speed_prober: Arc<dyn SpeedProber> = match &self.speed_override {
            Some(p) => p.clone(),
            None => Arc::new(HttpSpeedProber::new(&domain, &file_path, &self.cfg)),
        };

        tracing::info!(
            family = %self.cfg.ip_family,
            domain = %domain,
            expected = self.cfg.expected_servers,
            floor_mbps = self.cfg.bandwidth_floor,
            "test run starting"
        );
        let _ = event_tx
            .send(TestEvent::RunStarted {
                subnets: subnets.len(),
            })
            .await;

        let mut batch_number = 0usize;
        let mut total_planned = 0usize;

        let outcome = loop {
            if self.stop_requested() {
                break RunOutcome::Stopped;
            }

            batch_number += 1;
            let batch = self.pool.draw_batch(&subnets, self.cfg.batch_size).await;
            if batch.is_empty() {
                let _ = event_tx
                    .send(TestEvent::Info {
                        message: "no more IPs available for testing".into(),
                    })
                    .await;
                break RunOutcome::IpsExhausted;
            }
            total_planned += batch.len();
            self.store.set_total(total_planned).await;
            let _ = event_tx
                .send(TestEvent::BatchStarted {
                    number: batch_number,
                    size: batch.len(),
                })
                .await;

            let (valid, filtered) = self.colo_phase(&colo_prober, batch).await;
            if self.stop_requested() {
                break RunOutcome::Stopped;
            }
            let _ = event_tx
                .send(TestEvent::PhaseOneCompleted {
                    number: batch_number,
                    valid: valid.len(),
                    filtered,
                })
                .await;

            if valid.is_empty() {
                if filtered > 0 {
                    let _ = event_tx
                        .send(TestEvent::Info {
                            message: format!(
                                "all {filtered} responsive candidates were rejected by the colo filter"
                            ),
                        })
                        .await;
                }
                continue;
            }

            match self
                .speed_phase(&colo_prober, &speed_prober, valid, &event_tx)
                .await
            {
                PhaseResult::TargetReached => break RunOutcome::EnoughQualified,
                PhaseResult::Stopped => break RunOutcome::Stopped,
                PhaseResult::Continue => {}
            }
        };

        tracing::info!(outcome = %outcome, batches = batch_number, "test run finished");
        let _ = event_tx
            .send(TestEvent::RunFinished {
                outcome: outcome.clone(),
            })
            .await;
        outcome
    }

    async fn fail_load(&self, reason: String, event_tx: &mpsc::Sender<TestEvent>) -> RunOutcome {
        tracing::error!(%reason, "run aborted on load failure");
        let outcome = RunOutcome::LoadFailed(reason);
        let _ = event_tx
            .send(TestEvent::RunFinished {
                outcome: outcome.clone(),
            })
            .await;
        outcome
    }

    /// Phase 1: fan the batch out over `workers` slots through bounded job
    /// and result queues, collect detections, and filter them through the
    /// catalog (relaxed while degraded mode is on).
    async fn colo_phase(
        &self,
        prober: &Arc<dyn ColoProber>,
        batch: Vec<Candidate>,
    ) -> (Vec<ColoDetection>, usize) {
        let queue_len = 2 * self.cfg.workers;
        let (job_tx, job_rx) = mpsc::channel::<Candidate>(queue_len);
        let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));
        let (result_tx, mut result_rx) =
            mpsc::channel::<(Candidate, Result<ProbeOutcome, ScanError>)>(queue_len);

        let mut workers = JoinSet::new();
        for _ in 0..self.cfg.workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let prober = prober.clone();
            let cancel = self.cancel.clone();
            workers.spawn(async move {
                loop {
                    let job = { job_rx.lock().await.recv().await };
                    let Some(candidate) = job else { break };
                    if cancel.is_cancelled() {
                        break;
                    }
                    let outcome = tokio::select! {
                        _ = cancel.cancelled() => break,
                        out = prober.probe(&candidate.ip) => out,
                    };
                    if result_tx.send((candidate, outcome)).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        let feeder_cancel = self.cancel.clone();
        let feeder = tokio::spawn(async move {
            for candidate in batch {
                if feeder_cancel.is_cancelled() {
                    break;
                }
                if job_tx.send(candidate).await.is_err() {
                    break;
                }
            }
        });

        let degraded = self.errors.is_degraded();
        let mut valid = Vec::new();
        let mut filtered = 0usize;
        while let Some((candidate, outcome)) = result_rx.recv().await {
            match outcome {
                Ok(po) if !po.colo.is_empty() => {
                    if degraded || self.catalog.allow(&po.colo).await {
                        valid.push(ColoDetection {
                            ip: candidate.ip,
                            colo: po.colo,
                            latency_ms: po.latency_ms,
                        });
                    } else {
                        filtered += 1;
                        tracing::debug!(ip = %candidate.ip, colo = %po.colo, "rejected by colo filter");
                    }
                }
                Ok(_) => {
                    tracing::debug!(ip = %candidate.ip, "trace returned no colo");
                }
                Err(e) => {
                    tracing::debug!(ip = %candidate.ip, error = %e, "colo probe failed");
                }
            }
        }

        let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!("worker pool did not drain in time, aborting");
            workers.abort_all();
        }
        let _ = feeder.await;

        (valid, filtered)
    }

    /// Phase 2: measure survivors one at a time. Simultaneous downloads
    /// would share the bottleneck link and understate each server.
    async fn speed_phase(
        &self,
        colo_prober: &Arc<dyn ColoProber>,
        speed_prober: &Arc<dyn SpeedProber>,
        valid: Vec<ColoDetection>,
        event_tx: &mpsc::Sender<TestEvent>,
    ) -> PhaseResult {
        let floor = self.cfg.bandwidth_floor;
        let expected = self.cfg.expected_servers;

        for detection in valid {
            if self.stop_requested() {
                self.store.set_current("", "").await;
                return PhaseResult::Stopped;
            }
            if self.store.qualified_count(floor).await >= expected {
                self.store.set_current("", "").await;
                return PhaseResult::TargetReached;
            }

            let _ = event_tx
                .send(TestEvent::Measuring {
                    ip: detection.ip.clone(),
                })
                .await;
            self.store.set_current(&detection.ip, "").await;
            self.store
                .add_or_update(ResultRecord {
                    ip: detection.ip.clone(),
                    status: ResultStatus::Measuring,
                    latency: format!("{:.2}", detection.latency_ms),
                    speed: String::new(),
                    peak_speed: 0.0,
                    colo: self.catalog.friendly_name(&detection.colo).await,
                })
                .await;

            // Fresh latency before the download; the phase-1 figure stands in
            // when the re-probe fails. The phase-1 colo stays authoritative
            // for filtering and display.
            let mut probed = colo_prober.probe(&detection.ip).await;
            if let Err(e) = &probed {
                let policy = RetryPolicy::for_kind(e.kind());
                if policy.max_retries > 0 {
                    tokio::time::sleep(policy.delay(0)).await;
                    probed = colo_prober.probe(&detection.ip).await;
                }
            }
            let latency_ms = match probed {
                Ok(po) => po.latency_ms,
                Err(e) => {
                    tracing::debug!(ip = %detection.ip, error = %e, "latency re-probe failed");
                    detection.latency_ms
                }
            };
            let display_name = self.catalog.friendly_name(&detection.colo).await;

            let record = match speed_prober.measure(&detection.ip).await {
                Ok(outcome) => {
                    let status = if floor > 0.0 && outcome.mbps < floor {
                        ResultStatus::BelowFloor
                    } else {
                        ResultStatus::Complete
                    };
                    ResultRecord {
                        ip: detection.ip.clone(),
                        status,
                        latency: format!("{latency_ms:.2}"),
                        speed: format!("{:.2}", outcome.mbps),
                        peak_speed: outcome.peak_mbps,
                        colo: display_name,
                    }
                }
                Err(e) => {
                    tracing::warn!(ip = %detection.ip, error = %e, "speed test failed");
                    ResultRecord {
                        ip: detection.ip.clone(),
                        status: ResultStatus::Invalid,
                        latency: format!("{latency_ms:.2}"),
                        speed: "timeout".into(),
                        peak_speed: 0.0,
                        colo: display_name,
                    }
                }
            };

            self.store.add_or_update(record.clone()).await;
            self.store.set_current(&record.ip, &record.speed).await;
            let _ = event_tx.send(TestEvent::ResultRecorded { record }).await;

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.store.set_current("", "").await;
                    return PhaseResult::Stopped;
                }
                _ = tokio::time::sleep(MEASUREMENT_GAP) => {}
            }

            if self.store.qualified_count(floor).await >= expected {
                self.store.set_current("", "").await;
                return PhaseResult::TargetReached;
            }
        }

        self.store.set_current("", "").await;
        PhaseResult::Continue
    }
}
