//! Run coordinator - one collection pass from lock to maintenance
//!
//! ## State machine
//!
//! ```text
//! Idle ──acquire lock──► Running ──release lock (every exit path)──► Idle
//!   │
//!   └── lock held elsewhere ──► RunOutcome::LockHeld (store untouched)
//! ```
//!
//! ## Pass
//!
//! ```text
//! load targets → probe all (concurrent, run deadline)
//!              → per target: append → stats → evaluate → notify
//!              → compress old days → delete expired days
//! ```
//!
//! Storage and delivery failures are logged and counted; they never abort
//! the pass for the remaining targets.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::anomaly::Detector;
use crate::config::{Config, StorageConfig};
use crate::error::{ConfigError, LockError, RunError};
use crate::lock::RunLock;
use crate::notify::{AnomalyReport, Notifier};
use crate::observation::{Observation, ProbeErrorCode};
use crate::probe::ProbeExecutor;
use crate::storage::{AggregateStats, TimeSeriesStore};
use crate::target::Target;

/// Whether a pass is currently in progress in this process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
}

/// Counters of one completed pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub targets: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Probes cut off by the run deadline (not stored)
    pub cancelled: usize,
    pub stored: usize,
    pub storage_errors: usize,
    pub anomalies: usize,
    /// Reports handed to the notifier
    pub reports: usize,
    pub notify_errors: usize,
    pub compressed: usize,
    pub deleted: usize,
    /// A stale lock of a crashed run was taken over
    pub reclaimed_stale_lock: bool,
    pub duration: Duration,
}

/// How a call to [`Coordinator::run`] ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(RunSummary),
    /// Another run holds the lock; nothing was done
    LockHeld { pid: u32, age: Duration },
}

impl RunOutcome {
    /// Process exit code the CLI reports for this outcome
    pub fn exit_code(&self) -> u8 {
        match self {
            RunOutcome::Completed(_) => 0,
            RunOutcome::LockHeld { .. } => 2,
        }
    }
}

/// Resets the running flag when a pass ends, however it ends
struct RunningFlag<'a>(&'a AtomicBool);

impl<'a> RunningFlag<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Coordinator {
    executor: ProbeExecutor,
    store: Arc<dyn TimeSeriesStore>,
    detector: Detector,
    notifier: Arc<dyn Notifier>,
    lock: RunLock,
    storage: StorageConfig,
    run_timeout: Duration,
    running: AtomicBool,
}

impl Coordinator {
    pub fn new(config: &Config, store: Arc<dyn TimeSeriesStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            executor: ProbeExecutor::new(config.probe.clone()),
            store,
            detector: Detector::new(config.anomaly.clone()),
            notifier,
            lock: RunLock::new(config.lock.path.clone(), config.lock.max_age()),
            storage: config.storage.clone(),
            run_timeout: config.probe.run_timeout(),
            running: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> RunState {
        if self.running.load(Ordering::SeqCst) {
            RunState::Running
        } else {
            RunState::Idle
        }
    }

    /// Execute one pass
    ///
    /// `load_targets` is called only after the lock has been acquired. The
    /// lock is released on every exit path, including errors and panics.
    pub async fn run<F>(&self, load_targets: F) -> Result<RunOutcome, RunError>
    where
        F: FnOnce() -> Result<Vec<Target>, ConfigError>,
    {
        let guard = match self.lock.acquire() {
            Ok(guard) => guard,
            Err(LockError::Held { pid, age }) => {
                info!("another run (pid {pid}) is active for {age:?}, skipping");
                return Ok(RunOutcome::LockHeld { pid, age });
            }
            Err(e) => return Err(e.into()),
        };

        let reclaimed = guard.reclaimed().cloned();
        if let Some(stale) = &reclaimed {
            warn!(
                "reclaimed stale lock of pid {} started at {}",
                stale.pid, stale.started_at
            );
        }

        let result = {
            let _running = RunningFlag::enter(&self.running);
            self.run_locked(load_targets).await
        };

        if let Err(e) = guard.release() {
            warn!("{e}");
        }

        result.map(|mut summary| {
            summary.reclaimed_stale_lock = reclaimed.is_some();
            RunOutcome::Completed(summary)
        })
    }

    async fn run_locked<F>(&self, load_targets: F) -> Result<RunSummary, RunError>
    where
        F: FnOnce() -> Result<Vec<Target>, ConfigError>,
    {
        let started = Instant::now();
        let targets = load_targets()?;

        info!("starting run for {} targets", targets.len());

        let mut summary = RunSummary {
            targets: targets.len(),
            ..Default::default()
        };

        let observations = self
            .executor
            .probe_all_within(&targets, self.run_timeout)
            .await;

        for (target, observation) in targets.iter().zip(observations) {
            self.process(target, observation, &mut summary).await;
        }

        self.maintain(&mut summary).await;

        summary.duration = started.elapsed();

        info!(
            "run finished in {:.1}s: {} ok, {} failed, {} cancelled, {} anomalies in {} reports, {} storage errors, {} notify errors",
            summary.duration.as_secs_f64(),
            summary.succeeded,
            summary.failed,
            summary.cancelled,
            summary.anomalies,
            summary.reports,
            summary.storage_errors,
            summary.notify_errors
        );

        Ok(summary)
    }

    /// Store, evaluate and report one target's observation
    #[instrument(skip_all, fields(site = %target.name))]
    async fn process(&self, target: &Target, observation: Observation, summary: &mut RunSummary) {
        if observation.error_code == Some(ProbeErrorCode::Cancelled) {
            warn!("probe cancelled by the run deadline, nothing stored");
            summary.cancelled += 1;
            return;
        }

        if observation.success {
            summary.succeeded += 1;
        } else {
            summary.failed += 1;
        }

        match self.store.append(&observation).await {
            Ok(()) => {
                summary.stored += 1;
                info!(
                    "stored observation (HTTP {}, {:.0}ms, success: {})",
                    observation.http_code, observation.response_time, observation.success
                );
            }
            Err(e) => {
                summary.storage_errors += 1;
                warn!("failed to store observation: {e}");
            }
        }

        let baseline = match self.store.stats(&target.name, self.storage.baseline_days).await {
            Ok(stats) => stats,
            Err(e) => {
                summary.storage_errors += 1;
                warn!("failed to load baseline, relative rules skipped: {e}");
                AggregateStats::default()
            }
        };

        let anomalies = self.detector.evaluate(&observation, target, &baseline);
        if anomalies.is_empty() {
            debug!(
                "no anomalies (baseline: {} samples, avg {:.0}ms)",
                baseline.successful, baseline.avg_response_time
            );
            return;
        }

        info!("{} anomalies detected", anomalies.len());
        summary.anomalies += anomalies.len();
        summary.reports += 1;

        let report = AnomalyReport {
            target: target.clone(),
            observation,
            anomalies,
        };

        if let Err(e) = self.notifier.notify(&report).await {
            summary.notify_errors += 1;
            warn!("failed to deliver anomaly report: {e:#}");
        }
    }

    async fn maintain(&self, summary: &mut RunSummary) {
        match self
            .store
            .compress_older_than(self.storage.compress_after_days)
            .await
        {
            Ok(count) => summary.compressed = count,
            Err(e) => {
                summary.storage_errors += 1;
                warn!("compression failed: {e}");
            }
        }

        match self.store.delete_older_than(self.storage.retention_days).await {
            Ok(count) => summary.deleted = count,
            Err(e) => {
                summary.storage_errors += 1;
                warn!("retention cleanup failed: {e}");
            }
        }

        debug!(
            "maintenance: {} compressed, {} deleted",
            summary.compressed, summary.deleted
        );
    }
}
