//! Periodic retraining of the active classifier from stored samples
//!
//! A single worker thread checks the store on a fixed interval and retrains
//! when the sample count crosses the configured thresholds. At most one
//! training run is in flight at a time: the busy flag is claimed with a
//! compare-and-swap, and a cycle (or manual trigger) that loses the race is
//! dropped rather than queued.

use crate::config::RetrainerConfig;
use crate::metrics::ServiceMetrics;
use crate::store::TrainingDataStore;
use chrono::{DateTime, Utc};
use dentview_classifiers::SharedRegistry;
use dentview_core::TrainingReport;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Where the retrainer is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrainerState {
    Idle,
    Checking,
    Training,
}

impl fmt::Display for RetrainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Checking => "checking",
            Self::Training => "training",
        };
        f.write_str(s)
    }
}

/// Result of one check cycle
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Another run held the busy flag
    Busy,
    /// Thresholds not met
    NotNeeded { total: usize },
    /// Training and saving succeeded
    Retrained(TrainingReport),
    /// Check, training or save failed
    Failed(String),
}

impl CycleOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Answer to a manual retrain request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrainTrigger {
    Started,
    AlreadyRunning,
}

/// Retrain once enough samples exist and the model is untrained, has never
/// been retrained, or the total has reached a multiple of `retrain_every`
pub fn should_retrain(
    total: usize,
    is_trained: bool,
    has_retrained: bool,
    config: &RetrainerConfig,
) -> bool {
    if total < config.min_samples {
        return false;
    }
    let on_multiple = config.retrain_every > 0 && total % config.retrain_every == 0;
    !is_trained || !has_retrained || on_multiple
}

struct Shared {
    registry: SharedRegistry,
    store: Arc<TrainingDataStore>,
    config: RetrainerConfig,
    metrics: ServiceMetrics,
    busy: AtomicBool,
    state: RwLock<RetrainerState>,
    last_retrain: RwLock<Option<DateTime<Utc>>>,
    last_report: RwLock<Option<TrainingReport>>,
}

/// Holds the busy flag; releasing it also returns the state to idle
struct BusyGuard {
    shared: Arc<Shared>,
}

impl BusyGuard {
    fn claim(shared: &Arc<Shared>) -> Option<Self> {
        shared
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                shared: Arc::clone(shared),
            })
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        *self.shared.state.write() = RetrainerState::Idle;
        self.shared.busy.store(false, Ordering::Release);
    }
}

impl Shared {
    fn run_cycle(self: &Arc<Self>, force: bool) -> CycleOutcome {
        let Some(guard) = BusyGuard::claim(self) else {
            debug!("Retrain already in progress, skipping cycle");
            return CycleOutcome::Busy;
        };
        self.run_claimed(guard, force)
    }

    fn run_claimed(&self, _guard: BusyGuard, force: bool) -> CycleOutcome {
        *self.state.write() = RetrainerState::Checking;

        let stats = match self.store.get_stats() {
            Ok(stats) => stats,
            Err(e) => {
                error!("Failed to read training data statistics: {}", e);
                return CycleOutcome::Failed(e.to_string());
            }
        };

        let classifier = self.registry.get_classifier();
        let has_retrained = self.last_retrain.read().is_some();
        if !force
            && !should_retrain(stats.total, classifier.is_trained(), has_retrained, &self.config)
        {
            debug!(total = stats.total, "Retrain not needed");
            return CycleOutcome::NotNeeded { total: stats.total };
        }

        *self.state.write() = RetrainerState::Training;
        info!(
            total = stats.total,
            classifier = classifier.name(),
            "Retraining view classifier"
        );

        let report = classifier.train(self.store.root());
        if let Some(message) = &report.error {
            error!("Retraining failed: {}", message);
            self.metrics.record_retrain(false);
            let outcome = CycleOutcome::Failed(message.clone());
            *self.last_report.write() = Some(report);
            return outcome;
        }

        if let Err(e) = classifier.save() {
            error!("Failed to save retrained model: {}", e);
            self.metrics.record_retrain(false);
            return CycleOutcome::Failed(e.to_string());
        }

        *self.last_retrain.write() = Some(report.completed_at);
        *self.last_report.write() = Some(report.clone());
        self.metrics.record_retrain(true);
        info!(
            train_accuracy = report.train_accuracy,
            val_accuracy = report.val_accuracy,
            samples = report.num_samples,
            "Retraining complete"
        );
        CycleOutcome::Retrained(report)
    }
}

struct Worker {
    stop_tx: mpsc::Sender<()>,
    done_rx: mpsc::Receiver<()>,
    handle: JoinHandle<()>,
}

/// Background worker that keeps the active classifier trained
pub struct BackgroundRetrainer {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl BackgroundRetrainer {
    pub fn new(
        registry: SharedRegistry,
        store: Arc<TrainingDataStore>,
        config: RetrainerConfig,
        metrics: ServiceMetrics,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry,
                store,
                config,
                metrics,
                busy: AtomicBool::new(false),
                state: RwLock::new(RetrainerState::Idle),
                last_retrain: RwLock::new(None),
                last_report: RwLock::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start the worker thread; no-op when already running
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            debug!("Background retrainer already running");
            return;
        }

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let shared = Arc::clone(&self.shared);

        let spawned = std::thread::Builder::new()
            .name("dentview-retrainer".to_string())
            .spawn(move || {
                info!(
                    interval_secs = shared.config.check_interval_secs,
                    "Background retrainer started"
                );
                loop {
                    let wait = if shared.run_cycle(false).is_failure() {
                        shared.config.error_backoff()
                    } else {
                        shared.config.check_interval()
                    };
                    match stop_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("Background retrainer stopped");
                let _ = done_tx.send(());
            });

        match spawned {
            Ok(handle) => {
                *worker = Some(Worker {
                    stop_tx,
                    done_rx,
                    handle,
                });
            }
            Err(e) => error!("Failed to spawn retrainer thread: {}", e),
        }
    }

    /// Signal the worker to exit and wait up to the shutdown timeout
    ///
    /// Returns whether the worker finished in time. A worker that is still
    /// training is left to finish on its own.
    pub fn stop(&self) -> bool {
        let Some(worker) = self.worker.lock().take() else {
            return true;
        };

        let _ = worker.stop_tx.send(());
        match worker.done_rx.recv_timeout(self.shared.config.shutdown_timeout()) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    warn!("Retrainer thread panicked");
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Retrainer did not stop within {:?}, detaching",
                    self.shared.config.shutdown_timeout()
                );
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Run one check synchronously
    pub fn run_cycle(&self) -> CycleOutcome {
        self.shared.run_cycle(false)
    }

    /// Retrain now regardless of thresholds, on the calling thread
    pub fn retrain_now(&self) -> CycleOutcome {
        self.shared.run_cycle(true)
    }

    /// Start a retrain on a new thread unless one is already running
    pub fn trigger(&self) -> RetrainTrigger {
        let Some(guard) = BusyGuard::claim(&self.shared) else {
            return RetrainTrigger::AlreadyRunning;
        };

        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("dentview-manual-retrain".to_string())
            .spawn(move || {
                shared.run_claimed(guard, true);
            });

        match spawned {
            Ok(_) => RetrainTrigger::Started,
            Err(e) => {
                // The guard moved into the failed closure and was dropped with it
                error!("Failed to spawn manual retrain: {}", e);
                RetrainTrigger::AlreadyRunning
            }
        }
    }

    pub fn state(&self) -> RetrainerState {
        *self.shared.state.read()
    }

    pub fn is_training(&self) -> bool {
        self.shared.busy.load(Ordering::Acquire)
    }

    /// Completion time of the last successful retrain
    pub fn last_retrain(&self) -> Option<DateTime<Utc>> {
        *self.shared.last_retrain.read()
    }

    /// Report of the last retrain attempt that reached training
    pub fn last_report(&self) -> Option<TrainingReport> {
        self.shared.last_report.read().clone()
    }

    /// Block until no retrain is in flight or the timeout passes
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while self.is_training() {
            if std::time::Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        true
    }
}

impl Drop for BackgroundRetrainer {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            let _ = worker.stop_tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_retrain_thresholds() {
        let config = RetrainerConfig::default();

        assert!(!should_retrain(19, false, false, &config));
        assert!(should_retrain(20, false, true, &config));
        assert!(should_retrain(20, true, false, &config));
        assert!(!should_retrain(20, true, true, &config));
        assert!(should_retrain(25, true, true, &config));
        assert!(!should_retrain(26, true, true, &config));
        assert!(should_retrain(50, true, true, &config));
    }

    #[test]
    fn test_should_retrain_custom_thresholds() {
        let config = RetrainerConfig {
            min_samples: 3,
            retrain_every: 0,
            ..Default::default()
        };
        assert!(should_retrain(3, false, true, &config));
        assert!(!should_retrain(100, true, true, &config));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(RetrainerState::Training.to_string(), "training");
        assert_eq!(
            serde_json::to_string(&RetrainerState::Checking).unwrap(),
            "\"checking\""
        );
    }
}
