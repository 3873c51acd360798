//! Classification service consumed by the upload/web layer
//!
//! Provides:
//! - Single and bulk classification through the active classifier
//! - Corrected and confirmed sample ingestion
//! - Model status reporting
//! - Manual and background retraining control

use crate::config::{RetrainerConfig, TrainingConfig};
use crate::metrics::{MetricsSnapshot, ServiceMetrics};
use crate::retrainer::{BackgroundRetrainer, CycleOutcome, RetrainTrigger, RetrainerState};
use crate::store::{TrainingDataStore, TrainingStats};
use chrono::{DateTime, Utc};
use dentview_classifiers::{ClassifierConfig, ClassifierRegistry, SharedRegistry};
use dentview_core::{Category, ClassificationResult, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Snapshot of the serving model and the retrainer
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub is_trained: bool,
    /// Identifier of the active classifier
    pub model_used: String,
    pub categories: Vec<Category>,
    pub train_accuracy: Option<f32>,
    pub val_accuracy: Option<f32>,
    pub last_training_time: Option<DateTime<Utc>>,
    pub num_samples: usize,
    pub training_in_progress: bool,
    pub retrainer_state: RetrainerState,
    pub retrainer_running: bool,
    pub metrics: MetricsSnapshot,
}

/// Entry point for classification and training data management
pub struct PhotoClassificationService {
    registry: SharedRegistry,
    store: Arc<TrainingDataStore>,
    retrainer: BackgroundRetrainer,
    metrics: ServiceMetrics,
}

impl PhotoClassificationService {
    /// Create a service from its collaborators
    pub fn new(
        registry: SharedRegistry,
        store: Arc<TrainingDataStore>,
        retrainer_config: RetrainerConfig,
    ) -> Self {
        let metrics = ServiceMetrics::new();
        let retrainer = BackgroundRetrainer::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            retrainer_config,
            metrics.clone(),
        );
        Self {
            registry,
            store,
            retrainer,
            metrics,
        }
    }

    /// Create a service with a registry and store built from configuration
    pub fn from_config(
        classifiers: ClassifierConfig,
        training: &TrainingConfig,
        retrainer: RetrainerConfig,
    ) -> Self {
        info!(
            models_dir = %classifiers.models_dir.display(),
            data_dir = %training.data_dir.display(),
            "Creating photo classification service"
        );
        Self::new(
            Arc::new(ClassifierRegistry::new(classifiers)),
            Arc::new(TrainingDataStore::new(training)),
            retrainer,
        )
    }

    /// Classify one photograph; never fails
    pub fn classify_image(&self, path: &Path) -> ClassificationResult {
        let start = Instant::now();
        let result = self.registry.get_classifier().classify_image(path);
        let latency_us = start.elapsed().as_micros() as u64;

        self.metrics
            .record_classification(latency_us, result.is_fallback(), result.was_refined());
        debug!(
            path = %path.display(),
            category = %result.category,
            confidence = result.confidence,
            latency_us,
            "Classified photo"
        );
        result
    }

    /// Classify several photographs in order
    pub fn classify_bulk(&self, paths: &[PathBuf]) -> Vec<ClassificationResult> {
        paths.iter().map(|p| self.classify_image(p)).collect()
    }

    /// Store a photo whose automatic classification was wrong
    pub fn add_corrected_sample(&self, path: &Path, category: &str) -> Result<PathBuf> {
        self.add_sample(path, category, false)
    }

    /// Store a photo whose automatic classification was right
    pub fn confirm_sample(&self, path: &Path, category: &str) -> Result<PathBuf> {
        self.add_sample(path, category, true)
    }

    fn add_sample(&self, path: &Path, category: &str, correct: bool) -> Result<PathBuf> {
        let stored = self.store.add_sample(path, category, correct)?;
        self.metrics.record_sample_added();
        Ok(stored)
    }

    /// Delete a stored sample by file name
    pub fn remove_sample(&self, path: &Path) -> Result<bool> {
        self.store.remove_sample(path)
    }

    pub fn training_stats(&self) -> Result<TrainingStats> {
        self.store.get_stats()
    }

    pub fn get_model_status(&self) -> ModelStatus {
        let classifier = self.registry.get_classifier();
        let metadata = classifier.metadata();

        ModelStatus {
            is_trained: classifier.is_trained(),
            model_used: classifier.name().to_string(),
            categories: Category::ALL.to_vec(),
            train_accuracy: metadata.train_accuracy,
            val_accuracy: metadata.val_accuracy,
            last_training_time: self.retrainer.last_retrain().or(metadata.last_trained),
            num_samples: metadata.num_samples,
            training_in_progress: self.retrainer.is_training(),
            retrainer_state: self.retrainer.state(),
            retrainer_running: self.retrainer.is_running(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Start a retrain in the background unless one is running
    pub fn trigger_manual_retrain(&self) -> RetrainTrigger {
        let trigger = self.retrainer.trigger();
        info!(?trigger, "Manual retrain requested");
        trigger
    }

    /// Retrain on the calling thread, ignoring thresholds
    pub fn retrain_blocking(&self) -> CycleOutcome {
        self.retrainer.retrain_now()
    }

    pub fn start_background_retraining(&self) {
        self.retrainer.start();
    }

    /// Returns whether the worker stopped within the shutdown timeout
    pub fn stop_background_retraining(&self) -> bool {
        self.retrainer.stop()
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn store(&self) -> &TrainingDataStore {
        &self.store
    }

    pub fn retrainer(&self) -> &BackgroundRetrainer {
        &self.retrainer
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
