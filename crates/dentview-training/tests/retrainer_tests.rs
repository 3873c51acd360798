//! Retrainer and service behaviour against mock classifiers

use dentview_classifiers::{ClassifierKind, ClassifierRegistry, ViewClassifier};
use dentview_core::{Category, ClassificationResult, ModelMetadata, Result, TrainingReport};
use dentview_training::{
    BackgroundRetrainer, CycleOutcome, PhotoClassificationService, RetrainTrigger,
    RetrainerConfig, RetrainerState, ServiceMetrics, TrainingConfig, TrainingDataStore,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Classifier whose training blocks for a configurable time
struct SlowTrainingClassifier {
    train_latency: Duration,
    fail_training: bool,
    trained: AtomicBool,
    train_calls: AtomicU32,
    save_calls: AtomicU32,
}

impl SlowTrainingClassifier {
    fn new(train_latency: Duration) -> Self {
        Self {
            train_latency,
            fail_training: false,
            trained: AtomicBool::new(false),
            train_calls: AtomicU32::new(0),
            save_calls: AtomicU32::new(0),
        }
    }

    fn failing() -> Self {
        Self {
            fail_training: true,
            ..Self::new(Duration::ZERO)
        }
    }

    fn train_calls(&self) -> u32 {
        self.train_calls.load(Ordering::SeqCst)
    }
}

impl ViewClassifier for SlowTrainingClassifier {
    fn name(&self) -> &str {
        "slow-mock"
    }

    fn kind(&self) -> ClassifierKind {
        ClassifierKind::Statistical
    }

    fn is_trained(&self) -> bool {
        self.trained.load(Ordering::SeqCst)
    }

    fn metadata(&self) -> ModelMetadata {
        ModelMetadata {
            is_trained: self.is_trained(),
            ..Default::default()
        }
    }

    fn try_classify(&self, _path: &Path) -> Result<ClassificationResult> {
        Ok(ClassificationResult::not_trained(self.name()))
    }

    fn train(&self, _data_dir: &Path) -> TrainingReport {
        self.train_calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.train_latency);
        if self.fail_training {
            return TrainingReport::failed("simulated divergence");
        }
        self.trained.store(true, Ordering::SeqCst);
        TrainingReport::success(0.9, 0.9, 20, 1)
    }

    fn save(&self) -> Result<()> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Fixture {
    _temp_dir: TempDir,
    store: Arc<TrainingDataStore>,
    classifier: Arc<SlowTrainingClassifier>,
    retrainer: Arc<BackgroundRetrainer>,
}

fn fixture(classifier: SlowTrainingClassifier, samples: usize, config: RetrainerConfig) -> Fixture {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(TrainingDataStore::new(
        &TrainingConfig::default().with_data_dir(temp_dir.path().join("training_data")),
    ));
    for i in 0..samples {
        let src = temp_dir.path().join(format!("photo_{}.jpg", i));
        std::fs::write(&src, b"jpeg").unwrap();
        store.add_sample(&src, "lower_occlusal", false).unwrap();
    }

    let classifier = Arc::new(classifier);
    let served = Arc::clone(&classifier);
    let registry = Arc::new(ClassifierRegistry::with_loader(Arc::new(move || {
        Arc::clone(&served) as Arc<dyn ViewClassifier>
    })));

    let retrainer = Arc::new(BackgroundRetrainer::new(
        registry,
        Arc::clone(&store),
        config,
        ServiceMetrics::new(),
    ));

    Fixture {
        _temp_dir: temp_dir,
        store,
        classifier,
        retrainer,
    }
}

#[test]
fn test_overlapping_cycles_train_once() {
    let f = fixture(
        SlowTrainingClassifier::new(Duration::from_millis(300)),
        20,
        RetrainerConfig::default(),
    );

    let retrainer = Arc::clone(&f.retrainer);
    let first = std::thread::spawn(move || retrainer.run_cycle());

    // Let the first cycle claim the busy flag
    while f.classifier.train_calls() == 0 {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(f.retrainer.state(), RetrainerState::Training);
    assert_eq!(f.retrainer.run_cycle(), CycleOutcome::Busy);
    assert_eq!(f.retrainer.trigger(), RetrainTrigger::AlreadyRunning);

    assert!(matches!(first.join().unwrap(), CycleOutcome::Retrained(_)));
    assert_eq!(f.classifier.train_calls(), 1);
    assert_eq!(f.retrainer.state(), RetrainerState::Idle);
    assert!(f.retrainer.last_retrain().is_some());
}

#[test]
fn test_below_threshold_does_not_train() {
    let f = fixture(SlowTrainingClassifier::new(Duration::ZERO), 19, RetrainerConfig::default());

    assert_eq!(f.retrainer.run_cycle(), CycleOutcome::NotNeeded { total: 19 });
    assert_eq!(f.classifier.train_calls(), 0);
    assert!(f.retrainer.last_retrain().is_none());
}

#[test]
fn test_retrain_cadence_after_first_run() {
    let f = fixture(SlowTrainingClassifier::new(Duration::ZERO), 20, RetrainerConfig::default());

    assert!(matches!(f.retrainer.run_cycle(), CycleOutcome::Retrained(_)));
    // Trained and retrained once; 20 is not a multiple of 25
    assert_eq!(f.retrainer.run_cycle(), CycleOutcome::NotNeeded { total: 20 });

    let dir = f._temp_dir.path();
    for i in 0..5 {
        let src = dir.join(format!("extra_{}.jpg", i));
        std::fs::write(&src, b"jpeg").unwrap();
        f.store.add_sample(&src, "upper_occlusal", true).unwrap();
    }
    assert!(matches!(f.retrainer.run_cycle(), CycleOutcome::Retrained(_)));
    assert_eq!(f.classifier.train_calls(), 2);
    assert_eq!(f.classifier.save_calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_failed_training_is_reported() {
    let f = fixture(SlowTrainingClassifier::failing(), 20, RetrainerConfig::default());

    let outcome = f.retrainer.run_cycle();
    assert_eq!(outcome, CycleOutcome::Failed("simulated divergence".to_string()));
    assert!(f.retrainer.last_retrain().is_none());
    assert!(!f.retrainer.last_report().unwrap().is_success());
    assert_eq!(f.classifier.save_calls.load(Ordering::SeqCst), 0);
    assert_eq!(f.retrainer.state(), RetrainerState::Idle);
}

#[test]
fn test_manual_retrain_ignores_thresholds() {
    let f = fixture(SlowTrainingClassifier::new(Duration::ZERO), 2, RetrainerConfig::default());

    assert!(matches!(f.retrainer.retrain_now(), CycleOutcome::Retrained(_)));
    assert_eq!(f.classifier.train_calls(), 1);
}

#[test]
fn test_worker_start_stop() {
    let config = RetrainerConfig {
        check_interval_secs: 3600,
        shutdown_timeout_secs: 5,
        ..Default::default()
    };
    let f = fixture(SlowTrainingClassifier::new(Duration::ZERO), 20, config);

    f.retrainer.start();
    f.retrainer.start();
    assert!(f.retrainer.is_running());

    // First cycle runs immediately on start
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while f.classifier.train_calls() == 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(f.classifier.train_calls(), 1);

    assert!(f.retrainer.stop());
    assert!(!f.retrainer.is_running());
    assert!(f.retrainer.stop());
}

#[test]
fn test_service_manual_trigger_and_status() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(TrainingDataStore::new(
        &TrainingConfig::default().with_data_dir(temp_dir.path().join("training_data")),
    ));
    let classifier = Arc::new(SlowTrainingClassifier::new(Duration::from_millis(200)));
    let served = Arc::clone(&classifier);
    let registry = Arc::new(ClassifierRegistry::with_loader(Arc::new(move || {
        Arc::clone(&served) as Arc<dyn ViewClassifier>
    })));
    let service = PhotoClassificationService::new(registry, store, RetrainerConfig::default());

    let src = temp_dir.path().join("wrong.jpg");
    std::fs::write(&src, b"jpeg").unwrap();
    service.add_corrected_sample(&src, "intraoral_right").unwrap();
    service.confirm_sample(&src, "intraoral_right").unwrap();
    assert_eq!(service.training_stats().unwrap().count(Category::IntraoralRight), 2);

    let result = service.classify_image(&src);
    assert!(result.is_fallback());

    assert_eq!(service.trigger_manual_retrain(), RetrainTrigger::Started);
    assert!(service.retrainer().wait_idle(Duration::from_secs(5)));
    assert_eq!(classifier.train_calls(), 1);

    let status = service.get_model_status();
    assert!(status.is_trained);
    assert_eq!(status.model_used, "slow-mock");
    assert_eq!(status.categories.len(), 9);
    assert!(status.last_training_time.is_some());
    assert!(!status.training_in_progress);
    assert_eq!(status.retrainer_state, RetrainerState::Idle);
    assert_eq!(status.metrics.classifications, 1);
    assert_eq!(status.metrics.fallbacks, 1);
    assert_eq!(status.metrics.samples_added, 2);
    assert_eq!(status.metrics.retrains, 1);
}
