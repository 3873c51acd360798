//! Mock view classifiers for testing
//!
//! Exercises the default `ViewClassifier` methods and registry behaviour
//! with configurable mock implementations.

use dentview_classifiers::{ClassifierKind, ClassifierRegistry, ViewClassifier};
use dentview_core::{
    Category, ClassificationResult, Error, ModelMetadata, Result, TrainingReport,
    FALLBACK_CATEGORY,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A configurable mock classifier for testing
pub struct MockClassifier {
    category: Category,
    confidence: f32,
    simulated_latency: Option<Duration>,
    call_count: AtomicU32,
}

impl MockClassifier {
    pub fn new(category: Category) -> Self {
        Self {
            category,
            confidence: 0.9,
            simulated_latency: None,
            call_count: AtomicU32::new(0),
        }
    }

    /// Set the confidence this classifier will return
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    /// Set simulated latency for this classifier
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.simulated_latency = Some(latency);
        self
    }

    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::Relaxed)
    }
}

impl ViewClassifier for MockClassifier {
    fn name(&self) -> &str {
        "mock"
    }

    fn kind(&self) -> ClassifierKind {
        ClassifierKind::Statistical
    }

    fn is_trained(&self) -> bool {
        true
    }

    fn metadata(&self) -> ModelMetadata {
        ModelMetadata {
            is_trained: true,
            ..Default::default()
        }
    }

    fn try_classify(&self, _path: &Path) -> Result<ClassificationResult> {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        if let Some(latency) = self.simulated_latency {
            std::thread::sleep(latency);
        }

        let mut probabilities: std::collections::BTreeMap<_, _> =
            Category::ALL.iter().map(|c| (*c, 0.0)).collect();
        probabilities.insert(self.category, self.confidence);
        Ok(ClassificationResult::new(
            self.category,
            self.confidence,
            probabilities,
            self.name(),
        ))
    }

    fn train(&self, _data_dir: &Path) -> TrainingReport {
        TrainingReport::success(1.0, 1.0, 0, 1)
    }

    fn save(&self) -> Result<()> {
        Ok(())
    }
}

/// A classifier that always fails - for testing error paths
pub struct FailingClassifier {
    error_message: String,
}

impl FailingClassifier {
    pub fn new(message: &str) -> Self {
        Self {
            error_message: message.to_string(),
        }
    }
}

impl ViewClassifier for FailingClassifier {
    fn name(&self) -> &str {
        "failing"
    }

    fn kind(&self) -> ClassifierKind {
        ClassifierKind::Deep
    }

    fn is_trained(&self) -> bool {
        true
    }

    fn metadata(&self) -> ModelMetadata {
        ModelMetadata::default()
    }

    fn try_classify(&self, _path: &Path) -> Result<ClassificationResult> {
        Err(Error::classifier(&self.error_message))
    }

    fn train(&self, _data_dir: &Path) -> TrainingReport {
        TrainingReport::failed(&self.error_message)
    }

    fn save(&self) -> Result<()> {
        Err(Error::classifier(&self.error_message))
    }
}

#[test]
fn test_mock_classifier_basic() {
    let classifier = MockClassifier::new(Category::LowerOcclusal).with_confidence(0.7);
    let result = classifier.classify_image(Path::new("any.jpg"));

    assert_eq!(result.category, Category::LowerOcclusal);
    assert_eq!(result.confidence, 0.7);
    assert_eq!(result.model_used, "mock");
    assert_eq!(classifier.call_count(), 1);
}

#[test]
fn test_failing_classifier_collapses_to_fallback() {
    let classifier = FailingClassifier::new("backend exploded");
    let result = classifier.classify_image(Path::new("any.jpg"));

    assert_eq!(result.category, FALLBACK_CATEGORY);
    assert_eq!(result.confidence, 0.3);
    assert_eq!(result.model_used, "failing");
    assert!(result.error.as_deref().unwrap().contains("backend exploded"));
}

#[test]
fn test_classify_bulk_preserves_order() {
    let classifier = MockClassifier::new(Category::UpperOcclusal);
    let paths: Vec<PathBuf> = (0..5).map(|i| PathBuf::from(format!("{}.jpg", i))).collect();

    let results = classifier.classify_bulk(&paths);
    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|r| r.category == Category::UpperOcclusal));
    assert_eq!(classifier.call_count(), 5);
}

#[test]
fn test_classify_bulk_empty() {
    let classifier = MockClassifier::new(Category::UpperOcclusal);
    assert!(classifier.classify_bulk(&[]).is_empty());
    assert_eq!(classifier.call_count(), 0);
}

#[test]
fn test_registry_serves_injected_classifier() {
    let mock = Arc::new(MockClassifier::new(Category::IntraoralLeft));
    let served = Arc::clone(&mock);
    let registry = ClassifierRegistry::with_loader(Arc::new(move || {
        Arc::clone(&served) as Arc<dyn ViewClassifier>
    }));

    let classifier = registry.get_classifier();
    let result = classifier.classify_image(Path::new("photo.png"));

    assert_eq!(result.category, Category::IntraoralLeft);
    assert_eq!(mock.call_count(), 1);
}

#[test]
fn test_slow_classifier_is_shared_across_threads() {
    let mock = Arc::new(MockClassifier::new(Category::IntraoralRight).with_latency(Duration::from_millis(5)));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let classifier = Arc::clone(&mock);
            std::thread::spawn(move || classifier.classify_image(Path::new(&format!("{}.jpg", i))))
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap().category, Category::IntraoralRight);
    }
    assert_eq!(mock.call_count(), 8);
}
