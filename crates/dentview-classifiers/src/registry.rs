//! Classifier selection and the process-wide active classifier

use crate::classifier::{ClassifierKind, ViewClassifier};
use crate::config::ClassifierConfig;
use crate::statistical::StatisticalClassifier;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

#[cfg(feature = "ml-models")]
use crate::deep::DeepClassifier;
#[cfg(feature = "ml-models")]
use dentview_core::Error;
#[cfg(feature = "ml-models")]
use tracing::warn;

/// What probing for the deep variant found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeepProbe {
    /// Built without the deep backend, or disabled by configuration
    Unavailable,
    /// No weights file on disk
    Missing,
    /// Weights exist but could not be loaded
    Unloadable,
    /// Weights loaded but the metadata says they were never trained
    Untrained,
    /// Weights loaded and trained
    Trained,
}

/// Pick the variant to serve; only a trained deep model beats the forest
pub fn select_variant(probe: DeepProbe) -> ClassifierKind {
    match probe {
        DeepProbe::Trained => ClassifierKind::Deep,
        DeepProbe::Unavailable
        | DeepProbe::Missing
        | DeepProbe::Unloadable
        | DeepProbe::Untrained => ClassifierKind::Statistical,
    }
}

/// Builds the classifier the registry should serve
pub type ClassifierLoader = Arc<dyn Fn() -> Arc<dyn ViewClassifier> + Send + Sync>;

/// Probe for the deep variant and fall back to the statistical one
pub fn load_classifier(config: &ClassifierConfig) -> Arc<dyn ViewClassifier> {
    #[cfg(feature = "ml-models")]
    {
        if config.prefer_deep {
            let (probe, deep) = match DeepClassifier::load(config) {
                Ok(classifier) if classifier.is_trained() => (DeepProbe::Trained, Some(classifier)),
                Ok(_) => (DeepProbe::Untrained, None),
                Err(Error::WeightsMissing(_)) => (DeepProbe::Missing, None),
                Err(e) => {
                    warn!("Deep model unusable: {}", e);
                    (DeepProbe::Unloadable, None)
                }
            };
            info!(probe = ?probe, "Probed deep classifier");
            if let (ClassifierKind::Deep, Some(classifier)) = (select_variant(probe), deep) {
                return Arc::new(classifier);
            }
        }
    }

    #[cfg(not(feature = "ml-models"))]
    info!(probe = ?DeepProbe::Unavailable, "Deep classifier not compiled in");

    Arc::new(StatisticalClassifier::load(config))
}

/// Owns the active classifier
///
/// Created once at startup and shared behind an `Arc`. The first call to
/// [`ClassifierRegistry::get_classifier`] loads the model; concurrent first
/// callers block on the init lock and all receive the same instance.
pub struct ClassifierRegistry {
    loader: ClassifierLoader,
    active: RwLock<Option<Arc<dyn ViewClassifier>>>,
    init_lock: Mutex<()>,
    loads: AtomicUsize,
}

impl ClassifierRegistry {
    /// Registry that loads from the given configuration
    pub fn new(config: ClassifierConfig) -> Self {
        Self::with_loader(Arc::new(move || load_classifier(&config)))
    }

    /// Registry with a custom loader
    pub fn with_loader(loader: ClassifierLoader) -> Self {
        Self {
            loader,
            active: RwLock::new(None),
            init_lock: Mutex::new(()),
            loads: AtomicUsize::new(0),
        }
    }

    /// Get the active classifier, loading it on first use
    pub fn get_classifier(&self) -> Arc<dyn ViewClassifier> {
        if let Some(classifier) = self.active.read().as_ref() {
            return Arc::clone(classifier);
        }

        let _guard = self.init_lock.lock();
        if let Some(classifier) = self.active.read().as_ref() {
            return Arc::clone(classifier);
        }

        let classifier = self.load();
        *self.active.write() = Some(Arc::clone(&classifier));
        classifier
    }

    /// Re-run selection and replace the active classifier
    pub fn reinitialize(&self) -> Arc<dyn ViewClassifier> {
        let _guard = self.init_lock.lock();
        let classifier = self.load();
        let previous = self.active.write().replace(Arc::clone(&classifier));
        if let Some(previous) = previous {
            info!(
                "Replaced {} classifier with {}",
                previous.name(),
                classifier.name()
            );
        }
        classifier
    }

    /// The active classifier, if one has been loaded
    pub fn current(&self) -> Option<Arc<dyn ViewClassifier>> {
        self.active.read().clone()
    }

    /// How many times the loader has run
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }

    fn load(&self) -> Arc<dyn ViewClassifier> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        let classifier = (self.loader)();
        info!(
            "Active view classifier: {} (trained: {})",
            classifier.name(),
            classifier.is_trained()
        );
        classifier
    }
}

/// Shared registry handle
pub type SharedRegistry = Arc<ClassifierRegistry>;
