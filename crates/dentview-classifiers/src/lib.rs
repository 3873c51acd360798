//! DentView Classifiers
//!
//! View classification for clinical dental photographs.
//!
//! Two interchangeable implementations sit behind the [`ViewClassifier`] trait:
//! - Deep (feature `ml-models`): ResNet-18 fine-tuned with Candle
//! - Statistical: random forest over 17 handcrafted image features
//!
//! Both pass low-confidence extraoral predictions through the [`RuleRefiner`].
//! The [`ClassifierRegistry`] decides which one is served.

pub mod classifier;
pub mod config;
pub mod dataset;
#[cfg(feature = "ml-models")]
pub mod deep;
pub mod features;
pub mod forest;
pub mod model_loader;
pub mod refiner;
pub mod registry;
pub mod statistical;

pub use classifier::{ClassifierKind, ViewClassifier};
pub use config::{
    BackboneConfig, ClassifierConfig, DeepTrainingConfig, DeviceSpec, ForestConfig,
};
pub use dataset::{LabeledImage, LabeledImageSet};
#[cfg(feature = "ml-models")]
pub use deep::{DeepClassifier, DEEP_MODEL_NAME};
pub use features::{load_image, FeatureExtractor};
pub use model_loader::DeviceType;
pub use refiner::{ImageStats, RefinementResult, RuleRefiner};
pub use registry::{
    load_classifier, select_variant, ClassifierLoader, ClassifierRegistry, DeepProbe,
    SharedRegistry,
};
pub use statistical::{ModelBundle, StatisticalClassifier, STATISTICAL_MODEL_NAME};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::classifier::{ClassifierKind, ViewClassifier};
    pub use crate::features::FeatureExtractor;
    pub use crate::refiner::RuleRefiner;
    pub use crate::registry::ClassifierRegistry;
    pub use crate::statistical::StatisticalClassifier;
}
