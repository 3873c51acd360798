//! DentView Core
//!
//! Core types shared across DentView components.
//!
//! This crate provides:
//! - The nine clinical view categories
//! - Feature vectors, classification results and training reports
//! - Error types and result handling
//! - Image file discovery helpers

pub mod error;
pub mod media;
pub mod types;

pub use error::{Error, Result};
pub use media::{is_image_file, list_images, IMAGE_EXTENSIONS};
pub use types::{
    uniform_probabilities, Category, ClassificationResult, FeatureVector, ModelMetadata,
    TrainingReport, FALLBACK_CATEGORY, FALLBACK_CONFIDENCE, FEATURE_LEN, NOT_TRAINED_MARKER,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::types::{Category, ClassificationResult, FeatureVector, TrainingReport};
}
