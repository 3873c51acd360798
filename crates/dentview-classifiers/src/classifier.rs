//! View classifier trait and helpers shared by both implementations

use crate::refiner::{RefinementResult, RuleRefiner};
use dentview_core::{
    Category, ClassificationResult, ModelMetadata, Result, TrainingReport,
};
use image::DynamicImage;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Trait for all view classifiers
///
/// Implementations keep their trained parameters behind an `Arc` that is
/// replaced wholesale after a successful training run, so `&self` methods can
/// be called from any number of request threads while a retrain is in flight.
pub trait ViewClassifier: Send + Sync {
    /// Identifier reported as `model_used`
    fn name(&self) -> &str;

    /// Which implementation this is
    fn kind(&self) -> ClassifierKind;

    /// Whether trained parameters are loaded
    fn is_trained(&self) -> bool;

    /// Metadata of the active parameters
    fn metadata(&self) -> ModelMetadata;

    /// Classify one image, surfacing internal failures as errors
    ///
    /// An untrained model is not an error: it answers with the fallback.
    fn try_classify(&self, path: &Path) -> Result<ClassificationResult>;

    /// Train new parameters from `<data_dir>/<category>/*`
    ///
    /// Failures are reported in the returned report; the previous
    /// parameters stay in effect.
    fn train(&self, data_dir: &Path) -> TrainingReport;

    /// Persist the active parameters to the configured path
    fn save(&self) -> Result<()>;

    /// Classify one image; never fails
    fn classify_image(&self, path: &Path) -> ClassificationResult {
        match self.try_classify(path) {
            Ok(result) => result,
            Err(e) => {
                warn!("Classification of {} failed: {}", path.display(), e);
                ClassificationResult::fallback(self.name(), e.to_string())
            }
        }
    }

    /// Classify several images in order
    fn classify_bulk(&self, paths: &[PathBuf]) -> Vec<ClassificationResult> {
        paths.iter().map(|p| self.classify_image(p)).collect()
    }
}

/// The two interchangeable classifier implementations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierKind {
    /// Convolutional network fine-tuned on clinical photos
    Deep,
    /// Random forest over handcrafted features
    Statistical,
}

impl ClassifierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deep => "deep",
            Self::Statistical => "statistical",
        }
    }
}

impl fmt::Display for ClassifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Spread class probabilities over all nine categories
///
/// Categories unknown to the model, or missing because the probability array
/// is shorter than the class list, get 0.0.
pub fn probability_map(classes: &[Category], proba: &[f32]) -> BTreeMap<Category, f32> {
    let mut map: BTreeMap<Category, f32> = Category::ALL.iter().map(|c| (*c, 0.0)).collect();
    for (i, category) in classes.iter().enumerate() {
        map.insert(*category, proba.get(i).copied().unwrap_or(0.0));
    }
    map
}

/// Run the refiner and fold its verdict into a model prediction
///
/// The refined confidence replaces that category's probability without
/// renormalizing the map.
pub fn refine_prediction(
    refiner: &RuleRefiner,
    image: &DynamicImage,
    mut result: ClassificationResult,
) -> ClassificationResult {
    if let Some(refined) = refiner.refine(
        image,
        result.category,
        result.confidence,
        &result.probabilities,
    ) {
        apply_refinement(&mut result, refined);
    }
    result
}

fn apply_refinement(result: &mut ClassificationResult, refined: RefinementResult) {
    metrics::counter!("dentview_refinements_total").increment(1);
    result.category = refined.category;
    result.confidence = refined.confidence;
    result.category_display_name = refined.category.display_name().to_string();
    result
        .probabilities
        .insert(refined.category, refined.confidence);
    result.refinement = Some(refined.rules_applied);
}
