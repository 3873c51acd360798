//! Core types for DentView

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Number of values in a [`FeatureVector`]
pub const FEATURE_LEN: usize = 17;

/// Category returned when no trained model is available
pub const FALLBACK_CATEGORY: Category = Category::IntraoralFront;

/// Confidence attached to the fallback result
pub const FALLBACK_CONFIDENCE: f32 = 0.3;

/// Error marker attached to results produced by an untrained model
pub const NOT_TRAINED_MARKER: &str = "model not trained";

/// One of the nine standardized clinical photograph views
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    ExtraoralFrontal,
    ExtraoralFullFaceSmile,
    ExtraoralRight,
    ExtraoralZoomedSmile,
    IntraoralFront,
    IntraoralLeft,
    IntraoralRight,
    LowerOcclusal,
    UpperOcclusal,
}

impl Category {
    /// All categories in label order
    pub const ALL: [Category; 9] = [
        Category::ExtraoralFrontal,
        Category::ExtraoralFullFaceSmile,
        Category::ExtraoralRight,
        Category::ExtraoralZoomedSmile,
        Category::IntraoralFront,
        Category::IntraoralLeft,
        Category::IntraoralRight,
        Category::LowerOcclusal,
        Category::UpperOcclusal,
    ];

    /// Number of categories
    pub const COUNT: usize = 9;

    /// Snake-case label, also used as the training directory name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExtraoralFrontal => "extraoral_frontal",
            Self::ExtraoralFullFaceSmile => "extraoral_full_face_smile",
            Self::ExtraoralRight => "extraoral_right",
            Self::ExtraoralZoomedSmile => "extraoral_zoomed_smile",
            Self::IntraoralFront => "intraoral_front",
            Self::IntraoralLeft => "intraoral_left",
            Self::IntraoralRight => "intraoral_right",
            Self::LowerOcclusal => "lower_occlusal",
            Self::UpperOcclusal => "upper_occlusal",
        }
    }

    /// Human readable name for reports
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::ExtraoralFrontal => "Extraoral Frontal",
            Self::ExtraoralFullFaceSmile => "Extraoral Full Face Smile",
            Self::ExtraoralRight => "Extraoral Right Profile",
            Self::ExtraoralZoomedSmile => "Extraoral Zoomed Smile",
            Self::IntraoralFront => "Intraoral Frontal",
            Self::IntraoralLeft => "Intraoral Left Buccal",
            Self::IntraoralRight => "Intraoral Right Buccal",
            Self::LowerOcclusal => "Lower Occlusal",
            Self::UpperOcclusal => "Upper Occlusal",
        }
    }

    /// Whether the photo is taken outside the mouth
    pub fn is_extraoral(&self) -> bool {
        self.as_str().starts_with("extraoral")
    }

    /// Position in [`Category::ALL`]
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Category at a position in [`Category::ALL`]
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| format!("unknown view category '{}'", s))
    }
}

/// Uniform distribution over every category
pub fn uniform_probabilities() -> BTreeMap<Category, f32> {
    let p = 1.0 / Category::COUNT as f32;
    Category::ALL.iter().map(|c| (*c, p)).collect()
}

/// Fixed-length numeric image descriptor
///
/// Layout: mean RGB (3), std RGB (3), horizontal and vertical gradient means,
/// gray std, edge density, aspect ratio, brightness mean and std, then the
/// top, bottom, left and right half brightness means.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector(pub [f32; FEATURE_LEN]);

impl FeatureVector {
    /// All-zero vector returned for undecodable images
    pub fn zeros() -> Self {
        Self([0.0; FEATURE_LEN])
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        FEATURE_LEN
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|v| *v == 0.0)
    }

    pub fn mean_rgb(&self) -> [f32; 3] {
        [self.0[0], self.0[1], self.0[2]]
    }

    pub fn edge_density(&self) -> f32 {
        self.0[9]
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.0[10]
    }

    pub fn brightness_mean(&self) -> f32 {
        self.0[11]
    }

    pub fn brightness_std(&self) -> f32 {
        self.0[12]
    }
}

impl Default for FeatureVector {
    fn default() -> Self {
        Self::zeros()
    }
}

/// Result of classifying one photograph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    /// Predicted view
    pub category: Category,

    /// Confidence score (0.0-1.0)
    pub confidence: f32,

    /// Probability per category
    pub probabilities: BTreeMap<Category, f32>,

    /// Human readable name of `category`
    pub category_display_name: String,

    /// Identifier of the model that produced the result
    pub model_used: String,

    /// Refinement rules that overrode the model prediction
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refinement: Option<Vec<String>>,

    /// Set when the result is a degraded fallback
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ClassificationResult {
    /// Create a result from a model prediction
    pub fn new(
        category: Category,
        confidence: f32,
        probabilities: BTreeMap<Category, f32>,
        model_used: impl Into<String>,
    ) -> Self {
        Self {
            category,
            confidence,
            probabilities,
            category_display_name: category.display_name().to_string(),
            model_used: model_used.into(),
            refinement: None,
            error: None,
        }
    }

    /// Low-confidence result used when no trained model can answer
    pub fn fallback(model_used: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(
                FALLBACK_CATEGORY,
                FALLBACK_CONFIDENCE,
                uniform_probabilities(),
                model_used,
            )
        }
    }

    /// Fallback for a model without trained parameters
    pub fn not_trained(model_used: impl Into<String>) -> Self {
        Self::fallback(model_used, NOT_TRAINED_MARKER)
    }

    pub fn is_fallback(&self) -> bool {
        self.error.is_some()
    }

    pub fn was_refined(&self) -> bool {
        self.refinement.is_some()
    }

    /// Sum of all probabilities
    pub fn probability_mass(&self) -> f32 {
        self.probabilities.values().sum()
    }
}

/// Metadata persisted next to trained parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub is_trained: bool,
    pub last_trained: Option<DateTime<Utc>>,
    pub train_accuracy: Option<f32>,
    pub val_accuracy: Option<f32>,
    #[serde(default)]
    pub num_samples: usize,
}

/// Outcome of a training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub train_accuracy: f32,
    pub val_accuracy: f32,
    pub num_samples: usize,
    pub epochs: usize,
    pub completed_at: DateTime<Utc>,
    /// Set when the run failed; the previous parameters stay in effect
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TrainingReport {
    /// Report for a finished run
    pub fn success(train_accuracy: f32, val_accuracy: f32, num_samples: usize, epochs: usize) -> Self {
        Self {
            train_accuracy,
            val_accuracy,
            num_samples,
            epochs,
            completed_at: Utc::now(),
            error: None,
        }
    }

    /// Report for a failed run
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            train_accuracy: 0.0,
            val_accuracy: 0.0,
            num_samples: 0,
            epochs: 0,
            completed_at: Utc::now(),
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
