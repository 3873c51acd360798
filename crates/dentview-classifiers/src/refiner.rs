//! Rule-based correction pass for extraoral predictions
//!
//! The learned models confuse the four extraoral views with each other more
//! often than any other pair. After a low-confidence extraoral prediction the
//! refiner re-reads the raw pixels and applies three geometric/brightness
//! heuristics in a fixed order. Every satisfied rule overwrites the category
//! chosen by the rules before it, so the last applicable rule wins.

use crate::features::{half_means, luma, mean_std, Gradients};
use dentview_core::{Category, Error, Result};
use image::imageops::FilterType;
use image::DynamicImage;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Predictions at or above this confidence are never refined
pub const REFINEMENT_CONFIDENCE_GATE: f32 = 0.8;

/// Upper bound on a refined confidence
pub const MAX_REFINED_CONFIDENCE: f32 = 0.85;

/// Resolution the refiner analyses images at
const ANALYSIS_SIZE: u32 = 224;

const EDGE_THRESHOLD: f32 = 30.0;

/// A rule-driven re-label of an extraoral prediction
#[derive(Debug, Clone, PartialEq)]
pub struct RefinementResult {
    pub category: Category,
    pub confidence: f32,
    /// Names of the rules that fired, in evaluation order
    pub rules_applied: Vec<String>,
}

/// Brightness and edge statistics the rules are evaluated on
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageStats {
    /// Original width / height
    pub aspect_ratio: f32,
    pub brightness_mean: f32,
    pub brightness_std: f32,
    pub bottom_brightness: f32,
    pub left_brightness: f32,
    pub right_brightness: f32,
    /// Edge density over the whole frame
    pub edge_density: f32,
    /// Edge density in the central lower band where the mouth sits
    pub mouth_edge_density: f32,
}

impl ImageStats {
    /// Derive statistics from a decoded image
    pub fn from_image(image: &DynamicImage) -> Result<Self> {
        let (w, h) = (image.width(), image.height());
        if w == 0 || h == 0 {
            return Err(Error::image("cannot refine an empty image"));
        }

        let size = ANALYSIS_SIZE as usize;
        let rgb = image
            .resize_exact(ANALYSIS_SIZE, ANALYSIS_SIZE, FilterType::Triangle)
            .to_rgb8();
        let gray: Vec<f32> = rgb
            .pixels()
            .map(|p| luma(f32::from(p[0]), f32::from(p[1]), f32::from(p[2])))
            .collect();

        let (brightness_mean, brightness_std) = mean_std(&gray);
        let halves = half_means(&gray, size, size);
        let gradients = Gradients::compute(&gray, size, size);

        // Mouth band: middle half horizontally, 55%-85% vertically
        let rows = (size * 55 / 100)..(size * 85 / 100);
        let cols = (size / 4)..(size * 3 / 4);

        Ok(Self {
            aspect_ratio: w as f32 / h as f32,
            brightness_mean,
            brightness_std,
            bottom_brightness: halves.bottom,
            left_brightness: halves.left,
            right_brightness: halves.right,
            edge_density: gradients.edge_density(EDGE_THRESHOLD),
            mouth_edge_density: gradients.region_edge_density(rows, cols, EDGE_THRESHOLD),
        })
    }
}

/// One heuristic in the refinement chain
struct Rule {
    name: &'static str,
    category: Category,
    boost: f32,
    applies: fn(&ImageStats) -> bool,
}

const RULES: [Rule; 3] = [
    Rule {
        name: "high_mouth_detail",
        category: Category::ExtraoralZoomedSmile,
        boost: 0.2,
        applies: high_mouth_detail,
    },
    Rule {
        name: "asymmetric_lighting",
        category: Category::ExtraoralRight,
        boost: 0.15,
        applies: asymmetric_lighting,
    },
    Rule {
        name: "wide_face_view",
        category: Category::ExtraoralFullFaceSmile,
        boost: 0.15,
        applies: wide_face_view,
    },
];

fn high_mouth_detail(stats: &ImageStats) -> bool {
    stats.mouth_edge_density > 1.5 * stats.edge_density
        && stats.bottom_brightness >= 0.9 * stats.brightness_mean
}

fn asymmetric_lighting(stats: &ImageStats) -> bool {
    if stats.brightness_mean <= f32::EPSILON {
        return false;
    }
    let diff = (stats.left_brightness - stats.right_brightness).abs() / stats.brightness_mean;
    diff > 0.15 && stats.aspect_ratio > 1.1
}

fn wide_face_view(stats: &ImageStats) -> bool {
    stats.aspect_ratio > 1.3 && stats.brightness_std > 0.3 * stats.brightness_mean
}

/// Deterministic post-processing for extraoral predictions
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleRefiner;

impl RuleRefiner {
    pub fn new() -> Self {
        Self
    }

    /// Whether a prediction is eligible for refinement at all
    pub fn should_refine(predicted: Category, confidence: f32) -> bool {
        predicted.is_extraoral() && confidence < REFINEMENT_CONFIDENCE_GATE
    }

    /// Refine a prediction; any internal failure means "no refinement"
    pub fn refine(
        &self,
        image: &DynamicImage,
        predicted: Category,
        confidence: f32,
        probabilities: &BTreeMap<Category, f32>,
    ) -> Option<RefinementResult> {
        if !Self::should_refine(predicted, confidence) {
            return None;
        }

        match ImageStats::from_image(image) {
            Ok(stats) => self.refine_with_stats(&stats, predicted, confidence, probabilities),
            Err(e) => {
                warn!("Refinement skipped: {}", e);
                None
            }
        }
    }

    /// Apply the rule chain to precomputed statistics
    pub fn refine_with_stats(
        &self,
        stats: &ImageStats,
        predicted: Category,
        confidence: f32,
        _probabilities: &BTreeMap<Category, f32>,
    ) -> Option<RefinementResult> {
        if !Self::should_refine(predicted, confidence) {
            return None;
        }

        let mut refined: Option<RefinementResult> = None;
        for rule in RULES.iter() {
            if !(rule.applies)(stats) {
                continue;
            }
            // Later rules overwrite earlier ones
            let rules_applied = match refined.take() {
                Some(mut previous) => {
                    previous.rules_applied.push(rule.name.to_string());
                    previous.rules_applied
                }
                None => vec![rule.name.to_string()],
            };
            refined = Some(RefinementResult {
                category: rule.category,
                confidence: (confidence + rule.boost).min(MAX_REFINED_CONFIDENCE),
                rules_applied,
            });
        }

        if let Some(result) = &refined {
            debug!(
                from = %predicted,
                to = %result.category,
                rules = ?result.rules_applied,
                "Refined extraoral prediction"
            );
        }

        refined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dentview_core::uniform_probabilities;
    use image::{Rgb, RgbImage};

    fn neutral_stats() -> ImageStats {
        ImageStats {
            aspect_ratio: 1.0,
            brightness_mean: 100.0,
            brightness_std: 10.0,
            bottom_brightness: 100.0,
            left_brightness: 100.0,
            right_brightness: 100.0,
            edge_density: 0.1,
            mouth_edge_density: 0.1,
        }
    }

    #[test]
    fn test_confident_prediction_is_never_refined() {
        let stats = ImageStats {
            mouth_edge_density: 0.5,
            ..neutral_stats()
        };
        let result = RuleRefiner::new().refine_with_stats(
            &stats,
            Category::ExtraoralFrontal,
            0.9,
            &uniform_probabilities(),
        );
        assert!(result.is_none());
    }

    #[test]
    fn test_intraoral_prediction_is_never_refined() {
        let stats = ImageStats {
            mouth_edge_density: 0.5,
            ..neutral_stats()
        };
        let result = RuleRefiner::new().refine_with_stats(
            &stats,
            Category::IntraoralLeft,
            0.4,
            &uniform_probabilities(),
        );
        assert!(result.is_none());
    }

    #[test]
    fn test_no_rule_fires() {
        let result = RuleRefiner::new().refine_with_stats(
            &neutral_stats(),
            Category::ExtraoralFrontal,
            0.5,
            &uniform_probabilities(),
        );
        assert!(result.is_none());
    }

    #[test]
    fn test_high_mouth_detail() {
        let stats = ImageStats {
            mouth_edge_density: 0.2,
            ..neutral_stats()
        };
        let result = RuleRefiner::new()
            .refine_with_stats(&stats, Category::ExtraoralFrontal, 0.5, &uniform_probabilities())
            .unwrap();

        assert_eq!(result.category, Category::ExtraoralZoomedSmile);
        assert!((result.confidence - 0.7).abs() < 1e-6);
        assert_eq!(result.rules_applied, vec!["high_mouth_detail"]);
    }

    #[test]
    fn test_asymmetric_lighting() {
        let stats = ImageStats {
            aspect_ratio: 1.2,
            left_brightness: 120.0,
            right_brightness: 80.0,
            ..neutral_stats()
        };
        let result = RuleRefiner::new()
            .refine_with_stats(&stats, Category::ExtraoralFrontal, 0.6, &uniform_probabilities())
            .unwrap();

        assert_eq!(result.category, Category::ExtraoralRight);
        assert_eq!(result.rules_applied, vec!["asymmetric_lighting"]);
    }

    #[test]
    fn test_last_applicable_rule_wins() {
        // Satisfies rule 1 (mouth detail) and rule 3 (wide view) but not rule 2
        let stats = ImageStats {
            aspect_ratio: 1.5,
            brightness_std: 40.0,
            mouth_edge_density: 0.3,
            ..neutral_stats()
        };
        let result = RuleRefiner::new()
            .refine_with_stats(&stats, Category::ExtraoralFrontal, 0.75, &uniform_probabilities())
            .unwrap();

        assert_eq!(result.category, Category::ExtraoralFullFaceSmile);
        assert_eq!(result.confidence, MAX_REFINED_CONFIDENCE);
        assert_eq!(result.rules_applied, vec!["high_mouth_detail", "wide_face_view"]);
    }

    #[test]
    fn test_black_image_has_no_refinement() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(300, 200, Rgb([0, 0, 0])));
        let result = RuleRefiner::new().refine(
            &image,
            Category::ExtraoralFrontal,
            0.5,
            &uniform_probabilities(),
        );
        assert!(result.is_none());
    }

    fn split_lit_image() -> DynamicImage {
        // Bright left side, dark right side, landscape
        DynamicImage::ImageRgb8(RgbImage::from_fn(400, 250, |x, _| {
            if x < 200 {
                Rgb([220, 200, 190])
            } else {
                Rgb([60, 50, 40])
            }
        }))
    }

    #[test]
    fn test_stats_from_wide_lit_image() {
        let image = split_lit_image();
        let stats = ImageStats::from_image(&image).unwrap();

        assert!((stats.aspect_ratio - 1.6).abs() < 1e-6);
        assert!(stats.left_brightness > stats.right_brightness);

        let result = RuleRefiner::new()
            .refine(&image, Category::ExtraoralFrontal, 0.5, &uniform_probabilities())
            .unwrap();
        // Asymmetric lighting fires, then the wide-view rule overrides it
        assert_eq!(result.category, Category::ExtraoralFullFaceSmile);
        assert!(result.rules_applied.contains(&"asymmetric_lighting".to_string()));
        assert_eq!(result.rules_applied.last().map(String::as_str), Some("wide_face_view"));
    }
}
