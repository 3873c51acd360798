//! Random forest view classifier over handcrafted image features

use crate::classifier::{probability_map, refine_prediction, ClassifierKind, ViewClassifier};
use crate::config::{ClassifierConfig, ForestConfig};
use crate::dataset::LabeledImageSet;
use crate::features::{load_image, FeatureExtractor};
use crate::forest::{argmax, LabelEncoder, RandomForest, StandardScaler};
use crate::model_loader::{require_model_file, write_atomically};
use crate::refiner::RuleRefiner;
use chrono::Utc;
use dentview_core::{
    ClassificationResult, Error, ModelMetadata, Result, TrainingReport, FEATURE_LEN,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Identifier reported in `model_used`
pub const STATISTICAL_MODEL_NAME: &str = "statistical";

/// Everything needed to reproduce predictions, persisted as one JSON document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelBundle {
    pub forest: RandomForest,
    pub scaler: StandardScaler,
    pub encoder: LabelEncoder,
    pub metadata: ModelMetadata,
}

impl ModelBundle {
    /// Read a bundle written by [`StatisticalClassifier::save`]
    ///
    /// A bundle that parses but does not fit together is rejected.
    pub fn read(path: &Path) -> Result<Self> {
        require_model_file(path)?;
        let bytes = std::fs::read(path)?;
        let bundle: Self = serde_json::from_slice(&bytes)?;
        bundle.validate()?;
        Ok(bundle)
    }

    /// Check the scaler, encoder and forest agree with each other and with
    /// the feature extractor
    pub fn validate(&self) -> Result<()> {
        self.forest.validate()?;

        let n_features = self.forest.n_features();
        if n_features != FEATURE_LEN
            || self.scaler.mean.len() != n_features
            || self.scaler.scale.len() != n_features
        {
            return Err(Error::classifier(format!(
                "feature width mismatch (forest {}, scaler {}/{}, extractor {})",
                n_features,
                self.scaler.mean.len(),
                self.scaler.scale.len(),
                FEATURE_LEN
            )));
        }
        if self.scaler.scale.iter().any(|s| !s.is_finite() || *s == 0.0) {
            return Err(Error::classifier("scaler has a zero or non-finite scale"));
        }

        if self.encoder.len() != self.forest.n_classes() {
            return Err(Error::classifier(format!(
                "encoder has {} classes, forest has {}",
                self.encoder.len(),
                self.forest.n_classes()
            )));
        }
        if self.encoder.classes.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::classifier("encoder classes are not sorted and unique"));
        }
        Ok(())
    }
}

/// Random forest classifier with rule refinement
pub struct StatisticalClassifier {
    bundle_path: PathBuf,
    forest_config: ForestConfig,
    extractor: FeatureExtractor,
    refiner: RuleRefiner,
    state: RwLock<Option<Arc<ModelBundle>>>,
}

impl StatisticalClassifier {
    /// Untrained classifier that will persist to the configured bundle path
    pub fn untrained(config: &ClassifierConfig) -> Self {
        Self {
            bundle_path: config.statistical_bundle_path(),
            forest_config: config.forest.clone(),
            extractor: FeatureExtractor::new(),
            refiner: RuleRefiner::new(),
            state: RwLock::new(None),
        }
    }

    /// Restore the persisted bundle; a missing or corrupt bundle yields an
    /// untrained classifier
    pub fn load(config: &ClassifierConfig) -> Self {
        let classifier = Self::untrained(config);
        match ModelBundle::read(&classifier.bundle_path) {
            Ok(bundle) => {
                info!(
                    "Loaded statistical model from {} ({} classes, {} trees, {} nodes)",
                    classifier.bundle_path.display(),
                    bundle.encoder.len(),
                    bundle.forest.n_trees(),
                    bundle.forest.node_count()
                );
                *classifier.state.write() = Some(Arc::new(bundle));
            }
            Err(Error::WeightsMissing(path)) => {
                info!("No statistical model at {}, starting untrained", path.display());
            }
            Err(e) => {
                warn!(
                    "Ignoring unreadable statistical model {}: {}",
                    classifier.bundle_path.display(),
                    e
                );
            }
        }
        classifier
    }

    /// Where [`ViewClassifier::save`] writes the bundle
    pub fn bundle_path(&self) -> &Path {
        &self.bundle_path
    }

    fn snapshot(&self) -> Option<Arc<ModelBundle>> {
        self.state.read().clone()
    }

    fn fit(&self, data_dir: &Path) -> Result<ModelBundle> {
        let dataset = LabeledImageSet::from_dir(data_dir)?;
        debug!(counts = ?dataset.counts(), "Statistical training set");

        let mut rows = Vec::with_capacity(dataset.len());
        let mut categories = Vec::with_capacity(dataset.len());
        for sample in dataset.samples() {
            let features = self.extractor.extract_path(&sample.path);
            rows.push(features.as_slice().to_vec());
            categories.push(sample.category);
        }

        let scaler = StandardScaler::fit(&rows)?;
        let scaled = rows
            .iter()
            .map(|row| scaler.transform(row))
            .collect::<Result<Vec<_>>>()?;

        let encoder = LabelEncoder::fit(&categories);
        let labels = categories
            .iter()
            .map(|c| {
                encoder
                    .encode(*c)
                    .ok_or_else(|| Error::internal(format!("category {} missing from encoder", c)))
            })
            .collect::<Result<Vec<_>>>()?;

        let forest = RandomForest::fit(&scaled, &labels, encoder.len(), &self.forest_config)?;

        let mut correct = 0usize;
        for (row, label) in scaled.iter().zip(&labels) {
            if forest.predict(row)? == *label {
                correct += 1;
            }
        }
        // No held-out split: training accuracy doubles as validation accuracy
        let accuracy = correct as f32 / labels.len() as f32;

        Ok(ModelBundle {
            forest,
            scaler,
            encoder,
            metadata: ModelMetadata {
                is_trained: true,
                last_trained: Some(Utc::now()),
                train_accuracy: Some(accuracy),
                val_accuracy: Some(accuracy),
                num_samples: labels.len(),
            },
        })
    }
}

impl ViewClassifier for StatisticalClassifier {
    fn name(&self) -> &str {
        STATISTICAL_MODEL_NAME
    }

    fn kind(&self) -> ClassifierKind {
        ClassifierKind::Statistical
    }

    fn is_trained(&self) -> bool {
        self.state.read().is_some()
    }

    fn metadata(&self) -> ModelMetadata {
        self.snapshot()
            .map(|bundle| bundle.metadata.clone())
            .unwrap_or_default()
    }

    fn try_classify(&self, path: &Path) -> Result<ClassificationResult> {
        let Some(bundle) = self.snapshot() else {
            return Ok(ClassificationResult::not_trained(self.name()));
        };

        let image = load_image(path)?;
        let features = self.extractor.try_extract(&image)?;
        let scaled = bundle.scaler.transform(features.as_slice())?;
        let proba = bundle.forest.predict_proba(&scaled)?;

        let index = argmax(&proba);
        let category = bundle
            .encoder
            .decode(index)
            .ok_or_else(|| Error::classifier(format!("class index {} out of range", index)))?;
        let confidence = proba.get(index).copied().unwrap_or(0.0);
        let probabilities = probability_map(&bundle.encoder.classes, &proba);

        debug!(
            path = %path.display(),
            category = %category,
            confidence,
            "Statistical prediction"
        );

        let result = ClassificationResult::new(category, confidence, probabilities, self.name());
        Ok(refine_prediction(&self.refiner, &image, result))
    }

    fn train(&self, data_dir: &Path) -> TrainingReport {
        let start = Instant::now();
        info!("Training statistical model from {}", data_dir.display());

        match self.fit(data_dir) {
            Ok(bundle) => {
                let metadata = bundle.metadata.clone();
                *self.state.write() = Some(Arc::new(bundle));

                let accuracy = metadata.train_accuracy.unwrap_or(0.0);
                info!(
                    "Statistical model trained on {} samples in {:?} (accuracy {:.3})",
                    metadata.num_samples,
                    start.elapsed(),
                    accuracy
                );
                TrainingReport::success(
                    accuracy,
                    metadata.val_accuracy.unwrap_or(accuracy),
                    metadata.num_samples,
                    1,
                )
            }
            Err(e) => {
                warn!("Statistical training failed: {}", e);
                TrainingReport::failed(e.to_string())
            }
        }
    }

    fn save(&self) -> Result<()> {
        let bundle = self.snapshot().ok_or(Error::NotTrained)?;
        let json = serde_json::to_vec(bundle.as_ref())?;
        write_atomically(&self.bundle_path, &json)?;
        info!("Saved statistical model to {}", self.bundle_path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dentview_core::Category;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    fn test_config(models_dir: &Path) -> ClassifierConfig {
        let mut config = ClassifierConfig::default().with_models_dir(models_dir);
        config.forest.n_estimators = 15;
        config
    }

    /// Three intraoral classes with clearly separable color and shape
    fn write_training_set(root: &Path) -> Vec<(PathBuf, Category)> {
        let classes = [
            (Category::IntraoralFront, [200u8, 60, 60], (300u32, 200u32)),
            (Category::LowerOcclusal, [60, 200, 60], (200, 300)),
            (Category::UpperOcclusal, [60, 60, 200], (240, 240)),
        ];
        let mut written = Vec::new();
        for (category, color, (w, h)) in classes {
            let dir = root.join(category.as_str());
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..6u8 {
                let shade = Rgb([
                    color[0].saturating_add(i * 3),
                    color[1].saturating_add(i * 2),
                    color[2].saturating_add(i),
                ]);
                let path = dir.join(format!("sample_{}.png", i));
                RgbImage::from_pixel(w, h, shade).save(&path).unwrap();
                written.push((path, category));
            }
        }
        written
    }

    #[test]
    fn test_untrained_returns_fallback() {
        let temp_dir = TempDir::new().unwrap();
        let image_path = temp_dir.path().join("black.png");
        RgbImage::from_pixel(300, 200, Rgb([0, 0, 0]))
            .save(&image_path)
            .unwrap();

        let classifier = StatisticalClassifier::untrained(&test_config(temp_dir.path()));
        let result = classifier.classify_image(&image_path);

        assert!(!classifier.is_trained());
        assert_eq!(result, ClassificationResult::not_trained(STATISTICAL_MODEL_NAME));
    }

    #[test]
    fn test_train_and_classify() {
        let temp_dir = TempDir::new().unwrap();
        let data_dir = temp_dir.path().join("training_data");
        let samples = write_training_set(&data_dir);

        let classifier = StatisticalClassifier::untrained(&test_config(temp_dir.path()));
        let report = classifier.train(&data_dir);

        assert!(report.is_success(), "{:?}", report.error);
        assert_eq!(report.num_samples, 18);
        assert_eq!(report.train_accuracy, report.val_accuracy);
        assert!(classifier.is_trained());
        assert_eq!(classifier.metadata().num_samples, 18);

        for (path, category) in &samples {
            let result = classifier.classify_image(path);
            assert_eq!(result.category, *category);
            assert_eq!(result.probabilities.len(), 9);
            assert!((result.probability_mass() - 1.0).abs() < 1e-5);
            assert!(result.error.is_none());
        }
    }

    #[test]
    fn test_classification_is_repeatable() {
        let temp_dir = TempDir::new().unwrap();
        let data_dir = temp_dir.path().join("training_data");
        let samples = write_training_set(&data_dir);

        let classifier = StatisticalClassifier::untrained(&test_config(temp_dir.path()));
        assert!(classifier.train(&data_dir).is_success());

        let first = classifier.classify_image(&samples[0].0);
        let second = classifier.classify_image(&samples[0].0);
        assert_eq!(first, second);
    }

    #[test]
    fn test_failed_training_keeps_previous_model() {
        let temp_dir = TempDir::new().unwrap();
        let data_dir = temp_dir.path().join("training_data");
        write_training_set(&data_dir);

        let classifier = StatisticalClassifier::untrained(&test_config(temp_dir.path()));
        assert!(classifier.train(&data_dir).is_success());
        let before = classifier.metadata();

        let report = classifier.train(&temp_dir.path().join("empty"));
        assert!(!report.is_success());
        assert!(classifier.is_trained());
        assert_eq!(classifier.metadata(), before);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let data_dir = temp_dir.path().join("training_data");
        let samples = write_training_set(&data_dir);
        let config = test_config(&temp_dir.path().join("models"));

        let classifier = StatisticalClassifier::untrained(&config);
        assert!(matches!(classifier.save(), Err(Error::NotTrained)));
        assert!(classifier.train(&data_dir).is_success());
        classifier.save().unwrap();
        assert!(config.statistical_bundle_path().is_file());

        let restored = StatisticalClassifier::load(&config);
        assert!(restored.is_trained());
        for (path, _) in &samples {
            assert_eq!(restored.classify_image(path), classifier.classify_image(path));
        }
    }

    #[test]
    fn test_corrupt_bundle_loads_untrained() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(temp_dir.path());
        std::fs::write(config.statistical_bundle_path(), b"{not json").unwrap();

        let classifier = StatisticalClassifier::load(&config);
        assert!(!classifier.is_trained());
    }

    /// Train and save, then hand the saved JSON to `edit` and write it back
    fn saved_bundle_with(
        temp_dir: &TempDir,
        edit: impl Fn(&mut serde_json::Value),
    ) -> (ClassifierConfig, Vec<(PathBuf, Category)>) {
        let data_dir = temp_dir.path().join("training_data");
        let samples = write_training_set(&data_dir);
        let config = test_config(&temp_dir.path().join("models"));

        let classifier = StatisticalClassifier::untrained(&config);
        assert!(classifier.train(&data_dir).is_success());
        classifier.save().unwrap();

        let path = config.statistical_bundle_path();
        let mut bundle: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        edit(&mut bundle);
        std::fs::write(&path, serde_json::to_vec(&bundle).unwrap()).unwrap();
        (config, samples)
    }

    #[test]
    fn test_inconsistent_bundle_loads_untrained() {
        let temp_dir = TempDir::new().unwrap();
        let (config, samples) = saved_bundle_with(&temp_dir, |bundle| {
            let split = bundle["forest"]["trees"][0]["nodes"]
                .as_array_mut()
                .unwrap()
                .iter_mut()
                .find_map(|node| node.get_mut("Split"))
                .expect("trained tree has a split");
            split["feature"] = 99.into();
        });

        assert!(ModelBundle::read(&config.statistical_bundle_path()).is_err());
        let classifier = StatisticalClassifier::load(&config);
        assert!(!classifier.is_trained());
        assert_eq!(
            classifier.classify_image(&samples[0].0),
            ClassificationResult::not_trained(STATISTICAL_MODEL_NAME)
        );
    }

    #[test]
    fn test_mismatched_bundle_parts_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let (config, _) = saved_bundle_with(&temp_dir, |bundle| {
            bundle["scaler"]["mean"].as_array_mut().unwrap().pop();
        });
        assert!(!StatisticalClassifier::load(&config).is_trained());

        let temp_dir = TempDir::new().unwrap();
        let (config, _) = saved_bundle_with(&temp_dir, |bundle| {
            bundle["encoder"]["classes"]
                .as_array_mut()
                .unwrap()
                .push("extraoral_zoomed_smile".into());
        });
        assert!(!StatisticalClassifier::load(&config).is_trained());
    }

    #[test]
    fn test_saved_bundle_validates() {
        let temp_dir = TempDir::new().unwrap();
        let (config, _) = saved_bundle_with(&temp_dir, |_| {});
        ModelBundle::read(&config.statistical_bundle_path())
            .unwrap()
            .validate()
            .unwrap();
    }

    #[test]
    fn test_undecodable_image_falls_back_with_error() {
        let temp_dir = TempDir::new().unwrap();
        let data_dir = temp_dir.path().join("training_data");
        write_training_set(&data_dir);

        let classifier = StatisticalClassifier::untrained(&test_config(temp_dir.path()));
        assert!(classifier.train(&data_dir).is_success());

        let broken = temp_dir.path().join("broken.jpg");
        std::fs::write(&broken, b"garbage").unwrap();

        let result = classifier.classify_image(&broken);
        assert!(result.is_fallback());
        assert_eq!(result.category, Category::IntraoralFront);
        assert_eq!(result.model_used, STATISTICAL_MODEL_NAME);
        assert!(classifier.try_classify(&broken).is_err());
    }
}
