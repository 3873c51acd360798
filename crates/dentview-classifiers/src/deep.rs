//! ResNet-18 view classifier built on Candle
//!
//! The network is Candle's ResNet-18 trunk, started from ImageNet weights,
//! with its 1000-way layer replaced by a new 9-way linear head. Inference runs
//! on a decoded, 224x224, ImageNet-normalized NCHW tensor. Fine-tuning builds
//! a fresh `VarMap`, seeds it from the active weights, and only replaces the
//! served network once every epoch has completed.

use crate::classifier::{probability_map, refine_prediction, ClassifierKind, ViewClassifier};
use crate::config::{ClassifierConfig, DeepTrainingConfig};
use crate::dataset::LabeledImageSet;
use crate::features::load_image;
use crate::forest::argmax;
use crate::model_loader::{
    create_device, metadata_sidecar, require_model_file, resolve_backbone_weights, write_atomically,
};
use crate::refiner::RuleRefiner;
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{AdamW, Func, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use chrono::Utc;
use dentview_core::{Category, ClassificationResult, Error, ModelMetadata, Result, TrainingReport};
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Identifier reported in `model_used`
pub const DEEP_MODEL_NAME: &str = "deep";

/// Network input resolution
pub const INPUT_SIZE: u32 = 224;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Width of the pooled ResNet-18 features
const BACKBONE_FEATURES: usize = 512;

/// Variable prefix of the classification head
const HEAD_PREFIX: &str = "head";

/// Below this many samples validation reuses the training set
const MIN_SAMPLES_FOR_SPLIT: usize = 5;

fn candle_err(context: &str, err: candle_core::Error) -> Error {
    Error::classifier(format!("{}: {}", context, err))
}

/// Network plus the variables backing it
struct DeepState {
    network: Func<'static>,
    varmap: VarMap,
    metadata: ModelMetadata,
}

/// Convolutional view classifier
pub struct DeepClassifier {
    weights_path: PathBuf,
    training: DeepTrainingConfig,
    device: Device,
    refiner: RuleRefiner,
    state: RwLock<Arc<DeepState>>,
}

impl DeepClassifier {
    /// Pretrained backbone with a fresh, untrained head
    ///
    /// Used to bootstrap the first fine-tune before any weights exist. The
    /// backbone weights come from [`ClassifierConfig::backbone`]; with
    /// `pretrained: false` the whole network starts from random init.
    pub fn untrained(config: &ClassifierConfig) -> Result<Self> {
        let device = create_device(config.device.to_device_type())?;
        let varmap = VarMap::new();
        let network = build_network(&varmap, &device)?;

        if config.backbone.pretrained {
            let path = resolve_backbone_weights(&config.backbone)?;
            let loaded = load_backbone(&varmap, &path, &device)?;
            info!(
                "Initialized deep backbone from {} ({} tensors)",
                path.display(),
                loaded
            );
        } else {
            warn!("Deep backbone starts from random weights");
        }

        Ok(Self::with_state(
            config,
            device,
            DeepState {
                network,
                varmap,
                metadata: ModelMetadata::default(),
            },
        ))
    }

    /// Load persisted weights and their metadata sidecar
    ///
    /// Fails with [`Error::WeightsMissing`] when the weights file does not
    /// exist and with [`Error::Classifier`] when it cannot be loaded.
    pub fn load(config: &ClassifierConfig) -> Result<Self> {
        let weights_path = config.deep_weights_path();
        require_model_file(&weights_path)?;

        let device = create_device(config.device.to_device_type())?;
        let mut varmap = VarMap::new();
        let network = build_network(&varmap, &device)?;
        varmap
            .load(&weights_path)
            .map_err(|e| candle_err("load weights", e))?;

        let metadata = read_metadata(&weights_path);
        info!(
            "Loaded deep model from {} (trained: {})",
            weights_path.display(),
            metadata.is_trained
        );

        Ok(Self::with_state(
            config,
            device,
            DeepState {
                network,
                varmap,
                metadata,
            },
        ))
    }

    fn with_state(config: &ClassifierConfig, device: Device, state: DeepState) -> Self {
        Self {
            weights_path: config.deep_weights_path(),
            training: config.deep_training.clone(),
            device,
            refiner: RuleRefiner::new(),
            state: RwLock::new(Arc::new(state)),
        }
    }

    /// Where [`ViewClassifier::save`] writes the weights
    pub fn weights_path(&self) -> &Path {
        &self.weights_path
    }

    fn snapshot(&self) -> Arc<DeepState> {
        self.state.read().clone()
    }

    fn image_tensor(&self, image: &RgbImage, flip: bool, brightness: f32) -> Result<Tensor> {
        let data = normalize(image, flip, brightness);
        let size = INPUT_SIZE as usize;
        Tensor::from_vec(data, (3, size, size), &self.device)
            .map_err(|e| candle_err("build input tensor", e))
    }

    fn batch(
        &self,
        images: &[(RgbImage, usize)],
        indices: &[usize],
        rng: Option<&mut StdRng>,
    ) -> Result<(Tensor, Tensor)> {
        let mut tensors = Vec::with_capacity(indices.len());
        let mut labels = Vec::with_capacity(indices.len());
        let mut rng = rng;
        for &i in indices {
            let (image, label) = &images[i];
            let (flip, brightness) = match rng.as_deref_mut() {
                Some(rng) => (rng.gen_bool(0.5), rng.gen_range(0.9f32..1.1)),
                None => (false, 1.0),
            };
            tensors.push(self.image_tensor(image, flip, brightness)?);
            labels.push(*label as u32);
        }
        let inputs = Tensor::stack(&tensors, 0).map_err(|e| candle_err("stack batch", e))?;
        let targets = Tensor::new(labels.as_slice(), &self.device)
            .map_err(|e| candle_err("build targets", e))?;
        Ok((inputs, targets))
    }

    fn accuracy(
        &self,
        network: &Func<'static>,
        images: &[(RgbImage, usize)],
        indices: &[usize],
    ) -> Result<f32> {
        if indices.is_empty() {
            return Ok(0.0);
        }
        let mut correct = 0.0f32;
        for chunk in indices.chunks(self.training.batch_size.max(1)) {
            let (inputs, targets) = self.batch(images, chunk, None)?;
            let logits = network
                .forward(&inputs)
                .map_err(|e| candle_err("forward", e))?;
            correct += count_correct(&logits, &targets)?;
        }
        Ok(correct / indices.len() as f32)
    }

    fn fit(&self, data_dir: &Path) -> Result<DeepState> {
        let dataset = LabeledImageSet::from_dir(data_dir)?;
        debug!(counts = ?dataset.counts(), "Deep training set");
        let mut images = Vec::with_capacity(dataset.len());
        for sample in dataset.samples() {
            match load_image(&sample.path) {
                Ok(image) => images.push((resize(&image), sample.category.index())),
                Err(e) => warn!("Skipping training image: {}", e),
            }
        }
        if images.is_empty() {
            return Err(Error::training("no decodable training images"));
        }

        let config = &self.training;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let (train_idx, val_idx) = split_indices(images.len(), config.val_fraction, &mut rng);

        let varmap = VarMap::new();
        let network = build_network(&varmap, &self.device)?;
        copy_weights(&self.snapshot().varmap, &varmap)?;

        let params = trainable_vars(&varmap)?;
        let mut optimizer = AdamW::new(
            params,
            ParamsAdamW {
                lr: config.learning_rate,
                ..Default::default()
            },
        )
        .map_err(|e| candle_err("create optimizer", e))?;

        let batch_size = config.batch_size.max(1);
        let mut train_accuracy = 0.0f32;
        for epoch in 1..=config.epochs {
            let mut order = train_idx.clone();
            order.shuffle(&mut rng);

            let mut total_loss = 0.0f32;
            let mut correct = 0.0f32;
            for chunk in order.chunks(batch_size) {
                let (inputs, targets) = self.batch(&images, chunk, Some(&mut rng))?;
                let logits = network
                    .forward(&inputs)
                    .map_err(|e| candle_err("forward", e))?;
                let loss = candle_nn::loss::cross_entropy(&logits, &targets)
                    .map_err(|e| candle_err("loss", e))?;
                optimizer
                    .backward_step(&loss)
                    .map_err(|e| candle_err("optimizer step", e))?;

                let loss = loss
                    .to_scalar::<f32>()
                    .map_err(|e| candle_err("read loss", e))?;
                total_loss += loss * chunk.len() as f32;
                correct += count_correct(&logits, &targets)?;
            }

            let n = order.len().max(1) as f32;
            train_accuracy = correct / n;
            info!(
                epoch,
                epochs = config.epochs,
                loss = total_loss / n,
                accuracy = train_accuracy,
                "Deep training epoch complete"
            );
        }

        let val_accuracy = self.accuracy(&network, &images, &val_idx)?;

        Ok(DeepState {
            network,
            varmap,
            metadata: ModelMetadata {
                is_trained: true,
                last_trained: Some(Utc::now()),
                train_accuracy: Some(train_accuracy),
                val_accuracy: Some(val_accuracy),
                num_samples: images.len(),
            },
        })
    }
}

impl ViewClassifier for DeepClassifier {
    fn name(&self) -> &str {
        DEEP_MODEL_NAME
    }

    fn kind(&self) -> ClassifierKind {
        ClassifierKind::Deep
    }

    fn is_trained(&self) -> bool {
        self.state.read().metadata.is_trained
    }

    fn metadata(&self) -> ModelMetadata {
        self.state.read().metadata.clone()
    }

    fn try_classify(&self, path: &Path) -> Result<ClassificationResult> {
        let state = self.snapshot();
        if !state.metadata.is_trained {
            return Ok(ClassificationResult::not_trained(self.name()));
        }

        let image = load_image(path)?;
        let input = self
            .image_tensor(&resize(&image), false, 1.0)?
            .unsqueeze(0)
            .map_err(|e| candle_err("add batch dim", e))?;
        let logits = state
            .network
            .forward(&input)
            .map_err(|e| candle_err("forward", e))?
            .detach();
        let proba = candle_nn::ops::softmax(&logits, D::Minus1)
            .and_then(|p| p.squeeze(0))
            .and_then(|p| p.to_vec1::<f32>())
            .map_err(|e| candle_err("softmax", e))?;

        let index = argmax(&proba);
        let category = Category::from_index(index)
            .ok_or_else(|| Error::classifier(format!("class index {} out of range", index)))?;
        let confidence = proba[index];
        debug!(
            path = %path.display(),
            category = %category,
            confidence,
            "Deep prediction"
        );

        let probabilities = probability_map(&Category::ALL, &proba);
        let result = ClassificationResult::new(category, confidence, probabilities, self.name());
        Ok(refine_prediction(&self.refiner, &image, result))
    }

    fn train(&self, data_dir: &Path) -> TrainingReport {
        let start = Instant::now();
        info!("Fine-tuning deep model from {}", data_dir.display());

        match self.fit(data_dir) {
            Ok(state) => {
                let metadata = state.metadata.clone();
                *self.state.write() = Arc::new(state);
                info!(
                    "Deep model trained on {} samples in {:?}",
                    metadata.num_samples,
                    start.elapsed()
                );
                TrainingReport::success(
                    metadata.train_accuracy.unwrap_or(0.0),
                    metadata.val_accuracy.unwrap_or(0.0),
                    metadata.num_samples,
                    self.training.epochs,
                )
            }
            Err(e) => {
                warn!("Deep training failed: {}", e);
                TrainingReport::failed(e.to_string())
            }
        }
    }

    fn save(&self) -> Result<()> {
        let state = self.snapshot();

        let mut tmp_name = self.weights_path.as_os_str().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);
        if let Some(parent) = self.weights_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        state
            .varmap
            .save(&tmp_path)
            .map_err(|e| candle_err("save weights", e))?;
        std::fs::rename(&tmp_path, &self.weights_path)?;

        let sidecar = serde_json::to_vec_pretty(&state.metadata)?;
        write_atomically(&metadata_sidecar(&self.weights_path), &sidecar)?;

        info!("Saved deep model to {}", self.weights_path.display());
        Ok(())
    }
}

/// Instantiate the ResNet-18 trunk and a 9-way head over `varmap`
fn build_network(varmap: &VarMap, device: &Device) -> Result<Func<'static>> {
    let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
    let backbone = candle_transformers::models::resnet::resnet18_no_final_layer(vb.clone())
        .map_err(|e| candle_err("build resnet18", e))?;
    let head = candle_nn::linear(BACKBONE_FEATURES, Category::COUNT, vb.pp(HEAD_PREFIX))
        .map_err(|e| candle_err("build head", e))?;
    Ok(Func::new(move |xs| xs.apply(&backbone)?.apply(&head)))
}

/// Overwrite every backbone variable with its pretrained tensor
///
/// Head variables keep their fresh init. Returns the number of tensors set.
fn load_backbone(varmap: &VarMap, path: &Path, device: &Device) -> Result<usize> {
    let pretrained = candle_core::safetensors::load(path, device)
        .map_err(|e| candle_err("read backbone weights", e))?;
    let data = varmap
        .data()
        .lock()
        .map_err(|_| Error::internal("weights lock poisoned"))?;

    let mut loaded = 0;
    for (name, var) in data.iter() {
        if name.starts_with(HEAD_PREFIX) {
            continue;
        }
        let tensor = pretrained.get(name).ok_or_else(|| {
            Error::classifier(format!(
                "backbone weights {} lack tensor {}",
                path.display(),
                name
            ))
        })?;
        let tensor = tensor
            .to_dtype(DType::F32)
            .map_err(|e| candle_err("convert backbone weights", e))?;
        var.set(&tensor)
            .map_err(|e| candle_err(&format!("set backbone tensor {}", name), e))?;
        loaded += 1;
    }
    Ok(loaded)
}

/// Copy every variable of `from` into the same-named variable of `to`
fn copy_weights(from: &VarMap, to: &VarMap) -> Result<()> {
    let source = from
        .data()
        .lock()
        .map_err(|_| Error::internal("weights lock poisoned"))?;
    let target = to
        .data()
        .lock()
        .map_err(|_| Error::internal("weights lock poisoned"))?;
    for (name, var) in target.iter() {
        if let Some(src) = source.get(name) {
            var.set(src.as_tensor())
                .map_err(|e| candle_err("copy weights", e))?;
        }
    }
    Ok(())
}

/// Variables the optimizer updates; batch-norm running statistics are excluded
fn trainable_vars(varmap: &VarMap) -> Result<Vec<candle_core::Var>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| Error::internal("weights lock poisoned"))?;
    Ok(data
        .iter()
        .filter(|(name, _)| !name.contains("running_"))
        .map(|(_, var)| var.clone())
        .collect())
}

fn read_metadata(weights_path: &Path) -> ModelMetadata {
    let sidecar = metadata_sidecar(weights_path);
    match std::fs::read(&sidecar) {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            warn!("Unreadable model metadata {}: {}", sidecar.display(), e);
            ModelMetadata::default()
        }),
        Err(_) => ModelMetadata::default(),
    }
}

fn count_correct(logits: &Tensor, targets: &Tensor) -> Result<f32> {
    logits
        .argmax(D::Minus1)
        .and_then(|p| p.eq(targets))
        .and_then(|m| m.to_dtype(DType::F32))
        .and_then(|m| m.sum_all())
        .and_then(|s| s.to_scalar::<f32>())
        .map_err(|e| candle_err("accuracy", e))
}

fn resize(image: &DynamicImage) -> RgbImage {
    image
        .resize_exact(INPUT_SIZE, INPUT_SIZE, FilterType::Triangle)
        .to_rgb8()
}

/// CHW float buffer scaled to [0, 1] and ImageNet-normalized
fn normalize(image: &RgbImage, flip: bool, brightness: f32) -> Vec<f32> {
    let (w, h) = image.dimensions();
    let mut data = vec![0.0f32; 3 * (w * h) as usize];
    let plane = (w * h) as usize;
    for y in 0..h {
        for x in 0..w {
            let src_x = if flip { w - 1 - x } else { x };
            let pixel = image.get_pixel(src_x, y);
            let offset = (y * w + x) as usize;
            for c in 0..3 {
                let v = (f32::from(pixel[c]) / 255.0 * brightness).clamp(0.0, 1.0);
                data[c * plane + offset] = (v - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
            }
        }
    }
    data
}

/// Seeded train/validation split
fn split_indices(n: usize, val_fraction: f32, rng: &mut StdRng) -> (Vec<usize>, Vec<usize>) {
    let mut indices: Vec<usize> = (0..n).collect();
    if n < MIN_SAMPLES_FOR_SPLIT {
        return (indices.clone(), indices);
    }
    indices.shuffle(rng);
    let n_val = ((n as f32 * val_fraction).round() as usize).clamp(1, n - 1);
    let val = indices.split_off(n - n_val);
    (indices, val)
}
