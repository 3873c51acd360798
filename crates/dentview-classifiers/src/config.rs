//! Configuration for view classifiers and model persistence

use crate::DeviceType;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for both classifier variants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Directory holding persisted model files
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    /// Deep-network weights file name, relative to `models_dir`
    #[serde(default = "default_deep_weights")]
    pub deep_weights: PathBuf,

    /// Statistical bundle file name, relative to `models_dir`
    #[serde(default = "default_statistical_bundle")]
    pub statistical_bundle: PathBuf,

    /// Try the deep variant before the statistical one
    #[serde(default = "default_true")]
    pub prefer_deep: bool,

    /// Device to run the deep variant on
    #[serde(default)]
    pub device: DeviceSpec,

    /// Random forest hyper-parameters
    #[serde(default)]
    pub forest: ForestConfig,

    /// Fine-tuning parameters for the deep variant
    #[serde(default)]
    pub deep_training: DeepTrainingConfig,

    /// Pretrained weights the deep variant is fine-tuned from
    #[serde(default)]
    pub backbone: BackboneConfig,
}

/// Random forest hyper-parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestConfig {
    #[serde(default = "default_n_estimators")]
    pub n_estimators: usize,

    /// Maximum tree depth (unbounded when absent)
    #[serde(default)]
    pub max_depth: Option<usize>,

    #[serde(default = "default_min_samples_split")]
    pub min_samples_split: usize,

    #[serde(default = "default_seed")]
    pub seed: u64,
}

/// Deep-network fine-tuning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepTrainingConfig {
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// Fraction of samples held out for validation
    #[serde(default = "default_val_fraction")]
    pub val_fraction: f32,

    #[serde(default = "default_seed")]
    pub seed: u64,
}

/// Where the ImageNet-pretrained ResNet-18 backbone comes from
///
/// A local file wins over the Hugging Face Hub. Tensor names follow the timm
/// layout (`conv1.weight`, `layer1.0.bn1.running_mean`, ...); the original
/// 1000-way `fc` layer is ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackboneConfig {
    /// Start fine-tuning from pretrained weights; random init when false
    #[serde(default = "default_true")]
    pub pretrained: bool,

    /// Hugging Face model repository
    #[serde(default = "default_backbone_repo")]
    pub repo_id: String,

    /// Repository revision (defaults to `main`)
    #[serde(default)]
    pub revision: Option<String>,

    /// Safetensors file inside the repository
    #[serde(default = "default_backbone_file")]
    pub filename: String,

    /// Local safetensors file used instead of the hub
    #[serde(default)]
    pub local_path: Option<PathBuf>,
}

/// Device specification (for config files)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceSpec {
    #[default]
    Cpu,
    Cuda { index: Option<usize> },
    Metal { index: Option<usize> },
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            deep_weights: default_deep_weights(),
            statistical_bundle: default_statistical_bundle(),
            prefer_deep: true,
            device: DeviceSpec::Cpu,
            forest: ForestConfig::default(),
            deep_training: DeepTrainingConfig::default(),
            backbone: BackboneConfig::default(),
        }
    }
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            pretrained: true,
            repo_id: default_backbone_repo(),
            revision: None,
            filename: default_backbone_file(),
            local_path: None,
        }
    }
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            n_estimators: default_n_estimators(),
            max_depth: None,
            min_samples_split: default_min_samples_split(),
            seed: default_seed(),
        }
    }
}

impl Default for DeepTrainingConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            learning_rate: default_learning_rate(),
            val_fraction: default_val_fraction(),
            seed: default_seed(),
        }
    }
}

impl ClassifierConfig {
    /// Load from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Config rooted at a different models directory
    pub fn with_models_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.models_dir = dir.into();
        self
    }

    /// Full path of the deep-network weights file
    pub fn deep_weights_path(&self) -> PathBuf {
        self.models_dir.join(&self.deep_weights)
    }

    /// Full path of the statistical model bundle
    pub fn statistical_bundle_path(&self) -> PathBuf {
        self.models_dir.join(&self.statistical_bundle)
    }
}

impl DeviceSpec {
    /// Convert to DeviceType
    pub fn to_device_type(&self) -> DeviceType {
        match self {
            DeviceSpec::Cpu => DeviceType::Cpu,
            DeviceSpec::Cuda { index } => DeviceType::Cuda(index.unwrap_or(0)),
            DeviceSpec::Metal { index } => DeviceType::Metal(index.unwrap_or(0)),
        }
    }
}

impl std::str::FromStr for DeviceSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda { index: None }),
            "metal" | "mps" => Ok(Self::Metal { index: None }),
            other => Err(format!("unknown device '{}'", other)),
        }
    }
}

fn default_models_dir() -> PathBuf {
    PathBuf::from("./models")
}

fn default_deep_weights() -> PathBuf {
    PathBuf::from("view_resnet18.safetensors")
}

fn default_statistical_bundle() -> PathBuf {
    PathBuf::from("view_forest.json")
}

fn default_backbone_repo() -> String {
    "timm/resnet18.a1_in1k".to_string()
}

fn default_backbone_file() -> String {
    "model.safetensors".to_string()
}

fn default_true() -> bool {
    true
}

fn default_n_estimators() -> usize {
    100
}

fn default_min_samples_split() -> usize {
    2
}

fn default_seed() -> u64 {
    42
}

fn default_epochs() -> usize {
    5
}

fn default_batch_size() -> usize {
    8
}

fn default_learning_rate() -> f64 {
    1e-4
}

fn default_val_fraction() -> f32 {
    0.2
}
