//! Application configuration

use crate::Cli;
use dentview_classifiers::{ClassifierConfig, DeviceSpec};
use dentview_training::{RetrainerConfig, TrainingConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level `dentview.yaml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Model paths, device and training hyper-parameters
    #[serde(default)]
    pub classifiers: ClassifierConfig,

    /// Training sample store
    #[serde(default)]
    pub training: TrainingConfig,

    /// Background retraining schedule
    #[serde(default)]
    pub retrainer: RetrainerConfig,
}

impl AppConfig {
    /// Load configuration from file and CLI overrides
    pub fn load(config_path: &Path, cli: &Cli) -> anyhow::Result<Self> {
        // Try to load from file, or use defaults
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)?;
            serde_yaml::from_str(&content)?
        } else {
            Self::default()
        };

        // Apply CLI overrides
        if let Some(dir) = &cli.models_dir {
            config.classifiers.models_dir = dir.clone();
        }

        if let Some(dir) = &cli.data_dir {
            config.training.data_dir = dir.clone();
        }

        if let Some(device) = &cli.device {
            config.classifiers.device = device
                .parse::<DeviceSpec>()
                .map_err(anyhow::Error::msg)?;
        }

        Ok(config)
    }
}
