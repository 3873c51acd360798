//! Configuration for the training store and the background retrainer

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Where corrected samples are stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Root of the `<category>/` sample folders
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Ingestion log file name, relative to `data_dir`
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

/// Background retraining schedule and thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrainerConfig {
    /// Seconds between checks
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Seconds to wait after a failed retrain
    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: u64,

    /// Minimum stored samples before any retrain
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    /// Once trained and retrained, retrain whenever the total is a multiple of this
    #[serde(default = "default_retrain_every")]
    pub retrain_every: usize,

    /// Seconds `stop()` waits for the worker to finish
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_file: default_log_file(),
        }
    }
}

impl TrainingConfig {
    /// Config rooted at a different data directory
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }
}

impl Default for RetrainerConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            error_backoff_secs: default_error_backoff_secs(),
            min_samples: default_min_samples(),
            retrain_every: default_retrain_every(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl RetrainerConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./training_data")
}

fn default_log_file() -> String {
    "training_log.json".to_string()
}

fn default_check_interval_secs() -> u64 {
    300
}

fn default_error_backoff_secs() -> u64 {
    60
}

fn default_min_samples() -> usize {
    20
}

fn default_retrain_every() -> usize {
    25
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}
