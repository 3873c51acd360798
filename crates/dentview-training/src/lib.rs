//! DentView Training
//!
//! Everything around the classifiers that keeps them improving.
//!
//! Provides:
//! - An on-disk store of corrected photographs with an ingestion log
//! - A background worker that retrains the active classifier
//! - The service facade used by the upload layer

pub mod config;
pub mod metrics;
pub mod retrainer;
pub mod service;
pub mod store;

pub use config::{RetrainerConfig, TrainingConfig};
pub use metrics::{MetricsSnapshot, ServiceMetrics};
pub use retrainer::{
    should_retrain, BackgroundRetrainer, CycleOutcome, RetrainTrigger, RetrainerState,
};
pub use service::{ModelStatus, PhotoClassificationService};
pub use store::{TrainingDataStore, TrainingLogEntry, TrainingStats, OTHER_BUCKET};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::retrainer::BackgroundRetrainer;
    pub use crate::service::PhotoClassificationService;
    pub use crate::store::TrainingDataStore;
}
