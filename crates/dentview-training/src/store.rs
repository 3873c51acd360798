//! On-disk store of user-labeled training photographs
//!
//! Layout under the root:
//!
//! ```text
//! training_data/
//!   extraoral_frontal/20240512_101502_123456_IMG_0042.jpg
//!   ...
//!   other/
//!   training_log.json
//! ```
//!
//! The filesystem is the source of truth: statistics are recounted on every
//! call and nothing is cached in memory.

use crate::config::TrainingConfig;
use chrono::{DateTime, Utc};
use dentview_classifiers::model_loader::write_atomically;
use dentview_core::{is_image_file, list_images, Category, Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Bucket for samples whose label is not a known category
pub const OTHER_BUCKET: &str = "other";

/// One ingestion record in the training log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingLogEntry {
    pub timestamp: DateTime<Utc>,
    /// Where the copy was stored
    pub path: PathBuf,
    /// Bucket the sample was filed under
    pub category: String,
    /// Whether the automatic classification had been correct
    pub correct: bool,
}

/// Sample counts derived from the directory tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrainingStats {
    /// Images per category label; every category is present
    pub per_category: BTreeMap<String, usize>,
    /// Images in the `other` bucket (not used for training)
    pub other: usize,
    /// Sum over the nine categories
    pub total: usize,
}

impl TrainingStats {
    pub fn count(&self, category: Category) -> usize {
        self.per_category
            .get(category.as_str())
            .copied()
            .unwrap_or(0)
    }
}

/// Stores corrected samples and their ingestion history
pub struct TrainingDataStore {
    root: PathBuf,
    log_path: PathBuf,
    log_lock: Mutex<()>,
}

impl TrainingDataStore {
    /// Store rooted at `config.data_dir`; directories are created lazily
    pub fn new(config: &TrainingConfig) -> Self {
        Self {
            root: config.data_dir.clone(),
            log_path: config.data_dir.join(&config.log_file),
            log_lock: Mutex::new(()),
        }
    }

    /// Root directory, the layout classifiers train from
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy an image into the store under `category`
    ///
    /// Unknown labels go to the `other` bucket. The source file is left in
    /// place. Returns the path of the stored copy.
    pub fn add_sample(&self, image_path: &Path, category: &str, correct: bool) -> Result<PathBuf> {
        let bucket = match category.parse::<Category>() {
            Ok(category) => category.as_str(),
            Err(_) => {
                warn!(
                    "Unknown category '{}', filing {} under '{}'",
                    category,
                    image_path.display(),
                    OTHER_BUCKET
                );
                OTHER_BUCKET
            }
        };

        let original_name = image_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::training(format!("invalid sample path: {}", image_path.display())))?;

        let now = Utc::now();
        let dir = self.root.join(bucket);
        std::fs::create_dir_all(&dir)?;
        let destination = dir.join(format!(
            "{}_{}",
            now.format("%Y%m%d_%H%M%S_%6f"),
            original_name
        ));
        std::fs::copy(image_path, &destination)?;

        self.append_log(TrainingLogEntry {
            timestamp: now,
            path: destination.clone(),
            category: bucket.to_string(),
            correct,
        })?;

        info!(
            category = bucket,
            correct,
            "Stored training sample {}",
            destination.display()
        );
        Ok(destination)
    }

    /// Delete the first stored file named like `image_path`
    ///
    /// Category directories are searched in label order, then `other`.
    /// Returns `Ok(false)` when nothing matched.
    pub fn remove_sample(&self, image_path: &Path) -> Result<bool> {
        let Some(name) = image_path.file_name() else {
            return Ok(false);
        };

        for bucket in Self::buckets() {
            let candidate = self.root.join(bucket).join(name);
            if is_sample_file(&candidate) {
                std::fs::remove_file(&candidate)?;
                info!("Removed training sample {}", candidate.display());
                return Ok(true);
            }
        }

        debug!("No training sample named {:?}", name);
        Ok(false)
    }

    /// Count stored images per category
    pub fn get_stats(&self) -> Result<TrainingStats> {
        let mut stats = TrainingStats::default();
        for category in Category::ALL {
            let count = list_images(&self.root.join(category.as_str()))?.len();
            stats.per_category.insert(category.as_str().to_string(), count);
            stats.total += count;
        }
        stats.other = list_images(&self.root.join(OTHER_BUCKET))?.len();
        Ok(stats)
    }

    /// Every stored image across all buckets
    pub fn samples(&self) -> Result<Vec<PathBuf>> {
        let mut all = Vec::new();
        for bucket in Self::buckets() {
            all.extend(list_images(&self.root.join(bucket))?);
        }
        Ok(all)
    }

    /// Ingestion log, oldest first
    pub fn history(&self) -> Result<Vec<TrainingLogEntry>> {
        let _guard = self.log_lock.lock();
        self.read_log()
    }

    fn buckets() -> impl Iterator<Item = &'static str> {
        Category::ALL
            .into_iter()
            .map(|c| c.as_str())
            .chain(std::iter::once(OTHER_BUCKET))
    }

    fn read_log(&self) -> Result<Vec<TrainingLogEntry>> {
        match std::fs::read(&self.log_path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn append_log(&self, entry: TrainingLogEntry) -> Result<()> {
        let _guard = self.log_lock.lock();
        let mut entries = match self.read_log() {
            Ok(entries) => entries,
            Err(e) => {
                let aside = self.set_aside_log(entry.timestamp)?;
                warn!(
                    "Training log {} unreadable ({}), moved to {} and starting a new one",
                    self.log_path.display(),
                    e,
                    aside.display()
                );
                Vec::new()
            }
        };
        entries.push(entry);
        let json = serde_json::to_vec_pretty(&entries)?;
        write_atomically(&self.log_path, &json)
    }

    /// Rename an unreadable log out of the way so its history is kept
    fn set_aside_log(&self, now: DateTime<Utc>) -> Result<PathBuf> {
        let mut name = self
            .log_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".corrupt-{}", now.format("%Y%m%d_%H%M%S_%6f")));
        let aside = self.log_path.with_file_name(name);
        std::fs::rename(&self.log_path, &aside)?;
        Ok(aside)
    }
}

/// Whether `path` would be counted by [`TrainingDataStore::get_stats`]
pub fn is_sample_file(path: &Path) -> bool {
    path.is_file() && is_image_file(path)
}
