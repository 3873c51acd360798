//! Labeled image folders used for (re)training

use dentview_core::{list_images, Category, Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One labeled training image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledImage {
    pub path: PathBuf,
    pub category: Category,
}

/// Images grouped by category-named subdirectories
///
/// Only the nine view directories are read; anything else under the root
/// (the `other` bucket, logs) is ignored.
#[derive(Debug, Clone, Default)]
pub struct LabeledImageSet {
    samples: Vec<LabeledImage>,
}

impl LabeledImageSet {
    /// Scan `<root>/<category>/*` for images
    pub fn from_dir(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::training(format!(
                "training data directory not found: {}",
                root.display()
            )));
        }

        let mut samples = Vec::new();
        for category in Category::ALL {
            let dir = root.join(category.as_str());
            let images = list_images(&dir)?;
            debug!("Found {} images for {}", images.len(), category);
            samples.extend(images.into_iter().map(|path| LabeledImage { path, category }));
        }

        if samples.is_empty() {
            return Err(Error::training(format!(
                "no labeled images under {}",
                root.display()
            )));
        }

        info!("Loaded {} labeled images from {}", samples.len(), root.display());
        Ok(Self { samples })
    }

    pub fn samples(&self) -> &[LabeledImage] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Number of images per category
    pub fn counts(&self) -> BTreeMap<Category, usize> {
        let mut counts = BTreeMap::new();
        for sample in &self.samples {
            *counts.entry(sample.category).or_insert(0) += 1;
        }
        counts
    }
}
