//! Color, texture and geometry descriptors for the statistical classifier
//!
//! Every image is normalized to RGB and resampled onto a fixed 224x224 canvas
//! before statistics are taken, so the descriptor length never depends on the
//! input size. The aspect ratio is discarded by the resampling and is recorded
//! from the original dimensions instead.

use dentview_core::{Error, FeatureVector, Result, FEATURE_LEN};
use image::imageops::FilterType;
use image::DynamicImage;
use std::path::Path;
use tracing::{debug, warn};

/// Side length of the analysis canvas
pub const CANVAS_SIZE: u32 = 224;

/// Gradient magnitude above which a pixel counts as an edge (0-255 scale)
const EDGE_THRESHOLD: f32 = 30.0;

/// Decode an image file
pub fn load_image(path: &Path) -> Result<DynamicImage> {
    image::open(path)
        .map_err(|e| Error::image(format!("Failed to decode {}: {}", path.display(), e)))
}

/// Extracts the 17-value [`FeatureVector`] from photographs
#[derive(Debug, Clone, Copy)]
pub struct FeatureExtractor {
    canvas: u32,
}

impl FeatureExtractor {
    /// Create an extractor using the standard 224x224 canvas
    pub fn new() -> Self {
        Self {
            canvas: CANVAS_SIZE,
        }
    }

    /// Extract features from an image file, returning zeros on any failure
    pub fn extract_path(&self, path: &Path) -> FeatureVector {
        match self.try_extract_path(path) {
            Ok(features) => features,
            Err(e) => {
                warn!("Feature extraction failed for {}: {}", path.display(), e);
                FeatureVector::zeros()
            }
        }
    }

    /// Extract features from a decoded image, returning zeros on any failure
    pub fn extract(&self, image: &DynamicImage) -> FeatureVector {
        match self.try_extract(image) {
            Ok(features) => features,
            Err(e) => {
                warn!("Feature extraction failed: {}", e);
                FeatureVector::zeros()
            }
        }
    }

    /// Fallible variant of [`FeatureExtractor::extract_path`]
    pub fn try_extract_path(&self, path: &Path) -> Result<FeatureVector> {
        let image = load_image(path)?;
        self.try_extract(&image)
    }

    /// Fallible variant of [`FeatureExtractor::extract`]
    pub fn try_extract(&self, image: &DynamicImage) -> Result<FeatureVector> {
        let (orig_w, orig_h) = (image.width(), image.height());
        if orig_w == 0 || orig_h == 0 {
            return Err(Error::image("image has zero width or height"));
        }

        let size = self.canvas as usize;
        let rgb = image
            .resize_exact(self.canvas, self.canvas, FilterType::Triangle)
            .to_rgb8();

        let mut channels: [Vec<f32>; 3] = [
            Vec::with_capacity(size * size),
            Vec::with_capacity(size * size),
            Vec::with_capacity(size * size),
        ];
        let mut gray = Vec::with_capacity(size * size);
        for pixel in rgb.pixels() {
            let [r, g, b] = pixel.0.map(f32::from);
            channels[0].push(r);
            channels[1].push(g);
            channels[2].push(b);
            gray.push(luma(r, g, b));
        }

        let mut values = [0.0f32; FEATURE_LEN];
        for (c, channel) in channels.iter().enumerate() {
            let (mean, std) = mean_std(channel);
            values[c] = mean;
            values[3 + c] = std;
        }

        let gradients = Gradients::compute(&gray, size, size);
        let (gray_mean, gray_std) = mean_std(&gray);
        let halves = half_means(&gray, size, size);

        values[6] = gradients.mean_abs_x;
        values[7] = gradients.mean_abs_y;
        values[8] = gray_std;
        values[9] = gradients.edge_density(EDGE_THRESHOLD);
        values[10] = orig_w as f32 / orig_h as f32;
        values[11] = gray_mean;
        values[12] = gray_std;
        values[13] = halves.top;
        values[14] = halves.bottom;
        values[15] = halves.left;
        values[16] = halves.right;

        if values.iter().any(|v| !v.is_finite()) {
            return Err(Error::image("non-finite feature value"));
        }

        debug!(
            width = orig_w,
            height = orig_h,
            brightness = gray_mean,
            "Extracted image features"
        );

        Ok(FeatureVector(values))
    }
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// ITU-R 601 luma
pub(crate) fn luma(r: f32, g: f32, b: f32) -> f32 {
    0.299 * r + 0.587 * g + 0.114 * b
}

/// Mean and population standard deviation
pub(crate) fn mean_std(values: &[f32]) -> (f32, f32) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().map(|v| *v as f64).sum::<f64>() / n;
    let var = values
        .iter()
        .map(|v| {
            let d = *v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    (mean as f32, var.sqrt() as f32)
}

/// Forward-difference gradients of a row-major grayscale buffer
pub(crate) struct Gradients {
    pub mean_abs_x: f32,
    pub mean_abs_y: f32,
    /// Magnitude per pixel (zero on the last row and column)
    pub magnitude: Vec<f32>,
    width: usize,
    height: usize,
}

impl Gradients {
    pub fn compute(gray: &[f32], width: usize, height: usize) -> Self {
        let mut sum_x = 0.0f64;
        let mut sum_y = 0.0f64;
        let mut magnitude = vec![0.0f32; width * height];

        for y in 0..height {
            for x in 0..width {
                let idx = y * width + x;
                let dx = if x + 1 < width { gray[idx + 1] - gray[idx] } else { 0.0 };
                let dy = if y + 1 < height { gray[idx + width] - gray[idx] } else { 0.0 };
                sum_x += dx.abs() as f64;
                sum_y += dy.abs() as f64;
                if x + 1 < width && y + 1 < height {
                    magnitude[idx] = (dx * dx + dy * dy).sqrt();
                }
            }
        }

        let nx = (width.saturating_sub(1) * height).max(1) as f64;
        let ny = (width * height.saturating_sub(1)).max(1) as f64;

        Self {
            mean_abs_x: (sum_x / nx) as f32,
            mean_abs_y: (sum_y / ny) as f32,
            magnitude,
            width,
            height,
        }
    }

    /// Fraction of interior pixels whose magnitude exceeds `threshold`
    pub fn edge_density(&self, threshold: f32) -> f32 {
        self.region_edge_density(0..self.height.saturating_sub(1), 0..self.width.saturating_sub(1), threshold)
    }

    /// Edge density restricted to a row/column window
    pub fn region_edge_density(
        &self,
        rows: std::ops::Range<usize>,
        cols: std::ops::Range<usize>,
        threshold: f32,
    ) -> f32 {
        let mut total = 0usize;
        let mut edges = 0usize;
        for y in rows {
            for x in cols.clone() {
                total += 1;
                if self.magnitude[y * self.width + x] > threshold {
                    edges += 1;
                }
            }
        }
        if total == 0 {
            0.0
        } else {
            edges as f32 / total as f32
        }
    }
}

/// Mean brightness of the four image halves
pub(crate) struct HalfMeans {
    pub top: f32,
    pub bottom: f32,
    pub left: f32,
    pub right: f32,
}

pub(crate) fn half_means(gray: &[f32], width: usize, height: usize) -> HalfMeans {
    let (mut top, mut bottom, mut left, mut right) = (0.0f64, 0.0f64, 0.0f64, 0.0f64);
    let (mid_y, mid_x) = (height / 2, width / 2);

    for y in 0..height {
        for x in 0..width {
            let v = gray[y * width + x] as f64;
            if y < mid_y {
                top += v;
            } else {
                bottom += v;
            }
            if x < mid_x {
                left += v;
            } else {
                right += v;
            }
        }
    }

    let avg = |sum: f64, count: usize| if count == 0 { 0.0 } else { (sum / count as f64) as f32 };
    HalfMeans {
        top: avg(top, mid_y * width),
        bottom: avg(bottom, (height - mid_y) * width),
        left: avg(left, mid_x * height),
        right: avg(right, (width - mid_x) * height),
    }
}
