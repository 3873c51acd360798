//! Random forest, feature scaler and label encoder for the statistical classifier
//!
//! Trees are CART classifiers grown on bootstrap resamples with Gini impurity
//! and `sqrt(n_features)` candidate features per split. Class probabilities
//! are the mean of the per-tree leaf distributions. Everything serializes
//! with serde so a saved bundle reproduces predictions exactly.

use crate::config::ForestConfig;
use dentview_core::{Category, Error, Result};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Standardizes features to zero mean and unit variance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f32>,
    pub scale: Vec<f32>,
}

impl StandardScaler {
    /// Fit per-column mean and standard deviation
    pub fn fit(rows: &[Vec<f32>]) -> Result<Self> {
        let first = rows
            .first()
            .ok_or_else(|| Error::training("cannot fit scaler on an empty dataset"))?;
        let n_features = first.len();
        let n = rows.len() as f64;

        let mut mean = vec![0.0f64; n_features];
        for row in rows {
            if row.len() != n_features {
                return Err(Error::training("inconsistent feature vector lengths"));
            }
            for (m, v) in mean.iter_mut().zip(row) {
                *m += *v as f64;
            }
        }
        mean.iter_mut().for_each(|m| *m /= n);

        let mut var = vec![0.0f64; n_features];
        for row in rows {
            for ((acc, v), m) in var.iter_mut().zip(row).zip(&mean) {
                let d = *v as f64 - m;
                *acc += d * d;
            }
        }

        // Constant columns keep a unit scale
        let scale = var
            .iter()
            .map(|v| {
                let std = (v / n).sqrt();
                if std > 1e-12 {
                    std as f32
                } else {
                    1.0
                }
            })
            .collect();

        Ok(Self {
            mean: mean.into_iter().map(|m| m as f32).collect(),
            scale,
        })
    }

    pub fn transform(&self, row: &[f32]) -> Result<Vec<f32>> {
        if row.len() != self.mean.len() {
            return Err(Error::classifier(format!(
                "expected {} features, got {}",
                self.mean.len(),
                row.len()
            )));
        }
        Ok(row
            .iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(v, (m, s))| (v - m) / s)
            .collect())
    }
}

/// Maps categories to contiguous class indices
///
/// Classes are the sorted set of categories seen during training, which may be
/// a subset of all nine views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelEncoder {
    pub classes: Vec<Category>,
}

impl LabelEncoder {
    pub fn fit(labels: &[Category]) -> Self {
        let mut classes = labels.to_vec();
        classes.sort();
        classes.dedup();
        Self { classes }
    }

    pub fn encode(&self, category: Category) -> Option<usize> {
        self.classes.binary_search(&category).ok()
    }

    pub fn decode(&self, index: usize) -> Option<Category> {
        self.classes.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

/// Node of a decision tree, stored in a flat arena
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f32,
        left: usize,
        right: usize,
    },
    Leaf {
        /// Class distribution of the training samples in this leaf
        distribution: Vec<f32>,
    },
}

/// A single CART classification tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    nodes: Vec<TreeNode>,
}

impl DecisionTree {
    /// Leaf distribution reached by `row`
    ///
    /// Out-of-range indices fail instead of panicking, so a damaged tree that
    /// skipped [`DecisionTree::validate`] still cannot take down a caller.
    fn predict_distribution(&self, row: &[f32]) -> Result<&[f32]> {
        let mut idx = 0;
        // Children always point forward, so a walk visits at most every node once
        for _ in 0..self.nodes.len() {
            match self.nodes.get(idx) {
                Some(TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                }) => {
                    let value = row.get(*feature).ok_or_else(|| {
                        Error::classifier(format!("split on missing feature {}", feature))
                    })?;
                    idx = if *value <= *threshold { *left } else { *right };
                }
                Some(TreeNode::Leaf { distribution }) => return Ok(distribution),
                None => break,
            }
        }
        Err(Error::classifier(format!("tree walk left the arena at node {}", idx)))
    }

    /// Check the arena is a well-formed tree over `n_features` inputs and
    /// `n_classes` outputs
    pub fn validate(&self, n_features: usize, n_classes: usize) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(Error::classifier("empty decision tree"));
        }
        let n_nodes = self.nodes.len();
        for (i, node) in self.nodes.iter().enumerate() {
            match node {
                TreeNode::Split {
                    feature,
                    left,
                    right,
                    ..
                } => {
                    if *feature >= n_features {
                        return Err(Error::classifier(format!(
                            "node {} splits on feature {} of {}",
                            i, feature, n_features
                        )));
                    }
                    for child in [*left, *right] {
                        if child <= i || child >= n_nodes {
                            return Err(Error::classifier(format!(
                                "node {} has child {} outside {}..{}",
                                i,
                                child,
                                i + 1,
                                n_nodes
                            )));
                        }
                    }
                }
                TreeNode::Leaf { distribution } => {
                    if distribution.len() != n_classes {
                        return Err(Error::classifier(format!(
                            "leaf {} has {} classes, expected {}",
                            i,
                            distribution.len(),
                            n_classes
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// Parameters shared by every tree of one fit
struct TreeParams {
    n_classes: usize,
    max_features: usize,
    max_depth: Option<usize>,
    min_samples_split: usize,
}

struct TreeBuilder<'a> {
    rows: &'a [Vec<f32>],
    labels: &'a [usize],
    params: &'a TreeParams,
    nodes: Vec<TreeNode>,
}

impl<'a> TreeBuilder<'a> {
    fn build(mut self, indices: Vec<usize>, rng: &mut StdRng) -> DecisionTree {
        self.grow(indices, 0, rng);
        DecisionTree { nodes: self.nodes }
    }

    fn grow(&mut self, indices: Vec<usize>, depth: usize, rng: &mut StdRng) -> usize {
        let counts = self.class_counts(&indices);
        let node_id = self.nodes.len();

        let depth_reached = self.params.max_depth.is_some_and(|d| depth >= d);
        let pure = counts.iter().filter(|c| **c > 0).count() <= 1;
        if depth_reached || pure || indices.len() < self.params.min_samples_split {
            self.nodes.push(leaf(&counts, indices.len()));
            return node_id;
        }

        let Some((feature, threshold)) = self.best_split(&indices, &counts, rng) else {
            self.nodes.push(leaf(&counts, indices.len()));
            return node_id;
        };

        let (left_idx, right_idx): (Vec<usize>, Vec<usize>) = indices
            .into_iter()
            .partition(|&i| self.rows[i][feature] <= threshold);

        // Placeholder, patched once children exist
        self.nodes.push(TreeNode::Leaf {
            distribution: Vec::new(),
        });
        let left = self.grow(left_idx, depth + 1, rng);
        let right = self.grow(right_idx, depth + 1, rng);
        self.nodes[node_id] = TreeNode::Split {
            feature,
            threshold,
            left,
            right,
        };

        node_id
    }

    fn class_counts(&self, indices: &[usize]) -> Vec<usize> {
        let mut counts = vec![0usize; self.params.n_classes];
        for &i in indices {
            counts[self.labels[i]] += 1;
        }
        counts
    }

    /// Best Gini split over a random subset of features
    fn best_split(
        &self,
        indices: &[usize],
        parent_counts: &[usize],
        rng: &mut StdRng,
    ) -> Option<(usize, f32)> {
        let n_features = self.rows[0].len();
        let n = indices.len() as f64;
        let parent_gini = gini(parent_counts, indices.len());

        let mut best: Option<(usize, f32, f64)> = None;
        let candidates = sample(rng, n_features, self.params.max_features.min(n_features));

        for feature in candidates.iter() {
            let mut sorted: Vec<(f32, usize)> = indices
                .iter()
                .map(|&i| (self.rows[i][feature], self.labels[i]))
                .collect();
            sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

            let mut left_counts = vec![0usize; self.params.n_classes];
            let mut right_counts = parent_counts.to_vec();

            for split in 1..sorted.len() {
                let (prev_value, prev_label) = sorted[split - 1];
                left_counts[prev_label] += 1;
                right_counts[prev_label] -= 1;

                let value = sorted[split].0;
                if value <= prev_value {
                    continue;
                }

                let left_n = split;
                let right_n = sorted.len() - split;
                let weighted = (left_n as f64 * gini(&left_counts, left_n)
                    + right_n as f64 * gini(&right_counts, right_n))
                    / n;
                let gain = parent_gini - weighted;

                if gain > 1e-12 && best.map_or(true, |(_, _, g)| gain > g) {
                    let threshold = prev_value + (value - prev_value) / 2.0;
                    best = Some((feature, threshold, gain));
                }
            }
        }

        best.map(|(feature, threshold, _)| (feature, threshold))
    }
}

fn gini(counts: &[usize], total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let total = total as f64;
    1.0 - counts
        .iter()
        .map(|c| {
            let p = *c as f64 / total;
            p * p
        })
        .sum::<f64>()
}

fn leaf(counts: &[usize], total: usize) -> TreeNode {
    let total = total.max(1) as f32;
    TreeNode::Leaf {
        distribution: counts.iter().map(|c| *c as f32 / total).collect(),
    }
}

/// Bagged ensemble of decision trees
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    trees: Vec<DecisionTree>,
    n_classes: usize,
    n_features: usize,
}

impl RandomForest {
    /// Fit a forest on encoded labels in `0..n_classes`
    pub fn fit(
        rows: &[Vec<f32>],
        labels: &[usize],
        n_classes: usize,
        config: &ForestConfig,
    ) -> Result<Self> {
        if rows.is_empty() || rows.len() != labels.len() {
            return Err(Error::training(format!(
                "need matching non-empty rows and labels (rows={}, labels={})",
                rows.len(),
                labels.len()
            )));
        }
        if n_classes == 0 || labels.iter().any(|l| *l >= n_classes) {
            return Err(Error::training("label index out of range"));
        }
        if config.n_estimators == 0 {
            return Err(Error::config("forest needs at least one estimator"));
        }

        let n_features = rows[0].len();
        let params = TreeParams {
            n_classes,
            max_features: ((n_features as f64).sqrt().round() as usize).max(1),
            max_depth: config.max_depth,
            min_samples_split: config.min_samples_split.max(2),
        };

        let mut rng = StdRng::seed_from_u64(config.seed);
        let n = rows.len();
        let trees = (0..config.n_estimators)
            .map(|_| {
                let bootstrap: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
                TreeBuilder {
                    rows,
                    labels,
                    params: &params,
                    nodes: Vec::new(),
                }
                .build(bootstrap, &mut rng)
            })
            .collect();

        Ok(Self {
            trees,
            n_classes,
            n_features,
        })
    }

    /// Mean leaf distribution across trees; sums to 1
    pub fn predict_proba(&self, row: &[f32]) -> Result<Vec<f32>> {
        if row.len() != self.n_features {
            return Err(Error::classifier(format!(
                "forest expects {} features, got {}",
                self.n_features,
                row.len()
            )));
        }

        let mut proba = vec![0.0f32; self.n_classes];
        for tree in &self.trees {
            for (p, d) in proba.iter_mut().zip(tree.predict_distribution(row)?) {
                *p += d;
            }
        }
        let n_trees = self.trees.len().max(1) as f32;
        proba.iter_mut().for_each(|p| *p /= n_trees);

        Ok(proba)
    }

    /// Most probable class index
    pub fn predict(&self, row: &[f32]) -> Result<usize> {
        Ok(argmax(&self.predict_proba(row)?))
    }

    /// Check every tree against the forest's feature and class counts
    pub fn validate(&self) -> Result<()> {
        if self.trees.is_empty() || self.n_classes == 0 {
            return Err(Error::classifier("forest has no trees or no classes"));
        }
        self.trees
            .iter()
            .try_for_each(|tree| tree.validate(self.n_features, self.n_classes))
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    /// Nodes across all trees
    pub fn node_count(&self) -> usize {
        self.trees.iter().map(DecisionTree::node_count).sum()
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }
}

/// Index of the largest value (first one on ties)
pub fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(bi, bv), (i, v)| {
            if *v > bv {
                (i, *v)
            } else {
                (bi, bv)
            }
        })
        .0
}
