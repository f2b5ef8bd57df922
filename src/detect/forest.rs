//! Isolation forest outlier model.
//!
//! Scores follow the usual convention: `score_samples` is the negated
//! anomaly score in `[-1, 0)`, lower is more anomalous, and the decision
//! boundary `offset` is the `contamination` percentile of the training
//! scores. A row is an outlier when `score - offset < 0`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::DetectError;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

#[derive(Debug, Clone, PartialEq)]
pub struct ForestParams {
    pub n_trees: usize,
    pub max_samples: usize,
    pub contamination: f64,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_samples: 256,
            contamination: 0.01,
            seed: 42,
        }
    }
}

#[derive(Debug)]
enum Node {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

#[derive(Debug)]
pub struct IsolationForest {
    trees: Vec<Node>,
    sample_size: usize,
    offset: f64,
}

/// Expected path length of an unsuccessful BST search over `n` points.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

/// Linear-interpolated percentile of an ascending slice, `q` in `[0, 100]`.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let pos = q / 100.0 * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

fn build(x: &[Vec<f64>], idx: Vec<usize>, depth: usize, limit: usize, rng: &mut StdRng) -> Node {
    if depth >= limit || idx.len() <= 1 {
        return Node::Leaf { size: idx.len() };
    }

    let width = x[idx[0]].len();
    let mut candidates = Vec::with_capacity(width);
    for f in 0..width {
        let (mut lo, mut hi) = (f64::INFINITY, f64::NEG_INFINITY);
        for &i in &idx {
            lo = lo.min(x[i][f]);
            hi = hi.max(x[i][f]);
        }
        if lo < hi {
            candidates.push((f, lo, hi));
        }
    }
    if candidates.is_empty() {
        return Node::Leaf { size: idx.len() };
    }

    let (feature, lo, hi) = candidates[rng.gen_range(0..candidates.len())];
    let threshold = rng.gen_range(lo..hi);
    let (left, right): (Vec<usize>, Vec<usize>) =
        idx.into_iter().partition(|&i| x[i][feature] < threshold);

    Node::Split {
        feature,
        threshold,
        left: Box::new(build(x, left, depth + 1, limit, rng)),
        right: Box::new(build(x, right, depth + 1, limit, rng)),
    }
}

fn path_length(node: &Node, row: &[f64]) -> f64 {
    let mut node = node;
    let mut depth = 0.0;
    loop {
        match node {
            Node::Leaf { size } => return depth + average_path_length(*size),
            Node::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                node = if row[*feature] < *threshold { left } else { right };
                depth += 1.0;
            }
        }
    }
}

fn validate(x: &[Vec<f64>]) -> Result<usize, DetectError> {
    let first = x
        .first()
        .ok_or_else(|| DetectError::Execution("cannot fit an outlier model on zero rows".into()))?;
    let width = first.len();
    if width == 0 {
        return Err(DetectError::Execution("feature rows are empty".to_string()));
    }
    for (i, row) in x.iter().enumerate() {
        if row.len() != width {
            return Err(DetectError::Execution(format!(
                "row {i} has {} features, expected {width}",
                row.len()
            )));
        }
        if row.iter().any(|v| !v.is_finite()) {
            return Err(DetectError::Execution(format!("row {i} has a non-finite feature")));
        }
    }
    Ok(width)
}

impl IsolationForest {
    /// Fit on `x` and set the decision offset from the training scores.
    pub fn fit(x: &[Vec<f64>], params: &ForestParams) -> Result<Self, DetectError> {
        if !(params.contamination > 0.0 && params.contamination <= 0.5) {
            return Err(DetectError::Validation(format!(
                "contamination must be in (0, 0.5], got {}",
                params.contamination
            )));
        }
        if params.n_trees == 0 || params.max_samples == 0 {
            return Err(DetectError::Validation(
                "n_trees and max_samples must be positive".to_string(),
            ));
        }
        validate(x)?;

        let n = x.len();
        let sample_size = params.max_samples.min(n);
        let limit = (sample_size.max(2) as f64).log2().ceil() as usize;
        let mut rng = StdRng::seed_from_u64(params.seed);

        let trees = (0..params.n_trees)
            .map(|_| {
                let idx = rand::seq::index::sample(&mut rng, n, sample_size).into_vec();
                build(x, idx, 0, limit, &mut rng)
            })
            .collect();

        let mut forest = Self {
            trees,
            sample_size,
            offset: 0.0,
        };
        let mut scores = forest.score_samples(x);
        scores.sort_by(|a, b| a.total_cmp(b));
        forest.offset = percentile(&scores, 100.0 * params.contamination);
        Ok(forest)
    }

    /// Negated anomaly score per row. Lower is more anomalous.
    pub fn score_samples(&self, x: &[Vec<f64>]) -> Vec<f64> {
        let norm = average_path_length(self.sample_size).max(f64::MIN_POSITIVE);
        x.iter()
            .map(|row| {
                let total: f64 = self.trees.iter().map(|t| path_length(t, row)).sum();
                let mean = total / self.trees.len() as f64;
                -(2f64.powf(-mean / norm))
            })
            .collect()
    }

    /// `score_samples - offset`. Negative means outlier.
    pub fn decision_function(&self, x: &[Vec<f64>]) -> Vec<f64> {
        self.score_samples(x).into_iter().map(|s| s - self.offset).collect()
    }

    /// `true` for rows classified as outliers.
    pub fn predict(&self, x: &[Vec<f64>]) -> Vec<bool> {
        self.decision_function(x).into_iter().map(|d| d < 0.0).collect()
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }
}
