//! Isolation-forest anomaly scoring over one sweep.
//!
//! Trees are grown on the full sweep with an explicit stack and a
//! per-tree seed, so a sweep always reproduces the same scores. Samples
//! isolated in few splits receive high scores; the ordinary bulk of a
//! sweep scores zero.

use ndarray::{Array2, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

const EULER_GAMMA: f64 = 0.577_215_664_9;

/// Raw isolation score of a sample with average path length `c(n)`
const SCORE_BASELINE: f64 = 0.6;

/// Sweeps smaller than this are not scored
const MIN_SWEEP_SAMPLES: usize = 3;

/// Lowest score that may ever be flagged
pub const MIN_FLAG_SCORE: f64 = 0.3;

/// Detector tuning; the contamination rate lives in the top-level config
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub n_estimators: usize,
    pub seed: u64,
    /// Larger sweeps fail soft to a uniform score of 1.0
    pub max_sweep_samples: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            seed: 42,
            max_sweep_samples: 20_000,
        }
    }
}

/// Per-sweep detector output
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnomalyReport {
    /// Anomaly score per sample, `[0, 1]`
    pub scores: Vec<f64>,
    /// Scores at or above this are flagged
    pub threshold: f64,
    /// Sweep exceeded the sample cap and was not scored
    pub degraded: bool,
}

impl AnomalyReport {
    pub fn is_anomalous(&self, index: usize) -> bool {
        self.scores
            .get(index)
            .map_or(false, |s| *s >= self.threshold && *s > 0.0)
    }

    pub fn flagged_count(&self) -> usize {
        (0..self.scores.len()).filter(|i| self.is_anomalous(*i)).count()
    }
}

/// Seeded isolation-forest ensemble
pub struct IsolationForest {
    config: DetectorConfig,
    contamination_rate: f64,
}

impl IsolationForest {
    pub fn new(config: DetectorConfig, contamination_rate: f64) -> Self {
        Self {
            config,
            contamination_rate: contamination_rate.clamp(0.0, 0.5),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Score every row of `features` (one row per sample)
    pub fn score(&self, features: &Array2<f64>) -> AnomalyReport {
        let n = features.nrows();

        if n > self.config.max_sweep_samples {
            tracing::warn!(
                samples = n,
                limit = self.config.max_sweep_samples,
                "sweep too large for anomaly detection, scoring all samples as anomalous"
            );
            return AnomalyReport {
                scores: vec![1.0; n],
                threshold: 1.0,
                degraded: true,
            };
        }

        if n < MIN_SWEEP_SAMPLES || self.config.n_estimators == 0 {
            return AnomalyReport {
                scores: vec![0.0; n],
                threshold: 1.0,
                degraded: false,
            };
        }

        let height_limit = (n as f64).log2().ceil() as usize;
        let view = features.view();

        // Collected in tree order so the float sum does not depend on scheduling
        let per_tree: Vec<Vec<f64>> = (0..self.config.n_estimators)
            .into_par_iter()
            .map(|tree| {
                let seed = self.config.seed.wrapping_add(tree as u64);
                path_lengths(view, seed, height_limit)
            })
            .collect();

        let mut total = vec![0.0; n];
        for lengths in &per_tree {
            for (acc, len) in total.iter_mut().zip(lengths) {
                *acc += len;
            }
        }

        let c_n = average_path_length(n);
        let ceiling = 2f64.powf(-1.0 / c_n);
        let trees = self.config.n_estimators as f64;
        let scores: Vec<f64> = total
            .iter()
            .map(|sum| {
                let raw = 2f64.powf(-(sum / trees) / c_n);
                ((raw - SCORE_BASELINE) / (ceiling - SCORE_BASELINE)).clamp(0.0, 1.0)
            })
            .collect();

        let threshold = quantile(&scores, 1.0 - self.contamination_rate).max(MIN_FLAG_SCORE);

        AnomalyReport {
            scores,
            threshold,
            degraded: false,
        }
    }
}

/// Average unsuccessful-search path length of a binary tree over `n` points
pub fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let m = n as f64;
            2.0 * ((m - 1.0).ln() + EULER_GAMMA) - 2.0 * (m - 1.0) / m
        }
    }
}

/// Grow one isolation tree and return the path length of every row
fn path_lengths(features: ArrayView2<'_, f64>, seed: u64, height_limit: usize) -> Vec<f64> {
    let n = features.nrows();
    let dims = features.ncols();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut lengths = vec![0.0; n];
    let mut order: Vec<usize> = (0..n).collect();

    let mut splittable: Vec<(usize, f64, f64)> = Vec::with_capacity(dims);
    let mut stack = vec![(0usize, n, 0usize)];

    while let Some((start, end, depth)) = stack.pop() {
        let size = end - start;
        if size == 0 {
            continue;
        }

        splittable.clear();
        if size > 1 && depth < height_limit {
            for feature in 0..dims {
                let mut lo = f64::INFINITY;
                let mut hi = f64::NEG_INFINITY;
                for &row in &order[start..end] {
                    let v = features[[row, feature]];
                    lo = lo.min(v);
                    hi = hi.max(v);
                }
                if hi > lo {
                    splittable.push((feature, lo, hi));
                }
            }
        }

        if splittable.is_empty() {
            let leaf = depth as f64 + average_path_length(size);
            for &row in &order[start..end] {
                lengths[row] = leaf;
            }
            continue;
        }

        let (feature, lo, hi) = splittable[rng.gen_range(0..splittable.len())];
        let split = rng.gen_range(lo..hi);

        let segment = &mut order[start..end];
        let mut left = 0;
        for i in 0..segment.len() {
            if features[[segment[i], feature]] < split {
                segment.swap(i, left);
                left += 1;
            }
        }

        stack.push((start, start + left, depth + 1));
        stack.push((start + left, end, depth + 1));
    }

    lengths
}

/// Linear-interpolated quantile, `q` in `[0, 1]`
fn quantile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let frac = pos - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * frac
}
