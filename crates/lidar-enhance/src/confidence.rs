//! Eight-factor confidence per sample.

use serde::{Deserialize, Serialize};

use lidar_core::{Sample, SensorProfile};

use crate::clustering::ClusterAssignment;
use crate::history::AngleHistory;
use crate::state_bank::StateUpdate;

/// Factor value used while a bin has too little history
pub const NEUTRAL_FACTOR: f64 = 0.5;

/// Entries needed before the stability factor is computed
const MIN_STABILITY_HISTORY: usize = 3;

/// Deviations are judged on a scale of three sensor sigmas
const TOLERANCE_SIGMAS: f64 = 3.0;

/// Weight of each factor in the combined confidence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceWeights {
    pub measurement_stability: f64,
    pub kalman_innovation: f64,
    pub baseline_consistency: f64,
    pub spatial_coherence: f64,
    pub temporal_consistency: f64,
    pub anomaly_frequency: f64,
    pub rate_of_change: f64,
    pub historical_performance: f64,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            measurement_stability: 0.15,
            kalman_innovation: 0.15,
            baseline_consistency: 0.10,
            spatial_coherence: 0.10,
            temporal_consistency: 0.10,
            anomaly_frequency: 0.10,
            rate_of_change: 0.10,
            historical_performance: 0.20,
        }
    }
}

impl ConfidenceWeights {
    pub fn is_valid(&self) -> bool {
        let all = [
            self.measurement_stability,
            self.kalman_innovation,
            self.baseline_consistency,
            self.spatial_coherence,
            self.temporal_consistency,
            self.anomaly_frequency,
            self.rate_of_change,
            self.historical_performance,
        ];
        all.iter().all(|w| w.is_finite() && *w >= 0.0) && all.iter().sum::<f64>() > 0.0
    }
}

/// The eight factors of one sample, each in `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceFactors {
    pub measurement_stability: f64,
    pub kalman_innovation: f64,
    pub baseline_consistency: f64,
    /// Absent when clustering did not run
    pub spatial_coherence: Option<f64>,
    pub temporal_consistency: f64,
    pub anomaly_frequency: f64,
    pub rate_of_change: f64,
    pub historical_performance: f64,
}

/// Everything the engine reads for one sample
pub struct FactorInputs<'a> {
    pub sample: &'a Sample,
    pub update: &'a StateUpdate,
    /// Bin history before this sample is appended
    pub history: &'a AngleHistory,
    pub cluster: Option<&'a ClusterAssignment>,
}

pub struct ConfidenceEngine {
    weights: ConfidenceWeights,
    profile: SensorProfile,
    expected_neighbors: usize,
    warm_up_cap: f64,
}

impl ConfidenceEngine {
    pub fn new(
        weights: ConfidenceWeights,
        profile: SensorProfile,
        expected_neighbors: usize,
        warm_up_cap: f64,
    ) -> Self {
        Self {
            weights,
            profile,
            expected_neighbors: expected_neighbors.max(1),
            warm_up_cap,
        }
    }

    pub fn factors(&self, inputs: &FactorInputs<'_>) -> ConfidenceFactors {
        let raw = inputs.sample.raw_distance;
        let tolerance = TOLERANCE_SIGMAS * self.profile.accuracy_at(raw);
        let history = inputs.history;

        let measurement_stability = history
            .residual_spread()
            .filter(|_| history.len() >= MIN_STABILITY_HISTORY)
            .map_or(NEUTRAL_FACTOR, |spread| cauchy(spread / tolerance));

        let kalman_innovation = if inputs.update.warm_up {
            NEUTRAL_FACTOR
        } else {
            (-0.5 * inputs.update.normalized_innovation_sq()).exp()
        };

        let spatial_coherence = inputs.cluster.map(|assignment| {
            let ratio = (assignment.local_density as f64 / self.expected_neighbors as f64).min(1.0);
            if assignment.is_member() {
                0.5 + 0.5 * ratio
            } else {
                0.25 * ratio
            }
        });

        let temporal_consistency = history
            .trend_at(inputs.sample.timestamp)
            .map_or(NEUTRAL_FACTOR, |trend| {
                let z = (raw - trend).abs() / tolerance;
                (-0.5 * z * z).exp()
            });

        // Motion explained by the estimator's velocity is not instability
        let rate_of_change = history
            .rate_of_change(Some((inputs.sample.timestamp, raw)))
            .filter(|_| !history.is_empty())
            .map_or(NEUTRAL_FACTOR, |rate| {
                let mismatch =
                    (rate.slope - inputs.update.predicted_velocity).abs() * rate.mean_step_secs;
                cauchy(mismatch / tolerance)
            });

        ConfidenceFactors {
            measurement_stability,
            kalman_innovation,
            baseline_consistency: self.baseline_consistency(raw),
            spatial_coherence,
            temporal_consistency,
            anomaly_frequency: history.anomaly_frequency().map_or(NEUTRAL_FACTOR, |f| 1.0 - f),
            rate_of_change,
            historical_performance: history.confidence_trend().unwrap_or(NEUTRAL_FACTOR),
        }
    }

    /// Weighted average over the factors present, capped during warm-up
    pub fn combine(&self, factors: &ConfidenceFactors, warm_up: bool) -> f64 {
        let w = &self.weights;
        let mut weighted = [
            (w.measurement_stability, factors.measurement_stability),
            (w.kalman_innovation, factors.kalman_innovation),
            (w.baseline_consistency, factors.baseline_consistency),
            (w.temporal_consistency, factors.temporal_consistency),
            (w.anomaly_frequency, factors.anomaly_frequency),
            (w.rate_of_change, factors.rate_of_change),
            (w.historical_performance, factors.historical_performance),
        ]
        .to_vec();
        if let Some(spatial) = factors.spatial_coherence {
            weighted.push((w.spatial_coherence, spatial));
        }

        let total: f64 = weighted.iter().map(|(weight, _)| weight).sum();
        let mut confidence = if total > 0.0 {
            weighted.iter().map(|(weight, f)| weight * f).sum::<f64>() / total
        } else {
            0.0
        };

        if warm_up {
            confidence = confidence.min(self.warm_up_cap);
        }
        sanitize_unit(confidence)
    }

    /// Confidence of a bin that missed the sweep
    pub fn fill_confidence(&self, history: &AngleHistory, penalty: f64) -> f64 {
        let trend = history.confidence_trend().unwrap_or(NEUTRAL_FACTOR);
        sanitize_unit(trend * (1.0 - penalty.clamp(0.0, 1.0)))
    }

    pub fn quality_score(&self, confidence: f64, anomaly_score: f64) -> f64 {
        sanitize_unit(confidence * (1.0 - anomaly_score.clamp(0.0, 1.0)))
    }

    fn baseline_consistency(&self, raw: f64) -> f64 {
        let min = self.profile.min_range_cm;
        let max = self.profile.max_range_cm;
        let factor = if raw < min {
            1.0 - (min - raw) / min
        } else if raw > max {
            1.0 - (raw - max) / (0.1 * max)
        } else {
            1.0
        };
        factor.max(0.0)
    }
}

fn cauchy(x: f64) -> f64 {
    1.0 / (1.0 + x * x)
}

fn sanitize_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
