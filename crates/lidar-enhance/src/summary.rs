//! Per-sweep and per-run metrics.

use serde::{Deserialize, Serialize};

use lidar_core::{Decision, EnhancedSample, ScanStatistics};

use crate::sweep::ClosureReason;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmPerformance {
    /// Mean innovation factor of settled samples
    pub kalman_filter_effectiveness: f64,
    /// Agreement between detector flags and independent outlier evidence
    pub anomaly_detection_accuracy: f64,
    /// Fraction of samples belonging to a spatial cluster
    pub clustering_coherence: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionCounts {
    pub accepted: usize,
    pub corrected: usize,
    pub flagged: usize,
    /// Subset of `flagged` synthesised for silent bins
    pub filled: usize,
}

impl DecisionCounts {
    pub fn record(&mut self, sample: &EnhancedSample) {
        match sample.decision {
            Decision::Accept => self.accepted += 1,
            Decision::Correct => self.corrected += 1,
            Decision::Flag => self.flagged += 1,
        }
        if sample.flags.filled {
            self.filled += 1;
        }
    }

    pub fn merge(&mut self, other: &DecisionCounts) {
        self.accepted += other.accepted;
        self.corrected += other.corrected;
        self.flagged += other.flagged;
        self.filled += other.filled;
    }
}

/// Squared residuals of raw and enhanced readings against the prediction
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResidualEnergy {
    pub raw: f64,
    pub enhanced: f64,
}

impl ResidualEnergy {
    pub fn add(&mut self, raw: f64, enhanced: f64, predicted: f64) {
        self.raw += (raw - predicted).powi(2);
        self.enhanced += (enhanced - predicted).powi(2);
    }

    pub fn merge(&mut self, other: &ResidualEnergy) {
        self.raw += other.raw;
        self.enhanced += other.enhanced;
    }

    /// `100 * (1 - rms_enhanced / rms_raw)`, in `[0, 100]`
    pub fn noise_reduction_percentage(&self) -> f64 {
        if self.raw <= f64::EPSILON {
            return 0.0;
        }
        (100.0 * (1.0 - (self.enhanced / self.raw).sqrt())).clamp(0.0, 100.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepSummary {
    pub sweep_id: u64,
    pub reason: ClosureReason,
    /// Input samples in the sweep
    pub original_point_count: usize,
    /// Emitted samples, including filled bins
    pub enhanced_point_count: usize,
    pub noise_reduction_percentage: f64,
    /// Mean confidence of the input samples
    pub average_confidence: f64,
    pub processing_time_ms: f64,
    pub algorithm_performance: AlgorithmPerformance,
    pub decisions: DecisionCounts,
    pub scan: ScanStatistics,
    pub residuals: ResidualEnergy,
    pub anomaly_degraded: bool,
    pub clustering_degraded: bool,
}

/// Emitted samples of one sweep and their summary
#[derive(Debug, Clone)]
pub struct SweepOutput {
    pub samples: Vec<EnhancedSample>,
    pub summary: SweepSummary,
}

/// Running totals over many sweeps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunTotals {
    pub sweeps: usize,
    pub original_points: usize,
    pub enhanced_points: usize,
    pub confidence_sum: f64,
    pub processing_time_ms: f64,
    pub residuals: ResidualEnergy,
    pub decisions: DecisionCounts,
    pub scan: ScanStatistics,
    performance_sum: AlgorithmPerformance,
}

impl RunTotals {
    pub fn add(&mut self, summary: &SweepSummary) {
        self.sweeps += 1;
        self.original_points += summary.original_point_count;
        self.enhanced_points += summary.enhanced_point_count;
        self.confidence_sum += summary.average_confidence * summary.original_point_count as f64;
        self.processing_time_ms += summary.processing_time_ms;
        self.residuals.merge(&summary.residuals);
        self.decisions.merge(&summary.decisions);
        self.scan = self.scan.merge(&summary.scan);

        let p = &summary.algorithm_performance;
        self.performance_sum.kalman_filter_effectiveness += p.kalman_filter_effectiveness;
        self.performance_sum.anomaly_detection_accuracy += p.anomaly_detection_accuracy;
        self.performance_sum.clustering_coherence += p.clustering_coherence;
    }

    pub fn average_confidence(&self) -> f64 {
        if self.original_points == 0 {
            return 0.0;
        }
        self.confidence_sum / self.original_points as f64
    }

    /// Per-sweep mean of each performance metric
    pub fn algorithm_performance(&self) -> AlgorithmPerformance {
        if self.sweeps == 0 {
            return AlgorithmPerformance::default();
        }
        let n = self.sweeps as f64;
        AlgorithmPerformance {
            kalman_filter_effectiveness: self.performance_sum.kalman_filter_effectiveness / n,
            anomaly_detection_accuracy: self.performance_sum.anomaly_detection_accuracy / n,
            clustering_coherence: self.performance_sum.clustering_coherence / n,
        }
    }
}
