//! Stage two: sweep-level scoring, confidence and consensus.

use std::time::Instant;

use ndarray::Array2;

use lidar_core::{Decision, EnhancedSample, SampleFlags, ScanStatistics, SensorProfile};

use crate::anomaly::{AnomalyReport, IsolationForest};
use crate::clustering::{ClusteringResult, SpatialClusterer};
use crate::confidence::{ConfidenceEngine, FactorInputs};
use crate::config::{EnhancementConfig, EnhancementLevel};
use crate::consensus::{ConsensusInput, ConsensusValidator};
use crate::history::{HistoricalPatternStore, HistoryEntry};
use crate::state_bank::AngleBins;
use crate::summary::{AlgorithmPerformance, DecisionCounts, ResidualEnergy, SweepOutput, SweepSummary};
use crate::sweep::ClosedSweep;

/// Processed sweep plus the detector verdicts owed to the state bank
#[derive(Debug, Clone)]
pub struct ProcessedSweep {
    pub output: SweepOutput,
    /// `(bin, anomalous)` per input sample, in sweep order
    pub anomaly_flags: Vec<(usize, bool)>,
}

pub struct SweepProcessor {
    level: EnhancementLevel,
    profile: SensorProfile,
    missing_bin_penalty: f64,
    history: HistoricalPatternStore,
    detector: IsolationForest,
    clusterer: SpatialClusterer,
    engine: ConfidenceEngine,
    validator: ConsensusValidator,
}

impl SweepProcessor {
    pub fn new(config: &EnhancementConfig) -> Self {
        let profile = config.sensor_profile();
        let bins = AngleBins::new(config.angle_bin_width_deg);
        let clusterer = SpatialClusterer::new(
            config.cluster_min_samples,
            config.cluster_eps_factor,
            config.clustering.clone(),
            profile,
        );
        let engine = ConfidenceEngine::new(
            config.weights.clone(),
            profile,
            clusterer.expected_neighbors(bins.width_deg()),
            config.consensus.warm_up_cap,
        );

        Self {
            level: config.enhancement_level,
            profile,
            missing_bin_penalty: config.missing_bin_penalty,
            history: HistoricalPatternStore::new(bins.count(), config.history_window),
            detector: IsolationForest::new(config.anomaly.clone(), config.contamination_rate),
            clusterer,
            engine,
            validator: ConsensusValidator::new(config.confidence_threshold, config.consensus.clone()),
        }
    }

    pub fn history(&self) -> &HistoricalPatternStore {
        &self.history
    }

    pub fn process(&mut self, sweep: ClosedSweep) -> ProcessedSweep {
        let started = Instant::now();
        let n = sweep.entries.len();

        let clustering = self.level.runs_clustering().then(|| {
            let points: Vec<(f64, f64)> = sweep
                .entries
                .iter()
                .map(|e| (e.sample.angle, e.sample.raw_distance))
                .collect();
            self.clusterer.cluster(&points)
        });

        let anomalies = self
            .level
            .runs_anomaly_detection()
            .then(|| self.detector.score(&self.features(&sweep, clustering.as_ref())));

        let mut samples = Vec::with_capacity(n + sweep.missing.len());
        let mut anomaly_flags = Vec::with_capacity(n);
        let mut decisions = DecisionCounts::default();
        let mut residuals = ResidualEnergy::default();
        let mut confidence_sum = 0.0;
        let mut innovation_factor_sum = 0.0;
        let mut settled = 0usize;
        let mut agreements = 0usize;

        for (i, entry) in sweep.entries.iter().enumerate() {
            let sample = &entry.sample;
            let update = &entry.update;
            let cluster = clustering.as_ref().map(|c| &c.assignments[i]);

            let factors = self.engine.factors(&FactorInputs {
                sample,
                update,
                history: self.history.get(update.bin),
                cluster,
            });
            let confidence = self.engine.combine(&factors, update.warm_up);

            let anomaly_score = anomalies.as_ref().map_or(0.0, |a| a.scores[i]);
            let anomalous = anomalies.as_ref().map_or(false, |a| a.is_anomalous(i));

            let verdict = self.validator.decide(&ConsensusInput {
                confidence,
                anomaly_score,
                in_cluster: cluster.map(|c| c.is_member()),
                warm_up: update.warm_up,
                raw_distance: sample.raw_distance,
                predicted_distance: update.predicted_distance,
            });

            let enhanced = EnhancedSample {
                timestamp: sample.timestamp,
                angle: sample.angle,
                raw_distance: sample.raw_distance,
                enhanced_distance: verdict.enhanced_distance,
                confidence,
                quality_score: self.engine.quality_score(confidence, anomaly_score),
                decision: verdict.decision,
                flags: SampleFlags {
                    warm_up: update.warm_up,
                    low_confidence: verdict.decision == Decision::Flag,
                    anomalous,
                    spatial_outlier: verdict.spatial_outlier,
                    gated: update.gated,
                    filled: false,
                },
            };

            decisions.record(&enhanced);
            residuals.add(sample.raw_distance, enhanced.enhanced_distance, update.predicted_distance);
            confidence_sum += confidence;
            if !update.warm_up {
                innovation_factor_sum += factors.kalman_innovation;
                settled += 1;
            }
            if anomalous == (update.gated || verdict.spatial_outlier) {
                agreements += 1;
            }

            self.history.record(
                update.bin,
                HistoryEntry {
                    timestamp: sample.timestamp,
                    raw_distance: sample.raw_distance,
                    innovation: update.innovation,
                    anomalous,
                    confidence,
                },
            );
            anomaly_flags.push((update.bin, anomalous));
            samples.push(enhanced);
        }

        for missing in &sweep.missing {
            let confidence = self
                .engine
                .fill_confidence(self.history.get(missing.bin), self.missing_bin_penalty);
            let verdict = self.validator.decide(&ConsensusInput {
                confidence,
                anomaly_score: 0.0,
                in_cluster: None,
                warm_up: true,
                raw_distance: missing.last_raw_distance,
                predicted_distance: missing.estimated_distance,
            });

            let filled = EnhancedSample {
                timestamp: sweep.closed_at,
                angle: missing.angle,
                raw_distance: missing.last_raw_distance,
                enhanced_distance: verdict.enhanced_distance,
                confidence,
                quality_score: self.engine.quality_score(confidence, 0.0),
                decision: verdict.decision,
                flags: SampleFlags {
                    low_confidence: verdict.decision == Decision::Flag,
                    filled: true,
                    ..Default::default()
                },
            };
            decisions.record(&filled);
            samples.push(filled);
        }

        let algorithm_performance = AlgorithmPerformance {
            kalman_filter_effectiveness: ratio(innovation_factor_sum, settled),
            anomaly_detection_accuracy: if anomalies.is_some() {
                ratio(agreements as f64, n)
            } else {
                0.0
            },
            clustering_coherence: clustering.as_ref().map_or(0.0, ClusteringResult::coherence),
        };

        let summary = SweepSummary {
            sweep_id: sweep.id,
            reason: sweep.reason,
            original_point_count: n,
            enhanced_point_count: samples.len(),
            noise_reduction_percentage: residuals.noise_reduction_percentage(),
            average_confidence: ratio(confidence_sum, n),
            processing_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            algorithm_performance,
            decisions,
            scan: ScanStatistics::from_distances(
                sweep.entries.iter().map(|e| e.sample.raw_distance),
                &self.profile,
            ),
            residuals,
            anomaly_degraded: anomalies.as_ref().map_or(false, |a: &AnomalyReport| a.degraded),
            clustering_degraded: clustering.as_ref().map_or(false, |c| c.degraded),
        };

        tracing::debug!(
            sweep = summary.sweep_id,
            points = n,
            accepted = decisions.accepted,
            corrected = decisions.corrected,
            flagged = decisions.flagged,
            average_confidence = summary.average_confidence,
            "sweep processed"
        );

        ProcessedSweep {
            output: SweepOutput { samples, summary },
            anomaly_flags,
        }
    }

    /// Detector input: estimate, velocity, |innovation| and, when
    /// clustering ran, local density
    fn features(&self, sweep: &ClosedSweep, clustering: Option<&ClusteringResult>) -> Array2<f64> {
        let columns = if clustering.is_some() { 4 } else { 3 };
        Array2::from_shape_fn((sweep.entries.len(), columns), |(i, j)| {
            let update = &sweep.entries[i].update;
            match j {
                0 => update.estimated_distance,
                1 => update.estimated_velocity,
                2 => update.innovation.abs(),
                _ => clustering.map_or(0.0, |c| c.assignments[i].local_density as f64),
            }
        })
    }

    pub fn reset(&mut self) {
        self.history.reset();
    }
}

fn ratio(sum: f64, count: usize) -> f64 {
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}
