//! Final per-sample decision.
//!
//! The validator is a pure function of its inputs: the same confidence,
//! anomaly score, cluster label and warm-up state always produce the same
//! decision and the same enhanced distance.

use serde::{Deserialize, Serialize};

use lidar_core::Decision;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusThresholds {
    /// Below this a sample is flagged
    pub flag_confidence: f64,
    /// Anomaly score that forbids acceptance
    pub anomaly: f64,
    /// Confidence ceiling applied to warm-up samples
    pub warm_up_cap: f64,
}

impl Default for ConsensusThresholds {
    fn default() -> Self {
        Self {
            flag_confidence: 0.4,
            anomaly: 0.3,
            warm_up_cap: 0.3,
        }
    }
}

/// Signals the validator combines for one sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsensusInput {
    pub confidence: f64,
    pub anomaly_score: f64,
    /// `None` when clustering did not run
    pub in_cluster: Option<bool>,
    pub warm_up: bool,
    pub raw_distance: f64,
    /// Estimator prior for this sample
    pub predicted_distance: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub decision: Decision,
    pub enhanced_distance: f64,
    pub spatial_outlier: bool,
}

pub struct ConsensusValidator {
    accept_confidence: f64,
    thresholds: ConsensusThresholds,
}

impl ConsensusValidator {
    pub fn new(accept_confidence: f64, thresholds: ConsensusThresholds) -> Self {
        Self {
            accept_confidence,
            thresholds,
        }
    }

    pub fn decide(&self, input: &ConsensusInput) -> Verdict {
        let confidence = if input.warm_up {
            input.confidence.min(self.thresholds.warm_up_cap)
        } else {
            input.confidence
        };

        let decision = if confidence >= self.accept_confidence
            && input.anomaly_score < self.thresholds.anomaly
        {
            Decision::Accept
        } else if confidence >= self.thresholds.flag_confidence {
            Decision::Correct
        } else {
            Decision::Flag
        };

        let enhanced_distance = match decision {
            Decision::Accept => input.raw_distance,
            Decision::Correct | Decision::Flag => input.predicted_distance,
        };

        Verdict {
            decision,
            enhanced_distance,
            spatial_outlier: input.in_cluster == Some(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> ConsensusValidator {
        ConsensusValidator::new(0.7, ConsensusThresholds::default())
    }

    fn input(confidence: f64, anomaly_score: f64) -> ConsensusInput {
        ConsensusInput {
            confidence,
            anomaly_score,
            in_cluster: Some(true),
            warm_up: false,
            raw_distance: 251.0,
            predicted_distance: 250.0,
        }
    }

    #[test]
    fn test_decision_bands() {
        let v = validator();
        let cases = [
            (0.95, 0.0, Decision::Accept, 251.0),
            (0.70, 0.29, Decision::Accept, 251.0),
            (0.95, 0.30, Decision::Correct, 250.0),
            (0.69, 0.0, Decision::Correct, 250.0),
            (0.40, 0.9, Decision::Correct, 250.0),
            (0.39, 0.0, Decision::Flag, 250.0),
            (0.0, 1.0, Decision::Flag, 250.0),
        ];
        for (confidence, anomaly, decision, enhanced) in cases {
            let verdict = v.decide(&input(confidence, anomaly));
            assert_eq!(verdict.decision, decision, "conf {} anomaly {}", confidence, anomaly);
            assert_eq!(verdict.enhanced_distance, enhanced);
        }
    }

    #[test]
    fn test_warm_up_flags() {
        let verdict = validator().decide(&ConsensusInput {
            warm_up: true,
            ..input(0.99, 0.0)
        });
        assert_eq!(verdict.decision, Decision::Flag);
    }

    #[test]
    fn test_cluster_noise_only_annotates() {
        let v = validator();
        let member = v.decide(&input(0.9, 0.0));
        let outlier = v.decide(&ConsensusInput {
            in_cluster: Some(false),
            ..input(0.9, 0.0)
        });
        let unclustered = v.decide(&ConsensusInput {
            in_cluster: None,
            ..input(0.9, 0.0)
        });

        assert_eq!(member.decision, outlier.decision);
        assert!(outlier.spatial_outlier);
        assert!(!member.spatial_outlier && !unclustered.spatial_outlier);
    }

    #[test]
    fn test_decide_is_pure() {
        let v = validator();
        let borderline = input(0.55, 0.4);
        let first = v.decide(&borderline);
        for _ in 0..10 {
            assert_eq!(v.decide(&borderline), first);
        }
        assert_eq!(ConsensusValidator::new(0.7, ConsensusThresholds::default()).decide(&borderline), first);
    }
}
