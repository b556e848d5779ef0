//! Density-based spatial coherence over one sweep.
//!
//! DBSCAN in (angle, distance) space with separate neighbourhood limits
//! per axis: angular separation is circular and bounded by a fixed window,
//! distance separation by an eps derived from the sweep's own spread.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use lidar_core::SensorProfile;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterTuning {
    /// Half-width of the angular neighbourhood in degrees
    pub angle_window_deg: f64,
    /// Larger sweeps fail soft to all-noise
    pub max_sweep_samples: usize,
}

impl Default for ClusterTuning {
    fn default() -> Self {
        Self {
            angle_window_deg: 3.0,
            max_sweep_samples: 20_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterLabel {
    Cluster(usize),
    Noise,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterAssignment {
    pub label: ClusterLabel,
    /// Neighbour count, excluding the sample itself
    pub local_density: usize,
}

impl ClusterAssignment {
    pub fn is_member(&self) -> bool {
        matches!(self.label, ClusterLabel::Cluster(_))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClusteringResult {
    pub assignments: Vec<ClusterAssignment>,
    pub cluster_count: usize,
    /// Distance eps used for this sweep
    pub eps: f64,
    pub degraded: bool,
}

impl ClusteringResult {
    /// Fraction of samples belonging to a cluster
    pub fn coherence(&self) -> f64 {
        if self.assignments.is_empty() {
            return 0.0;
        }
        let members = self.assignments.iter().filter(|a| a.is_member()).count();
        members as f64 / self.assignments.len() as f64
    }
}

pub struct SpatialClusterer {
    min_samples: usize,
    eps_factor: f64,
    tuning: ClusterTuning,
    profile: SensorProfile,
}

impl SpatialClusterer {
    pub fn new(
        min_samples: usize,
        eps_factor: f64,
        tuning: ClusterTuning,
        profile: SensorProfile,
    ) -> Self {
        Self {
            min_samples: min_samples.max(1),
            eps_factor,
            tuning,
            profile,
        }
    }

    /// Neighbour count of a sample inside an evenly sampled, coherent surface
    pub fn expected_neighbors(&self, bin_width_deg: f64) -> usize {
        (2.0 * (self.tuning.angle_window_deg / bin_width_deg).floor()).max(1.0) as usize
    }

    /// Cluster `(angle, distance)` points of one sweep
    pub fn cluster(&self, points: &[(f64, f64)]) -> ClusteringResult {
        let n = points.len();
        if n == 0 {
            return ClusteringResult::default();
        }
        if n > self.tuning.max_sweep_samples {
            tracing::warn!(
                samples = n,
                limit = self.tuning.max_sweep_samples,
                "sweep too large for clustering, labelling all samples as noise"
            );
            return ClusteringResult {
                assignments: vec![
                    ClusterAssignment {
                        label: ClusterLabel::Noise,
                        local_density: 0,
                    };
                    n
                ],
                cluster_count: 0,
                eps: 0.0,
                degraded: true,
            };
        }

        let eps = self.distance_eps(points);
        let neighbors = self.neighborhoods(points, eps);

        let mut labels: Vec<Option<ClusterLabel>> = vec![None; n];
        let mut cluster_count = 0;
        let mut frontier = VecDeque::new();

        for i in 0..n {
            if labels[i].is_some() {
                continue;
            }
            if neighbors[i].len() + 1 < self.min_samples {
                labels[i] = Some(ClusterLabel::Noise);
                continue;
            }

            let id = cluster_count;
            cluster_count += 1;
            labels[i] = Some(ClusterLabel::Cluster(id));
            frontier.extend(neighbors[i].iter().copied());

            while let Some(j) = frontier.pop_front() {
                match labels[j] {
                    // border point reached from a core
                    Some(ClusterLabel::Noise) => labels[j] = Some(ClusterLabel::Cluster(id)),
                    Some(ClusterLabel::Cluster(_)) => {}
                    None => {
                        labels[j] = Some(ClusterLabel::Cluster(id));
                        if neighbors[j].len() + 1 >= self.min_samples {
                            frontier.extend(neighbors[j].iter().copied());
                        }
                    }
                }
            }
        }

        let assignments = labels
            .into_iter()
            .zip(&neighbors)
            .map(|(label, nb)| ClusterAssignment {
                label: label.unwrap_or(ClusterLabel::Noise),
                local_density: nb.len(),
            })
            .collect();

        ClusteringResult {
            assignments,
            cluster_count,
            eps,
            degraded: false,
        }
    }

    /// `max(eps_factor * std, 2 * sigma(mean))`; the floor keeps a flat
    /// surface from splitting on sensor noise alone
    fn distance_eps(&self, points: &[(f64, f64)]) -> f64 {
        let n = points.len() as f64;
        let mean = points.iter().map(|p| p.1).sum::<f64>() / n;
        let std = (points.iter().map(|p| (p.1 - mean).powi(2)).sum::<f64>() / n).sqrt();
        (self.eps_factor * std).max(2.0 * self.profile.accuracy_at(mean))
    }

    fn neighborhoods(&self, points: &[(f64, f64)], eps: f64) -> Vec<Vec<usize>> {
        let window = self.tuning.angle_window_deg.max(f64::EPSILON);
        let bucket_count = ((360.0 / window).floor() as usize).max(1);
        let bucket_width = 360.0 / bucket_count as f64;
        let bucket_of = |angle: f64| ((angle.rem_euclid(360.0) / bucket_width) as usize).min(bucket_count - 1);

        let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); bucket_count];
        for (i, (angle, _)) in points.iter().enumerate() {
            buckets[bucket_of(*angle)].push(i);
        }

        // bucket_width >= window, so neighbours live in adjacent buckets
        let mut candidates: Vec<usize> = Vec::with_capacity(3);
        points
            .iter()
            .enumerate()
            .map(|(i, &(angle, distance))| {
                let b = bucket_of(angle);
                candidates.clear();
                for offset in [bucket_count - 1, 0, 1] {
                    let c = (b + offset) % bucket_count;
                    if !candidates.contains(&c) {
                        candidates.push(c);
                    }
                }

                let mut found: Vec<usize> = candidates
                    .iter()
                    .flat_map(|c| buckets[*c].iter().copied())
                    .filter(|&j| {
                        j != i
                            && angular_separation(angle, points[j].0) <= window + 1e-9
                            && (distance - points[j].1).abs() <= eps
                    })
                    .collect();
                found.sort_unstable();
                found
            })
            .collect()
    }
}

/// Smallest separation between two bearings in degrees
pub fn angular_separation(a: f64, b: f64) -> f64 {
    let d = (a - b).abs().rem_euclid(360.0);
    d.min(360.0 - d)
}
