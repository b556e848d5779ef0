//! Range statistics over a set of readings.

use serde::{Deserialize, Serialize};

use crate::sensor::SensorProfile;

/// Distance statistics of one scan or sweep.
///
/// Only readings inside the sensor's rated range count as valid; the
/// distance moments are computed over valid readings and are zero when
/// there are none.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanStatistics {
    pub total_points: usize,
    pub valid_points: usize,
    pub min_distance: f64,
    pub max_distance: f64,
    pub avg_distance: f64,
    pub std_distance: f64,
    /// Share of readings that were valid, in percent
    pub coverage_percentage: f64,
}

impl ScanStatistics {
    pub fn from_distances<I>(distances: I, profile: &SensorProfile) -> Self
    where
        I: IntoIterator<Item = f64>,
    {
        let mut total_points = 0usize;
        let valid: Vec<f64> = distances
            .into_iter()
            .inspect(|_| total_points += 1)
            .filter(|d| profile.in_range(*d))
            .collect();

        if valid.is_empty() {
            return Self {
                total_points,
                ..Default::default()
            };
        }

        let n = valid.len() as f64;
        let avg = valid.iter().sum::<f64>() / n;
        let variance = valid.iter().map(|d| (d - avg).powi(2)).sum::<f64>() / n;

        Self {
            total_points,
            valid_points: valid.len(),
            min_distance: valid.iter().copied().fold(f64::INFINITY, f64::min),
            max_distance: valid.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            avg_distance: avg,
            std_distance: variance.sqrt(),
            coverage_percentage: valid.len() as f64 / total_points as f64 * 100.0,
        }
    }

    /// Combine two statistics as if computed over the union of readings
    pub fn merge(&self, other: &ScanStatistics) -> ScanStatistics {
        if self.valid_points == 0 || other.valid_points == 0 {
            let base = if self.valid_points == 0 { other } else { self };
            let total_points = self.total_points + other.total_points;
            return ScanStatistics {
                total_points,
                coverage_percentage: if total_points == 0 {
                    0.0
                } else {
                    base.valid_points as f64 / total_points as f64 * 100.0
                },
                ..*base
            };
        }

        let (n1, n2) = (self.valid_points as f64, other.valid_points as f64);
        let n = n1 + n2;
        let avg = (self.avg_distance * n1 + other.avg_distance * n2) / n;
        let second_moment = (n1 * (self.std_distance.powi(2) + self.avg_distance.powi(2))
            + n2 * (other.std_distance.powi(2) + other.avg_distance.powi(2)))
            / n;
        let total_points = self.total_points + other.total_points;
        let valid_points = self.valid_points + other.valid_points;

        ScanStatistics {
            total_points,
            valid_points,
            min_distance: self.min_distance.min(other.min_distance),
            max_distance: self.max_distance.max(other.max_distance),
            avg_distance: avg,
            std_distance: (second_moment - avg * avg).max(0.0).sqrt(),
            coverage_percentage: valid_points as f64 / total_points as f64 * 100.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_statistics_exclude_out_of_range() {
        let profile = SensorProfile::default();
        let stats = ScanStatistics::from_distances([100.0, 200.0, 300.0, 2.0, 5000.0], &profile);

        assert_eq!(stats.total_points, 5);
        assert_eq!(stats.valid_points, 3);
        assert_relative_eq!(stats.min_distance, 100.0);
        assert_relative_eq!(stats.max_distance, 300.0);
        assert_relative_eq!(stats.avg_distance, 200.0);
        assert_relative_eq!(stats.std_distance, (20000.0f64 / 3.0).sqrt(), epsilon = 1e-9);
        assert_relative_eq!(stats.coverage_percentage, 60.0);
    }

    #[test]
    fn test_empty_scan() {
        let stats = ScanStatistics::from_distances(Vec::new(), &SensorProfile::default());
        assert_eq!(stats, ScanStatistics::default());
    }

    #[test]
    fn test_merge_matches_union() {
        let profile = SensorProfile::default();
        let a = [120.0, 140.0, 160.0];
        let b = [300.0, 310.0, 1.0];
        let merged = ScanStatistics::from_distances(a, &profile)
            .merge(&ScanStatistics::from_distances(b, &profile));
        let union = ScanStatistics::from_distances(a.into_iter().chain(b), &profile);

        assert_eq!(merged.total_points, union.total_points);
        assert_eq!(merged.valid_points, union.valid_points);
        assert_relative_eq!(merged.avg_distance, union.avg_distance, epsilon = 1e-9);
        assert_relative_eq!(merged.std_distance, union.std_distance, epsilon = 1e-6);
        assert_relative_eq!(merged.coverage_percentage, union.coverage_percentage, epsilon = 1e-9);
    }
}
