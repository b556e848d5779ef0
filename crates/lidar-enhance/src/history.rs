//! Sliding-window history per angle bin.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use lidar_core::Timestamp;

/// One processed sample as remembered by its bin
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: Timestamp,
    pub raw_distance: f64,
    pub innovation: f64,
    pub anomalous: bool,
    pub confidence: f64,
}

/// Least-squares rate of change of raw distance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateOfChange {
    /// cm/s
    pub slope: f64,
    /// Mean spacing between consecutive readings in seconds
    pub mean_step_secs: f64,
}

/// Bounded FIFO of a single bin
#[derive(Debug, Clone)]
pub struct AngleHistory {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl AngleHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }

    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    /// Time origin for regressions, keeps `f64` seconds small
    fn origin(&self) -> Option<Timestamp> {
        self.entries.front().map(|e| e.timestamp)
    }

    fn points(&self) -> Vec<(f64, f64)> {
        let Some(origin) = self.origin() else {
            return Vec::new();
        };
        self.entries
            .iter()
            .map(|e| (e.timestamp.secs_since(origin), e.raw_distance))
            .collect()
    }

    /// Slope of raw distance over time, optionally extended by the reading
    /// currently being evaluated
    pub fn rate_of_change(&self, current: Option<(Timestamp, f64)>) -> Option<RateOfChange> {
        let origin = self.origin().or(current.map(|(t, _)| t))?;
        let mut points = self.points();
        if let Some((t, d)) = current {
            points.push((t.secs_since(origin), d));
        }
        if points.len() < 2 {
            return None;
        }

        let (slope, _) = linear_fit(&points)?;
        let span = points[points.len() - 1].0 - points[0].0;
        Some(RateOfChange {
            slope,
            mean_step_secs: span / (points.len() - 1) as f64,
        })
    }

    /// Standard deviation of raw distances around their linear trend
    pub fn residual_spread(&self) -> Option<f64> {
        if self.entries.len() < 3 {
            return None;
        }
        let points = self.points();
        let (slope, intercept) = linear_fit(&points)?;
        let sum_sq: f64 = points
            .iter()
            .map(|(t, d)| (d - (intercept + slope * t)).powi(2))
            .sum();
        Some((sum_sq / points.len() as f64).sqrt())
    }

    /// Linear trend of the window evaluated at `at`; the last reading when
    /// the window holds a single entry
    pub fn trend_at(&self, at: Timestamp) -> Option<f64> {
        match self.entries.len() {
            0 => None,
            1 => self.last().map(|e| e.raw_distance),
            _ => {
                let origin = self.origin()?;
                let (slope, intercept) = linear_fit(&self.points())?;
                Some(intercept + slope * at.secs_since(origin))
            }
        }
    }

    /// Fraction of remembered samples the detector flagged
    pub fn anomaly_frequency(&self) -> Option<f64> {
        if self.entries.is_empty() {
            return None;
        }
        let flagged = self.entries.iter().filter(|e| e.anomalous).count();
        Some(flagged as f64 / self.entries.len() as f64)
    }

    /// Moving average of stored confidences
    pub fn confidence_trend(&self) -> Option<f64> {
        if self.entries.is_empty() {
            return None;
        }
        Some(self.entries.iter().map(|e| e.confidence).sum::<f64>() / self.entries.len() as f64)
    }
}

/// Ordinary least squares `y = intercept + slope * x`.
///
/// Degenerate abscissae (all equal) yield a flat line through the mean.
pub fn linear_fit(points: &[(f64, f64)]) -> Option<(f64, f64)> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (x, y) in points {
        sxx += (x - mean_x).powi(2);
        sxy += (x - mean_x) * (y - mean_y);
    }

    let slope = if sxx > 1e-12 { sxy / sxx } else { 0.0 };
    Some((slope, mean_y - slope * mean_x))
}

/// Per-bin histories for the whole revolution
pub struct HistoricalPatternStore {
    window: usize,
    bins: Vec<AngleHistory>,
}

impl HistoricalPatternStore {
    pub fn new(bin_count: usize, window: usize) -> Self {
        Self {
            window,
            bins: vec![AngleHistory::new(window); bin_count],
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn get(&self, bin: usize) -> &AngleHistory {
        &self.bins[bin]
    }

    pub fn record(&mut self, bin: usize, entry: HistoryEntry) {
        self.bins[bin].push(entry);
    }

    pub fn reset(&mut self) {
        let window = self.window;
        self.bins.iter_mut().for_each(|h| *h = AngleHistory::new(window));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn entry(secs: f64, distance: f64, anomalous: bool, confidence: f64) -> HistoryEntry {
        HistoryEntry {
            timestamp: Timestamp::from_secs_f64(secs),
            raw_distance: distance,
            innovation: 0.0,
            anomalous,
            confidence,
        }
    }

    #[test]
    fn test_fifo_eviction() {
        let mut history = AngleHistory::new(3);
        for i in 0..5 {
            history.push(entry(i as f64, 100.0 + i as f64, false, 0.9));
        }
        assert_eq!(history.len(), 3);
        let kept: Vec<f64> = history.entries().map(|e| e.raw_distance).collect();
        assert_eq!(kept, vec![102.0, 103.0, 104.0]);
    }

    #[test]
    fn test_rate_of_change() {
        let mut history = AngleHistory::new(20);
        assert!(history.rate_of_change(None).is_none());
        for i in 0..5 {
            history.push(entry(i as f64 * 0.1, 250.0 + 5.0 * i as f64, false, 0.9));
        }

        let rate = history.rate_of_change(None).unwrap();
        assert_relative_eq!(rate.slope, 50.0, epsilon = 1e-6);
        assert_relative_eq!(rate.mean_step_secs, 0.1, epsilon = 1e-9);

        let with_current = history
            .rate_of_change(Some((Timestamp::from_secs_f64(0.5), 275.0)))
            .unwrap();
        assert_relative_eq!(with_current.slope, 50.0, epsilon = 1e-6);

        let single = AngleHistory::new(4);
        assert!(single
            .rate_of_change(Some((Timestamp::from_secs_f64(1.0), 1.0)))
            .is_none());
    }

    #[test]
    fn test_residual_spread_ignores_trend() {
        let mut history = AngleHistory::new(20);
        for i in 0..10 {
            history.push(entry(i as f64 * 0.1, 200.0 + 3.0 * i as f64, false, 0.9));
        }
        assert!(history.residual_spread().unwrap() < 1e-9);

        let mut noisy = AngleHistory::new(20);
        for (i, d) in [250.0, 252.0, 248.0, 252.0, 248.0].iter().enumerate() {
            noisy.push(entry(i as f64 * 0.1, *d, false, 0.9));
        }
        assert!(noisy.residual_spread().unwrap() > 1.0);
    }

    #[test]
    fn test_trend_extrapolation() {
        let mut history = AngleHistory::new(20);
        assert!(history.trend_at(Timestamp(0)).is_none());
        history.push(entry(0.0, 100.0, false, 0.9));
        assert_eq!(history.trend_at(Timestamp::from_secs_f64(5.0)), Some(100.0));
        history.push(entry(0.1, 110.0, false, 0.9));
        assert_relative_eq!(
            history.trend_at(Timestamp::from_secs_f64(0.2)).unwrap(),
            120.0,
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_frequency_and_trend() {
        let mut history = AngleHistory::new(4);
        assert!(history.anomaly_frequency().is_none());
        history.push(entry(0.0, 1.0, true, 0.2));
        history.push(entry(0.1, 1.0, false, 0.6));
        history.push(entry(0.2, 1.0, false, 0.7));
        history.push(entry(0.3, 1.0, true, 0.5));

        assert_relative_eq!(history.anomaly_frequency().unwrap(), 0.5);
        assert_relative_eq!(history.confidence_trend().unwrap(), 0.5);
    }

    #[test]
    fn test_store_isolates_bins() {
        let mut store = HistoricalPatternStore::new(360, 20);
        store.record(7, entry(0.0, 1.0, false, 1.0));
        assert_eq!(store.get(7).len(), 1);
        assert!(store.get(8).is_empty());
        store.reset();
        assert!(store.get(7).is_empty());
        assert_eq!(store.window(), 20);
    }
}
