//! Per-angle constant-velocity state estimation.
//!
//! Every angle bin owns one [`AngleState`] for the lifetime of the stream.
//! The bank is an arena indexed by bin; bins never share state, so a run
//! of samples can be updated in parallel by grouping it per bin.

use std::collections::VecDeque;

use nalgebra::{Matrix2, RowVector2, Vector2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use lidar_core::{Sample, SensorProfile, Timestamp};

/// Estimator tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// White-noise acceleration spectral density (cm²/s³)
    pub process_noise: f64,
    /// Innovation gate in standard deviations
    pub gate_sigma: f64,
    /// Consecutive gated updates before a bin re-acquires
    pub max_consecutive_gated: u32,
    pub initial_distance_variance: f64,
    pub initial_velocity_variance: f64,
    /// Length of the per-bin innovation and anomaly-flag histories
    pub innovation_history: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            process_noise: 50.0,
            gate_sigma: 5.0,
            max_consecutive_gated: 3,
            initial_distance_variance: 1e4,
            initial_velocity_variance: 2.5e3,
            innovation_history: 16,
        }
    }
}

/// Uniform partition of `[0, 360)` into angle bins
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AngleBins {
    width_deg: f64,
    count: usize,
}

impl AngleBins {
    pub fn new(width_deg: f64) -> Self {
        let count = (360.0 / width_deg).ceil().max(1.0) as usize;
        Self { width_deg, count }
    }

    pub fn width_deg(&self) -> f64 {
        self.width_deg
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Bin owning `angle`; angles are expected in `[0, 360)`
    pub fn bin_of(&self, angle: f64) -> usize {
        ((angle / self.width_deg).floor() as usize).min(self.count - 1)
    }

    pub fn center(&self, bin: usize) -> f64 {
        ((bin as f64 + 0.5) * self.width_deg).min(360.0 - f64::EPSILON)
    }
}

/// Persistent estimator state of one angle bin
#[derive(Debug, Clone)]
pub struct AngleState {
    pub estimated_distance: f64,
    pub estimated_velocity: f64,
    pub covariance: Matrix2<f64>,
    pub last_update: Timestamp,
    pub last_raw_distance: f64,
    pub update_count: u64,
    pub consecutive_gated: u32,
    innovations: VecDeque<f64>,
    anomaly_flags: VecDeque<bool>,
    history_len: usize,
}

impl AngleState {
    fn cold_start(sample: &Sample, config: &FilterConfig) -> Self {
        Self {
            estimated_distance: sample.raw_distance,
            estimated_velocity: 0.0,
            covariance: Matrix2::new(
                config.initial_distance_variance,
                0.0,
                0.0,
                config.initial_velocity_variance,
            ),
            last_update: sample.timestamp,
            last_raw_distance: sample.raw_distance,
            update_count: 1,
            consecutive_gated: 0,
            innovations: VecDeque::with_capacity(config.innovation_history),
            anomaly_flags: VecDeque::with_capacity(config.innovation_history),
            history_len: config.innovation_history.max(1),
        }
    }

    pub fn state_vector(&self) -> Vector2<f64> {
        Vector2::new(self.estimated_distance, self.estimated_velocity)
    }

    pub fn innovations(&self) -> impl Iterator<Item = f64> + '_ {
        self.innovations.iter().copied()
    }

    pub fn anomaly_flags(&self) -> impl Iterator<Item = bool> + '_ {
        self.anomaly_flags.iter().copied()
    }

    /// Covariance trace, the scalar uncertainty of the bin
    pub fn uncertainty(&self) -> f64 {
        self.covariance.trace()
    }

    fn push_innovation(&mut self, innovation: f64) {
        if self.innovations.len() >= self.history_len {
            self.innovations.pop_front();
        }
        self.innovations.push_back(innovation);
    }

    fn push_anomaly_flag(&mut self, anomalous: bool) {
        if self.anomaly_flags.len() >= self.history_len {
            self.anomaly_flags.pop_front();
        }
        self.anomaly_flags.push_back(anomalous);
    }
}

/// Result of feeding one sample through its bin's estimator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    pub bin: usize,
    /// Prior distance before this sample was applied
    pub predicted_distance: f64,
    pub predicted_velocity: f64,
    pub estimated_distance: f64,
    pub estimated_velocity: f64,
    /// `raw - predicted`
    pub innovation: f64,
    /// Innovation variance `S = P_pred[0,0] + R`
    pub innovation_variance: f64,
    /// Seconds since the bin's previous update
    pub dt: f64,
    pub warm_up: bool,
    pub gated: bool,
}

impl StateUpdate {
    /// Squared Mahalanobis distance of the innovation
    pub fn normalized_innovation_sq(&self) -> f64 {
        if self.innovation_variance <= 0.0 {
            return 0.0;
        }
        let nis = self.innovation * self.innovation / self.innovation_variance;
        if nis.is_nan() {
            f64::INFINITY
        } else {
            nis
        }
    }
}

/// Last known estimate of a bin that did not report in a sweep
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MissingBin {
    pub bin: usize,
    pub angle: f64,
    pub last_raw_distance: f64,
    pub estimated_distance: f64,
    pub estimated_velocity: f64,
}

/// Arena of per-bin estimators
pub struct AngleStateBank {
    config: FilterConfig,
    profile: SensorProfile,
    bins: AngleBins,
    states: Vec<Option<AngleState>>,
}

impl AngleStateBank {
    pub fn new(bins: AngleBins, profile: SensorProfile, config: FilterConfig) -> Self {
        Self {
            config,
            profile,
            bins,
            states: vec![None; bins.count()],
        }
    }

    pub fn bins(&self) -> AngleBins {
        self.bins
    }

    pub fn profile(&self) -> &SensorProfile {
        &self.profile
    }

    pub fn state(&self, bin: usize) -> Option<&AngleState> {
        self.states.get(bin).and_then(Option::as_ref)
    }

    pub fn active_bins(&self) -> usize {
        self.states.iter().filter(|s| s.is_some()).count()
    }

    /// Apply one validated sample to its bin
    pub fn update(&mut self, sample: &Sample) -> StateUpdate {
        let bin = self.bins.bin_of(sample.angle);
        update_slot(&mut self.states[bin], bin, sample, &self.config, &self.profile)
    }

    /// Apply a run of validated samples, parallel across bins.
    ///
    /// Samples of the same bin are applied in arrival order, so the result
    /// equals calling [`update`](Self::update) sequentially.
    pub fn update_batch(&mut self, samples: &[Sample]) -> Vec<StateUpdate> {
        if samples.len() < 2 {
            return samples.iter().map(|s| self.update(s)).collect();
        }

        let mut per_bin: Vec<Vec<usize>> = vec![Vec::new(); self.bins.count()];
        for (i, sample) in samples.iter().enumerate() {
            per_bin[self.bins.bin_of(sample.angle)].push(i);
        }

        let config = &self.config;
        let profile = &self.profile;
        let results: Vec<(usize, StateUpdate)> = self
            .states
            .par_iter_mut()
            .zip(per_bin.par_iter())
            .enumerate()
            .filter(|(_, (_, indices))| !indices.is_empty())
            .flat_map_iter(|(bin, (slot, indices))| {
                indices
                    .iter()
                    .map(|&i| (i, update_slot(slot, bin, &samples[i], config, profile)))
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut ordered: Vec<Option<StateUpdate>> = vec![None; samples.len()];
        for (i, update) in results {
            ordered[i] = Some(update);
        }
        ordered.into_iter().flatten().collect()
    }

    /// Store the detector verdicts of a processed sweep
    pub fn record_anomalies(&mut self, flags: &[(usize, bool)]) {
        for &(bin, anomalous) in flags {
            if let Some(Some(state)) = self.states.get_mut(bin) {
                state.push_anomaly_flag(anomalous);
            }
        }
    }

    /// Bins holding state that are absent from `observed`
    pub fn missing_bins(&self, observed: &[bool]) -> Vec<MissingBin> {
        self.states
            .iter()
            .enumerate()
            .filter(|(bin, _)| !observed.get(*bin).copied().unwrap_or(false))
            .filter_map(|(bin, slot)| {
                slot.as_ref().map(|state| MissingBin {
                    bin,
                    angle: self.bins.center(bin),
                    last_raw_distance: state.last_raw_distance,
                    estimated_distance: state.estimated_distance,
                    estimated_velocity: state.estimated_velocity,
                })
            })
            .collect()
    }

    /// RMS of the bin's recent innovations
    pub fn innovation_rms(&self, bin: usize) -> Option<f64> {
        let state = self.state(bin)?;
        if state.innovations.is_empty() {
            return None;
        }
        let sum_sq: f64 = state.innovations.iter().map(|v| v * v).sum();
        Some((sum_sq / state.innovations.len() as f64).sqrt())
    }

    /// Drop all per-bin state (stream teardown)
    pub fn reset(&mut self) {
        self.states.iter_mut().for_each(|s| *s = None);
    }
}

fn cold_update(bin: usize, sample: &Sample, state: &AngleState, profile: &SensorProfile) -> StateUpdate {
    StateUpdate {
        bin,
        predicted_distance: sample.raw_distance,
        predicted_velocity: 0.0,
        estimated_distance: state.estimated_distance,
        estimated_velocity: state.estimated_velocity,
        innovation: 0.0,
        innovation_variance: profile.noise_variance(sample.raw_distance),
        dt: 0.0,
        warm_up: true,
        gated: false,
    }
}

fn update_slot(
    slot: &mut Option<AngleState>,
    bin: usize,
    sample: &Sample,
    config: &FilterConfig,
    profile: &SensorProfile,
) -> StateUpdate {
    let state = match slot {
        Some(state) => state,
        None => {
            let state = slot.insert(AngleState::cold_start(sample, config));
            return cold_update(bin, sample, state, profile);
        }
    };

    let dt = sample.timestamp.secs_since(state.last_update).max(0.0);
    let f = Matrix2::new(1.0, dt, 0.0, 1.0);
    let q = config.process_noise
        * Matrix2::new(dt.powi(3) / 3.0, dt.powi(2) / 2.0, dt.powi(2) / 2.0, dt);

    let x_pred = f * state.state_vector();
    let p_pred = f * state.covariance * f.transpose() + q;

    let z = sample.raw_distance;
    let r = profile.noise_variance(z);
    let innovation = z - x_pred[0];
    let s = p_pred[(0, 0)] + r;

    // Readings whose noise model overflows can only be gated
    let usable = r.is_finite();
    let measurable = usable && s.is_finite() && (innovation * innovation).is_finite();
    let corrected = if measurable
        && innovation * innovation / s <= config.gate_sigma * config.gate_sigma
    {
        joseph_update(&x_pred, &p_pred, innovation, r, s)
    } else {
        None
    };

    let gated = corrected.is_none();
    match corrected {
        Some((x, p)) => {
            state.estimated_distance = x[0];
            state.estimated_velocity = x[1];
            state.covariance = p;
            state.consecutive_gated = 0;
        }
        None => {
            if usable && state.consecutive_gated + 1 >= config.max_consecutive_gated {
                tracing::debug!(bin, raw = z, predicted = x_pred[0], "angle bin re-acquired");
                let state = slot.insert(AngleState::cold_start(sample, config));
                return cold_update(bin, sample, state, profile);
            }
            if !usable {
                tracing::debug!(bin, raw = z, "unusable reading held at prediction");
            }

            state.estimated_distance = x_pred[0];
            state.estimated_velocity = x_pred[1];
            state.covariance = p_pred;
            state.consecutive_gated = state.consecutive_gated.saturating_add(1);
        }
    }

    state.last_update = sample.timestamp;
    state.update_count += 1;
    if usable {
        state.last_raw_distance = z;
    }
    if measurable {
        state.push_innovation(innovation);
    }

    StateUpdate {
        bin,
        predicted_distance: x_pred[0],
        predicted_velocity: x_pred[1],
        estimated_distance: state.estimated_distance,
        estimated_velocity: state.estimated_velocity,
        innovation,
        innovation_variance: s,
        dt,
        warm_up: false,
        gated,
    }
}

/// Joseph-form measurement update; `None` when the result is not finite
fn joseph_update(
    x_pred: &Vector2<f64>,
    p_pred: &Matrix2<f64>,
    innovation: f64,
    r: f64,
    s: f64,
) -> Option<(Vector2<f64>, Matrix2<f64>)> {
    let k = Vector2::new(p_pred[(0, 0)] / s, p_pred[(1, 0)] / s);
    let x = x_pred + k * innovation;

    let h = RowVector2::new(1.0, 0.0);
    let i_kh = Matrix2::identity() - k * h;
    let p = i_kh * p_pred * i_kh.transpose() + k * r * k.transpose();
    let p = (p + p.transpose()) * 0.5;

    (x.iter().chain(p.iter()).all(|v| v.is_finite())).then_some((x, p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const SWEEP_NS: i64 = 100_000_000;

    fn bank() -> AngleStateBank {
        AngleStateBank::new(AngleBins::new(1.0), SensorProfile::default(), FilterConfig::default())
    }

    fn sample(sweep: i64, angle: f64, distance: f64) -> Sample {
        Sample::new(Timestamp(sweep * SWEEP_NS), angle, distance)
    }

    #[test]
    fn test_bins_are_exhaustive() {
        let bins = AngleBins::new(1.0);
        assert_eq!(bins.count(), 360);
        assert_eq!(bins.bin_of(0.0), 0);
        assert_eq!(bins.bin_of(0.999), 0);
        assert_eq!(bins.bin_of(1.0), 1);
        assert_eq!(bins.bin_of(359.999), 359);
        assert_relative_eq!(bins.center(10), 10.5);

        let coarse = AngleBins::new(7.0);
        assert_eq!(coarse.count(), 52);
        assert_eq!(coarse.bin_of(359.9), 51);
    }

    #[test]
    fn test_cold_start_is_warm_up() {
        let mut bank = bank();
        let update = bank.update(&sample(0, 10.0, 250.0));

        assert!(update.warm_up);
        assert_eq!(update.innovation, 0.0);
        assert_eq!(update.predicted_distance, 250.0);
        assert_eq!(bank.active_bins(), 1);
        assert_eq!(bank.state(10).unwrap().estimated_distance, 250.0);
    }

    #[test]
    fn test_converges_on_static_target() {
        let mut bank = bank();
        let noise = [0.8, -0.6, 0.3, -0.9, 0.5, -0.2, 0.7, -0.4, 0.1, -0.3];
        for (k, n) in noise.iter().enumerate() {
            bank.update(&sample(k as i64, 45.0, 250.0 + n));
        }

        let state = bank.state(45).unwrap();
        assert!((state.estimated_distance - 250.0).abs() < 0.6);
        assert!(state.estimated_velocity.abs() < 5.0);
        assert!(state.covariance[(0, 0)] < 1.0);
        assert!(state.uncertainty() >= 0.0);
        assert!(state.covariance.determinant() >= 0.0);
    }

    #[test]
    fn test_tracks_receding_target() {
        let mut bank = bank();
        // 50 cm/s
        for k in 0..15 {
            bank.update(&sample(k, 90.0, 200.0 + 5.0 * k as f64));
        }
        let state = bank.state(90).unwrap();
        assert_relative_eq!(state.estimated_velocity, 50.0, epsilon = 2.0);
        assert_relative_eq!(state.estimated_distance, 270.0, epsilon = 1.0);
    }

    #[test]
    fn test_gate_holds_prediction() {
        let mut bank = bank();
        for k in 0..8 {
            bank.update(&sample(k, 100.0, 250.0));
        }

        let update = bank.update(&sample(8, 100.0, 5.0));
        assert!(update.gated);
        assert!(!update.warm_up);
        assert_relative_eq!(update.estimated_distance, 250.0, epsilon = 0.5);
        assert_relative_eq!(update.innovation, -245.0, epsilon = 0.5);
        assert!(update.normalized_innovation_sq() > 25.0);
        assert_eq!(bank.state(100).unwrap().consecutive_gated, 1);

        let recovered = bank.update(&sample(9, 100.0, 250.0));
        assert!(!recovered.gated);
        assert_eq!(bank.state(100).unwrap().consecutive_gated, 0);
    }

    #[test]
    fn test_reacquires_after_persistent_step() {
        let mut bank = bank();
        for k in 0..8 {
            bank.update(&sample(k, 200.0, 250.0));
        }

        let first = bank.update(&sample(8, 200.0, 100.0));
        let second = bank.update(&sample(9, 200.0, 100.0));
        let third = bank.update(&sample(10, 200.0, 100.0));

        assert!(first.gated && second.gated);
        assert!(third.warm_up);
        assert_eq!(bank.state(200).unwrap().estimated_distance, 100.0);
        assert_eq!(bank.state(200).unwrap().update_count, 1);
    }

    #[test]
    fn test_batch_matches_sequential() {
        let samples: Vec<Sample> = (0..3)
            .flat_map(|k| {
                (0..360).map(move |i| {
                    let wobble = ((i * 7 + k * 13) % 11) as f64 * 0.1 - 0.5;
                    Sample::new(
                        Timestamp(k * SWEEP_NS + i * 277_777),
                        i as f64 + 0.25,
                        250.0 + wobble,
                    )
                })
            })
            .collect();

        let mut sequential = bank();
        let expected: Vec<StateUpdate> = samples.iter().map(|s| sequential.update(s)).collect();

        let mut batched = bank();
        let actual = batched.update_batch(&samples);

        assert_eq!(expected, actual);
    }

    #[test]
    fn test_missing_bins_and_anomaly_history() {
        let mut bank = bank();
        bank.update(&sample(0, 1.5, 120.0));
        bank.update(&sample(0, 2.5, 130.0));
        bank.record_anomalies(&[(1, true), (2, false), (300, true)]);

        let mut observed = vec![false; 360];
        observed[2] = true;
        let missing = bank.missing_bins(&observed);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].bin, 1);
        assert_eq!(missing[0].last_raw_distance, 120.0);

        let flags: Vec<bool> = bank.state(1).unwrap().anomaly_flags().collect();
        assert_eq!(flags, vec![true]);

        bank.reset();
        assert_eq!(bank.active_bins(), 0);
    }

    #[test]
    fn test_overflowing_reading_keeps_state_finite() {
        let mut bank = bank();
        for k in 0..3 {
            bank.update(&sample(k, 100.0, 250.0));
        }

        let huge = bank.update(&sample(3, 100.0, 1e200));
        assert!(huge.gated);
        assert!(huge.estimated_distance.is_finite());
        assert!(huge.normalized_innovation_sq() > 25.0);

        for k in 4..8 {
            let update = bank.update(&sample(k, 100.0, 250.0));
            assert!(!update.gated);
        }

        let state = bank.state(100).unwrap();
        assert_relative_eq!(state.estimated_distance, 250.0, epsilon = 0.5);
        assert!(state.uncertainty().is_finite() && state.uncertainty() >= 0.0);
        assert_eq!(state.consecutive_gated, 0);
        assert_eq!(state.last_raw_distance, 250.0);
        assert!(bank.innovation_rms(100).unwrap().is_finite());
    }

    #[test]
    fn test_overflowing_first_reading_reacquires() {
        let mut bank = bank();
        bank.update(&sample(0, 30.0, 1e200));

        let updates: Vec<StateUpdate> = (1..4).map(|k| bank.update(&sample(k, 30.0, 250.0))).collect();
        assert!(updates[0].gated && updates[1].gated);
        assert!(updates[2].warm_up);
        assert_eq!(bank.state(30).unwrap().estimated_distance, 250.0);
    }

    #[test]
    fn test_innovation_rms() {
        let mut bank = bank();
        assert!(bank.innovation_rms(5).is_none());
        bank.update(&sample(0, 5.0, 100.0));
        bank.update(&sample(1, 5.0, 101.0));
        let rms = bank.innovation_rms(5).unwrap();
        assert!(rms > 0.0 && rms <= 1.0 + 1e-9);
    }
}
