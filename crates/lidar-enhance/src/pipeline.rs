//! Synchronous enhancement pipeline.
//!
//! Drives both stages on the caller's thread: samples go through the
//! sweep assembler, closed sweeps pass through the bounded queue and are
//! processed immediately.

use serde::{Deserialize, Serialize};

use lidar_core::{Result, Sample, Timestamp};

use crate::config::EnhancementConfig;
use crate::processor::SweepProcessor;
use crate::state_bank::{AngleBins, AngleStateBank};
use crate::summary::SweepOutput;
use crate::sweep::{ClosedSweep, ClosureReason, SweepAssembler, SweepQueue};

/// Counters over the lifetime of a pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub accepted_samples: u64,
    pub rejected_samples: u64,
    pub closed_sweeps: u64,
    pub timed_out_sweeps: u64,
    pub processed_sweeps: u64,
    pub dropped_sweeps: u64,
    pub dropped_samples: u64,
}

pub struct EnhancementPipeline {
    config: EnhancementConfig,
    bank: AngleStateBank,
    assembler: SweepAssembler,
    queue: SweepQueue,
    processor: SweepProcessor,
    processed_sweeps: u64,
}

impl EnhancementPipeline {
    pub fn new(config: EnhancementConfig) -> Result<Self> {
        config.validate()?;

        let bins = AngleBins::new(config.angle_bin_width_deg);
        Ok(Self {
            bank: AngleStateBank::new(bins, config.sensor_profile(), config.filter.clone()),
            assembler: SweepAssembler::new(config.sweep_timeout_ms, bins.count()),
            queue: SweepQueue::new(config.queue_depth),
            processor: SweepProcessor::new(&config),
            processed_sweeps: 0,
            config,
        })
    }

    /// Ingest one sample; returns the outputs of any sweep it closed.
    ///
    /// Malformed samples are rejected with [`lidar_core::Error::InvalidSample`]
    /// and leave the pipeline untouched apart from the rejection counter.
    pub fn ingest(&mut self, sample: Sample) -> Result<Vec<SweepOutput>> {
        let closed = self.assembler.ingest(sample, &mut self.bank)?;
        Ok(self.dispatch(closed))
    }

    /// Ingest many samples; malformed ones are logged and skipped
    pub fn ingest_batch(&mut self, samples: &[Sample]) -> Vec<SweepOutput> {
        let closed = self.assembler.ingest_batch(samples, &mut self.bank);
        self.dispatch(closed)
    }

    /// Close the open sweep if it is older than the timeout at `now`
    pub fn poll_timeout(&mut self, now: Timestamp) -> Vec<SweepOutput> {
        let closed = self.assembler.close_if_expired(now, &self.bank);
        self.dispatch(closed)
    }

    /// Force the open sweep closed
    pub fn close_sweep(&mut self, reason: ClosureReason) -> Vec<SweepOutput> {
        let closed = self.assembler.close(reason, &self.bank);
        self.dispatch(closed)
    }

    /// Finalize the in-flight sweep at end of stream
    pub fn finish(&mut self) -> Vec<SweepOutput> {
        self.close_sweep(ClosureReason::Teardown)
    }

    pub fn stats(&self) -> PipelineStats {
        let ingest = self.assembler.stats();
        PipelineStats {
            accepted_samples: ingest.accepted_samples,
            rejected_samples: ingest.rejected_samples,
            closed_sweeps: ingest.closed_sweeps,
            timed_out_sweeps: ingest.timed_out_sweeps,
            processed_sweeps: self.processed_sweeps,
            dropped_sweeps: self.queue.dropped_sweeps(),
            dropped_samples: self.queue.dropped_samples(),
        }
    }

    pub fn config(&self) -> &EnhancementConfig {
        &self.config
    }

    pub fn state_bank(&self) -> &AngleStateBank {
        &self.bank
    }

    /// Drop all per-angle state and history
    pub fn reset(&mut self) {
        self.bank.reset();
        self.processor.reset();
        self.assembler = SweepAssembler::new(self.config.sweep_timeout_ms, self.bank.bins().count());
        while self.queue.pop().is_some() {}
    }

    fn dispatch<I>(&mut self, closed: I) -> Vec<SweepOutput>
    where
        I: IntoIterator<Item = ClosedSweep>,
    {
        for sweep in closed {
            self.queue.push(sweep);
        }

        let mut outputs = Vec::new();
        while let Some(sweep) = self.queue.pop() {
            let processed = self.processor.process(sweep);
            self.bank.record_anomalies(&processed.anomaly_flags);
            self.processed_sweeps += 1;
            outputs.push(processed.output);
        }
        outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnhancementLevel;
    use lidar_core::{Decision, EnhancedSample, Error};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const SWEEP_NS: i64 = 100_000_000;
    const SAMPLE_NS: i64 = SWEEP_NS / 360;

    fn pipeline() -> EnhancementPipeline {
        EnhancementPipeline::new(EnhancementConfig::default()).unwrap()
    }

    /// Sensor noise within ±1 cm, roughly bell shaped
    fn noise(rng: &mut StdRng) -> f64 {
        let sum: f64 = (0..3).map(|_| rng.gen::<f64>()).sum();
        ((sum - 1.5) * 0.7).clamp(-1.0, 1.0)
    }

    fn sweep<F>(k: i64, mut distance: F) -> Vec<Sample>
    where
        F: FnMut(usize) -> f64,
    {
        (0..360)
            .map(|i| {
                Sample::new(
                    Timestamp(k * SWEEP_NS + i as i64 * SAMPLE_NS),
                    i as f64,
                    distance(i),
                )
            })
            .collect()
    }

    fn steady_sweeps(count: i64, rng: &mut StdRng) -> Vec<Vec<Sample>> {
        (0..count).map(|k| sweep(k, |_| 250.0 + noise(rng))).collect()
    }

    fn run(pipeline: &mut EnhancementPipeline, sweeps: &[Vec<Sample>]) -> Vec<SweepOutput> {
        let mut outputs = Vec::new();
        for samples in sweeps {
            for sample in samples {
                outputs.extend(pipeline.ingest(*sample).unwrap());
            }
        }
        outputs.extend(pipeline.finish());
        outputs
    }

    fn in_unit(sample: &EnhancedSample) -> bool {
        (0.0..=1.0).contains(&sample.confidence) && (0.0..=1.0).contains(&sample.quality_score)
    }

    #[test]
    fn test_output_preserves_count_and_order() {
        let mut rng = StdRng::seed_from_u64(1);
        let sweeps = steady_sweeps(4, &mut rng);
        let outputs = run(&mut pipeline(), &sweeps);

        assert_eq!(outputs.len(), 4);
        for (input, output) in sweeps.iter().zip(&outputs) {
            assert_eq!(output.samples.len(), input.len());
            for (s, e) in input.iter().zip(&output.samples) {
                assert_eq!(s.timestamp, e.timestamp);
                assert_eq!(s.angle, e.angle);
                assert_eq!(s.raw_distance, e.raw_distance);
            }
            assert!(output.samples.iter().all(in_unit));
        }
    }

    #[test]
    fn test_first_sample_of_bin_is_low_confidence() {
        let mut rng = StdRng::seed_from_u64(2);
        let outputs = run(&mut pipeline(), &steady_sweeps(1, &mut rng));

        let first = &outputs[0];
        assert!(first.samples.iter().all(|s| s.confidence <= 0.3));
        assert!(first.samples.iter().all(|s| s.flags.warm_up));
        assert!(first.samples.iter().all(|s| s.decision == Decision::Flag));
    }

    #[test]
    fn test_steady_surface() {
        let mut rng = StdRng::seed_from_u64(3);
        let outputs = run(&mut pipeline(), &steady_sweeps(8, &mut rng));
        let last = outputs.last().unwrap();

        assert!(
            last.summary.average_confidence >= 0.8,
            "average confidence {}",
            last.summary.average_confidence
        );
        assert!(last.samples.iter().all(in_unit));

        let close = last
            .samples
            .iter()
            .filter(|s| (s.enhanced_distance - 250.0).abs() <= 0.5)
            .count();
        assert!(close > 180, "{} of 360 within 0.5 cm", close);
        assert_eq!(last.summary.decisions.flagged, 0);
        assert!(last.summary.algorithm_performance.clustering_coherence > 0.99);
        assert!(last.summary.algorithm_performance.kalman_filter_effectiveness > 0.5);
        assert_eq!(last.summary.scan.valid_points, 360);
    }

    #[test]
    fn test_spike_is_corrected() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut sweeps = steady_sweeps(8, &mut rng);
        sweeps.push(sweep(8, |i| if i == 100 { 5.0 } else { 250.0 + noise(&mut rng) }));

        let mut pipeline = pipeline();
        let outputs = run(&mut pipeline, &sweeps);
        let spike = outputs.last().unwrap().samples[100];

        assert_eq!(spike.decision, Decision::Correct);
        assert!(spike.flags.anomalous);
        assert!(spike.flags.gated);
        assert!(spike.flags.spatial_outlier);
        assert!((spike.enhanced_distance - 250.0).abs() < 2.0);
        assert!(spike.quality_score < 0.2, "quality {}", spike.quality_score);

        let bin = pipeline.state_bank().state(100).unwrap();
        assert!((bin.estimated_distance - 250.0).abs() < 2.0);
        assert!(bin.anomaly_flags().last().unwrap());

        let summary = &outputs.last().unwrap().summary;
        assert!(summary.noise_reduction_percentage > 90.0);
        assert!(summary.decisions.corrected >= 1);
        assert_eq!(summary.decisions.flagged, 0);
    }

    #[test]
    fn test_overflowing_reading_does_not_poison_bin() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut sweeps = steady_sweeps(3, &mut rng);
        sweeps.push(sweep(3, |i| if i == 100 { 1e200 } else { 250.0 + noise(&mut rng) }));
        for k in 4..6 {
            sweeps.push(sweep(k, |_| 250.0 + noise(&mut rng)));
        }

        let mut pipeline = pipeline();
        let outputs = run(&mut pipeline, &sweeps);
        let last = outputs.last().unwrap().samples[100];

        assert!(last.enhanced_distance.is_finite());
        assert!((last.enhanced_distance - 250.0).abs() < 2.0);
        assert!(last.confidence.is_finite());

        let bin = pipeline.state_bank().state(100).unwrap();
        assert!((bin.estimated_distance - 250.0).abs() < 2.0);
        assert!(bin.uncertainty().is_finite());
        assert_eq!(bin.consecutive_gated, 0);
    }

    #[test]
    fn test_spike_anomaly_score() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut sweeps = steady_sweeps(8, &mut rng);
        sweeps.push(sweep(8, |i| if i == 100 { 5.0 } else { 250.0 + noise(&mut rng) }));

        let outputs = run(&mut pipeline(), &sweeps);
        let spike = outputs.last().unwrap().samples[100];
        // quality = confidence * (1 - anomaly)
        let anomaly = 1.0 - spike.quality_score / spike.confidence;
        assert!(anomaly > 0.6, "anomaly {}", anomaly);
    }

    #[test]
    fn test_spatial_ramp_not_flagged() {
        let mut pipeline = pipeline();
        let ramp = |i: usize| 250.0 + 50.0 * i as f64 / 359.0;
        let sweeps: Vec<Vec<Sample>> = (0..8).map(|k| sweep(k, ramp)).collect();
        let outputs = run(&mut pipeline, &sweeps);
        let last = outputs.last().unwrap();

        assert_eq!(last.summary.decisions.flagged, 0);
        // the seam at 0/359 is a genuine 50 cm discontinuity
        for sample in last.samples.iter().filter(|s| (10.0..350.0).contains(&s.angle)) {
            assert_eq!(sample.decision, Decision::Accept, "angle {}", sample.angle);
            assert!(!sample.flags.anomalous);
        }
    }

    #[test]
    fn test_temporal_ramp_not_flagged() {
        let mut rng = StdRng::seed_from_u64(6);
        let sweeps: Vec<Vec<Sample>> = (0..11)
            .map(|k| sweep(k, |_| 250.0 + 5.0 * k as f64 + noise(&mut rng)))
            .collect();
        let outputs = run(&mut pipeline(), &sweeps);

        for output in &outputs[4..] {
            assert_eq!(output.summary.decisions.flagged, 0);
            assert!(output.summary.average_confidence >= 0.8);
        }
        let last = outputs.last().unwrap();
        let accepted = last.summary.decisions.accepted;
        assert!(accepted > 340, "accepted {}", accepted);
    }

    #[test]
    fn test_partial_sweep_is_filled() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut pipeline = pipeline();
        let mut outputs = Vec::new();
        for samples in steady_sweeps(5, &mut rng) {
            for sample in samples {
                outputs.extend(pipeline.ingest(sample).unwrap());
            }
        }
        for sample in sweep(5, |_| 250.0 + noise(&mut rng)).into_iter().take(300) {
            outputs.extend(pipeline.ingest(sample).unwrap());
        }
        assert_eq!(outputs.len(), 5);

        let partial = pipeline.close_sweep(ClosureReason::Timeout);
        assert_eq!(partial.len(), 1);
        let partial = &partial[0];

        assert_eq!(partial.samples.len(), 360);
        assert_eq!(partial.summary.original_point_count, 300);
        assert_eq!(partial.summary.enhanced_point_count, 360);
        assert_eq!(partial.summary.decisions.filled, 60);

        let filled: Vec<&EnhancedSample> = partial.samples.iter().filter(|s| s.flags.filled).collect();
        assert_eq!(filled.len(), 60);
        assert!(filled.iter().all(|s| s.decision == Decision::Flag));
        assert!(filled.iter().all(|s| (s.enhanced_distance - 250.0).abs() < 2.0));
        assert!(filled.iter().all(|s| s.angle >= 300.0));
        assert!(partial.samples[..300].iter().all(|s| !s.flags.filled));
    }

    #[test]
    fn test_late_sample_closes_by_timeout() {
        let mut rng = StdRng::seed_from_u64(8);
        let mut pipeline = pipeline();
        run(&mut pipeline, &steady_sweeps(3, &mut rng));

        for sample in sweep(3, |_| 250.0).into_iter().take(300) {
            assert!(pipeline.ingest(sample).unwrap().is_empty());
        }
        let late = Sample::new(Timestamp(3 * SWEEP_NS + 700_000_000), 0.5, 250.0);
        let outputs = pipeline.ingest(late).unwrap();

        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].summary.reason, ClosureReason::Timeout);
        assert_eq!(outputs[0].samples.len(), 360);
        assert_eq!(pipeline.stats().timed_out_sweeps, 1);
    }

    #[test]
    fn test_poll_timeout() {
        let mut pipeline = pipeline();
        pipeline.ingest(Sample::new(Timestamp(0), 1.0, 100.0)).unwrap();
        assert!(pipeline.poll_timeout(Timestamp(100_000_000)).is_empty());
        assert_eq!(pipeline.poll_timeout(Timestamp(600_000_000)).len(), 1);
    }

    #[test]
    fn test_invalid_samples_are_rejected() {
        let mut pipeline = pipeline();
        let err = pipeline.ingest(Sample::new(Timestamp(0), 10.0, -3.0)).unwrap_err();
        assert!(matches!(err, Error::InvalidSample { .. }));

        let mut samples = sweep(0, |_| 250.0);
        samples[10].raw_distance = f64::NAN;
        samples[20].angle = 361.0;
        let outputs = pipeline.ingest_batch(&samples);
        let outputs: Vec<SweepOutput> = outputs.into_iter().chain(pipeline.finish()).collect();

        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].samples.len(), 358);
        let stats = pipeline.stats();
        assert_eq!(stats.rejected_samples, 3);
        assert_eq!(stats.accepted_samples, 358);
        assert_eq!(stats.processed_sweeps, 1);
    }

    #[test]
    fn test_batch_ingest_matches_single() {
        let mut rng = StdRng::seed_from_u64(9);
        let sweeps = steady_sweeps(4, &mut rng);
        let flat: Vec<Sample> = sweeps.iter().flatten().copied().collect();

        let single = run(&mut pipeline(), &sweeps);
        let mut batched_pipeline = pipeline();
        let mut batched = batched_pipeline.ingest_batch(&flat);
        batched.extend(batched_pipeline.finish());

        assert_eq!(single.len(), batched.len());
        for (a, b) in single.iter().zip(&batched) {
            assert_eq!(a.samples, b.samples);
        }
    }

    #[test]
    fn test_basic_level_skips_sweep_stages() {
        let config = EnhancementConfig {
            enhancement_level: EnhancementLevel::Basic,
            ..Default::default()
        };
        let mut pipeline = EnhancementPipeline::new(config).unwrap();
        let mut rng = StdRng::seed_from_u64(10);
        let mut sweeps = steady_sweeps(6, &mut rng);
        sweeps.push(sweep(6, |i| if i == 100 { 5.0 } else { 250.0 + noise(&mut rng) }));
        let outputs = run(&mut pipeline, &sweeps);
        let last = outputs.last().unwrap();

        assert_eq!(last.samples.len(), 360);
        assert!(last.samples.iter().all(|s| !s.flags.anomalous && !s.flags.spatial_outlier));
        assert_eq!(last.summary.algorithm_performance.clustering_coherence, 0.0);
        assert_eq!(last.summary.algorithm_performance.anomaly_detection_accuracy, 0.0);
        assert_ne!(last.samples[100].decision, Decision::Accept);
        assert!(last.summary.average_confidence > 0.8);
    }

    #[test]
    fn test_reset_returns_to_cold_start() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut pipeline = pipeline();
        run(&mut pipeline, &steady_sweeps(3, &mut rng));
        assert_eq!(pipeline.state_bank().active_bins(), 360);

        pipeline.reset();
        assert_eq!(pipeline.state_bank().active_bins(), 0);
        let outputs = run(&mut pipeline, &steady_sweeps(1, &mut rng));
        assert!(outputs[0].samples.iter().all(|s| s.flags.warm_up));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = EnhancementConfig {
            queue_depth: 0,
            ..Default::default()
        };
        assert!(EnhancementPipeline::new(config).is_err());
    }
}
