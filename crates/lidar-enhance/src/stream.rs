//! Pipelined streaming service.
//!
//! Stage one (validation, per-bin state update, sweep closure) and stage
//! two (clustering, anomaly scoring, confidence, consensus) run as separate
//! tasks. The angle state bank is shared behind a mutex; stage two only
//! takes it to store the detector verdicts of a finished sweep.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use lidar_core::{Error, Result};

use crate::config::EnhancementConfig;
use crate::pipeline::PipelineStats;
use crate::processor::SweepProcessor;
use crate::source::SampleSource;
use crate::state_bank::{AngleBins, AngleStateBank};
use crate::summary::SweepOutput;
use crate::sweep::{ClosureReason, IngestStats, SharedSweepQueue, SweepAssembler};

/// Checks per timeout period for a stalled sweep
const TIMEOUT_CHECKS_PER_PERIOD: u32 = 4;

/// Minimum time a restart waits for the previous run to drain
const MIN_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Default)]
struct SharedStats {
    ingest: IngestStats,
    processed_sweeps: u64,
}

/// State owned by one `start_streaming` call
struct StreamRun {
    is_running: Arc<RwLock<bool>>,
    stats: Arc<Mutex<SharedStats>>,
    queue: Arc<SharedSweepQueue>,
    tasks: Vec<JoinHandle<()>>,
}

impl StreamRun {
    /// Wait for both stages to finish, aborting them after `grace`
    async fn join(self, grace: Duration) {
        for mut task in self.tasks {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                tracing::warn!("previous stream did not drain in time, aborting it");
                task.abort();
            }
        }
    }
}

pub struct EnhancementService {
    config: EnhancementConfig,
    output_queue_size: usize,
    run: Option<StreamRun>,
}

impl EnhancementService {
    pub fn new(config: EnhancementConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            output_queue_size: 64,
            run: None,
        })
    }

    pub fn with_output_queue_size(mut self, size: usize) -> Self {
        self.output_queue_size = size.max(1);
        self
    }

    /// Start both stages on `source`; sweep outputs arrive on the receiver.
    ///
    /// The receiver closes after the source ends (or [`stop`](Self::stop)
    /// is called) and the final sweep has been flushed. A stopped previous
    /// run is drained before the new one starts.
    pub async fn start_streaming<S: SampleSource + 'static>(
        &mut self,
        mut source: S,
    ) -> Result<mpsc::Receiver<SweepOutput>> {
        if self.is_running().await {
            return Err(Error::Source("service already streaming".into()));
        }
        if let Some(previous) = self.run.take() {
            let grace = MIN_SHUTDOWN_GRACE.max(Duration::from_millis(self.config.sweep_timeout_ms) * 2);
            previous.join(grace).await;
        }

        let (tx, rx) = mpsc::channel(self.output_queue_size);
        source.start().await?;
        let is_running = Arc::new(RwLock::new(true));
        let stats = Arc::new(Mutex::new(SharedStats::default()));

        let profile = self.config.sensor_profile();
        if source.profile().model != profile.model {
            tracing::warn!(
                source = ?source.profile().model,
                configured = ?profile.model,
                "source sensor differs from configuration, using configured profile"
            );
        }

        let bins = AngleBins::new(self.config.angle_bin_width_deg);
        let bank = Arc::new(Mutex::new(AngleStateBank::new(
            bins,
            profile,
            self.config.filter.clone(),
        )));
        let queue = Arc::new(SharedSweepQueue::new(self.config.queue_depth));

        tracing::info!(
            sensor = ?profile.model,
            level = ?self.config.enhancement_level,
            "enhancement stream started"
        );

        // Stage one
        let ingest = {
            let is_running = is_running.clone();
            let stats = stats.clone();
            let bank = bank.clone();
            let queue = queue.clone();
            let timeout_ms = self.config.sweep_timeout_ms;

            tokio::spawn(async move {
                let mut assembler = SweepAssembler::new(timeout_ms, bins.count());
                let mut ticker = tokio::time::interval(
                    Duration::from_millis(timeout_ms) / TIMEOUT_CHECKS_PER_PERIOD,
                );
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // wall-clock arrival of the latest sample
                let mut last_arrival = tokio::time::Instant::now();

                loop {
                    if !*is_running.read().await {
                        break;
                    }

                    // Ready samples always win over the stall check
                    tokio::select! {
                        biased;

                        received = source.recv() => match received {
                            Ok(sample) => {
                                last_arrival = tokio::time::Instant::now();
                                let result = assembler.ingest(sample, &mut bank.lock());
                                match result {
                                    Ok(Some(sweep)) => queue.push(sweep),
                                    Ok(None) => {}
                                    Err(e) => tracing::warn!("Rejected sample: {}", e),
                                }
                                stats.lock().ingest = assembler.stats();
                            }
                            Err(Error::StreamClosed) => break,
                            Err(e) => {
                                tracing::error!("Sample source error: {}", e);
                                break;
                            }
                        },
                        _ = ticker.tick() => {
                            let stalled = last_arrival.elapsed() >= Duration::from_millis(timeout_ms);
                            if stalled && assembler.is_open() {
                                tracing::warn!(
                                    samples = assembler.open_len(),
                                    "sensor stalled, closing open sweep"
                                );
                                let closed = assembler.close(ClosureReason::Timeout, &bank.lock());
                                if let Some(sweep) = closed {
                                    queue.push(sweep);
                                }
                                stats.lock().ingest = assembler.stats();
                            }
                        }
                    }
                }

                let closed = assembler.close(ClosureReason::Teardown, &bank.lock());
                if let Some(sweep) = closed {
                    queue.push(sweep);
                }
                stats.lock().ingest = assembler.stats();
                queue.close();

                let _ = source.stop().await;
                tracing::info!("enhancement stream input finished");
            })
        };

        // Stage two
        let analysis = {
            let config = self.config.clone();
            let stats = stats.clone();
            let is_running = is_running.clone();
            let queue = queue.clone();

            tokio::spawn(async move {
                let mut processor = SweepProcessor::new(&config);

                while let Some(sweep) = queue.next().await {
                    let processed = processor.process(sweep);
                    bank.lock().record_anomalies(&processed.anomaly_flags);
                    stats.lock().processed_sweeps += 1;

                    if tx.send(processed.output).await.is_err() {
                        break; // Receiver dropped
                    }
                }

                *is_running.write().await = false;
            })
        };

        self.run = Some(StreamRun {
            is_running,
            stats,
            queue,
            tasks: vec![ingest, analysis],
        });
        Ok(rx)
    }

    /// Request teardown; the open sweep is flushed before the stream ends
    pub async fn stop(&mut self) {
        if let Some(run) = &self.run {
            *run.is_running.write().await = false;
        }
    }

    pub async fn is_running(&self) -> bool {
        match &self.run {
            Some(run) => *run.is_running.read().await,
            None => false,
        }
    }

    /// Counters of the current (or most recent) run
    pub fn stats(&self) -> PipelineStats {
        let Some(run) = &self.run else {
            return PipelineStats::default();
        };
        let stats = run.stats.lock();
        let (dropped_sweeps, dropped_samples) = run.queue.dropped();
        PipelineStats {
            accepted_samples: stats.ingest.accepted_samples,
            rejected_samples: stats.ingest.rejected_samples,
            closed_sweeps: stats.ingest.closed_sweeps,
            timed_out_sweeps: stats.ingest.timed_out_sweeps,
            processed_sweeps: stats.processed_sweeps,
            dropped_sweeps,
            dropped_samples,
        }
    }

    pub fn config(&self) -> &EnhancementConfig {
        &self.config
    }
}
