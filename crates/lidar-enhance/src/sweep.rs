//! Sweep assembly and the bounded hand-off queue.
//!
//! Stage one validates samples, runs the per-bin state update and buffers
//! the result until the sweep closes. Closed sweeps are handed to stage two
//! through a bounded queue that drops the oldest sweep on overflow.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use lidar_core::{Result, Sample, Timestamp};

use crate::state_bank::{AngleStateBank, MissingBin, StateUpdate};

/// A wrap of more than this many degrees marks a new revolution
const ROTATION_WRAP_DEG: f64 = 180.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosureReason {
    /// The bearing wrapped back to the start of a revolution
    Rotation,
    /// The sweep outlived the configured timeout
    Timeout,
    /// The stream ended
    Teardown,
}

impl ClosureReason {
    /// Bins that did not report are filled on every closure but rotation
    pub fn fills_missing_bins(&self) -> bool {
        !matches!(self, ClosureReason::Rotation)
    }
}

/// A sample together with its state update
#[derive(Debug, Clone, Copy)]
pub struct SweepEntry {
    pub sample: Sample,
    pub update: StateUpdate,
}

#[derive(Debug, Clone)]
pub struct ClosedSweep {
    pub id: u64,
    pub entries: Vec<SweepEntry>,
    /// Bins with state that did not report; empty on rotation closure
    pub missing: Vec<MissingBin>,
    pub reason: ClosureReason,
    pub opened_at: Timestamp,
    pub closed_at: Timestamp,
}

/// Ingestion counters kept by stage one
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStats {
    pub accepted_samples: u64,
    pub rejected_samples: u64,
    pub closed_sweeps: u64,
    pub timed_out_sweeps: u64,
}

struct OpenSweep {
    entries: Vec<SweepEntry>,
    observed: Vec<bool>,
    opened_at: Timestamp,
    last_angle: f64,
}

/// Stage one: validation, state update and sweep closure
pub struct SweepAssembler {
    timeout_ms: u64,
    bin_count: usize,
    current: Option<OpenSweep>,
    next_id: u64,
    stats: IngestStats,
}

impl SweepAssembler {
    pub fn new(timeout_ms: u64, bin_count: usize) -> Self {
        Self {
            timeout_ms,
            bin_count,
            current: None,
            next_id: 0,
            stats: IngestStats::default(),
        }
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    pub fn open_len(&self) -> usize {
        self.current.as_ref().map_or(0, |s| s.entries.len())
    }

    pub fn opened_at(&self) -> Option<Timestamp> {
        self.current.as_ref().map(|s| s.opened_at)
    }

    /// Why the open sweep must close before `sample` joins it, if at all
    pub fn boundary(&self, sample: &Sample) -> Option<ClosureReason> {
        let open = self.current.as_ref()?;
        let deadline = open.opened_at.add_millis(self.timeout_ms);
        if sample.timestamp >= deadline {
            Some(ClosureReason::Timeout)
        } else if sample.angle + ROTATION_WRAP_DEG < open.last_angle {
            Some(ClosureReason::Rotation)
        } else {
            None
        }
    }

    /// Validate and apply one sample; returns the sweep it closed, if any.
    ///
    /// Invalid samples are counted and returned as errors without touching
    /// any state.
    pub fn ingest(&mut self, sample: Sample, bank: &mut AngleStateBank) -> Result<Option<ClosedSweep>> {
        if let Err(e) = sample.validate() {
            self.stats.rejected_samples += 1;
            return Err(e);
        }

        let closed = self
            .boundary(&sample)
            .and_then(|reason| self.close(reason, bank));

        let update = bank.update(&sample);
        self.push(sample, update);
        Ok(closed)
    }

    /// Apply a batch; rejected samples are logged and skipped.
    ///
    /// Runs between sweep boundaries are updated in parallel across bins.
    pub fn ingest_batch(&mut self, samples: &[Sample], bank: &mut AngleStateBank) -> Vec<ClosedSweep> {
        let mut closed = Vec::new();
        let mut run: Vec<Sample> = Vec::new();

        for sample in samples {
            if let Err(e) = sample.validate() {
                self.stats.rejected_samples += 1;
                tracing::warn!("Rejected sample: {}", e);
                continue;
            }

            let boundary = match self.current.as_ref() {
                Some(_) if !run.is_empty() => {
                    let last = run[run.len() - 1];
                    self.boundary_after(last.angle, sample)
                }
                _ => self.boundary(sample),
            };

            if let Some(reason) = boundary {
                self.flush_run(&mut run, bank);
                closed.extend(self.close(reason, bank));
            }

            if self.current.is_none() {
                self.current = Some(self.open(sample.timestamp));
            }
            run.push(*sample);
        }

        self.flush_run(&mut run, bank);
        closed
    }

    /// Close the open sweep, filling missing bins unless it completed a rotation
    pub fn close(&mut self, reason: ClosureReason, bank: &AngleStateBank) -> Option<ClosedSweep> {
        let open = self.current.take()?;
        if open.entries.is_empty() {
            return None;
        }

        let missing = if reason.fills_missing_bins() {
            bank.missing_bins(&open.observed)
        } else {
            Vec::new()
        };

        let closed_at = match reason {
            ClosureReason::Timeout => open.opened_at.add_millis(self.timeout_ms),
            _ => open
                .entries
                .last()
                .map_or(open.opened_at, |e| e.sample.timestamp),
        };

        let id = self.next_id;
        self.next_id += 1;
        self.stats.closed_sweeps += 1;
        if reason == ClosureReason::Timeout {
            self.stats.timed_out_sweeps += 1;
        }

        tracing::debug!(
            sweep = id,
            samples = open.entries.len(),
            missing = missing.len(),
            ?reason,
            "sweep closed"
        );

        Some(ClosedSweep {
            id,
            entries: open.entries,
            missing,
            reason,
            opened_at: open.opened_at,
            closed_at,
        })
    }

    /// Close the open sweep if it has outlived the timeout at `now`
    pub fn close_if_expired(&mut self, now: Timestamp, bank: &AngleStateBank) -> Option<ClosedSweep> {
        let opened_at = self.opened_at()?;
        if now >= opened_at.add_millis(self.timeout_ms) {
            self.close(ClosureReason::Timeout, bank)
        } else {
            None
        }
    }

    fn boundary_after(&self, last_angle: f64, sample: &Sample) -> Option<ClosureReason> {
        let open = self.current.as_ref()?;
        if sample.timestamp >= open.opened_at.add_millis(self.timeout_ms) {
            Some(ClosureReason::Timeout)
        } else if sample.angle + ROTATION_WRAP_DEG < last_angle {
            Some(ClosureReason::Rotation)
        } else {
            None
        }
    }

    fn open(&self, opened_at: Timestamp) -> OpenSweep {
        OpenSweep {
            entries: Vec::new(),
            observed: vec![false; self.bin_count],
            opened_at,
            last_angle: 0.0,
        }
    }

    fn push(&mut self, sample: Sample, update: StateUpdate) {
        if self.current.is_none() {
            self.current = Some(self.open(sample.timestamp));
        }
        if let Some(open) = self.current.as_mut() {
            if let Some(seen) = open.observed.get_mut(update.bin) {
                *seen = true;
            }
            open.last_angle = sample.angle;
            open.entries.push(SweepEntry { sample, update });
        }
        self.stats.accepted_samples += 1;
    }

    fn flush_run(&mut self, run: &mut Vec<Sample>, bank: &mut AngleStateBank) {
        if run.is_empty() {
            return;
        }
        let updates = bank.update_batch(run);
        for (sample, update) in run.drain(..).zip(updates) {
            self.push(sample, update);
        }
    }
}

/// Bounded FIFO of closed sweeps; overflow evicts the oldest
pub struct SweepQueue {
    depth: usize,
    sweeps: VecDeque<ClosedSweep>,
    dropped_sweeps: u64,
    dropped_samples: u64,
}

impl SweepQueue {
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            sweeps: VecDeque::with_capacity(depth),
            dropped_sweeps: 0,
            dropped_samples: 0,
        }
    }

    /// Enqueue a sweep, returning the evicted one on overflow
    pub fn push(&mut self, sweep: ClosedSweep) -> Option<ClosedSweep> {
        let evicted = if self.sweeps.len() >= self.depth {
            self.sweeps.pop_front()
        } else {
            None
        };

        if let Some(old) = &evicted {
            self.dropped_sweeps += 1;
            self.dropped_samples += old.entries.len() as u64;
            tracing::warn!(
                sweep = old.id,
                samples = old.entries.len(),
                depth = self.depth,
                "sweep queue full, dropping oldest sweep"
            );
        }

        self.sweeps.push_back(sweep);
        evicted
    }

    pub fn pop(&mut self) -> Option<ClosedSweep> {
        self.sweeps.pop_front()
    }

    pub fn len(&self) -> usize {
        self.sweeps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sweeps.is_empty()
    }

    pub fn dropped_sweeps(&self) -> u64 {
        self.dropped_sweeps
    }

    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples
    }
}

/// [`SweepQueue`] shared between the streaming tasks
pub struct SharedSweepQueue {
    queue: Mutex<SweepQueue>,
    notify: Notify,
    closed: AtomicBool,
}

impl SharedSweepQueue {
    pub fn new(depth: usize) -> Self {
        Self {
            queue: Mutex::new(SweepQueue::new(depth)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn push(&self, sweep: ClosedSweep) {
        self.queue.lock().push(sweep);
        self.notify.notify_one();
    }

    /// No further sweeps will be pushed
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Next sweep, or `None` once closed and drained
    pub async fn next(&self) -> Option<ClosedSweep> {
        loop {
            let next = self.queue.lock().pop();
            if next.is_some() {
                return next;
            }
            if self.closed.load(Ordering::Acquire) {
                return self.queue.lock().pop();
            }
            self.notify.notified().await;
        }
    }

    pub fn dropped(&self) -> (u64, u64) {
        let queue = self.queue.lock();
        (queue.dropped_sweeps(), queue.dropped_samples())
    }
}
