//! Sample sources feeding the streaming service.
//!
//! Live sensor transports live outside this crate; they hand normalized
//! samples over through [`ChannelSource`]. [`ReplaySource`] replays a
//! recorded or decoded stream.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::mpsc;

use lidar_core::{Error, Result, Sample, SensorProfile};

/// Trait for normalized sample producers
#[async_trait]
pub trait SampleSource: Send {
    /// Start producing samples
    async fn start(&mut self) -> Result<()>;

    /// Stop producing samples
    async fn stop(&mut self) -> Result<()>;

    fn is_running(&self) -> bool;

    /// Profile of the sensor behind this source
    fn profile(&self) -> &SensorProfile;

    /// Next sample; [`Error::StreamClosed`] once the stream has ended
    async fn recv(&mut self) -> Result<Sample>;

    /// Next sample if one is ready
    fn try_recv(&mut self) -> Option<Sample>;
}

/// In-memory replay of a finite sample sequence
pub struct ReplaySource {
    profile: SensorProfile,
    samples: VecDeque<Sample>,
    is_running: bool,
}

impl ReplaySource {
    pub fn new(profile: SensorProfile, samples: impl IntoIterator<Item = Sample>) -> Self {
        Self {
            profile,
            samples: samples.into_iter().collect(),
            is_running: false,
        }
    }

    pub fn remaining(&self) -> usize {
        self.samples.len()
    }
}

#[async_trait]
impl SampleSource for ReplaySource {
    async fn start(&mut self) -> Result<()> {
        self.is_running = true;
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.is_running = false;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.is_running
    }

    fn profile(&self) -> &SensorProfile {
        &self.profile
    }

    async fn recv(&mut self) -> Result<Sample> {
        if !self.is_running {
            return Err(Error::Source("replay source not started".into()));
        }
        self.samples.pop_front().ok_or(Error::StreamClosed)
    }

    fn try_recv(&mut self) -> Option<Sample> {
        if !self.is_running {
            return None;
        }
        self.samples.pop_front()
    }
}

/// Source fed by an external producer through a channel
pub struct ChannelSource {
    profile: SensorProfile,
    rx: mpsc::Receiver<Sample>,
    is_running: bool,
}

impl ChannelSource {
    /// Create the source and the sender its producer writes to
    pub fn new(profile: SensorProfile, capacity: usize) -> (mpsc::Sender<Sample>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            tx,
            Self {
                profile,
                rx,
                is_running: false,
            },
        )
    }
}

#[async_trait]
impl SampleSource for ChannelSource {
    async fn start(&mut self) -> Result<()> {
        self.is_running = true;
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.is_running = false;
        self.rx.close();
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.is_running
    }

    fn profile(&self) -> &SensorProfile {
        &self.profile
    }

    async fn recv(&mut self) -> Result<Sample> {
        if !self.is_running {
            return Err(Error::Source("channel source not started".into()));
        }
        self.rx.recv().await.ok_or(Error::StreamClosed)
    }

    fn try_recv(&mut self) -> Option<Sample> {
        self.rx.try_recv().ok()
    }
}
