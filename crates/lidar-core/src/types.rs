//! Fundamental types for the enhancement pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, SampleRejection};

/// Timestamp wrapper with nanosecond precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now().timestamp_nanos_opt().unwrap_or(0))
    }

    pub fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Self((secs * 1_000_000_000.0).round() as i64)
    }

    pub fn as_nanos(&self) -> i64 {
        self.0
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }

    /// Seconds elapsed since `earlier`; negative if `earlier` is in the future
    pub fn secs_since(&self, earlier: Timestamp) -> f64 {
        (self.0 - earlier.0) as f64 / 1_000_000_000.0
    }

    /// Saturates at the end of the representable range
    pub fn add_millis(&self, millis: u64) -> Self {
        let nanos = i64::try_from(millis)
            .unwrap_or(i64::MAX)
            .saturating_mul(1_000_000);
        Self(self.0.saturating_add(nanos))
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.0)
    }
}

/// Identifier of the physical sensor that produced a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SensorId(pub u32);

/// One raw distance/angle measurement
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: Timestamp,
    /// Bearing in degrees, `[0, 360)`
    pub angle: f64,
    /// Measured range in centimetres
    pub raw_distance: f64,
    pub sensor_id: SensorId,
}

impl Sample {
    pub fn new(timestamp: Timestamp, angle: f64, raw_distance: f64) -> Self {
        Self {
            timestamp,
            angle,
            raw_distance,
            sensor_id: SensorId::default(),
        }
    }

    pub fn with_sensor(mut self, sensor_id: SensorId) -> Self {
        self.sensor_id = sensor_id;
        self
    }

    /// Check the sample against the ingestion contract
    pub fn check(&self) -> std::result::Result<(), SampleRejection> {
        if !self.raw_distance.is_finite() {
            return Err(SampleRejection::NonFiniteDistance);
        }
        if self.raw_distance < 0.0 {
            return Err(SampleRejection::NegativeDistance);
        }
        if !(self.angle.is_finite() && (0.0..360.0).contains(&self.angle)) {
            return Err(SampleRejection::AngleOutOfRange);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.check().map_err(|reason| Error::InvalidSample {
            angle: self.angle,
            reason,
        })
    }
}

/// Final per-sample verdict of the consensus stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    /// Raw reading kept
    Accept,
    /// Reading replaced by the predicted estimate
    Correct,
    /// Low confidence; predicted estimate emitted and flagged
    Flag,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Accept => "ACCEPT",
            Decision::Correct => "CORRECT",
            Decision::Flag => "FLAG",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Annotations attached to an enhanced sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleFlags {
    /// First sample of a (re-)initialised angle bin
    pub warm_up: bool,
    pub low_confidence: bool,
    /// Score above the sweep's anomaly threshold
    pub anomalous: bool,
    /// Labelled as noise by spatial clustering
    pub spatial_outlier: bool,
    /// Measurement rejected by the estimator's innovation gate
    pub gated: bool,
    /// Synthesised for a bin that did not report before the sweep closed
    pub filled: bool,
}

/// Output record: one per accepted input sample plus any filled bins
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnhancedSample {
    pub timestamp: Timestamp,
    pub angle: f64,
    pub raw_distance: f64,
    pub enhanced_distance: f64,
    /// Combined confidence in `[0, 1]`
    pub confidence: f64,
    /// Confidence discounted by anomaly score, `[0, 1]`
    pub quality_score: f64,
    pub decision: Decision,
    pub flags: SampleFlags,
}

impl EnhancedSample {
    /// Cartesian position of the enhanced reading, same unit as distances
    pub fn to_cartesian(&self) -> (f64, f64) {
        let theta = self.angle.to_radians();
        (
            self.enhanced_distance * theta.cos(),
            self.enhanced_distance * theta.sin(),
        )
    }
}
