//! Error types for the rangefinder enhancement system.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reason a raw sample was refused at ingestion
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleRejection {
    #[error("distance is not a finite number")]
    NonFiniteDistance,

    #[error("distance is negative")]
    NegativeDistance,

    #[error("angle outside [0, 360)")]
    AngleOutOfRange,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid sample at angle {angle}: {reason}")]
    InvalidSample { angle: f64, reason: SampleRejection },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unsupported input format: {0}")]
    UnsupportedFormat(String),

    #[error("Sample stream closed")]
    StreamClosed,

    #[error("Sample source error: {0}")]
    Source(String),

    #[error("Export error: {0}")]
    Export(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Export(e.to_string())
    }
}
