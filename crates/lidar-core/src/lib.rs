//! # Lidar-Core
//!
//! Core types shared by the rangefinder enhancement pipeline: raw and
//! enhanced samples, consensus decisions, sensor profiles, scan statistics
//! and the common error type.
//!
//! Distances are centimetres, angles are degrees in `[0, 360)` and
//! timestamps are nanoseconds.

pub mod error;
pub mod scan;
pub mod sensor;
pub mod types;

pub use error::{Error, Result, SampleRejection};
pub use scan::*;
pub use sensor::*;
pub use types::*;
