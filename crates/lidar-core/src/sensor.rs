//! Published characteristics of supported rangefinders.

use serde::{Deserialize, Serialize};

/// Supported sensor models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorModel {
    /// LDROBOT LD06 (DTOF, 0.1° resolution)
    #[default]
    Ld06,
    /// Slamtec RPLIDAR A1 (triangulation, 1° resolution)
    RplidarA1,
}

impl SensorModel {
    pub fn profile(&self) -> SensorProfile {
        match self {
            SensorModel::Ld06 => SensorProfile {
                model: *self,
                fov_deg: 360.0,
                angular_resolution_deg: 0.1,
                min_range_cm: 10.0,
                max_range_cm: 1200.0,
                accuracy_abs_cm: 1.0,
                accuracy_rel: 0.005,
            },
            SensorModel::RplidarA1 => SensorProfile {
                model: *self,
                fov_deg: 360.0,
                angular_resolution_deg: 1.0,
                min_range_cm: 15.0,
                max_range_cm: 1200.0,
                accuracy_abs_cm: 1.0,
                accuracy_rel: 0.01,
            },
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "ld06" => Some(SensorModel::Ld06),
            "rplidar_a1" | "rplidar-a1" | "a1" => Some(SensorModel::RplidarA1),
            _ => None,
        }
    }
}

/// Static sensor description used for noise models and range checks
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorProfile {
    pub model: SensorModel,
    pub fov_deg: f64,
    pub angular_resolution_deg: f64,
    pub min_range_cm: f64,
    pub max_range_cm: f64,
    /// Absolute accuracy floor
    pub accuracy_abs_cm: f64,
    /// Accuracy as a fraction of range
    pub accuracy_rel: f64,
}

impl Default for SensorProfile {
    fn default() -> Self {
        SensorModel::default().profile()
    }
}

impl SensorProfile {
    /// One-sigma measurement error at `distance`
    pub fn accuracy_at(&self, distance: f64) -> f64 {
        self.accuracy_abs_cm.max(self.accuracy_rel * distance.abs())
    }

    /// Measurement noise variance at `distance`
    pub fn noise_variance(&self, distance: f64) -> f64 {
        self.accuracy_at(distance).powi(2)
    }

    pub fn in_range(&self, distance: f64) -> bool {
        distance >= self.min_range_cm && distance <= self.max_range_cm
    }

    /// Number of distinct bearings per revolution
    pub fn points_per_revolution(&self) -> usize {
        (self.fov_deg / self.angular_resolution_deg).round() as usize
    }
}
