//! Pipeline configuration.

use serde::{Deserialize, Serialize};

use lidar_core::{Error, Result, SensorModel, SensorProfile};

use crate::anomaly::DetectorConfig;
use crate::clustering::ClusterTuning;
use crate::confidence::ConfidenceWeights;
use crate::consensus::ConsensusThresholds;
use crate::state_bank::FilterConfig;

const ENV_PREFIX: &str = "LIDAR";

/// Longest sweep timeout whose nanosecond span fits a [`lidar_core::Timestamp`]
pub const MAX_SWEEP_TIMEOUT_MS: u64 = (i64::MAX / 1_000_000) as u64;

/// Which stages run per sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnhancementLevel {
    /// State estimation and consensus only
    Basic,
    /// Adds isolation-forest anomaly scoring
    Standard,
    /// Adds spatial clustering and the spatial confidence factor
    #[default]
    Full,
}

impl EnhancementLevel {
    pub fn runs_anomaly_detection(&self) -> bool {
        !matches!(self, EnhancementLevel::Basic)
    }

    pub fn runs_clustering(&self) -> bool {
        matches!(self, EnhancementLevel::Full)
    }
}

/// Complete pipeline configuration, resolved once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnhancementConfig {
    pub enhancement_level: EnhancementLevel,

    /// Minimum confidence for a raw reading to be accepted
    pub confidence_threshold: f64,

    /// Maximum lifetime of an open sweep
    pub sweep_timeout_ms: u64,

    /// Expected share of anomalous samples per sweep
    pub contamination_rate: f64,

    /// Core-point size including the point itself
    pub cluster_min_samples: usize,

    /// Distance eps as a multiple of the sweep's distance spread
    pub cluster_eps_factor: f64,

    pub sensor: SensorModel,
    pub angle_bin_width_deg: f64,

    /// Entries remembered per angle bin
    pub history_window: usize,

    /// Closed sweeps waiting for processing before the oldest is dropped
    pub queue_depth: usize,

    /// Confidence discount for bins missing from a timed-out sweep
    pub missing_bin_penalty: f64,

    pub filter: FilterConfig,
    pub anomaly: DetectorConfig,
    pub clustering: ClusterTuning,
    pub weights: ConfidenceWeights,
    pub consensus: ConsensusThresholds,
}

impl Default for EnhancementConfig {
    fn default() -> Self {
        Self {
            enhancement_level: EnhancementLevel::Full,
            confidence_threshold: 0.7,
            sweep_timeout_ms: 500,
            contamination_rate: 0.1,
            cluster_min_samples: 3,
            cluster_eps_factor: 0.3,
            sensor: SensorModel::Ld06,
            angle_bin_width_deg: 1.0,
            history_window: 20,
            queue_depth: 4,
            missing_bin_penalty: 0.5,
            filter: FilterConfig::default(),
            anomaly: DetectorConfig::default(),
            clustering: ClusterTuning::default(),
            weights: ConfidenceWeights::default(),
            consensus: ConsensusThresholds::default(),
        }
    }
}

impl EnhancementConfig {
    /// Load configuration from file, with `LIDAR_*` environment overrides
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(Self::environment())
            .build()
            .map_err(config_error)?;

        let config: Self = settings.try_deserialize().map_err(config_error)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(Self::environment())
            .build()
            .map_err(config_error)?;

        let config: Self = settings.try_deserialize().map_err(config_error)?;
        config.validate()?;
        Ok(config)
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    pub fn sensor_profile(&self) -> SensorProfile {
        self.sensor.profile()
    }

    pub fn validate(&self) -> Result<()> {
        let unit = 0.0..=1.0;
        if !unit.contains(&self.confidence_threshold) {
            return Err(Error::Config(format!(
                "confidence_threshold {} outside [0, 1]",
                self.confidence_threshold
            )));
        }
        if self.consensus.flag_confidence > self.confidence_threshold {
            return Err(Error::Config(format!(
                "consensus.flag_confidence {} exceeds confidence_threshold {}",
                self.consensus.flag_confidence, self.confidence_threshold
            )));
        }
        // A capped warm-up sample must stay below both bands
        if !(self.consensus.warm_up_cap >= 0.0
            && self.consensus.warm_up_cap < self.consensus.flag_confidence)
        {
            return Err(Error::Config(format!(
                "consensus.warm_up_cap {} must be below consensus.flag_confidence {}",
                self.consensus.warm_up_cap, self.consensus.flag_confidence
            )));
        }
        if !(0.0..=0.5).contains(&self.contamination_rate) {
            return Err(Error::Config(format!(
                "contamination_rate {} outside [0, 0.5]",
                self.contamination_rate
            )));
        }
        if !(1..=MAX_SWEEP_TIMEOUT_MS).contains(&self.sweep_timeout_ms) {
            return Err(Error::Config(format!(
                "sweep_timeout_ms {} outside [1, {}]",
                self.sweep_timeout_ms, MAX_SWEEP_TIMEOUT_MS
            )));
        }
        if self.cluster_min_samples == 0 {
            return Err(Error::Config("cluster_min_samples must be at least 1".into()));
        }
        if !(self.cluster_eps_factor.is_finite() && self.cluster_eps_factor > 0.0) {
            return Err(Error::Config("cluster_eps_factor must be positive".into()));
        }
        if !(self.angle_bin_width_deg > 0.0 && self.angle_bin_width_deg <= 360.0) {
            return Err(Error::Config(format!(
                "angle_bin_width_deg {} outside (0, 360]",
                self.angle_bin_width_deg
            )));
        }
        if self.history_window == 0 || self.queue_depth == 0 {
            return Err(Error::Config("history_window and queue_depth must be positive".into()));
        }
        if !unit.contains(&self.missing_bin_penalty) {
            return Err(Error::Config("missing_bin_penalty outside [0, 1]".into()));
        }
        if !(self.filter.process_noise >= 0.0 && self.filter.gate_sigma > 0.0) {
            return Err(Error::Config("filter noise and gate must be positive".into()));
        }
        if !self.weights.is_valid() {
            return Err(Error::Config("confidence weights must be non-negative".into()));
        }
        Ok(())
    }
}

fn config_error(e: config::ConfigError) -> Error {
    Error::Config(e.to_string())
}
