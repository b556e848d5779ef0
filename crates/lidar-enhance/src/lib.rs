//! # Lidar-Enhance
//!
//! Real-time enhancement of single-plane rotating rangefinder streams.
//!
//! Every raw `(timestamp, angle, distance)` sample is replaced by an
//! enhanced distance with a confidence, a quality score and a consensus
//! decision. Output preserves the input order and count.
//!
//! ## Pipeline Stages
//!
//! 1. **Ingestion**: Validate samples, decode recorded scans ([`adapter`])
//! 2. **State update**: Per-angle constant-velocity Kalman filters ([`state_bank`])
//! 3. **Sweep assembly**: Close sweeps on rotation or timeout ([`sweep`])
//! 4. **Sweep analysis**: Isolation-forest scoring and angular DBSCAN
//!    ([`anomaly`], [`clustering`])
//! 5. **Scoring**: Weighted confidence from history and detectors ([`confidence`])
//! 6. **Consensus**: Accept, correct or flag each sample ([`consensus`])
//!
//! [`EnhancementPipeline`] runs all stages synchronously;
//! [`EnhancementService`] runs stages 1-3 and 4-6 as two tokio tasks.

pub mod adapter;
pub mod anomaly;
pub mod clustering;
pub mod confidence;
pub mod config;
pub mod consensus;
pub mod export;
pub mod history;
pub mod pipeline;
pub mod processor;
pub mod source;
pub mod state_bank;
pub mod stream;
pub mod summary;
pub mod sweep;

pub use adapter::*;
pub use anomaly::*;
pub use clustering::*;
pub use confidence::*;
pub use self::config::*;
pub use consensus::*;
pub use export::*;
pub use history::*;
pub use pipeline::*;
pub use processor::*;
pub use source::*;
pub use state_bank::*;
pub use stream::*;
pub use summary::*;
pub use sweep::*;
