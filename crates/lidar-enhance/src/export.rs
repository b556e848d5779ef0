//! CSV and JSON output schemas.

use std::io::Write;

use serde::{Deserialize, Serialize};

use lidar_core::{EnhancedSample, Error, Result};

use crate::summary::{AlgorithmPerformance, RunTotals, SweepOutput, SweepSummary};

pub const CSV_HEADER: [&str; 6] = [
    "timestamp",
    "angle",
    "raw_distance",
    "enhanced_distance",
    "confidence",
    "quality_score",
];

/// Write enhanced samples as CSV with the fixed header.
///
/// Timestamps are Unix seconds.
pub fn write_csv<W: Write>(writer: W, samples: &[EnhancedSample]) -> Result<()> {
    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(CSV_HEADER).map_err(csv_error)?;

    for s in samples {
        csv.write_record([
            format!("{:.6}", s.timestamp.as_secs_f64()),
            format!("{:.3}", s.angle),
            format!("{:.3}", s.raw_distance),
            format!("{:.3}", s.enhanced_distance),
            format!("{:.4}", s.confidence),
            format!("{:.4}", s.quality_score),
        ])
        .map_err(csv_error)?;
    }

    csv.flush()?;
    Ok(())
}

fn csv_error(e: csv::Error) -> Error {
    Error::Export(e.to_string())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnhancementSummary {
    pub original_points: usize,
    pub enhanced_points: usize,
    pub noise_reduction_percentage: f64,
    pub average_confidence: f64,
    pub processing_time_ms: f64,
}

/// JSON report of one sweep or a whole run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnhancementReport {
    pub enhancement_summary: EnhancementSummary,
    pub algorithm_performance: AlgorithmPerformance,
}

impl EnhancementReport {
    pub fn from_summary(summary: &SweepSummary) -> Self {
        Self {
            enhancement_summary: EnhancementSummary {
                original_points: summary.original_point_count,
                enhanced_points: summary.enhanced_point_count,
                noise_reduction_percentage: summary.noise_reduction_percentage,
                average_confidence: summary.average_confidence,
                processing_time_ms: summary.processing_time_ms,
            },
            algorithm_performance: summary.algorithm_performance,
        }
    }

    pub fn from_totals(totals: &RunTotals) -> Self {
        Self {
            enhancement_summary: EnhancementSummary {
                original_points: totals.original_points,
                enhanced_points: totals.enhanced_points,
                noise_reduction_percentage: totals.residuals.noise_reduction_percentage(),
                average_confidence: totals.average_confidence(),
                processing_time_ms: totals.processing_time_ms,
            },
            algorithm_performance: totals.algorithm_performance(),
        }
    }

    pub fn from_outputs(outputs: &[SweepOutput]) -> Self {
        let mut totals = RunTotals::default();
        for output in outputs {
            totals.add(&output.summary);
        }
        Self::from_totals(&totals)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_json<W: Write>(&self, writer: W) -> Result<()> {
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }
}
