//! Ingestion adapters turning recorded scan files into samples.
//!
//! Every adapter describes itself with a fixed [`AdapterCapabilities`]
//! record; the [`AdapterRegistry`] picks one by file extension first and
//! by content signature second.

use std::path::Path;

use serde::Deserialize;

use lidar_core::{Error, Result, Sample, SensorId, Timestamp};

/// Static description of what an adapter can read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterCapabilities {
    pub name: &'static str,
    /// Lowercase file extensions without the dot
    pub extensions: &'static [&'static str],
    /// Leading non-whitespace bytes identifying the format
    pub signatures: &'static [&'static [u8]],
}

impl AdapterCapabilities {
    pub fn matches_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .map_or(false, |e| self.extensions.contains(&e.as_str()))
    }

    pub fn matches_signature(&self, head: &[u8]) -> bool {
        let start = head
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(head.len());
        let head = &head[start..];
        self.signatures.iter().any(|sig| head.starts_with(sig))
    }
}

pub trait ScanAdapter: Send + Sync {
    fn capabilities(&self) -> &AdapterCapabilities;

    /// Decode a complete file into normalized samples
    fn decode(&self, bytes: &[u8], sensor_id: SensorId) -> Result<Vec<Sample>>;
}

/// Unit of distances in the source file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceUnit {
    #[default]
    Meters,
    Centimeters,
    Millimeters,
}

impl DistanceUnit {
    fn to_centimeters(self, value: f64) -> f64 {
        match self {
            DistanceUnit::Meters => value * 100.0,
            DistanceUnit::Centimeters => value,
            DistanceUnit::Millimeters => value / 10.0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ScanRecord {
    #[serde(default)]
    angles: Vec<f64>,
    #[serde(default)]
    distances: Vec<f64>,
    /// Unix seconds
    timestamp: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ScanDocument {
    Many(Vec<ScanRecord>),
    One(ScanRecord),
}

const JSON_CAPABILITIES: AdapterCapabilities = AdapterCapabilities {
    name: "json-scan",
    extensions: &["json"],
    signatures: &[b"{", b"["],
};

/// Scan records of the form `{"angles": [...], "distances": [...], "timestamp": t}`,
/// either one object or an array of them. Angles are degrees.
#[derive(Debug, Clone, Default)]
pub struct JsonScanAdapter {
    unit: DistanceUnit,
    /// Spread the samples of one record over this period
    scan_period_ms: Option<u64>,
}

impl JsonScanAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unit(mut self, unit: DistanceUnit) -> Self {
        self.unit = unit;
        self
    }

    pub fn with_scan_period_ms(mut self, period_ms: u64) -> Self {
        self.scan_period_ms = Some(period_ms);
        self
    }
}

impl ScanAdapter for JsonScanAdapter {
    fn capabilities(&self) -> &AdapterCapabilities {
        &JSON_CAPABILITIES
    }

    fn decode(&self, bytes: &[u8], sensor_id: SensorId) -> Result<Vec<Sample>> {
        let records = match serde_json::from_slice::<ScanDocument>(bytes)? {
            ScanDocument::Many(records) => records,
            ScanDocument::One(record) => vec![record],
        };

        let mut samples = Vec::new();
        for record in records {
            if record.angles.len() != record.distances.len() {
                tracing::warn!(
                    angles = record.angles.len(),
                    distances = record.distances.len(),
                    "scan record has mismatched lengths, truncating"
                );
            }

            let start = record
                .timestamp
                .map_or_else(Timestamp::now, Timestamp::from_secs_f64);
            let count = record.angles.len().min(record.distances.len());
            let step_ns = self
                .scan_period_ms
                .filter(|_| count > 0)
                .map_or(0, |p| p as i64 * 1_000_000 / count as i64);

            samples.extend(
                record
                    .angles
                    .iter()
                    .zip(&record.distances)
                    .enumerate()
                    .map(|(i, (angle, distance))| Sample {
                        timestamp: Timestamp(start.as_nanos() + step_ns * i as i64),
                        angle: angle.rem_euclid(360.0),
                        raw_distance: self.unit.to_centimeters(*distance),
                        sensor_id,
                    }),
            );
        }
        Ok(samples)
    }
}

/// Ordered set of adapters
pub struct AdapterRegistry {
    adapters: Vec<Box<dyn ScanAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: Vec::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(JsonScanAdapter::new()));
        registry
    }

    pub fn register(&mut self, adapter: Box<dyn ScanAdapter>) {
        self.adapters.push(adapter);
    }

    pub fn capabilities(&self) -> impl Iterator<Item = &AdapterCapabilities> {
        self.adapters.iter().map(|a| a.capabilities())
    }

    /// Adapter for a file, by extension and then by its first bytes
    pub fn detect(&self, path: &Path, head: &[u8]) -> Option<&dyn ScanAdapter> {
        self.adapters
            .iter()
            .find(|a| a.capabilities().matches_extension(path))
            .or_else(|| {
                self.adapters
                    .iter()
                    .find(|a| a.capabilities().matches_signature(head))
            })
            .map(|a| a.as_ref())
    }

    /// Read and decode a file with the matching adapter
    pub fn load(&self, path: &Path, sensor_id: SensorId) -> Result<Vec<Sample>> {
        let bytes = std::fs::read(path).map_err(|e| Error::Source(e.to_string()))?;
        let head = &bytes[..bytes.len().min(64)];
        let adapter = self
            .detect(path, head)
            .ok_or_else(|| Error::UnsupportedFormat(path.display().to_string()))?;
        adapter.decode(&bytes, sensor_id)
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_detect_by_extension_then_signature() {
        let registry = AdapterRegistry::with_defaults();
        let by_ext = registry.detect(&PathBuf::from("scan.JSON"), b"");
        assert_eq!(by_ext.unwrap().capabilities().name, "json-scan");

        let by_sig = registry.detect(&PathBuf::from("scan.log"), b"  \n{\"angles\": []}");
        assert!(by_sig.is_some());

        assert!(registry.detect(&PathBuf::from("scan.db3"), b"SQLite format 3").is_none());
        assert_eq!(registry.capabilities().count(), 1);
    }

    #[test]
    fn test_decode_records() {
        let json = br#"[
            {"angles": [0.0, 90.0, 370.0], "distances": [1.0, 2.5, 0.5], "timestamp": 10.0},
            {"angles": [-10.0], "distances": [3.0], "timestamp": 10.1}
        ]"#;
        let samples = JsonScanAdapter::new().decode(json, SensorId(3)).unwrap();

        assert_eq!(samples.len(), 4);
        assert_eq!(samples[0].raw_distance, 100.0);
        assert_eq!(samples[1].raw_distance, 250.0);
        assert!((samples[2].angle - 10.0).abs() < 1e-9);
        assert!((samples[3].angle - 350.0).abs() < 1e-9);
        assert_eq!(samples[0].timestamp, Timestamp::from_secs_f64(10.0));
        assert_eq!(samples[3].sensor_id, SensorId(3));
        assert!(samples.iter().all(|s| s.validate().is_ok()));
    }

    #[test]
    fn test_single_record_and_spread() {
        let json = br#"{"angles": [0, 1, 2, 3], "distances": [10, 20, 30, 40], "timestamp": 1.0}"#;
        let samples = JsonScanAdapter::new()
            .with_unit(DistanceUnit::Centimeters)
            .with_scan_period_ms(100)
            .decode(json, SensorId::default())
            .unwrap();

        assert_eq!(samples.len(), 4);
        assert_eq!(samples[3].raw_distance, 40.0);
        assert_eq!(
            samples[1].timestamp.as_nanos() - samples[0].timestamp.as_nanos(),
            25_000_000
        );
    }

    #[test]
    fn test_malformed_json() {
        let err = JsonScanAdapter::new()
            .decode(b"{not json", SensorId::default())
            .unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_load_unsupported() {
        let path = std::env::temp_dir().join("lidar_enhance_adapter_test.bin");
        std::fs::write(&path, [0u8, 1, 2, 3]).unwrap();
        let err = AdapterRegistry::with_defaults()
            .load(&path, SensorId::default())
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
        let _ = std::fs::remove_file(path);
    }
}
