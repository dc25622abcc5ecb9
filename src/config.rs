// Capture configuration loaded from a JSON file

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::TracksideError;
use crate::telemetry::SensorField;
use crate::telemetry::lap::{DEFAULT_MIN_LAP_POINTS, DEFAULT_PROXIMITY_M};

fn default_commit_every() -> usize {
    100
}

fn default_proximity_m() -> f64 {
    DEFAULT_PROXIMITY_M
}

fn default_min_lap_points() -> usize {
    DEFAULT_MIN_LAP_POINTS
}

fn default_log_prefix() -> String {
    "telemetry".to_string()
}

/// One configured sensor: its producer name, polling rate and the point
/// fields it feeds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SensorEntry {
    pub name: String,
    pub hz: f64,
    pub fields: Vec<String>,
}

/// A sensor entry with its field names resolved against the known set.
#[derive(Clone, Debug)]
pub struct ResolvedSensor {
    pub name: String,
    pub hz: f64,
    pub fields: Vec<SensorField>,
}

/// Everything `trackside record` needs for a session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub car: String,
    pub track_file: PathBuf,
    pub log_dir: PathBuf,
    #[serde(default = "default_log_prefix")]
    pub log_prefix: String,
    pub database: PathBuf,
    /// Points per export transaction
    #[serde(default = "default_commit_every")]
    pub commit_every: usize,
    /// Start/finish proximity gate for crossing detection, meters
    #[serde(default = "default_proximity_m")]
    pub proximity_m: f64,
    /// Minimum points in a lap before crossings are considered
    #[serde(default = "default_min_lap_points")]
    pub min_lap_points: usize,
    #[serde(default)]
    pub sensors: Vec<SensorEntry>,
}

impl CaptureConfig {
    pub fn from_file(path: &Path) -> Result<Self, TracksideError> {
        let file = File::open(path).map_err(|e| TracksideError::ConfigIOError { source: e })?;
        let config: CaptureConfig = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| TracksideError::ConfigParseError { source: e })?;
        // resolve eagerly so a typo fails at load, not mid-session
        config.resolve_sensors()?;
        Ok(config)
    }

    /// Map every configured field name onto the known sensor fields.
    pub fn resolve_sensors(&self) -> Result<Vec<ResolvedSensor>, TracksideError> {
        self.sensors
            .iter()
            .map(|entry| {
                let fields = entry
                    .fields
                    .iter()
                    .map(|name| {
                        SensorField::from_name(name).ok_or_else(|| {
                            TracksideError::UnknownSensorField { name: name.clone() }
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ResolvedSensor {
                    name: entry.name.clone(),
                    hz: entry.hz,
                    fields,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(body.as_bytes()).expect("write");
        file
    }

    #[test]
    fn test_defaults_applied() {
        let file = write_config(
            r#"{
                "car": "gt86",
                "track_file": "tracks/mosport.json",
                "log_dir": "/var/log/trackside",
                "database": "telemetry.db"
            }"#,
        );
        let config = CaptureConfig::from_file(file.path()).expect("load");
        assert_eq!(config.commit_every, 100);
        assert_eq!(config.proximity_m, 20.0);
        assert_eq!(config.min_lap_points, 60);
        assert_eq!(config.log_prefix, "telemetry");
        assert!(config.sensors.is_empty());
    }

    #[test]
    fn test_sensor_fields_resolve() {
        let file = write_config(
            r#"{
                "car": "gt86",
                "track_file": "tracks/mosport.json",
                "log_dir": "/var/log/trackside",
                "database": "telemetry.db",
                "sensors": [
                    {"name": "imu", "hz": 100.0, "fields": ["accel_x", "accel_y", "gyro_z"]},
                    {"name": "ecu", "hz": 10.0, "fields": ["rpm", "afr"]}
                ]
            }"#,
        );
        let config = CaptureConfig::from_file(file.path()).expect("load");
        let resolved = config.resolve_sensors().expect("resolve");
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].fields.len(), 3);
        assert_eq!(resolved[1].fields, vec![SensorField::Rpm, SensorField::Afr]);
    }

    #[test]
    fn test_unknown_field_fails_load() {
        let file = write_config(
            r#"{
                "car": "gt86",
                "track_file": "tracks/mosport.json",
                "log_dir": "/var/log/trackside",
                "database": "telemetry.db",
                "sensors": [
                    {"name": "imu", "hz": 100.0, "fields": ["wing_angle"]}
                ]
            }"#,
        );
        let result = CaptureConfig::from_file(file.path());
        assert!(matches!(
            result,
            Err(TracksideError::UnknownSensorField { name }) if name == "wing_angle"
        ));
    }
}
