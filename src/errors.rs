// Error types for trackside

use snafu::Snafu;
use std::io;

#[derive(Debug, Snafu)]
pub enum TracksideError {
    // Errors for the sensor producer framework
    #[snafu(display("Sensor read failed: {description}"))]
    SensorReadError { description: String },
    #[snafu(display("Producer {name} did not stop within {timeout_ms}ms"))]
    ProducerJoinTimeout { name: String, timeout_ms: u64 },
    #[snafu(display("Error opening fix replay file"))]
    FixSourceError { source: io::Error },
    #[snafu(display("Error parsing fix replay line"))]
    FixDecodeError { source: serde_json::Error },

    // Errors while aggregating telemetry points
    #[snafu(display("Error broadcasting telemetry data point: {description}"))]
    TelemetryBroadcastError { description: String },
    #[snafu(display("Could not compute geohash: {description}"))]
    GeohashError { description: String },

    // Errors for the binary append log
    #[snafu(display("Error writing telemetry log"))]
    LogWriteError { source: io::Error },
    #[snafu(display("Error reading telemetry log"))]
    LogReadError { source: io::Error },
    #[snafu(display("Log filename does not encode a prefix width: {path}"))]
    InvalidLogFilename { path: String },
    #[snafu(display("Error serializing telemetry point"))]
    PointEncodeError { source: serde_json::Error },

    // Errors for the export pipeline
    #[snafu(display("Export backend error: {description}"))]
    ExportBackendError { description: String },

    // Config management errors
    #[snafu(display("Error reading config file"))]
    ConfigIOError { source: io::Error },
    #[snafu(display("Error parsing config file"))]
    ConfigParseError { source: serde_json::Error },
    #[snafu(display("Unknown sensor field in config: {name}"))]
    UnknownSensorField { name: String },
}
