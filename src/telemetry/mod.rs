pub(crate) mod aggregator;
pub(crate) mod lap;
pub(crate) mod producer;

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::TracksideError;

pub use aggregator::TelemetryAggregator;
pub use lap::{Crossing, LapEngine};
pub use producer::{
    FixRead, ReplayFixSource, SensorCell, SensorProducer, SensorRead, SyntheticSensor,
};

/// A latitude/longitude pair in decimal degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

/// A named waypoint on a track, usually a turn apex.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Turn {
    pub name: String,
    pub coordinate: Coordinate,
}

/// Read-only track reference data. The core never mutates a Track; a
/// Session copies the start/finish coordinate out of it exactly once.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Track {
    pub name: String,
    pub start_finish: Coordinate,
    #[serde(default)]
    pub turns: Vec<Turn>,
}

impl Track {
    /// Load a track definition from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, TracksideError> {
        let file = File::open(path).map_err(|e| TracksideError::ConfigIOError { source: e })?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| TracksideError::ConfigParseError { source: e })
    }
}

/// One raw position report from the positioning sensor, before validation.
/// The device may omit fields on a bad fix; the aggregator drops reports
/// that miss any required field.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Fix {
    pub timestamp_ns: Option<u64>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt: Option<f64>,
    pub speed: Option<f64>,
}

impl Fix {
    /// The fields a fix must carry to become a point. Returns
    /// `(timestamp_ns, lat, lon, speed)` or None if any is missing or the
    /// coordinate is outside the valid range.
    pub fn required(&self) -> Option<(u64, f64, f64, f64)> {
        let ts = self.timestamp_ns?;
        let lat = self.lat?;
        let lon = self.lon?;
        let speed = self.speed?;
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return None;
        }
        Some((ts, lat, lon, speed))
    }
}

/// Every sensor-specific scalar a point can carry. Sensor configuration
/// entries name these fields as strings; the mapping is resolved against
/// this enum once at configuration load, so a typo fails at startup
/// instead of at runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorField {
    AccelX,
    AccelY,
    AccelZ,
    Pitch,
    Roll,
    GyroX,
    GyroY,
    GyroZ,
    TireTempLfInner,
    TireTempLfMiddle,
    TireTempLfOuter,
    TireTempRfInner,
    TireTempRfMiddle,
    TireTempRfOuter,
    TireTempLrInner,
    TireTempLrMiddle,
    TireTempLrOuter,
    TireTempRrInner,
    TireTempRrMiddle,
    TireTempRrOuter,
    Analog1,
    Analog2,
    Analog3,
    Analog4,
    Rpm,
    Afr,
    BatteryV,
}

impl SensorField {
    /// Every field, in the column order used by the relational schema.
    pub const ALL: [SensorField; 27] = [
        SensorField::AccelX,
        SensorField::AccelY,
        SensorField::AccelZ,
        SensorField::Pitch,
        SensorField::Roll,
        SensorField::GyroX,
        SensorField::GyroY,
        SensorField::GyroZ,
        SensorField::TireTempLfInner,
        SensorField::TireTempLfMiddle,
        SensorField::TireTempLfOuter,
        SensorField::TireTempRfInner,
        SensorField::TireTempRfMiddle,
        SensorField::TireTempRfOuter,
        SensorField::TireTempLrInner,
        SensorField::TireTempLrMiddle,
        SensorField::TireTempLrOuter,
        SensorField::TireTempRrInner,
        SensorField::TireTempRrMiddle,
        SensorField::TireTempRrOuter,
        SensorField::Analog1,
        SensorField::Analog2,
        SensorField::Analog3,
        SensorField::Analog4,
        SensorField::Rpm,
        SensorField::Afr,
        SensorField::BatteryV,
    ];

    /// Snake-case name used both in configuration files and as the column
    /// name in the points table.
    pub fn name(self) -> &'static str {
        match self {
            SensorField::AccelX => "accel_x",
            SensorField::AccelY => "accel_y",
            SensorField::AccelZ => "accel_z",
            SensorField::Pitch => "pitch",
            SensorField::Roll => "roll",
            SensorField::GyroX => "gyro_x",
            SensorField::GyroY => "gyro_y",
            SensorField::GyroZ => "gyro_z",
            SensorField::TireTempLfInner => "tire_temp_lf_inner",
            SensorField::TireTempLfMiddle => "tire_temp_lf_middle",
            SensorField::TireTempLfOuter => "tire_temp_lf_outer",
            SensorField::TireTempRfInner => "tire_temp_rf_inner",
            SensorField::TireTempRfMiddle => "tire_temp_rf_middle",
            SensorField::TireTempRfOuter => "tire_temp_rf_outer",
            SensorField::TireTempLrInner => "tire_temp_lr_inner",
            SensorField::TireTempLrMiddle => "tire_temp_lr_middle",
            SensorField::TireTempLrOuter => "tire_temp_lr_outer",
            SensorField::TireTempRrInner => "tire_temp_rr_inner",
            SensorField::TireTempRrMiddle => "tire_temp_rr_middle",
            SensorField::TireTempRrOuter => "tire_temp_rr_outer",
            SensorField::Analog1 => "analog_1",
            SensorField::Analog2 => "analog_2",
            SensorField::Analog3 => "analog_3",
            SensorField::Analog4 => "analog_4",
            SensorField::Rpm => "rpm",
            SensorField::Afr => "afr",
            SensorField::BatteryV => "battery_v",
        }
    }

    /// Resolve a configuration field name, None for unknown names.
    pub fn from_name(name: &str) -> Option<SensorField> {
        SensorField::ALL.iter().copied().find(|f| f.name() == name)
    }

    /// Write a value into the matching point field.
    pub fn apply(self, point: &mut Point, value: f64) {
        *self.slot(point) = value;
    }

    /// Read the matching value out of a point.
    pub fn read(self, point: &Point) -> f64 {
        *self.slot_ref(point)
    }

    fn slot(self, point: &mut Point) -> &mut f64 {
        match self {
            SensorField::AccelX => &mut point.accel_x,
            SensorField::AccelY => &mut point.accel_y,
            SensorField::AccelZ => &mut point.accel_z,
            SensorField::Pitch => &mut point.pitch,
            SensorField::Roll => &mut point.roll,
            SensorField::GyroX => &mut point.gyro_x,
            SensorField::GyroY => &mut point.gyro_y,
            SensorField::GyroZ => &mut point.gyro_z,
            SensorField::TireTempLfInner => &mut point.tire_temp_lf_inner,
            SensorField::TireTempLfMiddle => &mut point.tire_temp_lf_middle,
            SensorField::TireTempLfOuter => &mut point.tire_temp_lf_outer,
            SensorField::TireTempRfInner => &mut point.tire_temp_rf_inner,
            SensorField::TireTempRfMiddle => &mut point.tire_temp_rf_middle,
            SensorField::TireTempRfOuter => &mut point.tire_temp_rf_outer,
            SensorField::TireTempLrInner => &mut point.tire_temp_lr_inner,
            SensorField::TireTempLrMiddle => &mut point.tire_temp_lr_middle,
            SensorField::TireTempLrOuter => &mut point.tire_temp_lr_outer,
            SensorField::TireTempRrInner => &mut point.tire_temp_rr_inner,
            SensorField::TireTempRrMiddle => &mut point.tire_temp_rr_middle,
            SensorField::TireTempRrOuter => &mut point.tire_temp_rr_outer,
            SensorField::Analog1 => &mut point.analog_1,
            SensorField::Analog2 => &mut point.analog_2,
            SensorField::Analog3 => &mut point.analog_3,
            SensorField::Analog4 => &mut point.analog_4,
            SensorField::Rpm => &mut point.rpm,
            SensorField::Afr => &mut point.afr,
            SensorField::BatteryV => &mut point.battery_v,
        }
    }

    fn slot_ref(self, point: &Point) -> &f64 {
        match self {
            SensorField::AccelX => &point.accel_x,
            SensorField::AccelY => &point.accel_y,
            SensorField::AccelZ => &point.accel_z,
            SensorField::Pitch => &point.pitch,
            SensorField::Roll => &point.roll,
            SensorField::GyroX => &point.gyro_x,
            SensorField::GyroY => &point.gyro_y,
            SensorField::GyroZ => &point.gyro_z,
            SensorField::TireTempLfInner => &point.tire_temp_lf_inner,
            SensorField::TireTempLfMiddle => &point.tire_temp_lf_middle,
            SensorField::TireTempLfOuter => &point.tire_temp_lf_outer,
            SensorField::TireTempRfInner => &point.tire_temp_rf_inner,
            SensorField::TireTempRfMiddle => &point.tire_temp_rf_middle,
            SensorField::TireTempRfOuter => &point.tire_temp_rf_outer,
            SensorField::TireTempLrInner => &point.tire_temp_lr_inner,
            SensorField::TireTempLrMiddle => &point.tire_temp_lr_middle,
            SensorField::TireTempLrOuter => &point.tire_temp_lr_outer,
            SensorField::TireTempRrInner => &point.tire_temp_rr_inner,
            SensorField::TireTempRrMiddle => &point.tire_temp_rr_middle,
            SensorField::TireTempRrOuter => &point.tire_temp_rr_outer,
            SensorField::Analog1 => &point.analog_1,
            SensorField::Analog2 => &point.analog_2,
            SensorField::Analog3 => &point.analog_3,
            SensorField::Analog4 => &point.analog_4,
            SensorField::Rpm => &point.rpm,
            SensorField::Afr => &point.afr,
            SensorField::BatteryV => &point.battery_v,
        }
    }
}

/// One sensor value published by a producer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Reading {
    pub field: SensorField,
    pub value: f64,
}

/// One validated, fully merged telemetry record for one instant.
///
/// A point is assembled by the aggregator from an accepted position fix
/// plus the latest snapshot of every other configured sensor. The derived
/// fields at the bottom are populated exactly once, by the aggregator and
/// lap engine; no producer ever writes them. After a point is handed to
/// the log and the export queues it is never mutated again.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Point {
    /// Fix timestamp, nanoseconds since the Unix epoch
    pub timestamp_ns: u64,
    /// Latitude in decimal degrees
    pub lat: f64,
    /// Longitude in decimal degrees
    pub lon: f64,
    /// Altitude above sea level, meters
    pub alt: f64,
    /// Ground speed, m/s
    pub speed: f64,
    /// Geospatial hash of (lat, lon)
    pub geohash: String,

    /// Longitudinal acceleration, m/s^2
    pub accel_x: f64,
    /// Lateral acceleration, m/s^2
    pub accel_y: f64,
    /// Vertical acceleration, m/s^2
    pub accel_z: f64,
    /// Pitch orientation (rad)
    pub pitch: f64,
    /// Roll orientation (rad)
    pub roll: f64,
    /// Rotation rates (rad/s)
    pub gyro_x: f64,
    pub gyro_y: f64,
    pub gyro_z: f64,

    /// Tire carcass temperatures, Celsius, inner/middle/outer per wheel
    pub tire_temp_lf_inner: f64,
    pub tire_temp_lf_middle: f64,
    pub tire_temp_lf_outer: f64,
    pub tire_temp_rf_inner: f64,
    pub tire_temp_rf_middle: f64,
    pub tire_temp_rf_outer: f64,
    pub tire_temp_lr_inner: f64,
    pub tire_temp_lr_middle: f64,
    pub tire_temp_lr_outer: f64,
    pub tire_temp_rr_inner: f64,
    pub tire_temp_rr_middle: f64,
    pub tire_temp_rr_outer: f64,

    /// Raw analog channel voltages
    pub analog_1: f64,
    pub analog_2: f64,
    pub analog_3: f64,
    pub analog_4: f64,
    /// Engine RPM
    pub rpm: f64,
    /// Air/fuel ratio
    pub afr: f64,
    /// Battery voltage
    pub battery_v: f64,

    /// Great-circle distance to the session's start/finish reference, meters
    pub track_distance_m: f64,
    /// Meters traveled since the start of the current lap
    pub lap_distance_m: f64,
    /// Time elapsed since the start of the current lap, nanoseconds
    pub lap_duration_ns: u64,
}

impl Default for Point {
    fn default() -> Self {
        Self {
            timestamp_ns: 0,
            lat: 0.,
            lon: 0.,
            alt: 0.,
            speed: 0.,
            geohash: String::new(),
            accel_x: 0.,
            accel_y: 0.,
            accel_z: 0.,
            pitch: 0.,
            roll: 0.,
            gyro_x: 0.,
            gyro_y: 0.,
            gyro_z: 0.,
            tire_temp_lf_inner: 0.,
            tire_temp_lf_middle: 0.,
            tire_temp_lf_outer: 0.,
            tire_temp_rf_inner: 0.,
            tire_temp_rf_middle: 0.,
            tire_temp_rf_outer: 0.,
            tire_temp_lr_inner: 0.,
            tire_temp_lr_middle: 0.,
            tire_temp_lr_outer: 0.,
            tire_temp_rr_inner: 0.,
            tire_temp_rr_middle: 0.,
            tire_temp_rr_outer: 0.,
            analog_1: 0.,
            analog_2: 0.,
            analog_3: 0.,
            analog_4: 0.,
            rpm: 0.,
            afr: 0.,
            battery_v: 0.,
            track_distance_m: 0.,
            lap_distance_m: 0.,
            lap_duration_ns: 0,
        }
    }
}

/// An ordered run of points around the circuit. The duration stays None
/// until the next crossing seals the lap.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Lap {
    /// 1-based sequence number, unique within a session
    pub number: u32,
    pub points: Vec<Point>,
    pub duration_ns: Option<u64>,
}

impl Lap {
    pub fn new(number: u32) -> Self {
        Self {
            number,
            points: Vec::new(),
            duration_ns: None,
        }
    }

    /// Timestamp of the lap's first point.
    pub fn start_ns(&self) -> Option<u64> {
        self.points.first().map(|p| p.timestamp_ns)
    }

    /// Walk backward from the tail until the timestamp differs from
    /// `timestamp_ns`. This is the "most recent distinct-timestamp point"
    /// used by all crossing geometry; skipping equal timestamps guards the
    /// angle math against zero-length legs.
    pub fn last_distinct(&self, timestamp_ns: u64) -> Option<&Point> {
        self.points
            .iter()
            .rev()
            .find(|p| p.timestamp_ns != timestamp_ns)
    }
}

/// One continuous data-capture run: a bound track, its start/finish
/// reference and the laps accumulated so far.
///
/// The track name and start/finish coordinate are copied from the Track on
/// the first accepted fix and never re-read afterwards, so a session stays
/// pinned to one finish line even if the reference data changes under it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub start_ns: u64,
    pub track_name: String,
    pub start_finish: Option<Coordinate>,
    pub laps: Vec<Lap>,
    pub car: String,
    pub live: bool,
}

impl Session {
    pub fn new(car: &str, live: bool) -> Self {
        Self {
            start_ns: 0,
            track_name: String::new(),
            start_finish: None,
            laps: Vec::new(),
            car: car.to_string(),
            live,
        }
    }

    /// Whether the first valid point has bound this session to a track.
    pub fn bound(&self) -> bool {
        self.start_finish.is_some()
    }

    /// Bind the session to its track and open lap 1. Called exactly once,
    /// on the first accepted fix.
    pub fn bind(&mut self, track: &Track, timestamp_ns: u64) {
        self.start_ns = timestamp_ns;
        self.track_name = track.name.clone();
        self.start_finish = Some(track.start_finish);
        self.laps.push(Lap::new(1));
    }

    pub fn current_lap(&self) -> Option<&Lap> {
        self.laps.last()
    }

    pub fn current_lap_mut(&mut self) -> Option<&mut Lap> {
        self.laps.last_mut()
    }
}
