// Library interface for trackside

pub mod config;
pub mod errors;
pub mod export;
pub mod geo;
pub mod logfile;
pub mod telemetry;

pub use errors::TracksideError;
pub use telemetry::{Fix, Lap, Point, Session, Track};
