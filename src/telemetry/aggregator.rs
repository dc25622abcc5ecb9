use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, info};

use crate::TracksideError;
use crate::export::{ExportQueues, LapSealed, LapStart, SessionRecord};
use crate::geo;
use crate::logfile::LogWriter;

use super::lap::LapEngine;
use super::producer::SensorCell;
use super::{Fix, Point, Session, Track};

/// Single consumer of the whole capture: position fixes drive it, sensor
/// cells are merged in, derived fields are computed, and finished points
/// flow out to the append log and the export queues.
///
/// The aggregator owns the session. Producers never see it; everything
/// they publish arrives here through a queue or a cell, so no lock is ever
/// held across a device read.
pub struct TelemetryAggregator {
    session: Session,
    track: Track,
    cells: Vec<SensorCell>,
    log: Option<LogWriter>,
    export: ExportQueues,
    engine: LapEngine,
    last_fix_ns: Option<u64>,
}

impl TelemetryAggregator {
    /// `log` is None when replaying an existing log, where writing the
    /// points back out again would duplicate the capture.
    pub fn new(
        session: Session,
        track: Track,
        cells: Vec<SensorCell>,
        log: Option<LogWriter>,
        export: ExportQueues,
        engine: LapEngine,
    ) -> Self {
        Self {
            session,
            track,
            cells,
            log,
            export,
            engine,
            last_fix_ns: None,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Consume fixes until the queue disconnects or the stop flag is set.
    pub fn run(&mut self, fixes: Receiver<Fix>, stop: &AtomicBool) -> Result<(), TracksideError> {
        loop {
            if stop.load(Ordering::Relaxed) {
                info!("aggregator stopping on request");
                return Ok(());
            }
            match fixes.recv_timeout(Duration::from_millis(200)) {
                Ok(fix) => self.process_fix(fix)?,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    info!("fix source disconnected, aggregator exiting");
                    return Ok(());
                }
            }
        }
    }

    /// Validate one raw fix and, if it qualifies, turn it into a point.
    /// Incomplete or out-of-range fixes and duplicate timestamps are
    /// dropped here; nothing downstream ever sees them.
    pub fn process_fix(&mut self, fix: Fix) -> Result<(), TracksideError> {
        let Some((timestamp_ns, lat, lon, speed)) = fix.required() else {
            debug!("dropping incomplete fix: {:?}", fix);
            return Ok(());
        };
        if self.last_fix_ns == Some(timestamp_ns) {
            debug!("dropping duplicate fix at {}", timestamp_ns);
            return Ok(());
        }
        self.last_fix_ns = Some(timestamp_ns);

        let mut point = Point {
            timestamp_ns,
            lat,
            lon,
            alt: fix.alt.unwrap_or(0.0),
            speed,
            geohash: geo::hash_coordinate(lat, lon)?,
            ..Default::default()
        };
        for cell in &self.cells {
            for reading in cell.snapshot() {
                reading.field.apply(&mut point, reading.value);
            }
        }
        self.process_point(point)
    }

    /// Run an already-assembled point through binding, derived fields, the
    /// crossing check and the output fan-out. Replay enters here directly,
    /// skipping the sensor merge its points already carry.
    pub fn process_point(&mut self, mut point: Point) -> Result<(), TracksideError> {
        if !self.session.bound() {
            self.session.bind(&self.track, point.timestamp_ns);
            info!(
                "session bound to {} at {}",
                self.session.track_name, point.timestamp_ns
            );
            self.export.session_started(SessionRecord {
                start_ns: self.session.start_ns,
                track: self.session.track_name.clone(),
                car: self.session.car.clone(),
                live: self.session.live,
            })?;
            self.export.lap_started(LapStart {
                number: 1,
                start_ns: point.timestamp_ns,
            })?;
        }
        let Some(finish) = self.session.start_finish else {
            return Ok(());
        };
        point.track_distance_m = geo::haversine_m(point.lat, point.lon, finish.lat, finish.lon);
        self.fill_lap_elapsed(&mut point);

        if let Some(crossing) = self.engine.on_point(&mut self.session, &point) {
            let sealed = self
                .session
                .laps
                .iter()
                .find(|l| l.number == crossing.sealed_number);
            self.export.lap_sealed(LapSealed {
                number: crossing.sealed_number,
                end_ns: sealed
                    .and_then(|l| l.points.last())
                    .map(|p| p.timestamp_ns)
                    .unwrap_or(crossing.boundary_ns),
                duration_ns: crossing.duration_ns,
            })?;
            self.export.lap_started(LapStart {
                number: crossing.new_number,
                start_ns: crossing.boundary_ns,
            })?;
            // the triggering point belongs to the new lap; its elapsed
            // fields restart from the boundary
            self.fill_lap_elapsed(&mut point);
        }

        let lap_number = match self.session.current_lap_mut() {
            Some(lap) => {
                lap.points.push(point.clone());
                lap.number
            }
            None => return Ok(()),
        };
        if let Some(log) = self.log.as_mut() {
            log.append_point(&point)?;
        }
        self.export.point_recorded(lap_number, point)
    }

    /// Derive lap-relative distance and duration from the tail of the
    /// current lap. Uses the most recent point whose timestamp differs so
    /// the distance delta never collapses to zero on a repeated stamp.
    fn fill_lap_elapsed(&self, point: &mut Point) {
        let Some(lap) = self.session.current_lap() else {
            return;
        };
        match lap.last_distinct(point.timestamp_ns) {
            Some(prev) => {
                point.lap_distance_m = prev.lap_distance_m
                    + geo::haversine_m(prev.lat, prev.lon, point.lat, point.lon);
                point.lap_duration_ns = point
                    .timestamp_ns
                    .saturating_sub(lap.start_ns().unwrap_or(point.timestamp_ns));
            }
            None => {
                point.lap_distance_m = 0.0;
                point.lap_duration_ns = 0;
            }
        }
    }
}
