use std::f64::consts::FRAC_PI_2;

use log::{debug, info};

use crate::geo;

use super::{Point, Session};

/// Default start/finish proximity gate, meters.
pub const DEFAULT_PROXIMITY_M: f64 = 20.0;
/// Default number of points a lap must hold before crossing checks run.
/// Guards against spurious triggers while idling near the line.
pub const DEFAULT_MIN_LAP_POINTS: usize = 60;

/// Result of a detected start/finish crossing.
#[derive(Clone, Debug, PartialEq)]
pub struct Crossing {
    /// Lap whose duration was just sealed
    pub sealed_number: u32,
    pub duration_ns: u64,
    /// Lap opened by this crossing
    pub new_number: u32,
    /// Timestamp of the boundary point shared by both laps
    pub boundary_ns: u64,
}

/// Start/finish crossing detection and sub-sample lap timing.
///
/// The engine is a two-state machine: a lap accumulates points until a
/// crossing fires, which instantaneously seals it and opens the next one.
/// A crossing fires when the newest point is inside the proximity gate and
/// the interior angle at the previous distinct point, in the triangle
/// (previous, new, start/finish), exceeds 90 degrees: the previous point
/// is then already past the perpendicular through the line. That previous
/// point becomes the boundary, kept as the old lap's last point and
/// duplicated (lap-elapsed fields zeroed) as the new lap's first, so both
/// laps carry a continuous trace through the line.
pub struct LapEngine {
    proximity_m: f64,
    min_lap_points: usize,
    /// Time-after-line of the current lap's start boundary, stored when
    /// the lap opened. Zero for the session's first lap, which starts
    /// wherever the car happened to be.
    start_correction_ns: u64,
}

impl Default for LapEngine {
    fn default() -> Self {
        Self::new(DEFAULT_PROXIMITY_M, DEFAULT_MIN_LAP_POINTS)
    }
}

impl LapEngine {
    pub fn new(proximity_m: f64, min_lap_points: usize) -> Self {
        Self {
            proximity_m,
            min_lap_points,
            start_correction_ns: 0,
        }
    }

    /// Run the crossing check for a candidate point that has its derived
    /// fields computed against the current lap but has not been appended
    /// yet. On a crossing the session is updated in place (old lap sealed,
    /// new lap opened with the duplicated boundary point) and the caller
    /// re-homes the candidate into the new lap.
    pub fn on_point(&mut self, session: &mut Session, candidate: &Point) -> Option<Crossing> {
        session.start_finish?;
        let lap = session.current_lap()?;
        if lap.points.len() < self.min_lap_points {
            return None;
        }
        if candidate.track_distance_m >= self.proximity_m {
            return None;
        }

        let prev = lap.last_distinct(candidate.timestamp_ns)?;
        let leg = geo::haversine_m(prev.lat, prev.lon, candidate.lat, candidate.lon);
        let angle = geo::interior_angle(leg, prev.track_distance_m, candidate.track_distance_m);
        if angle <= FRAC_PI_2 {
            return None;
        }

        // prev is past the line: it becomes the boundary point.
        let boundary = prev.clone();
        let end_correction_ns = lap
            .last_distinct(boundary.timestamp_ns)
            .map(|prior| Self::time_after_line_ns(prior, &boundary))
            .unwrap_or(0);

        let raw_ns = boundary
            .timestamp_ns
            .saturating_sub(lap.start_ns().unwrap_or(boundary.timestamp_ns));
        let duration_ns = (raw_ns + self.start_correction_ns).saturating_sub(end_correction_ns);
        let sealed_number = lap.number;
        let new_number = sealed_number + 1;
        debug!(
            "crossing: lap {} sealed at {:.3}s, opening lap {}",
            sealed_number,
            duration_ns as f64 * 1e-9,
            new_number
        );

        let lap = session.current_lap_mut()?;
        lap.duration_ns = Some(duration_ns);

        let mut first = boundary.clone();
        first.lap_distance_m = 0.0;
        first.lap_duration_ns = 0;
        let mut next = super::Lap::new(new_number);
        next.points.push(first);
        session.laps.push(next);

        // The new lap starts at the same geometric crossing the old lap
        // ended on; its start correction is the boundary's time past the
        // line.
        self.start_correction_ns = end_correction_ns;

        info!(
            "lap {} complete: {:.3}s",
            sealed_number,
            duration_ns as f64 * 1e-9
        );
        Some(Crossing {
            sealed_number,
            duration_ns,
            new_number,
            boundary_ns: boundary.timestamp_ns,
        })
    }

    /// How long the boundary point had already been past the line when it
    /// was sampled.
    ///
    /// Re-derives the triangle (prior, boundary, finish): the interior
    /// angle at the prior point projects the along-track distance still to
    /// cover (`cos(angle) * distance_to_finish`), the speed delta gives a
    /// constant acceleration, and `d = v*t + a*t^2/2` solved for its
    /// positive root gives the travel time from the prior point to the
    /// line. The remainder of the sample interval is time spent past it.
    fn time_after_line_ns(prior: &Point, boundary: &Point) -> u64 {
        let dt_ns = boundary.timestamp_ns.saturating_sub(prior.timestamp_ns);
        if dt_ns == 0 {
            return 0;
        }
        let dt_s = dt_ns as f64 * 1e-9;

        let travel = geo::haversine_m(prior.lat, prior.lon, boundary.lat, boundary.lon);
        let approach =
            geo::interior_angle(travel, prior.track_distance_m, boundary.track_distance_m);
        let to_line_m = approach.cos() * prior.track_distance_m;

        let accel = (boundary.speed - prior.speed) / dt_s;
        let to_line_s = geo::time_to_line_s(to_line_m, prior.speed, accel).clamp(0.0, dt_s);

        ((dt_s - to_line_s) * 1e9) as u64
    }
}
