// End-to-end lap detection on a synthetic circular circuit.
//
// The car drives a 100m-radius circle through the start/finish at a
// constant 30 m/s, so every lap takes exactly 2*pi*100/30 = 20.944s of
// wall clock. Fixes arrive at 10Hz, which puts the geometric crossing
// well between samples and exercises the sub-sample correction.

use trackside::export;
use trackside::telemetry::{
    Coordinate, LapEngine, TelemetryAggregator, Track,
};
use trackside::{Fix, Session};

const RADIUS_M: f64 = 100.0;
const SPEED_MPS: f64 = 30.0;
const FIX_HZ: f64 = 10.0;
const METERS_PER_DEGREE: f64 = 111_195.0;
const NS_PER_S: f64 = 1e9;

fn circle_track() -> Track {
    Track {
        name: "circle".to_string(),
        start_finish: Coordinate { lat: 0.0, lon: 0.0 },
        turns: Vec::new(),
    }
}

/// Position on the circle at time `t_s`, in local meters east/north of the
/// start/finish, converted to degrees. The circle is centered 100m north
/// of the line and the car starts diametrically opposite it.
fn fix_at(t_s: f64) -> Fix {
    let omega = SPEED_MPS / RADIUS_M;
    let phi = std::f64::consts::PI + omega * t_s;
    let x_m = RADIUS_M * phi.sin();
    let y_m = RADIUS_M - RADIUS_M * phi.cos();
    Fix {
        timestamp_ns: Some((t_s * NS_PER_S) as u64),
        lat: Some(y_m / METERS_PER_DEGREE),
        lon: Some(x_m / METERS_PER_DEGREE),
        alt: Some(150.0),
        speed: Some(SPEED_MPS),
    }
}

fn drive(duration_s: f64) -> TelemetryAggregator {
    let (queues, _receivers) = export::queues();
    let mut aggregator = TelemetryAggregator::new(
        Session::new("gt86", true),
        circle_track(),
        Vec::new(),
        None,
        queues,
        LapEngine::new(20.0, 60),
    );
    let samples = (duration_s * FIX_HZ) as u64;
    for i in 0..samples {
        aggregator
            .process_fix(fix_at(i as f64 / FIX_HZ))
            .expect("process fix");
    }
    aggregator
}

#[test]
fn test_full_laps_are_detected() {
    // crossings at 10.47s, 31.42s, 52.36s and 73.30s: the opening half
    // lap plus three full laps are sealed, a fifth lap is left open
    let aggregator = drive(75.0);
    let session = aggregator.session();
    assert_eq!(session.laps.len(), 5);
    for lap in &session.laps[..4] {
        assert!(lap.duration_ns.is_some(), "lap {} not sealed", lap.number);
    }
    assert!(session.laps[4].duration_ns.is_none());
}

#[test]
fn test_full_lap_duration_matches_wall_clock() {
    let aggregator = drive(75.0);
    let session = aggregator.session();
    let expected_s = 2.0 * std::f64::consts::PI * RADIUS_M / SPEED_MPS;
    for lap in &session.laps[1..3] {
        let duration_s = lap.duration_ns.expect("sealed") as f64 / NS_PER_S;
        assert!(
            (duration_s - expected_s).abs() < 0.02,
            "lap {} sealed at {:.3}s, expected {:.3}s",
            lap.number,
            duration_s,
            expected_s
        );
    }
}

#[test]
fn test_opening_lap_measured_from_first_point() {
    // the car starts half a circle from the line, so the opening lap is
    // half a lap long and only its end is corrected
    let aggregator = drive(30.0);
    let session = aggregator.session();
    let duration_s = session.laps[0].duration_ns.expect("sealed") as f64 / NS_PER_S;
    let expected_s = std::f64::consts::PI * RADIUS_M / SPEED_MPS;
    assert!(
        (duration_s - expected_s).abs() < 0.02,
        "got {:.3}s, expected {:.3}s",
        duration_s,
        expected_s
    );
}

#[test]
fn test_boundary_point_shared_between_laps() {
    let aggregator = drive(30.0);
    let session = aggregator.session();
    let first = &session.laps[0];
    let second = &session.laps[1];
    let tail = first.points.last().expect("points");
    let head = &second.points[0];
    assert_eq!(tail.timestamp_ns, head.timestamp_ns);
    assert_eq!(head.lap_distance_m, 0.0);
    assert_eq!(head.lap_duration_ns, 0);
    // the tail keeps the old lap's accumulated distance
    assert!(tail.lap_distance_m > 300.0);
}

#[test]
fn test_lap_elapsed_fields_restart_each_lap() {
    let aggregator = drive(45.0);
    let lap2 = &aggregator.session().laps[1];
    let mid = &lap2.points[lap2.points.len() / 2];
    assert!(mid.lap_duration_ns > 0);
    assert!(mid.lap_distance_m > 0.0);
    assert!(mid.lap_distance_m < 700.0);
}

#[test]
fn test_duplicate_fixes_do_not_disturb_timing() {
    let (queues, _receivers) = export::queues();
    let mut aggregator = TelemetryAggregator::new(
        Session::new("gt86", true),
        circle_track(),
        Vec::new(),
        None,
        queues,
        LapEngine::new(20.0, 60),
    );
    let samples = (45.0 * FIX_HZ) as u64;
    for i in 0..samples {
        let fix = fix_at(i as f64 / FIX_HZ);
        aggregator.process_fix(fix.clone()).expect("process fix");
        // repeat every fifth fix, as a stuttering receiver would
        if i % 5 == 0 {
            aggregator.process_fix(fix).expect("process duplicate");
        }
    }
    let session = aggregator.session();
    let expected_s = 2.0 * std::f64::consts::PI * RADIUS_M / SPEED_MPS;
    let duration_s = session.laps[1].duration_ns.expect("sealed") as f64 / NS_PER_S;
    assert!((duration_s - expected_s).abs() < 0.02, "got {}", duration_s);
}
