// Whole-path export tests: aggregator output through the pipeline into a
// backend, including recovery from a mid-session backend outage.

use rusqlite::Connection;

use trackside::export::{self, ExportBackend, ExportPipeline, MemoryBackend, SqliteBackend};
use trackside::telemetry::{Coordinate, LapEngine, TelemetryAggregator, Track};
use trackside::{Fix, Session};

const METERS_PER_DEGREE: f64 = 111_195.0;

fn straight_track() -> Track {
    Track {
        name: "straight".to_string(),
        start_finish: Coordinate {
            lat: 10.0,
            lon: 10.0,
        },
        turns: Vec::new(),
    }
}

/// Drive a straight line away from the start/finish; no crossings, just a
/// steady stream of points on lap 1.
fn feed_straight_run(aggregator: &mut TelemetryAggregator, count: u64) {
    for i in 0..count {
        aggregator
            .process_fix(Fix {
                timestamp_ns: Some((i + 1) * 100_000_000),
                lat: Some(10.0 + (i + 1) as f64 * 30.0 / METERS_PER_DEGREE),
                lon: Some(10.0),
                alt: Some(200.0),
                speed: Some(30.0),
            })
            .expect("process fix");
    }
}

#[test]
fn test_session_reaches_memory_store() {
    let (queues, receivers) = export::queues();
    let mut aggregator = TelemetryAggregator::new(
        Session::new("gt86", true),
        straight_track(),
        Vec::new(),
        None,
        queues,
        LapEngine::default(),
    );
    feed_straight_run(&mut aggregator, 25);
    drop(aggregator);

    let mut pipeline = ExportPipeline::new(MemoryBackend::new(), receivers, 10);
    while pipeline.run_once() {}

    let store = pipeline.backend().committed();
    assert_eq!(store.sessions.len(), 1);
    assert_eq!(store.sessions[0].car, "gt86");
    assert!(store.sessions[0].live);
    assert_eq!(store.laps.len(), 1);
    // 25 points with commit_every 10: 20 committed, 5 still staged
    assert_eq!(store.points.len(), 20);

    pipeline.backend_mut().commit().expect("final commit");
    assert_eq!(pipeline.backend().committed().points.len(), 25);
}

#[test]
fn test_outage_recovers_without_loss() {
    let (queues, receivers) = export::queues();
    let mut aggregator = TelemetryAggregator::new(
        Session::new("gt86", true),
        straight_track(),
        Vec::new(),
        None,
        queues,
        LapEngine::default(),
    );
    feed_straight_run(&mut aggregator, 30);
    drop(aggregator);

    let mut pipeline = ExportPipeline::new(MemoryBackend::new(), receivers, 5);
    // let a few points through, then take the backend away mid-stream
    for _ in 0..8 {
        pipeline.run_once();
    }
    pipeline.backend_mut().fail_next(3);
    // failed steps return false while the outage lasts; keep stepping
    // until the backlog and the fresh points are all worked off
    for _ in 0..100 {
        pipeline.run_once();
    }
    pipeline.backend_mut().commit().expect("final commit");

    let store = pipeline.backend().committed();
    // every point lands exactly once despite requeues and replays
    assert_eq!(store.points.len(), 30);
    assert!(store.points.contains_key(&100_000_000));
    assert!(store.points.contains_key(&(30 * 100_000_000)));
    assert_eq!(store.sessions.len(), 1);
}

#[test]
fn test_sqlite_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = dir.path().join("telemetry.db");

    let (queues, receivers) = export::queues();
    let mut aggregator = TelemetryAggregator::new(
        Session::new("gt86", false),
        straight_track(),
        Vec::new(),
        None,
        queues,
        LapEngine::default(),
    );
    feed_straight_run(&mut aggregator, 12);
    drop(aggregator);

    let mut pipeline = ExportPipeline::new(SqliteBackend::new(&db), receivers, 4);
    while pipeline.run_once() {}

    let conn = Connection::open(&db).expect("open");
    let sessions: i64 = conn
        .query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))
        .expect("count");
    assert_eq!(sessions, 1);
    let points: i64 = conn
        .query_row("SELECT COUNT(*) FROM points", [], |r| r.get(0))
        .expect("count");
    assert_eq!(points, 12);
    let (lap_number, speed): (i64, f64) = conn
        .query_row(
            "SELECT l.number, p.speed FROM points p JOIN laps l ON p.lap_id = l.id LIMIT 1",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .expect("row");
    assert_eq!(lap_number, 1);
    assert_eq!(speed, 30.0);
}
