use proptest::prelude::*;

use trackside::Point;
use trackside::logfile::{self, LogWriter};

#[test]
fn test_points_survive_writer_drop() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut writer = LogWriter::create(dir.path(), "session").expect("create");
    for i in 0..50u64 {
        let mut point = Point {
            timestamp_ns: i * 100_000_000,
            lat: 44.05 + i as f64 * 1e-5,
            lon: -78.67,
            speed: 28.0,
            geohash: "dpxrdpxrdpxr".to_string(),
            ..Default::default()
        };
        point.rpm = 4000.0 + i as f64;
        writer.append_point(&point).expect("append");
    }
    drop(writer);

    let points = logfile::read_points(dir.path(), "session").expect("read");
    assert_eq!(points.len(), 50);
    assert_eq!(points[49].timestamp_ns, 49 * 100_000_000);
    assert_eq!(points[49].rpm, 4049.0);
}

#[test]
fn test_prefixes_are_isolated() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut morning = LogWriter::create(dir.path(), "morning").expect("create");
    let mut afternoon = LogWriter::create(dir.path(), "afternoon").expect("create");
    morning.append(b"am").expect("append");
    afternoon.append(b"pm").expect("append");
    afternoon.append(b"pm2").expect("append");
    drop(morning);
    drop(afternoon);

    let segments = logfile::discover(dir.path(), "morning").expect("discover");
    assert_eq!(segments.len(), 1);
    let payloads = logfile::read_segment(&segments[0].0, segments[0].1).expect("read");
    assert_eq!(payloads, vec![b"am".to_vec()]);
}

proptest! {
    // Arbitrary payload sequences survive a write/read cycle in order,
    // including sequences that straddle a prefix-width promotion.
    #[test]
    fn prop_payload_sequences_round_trip(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..600), 1..40)
    ) {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut writer = LogWriter::create(dir.path(), "session").expect("create");
        for payload in &payloads {
            writer.append(payload).expect("append");
        }
        drop(writer);

        let mut read_back = Vec::new();
        for (path, width) in logfile::discover(dir.path(), "session").expect("discover") {
            read_back.extend(logfile::read_segment(&path, width).expect("read"));
        }
        prop_assert_eq!(read_back, payloads);
    }

    // Chopping any number of bytes off the final segment never breaks the
    // reader; it just loses at most the final record.
    #[test]
    fn prop_truncation_loses_at_most_tail(cut in 1usize..20) {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut writer = LogWriter::create(dir.path(), "session").expect("create");
        for i in 0..5u8 {
            writer.append(&[i; 10]).expect("append");
        }
        drop(writer);

        let segments = logfile::discover(dir.path(), "session").expect("discover");
        let (path, width) = &segments[0];
        let file = std::fs::OpenOptions::new().write(true).open(path).expect("open");
        let len = file.metadata().expect("metadata").len();
        file.set_len(len.saturating_sub(cut as u64)).expect("truncate");
        drop(file);

        let payloads = logfile::read_segment(path, *width).expect("read");
        prop_assert!(payloads.len() >= 3);
        for (i, payload) in payloads.iter().enumerate() {
            prop_assert_eq!(payload.as_slice(), &[i as u8; 10][..]);
        }
    }
}
