use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use log::{debug, warn};
use parking_lot::RwLock;

use crate::TracksideError;

use super::{Fix, Reading, SensorField};

/// A blocking device read for a sensor whose values are merged into the
/// next position-driven point (IMU, tire pyrometers, analog channels).
///
/// Implementations live next to their hardware drivers; the crate only
/// ships [`SyntheticSensor`] for demos and tests. A failed read must leave
/// the device usable for the next cycle: the producer loop logs the error
/// and keeps polling.
pub trait SensorRead: Send {
    fn read(&mut self) -> Result<Vec<Reading>, TracksideError>;
}

/// A blocking read of the next position fix. `Ok(None)` means the source
/// is exhausted (replay files); the producer loop then exits.
pub trait FixRead: Send {
    fn read(&mut self) -> Result<Option<Fix>, TracksideError>;
}

/// Shared latest-value cell, one per producer.
///
/// The producer replaces the snapshot on every cycle; the aggregator takes
/// a non-blocking clone when it assembles a point. One writer, one reader,
/// no waiting on either side.
#[derive(Clone, Default)]
pub struct SensorCell {
    inner: Arc<RwLock<Vec<Reading>>>,
}

impl SensorCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the published snapshot.
    pub fn publish(&self, readings: Vec<Reading>) {
        *self.inner.write() = readings;
    }

    /// Clone the latest published snapshot without blocking on the writer.
    pub fn snapshot(&self) -> Vec<Reading> {
        self.inner.read().clone()
    }
}

/// One polling thread wrapped around a device read.
///
/// The loop records a start instant, performs the blocking read, publishes
/// the result, then sleeps `1/hz - read_latency` (clamped at zero) so the
/// long-run cadence matches the configured frequency instead of drifting
/// by the read latency. Each producer is fully isolated: a blocked or
/// crashed device stalls only its own thread.
pub struct SensorProducer {
    name: String,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SensorProducer {
    /// Spawn a producer that publishes into a latest-value cell.
    pub fn spawn_cell(
        name: &str,
        hz: f64,
        mut device: impl SensorRead + 'static,
        cell: SensorCell,
    ) -> Self {
        let producer_name = name.to_string();
        Self::spawn(name, hz, move || match device.read() {
            Ok(readings) => {
                cell.publish(readings);
                true
            }
            Err(e) => {
                warn!("sensor {} read failed: {}", producer_name, e);
                true
            }
        })
    }

    /// Spawn a producer that pushes position fixes onto the aggregator's
    /// queue. The loop exits when the source is exhausted or the consumer
    /// side of the queue is gone.
    pub fn spawn_fix(
        name: &str,
        hz: f64,
        mut device: impl FixRead + 'static,
        sender: Sender<Fix>,
    ) -> Self {
        let producer_name = name.to_string();
        Self::spawn(name, hz, move || match device.read() {
            Ok(Some(fix)) => sender.send(fix).is_ok(),
            Ok(None) => {
                debug!("fix source {} exhausted", producer_name);
                false
            }
            Err(e) => {
                warn!("fix source {} read failed: {}", producer_name, e);
                true
            }
        })
    }

    fn spawn(name: &str, hz: f64, mut tick: impl FnMut() -> bool + Send + 'static) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let period = Duration::from_secs_f64(1.0 / hz.max(0.001));
        let handle = thread::spawn(move || {
            while !flag.load(Ordering::Relaxed) {
                let started = Instant::now();
                if !tick() {
                    break;
                }
                let elapsed = started.elapsed();
                if elapsed < period {
                    thread::sleep(period - elapsed);
                }
            }
        });
        Self {
            name: name.to_string(),
            stop,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request a cooperative stop. The loop observes the flag at iteration
    /// granularity.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Set the stop flag and wait for the loop to exit. With a timeout the
    /// call gives up once the deadline passes, leaving the thread to
    /// finish on its own (a stuck device read can hold it arbitrarily
    /// long).
    pub fn join(mut self, timeout: Option<Duration>) -> Result<(), TracksideError> {
        self.stop();
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        match timeout {
            None => {
                let _ = handle.join();
                Ok(())
            }
            Some(limit) => {
                let deadline = Instant::now() + limit;
                while !handle.is_finished() {
                    if Instant::now() >= deadline {
                        return Err(TracksideError::ProducerJoinTimeout {
                            name: self.name.clone(),
                            timeout_ms: limit.as_millis() as u64,
                        });
                    }
                    thread::sleep(Duration::from_millis(2));
                }
                let _ = handle.join();
                Ok(())
            }
        }
    }
}

/// Waveform generator standing in for real hardware. Produces a slow sine
/// sweep per configured field so demo captures and tests get non-constant,
/// reproducible values.
pub struct SyntheticSensor {
    fields: Vec<SensorField>,
    cycle: u64,
}

impl SyntheticSensor {
    pub fn new(fields: Vec<SensorField>) -> Self {
        Self { fields, cycle: 0 }
    }
}

impl SensorRead for SyntheticSensor {
    fn read(&mut self) -> Result<Vec<Reading>, TracksideError> {
        self.cycle += 1;
        let phase = self.cycle as f64 / 50.0;
        Ok(self
            .fields
            .iter()
            .enumerate()
            .map(|(i, &field)| Reading {
                field,
                value: (phase + i as f64).sin(),
            })
            .collect())
    }
}

/// Position source that replays fixes from a JSON-lines file, one `Fix`
/// object per line. Used by `trackside record` and by tests to drive the
/// complete live path without a GPS attached.
pub struct ReplayFixSource {
    lines: std::io::Lines<BufReader<File>>,
}

impl ReplayFixSource {
    pub fn from_file(path: &Path) -> Result<Self, TracksideError> {
        let file = File::open(path).map_err(|e| TracksideError::FixSourceError { source: e })?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
        })
    }
}

impl FixRead for ReplayFixSource {
    fn read(&mut self) -> Result<Option<Fix>, TracksideError> {
        match self.lines.next() {
            None => Ok(None),
            Some(line) => {
                let line = line.map_err(|e| TracksideError::FixSourceError { source: e })?;
                let fix = serde_json::from_str(&line)
                    .map_err(|e| TracksideError::FixDecodeError { source: e })?;
                Ok(Some(fix))
            }
        }
    }
}
