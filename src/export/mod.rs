pub(crate) mod backend;
pub(crate) mod pipeline;

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::TracksideError;
use crate::telemetry::Point;

pub use backend::{ExportBackend, MemoryBackend, SqliteBackend};
pub use pipeline::ExportPipeline;

/// Session metadata announced on the first accepted fix.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionRecord {
    pub start_ns: u64,
    pub track: String,
    pub car: String,
    pub live: bool,
}

/// A new lap was opened.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LapStart {
    pub number: u32,
    pub start_ns: u64,
}

/// A lap's duration was sealed by a crossing.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LapSealed {
    pub number: u32,
    pub end_ns: u64,
    pub duration_ns: u64,
}

/// One point, tagged with the lap it belongs to.
#[derive(Clone, Debug)]
pub struct PointRecorded {
    pub lap_number: u32,
    pub point: Box<Point>,
}

/// Sender half of the export event queues. The aggregator (and the lap
/// engine through it) publishes here; cloning is cheap and the pipeline
/// keeps a clone for re-queuing failed work.
#[derive(Clone)]
pub struct ExportQueues {
    pub(crate) session_tx: Sender<SessionRecord>,
    pub(crate) lap_start_tx: Sender<LapStart>,
    pub(crate) lap_sealed_tx: Sender<LapSealed>,
    pub(crate) point_tx: Sender<PointRecorded>,
}

/// Receiver half, owned by the export pipeline.
pub struct ExportReceivers {
    pub(crate) session_rx: Receiver<SessionRecord>,
    pub(crate) lap_start_rx: Receiver<LapStart>,
    pub(crate) lap_sealed_rx: Receiver<LapSealed>,
    pub(crate) point_rx: Receiver<PointRecorded>,
}

/// Build the connected queue pair shared by the aggregator and the export
/// pipeline. Queues are unbounded: capture must never block on a slow or
/// disconnected database.
pub fn queues() -> (ExportQueues, ExportReceivers) {
    let (session_tx, session_rx) = unbounded();
    let (lap_start_tx, lap_start_rx) = unbounded();
    let (lap_sealed_tx, lap_sealed_rx) = unbounded();
    let (point_tx, point_rx) = unbounded();
    (
        ExportQueues {
            session_tx,
            lap_start_tx,
            lap_sealed_tx,
            point_tx,
        },
        ExportReceivers {
            session_rx,
            lap_start_rx,
            lap_sealed_rx,
            point_rx,
        },
    )
}

impl ExportQueues {
    pub fn session_started(&self, record: SessionRecord) -> Result<(), TracksideError> {
        self.session_tx
            .send(record)
            .map_err(|e| TracksideError::TelemetryBroadcastError {
                description: e.to_string(),
            })
    }

    pub fn lap_started(&self, start: LapStart) -> Result<(), TracksideError> {
        self.lap_start_tx
            .send(start)
            .map_err(|e| TracksideError::TelemetryBroadcastError {
                description: e.to_string(),
            })
    }

    pub fn lap_sealed(&self, sealed: LapSealed) -> Result<(), TracksideError> {
        self.lap_sealed_tx
            .send(sealed)
            .map_err(|e| TracksideError::TelemetryBroadcastError {
                description: e.to_string(),
            })
    }

    pub fn point_recorded(&self, lap_number: u32, point: Point) -> Result<(), TracksideError> {
        self.point_tx
            .send(PointRecorded {
                lap_number,
                point: Box::new(point),
            })
            .map_err(|e| TracksideError::TelemetryBroadcastError {
                description: e.to_string(),
            })
    }
}
