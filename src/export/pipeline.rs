use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use log::{debug, error, info};

use crate::TracksideError;

use super::backend::ExportBackend;
use super::{ExportReceivers, LapSealed, LapStart, PointRecorded, SessionRecord};

/// How long to block for new points when the queues are empty.
const IDLE_WAIT: Duration = Duration::from_millis(100);
/// Backend failures repeat at sample rate; log them at most this often.
const ERROR_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Drains the export queues into a relational backend, surviving backend
/// outages without losing records or blocking capture.
///
/// Points are processed newest-first: fresh points are drained onto a
/// stack and popped from the top, so a live viewer watching the database
/// sees current data even while a backlog from an outage is still being
/// worked off. The backlog itself sits in a retry queue that is always
/// served before new points, oldest first.
///
/// Delivery is at-least-once. Everything staged since the last commit is
/// kept in memory; when the backend fails, the staged points go back onto
/// the retry queue, the transaction is discarded and session/lap rows are
/// replayed on reconnect. The backend's writes are idempotent on their
/// natural keys, so replays collapse to exactly-once in the store.
///
/// A seal or point that arrives ahead of its lap-start event is held
/// locally until the lap is known. That is a normal ordering wrinkle, not
/// a backend failure: nothing is rolled back and no reconnect happens.
pub struct ExportPipeline<B: ExportBackend> {
    backend: B,
    receivers: ExportReceivers,
    commit_every: usize,
    /// oldest-first backlog, served before fresh points
    retry: VecDeque<PointRecorded>,
    /// fresh points, popped newest-first
    live_stack: Vec<PointRecorded>,
    /// points staged on the backend since the last commit
    pending: Vec<PointRecorded>,
    /// seals waiting for their lap-start event
    deferred_seals: Vec<LapSealed>,
    session: Option<SessionRecord>,
    laps_seen: BTreeMap<u32, LapStart>,
    seals_seen: BTreeMap<u32, LapSealed>,
    needs_replay: bool,
    last_error_log: Option<Instant>,
}

impl<B: ExportBackend> ExportPipeline<B> {
    pub fn new(backend: B, receivers: ExportReceivers, commit_every: usize) -> Self {
        Self {
            backend,
            receivers,
            commit_every: commit_every.max(1),
            retry: VecDeque::new(),
            live_stack: Vec::new(),
            pending: Vec::new(),
            deferred_seals: Vec::new(),
            session: None,
            laps_seen: BTreeMap::new(),
            seals_seen: BTreeMap::new(),
            needs_replay: false,
            last_error_log: None,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Process until the stop flag is set, then drain what remains and
    /// commit. Capture keeps running regardless of what happens here; a
    /// failed final commit leaves the records in the append log for a
    /// later `import`.
    pub fn run(&mut self, stop: &AtomicBool) {
        loop {
            if stop.load(Ordering::Relaxed) {
                while self.run_once() {}
                match self.backend.commit() {
                    Ok(()) => self.pending.clear(),
                    Err(e) => error!("final export commit failed: {}", e),
                }
                break;
            }
            if !self.run_once() {
                // idle, or backend down: wait for fresh points and use the
                // quiet moment to commit anything staged
                match self.receivers.point_rx.recv_timeout(IDLE_WAIT) {
                    Ok(recorded) => self.live_stack.push(recorded),
                    Err(e) => {
                        if !self.pending.is_empty() && !self.needs_replay {
                            match self.backend.commit() {
                                Ok(()) => self.pending.clear(),
                                Err(e) => self.handle_error(e),
                            }
                        }
                        // a gone producer returns instantly; pace the loop
                        // until the stop flag arrives
                        if e == RecvTimeoutError::Disconnected {
                            thread::sleep(IDLE_WAIT);
                        }
                    }
                }
            }
        }
        info!(
            "export pipeline stopped, {} points left unexported",
            self.retry.len() + self.live_stack.len() + self.pending.len()
        );
    }

    /// One processing step: replay if needed, drain control events, then
    /// handle at most one point. Returns false when there was nothing to
    /// do or the backend failed.
    pub fn run_once(&mut self) -> bool {
        match self.attempt() {
            Ok(worked) => worked,
            Err(e) => {
                self.handle_error(e);
                false
            }
        }
    }

    fn attempt(&mut self) -> Result<bool, TracksideError> {
        let mut worked = false;

        if self.needs_replay {
            self.replay()?;
            self.needs_replay = false;
            worked = true;
        }

        while let Ok(record) = self.receivers.session_rx.try_recv() {
            self.session = Some(record.clone());
            self.backend.ensure_session(&record)?;
            worked = true;
        }
        while let Ok(start) = self.receivers.lap_start_rx.try_recv() {
            self.laps_seen.insert(start.number, start);
            self.backend.insert_lap(&start)?;
            worked = true;
        }
        // seals held for a missing lap row get another chance once their
        // lap-start has been drained; a seal removed here is always in
        // seals_seen, so a backend failure mid-application is replayed
        let mut i = 0;
        while i < self.deferred_seals.len() {
            if self.laps_seen.contains_key(&self.deferred_seals[i].number) {
                let sealed = self.deferred_seals.remove(i);
                self.backend.seal_lap(&sealed)?;
                worked = true;
            } else {
                i += 1;
            }
        }
        while let Ok(sealed) = self.receivers.lap_sealed_rx.try_recv() {
            self.seals_seen.insert(sealed.number, sealed);
            if self.laps_seen.contains_key(&sealed.number) {
                self.backend.seal_lap(&sealed)?;
            } else {
                self.deferred_seals.push(sealed);
            }
            worked = true;
        }

        if let Some(recorded) = self.next_point() {
            if self.laps_seen.contains_key(&recorded.lap_number) {
                // stage before writing so a failure finds it in pending
                // and puts it back on the retry queue
                self.pending.push(recorded);
                if let Some(staged) = self.pending.last() {
                    self.backend.insert_point(staged.lap_number, &staged.point)?;
                }
                if self.pending.len() >= self.commit_every {
                    self.backend.commit()?;
                    self.pending.clear();
                }
                worked = true;
            } else {
                // lap-start not seen yet: hold the point, this is not a
                // backend failure and must not roll anything back
                self.retry.push_back(recorded);
            }
        }

        Ok(worked)
    }

    fn next_point(&mut self) -> Option<PointRecorded> {
        if let Some(recorded) = self.retry.pop_front() {
            return Some(recorded);
        }
        self.live_stack.extend(self.receivers.point_rx.try_iter());
        self.live_stack.pop()
    }

    /// Re-establish session and lap rows after a reconnect. The previous
    /// transaction was rolled back, so everything uncommitted has to be
    /// written again; the idempotent inserts make this a no-op for rows
    /// that did land.
    fn replay(&mut self) -> Result<(), TracksideError> {
        debug!("replaying session state after backend reconnect");
        if let Some(record) = self.session.clone() {
            self.backend.ensure_session(&record)?;
        }
        let laps: Vec<LapStart> = self.laps_seen.values().copied().collect();
        for start in laps {
            self.backend.insert_lap(&start)?;
        }
        // deferred seals are not replayed here; they fire once their lap
        // arrives
        let seals: Vec<LapSealed> = self
            .seals_seen
            .values()
            .filter(|s| self.laps_seen.contains_key(&s.number))
            .copied()
            .collect();
        for sealed in seals {
            self.backend.seal_lap(&sealed)?;
        }
        Ok(())
    }

    fn handle_error(&mut self, error: TracksideError) {
        let now = Instant::now();
        let quiet = self
            .last_error_log
            .is_some_and(|last| now.duration_since(last) < ERROR_LOG_INTERVAL);
        if quiet {
            debug!("export backend failure: {}", error);
        } else {
            error!("export backend failure, retrying: {}", error);
            self.last_error_log = Some(now);
        }
        // everything uncommitted goes back to the front of the backlog in
        // its original order
        for recorded in self.pending.drain(..).rev() {
            self.retry.push_front(recorded);
        }
        self.backend.discard();
        self.needs_replay = true;
    }
}
