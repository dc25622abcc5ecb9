use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{debug, info};
use rusqlite::{Connection, params, params_from_iter, types::Value};

use crate::TracksideError;
use crate::telemetry::{Point, SensorField};

use super::{LapSealed, LapStart, SessionRecord};

/// Relational sink for the export pipeline.
///
/// Mutations accumulate in an open transaction until `commit`; `discard`
/// throws away everything uncommitted and any cached connection state, so
/// the pipeline can replay the same records after a failure. All writes are
/// idempotent on their natural keys, which is what makes the pipeline's
/// at-least-once delivery safe.
pub trait ExportBackend {
    fn ensure_session(&mut self, record: &SessionRecord) -> Result<(), TracksideError>;
    fn insert_lap(&mut self, start: &LapStart) -> Result<(), TracksideError>;
    fn seal_lap(&mut self, sealed: &LapSealed) -> Result<(), TracksideError>;
    fn insert_point(&mut self, lap_number: u32, point: &Point) -> Result<(), TracksideError>;
    fn commit(&mut self) -> Result<(), TracksideError>;
    fn discard(&mut self);
}

fn backend_err(e: rusqlite::Error) -> TracksideError {
    TracksideError::ExportBackendError {
        description: e.to_string(),
    }
}

fn ns_to_ms(ns: u64) -> i64 {
    (ns / 1_000_000) as i64
}

/// SQLite-backed store. The connection is opened lazily on the first write
/// so a missing or locked database file surfaces as a normal backend error
/// the pipeline retries, not a startup failure that kills the capture.
pub struct SqliteBackend {
    path: PathBuf,
    conn: Option<Connection>,
    session_id: Option<i64>,
    lap_ids: BTreeMap<u32, i64>,
}

impl SqliteBackend {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            conn: None,
            session_id: None,
            lap_ids: BTreeMap::new(),
        }
    }

    fn schema() -> String {
        let sensor_columns = SensorField::ALL
            .iter()
            .map(|f| format!("{} REAL", f.name()))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY,
                time INTEGER NOT NULL,
                track TEXT NOT NULL,
                car TEXT NOT NULL,
                live_data INTEGER NOT NULL,
                UNIQUE(time, car)
            );
            CREATE TABLE IF NOT EXISTS laps (
                id INTEGER PRIMARY KEY,
                session_id INTEGER NOT NULL REFERENCES sessions(id),
                number INTEGER NOT NULL,
                start_time INTEGER NOT NULL,
                end_time INTEGER,
                duration_ms INTEGER,
                UNIQUE(session_id, number)
            );
            CREATE TABLE IF NOT EXISTS points (
                time INTEGER NOT NULL,
                session_id INTEGER NOT NULL REFERENCES sessions(id),
                lap_id INTEGER NOT NULL REFERENCES laps(id),
                lat REAL NOT NULL,
                lon REAL NOT NULL,
                alt REAL NOT NULL,
                speed REAL NOT NULL,
                geohash TEXT NOT NULL,
                elapsed_duration_ms INTEGER NOT NULL,
                elapsed_distance_m REAL NOT NULL,
                {sensor_columns},
                PRIMARY KEY(session_id, time)
            );"
        )
    }

    fn connection(&mut self) -> Result<&Connection, TracksideError> {
        if self.conn.is_none() {
            info!("connecting to {}", self.path.display());
            let conn = Connection::open(&self.path).map_err(backend_err)?;
            conn.execute_batch(&Self::schema()).map_err(backend_err)?;
            conn.execute_batch("BEGIN").map_err(backend_err)?;
            self.conn = Some(conn);
        }
        self.conn
            .as_ref()
            .ok_or_else(|| TracksideError::ExportBackendError {
                description: "connection unavailable".to_string(),
            })
    }

    fn current_session_id(&self) -> Result<i64, TracksideError> {
        self.session_id
            .ok_or_else(|| TracksideError::ExportBackendError {
                description: "no session established".to_string(),
            })
    }
}

impl ExportBackend for SqliteBackend {
    fn ensure_session(&mut self, record: &SessionRecord) -> Result<(), TracksideError> {
        let time = record.start_ns as i64;
        let conn = self.connection()?;
        conn.execute(
            "INSERT OR IGNORE INTO sessions (time, track, car, live_data) VALUES (?1, ?2, ?3, ?4)",
            params![time, record.track, record.car, record.live],
        )
        .map_err(backend_err)?;
        let id = conn
            .query_row(
                "SELECT id FROM sessions WHERE time = ?1 AND car = ?2",
                params![time, record.car],
                |row| row.get(0),
            )
            .map_err(backend_err)?;
        self.session_id = Some(id);
        Ok(())
    }

    fn insert_lap(&mut self, start: &LapStart) -> Result<(), TracksideError> {
        let session_id = self.current_session_id()?;
        let conn = self.connection()?;
        conn.execute(
            "INSERT OR IGNORE INTO laps (session_id, number, start_time) VALUES (?1, ?2, ?3)",
            params![session_id, start.number, start.start_ns as i64],
        )
        .map_err(backend_err)?;
        let id = conn
            .query_row(
                "SELECT id FROM laps WHERE session_id = ?1 AND number = ?2",
                params![session_id, start.number],
                |row| row.get(0),
            )
            .map_err(backend_err)?;
        self.lap_ids.insert(start.number, id);
        Ok(())
    }

    fn seal_lap(&mut self, sealed: &LapSealed) -> Result<(), TracksideError> {
        let session_id = self.current_session_id()?;
        let conn = self.connection()?;
        let changed = conn
            .execute(
                "UPDATE laps SET end_time = ?1, duration_ms = ?2
                 WHERE session_id = ?3 AND number = ?4",
                params![
                    sealed.end_ns as i64,
                    ns_to_ms(sealed.duration_ns),
                    session_id,
                    sealed.number
                ],
            )
            .map_err(backend_err)?;
        // an update that matched nothing would silently drop the duration
        if changed == 0 {
            return Err(TracksideError::ExportBackendError {
                description: format!("lap {} not yet inserted", sealed.number),
            });
        }
        Ok(())
    }

    fn insert_point(&mut self, lap_number: u32, point: &Point) -> Result<(), TracksideError> {
        let session_id = self.current_session_id()?;
        let lap_id =
            *self
                .lap_ids
                .get(&lap_number)
                .ok_or_else(|| TracksideError::ExportBackendError {
                    description: format!("lap {lap_number} not yet inserted"),
                })?;

        let mut columns = vec![
            "time",
            "session_id",
            "lap_id",
            "lat",
            "lon",
            "alt",
            "speed",
            "geohash",
            "elapsed_duration_ms",
            "elapsed_distance_m",
        ];
        let mut values: Vec<Value> = vec![
            Value::Integer(point.timestamp_ns as i64),
            Value::Integer(session_id),
            Value::Integer(lap_id),
            Value::Real(point.lat),
            Value::Real(point.lon),
            Value::Real(point.alt),
            Value::Real(point.speed),
            Value::Text(point.geohash.clone()),
            Value::Integer(ns_to_ms(point.lap_duration_ns)),
            Value::Real(point.lap_distance_m),
        ];
        for field in SensorField::ALL {
            columns.push(field.name());
            values.push(Value::Real(field.read(point)));
        }
        let placeholders = (1..=columns.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT OR REPLACE INTO points ({}) VALUES ({})",
            columns.join(", "),
            placeholders
        );
        let conn = self.connection()?;
        conn.execute(&sql, params_from_iter(values))
            .map_err(backend_err)?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), TracksideError> {
        let conn = self.connection()?;
        conn.execute_batch("COMMIT").map_err(backend_err)?;
        conn.execute_batch("BEGIN").map_err(backend_err)?;
        debug!("committed export batch");
        Ok(())
    }

    /// Drop the connection, rolling back the open transaction, and forget
    /// every cached row id. The next write reconnects from scratch.
    fn discard(&mut self) {
        self.conn = None;
        self.session_id = None;
        self.lap_ids.clear();
    }
}

/// In-memory backend with the same staging and idempotency semantics as
/// the SQLite one. Used by tests and by `record --dry-run` style checks;
/// `fail_next` injects backend failures to exercise the pipeline's retry
/// path.
#[derive(Default)]
pub struct MemoryBackend {
    staged: MemoryStore,
    committed: MemoryStore,
    fail_next: u32,
    fail_commits: u32,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    pub sessions: Vec<SessionRecord>,
    pub laps: BTreeMap<u32, LapStart>,
    pub seals: BTreeMap<u32, LapSealed>,
    /// keyed by timestamp, emulating the points table primary key
    pub points: BTreeMap<u64, (u32, Point)>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` backend calls fail.
    pub fn fail_next(&mut self, count: u32) {
        self.fail_next = count;
    }

    /// Make the next `count` commits fail while other calls succeed.
    pub fn fail_commits(&mut self, count: u32) {
        self.fail_commits = count;
    }

    pub fn committed(&self) -> &MemoryStore {
        &self.committed
    }

    fn gate(&mut self, op: &str) -> Result<(), TracksideError> {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(TracksideError::ExportBackendError {
                description: format!("injected failure in {op}"),
            });
        }
        Ok(())
    }
}

impl ExportBackend for MemoryBackend {
    fn ensure_session(&mut self, record: &SessionRecord) -> Result<(), TracksideError> {
        self.gate("ensure_session")?;
        let exists = |s: &SessionRecord| s.start_ns == record.start_ns && s.car == record.car;
        if !self.staged.sessions.iter().any(exists) && !self.committed.sessions.iter().any(exists) {
            self.staged.sessions.push(record.clone());
        }
        Ok(())
    }

    fn insert_lap(&mut self, start: &LapStart) -> Result<(), TracksideError> {
        self.gate("insert_lap")?;
        if !self.committed.laps.contains_key(&start.number) {
            self.staged.laps.entry(start.number).or_insert(*start);
        }
        Ok(())
    }

    fn seal_lap(&mut self, sealed: &LapSealed) -> Result<(), TracksideError> {
        self.gate("seal_lap")?;
        if !self.staged.laps.contains_key(&sealed.number)
            && !self.committed.laps.contains_key(&sealed.number)
        {
            return Err(TracksideError::ExportBackendError {
                description: format!("lap {} not yet inserted", sealed.number),
            });
        }
        self.staged.seals.insert(sealed.number, *sealed);
        Ok(())
    }

    fn insert_point(&mut self, lap_number: u32, point: &Point) -> Result<(), TracksideError> {
        self.gate("insert_point")?;
        if !self.staged.laps.contains_key(&lap_number)
            && !self.committed.laps.contains_key(&lap_number)
        {
            return Err(TracksideError::ExportBackendError {
                description: format!("lap {lap_number} not yet inserted"),
            });
        }
        self.staged
            .points
            .insert(point.timestamp_ns, (lap_number, point.clone()));
        Ok(())
    }

    fn commit(&mut self) -> Result<(), TracksideError> {
        if self.fail_commits > 0 {
            self.fail_commits -= 1;
            return Err(TracksideError::ExportBackendError {
                description: "injected commit failure".to_string(),
            });
        }
        self.gate("commit")?;
        self.committed.sessions.append(&mut self.staged.sessions);
        self.committed.laps.append(&mut self.staged.laps);
        self.committed.seals.append(&mut self.staged.seals);
        self.committed.points.append(&mut self.staged.points);
        Ok(())
    }

    fn discard(&mut self) {
        self.staged = MemoryStore::default();
    }
}
