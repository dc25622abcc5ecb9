// Crash-safe append-only log for telemetry points
//
// Records are length-prefixed: a fixed-width big-endian length followed by
// the payload bytes. The width is part of the filename, so a reader never
// has to guess it. Writers start at the smallest width and roll to a new
// file whenever a payload needs a wider prefix, which keeps the common
// small-record case compact while never rejecting a large record.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, warn};

use crate::TracksideError;
use crate::telemetry::Point;

const LOG_EXTENSION: &str = "data";
/// Widest supported length prefix, a u64.
const MAX_WIDTH: usize = 8;

fn log_path(dir: &Path, prefix: &str, width: usize) -> PathBuf {
    dir.join(format!("{prefix}_{width}.{LOG_EXTENSION}"))
}

/// Smallest number of bytes that can hold `len` as a big-endian integer.
fn required_width(len: usize) -> usize {
    let bits = usize::BITS - len.leading_zeros();
    (bits as usize).div_ceil(8).max(1)
}

/// Appending writer over a directory of width-named log files.
///
/// Every append flushes, so a crash loses at most the record being written.
/// A truncated tail record is expected and tolerated by the reader.
pub struct LogWriter {
    dir: PathBuf,
    prefix: String,
    width: usize,
    file: BufWriter<File>,
}

impl LogWriter {
    /// Open a fresh log under `dir`, creating the directory if needed.
    pub fn create(dir: &Path, prefix: &str) -> Result<Self, TracksideError> {
        fs::create_dir_all(dir).map_err(|e| TracksideError::LogWriteError { source: e })?;
        let width = 1;
        let file = Self::open_segment(dir, prefix, width)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
            width,
            file,
        })
    }

    fn open_segment(dir: &Path, prefix: &str, width: usize) -> Result<BufWriter<File>, TracksideError> {
        let path = log_path(dir, prefix, width);
        debug!("opening log segment {}", path.display());
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| TracksideError::LogWriteError { source: e })?;
        Ok(BufWriter::new(file))
    }

    /// Append one length-prefixed payload and flush it to disk. Rolls to a
    /// wider segment first when the payload length does not fit the current
    /// prefix width.
    pub fn append(&mut self, payload: &[u8]) -> Result<(), TracksideError> {
        let needed = required_width(payload.len()).min(MAX_WIDTH);
        if needed > self.width {
            self.file
                .flush()
                .map_err(|e| TracksideError::LogWriteError { source: e })?;
            self.width = needed;
            self.file = Self::open_segment(&self.dir, &self.prefix, needed)?;
        }
        self.file
            .write_uint::<BigEndian>(payload.len() as u64, self.width)
            .map_err(|e| TracksideError::LogWriteError { source: e })?;
        self.file
            .write_all(payload)
            .map_err(|e| TracksideError::LogWriteError { source: e })?;
        self.file
            .flush()
            .map_err(|e| TracksideError::LogWriteError { source: e })
    }

    /// Serialize a point and append it.
    pub fn append_point(&mut self, point: &Point) -> Result<(), TracksideError> {
        let payload =
            serde_json::to_vec(point).map_err(|e| TracksideError::PointEncodeError { source: e })?;
        self.append(&payload)
    }
}

/// Find every log segment for `prefix` under `dir`, returned with its
/// prefix width in write order (widths only ever grow, so ordering by
/// width is ordering by time). A file that matches the prefix but does not
/// encode a valid width is a hard error: it means the directory holds
/// something this reader does not understand.
pub fn discover(dir: &Path, prefix: &str) -> Result<Vec<(PathBuf, usize)>, TracksideError> {
    let mut segments = Vec::new();
    let entries = fs::read_dir(dir).map_err(|e| TracksideError::LogReadError { source: e })?;
    let name_prefix = format!("{prefix}_");
    for entry in entries {
        let entry = entry.map_err(|e| TracksideError::LogReadError { source: e })?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with(&name_prefix) {
            continue;
        }
        let width = name
            .strip_prefix(&name_prefix)
            .and_then(|rest| rest.strip_suffix(&format!(".{LOG_EXTENSION}")))
            .and_then(|w| w.parse::<usize>().ok())
            .filter(|&w| (1..=MAX_WIDTH).contains(&w))
            .ok_or_else(|| TracksideError::InvalidLogFilename {
                path: path.display().to_string(),
            })?;
        segments.push((path, width));
    }
    segments.sort_by_key(|&(_, width)| width);
    Ok(segments)
}

/// Read every complete payload out of one segment. A short or zero-length
/// tail is treated as end of file, which is exactly what a crash mid-append
/// leaves behind.
pub fn read_segment(path: &Path, width: usize) -> Result<Vec<Vec<u8>>, TracksideError> {
    let file = File::open(path).map_err(|e| TracksideError::LogReadError { source: e })?;
    let mut reader = BufReader::new(file);
    let mut payloads = Vec::new();
    loop {
        let len = match reader.read_uint::<BigEndian>(width) {
            Ok(len) => len as usize,
            // anything short of a full prefix is the tail
            Err(_) => break,
        };
        if len == 0 {
            break;
        }
        let mut payload = vec![0u8; len];
        if reader.read_exact(&mut payload).is_err() {
            debug!("truncated record at tail of {}", path.display());
            break;
        }
        payloads.push(payload);
    }
    Ok(payloads)
}

/// Read back every point recorded under `dir` with `prefix`, in write
/// order. A payload that no longer decodes ends that segment (a torn write
/// can only be the last record of a segment); later segments are still
/// read.
pub fn read_points(dir: &Path, prefix: &str) -> Result<Vec<Point>, TracksideError> {
    let mut points = Vec::new();
    for (path, width) in discover(dir, prefix)? {
        for payload in read_segment(&path, width)? {
            match serde_json::from_slice::<Point>(&payload) {
                Ok(point) => points.push(point),
                Err(e) => {
                    warn!(
                        "undecodable record in {}, stopping segment: {}",
                        path.display(),
                        e
                    );
                    break;
                }
            }
        }
    }
    Ok(points)
}
