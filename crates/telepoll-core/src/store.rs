//! Value-series persistence.
//!
//! [`SeriesStore`] keeps one append-only file per sensor identity:
//!
//! ```text
//! <base>/sensor-<id>.dat
//! ┌──────────────┬──────────────┬──────────────────────────┐
//! │ len: u32 LE  │ crc32: u32 LE│ postcard(Record) (len B) │  × N
//! └──────────────┴──────────────┴──────────────────────────┘
//! ```
//!
//! A crash mid-append leaves a torn frame at the end of a file. Reads stop at
//! the first frame that is short or fails its checksum, and opening the store
//! truncates such tails.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ports::{DataPoint, DataStore, StoreError};

const FRAME_HEADER: usize = 8;
const FILE_PREFIX: &str = "sensor-";
const FILE_EXT: &str = "dat";

#[derive(Serialize, Deserialize)]
struct Record {
    ts_ms: i64,
    value: f64,
}

fn encode_frame(timestamp: DateTime<Utc>, value: f64) -> Result<Vec<u8>, StoreError> {
    let record = Record {
        ts_ms: timestamp.timestamp_millis(),
        value,
    };
    let payload = postcard::to_allocvec(&record).map_err(|e| StoreError::Encode(e.to_string()))?;

    let mut frame = Vec::with_capacity(FRAME_HEADER + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decodes frames until the data ends or a frame is invalid.
///
/// Returns the decoded points and the byte offset where valid data ends.
fn decode_frames(data: &[u8]) -> (Vec<DataPoint>, usize) {
    let mut points = Vec::new();
    let mut pos = 0usize;

    while data.len() - pos >= FRAME_HEADER {
        let len = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]) as usize;
        let crc = u32::from_le_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]]);
        let start = pos + FRAME_HEADER;
        let Some(payload) = data.get(start..start + len) else {
            break;
        };
        if crc32fast::hash(payload) != crc {
            break;
        }
        let Ok(record) = postcard::from_bytes::<Record>(payload) else {
            break;
        };
        let Some(timestamp) = DateTime::from_timestamp_millis(record.ts_ms) else {
            break;
        };

        points.push(DataPoint {
            timestamp,
            value: record.value,
        });
        pos = start + len;
    }

    (points, pos)
}

/// File-backed data store with one series file per sensor.
#[derive(Debug)]
pub struct SeriesStore {
    base_path: PathBuf,
    /// Per-identity locks; writers for different sensors never contend.
    locks: Mutex<HashMap<u32, Arc<Mutex<()>>>>,
}

impl SeriesStore {
    /// Opens (creating if needed) a store rooted at `base_path` and repairs
    /// torn tails left by an interrupted append.
    pub fn open(base_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base_path = base_path.into();
        std::fs::create_dir_all(&base_path)?;

        let store = Self {
            base_path,
            locks: Mutex::new(HashMap::new()),
        };
        store.recover()?;
        Ok(store)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn series_path(&self, sensor_id: u32) -> PathBuf {
        self.base_path
            .join(format!("{}{}.{}", FILE_PREFIX, sensor_id, FILE_EXT))
    }

    fn lock_for(&self, sensor_id: u32) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(sensor_id).or_default())
    }

    fn recover(&self) -> Result<(), StoreError> {
        for entry in std::fs::read_dir(&self.base_path)?.flatten() {
            let path = entry.path();
            let is_series = path.extension().is_some_and(|ext| ext == FILE_EXT)
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(FILE_PREFIX));
            if !is_series {
                continue;
            }

            let data = std::fs::read(&path)?;
            let (points, valid_end) = decode_frames(&data);
            if valid_end < data.len() {
                warn!(
                    "Series corruption detected in {}: {} garbage bytes after {} valid records. Truncating.",
                    path.display(),
                    data.len() - valid_end,
                    points.len()
                );
                if let Err(e) = OpenOptions::new()
                    .write(true)
                    .open(&path)
                    .and_then(|f| f.set_len(valid_end as u64))
                {
                    warn!("Failed to truncate {}: {}", path.display(), e);
                }
            } else {
                debug!("Recovered {} records from {}", points.len(), path.display());
            }
        }
        Ok(())
    }
}

impl DataStore for SeriesStore {
    fn write(&self, sensor_id: u32, timestamp: DateTime<Utc>, value: f64) -> Result<(), StoreError> {
        let frame = encode_frame(timestamp, value)?;
        let lock = self.lock_for(sensor_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.series_path(sensor_id))?;
        file.write_all(&frame)?;
        Ok(())
    }

    fn read_series(&self, sensor_id: u32) -> Result<Vec<DataPoint>, StoreError> {
        let lock = self.lock_for(sensor_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let data = match std::fs::read(self.series_path(sensor_id)) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let (points, valid_end) = decode_frames(&data);
        if valid_end < data.len() {
            warn!(
                sensor = sensor_id,
                garbage_bytes = data.len() - valid_end,
                "Ignoring unreadable tail of series"
            );
        }
        Ok(points)
    }
}

/// In-memory data store, mainly for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    series: Mutex<HashMap<u32, Vec<DataPoint>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of points stored for a sensor.
    pub fn len(&self, sensor_id: u32) -> usize {
        self.series
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&sensor_id)
            .map_or(0, Vec::len)
    }

    /// Total number of points across all sensors.
    pub fn total(&self) -> usize {
        self.series
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }
}

impl DataStore for MemoryStore {
    fn write(&self, sensor_id: u32, timestamp: DateTime<Utc>, value: f64) -> Result<(), StoreError> {
        self.series
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(sensor_id)
            .or_default()
            .push(DataPoint { timestamp, value });
        Ok(())
    }

    fn read_series(&self, sensor_id: u32) -> Result<Vec<DataPoint>, StoreError> {
        Ok(self
            .series
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&sensor_id)
            .cloned()
            .unwrap_or_default())
    }
}
