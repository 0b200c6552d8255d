//! Append-only durable state log.
//!
//! Each stateful unit owns one log. Commits append either an incremental
//! delta record for the committed batch or, on checkpoint-interval
//! boundaries, a full-state snapshot that supersedes everything before it for
//! replay purposes. The failed-unit recovery path reads the log back, loads
//! the most recent checkpoint at or before the rollback target and folds the
//! later deltas on top.
//!
//! The file backend stores one JSON record per line; the in-memory backend
//! serves tests. Record identity is opaque to the engine besides `batch_id`
//! and `kind`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for durable log operations.
#[derive(Error, Debug)]
pub enum PersistError {
    /// I/O or filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A stored record could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Kind of a durable record.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum RecordKind {
    /// Post-image delta for a single committed batch.
    Incremental,
    /// Full-state snapshot superseding all prior records for replay.
    Checkpoint,
}

/// One appended record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    /// Batch this record belongs to.
    pub batch_id: i64,
    /// Incremental delta or full checkpoint.
    pub kind: RecordKind,
    /// Key to post-image value entries.
    pub entries: BTreeMap<String, i64>,
    /// Timestamp of the append.
    pub written_at: DateTime<Utc>,
}

impl LogRecord {
    /// Creates a record stamped with the current time.
    pub fn new(batch_id: i64, kind: RecordKind, entries: BTreeMap<String, i64>) -> Self {
        Self {
            batch_id,
            kind,
            entries,
            written_at: Utc::now(),
        }
    }
}

/// Append-only record store for one unit's state.
pub trait StateLog: Send {
    /// Appends a record.
    fn append(&mut self, record: &LogRecord) -> Result<(), PersistError>;

    /// Reads every record back in append order.
    fn read_all(&self) -> Result<Vec<LogRecord>, PersistError>;
}

/// File-backed log, one JSON record per line.
pub struct FileStateLog {
    path: PathBuf,
}

impl FileStateLog {
    /// Opens (or creates) a log file at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, PersistError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path: path.as_ref().to_path_buf(),
        })
    }
}

impl StateLog for FileStateLog {
    fn append(&mut self, record: &LogRecord) -> Result<(), PersistError> {
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let line = serde_json::to_string(record).map_err(|e| PersistError::Corrupt(e.to_string()))?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<LogRecord>, PersistError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let record: LogRecord =
                serde_json::from_str(&line).map_err(|e| PersistError::Corrupt(e.to_string()))?;
            records.push(record);
        }
        Ok(records)
    }
}

/// In-memory log for tests and log-less deployments.
#[derive(Default)]
pub struct MemoryStateLog {
    records: Vec<LogRecord>,
}

impl MemoryStateLog {
    /// Creates an empty in-memory log.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateLog for MemoryStateLog {
    fn append(&mut self, record: &LogRecord) -> Result<(), PersistError> {
        self.records.push(record.clone());
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<LogRecord>, PersistError> {
        Ok(self.records.clone())
    }
}

/// Reconstructs state as of `target` from a record sequence: the most recent
/// checkpoint with `batch_id <= target` is loaded verbatim, then later
/// incremental deltas up to and including `target` are merged per key in
/// order.
pub fn replay_records(records: &[LogRecord], target: i64) -> BTreeMap<String, i64> {
    let base = records
        .iter()
        .rposition(|r| r.kind == RecordKind::Checkpoint && r.batch_id <= target);
    let mut state = BTreeMap::new();
    let start = match base {
        Some(index) => {
            state = records[index].entries.clone();
            index + 1
        }
        None => 0,
    };
    for record in &records[start..] {
        if record.kind == RecordKind::Incremental && record.batch_id <= target {
            for (key, value) in &record.entries {
                state.insert(key.clone(), *value);
            }
        }
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entries(pairs: &[(&str, i64)]) -> BTreeMap<String, i64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn file_log_round_trip_preserves_order() {
        let tmp = TempDir::new().unwrap();
        let mut log = FileStateLog::new(tmp.path().join("unit.log")).unwrap();
        log.append(&LogRecord::new(0, RecordKind::Incremental, entries(&[("a", 1)])))
            .unwrap();
        log.append(&LogRecord::new(1, RecordKind::Incremental, entries(&[("a", 2)])))
            .unwrap();

        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].batch_id, 0);
        assert_eq!(records[1].batch_id, 1);
        assert_eq!(records[1].entries.get("a"), Some(&2));
    }

    #[test]
    fn empty_log_reads_empty() {
        let tmp = TempDir::new().unwrap();
        let log = FileStateLog::new(tmp.path().join("missing.log")).unwrap();
        assert!(log.read_all().unwrap().is_empty());
    }

    #[test]
    fn corrupt_line_is_reported() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.log");
        std::fs::write(&path, "not json\n").unwrap();
        let log = FileStateLog::new(&path).unwrap();
        assert!(matches!(log.read_all(), Err(PersistError::Corrupt(_))));
    }

    #[test]
    fn replay_folds_deltas_onto_checkpoint() {
        let records = vec![
            LogRecord::new(0, RecordKind::Incremental, entries(&[("a", 1), ("b", 1)])),
            LogRecord::new(1, RecordKind::Incremental, entries(&[("a", 2)])),
            LogRecord::new(2, RecordKind::Checkpoint, entries(&[("a", 5), ("c", 1)])),
            LogRecord::new(3, RecordKind::Incremental, entries(&[("b", 7)])),
            LogRecord::new(4, RecordKind::Incremental, entries(&[("c", 9)])),
        ];

        // Checkpoint supersedes the earlier deltas; only batch 3 folds on top.
        let state = replay_records(&records, 3);
        assert_eq!(state.get("a"), Some(&5));
        assert_eq!(state.get("b"), Some(&7));
        assert_eq!(state.get("c"), Some(&1));
    }

    #[test]
    fn replay_without_checkpoint_starts_empty() {
        let records = vec![
            LogRecord::new(0, RecordKind::Incremental, entries(&[("a", 1)])),
            LogRecord::new(1, RecordKind::Incremental, entries(&[("b", 2)])),
        ];
        let state = replay_records(&records, 0);
        assert_eq!(state.get("a"), Some(&1));
        assert_eq!(state.get("b"), None);
    }

    #[test]
    fn memory_log_round_trip() {
        let mut log = MemoryStateLog::new();
        log.append(&LogRecord::new(0, RecordKind::Checkpoint, entries(&[("k", 3)])))
            .unwrap();
        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, RecordKind::Checkpoint);
    }
}
