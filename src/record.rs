//! Persistent observation record.
//!
//! One small JSON document per night holds the per-field progress counters.
//! Saves go through a temp file in the same directory followed by a rename,
//! so a crash leaves either the previous record or the new one, never a
//! torn write. Loading validates a run identity; anything that does not
//! match, parse, or carry the expected version reads as "no record" and the
//! night starts fresh.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

pub const RECORD_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("record encoding failure: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Identifies the run a record belongs to. A record is only trusted when
/// the night, the sequence, and the field count all match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIdentity {
    /// Local night date, `yyyy-mm-dd` of the evening.
    pub night: String,
    /// Identity of the sequence the night was started from.
    pub sequence_id: String,
    pub field_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldProgress {
    pub index: usize,
    pub n_done: u32,
    pub last_jd: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationRecord {
    pub version: u32,
    pub run: RunIdentity,
    pub fields: Vec<FieldProgress>,
}

impl ObservationRecord {
    pub fn new(run: RunIdentity, fields: Vec<FieldProgress>) -> Self {
        Self {
            version: RECORD_VERSION,
            run,
            fields,
        }
    }
}

pub struct ObservationRecordStore {
    path: PathBuf,
}

impl ObservationRecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically replace the record on disk.
    ///
    /// The document is synced before the rename so the checkpoint is durable
    /// by the time this returns.
    pub fn save(&self, record: &ObservationRecord) -> Result<(), RecordError> {
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(record)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "observation record checkpointed");
        Ok(())
    }

    /// Load the record matching `expected`.
    ///
    /// Returns `Ok(None)` for a missing file, a corrupt document, a version
    /// bump, or an identity mismatch; only real io failures are errors.
    pub fn load(&self, expected: &RunIdentity) -> Result<Option<ObservationRecord>, RecordError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record: ObservationRecord = match serde_json::from_str(&text) {
            Ok(record) => record,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "corrupt observation record, starting fresh");
                return Ok(None);
            }
        };

        if record.version != RECORD_VERSION {
            warn!(
                found = record.version,
                expected = RECORD_VERSION,
                "observation record version mismatch, starting fresh"
            );
            return Ok(None);
        }
        if &record.run != expected {
            warn!(
                found = ?record.run,
                expected = ?expected,
                "observation record belongs to another run, starting fresh"
            );
            return Ok(None);
        }
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> RunIdentity {
        RunIdentity {
            night: "2026-08-23".to_string(),
            sequence_id: "survey.seq:3".to_string(),
            field_count: 3,
        }
    }

    fn record() -> ObservationRecord {
        ObservationRecord::new(
            identity(),
            vec![
                FieldProgress {
                    index: 0,
                    n_done: 2,
                    last_jd: Some(2_460_911.6),
                },
                FieldProgress {
                    index: 1,
                    n_done: 0,
                    last_jd: None,
                },
                FieldProgress {
                    index: 2,
                    n_done: 3,
                    last_jd: Some(2_460_911.7),
                },
            ],
        )
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObservationRecordStore::new(dir.path().join("night.json"));
        store.save(&record()).unwrap();

        let loaded = store.load(&identity()).unwrap().unwrap();
        assert_eq!(loaded.fields.len(), 3);
        assert_eq!(loaded.fields[0].n_done, 2);
        assert_eq!(loaded.fields[1].last_jd, None);
    }

    #[test]
    fn missing_record_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObservationRecordStore::new(dir.path().join("absent.json"));
        assert!(store.load(&identity()).unwrap().is_none());
    }

    #[test]
    fn identity_mismatch_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObservationRecordStore::new(dir.path().join("night.json"));
        store.save(&record()).unwrap();

        let other = RunIdentity {
            night: "2026-08-24".to_string(),
            ..identity()
        };
        assert!(store.load(&other).unwrap().is_none());

        let fewer_fields = RunIdentity {
            field_count: 2,
            ..identity()
        };
        assert!(store.load(&fewer_fields).unwrap().is_none());
    }

    #[test]
    fn corrupt_record_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("night.json");
        fs::write(&path, b"{ not json").unwrap();
        let store = ObservationRecordStore::new(path);
        assert!(store.load(&identity()).unwrap().is_none());
    }

    #[test]
    fn save_replaces_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObservationRecordStore::new(dir.path().join("night.json"));
        store.save(&record()).unwrap();

        let mut updated = record();
        updated.fields[1].n_done = 1;
        store.save(&updated).unwrap();

        let loaded = store.load(&identity()).unwrap().unwrap();
        assert_eq!(loaded.fields[1].n_done, 1);

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn version_bump_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObservationRecordStore::new(dir.path().join("night.json"));
        let mut old = record();
        old.version = RECORD_VERSION + 1;
        store.save(&old).unwrap();
        assert!(store.load(&identity()).unwrap().is_none());
    }
}
