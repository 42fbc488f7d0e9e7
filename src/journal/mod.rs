//! Durable trade ledger.
//!
//! Append-only, newline-delimited JSON, one segment per UTC day. Writes are
//! fsynced before `append` returns, so a crash cannot leave a filled order
//! unrecorded. The journal is a ledger, not a message bus: nothing in the
//! process reads it back for coordination.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use parking_lot::Mutex;
use tracing::warn;

use crate::clock::utc_date;
use crate::error::FatalError;
use crate::types::TradeRecord;

pub struct TradeJournal {
    inner: Mutex<Inner>,
}

struct Inner {
    backend: Backend,
    next_id: u64,
}

enum Backend {
    Jsonl {
        dir: PathBuf,
        date: NaiveDate,
        file: File,
    },
    Memory {
        records: VecDeque<TradeRecord>,
    },
}

fn segment_path(dir: &Path, date: NaiveDate) -> PathBuf {
    dir.join(format!("trades-{}.jsonl", date.format("%Y-%m-%d")))
}

fn open_segment(dir: &Path, date: NaiveDate) -> Result<File, FatalError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(segment_path(dir, date))
        .map_err(|e| FatalError::JournalWriteFailed(format!("open segment: {}", e)))
}

/// Scan existing segments for the highest record id, so ids stay monotonic
/// across restarts.
fn max_existing_id(dir: &Path) -> u64 {
    let mut max = 0;
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().map_or(true, |e| e != "jsonl") {
            continue;
        }
        let Ok(file) = File::open(&path) else { continue };
        for line in BufReader::new(file).lines().flatten() {
            if let Ok(rec) = serde_json::from_str::<TradeRecord>(&line) {
                max = max.max(rec.id);
            }
        }
    }
    max
}

impl TradeJournal {
    pub fn jsonl(dir: impl Into<PathBuf>, today: NaiveDate) -> Result<Self, FatalError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| FatalError::JournalWriteFailed(format!("create dir: {}", e)))?;
        let next_id = max_existing_id(&dir) + 1;
        let file = open_segment(&dir, today)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                backend: Backend::Jsonl { dir, date: today, file },
                next_id,
            }),
        })
    }

    pub fn memory() -> Self {
        Self {
            inner: Mutex::new(Inner {
                backend: Backend::Memory {
                    records: VecDeque::new(),
                },
                next_id: 1,
            }),
        }
    }

    /// Append a record, stamping its monotonic id. Durably committed (segment
    /// fsynced) before returning. A failure here is fatal.
    pub fn append(&self, mut record: TradeRecord) -> Result<u64, FatalError> {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        record.id = id;
        inner.next_id += 1;

        match &mut inner.backend {
            Backend::Jsonl { dir, date, file } => {
                // Rotate automatically when the record crosses a UTC date boundary.
                let rec_date = utc_date(record.wall_time_ms);
                if rec_date != *date {
                    *file = open_segment(dir, rec_date)?;
                    *date = rec_date;
                }
                let line = serde_json::to_string(&record)
                    .map_err(|e| FatalError::JournalWriteFailed(format!("serialize: {}", e)))?;
                writeln!(file, "{}", line)
                    .map_err(|e| FatalError::JournalWriteFailed(format!("write: {}", e)))?;
                file.sync_all()
                    .map_err(|e| FatalError::JournalWriteFailed(format!("fsync: {}", e)))?;
            }
            Backend::Memory { records } => {
                records.push_back(record);
            }
        }
        Ok(id)
    }

    /// All records with `wall_time_ms >= since_ms`, oldest first. Malformed
    /// lines are skipped with a warning; unknown fields are tolerated.
    pub fn iter_since(&self, since_ms: i64) -> Result<Vec<TradeRecord>, FatalError> {
        let inner = self.inner.lock();
        match &inner.backend {
            Backend::Jsonl { dir, .. } => {
                let mut paths: Vec<PathBuf> = fs::read_dir(dir)
                    .map_err(|e| FatalError::JournalWriteFailed(format!("read dir: {}", e)))?
                    .flatten()
                    .map(|e| e.path())
                    .filter(|p| p.extension().map_or(false, |e| e == "jsonl"))
                    .collect();
                paths.sort();
                let mut out = Vec::new();
                for path in paths {
                    let file = File::open(&path)
                        .map_err(|e| FatalError::JournalWriteFailed(format!("open: {}", e)))?;
                    for line in BufReader::new(file).lines().flatten() {
                        match serde_json::from_str::<TradeRecord>(&line) {
                            Ok(rec) if rec.wall_time_ms >= since_ms => out.push(rec),
                            Ok(_) => {}
                            Err(e) => warn!(path = %path.display(), error = %e, "skipping malformed journal line"),
                        }
                    }
                }
                Ok(out)
            }
            Backend::Memory { records } => Ok(records
                .iter()
                .filter(|r| r.wall_time_ms >= since_ms)
                .cloned()
                .collect()),
        }
    }

    /// Rotate to the segment for `date`. Subsequent appends land there until
    /// the next date-boundary rotation.
    pub fn close_day(&self, date: NaiveDate) -> Result<(), FatalError> {
        let mut inner = self.inner.lock();
        if let Backend::Jsonl { dir, date: cur, file } = &mut inner.backend {
            if *cur != date {
                *file = open_segment(dir, date)?;
                *cur = date;
            }
        }
        Ok(())
    }
}
