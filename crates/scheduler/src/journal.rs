//! Append-only JSON-lines journal backing the expiration log.
//!
//! Each line is either a `scheduled` record carrying a full entry or a
//! `marked` record recording a status transition. Opening the journal
//! replays every line, then compacts the file down to the entries that are
//! still pending.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use cohort_core::{CohortError, CohortResult};

use crate::{ExpirationEntry, ExpirationLog, ExpirationStatus};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum JournalRecord {
    Scheduled { entry: ExpirationEntry },
    Marked { id: Uuid, status: ExpirationStatus },
}

/// File-backed expiration log. Every append is flushed and fsynced before
/// the call returns.
pub struct FileExpirationLog {
    path: PathBuf,
    inner: Mutex<JournalInner>,
}

struct JournalInner {
    writer: File,
    entries: HashMap<Uuid, ExpirationEntry>,
}

impl FileExpirationLog {
    pub fn open(path: impl AsRef<Path>) -> CohortResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut entries = Self::replay(&path)?;
        Self::compact(&path, &entries)?;
        // Only pending entries are kept in memory; settled ones live in the
        // on-disk records alone.
        entries.retain(|_, entry| entry.status == ExpirationStatus::Pending);

        let writer = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(path = %path.display(), pending = entries.len(), "Expiration journal opened");

        Ok(Self {
            path,
            inner: Mutex::new(JournalInner { writer, entries }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn replay(path: &Path) -> CohortResult<HashMap<Uuid, ExpirationEntry>> {
        let mut entries = HashMap::new();
        if !path.exists() {
            return Ok(entries);
        }

        let reader = BufReader::new(File::open(path)?);
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalRecord>(&line) {
                Ok(JournalRecord::Scheduled { entry }) => {
                    entries.insert(entry.id, entry);
                }
                Ok(JournalRecord::Marked { id, status }) => {
                    if let Some(entry) = entries.get_mut(&id) {
                        entry.status = status;
                    }
                }
                // A torn final line after a crash is expected; anything else
                // in the middle of the file is worth a warning.
                Err(e) => warn!(error = %e, "Skipping unparsable journal line"),
            }
        }
        Ok(entries)
    }

    /// Rewrite the journal keeping only pending entries, dropping the
    /// settled ones accumulated since the last open.
    fn compact(path: &Path, entries: &HashMap<Uuid, ExpirationEntry>) -> CohortResult<()> {
        let tmp_path = path.with_extension("journal.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            for entry in entries.values() {
                if entry.status == ExpirationStatus::Pending {
                    let record = JournalRecord::Scheduled {
                        entry: entry.clone(),
                    };
                    serde_json::to_writer(&mut tmp, &record)?;
                    tmp.write_all(b"\n")?;
                }
            }
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    fn write_record(inner: &mut JournalInner, record: &JournalRecord) -> CohortResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        inner.writer.write_all(&line)?;
        inner.writer.sync_data()?;
        Ok(())
    }
}

impl ExpirationLog for FileExpirationLog {
    fn append(&self, entry: &ExpirationEntry) -> CohortResult<()> {
        let mut inner = self.inner.lock();
        Self::write_record(
            &mut inner,
            &JournalRecord::Scheduled {
                entry: entry.clone(),
            },
        )?;
        inner.entries.insert(entry.id, entry.clone());
        Ok(())
    }

    fn mark(&self, id: Uuid, status: ExpirationStatus) -> CohortResult<()> {
        let mut inner = self.inner.lock();
        if !inner.entries.contains_key(&id) {
            return Err(CohortError::NotFound(format!("expiration entry {id}")));
        }
        Self::write_record(&mut inner, &JournalRecord::Marked { id, status })?;
        match status {
            // Settled entries are evicted so the map does not grow for the
            // life of the process; replay reconstructs them from disk.
            ExpirationStatus::Done | ExpirationStatus::Cancelled => {
                inner.entries.remove(&id);
            }
            ExpirationStatus::Pending => {
                if let Some(entry) = inner.entries.get_mut(&id) {
                    entry.status = status;
                }
            }
        }
        Ok(())
    }

    fn load_pending(&self) -> CohortResult<Vec<ExpirationEntry>> {
        let inner = self.inner.lock();
        Ok(inner
            .entries
            .values()
            .filter(|e| e.status == ExpirationStatus::Pending)
            .cloned()
            .collect())
    }
}

/// In-memory log for tests and embedded use. Durable only for the lifetime
/// of the process.
#[derive(Default)]
pub struct MemoryExpirationLog {
    entries: Mutex<HashMap<Uuid, ExpirationEntry>>,
}

impl MemoryExpirationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Status of a specific entry, for assertions.
    pub fn status_of(&self, id: Uuid) -> Option<ExpirationStatus> {
        self.entries.lock().get(&id).map(|e| e.status)
    }
}

impl ExpirationLog for MemoryExpirationLog {
    fn append(&self, entry: &ExpirationEntry) -> CohortResult<()> {
        self.entries.lock().insert(entry.id, entry.clone());
        Ok(())
    }

    fn mark(&self, id: Uuid, status: ExpirationStatus) -> CohortResult<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&id)
            .ok_or_else(|| CohortError::NotFound(format!("expiration entry {id}")))?;
        entry.status = status;
        Ok(())
    }

    fn load_pending(&self) -> CohortResult<Vec<ExpirationEntry>> {
        Ok(self
            .entries
            .lock()
            .values()
            .filter(|e| e.status == ExpirationStatus::Pending)
            .cloned()
            .collect())
    }
}
