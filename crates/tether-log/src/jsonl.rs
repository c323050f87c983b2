//! Line-delimited JSON backend: one file per session.
//!
//! Layout under the data directory:
//! - `<session>.jsonl`: the physical log, one record per line
//! - `<session>.history.jsonl`: records removed by compaction
//!
//! Compaction appends the removed records to the history file, then writes
//! the new physical log to a temporary file and renames it over the old one.
//! A crash before the rename leaves the old log intact; duplicate history
//! records are dropped on load.

use crate::backend::{LoadedSession, LogBackend};
use crate::entry::{CompactionMetadata, CompactionTrigger, Entry, EntryId, EntryKind};
use crate::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const LOG_SUFFIX: &str = ".jsonl";
const HISTORY_SUFFIX: &str = ".history.jsonl";
const TMP_SUFFIX: &str = ".jsonl.tmp";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompactMetadataRecord {
    trigger: CompactionTrigger,
    pre_tokens: u64,
    #[serde(default)]
    generation: u64,
}

/// On-disk shape of one entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogRecord {
    uuid: String,
    session_id: String,
    #[serde(rename = "type")]
    kind: String,
    parent_uuid: Option<String>,
    logical_parent_uuid: Option<String>,
    message: Value,
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    compact_metadata: Option<CompactMetadataRecord>,
}

impl From<&Entry> for LogRecord {
    fn from(entry: &Entry) -> Self {
        LogRecord {
            uuid: entry.id.0.clone(),
            session_id: entry.session_id.clone(),
            kind: entry.kind.as_str().to_string(),
            parent_uuid: entry.parent_id.as_ref().map(|id| id.0.clone()),
            logical_parent_uuid: entry.logical_parent_id.as_ref().map(|id| id.0.clone()),
            message: entry.payload.clone(),
            timestamp: entry.timestamp,
            compact_metadata: entry
                .compaction_metadata
                .as_ref()
                .map(|m| CompactMetadataRecord {
                    trigger: m.trigger,
                    pre_tokens: m.pre_size,
                    generation: m.generation,
                }),
        }
    }
}

impl TryFrom<LogRecord> for Entry {
    type Error = StoreError;

    fn try_from(record: LogRecord) -> Result<Self> {
        let entry = Entry {
            id: EntryId(record.uuid),
            session_id: record.session_id,
            kind: record.kind.parse::<EntryKind>()?,
            parent_id: record.parent_uuid.map(EntryId),
            logical_parent_id: record.logical_parent_uuid.map(EntryId),
            payload: record.message,
            timestamp: record.timestamp,
            compaction_metadata: record.compact_metadata.map(|m| CompactionMetadata {
                trigger: m.trigger,
                pre_size: m.pre_tokens,
                generation: m.generation,
            }),
        };
        entry.validate()?;
        Ok(entry)
    }
}

/// Backend storing each session as a line-delimited JSON file.
#[derive(Clone, Debug)]
pub struct JsonlBackend {
    dir: PathBuf,
    fsync: bool,
}

impl JsonlBackend {
    /// Open (and create if needed) a data directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(JsonlBackend { dir, fsync: true })
    }

    /// Disable per-write fsync. Only sensible for tests and benchmarks.
    pub fn with_fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", session_id, LOG_SUFFIX))
    }

    pub fn history_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", session_id, HISTORY_SUFFIX))
    }

    fn tmp_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", session_id, TMP_SUFFIX))
    }

    fn open_append(&self, path: &Path) -> Result<File> {
        Ok(OpenOptions::new().create(true).append(true).open(path)?)
    }

    fn write_records(&self, file: File, entries: &[Entry]) -> Result<()> {
        let mut writer = BufWriter::new(file);
        for entry in entries {
            serde_json::to_writer(&mut writer, &LogRecord::from(entry))?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        if self.fsync {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Read every valid record from a file, skipping malformed lines.
    fn read_records(&self, path: &Path, session_id: &str) -> Result<Vec<Entry>> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            let parsed = serde_json::from_str::<LogRecord>(&line)
                .map_err(|e| StoreError::MalformedEntry(e.to_string()))
                .and_then(Entry::try_from);

            match parsed {
                Ok(entry) if entry.session_id == session_id => entries.push(entry),
                Ok(entry) => warn!(
                    path = %path.display(),
                    line = line_no + 1,
                    entry_session = %entry.session_id,
                    "skipping record that belongs to another session"
                ),
                Err(e) => warn!(
                    path = %path.display(),
                    line = line_no + 1,
                    error = %e,
                    "skipping malformed record"
                ),
            }
        }
        Ok(entries)
    }
}

impl LogBackend for JsonlBackend {
    fn load(&self) -> Result<Vec<LoadedSession>> {
        let mut sessions = Vec::new();

        for dir_entry in fs::read_dir(&self.dir)? {
            let path = dir_entry?.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };

            if name.ends_with(TMP_SUFFIX) {
                // Leftover from a rewrite that never reached its rename
                debug!(path = %path.display(), "removing stale temporary log");
                let _ = fs::remove_file(&path);
                continue;
            }
            if name.ends_with(HISTORY_SUFFIX) {
                continue;
            }
            let session_id = match name.strip_suffix(LOG_SUFFIX) {
                Some(stem) if !stem.is_empty() => stem.to_string(),
                _ => continue,
            };

            let entries = self.read_records(&path, &session_id)?;
            let live: HashSet<&EntryId> = entries.iter().map(|e| &e.id).collect();

            let mut seen = HashSet::new();
            let history = self
                .read_records(&self.history_path(&session_id), &session_id)?
                .into_iter()
                .filter(|e| !live.contains(&e.id) && seen.insert(e.id.clone()))
                .collect();

            sessions.push(LoadedSession {
                session_id,
                entries,
                history,
            });
        }

        Ok(sessions)
    }

    fn create(&self, session_id: &str) -> Result<()> {
        let file = self.open_append(&self.log_path(session_id))?;
        if self.fsync {
            file.sync_all()?;
        }
        Ok(())
    }

    fn append(&self, session_id: &str, entry: &Entry) -> Result<()> {
        let mut line = serde_json::to_vec(&LogRecord::from(entry))?;
        line.push(b'\n');

        let mut file = self.open_append(&self.log_path(session_id))?;
        file.write_all(&line)?;
        if self.fsync {
            file.sync_data()?;
        }
        Ok(())
    }

    fn rewrite(&self, session_id: &str, retained: &[Entry], removed: &[Entry]) -> Result<()> {
        if !removed.is_empty() {
            let history = self.open_append(&self.history_path(session_id))?;
            self.write_records(history, removed)?;
        }

        let tmp = self.tmp_path(session_id);
        let result = File::create(&tmp)
            .map_err(StoreError::from)
            .and_then(|file| self.write_records(file, retained))
            .and_then(|_| fs::rename(&tmp, self.log_path(session_id)).map_err(StoreError::from));

        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }

    fn delete(&self, session_id: &str) -> Result<()> {
        for path in [self.log_path(session_id), self.history_path(session_id)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }
}
