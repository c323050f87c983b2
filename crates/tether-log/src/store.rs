//! The session log store.
//!
//! Each session is held as an immutable snapshot (`Arc<SessionLog>`) behind
//! a lock. Readers clone the `Arc` and iterate without holding any lock, so
//! a reader always sees one whole version of the log. Writers hold the
//! session's [`WriterLease`], write through to the backend first, and only
//! then publish the new snapshot.

use crate::backend::{LoadedSession, LogBackend, MemoryBackend};
use crate::entry::{
    CompactionMetadata, CompactionTrigger, Entry, EntryBuilder, EntryId, EntryKind,
};
use crate::error::{Result, StoreError};
use crate::lease::{LeaseTable, WriterLease};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Configuration for the log store.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// How long an append waits for the writer lease before failing.
    pub append_lease_wait: Duration,
    /// Capacity of the store event channel.
    pub event_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            append_lease_wait: Duration::from_secs(90),
            event_capacity: 1024,
        }
    }
}

/// Builder for store configuration.
pub struct StoreConfigBuilder {
    config: StoreConfig,
}

impl StoreConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: StoreConfig::default(),
        }
    }

    pub fn append_lease_wait(mut self, wait: Duration) -> Self {
        self.config.append_lease_wait = wait;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn build(self) -> StoreConfig {
        self.config
    }
}

impl Default for StoreConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Events published after a change becomes visible.
#[derive(Clone, Debug)]
pub enum StoreEvent {
    /// A new entry was appended.
    Appended(Entry),
    /// A session's physical prefix was replaced.
    Compacted {
        session_id: String,
        boundary: Entry,
        summary: Entry,
        removed: usize,
    },
    /// A session was deleted.
    Deleted { session_id: String },
}

impl StoreEvent {
    pub fn session_id(&self) -> &str {
        match self {
            StoreEvent::Appended(entry) => &entry.session_id,
            StoreEvent::Compacted { session_id, .. } => session_id,
            StoreEvent::Deleted { session_id } => session_id,
        }
    }
}

/// One immutable version of a session's physical log.
#[derive(Clone, Debug, Default)]
pub struct SessionLog {
    entries: Vec<Entry>,
    index: HashMap<EntryId, usize>,
    compactions: u64,
}

impl SessionLog {
    fn from_entries(entries: Vec<Entry>, compactions: u64) -> Self {
        let index = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.clone(), i))
            .collect();
        SessionLog {
            entries,
            index,
            compactions,
        }
    }

    fn push(&mut self, entry: Entry) {
        self.index.insert(entry.id.clone(), self.entries.len());
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// The latest entry.
    pub fn cursor(&self) -> Option<&Entry> {
        self.entries.last()
    }

    pub fn get(&self, id: &EntryId) -> Option<&Entry> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    pub fn position(&self, id: &EntryId) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Number of compactions this session has gone through.
    pub fn compactions(&self) -> u64 {
        self.compactions
    }
}

/// Lazy, restartable iterator over a fixed version of a session log.
#[derive(Clone, Debug)]
pub struct RangeIter {
    log: Arc<SessionLog>,
    start: usize,
    pos: usize,
    end: usize,
}

impl RangeIter {
    /// Rewind to the first entry of the range.
    pub fn restart(&mut self) {
        self.pos = self.start;
    }

    /// The log version this iterator reads from.
    pub fn snapshot(&self) -> &Arc<SessionLog> {
        &self.log
    }
}

impl Iterator for RangeIter {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        if self.pos >= self.end {
            return None;
        }
        let entry = self.log.entries[self.pos].clone();
        self.pos += 1;
        Some(entry)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.end - self.pos;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for RangeIter {}

/// Summary of a session's current state.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionInfo {
    pub session_id: String,
    pub entry_count: usize,
    pub cursor: Option<EntryId>,
    pub compactions: u64,
    pub last_timestamp: Option<DateTime<Utc>>,
}

/// Result of replacing a session's physical prefix.
#[derive(Clone, Debug)]
pub struct PrefixCompaction {
    pub boundary: Entry,
    pub summary: Entry,
    /// Number of entries moved out of the physical log.
    pub removed: usize,
}

struct SessionSlot {
    log: RwLock<Arc<SessionLog>>,
    /// Entries compacted out of the physical log, kept to walk logical history.
    history: RwLock<HashMap<EntryId, Entry>>,
}

impl SessionSlot {
    fn new(log: SessionLog, history: HashMap<EntryId, Entry>) -> Self {
        SessionSlot {
            log: RwLock::new(Arc::new(log)),
            history: RwLock::new(history),
        }
    }
}

/// Session ids double as file names, so keep them to a safe alphabet.
pub fn validate_session_id(session_id: &str) -> Result<()> {
    let valid = !session_id.is_empty()
        && session_id.len() <= 128
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidSessionId(session_id.to_string()))
    }
}

/// Durable store of session logs.
pub struct LogStore {
    backend: Arc<dyn LogBackend>,
    config: StoreConfig,
    sessions: RwLock<HashMap<String, Arc<SessionSlot>>>,
    leases: LeaseTable,
    events: broadcast::Sender<StoreEvent>,
}

impl LogStore {
    /// Open a store over a backend, loading every persisted session.
    pub fn open(backend: Arc<dyn LogBackend>, config: StoreConfig) -> Result<Self> {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let mut sessions = HashMap::new();

        for loaded in backend.load()? {
            let LoadedSession {
                session_id,
                entries,
                history,
            } = loaded;

            let compactions = entries
                .iter()
                .filter_map(|e| e.compaction_metadata.as_ref())
                .map(|m| m.generation)
                .max()
                .unwrap_or(0);
            let history = history.into_iter().map(|e| (e.id.clone(), e)).collect();

            debug!(
                session_id = %session_id,
                entries = entries.len(),
                compactions,
                "loaded session"
            );
            sessions.insert(
                session_id,
                Arc::new(SessionSlot::new(
                    SessionLog::from_entries(entries, compactions),
                    history,
                )),
            );
        }

        info!(sessions = sessions.len(), "log store opened");

        Ok(LogStore {
            backend,
            config,
            sessions: RwLock::new(sessions),
            leases: LeaseTable::new(),
            events,
        })
    }

    /// Open an empty, in-memory store.
    pub fn in_memory() -> Self {
        LogStore {
            backend: Arc::new(MemoryBackend::new()),
            config: StoreConfig::default(),
            sessions: RwLock::new(HashMap::new()),
            leases: LeaseTable::new(),
            events: broadcast::channel(StoreConfig::default().event_capacity).0,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The writer lease table.
    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    /// Subscribe to store events.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn slot(&self, session_id: &str) -> Result<Arc<SessionSlot>> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))
    }

    pub fn exists(&self, session_id: &str) -> bool {
        self.sessions.read().contains_key(session_id)
    }

    /// All known session ids, sorted.
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Create an empty session. Creating an existing session is a no-op.
    pub fn create_session(&self, session_id: &str) -> Result<()> {
        validate_session_id(session_id)?;
        if self.exists(session_id) {
            return Ok(());
        }

        self.backend.create(session_id)?;
        let mut sessions = self.sessions.write();
        sessions.entry(session_id.to_string()).or_insert_with(|| {
            info!(session_id = %session_id, "session created");
            Arc::new(SessionSlot::new(SessionLog::default(), HashMap::new()))
        });
        Ok(())
    }

    /// Append an entry to an existing session.
    pub async fn append(&self, session_id: &str, kind: EntryKind, payload: Value) -> Result<Entry> {
        self.append_inner(session_id, kind, payload, false).await
    }

    /// Append an entry, creating the session first if it does not exist.
    pub async fn append_creating(
        &self,
        session_id: &str,
        kind: EntryKind,
        payload: Value,
    ) -> Result<Entry> {
        self.append_inner(session_id, kind, payload, true).await
    }

    async fn append_inner(
        &self,
        session_id: &str,
        kind: EntryKind,
        payload: Value,
        create: bool,
    ) -> Result<Entry> {
        validate_session_id(session_id)?;
        if kind.is_boundary() {
            return Err(StoreError::MalformedEntry(
                "boundary entries are only written by compaction".into(),
            ));
        }
        if !payload.is_object() {
            return Err(StoreError::MalformedEntry(
                "payload must be a JSON object".into(),
            ));
        }

        if create {
            self.create_session(session_id)?;
        }
        self.slot(session_id)?;

        let _lease = self
            .leases
            .acquire(session_id, "append", self.config.append_lease_wait)
            .await?;

        // The session may have been deleted while we waited
        let slot = self.slot(session_id)?;
        let entry = {
            let current = slot.log.read().clone();
            let cursor = current.cursor();
            let timestamp = monotonic_now(cursor.map(|e| e.timestamp));
            EntryBuilder::new(session_id, kind)
                .with_parent(cursor.map(|e| e.id.clone()))
                .with_payload(payload)
                .with_timestamp(timestamp)
                .build()
        };
        entry.validate()?;

        self.backend.append(session_id, &entry)?;
        {
            let mut log = slot.log.write();
            Arc::make_mut(&mut *log).push(entry.clone());
        }

        debug!(
            session_id = %session_id,
            entry_id = %entry.id,
            kind = %entry.kind,
            "entry appended"
        );
        let _ = self.events.send(StoreEvent::Appended(entry.clone()));

        Ok(entry)
    }

    /// The current version of a session's physical log.
    pub fn snapshot(&self, session_id: &str) -> Result<Arc<SessionLog>> {
        Ok(self.slot(session_id)?.log.read().clone())
    }

    /// Read up to `limit` entries strictly after `from` (or from the physical
    /// root when `from` is `None`), in append order.
    pub fn read_range(
        &self,
        session_id: &str,
        from: Option<&EntryId>,
        limit: Option<usize>,
    ) -> Result<RangeIter> {
        let log = self.snapshot(session_id)?;

        let start = match from {
            None => 0,
            Some(id) => log
                .position(id)
                .map(|p| p + 1)
                .ok_or_else(|| StoreError::CursorNotFound {
                    session_id: session_id.to_string(),
                    entry_id: id.to_string(),
                })?,
        };
        let end = match limit {
            Some(limit) => start.saturating_add(limit).min(log.len()),
            None => log.len(),
        };

        Ok(RangeIter {
            log,
            start,
            pos: start,
            end,
        })
    }

    pub fn entry_count(&self, session_id: &str) -> Result<usize> {
        Ok(self.snapshot(session_id)?.len())
    }

    pub fn session_info(&self, session_id: &str) -> Result<SessionInfo> {
        let log = self.snapshot(session_id)?;
        Ok(SessionInfo {
            session_id: session_id.to_string(),
            entry_count: log.len(),
            cursor: log.cursor().map(|e| e.id.clone()),
            compactions: log.compactions(),
            last_timestamp: log.cursor().map(|e| e.timestamp),
        })
    }

    /// Atomically replace the whole physical log with a boundary entry and a
    /// summary entry. The caller must hold the session's writer lease.
    pub fn compact_prefix(
        &self,
        lease: &WriterLease,
        summary_text: &str,
        pre_size: u64,
        trigger: CompactionTrigger,
    ) -> Result<PrefixCompaction> {
        let session_id = lease.session_id();
        let slot = self.slot(session_id)?;
        let current = slot.log.read().clone();

        let old_cursor = current.cursor();
        let metadata = CompactionMetadata {
            trigger,
            pre_size,
            generation: current.compactions() + 1,
        };
        let timestamp = monotonic_now(old_cursor.map(|e| e.timestamp));
        let boundary = EntryBuilder::boundary(
            session_id,
            old_cursor.map(|e| e.id.clone()),
            metadata,
            timestamp,
        );
        let summary = EntryBuilder::summary(&boundary, summary_text);

        let retained = vec![boundary.clone(), summary.clone()];
        if let Err(e) = self
            .backend
            .rewrite(session_id, &retained, current.entries())
        {
            warn!(session_id = %session_id, error = %e, "prefix rewrite failed, log unchanged");
            return Err(e);
        }

        let removed = current.len();
        {
            let mut history = slot.history.write();
            for entry in current.entries() {
                history.insert(entry.id.clone(), entry.clone());
            }
        }
        *slot.log.write() = Arc::new(SessionLog::from_entries(
            retained,
            current.compactions() + 1,
        ));

        info!(
            session_id = %session_id,
            removed,
            boundary_id = %boundary.id,
            generation = current.compactions() + 1,
            "prefix compacted"
        );
        let _ = self.events.send(StoreEvent::Compacted {
            session_id: session_id.to_string(),
            boundary: boundary.clone(),
            summary: summary.clone(),
            removed,
        });

        Ok(PrefixCompaction {
            boundary,
            summary,
            removed,
        })
    }

    /// Delete a session and every entry it ever had.
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.slot(session_id)?;
        let lease = self
            .leases
            .acquire(session_id, "delete", self.config.append_lease_wait)
            .await?;

        self.backend.delete(session_id)?;
        self.sessions.write().remove(session_id);
        self.leases.retire(lease);

        info!(session_id = %session_id, "session deleted");
        let _ = self.events.send(StoreEvent::Deleted {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    /// Walk `logical_parent_id` from the cursor back to the session's first
    /// entry, crossing compaction boundaries through the history arena.
    ///
    /// The returned chain starts at the cursor.
    pub fn logical_chain(&self, session_id: &str) -> Result<Vec<Entry>> {
        let slot = self.slot(session_id)?;
        let log = slot.log.read().clone();
        let history = slot.history.read();

        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut next = log.cursor().map(|e| e.id.clone());

        while let Some(id) = next {
            if !visited.insert(id.clone()) {
                return Err(StoreError::BrokenChain {
                    session_id: session_id.to_string(),
                    at: id.to_string(),
                });
            }
            let entry = log
                .get(&id)
                .or_else(|| history.get(&id))
                .ok_or_else(|| StoreError::BrokenChain {
                    session_id: session_id.to_string(),
                    at: id.to_string(),
                })?;
            next = entry.logical_parent_id.clone();
            chain.push(entry.clone());
        }

        Ok(chain)
    }

    /// Force the backend to flush to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.backend.sync()
    }
}

/// Wall-clock time, never earlier than the previous entry's timestamp.
fn monotonic_now(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(prev) if prev > now => prev,
        _ => now,
    }
}
