//! Durable storage backends for session logs.
//!
//! The [`LogStore`](crate::LogStore) keeps an in-memory view of every
//! session and writes through to a backend. A backend must make each call
//! durable before returning, and `rewrite` must be all-or-nothing.

use crate::entry::{Entry, EntryId};
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// A session as read back from durable storage.
#[derive(Clone, Debug, Default)]
pub struct LoadedSession {
    pub session_id: String,
    /// Physical log in append order.
    pub entries: Vec<Entry>,
    /// Entries removed by earlier compactions.
    pub history: Vec<Entry>,
}

/// Trait for durable log backends.
pub trait LogBackend: Send + Sync {
    /// Load every stored session.
    fn load(&self) -> Result<Vec<LoadedSession>>;

    /// Create an empty session. Creating an existing session is a no-op.
    fn create(&self, session_id: &str) -> Result<()>;

    /// Append one entry to the end of a session's physical log.
    fn append(&self, session_id: &str, entry: &Entry) -> Result<()>;

    /// Replace the whole physical log with `retained`, moving `removed` into
    /// the session's history. Either everything happens or nothing does.
    fn rewrite(&self, session_id: &str, retained: &[Entry], removed: &[Entry]) -> Result<()>;

    /// Remove a session and all of its entries.
    fn delete(&self, session_id: &str) -> Result<()>;

    /// Force pending writes to stable storage.
    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory backend for tests and simulations.
///
/// Share it behind an `Arc` to reopen a store over the same data and
/// simulate a restart.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    sessions: Mutex<HashMap<String, LoadedSession>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Number of entries currently persisted for a session.
    pub fn persisted_len(&self, session_id: &str) -> usize {
        self.sessions
            .lock()
            .get(session_id)
            .map(|s| s.entries.len())
            .unwrap_or(0)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.lock().contains_key(session_id)
    }
}

impl LogBackend for MemoryBackend {
    fn load(&self) -> Result<Vec<LoadedSession>> {
        Ok(self.sessions.lock().values().cloned().collect())
    }

    fn create(&self, session_id: &str) -> Result<()> {
        self.sessions
            .lock()
            .entry(session_id.to_string())
            .or_insert_with(|| LoadedSession {
                session_id: session_id.to_string(),
                ..Default::default()
            });
        Ok(())
    }

    fn append(&self, session_id: &str, entry: &Entry) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| LoadedSession {
                session_id: session_id.to_string(),
                ..Default::default()
            });
        session.entries.push(entry.clone());
        Ok(())
    }

    fn rewrite(&self, session_id: &str, retained: &[Entry], removed: &[Entry]) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| LoadedSession {
                session_id: session_id.to_string(),
                ..Default::default()
            });

        let known: HashSet<EntryId> = session.history.iter().map(|e| e.id.clone()).collect();
        session.history.extend(
            removed
                .iter()
                .filter(|e| !known.contains(&e.id))
                .cloned(),
        );
        session.entries = retained.to_vec();
        Ok(())
    }

    fn delete(&self, session_id: &str) -> Result<()> {
        self.sessions.lock().remove(session_id);
        Ok(())
    }
}
