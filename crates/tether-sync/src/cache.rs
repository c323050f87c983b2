//! Client-side cached view of a session's physical log.

use std::collections::HashSet;
use tether_log::{Entry, EntryId};

/// Result of applying one received entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    /// Appended to the cache.
    Inserted,
    /// Already cached; ignored.
    Duplicate,
    /// A boundary replaced the cached log.
    Rebased,
}

/// Mirror of the server's physical log for one session.
///
/// Entries are deduplicated by id. A boundary entry means the server's
/// physical log now starts there, so everything cached before it is dropped.
#[derive(Clone, Debug, Default)]
pub struct SessionCache {
    entries: Vec<Entry>,
    ids: HashSet<EntryId>,
    /// Boundaries applied since the cache was created.
    boundaries_seen: u64,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, entry: Entry) -> Applied {
        if self.ids.contains(&entry.id) {
            return Applied::Duplicate;
        }

        if entry.is_boundary() {
            self.entries.clear();
            self.ids.clear();
            self.boundaries_seen += 1;
            self.ids.insert(entry.id.clone());
            self.entries.push(entry);
            return Applied::Rebased;
        }

        self.ids.insert(entry.id.clone());
        self.entries.push(entry);
        Applied::Inserted
    }

    /// Resume cursor for `subscribe`.
    pub fn last_message_id(&self) -> Option<&EntryId> {
        self.entries.last().map(|e| &e.id)
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &EntryId) -> bool {
        self.ids.contains(id)
    }

    pub fn boundaries_seen(&self) -> u64 {
        self.boundaries_seen
    }

    /// The boundary the cached log starts at, if any.
    pub fn boundary(&self) -> Option<&Entry> {
        self.entries.first().filter(|e| e.is_boundary())
    }
}
