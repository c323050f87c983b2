//! # tether-log
//!
//! Append-only, causally linked session logs with atomic prefix compaction.
//!
//! This crate provides:
//! - Entries: immutable records with a physical and a logical parent link
//! - Writer leases: one explicit mutual-exclusion token per session
//! - The log store: append, range reads over stable snapshots, and
//!   all-or-nothing replacement of a log prefix by a boundary + summary
//! - Backends: in-memory for tests, line-delimited JSON files for production
//!
//! ## Example
//!
//! ```rust,ignore
//! use tether_log::{EntryKind, LogStore};
//! use serde_json::json;
//!
//! let store = LogStore::in_memory();
//! let first = store.append_creating("s1", EntryKind::User, json!({"text": "hi"})).await?;
//! let entries: Vec<_> = store.read_range("s1", None, None)?.collect();
//! assert_eq!(entries[0].id, first.id);
//! ```

mod backend;
mod entry;
mod error;
mod jsonl;
mod lease;
mod store;

pub use backend::{LoadedSession, LogBackend, MemoryBackend};
pub use entry::{CompactionMetadata, CompactionTrigger, Entry, EntryBuilder, EntryId, EntryKind};
pub use error::{Result, StoreError};
pub use jsonl::JsonlBackend;
pub use lease::{LeaseTable, WriterLease};
pub use store::{
    validate_session_id, LogStore, PrefixCompaction, RangeIter, SessionInfo, SessionLog,
    StoreConfig, StoreConfigBuilder, StoreEvent,
};
