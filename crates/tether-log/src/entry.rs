//! Session log entries and their builder.
//!
//! Each entry carries two references to earlier entries:
//! - `parent_id`: the previous entry in physical append order
//! - `logical_parent_id`: the causal predecessor, which survives compaction
//!
//! Both are plain ids into an arena owned by the store, never pointers.

use crate::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Opaque, immutable identifier of an entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub String);

impl EntryId {
    /// Generate a fresh, globally unique id.
    pub fn generate() -> Self {
        EntryId(Ulid::new().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        EntryId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntryId {
    fn from(id: &str) -> Self {
        EntryId(id.to_string())
    }
}

/// The kind of an entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    User,
    Assistant,
    System,
    /// Synthetic marker written by compaction.
    Boundary,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::User => "user",
            EntryKind::Assistant => "assistant",
            EntryKind::System => "system",
            EntryKind::Boundary => "boundary",
        }
    }

    pub fn is_boundary(&self) -> bool {
        matches!(self, EntryKind::Boundary)
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(EntryKind::User),
            "assistant" => Ok(EntryKind::Assistant),
            "system" => Ok(EntryKind::System),
            "boundary" => Ok(EntryKind::Boundary),
            other => Err(StoreError::MalformedEntry(format!(
                "unknown entry kind {:?}",
                other
            ))),
        }
    }
}

/// What started a compaction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompactionTrigger {
    #[default]
    Manual,
    Auto,
}

/// Metadata carried only by boundary entries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionMetadata {
    pub trigger: CompactionTrigger,

    /// Size metric captured immediately before compaction.
    pub pre_size: u64,

    /// Value of the session's compaction counter after this compaction.
    #[serde(default)]
    pub generation: u64,
}

/// One immutable record in a session log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub session_id: String,
    pub kind: EntryKind,
    pub parent_id: Option<EntryId>,
    pub logical_parent_id: Option<EntryId>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compaction_metadata: Option<CompactionMetadata>,
}

impl Entry {
    pub fn is_boundary(&self) -> bool {
        self.kind.is_boundary()
    }

    /// The `text` field of the payload, if any.
    pub fn text(&self) -> Option<&str> {
        self.payload.get("text").and_then(Value::as_str)
    }

    /// Whether this is the synthetic summary written right after a boundary.
    pub fn is_compact_summary(&self) -> bool {
        self.payload
            .get("is_compact_summary")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Check the structural rules every stored entry must satisfy.
    pub fn validate(&self) -> Result<()> {
        if self.id.0.is_empty() {
            return Err(StoreError::MalformedEntry("empty entry id".into()));
        }
        if self.session_id.is_empty() {
            return Err(StoreError::MalformedEntry(format!(
                "entry {} has no session id",
                self.id
            )));
        }
        if !self.payload.is_object() {
            return Err(StoreError::MalformedEntry(format!(
                "entry {} payload must be an object",
                self.id
            )));
        }

        if self.is_boundary() {
            if self.parent_id.is_some() {
                return Err(StoreError::MalformedEntry(format!(
                    "boundary {} must not have a physical parent",
                    self.id
                )));
            }
            if self.compaction_metadata.is_none() {
                return Err(StoreError::MalformedEntry(format!(
                    "boundary {} is missing compaction metadata",
                    self.id
                )));
            }
        } else {
            if self.compaction_metadata.is_some() {
                return Err(StoreError::MalformedEntry(format!(
                    "non-boundary entry {} carries compaction metadata",
                    self.id
                )));
            }
            if self.logical_parent_id != self.parent_id {
                return Err(StoreError::MalformedEntry(format!(
                    "entry {} has diverging physical and logical parents",
                    self.id
                )));
            }
        }

        Ok(())
    }
}

/// Builder for entries.
#[derive(Clone, Debug)]
pub struct EntryBuilder {
    session_id: String,
    kind: EntryKind,
    parent_id: Option<EntryId>,
    logical_parent_id: Option<EntryId>,
    payload: Value,
    timestamp: DateTime<Utc>,
    compaction_metadata: Option<CompactionMetadata>,
}

impl EntryBuilder {
    pub fn new(session_id: impl Into<String>, kind: EntryKind) -> Self {
        EntryBuilder {
            session_id: session_id.into(),
            kind,
            parent_id: None,
            logical_parent_id: None,
            payload: Value::Object(Map::new()),
            timestamp: Utc::now(),
            compaction_metadata: None,
        }
    }

    /// Set the physical parent. The logical parent follows it.
    pub fn with_parent(mut self, parent: Option<EntryId>) -> Self {
        self.logical_parent_id = parent.clone();
        self.parent_id = parent;
        self
    }

    /// Override the logical parent independently of the physical one.
    pub fn with_logical_parent(mut self, parent: Option<EntryId>) -> Self {
        self.logical_parent_id = parent;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_compaction_metadata(mut self, metadata: CompactionMetadata) -> Self {
        self.compaction_metadata = Some(metadata);
        self
    }

    pub fn build(self) -> Entry {
        Entry {
            id: EntryId::generate(),
            session_id: self.session_id,
            kind: self.kind,
            parent_id: self.parent_id,
            logical_parent_id: self.logical_parent_id,
            payload: self.payload,
            timestamp: self.timestamp,
            compaction_metadata: self.compaction_metadata,
        }
    }

    /// Build a boundary entry that severs the physical chain after `old_cursor`.
    pub fn boundary(
        session_id: impl Into<String>,
        old_cursor: Option<EntryId>,
        metadata: CompactionMetadata,
        timestamp: DateTime<Utc>,
    ) -> Entry {
        EntryBuilder::new(session_id, EntryKind::Boundary)
            .with_parent(None)
            .with_logical_parent(old_cursor)
            .with_payload(json!({ "text": "Conversation compacted" }))
            .with_timestamp(timestamp)
            .with_compaction_metadata(metadata)
            .build()
    }

    /// Build the user-kind summary entry that follows a boundary.
    pub fn summary(boundary: &Entry, summary_text: &str) -> Entry {
        EntryBuilder::new(boundary.session_id.clone(), EntryKind::User)
            .with_parent(Some(boundary.id.clone()))
            .with_payload(json!({ "text": summary_text, "is_compact_summary": true }))
            .with_timestamp(boundary.timestamp)
            .build()
    }
}
