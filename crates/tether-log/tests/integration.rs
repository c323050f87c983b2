//! Integration tests for the session log store.
//!
//! These tests verify:
//! - Logical continuity across any number of compactions
//! - Readers never observe a partially rewritten log, even across threads
//! - A failed rewrite leaves the session untouched
//! - Persistence and reload through the JSONL backend
//! - Concurrent appends serialize into one consistent chain

use proptest::prelude::*;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_log::{
    CompactionTrigger, Entry, EntryId, EntryKind, JsonlBackend, LoadedSession, LogBackend,
    LogStore, MemoryBackend, StoreConfig, StoreError,
};

/// Backend wrapper whose rewrites always fail.
mod failing {
    use super::*;

    pub struct FailingRewriteBackend {
        pub inner: MemoryBackend,
        pub fail: AtomicBool,
    }

    impl FailingRewriteBackend {
        pub fn new() -> Self {
            FailingRewriteBackend {
                inner: MemoryBackend::new(),
                fail: AtomicBool::new(true),
            }
        }
    }

    impl LogBackend for FailingRewriteBackend {
        fn load(&self) -> tether_log::Result<Vec<LoadedSession>> {
            self.inner.load()
        }

        fn create(&self, session_id: &str) -> tether_log::Result<()> {
            self.inner.create(session_id)
        }

        fn append(&self, session_id: &str, entry: &Entry) -> tether_log::Result<()> {
            self.inner.append(session_id, entry)
        }

        fn rewrite(
            &self,
            session_id: &str,
            retained: &[Entry],
            removed: &[Entry],
        ) -> tether_log::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Io("disk full".into()));
            }
            self.inner.rewrite(session_id, retained, removed)
        }

        fn delete(&self, session_id: &str) -> tether_log::Result<()> {
            self.inner.delete(session_id)
        }
    }
}

fn text(s: &str) -> serde_json::Value {
    json!({ "text": s })
}

fn compact(store: &LogStore, session_id: &str, summary: &str) -> tether_log::PrefixCompaction {
    let lease = store.leases().try_acquire(session_id, "test").unwrap();
    let pre = store.entry_count(session_id).unwrap() as u64;
    store
        .compact_prefix(&lease, summary, pre, CompactionTrigger::Manual)
        .unwrap()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_compaction_keeps_logical_chain() {
    let store = LogStore::in_memory();

    let first = store
        .append_creating("s1", EntryKind::User, text("start"))
        .await
        .unwrap();
    for i in 0..9 {
        store
            .append("s1", EntryKind::Assistant, text(&i.to_string()))
            .await
            .unwrap();
    }
    let before = store.session_info("s1").unwrap();

    let result = compact(&store, "s1", "ten messages");
    assert_eq!(result.removed, 10);
    assert_eq!(result.boundary.logical_parent_id, before.cursor);

    // Compacting the already minimal log is still allowed
    let again = compact(&store, "s1", "still ten messages");
    assert_eq!(again.removed, 2);
    assert_eq!(again.boundary.logical_parent_id, Some(result.summary.id.clone()));
    assert_eq!(store.entry_count("s1").unwrap(), 2);
    assert_eq!(store.session_info("s1").unwrap().compactions, 2);

    let chain = store.logical_chain("s1").unwrap();
    assert_eq!(chain.len(), 10 + 2 + 2);
    assert_eq!(chain.last().unwrap().id, first.id);

    // Exactly one physical root
    let roots = store
        .read_range("s1", None, None)
        .unwrap()
        .filter(|e| e.parent_id.is_none())
        .count();
    assert_eq!(roots, 1);
}

#[tokio::test]
async fn test_reader_sees_whole_version() {
    let store = LogStore::in_memory();
    for i in 0..20 {
        store
            .append_creating("s1", EntryKind::User, text(&i.to_string()))
            .await
            .unwrap();
    }

    let mut reader = store.read_range("s1", None, None).unwrap();
    let head: Vec<Entry> = reader.by_ref().take(5).collect();

    compact(&store, "s1", "summary");

    let tail: Vec<Entry> = reader.collect();
    assert_eq!(head.len() + tail.len(), 20);
    assert!(tail.iter().all(|e| !e.is_boundary()));

    let after: Vec<Entry> = store.read_range("s1", None, None).unwrap().collect();
    assert_eq!(after.len(), 2);
    assert!(after[0].is_boundary());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_never_mix_versions_under_load() {
    let store = Arc::new(LogStore::in_memory());
    let first = store
        .append_creating("s1", EntryKind::User, text("start"))
        .await
        .unwrap();
    let done = Arc::new(AtomicBool::new(false));

    let writer = {
        let store = store.clone();
        tokio::spawn(async move {
            for i in 0..300 {
                store
                    .append("s1", EntryKind::Assistant, text(&i.to_string()))
                    .await
                    .unwrap();
            }
        })
    };
    let compactor = {
        let store = store.clone();
        tokio::spawn(async move {
            for round in 0..20 {
                let lease = store
                    .leases()
                    .acquire("s1", "compactor", Duration::from_secs(5))
                    .await
                    .unwrap();
                let pre = store.entry_count("s1").unwrap() as u64;
                store
                    .compact_prefix(&lease, &format!("round {}", round), pre, CompactionTrigger::Auto)
                    .unwrap();
                drop(lease);
                tokio::task::yield_now().await;
            }
        })
    };

    let mut readers = Vec::new();
    for _ in 0..3 {
        let store = store.clone();
        let done = done.clone();
        let first_id = first.id.clone();
        readers.push(tokio::spawn(async move {
            let mut reads = 0;
            while !done.load(Ordering::SeqCst) || reads == 0 {
                let entries: Vec<Entry> = store.read_range("s1", None, None).unwrap().collect();
                reads += 1;

                // One physical version: either the untouched original chain or
                // a boundary and its summary followed only by later appends.
                if entries[0].is_boundary() {
                    assert!(entries[1].is_compact_summary());
                    assert!(entries[1..].iter().all(|e| !e.is_boundary()));
                } else {
                    assert_eq!(entries[0].id, first_id);
                    assert!(entries.iter().all(|e| !e.is_boundary() && !e.is_compact_summary()));
                }
                assert_eq!(entries.iter().filter(|e| e.parent_id.is_none()).count(), 1);
                for pair in entries.windows(2) {
                    assert_eq!(pair[1].parent_id.as_ref(), Some(&pair[0].id));
                }
                tokio::task::yield_now().await;
            }
            reads
        }));
    }

    writer.await.unwrap();
    compactor.await.unwrap();
    done.store(true, Ordering::SeqCst);
    for reader in readers {
        assert!(reader.await.unwrap() > 0);
    }
    assert_eq!(store.session_info("s1").unwrap().compactions, 20);
}

#[tokio::test]
async fn test_failed_rewrite_leaves_session_untouched() {
    let backend = Arc::new(failing::FailingRewriteBackend::new());
    let store = LogStore::open(backend.clone(), StoreConfig::default()).unwrap();

    for i in 0..5 {
        store
            .append_creating("s1", EntryKind::User, text(&i.to_string()))
            .await
            .unwrap();
    }
    let before: Vec<Entry> = store.read_range("s1", None, None).unwrap().collect();

    let lease = store.leases().try_acquire("s1", "test").unwrap();
    let result = store.compact_prefix(&lease, "summary", 5, CompactionTrigger::Auto);
    assert!(matches!(result, Err(StoreError::Io(_))));
    drop(lease);

    let after: Vec<Entry> = store.read_range("s1", None, None).unwrap().collect();
    assert_eq!(before, after);
    assert_eq!(store.session_info("s1").unwrap().compactions, 0);
    assert_eq!(store.logical_chain("s1").unwrap().len(), 5);
    assert_eq!(backend.inner.persisted_len("s1"), 5);
}

#[tokio::test]
async fn test_reload_from_jsonl() {
    let dir = tempfile::tempdir().unwrap();
    let first_id;
    let cursor;
    {
        let backend = Arc::new(JsonlBackend::open(dir.path()).unwrap().with_fsync(false));
        let store = LogStore::open(backend, StoreConfig::default()).unwrap();

        first_id = store
            .append_creating("voice-1", EntryKind::User, text("turn on the lights"))
            .await
            .unwrap()
            .id;
        store
            .append("voice-1", EntryKind::Assistant, text("done"))
            .await
            .unwrap();
        compact(&store, "voice-1", "lights discussed");
        cursor = store
            .append("voice-1", EntryKind::User, text("thanks"))
            .await
            .unwrap()
            .id;
    }

    let backend = Arc::new(JsonlBackend::open(dir.path()).unwrap());
    let store = LogStore::open(backend, StoreConfig::default()).unwrap();

    let info = store.session_info("voice-1").unwrap();
    assert_eq!(info.entry_count, 3);
    assert_eq!(info.cursor, Some(cursor.clone()));
    assert_eq!(info.compactions, 1);

    // Delta reads keep working against ids issued before the restart
    let boundary = store.read_range("voice-1", None, Some(1)).unwrap().next().unwrap();
    let tail: Vec<EntryId> = store
        .read_range("voice-1", Some(&boundary.id), None)
        .unwrap()
        .map(|e| e.id)
        .collect();
    assert_eq!(tail.len(), 2);
    assert_eq!(tail[1], cursor);

    let chain = store.logical_chain("voice-1").unwrap();
    assert_eq!(chain.len(), 5);
    assert_eq!(chain.last().unwrap().id, first_id);

    // Appends continue the physical chain after reload
    let next = store
        .append("voice-1", EntryKind::Assistant, text("you're welcome"))
        .await
        .unwrap();
    assert_eq!(next.parent_id, Some(cursor));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_appends_serialize() {
    let store = Arc::new(LogStore::in_memory());
    store.create_session("s1").unwrap();

    let mut handles = Vec::new();
    for writer in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..25 {
                store
                    .append("s1", EntryKind::User, text(&format!("{}-{}", writer, i)))
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let entries: Vec<Entry> = store.read_range("s1", None, None).unwrap().collect();
    assert_eq!(entries.len(), 200);
    for pair in entries.windows(2) {
        assert_eq!(pair[1].parent_id.as_ref(), Some(&pair[0].id));
        assert!(pair[1].timestamp >= pair[0].timestamp);
    }
}

#[derive(Clone, Debug)]
enum Op {
    Append,
    Compact,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![4 => Just(Op::Append), 1 => Just(Op::Compact)]
}

proptest! {
    #[test]
    fn logical_chain_reaches_first_entry(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let rt = runtime();
        rt.block_on(async {
            let store = LogStore::in_memory();
            store.create_session("p").unwrap();

            let mut first: Option<EntryId> = None;
            let mut created = 0usize;

            for op in &ops {
                match op {
                    Op::Append => {
                        let entry = store.append("p", EntryKind::User, text("x")).await.unwrap();
                        first.get_or_insert(entry.id);
                        created += 1;
                    }
                    Op::Compact => {
                        let result = compact(&store, "p", "summary");
                        first.get_or_insert(result.boundary.id);
                        created += 2;
                    }
                }
            }

            let chain = store.logical_chain("p").unwrap();
            prop_assert_eq!(chain.len(), created);
            prop_assert_eq!(&chain.last().unwrap().id, first.as_ref().unwrap());

            let physical = store.entry_count("p").unwrap();
            prop_assert!(physical <= created);
            Ok(())
        })?;
    }
}
