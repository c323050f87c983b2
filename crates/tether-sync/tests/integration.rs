//! Integration tests for the sync transport and connection manager.
//!
//! These tests verify:
//! - Delta sync and resumption, including across a server restart
//! - Appends to missing sessions are rejected without side effects
//! - Compaction requests over the wire, including in-progress rejection
//! - A compaction interrupted by a dropped link is reconciled, never re-issued
//! - Acknowledged delivery with retransmission
//! - Authentication, malformed messages and heartbeat-driven reconnects

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tether_compaction::{
    CompactionEngine, DigestSummarizer, Summarizer, SummarizerError, Summary,
};
use tether_log::{Entry, EntryId, EntryKind, JsonlBackend, LogStore, StoreConfig};
use tether_sync::{
    ClientConfig, ClientConfigBuilder, ClientEvent, ClientMessage, CompactionRequestState,
    Connection, Connector, ConnectionState, LinkQuality, MemoryNetwork, ServerMessage,
    SyncClient, SyncServer, SyncServerConfig, SyncServerConfigBuilder, WsConnector,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

/// Blocks inside `summarize` until released.
struct GatedSummarizer {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl Summarizer for GatedSummarizer {
    async fn summarize(
        &self,
        session_id: &str,
        entries: &[Entry],
    ) -> Result<Summary, SummarizerError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(Summary {
            text: format!("{} entries of {}", entries.len(), session_id),
            pre_tokens: Some(1_000),
        })
    }
}

struct Harness {
    store: Arc<LogStore>,
    engine: Arc<CompactionEngine>,
    network: Arc<MemoryNetwork>,
    _serve: JoinHandle<()>,
}

impl Harness {
    fn new(store: Arc<LogStore>, summarizer: Arc<dyn Summarizer>, config: SyncServerConfig) -> Self {
        let engine = Arc::new(CompactionEngine::new(store.clone(), summarizer));
        let server = Arc::new(SyncServer::new(store.clone(), engine.clone(), config));
        let (network, incoming) = MemoryNetwork::new();
        let serve = tokio::spawn(server.serve(incoming));
        Harness {
            store,
            engine,
            network,
            _serve: serve,
        }
    }

    fn in_memory() -> Self {
        Self::new(
            Arc::new(LogStore::in_memory()),
            Arc::new(DigestSummarizer::new()),
            SyncServerConfig::default(),
        )
    }

    fn gated() -> (Self, Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let summarizer = GatedSummarizer {
            entered: entered.clone(),
            release: release.clone(),
        };
        let harness = Self::new(
            Arc::new(LogStore::in_memory()),
            Arc::new(summarizer),
            SyncServerConfig::default(),
        );
        (harness, entered, release)
    }

    async fn client(&self) -> SyncClient {
        let client = SyncClient::spawn(self.network.clone(), client_config());
        connected(&client).await;
        client
    }

    async fn seed(&self, session_id: &str, count: usize) {
        seed_store(&self.store, session_id, count).await;
    }

    fn log(&self, session_id: &str) -> Vec<Entry> {
        self.store.read_range(session_id, None, None).unwrap().collect()
    }
}

async fn seed_store(store: &LogStore, session_id: &str, count: usize) {
    for i in 0..count {
        store
            .append_creating(session_id, EntryKind::User, json!({ "text": format!("turn {}", i) }))
            .await
            .unwrap();
    }
}

fn client_config() -> ClientConfig {
    ClientConfigBuilder::new()
        .backoff(10, 50)
        .ping_interval(50)
        .build()
}

fn ids(entries: &[Entry]) -> Vec<EntryId> {
    entries.iter().map(|e| e.id.clone()).collect()
}

async fn connected(client: &SyncClient) {
    tokio::time::timeout(WAIT, client.wait_for_state(|s| s.is_connected()))
        .await
        .expect("client never connected");
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn next_event(
    events: &mut broadcast::Receiver<ClientEvent>,
    mut predicate: impl FnMut(&ClientEvent) -> bool,
) -> ClientEvent {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    };
    tokio::time::timeout(WAIT, wait)
        .await
        .expect("timed out waiting for event")
}

/// Next non-heartbeat message on a raw connection.
async fn recv_message(conn: &mut Connection) -> Option<ServerMessage> {
    loop {
        let frame = tokio::time::timeout(WAIT, conn.recv())
            .await
            .expect("timed out waiting for frame")?;
        match ServerMessage::decode(&frame).unwrap() {
            ServerMessage::Heartbeat { .. } => continue,
            message => return Some(message),
        }
    }
}

async fn send_message(conn: &Connection, message: ClientMessage) {
    conn.send(message.encode().unwrap()).await.unwrap();
}

async fn recv_entry(conn: &mut Connection, ack: bool) -> Entry {
    match recv_message(conn).await {
        Some(ServerMessage::Entry { msg_id, entry }) => {
            if ack {
                send_message(conn, ClientMessage::Ack { msg_id }).await;
            }
            entry
        }
        other => panic!("expected entry, got {:?}", other),
    }
}

#[tokio::test]
async fn test_delta_sync_and_resume() {
    let h = Harness::in_memory();
    h.seed("s1", 5).await;

    let client = h.client().await;
    client.watch("s1").await.unwrap();
    eventually("initial sync", || client.entries("s1").map(|e| e.len()) == Some(5)).await;

    client
        .append("s1", EntryKind::Assistant, json!({"text": "from client"}), false)
        .await
        .unwrap();
    eventually("live tail", || client.entries("s1").map(|e| e.len()) == Some(6)).await;

    // Go offline and let the log move on without us
    h.network.set_reachable(false);
    h.network.sever_all();
    tokio::time::timeout(WAIT, client.wait_for_state(|s| !s.is_connected()))
        .await
        .unwrap();
    h.seed("s1", 3).await;

    h.network.set_reachable(true);
    client.connect_now();
    connected(&client).await;
    eventually("resumed sync", || client.entries("s1").map(|e| e.len()) == Some(9)).await;

    let cached = client.entries("s1").unwrap();
    assert_eq!(ids(&cached), ids(&h.log("s1")));
    assert_eq!(cached[5].text(), Some("from client"));
    assert_eq!(client.last_message_id("s1"), h.store.session_info("s1").unwrap().cursor);
}

#[tokio::test]
async fn test_append_to_missing_session() {
    let h = Harness::in_memory();
    let client = h.client().await;
    let mut events = client.events();

    client
        .append("ghost", EntryKind::User, json!({"text": "hello?"}), false)
        .await
        .unwrap();
    let event = next_event(&mut events, |e| matches!(e, ClientEvent::Error { .. })).await;
    assert_eq!(
        event,
        ClientEvent::Error {
            code: "session_not_found".into(),
            message: "Session not found: ghost".into(),
            session_id: Some("ghost".into()),
        }
    );
    assert!(!h.store.exists("ghost"));

    client
        .append("ghost", EntryKind::User, json!({"text": "hello?"}), true)
        .await
        .unwrap();
    eventually("created session", || h.store.entry_count("ghost").ok() == Some(1)).await;
}

#[tokio::test]
async fn test_compaction_over_the_wire() {
    let h = Harness::in_memory();
    h.seed("s1", 150).await;

    let client = h.client().await;
    let mut events = client.events();
    client.watch("s1").await.unwrap();
    eventually("initial sync", || client.entries("s1").map(|e| e.len()) == Some(150)).await;

    let request_id = client.compact_session("s1").await.unwrap();
    let event = next_event(&mut events, |e| {
        matches!(e, ClientEvent::CompactionCompleted { .. })
    })
    .await;

    let ClientEvent::CompactionCompleted {
        request_id: answered,
        report,
        ..
    } = event
    else {
        unreachable!()
    };
    assert_eq!(answered, request_id);
    assert_eq!(report.old_message_count, 150);
    assert_eq!(report.new_message_count, 2);
    assert_eq!(report.messages_removed, 148);
    assert_eq!(
        client.compaction(&request_id),
        Some(CompactionRequestState::Completed(report))
    );

    eventually("rebased cache", || client.entries("s1").map(|e| e.len()) == Some(2)).await;
    let cached = client.entries("s1").unwrap();
    assert!(cached[0].is_boundary());
    assert!(cached[1].is_compact_summary());
    assert_eq!(ids(&cached), ids(&h.log("s1")));
}

#[tokio::test]
async fn test_second_compaction_rejected_in_flight() {
    let (h, entered, release) = Harness::gated();
    h.seed("s1", 10).await;

    let client = h.client().await;
    let mut events = client.events();
    client.watch("s1").await.unwrap();

    let first = client.compact_session("s1").await.unwrap();
    entered.notified().await;
    let second = client.compact_session("s1").await.unwrap();

    let event = next_event(&mut events, |e| matches!(e, ClientEvent::CompactionFailed { .. })).await;
    assert_eq!(
        event,
        ClientEvent::CompactionFailed {
            session_id: "s1".into(),
            request_id: second.clone(),
            error: "compaction_in_progress".into(),
        }
    );
    assert_eq!(client.compaction(&first), Some(CompactionRequestState::Pending));

    release.notify_one();
    next_event(&mut events, |e| {
        matches!(e, ClientEvent::CompactionCompleted { request_id, .. } if *request_id == first)
    })
    .await;
    assert_eq!(h.store.session_info("s1").unwrap().compactions, 1);
}

#[tokio::test]
async fn test_interrupted_compaction_is_reconciled() {
    let (h, entered, release) = Harness::gated();
    h.seed("s1", 10).await;

    let client = h.client().await;
    let mut events = client.events();
    client.watch("s1").await.unwrap();
    eventually("initial sync", || client.entries("s1").map(|e| e.len()) == Some(10)).await;

    let request_id = client.compact_session("s1").await.unwrap();
    entered.notified().await;

    // The link drops after summarizing started, before any answer
    h.network.set_reachable(false);
    h.network.sever_all();
    next_event(&mut events, |e| matches!(e, ClientEvent::CompactionUnresolved { .. })).await;
    assert_eq!(
        client.compaction(&request_id),
        Some(CompactionRequestState::Unresolved)
    );

    // The server finishes the compaction on its own
    release.notify_one();
    eventually("server commit", || {
        h.store.session_info("s1").unwrap().compactions == 1
    })
    .await;

    h.network.set_reachable(true);
    client.connect_now();
    let event = next_event(&mut events, |e| matches!(e, ClientEvent::CompactionReconciled { .. })).await;

    let boundary_id = h.log("s1")[0].id.clone();
    assert_eq!(
        event,
        ClientEvent::CompactionReconciled {
            session_id: "s1".into(),
            request_id: request_id.clone(),
            boundary_id: boundary_id.clone(),
        }
    );
    assert_eq!(
        client.compaction(&request_id),
        Some(CompactionRequestState::Reconciled { boundary_id })
    );

    eventually("rebased cache", || client.entries("s1").map(|e| e.len()) == Some(2)).await;
    assert_eq!(ids(&client.entries("s1").unwrap()), ids(&h.log("s1")));

    // Never re-issued
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.engine.stats().started, 1);
    assert_eq!(h.store.session_info("s1").unwrap().compactions, 1);
}

#[tokio::test]
async fn test_auth() {
    let config = SyncServerConfigBuilder::new()
        .auth_token(Some("secret".into()))
        .build();
    let h = Harness::new(
        Arc::new(LogStore::in_memory()),
        Arc::new(DigestSummarizer::new()),
        config,
    );

    let intruder = SyncClient::spawn(
        h.network.clone(),
        ClientConfigBuilder::new().token("guess").backoff(10, 50).build(),
    );
    let state = tokio::time::timeout(WAIT, intruder.wait_for_state(|s| *s == ConnectionState::Dead))
        .await
        .unwrap();
    assert_eq!(state, ConnectionState::Dead);

    let member = SyncClient::spawn(
        h.network.clone(),
        ClientConfigBuilder::new().token("secret").backoff(10, 50).build(),
    );
    connected(&member).await;
    assert_eq!(member.state(), ConnectionState::Connected(LinkQuality::Healthy));
}

#[tokio::test]
async fn test_malformed_messages_keep_connection_open() {
    let h = Harness::in_memory();
    let mut conn = h.network.connect().await.unwrap();
    assert!(matches!(
        recv_message(&mut conn).await,
        Some(ServerMessage::Connected { .. })
    ));

    conn.send(r#"{"type":"unknown"}"#.into()).await.unwrap();
    match recv_message(&mut conn).await {
        Some(ServerMessage::Error { code, .. }) => assert_eq!(code, "malformed_message"),
        other => panic!("expected error, got {:?}", other),
    }

    conn.send(r#"{"type":"append","session_id":"s1","kind":"robot","payload":{}}"#.into())
        .await
        .unwrap();
    match recv_message(&mut conn).await {
        Some(ServerMessage::Error {
            code, session_id, ..
        }) => {
            assert_eq!(code, "malformed_message");
            assert_eq!(session_id.as_deref(), Some("s1"));
        }
        other => panic!("expected error, got {:?}", other),
    }

    send_message(&conn, ClientMessage::Ping { nonce: Some(7) }).await;
    assert_eq!(
        recv_message(&mut conn).await,
        Some(ServerMessage::Pong { nonce: Some(7) })
    );
}

#[tokio::test]
async fn test_unacked_entries_are_retransmitted() {
    let config = SyncServerConfigBuilder::new()
        .ack_timeout(50)
        .max_retries(2)
        .build();
    let h = Harness::new(
        Arc::new(LogStore::in_memory()),
        Arc::new(DigestSummarizer::new()),
        config,
    );
    h.seed("s1", 1).await;

    let mut conn = h.network.connect().await.unwrap();
    recv_message(&mut conn).await;
    send_message(
        &conn,
        ClientMessage::Subscribe {
            session_id: "s1".into(),
            last_message_id: None,
        },
    )
    .await;

    let first = recv_message(&mut conn).await.unwrap();
    let again = recv_message(&mut conn).await.unwrap();
    assert_eq!(first, again);
    assert_eq!(first.msg_id(), Some(1));

    // Never acknowledging exhausts the retries and the server hangs up
    loop {
        match tokio::time::timeout(WAIT, conn.recv()).await.unwrap() {
            Some(_) => continue,
            None => break,
        }
    }
}

#[tokio::test]
async fn test_resume_across_server_restart() {
    let dir = tempfile::tempdir().unwrap();
    let open_store = || {
        let backend = Arc::new(JsonlBackend::open(dir.path()).unwrap().with_fsync(false));
        Arc::new(LogStore::open(backend, StoreConfig::default()).unwrap())
    };

    let cursor;
    let expected: Vec<EntryId>;
    {
        let h = Harness::new(
            open_store(),
            Arc::new(DigestSummarizer::new()),
            SyncServerConfig::default(),
        );
        h.seed("s1", 5).await;
        expected = ids(&h.log("s1"));

        let mut conn = h.network.connect().await.unwrap();
        recv_message(&mut conn).await;
        send_message(
            &conn,
            ClientMessage::Subscribe {
                session_id: "s1".into(),
                last_message_id: None,
            },
        )
        .await;
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(recv_entry(&mut conn, true).await.id);
        }
        assert_eq!(seen, expected[..3].to_vec());
        cursor = seen[2].clone();
        h.network.sever_all();
    }

    let h = Harness::new(
        open_store(),
        Arc::new(DigestSummarizer::new()),
        SyncServerConfig::default(),
    );
    let mut conn = h.network.connect().await.unwrap();
    recv_message(&mut conn).await;
    send_message(
        &conn,
        ClientMessage::Subscribe {
            session_id: "s1".into(),
            last_message_id: Some(cursor),
        },
    )
    .await;

    let mut resumed = Vec::new();
    for _ in 0..2 {
        resumed.push(recv_entry(&mut conn, true).await.id);
    }
    assert_eq!(resumed, expected[3..].to_vec());

    // Live entries continue the same chain
    h.seed("s1", 2).await;
    let live_a = recv_entry(&mut conn, true).await;
    let live_b = recv_entry(&mut conn, true).await;
    assert_eq!(live_a.parent_id.as_ref(), Some(&expected[4]));
    assert_eq!(live_b.parent_id.as_ref(), Some(&live_a.id));
}

#[tokio::test]
async fn test_silent_server_degrades_then_reconnects() {
    let (network, mut incoming) = MemoryNetwork::new();
    let config = ClientConfigBuilder::new()
        .backoff(10, 20)
        .ping_interval(20)
        .degraded_after(4.0, 40)
        .server_heartbeat_tolerance(2.0)
        .build();
    let client = SyncClient::spawn(network.clone(), config);

    // A server that completes the handshake and then never speaks again
    let mut first = tokio::time::timeout(WAIT, incoming.recv())
        .await
        .unwrap()
        .unwrap();
    let hello = first.recv().await.unwrap();
    assert!(matches!(
        ClientMessage::decode(&hello).unwrap(),
        ClientMessage::Hello { .. }
    ));
    first
        .send(
            ServerMessage::Connected {
                heartbeat_interval_ms: 300,
            }
            .encode()
            .unwrap(),
        )
        .await
        .unwrap();
    connected(&client).await;

    tokio::time::timeout(
        WAIT,
        client.wait_for_state(|s| *s == ConnectionState::Connected(LinkQuality::Degraded)),
    )
    .await
    .unwrap();

    // Missing heartbeats force a fresh connection
    let second = tokio::time::timeout(WAIT, incoming.recv()).await.unwrap();
    assert!(second.is_some());
    drop(first);
}

#[tokio::test]
async fn test_gives_up_after_max_attempts() {
    let (network, _incoming) = MemoryNetwork::new();
    network.set_reachable(false);

    let client = SyncClient::spawn(
        network.clone(),
        ClientConfigBuilder::new()
            .backoff(5, 10)
            .max_reconnect_attempts(2)
            .build(),
    );
    let state = tokio::time::timeout(WAIT, client.wait_for_state(|s| *s == ConnectionState::Dead))
        .await
        .unwrap();
    assert_eq!(state, ConnectionState::Dead);
}

#[tokio::test]
async fn test_replies_flow_while_large_delta_streams() {
    let h = Harness::in_memory();
    h.seed("big", 3000).await;

    let mut conn = h.network.connect().await.unwrap();
    recv_message(&mut conn).await;
    send_message(
        &conn,
        ClientMessage::Subscribe {
            session_id: "big".into(),
            last_message_id: None,
        },
    )
    .await;
    // Let the delta fill every queue between server and client
    tokio::time::sleep(Duration::from_millis(300)).await;

    send_message(
        &conn,
        ClientMessage::Subscribe {
            session_id: "missing".into(),
            last_message_id: None,
        },
    )
    .await;
    send_message(
        &conn,
        ClientMessage::Append {
            session_id: "missing".into(),
            kind: EntryKind::User,
            payload: json!({"text": "lost"}),
            create: false,
        },
    )
    .await;
    send_message(&conn, ClientMessage::Ping { nonce: Some(42) }).await;

    let mut entries = HashSet::new();
    let mut errors = 0;
    let mut pong = false;
    while !(pong && errors == 2 && entries.len() == 3000) {
        match recv_message(&mut conn).await {
            Some(ServerMessage::Entry { msg_id, entry }) => {
                entries.insert(entry.id);
                send_message(&conn, ClientMessage::Ack { msg_id }).await;
            }
            Some(ServerMessage::Error {
                code, session_id, ..
            }) => {
                assert_eq!(code, "session_not_found");
                assert_eq!(session_id.as_deref(), Some("missing"));
                errors += 1;
            }
            Some(ServerMessage::Pong { nonce }) => {
                assert_eq!(nonce, Some(42));
                pong = true;
            }
            other => panic!("unexpected message {:?}", other),
        }
    }
    assert!(!h.store.exists("missing"));
}

#[tokio::test]
async fn test_heartbeat_interval_zero_is_clamped() {
    let config = SyncServerConfigBuilder::new().heartbeat_interval(0).build();
    let h = Harness::new(
        Arc::new(LogStore::in_memory()),
        Arc::new(DigestSummarizer::new()),
        config,
    );

    let mut conn = h.network.connect().await.unwrap();
    let frame = tokio::time::timeout(WAIT, conn.recv()).await.unwrap().unwrap();
    assert_eq!(
        ServerMessage::decode(&frame).unwrap(),
        ServerMessage::Connected {
            heartbeat_interval_ms: 1
        }
    );
    let frame = tokio::time::timeout(WAIT, conn.recv()).await.unwrap().unwrap();
    assert!(matches!(
        ServerMessage::decode(&frame).unwrap(),
        ServerMessage::Heartbeat { interval_ms: 1, .. }
    ));
}

#[tokio::test]
async fn test_websocket_transport() {
    let store = Arc::new(LogStore::in_memory());
    seed_store(&store, "s1", 10).await;
    let engine = Arc::new(CompactionEngine::new(
        store.clone(),
        Arc::new(DigestSummarizer::new()),
    ));
    let server = Arc::new(SyncServer::new(
        store.clone(),
        engine,
        SyncServerConfig::default(),
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serve = tokio::spawn(tether_sync::ws::serve(listener, server));

    let connector = WsConnector::new(format!("ws://{}", addr));
    let client = SyncClient::spawn(Arc::new(connector), client_config());
    connected(&client).await;
    let mut events = client.events();

    client.watch("s1").await.unwrap();
    eventually("initial sync", || client.entries("s1").map(|e| e.len()) == Some(10)).await;

    client
        .append("s1", EntryKind::Assistant, json!({"text": "over the socket"}), false)
        .await
        .unwrap();
    eventually("live tail", || client.entries("s1").map(|e| e.len()) == Some(11)).await;
    assert_eq!(store.entry_count("s1").unwrap(), 11);

    let request_id = client.compact_session("s1").await.unwrap();
    let event = next_event(&mut events, |e| {
        matches!(e, ClientEvent::CompactionCompleted { .. })
    })
    .await;
    let ClientEvent::CompactionCompleted {
        request_id: answered,
        report,
        ..
    } = event
    else {
        unreachable!()
    };
    assert_eq!(answered, request_id);
    assert_eq!(report.old_message_count, 11);
    assert_eq!(report.new_message_count, 2);

    eventually("rebased cache", || client.entries("s1").map(|e| e.len()) == Some(2)).await;
    let expected: Vec<EntryId> = store
        .read_range("s1", None, None)
        .unwrap()
        .map(|e| e.id)
        .collect();
    assert_eq!(ids(&client.entries("s1").unwrap()), expected);

    client.shutdown().await;
    assert!(matches!(
        client.append("s1", EntryKind::User, json!({"text": "late"}), false).await,
        Err(tether_sync::SyncError::Shutdown)
    ));
    serve.abort();
}
