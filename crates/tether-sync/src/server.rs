//! The sync server.
//!
//! One handler task runs per connection. It owns the connection's
//! [`Outbox`], answers control messages inline, queues appends on a per
//! connection worker so they keep their order, and spawns one tail task per
//! subscribed session. Compactions run on detached tasks and finish even if
//! the requesting client goes away.

use crate::error::{NetworkError, Result, SyncError};
use crate::network::{Connection, FrameSender};
use crate::outbox::{Outbox, Retransmit, RetryPolicy};
use crate::protocol::{decode_client_frame, sniff_session_id, ClientMessage, ServerMessage};
use async_stream::stream;
use chrono::Utc;
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_compaction::CompactionEngine;
use tether_log::{Entry, EntryId, EntryKind, LogStore, StoreError, StoreEvent};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Configuration for the sync server.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncServerConfig {
    /// Interval of server heartbeats, advertised in `connected`.
    pub heartbeat_interval_ms: u64,
    /// How long a new connection may take to send `hello`.
    pub hello_timeout_ms: u64,
    /// How long to wait for an ack before resending a reliable message.
    pub ack_timeout_ms: u64,
    /// Resends after which a connection is abandoned.
    pub max_retries: u32,
    /// Shared secret clients must present in `hello`. `None` disables auth.
    pub auth_token: Option<String>,
    /// Capacity of each connection's outbound and append queues.
    pub queue_capacity: usize,
}

impl Default for SyncServerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 15_000,
            hello_timeout_ms: 10_000,
            ack_timeout_ms: 5_000,
            max_retries: 5,
            auth_token: None,
            queue_capacity: 256,
        }
    }
}

impl SyncServerConfig {
    /// Heartbeat period, never shorter than one millisecond.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            max_retries: self.max_retries,
        }
    }
}

/// Builder for server configuration.
pub struct SyncServerConfigBuilder {
    config: SyncServerConfig,
}

impl SyncServerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncServerConfig::default(),
        }
    }

    pub fn heartbeat_interval(mut self, ms: u64) -> Self {
        self.config.heartbeat_interval_ms = ms;
        self
    }

    pub fn hello_timeout(mut self, ms: u64) -> Self {
        self.config.hello_timeout_ms = ms;
        self
    }

    pub fn ack_timeout(mut self, ms: u64) -> Self {
        self.config.ack_timeout_ms = ms;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn auth_token(mut self, token: Option<String>) -> Self {
        self.config.auth_token = token;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    pub fn build(self) -> SyncServerConfig {
        self.config
    }
}

impl Default for SyncServerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct AppendRequest {
    session_id: String,
    kind: EntryKind,
    payload: Value,
    create: bool,
}

/// Per-connection resources released when the handler exits.
///
/// `out_tx` feeds the handler's own loop, so the loop itself must never wait
/// on it. Unreliable replies go straight to the connection instead.
struct ConnectionContext {
    out_tx: mpsc::Sender<ServerMessage>,
    append_tx: mpsc::Sender<AppendRequest>,
    subscriptions: HashMap<String, JoinHandle<()>>,
}

impl Drop for ConnectionContext {
    fn drop(&mut self) {
        for (_, task) in self.subscriptions.drain() {
            task.abort();
        }
    }
}

/// Serves session logs to sync clients.
pub struct SyncServer {
    store: Arc<LogStore>,
    engine: Arc<CompactionEngine>,
    config: SyncServerConfig,
    connections: AtomicUsize,
}

impl SyncServer {
    pub fn new(
        store: Arc<LogStore>,
        engine: Arc<CompactionEngine>,
        config: SyncServerConfig,
    ) -> Self {
        Self {
            store,
            engine,
            config,
            connections: AtomicUsize::new(0),
        }
    }

    pub fn store(&self) -> &Arc<LogStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<CompactionEngine> {
        &self.engine
    }

    pub fn config(&self) -> &SyncServerConfig {
        &self.config
    }

    /// Number of connections currently being served.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Accept connections until the incoming channel closes.
    pub async fn serve(self: Arc<Self>, mut incoming: mpsc::Receiver<Connection>) {
        while let Some(connection) = incoming.recv().await {
            let server = self.clone();
            tokio::spawn(async move { server.handle(connection).await });
        }
        debug!("connection acceptor closed");
    }

    /// Serve one connection until it closes or is abandoned.
    pub async fn handle(self: Arc<Self>, connection: Connection) {
        let peer = connection.peer().to_string();
        let (sender, mut frames) = connection.split();

        self.connections.fetch_add(1, Ordering::Relaxed);
        info!(peer = %peer, "client connected");

        let result = match self.handshake(&sender, &mut frames).await {
            Ok(()) => self.run(&sender, &mut frames).await,
            Err(e) => Err(e),
        };

        self.connections.fetch_sub(1, Ordering::Relaxed);
        match result {
            Ok(()) => info!(peer = %peer, "client disconnected"),
            Err(e) => warn!(peer = %peer, error = %e, "connection closed"),
        }
    }

    async fn send(&self, sender: &FrameSender, message: &ServerMessage) -> Result<()> {
        sender.send(message.encode()?).await?;
        Ok(())
    }

    /// Without an auth token the welcome goes out immediately; otherwise the
    /// client must open with a matching `hello`.
    async fn handshake(
        &self,
        sender: &FrameSender,
        frames: &mut mpsc::Receiver<String>,
    ) -> Result<()> {
        let connected = ServerMessage::Connected {
            heartbeat_interval_ms: self.config.heartbeat_interval().as_millis() as u64,
        };
        let Some(expected) = self.config.auth_token.as_deref() else {
            return self.send(sender, &connected).await;
        };

        let wait = Duration::from_millis(self.config.hello_timeout_ms);
        let frame = match tokio::time::timeout(wait, frames.recv()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Err(NetworkError::Disconnected.into()),
            Err(_) => return Err(NetworkError::Timeout("no hello received".into()).into()),
        };

        let rejection = match decode_client_frame(&frame) {
            Ok(ClientMessage::Hello { token }) if token.as_deref() == Some(expected) => {
                return self.send(sender, &connected).await;
            }
            Ok(ClientMessage::Hello { .. }) => "invalid token",
            _ => "expected hello",
        };

        let _ = self
            .send(sender, &ServerMessage::error("auth_failure", rejection))
            .await;
        Err(SyncError::AuthFailure(rejection.to_string()))
    }

    async fn run(
        self: &Arc<Self>,
        sender: &FrameSender,
        frames: &mut mpsc::Receiver<String>,
    ) -> Result<()> {
        let capacity = self.config.queue_capacity.max(1);
        let (out_tx, mut out_rx) = mpsc::channel(capacity);
        let (append_tx, append_rx) = mpsc::channel(capacity);
        tokio::spawn(self.clone().append_worker(append_rx, sender.clone()));

        let mut ctx = ConnectionContext {
            out_tx,
            append_tx,
            subscriptions: HashMap::new(),
        };
        let mut outbox = Outbox::new(self.config.retry_policy());

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        let retransmit_every =
            (self.config.retry_policy().ack_timeout / 2).max(Duration::from_millis(10));
        let mut retransmit = tokio::time::interval(retransmit_every);
        retransmit.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = frames.recv() => match frame {
                    Some(text) => self.dispatch(&text, sender, &mut outbox, &mut ctx).await?,
                    None => return Ok(()),
                },
                Some(message) = out_rx.recv() => {
                    let frame = outbox.prepare(message, Instant::now())?;
                    sender.send(frame).await?;
                }
                _ = heartbeat.tick() => {
                    let beat = ServerMessage::Heartbeat {
                        ts: Utc::now(),
                        interval_ms: self.config.heartbeat_interval().as_millis() as u64,
                    };
                    self.send(sender, &beat).await?;
                }
                _ = retransmit.tick() => match outbox.due(Instant::now()) {
                    Retransmit::Resend(frames) => {
                        for frame in frames {
                            debug!(pending = outbox.pending(), "resending unacknowledged message");
                            sender.send(frame).await?;
                        }
                    }
                    Retransmit::Abandon { msg_id } => {
                        return Err(NetworkError::Timeout(format!(
                            "message {} was never acknowledged",
                            msg_id
                        ))
                        .into());
                    }
                },
            }
        }
    }

    async fn dispatch(
        self: &Arc<Self>,
        text: &str,
        sender: &FrameSender,
        outbox: &mut Outbox,
        ctx: &mut ConnectionContext,
    ) -> Result<()> {
        let message = match decode_client_frame(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "rejecting malformed message");
                let reply = ServerMessage::Error {
                    code: e.code().to_string(),
                    message: e.to_string(),
                    session_id: sniff_session_id(text),
                };
                return self.send(sender, &reply).await;
            }
        };

        match message {
            ClientMessage::Hello { .. } => {
                debug!("ignoring repeated hello");
            }
            ClientMessage::Ack { msg_id } => {
                if !outbox.ack(msg_id) {
                    debug!(msg_id, "ack for unknown message");
                }
            }
            ClientMessage::Ping { nonce } => {
                self.send(sender, &ServerMessage::Pong { nonce }).await?;
            }
            ClientMessage::Append {
                session_id,
                kind,
                payload,
                create,
            } => {
                let request = AppendRequest {
                    session_id,
                    kind,
                    payload,
                    create,
                };
                ctx.append_tx
                    .send(request)
                    .await
                    .map_err(|_| NetworkError::SendFailed("append worker stopped".into()))?;
            }
            ClientMessage::CompactSession {
                session_id,
                request_id,
            } => {
                self.spawn_compaction(session_id, request_id, ctx.out_tx.clone());
            }
            ClientMessage::Subscribe {
                session_id,
                last_message_id,
            } => {
                self.subscribe(ctx, sender, session_id, last_message_id).await?;
            }
        }
        Ok(())
    }

    async fn append_worker(
        self: Arc<Self>,
        mut requests: mpsc::Receiver<AppendRequest>,
        replies: FrameSender,
    ) {
        while let Some(request) = requests.recv().await {
            let AppendRequest {
                session_id,
                kind,
                payload,
                create,
            } = request;

            let result = if create {
                self.store.append_creating(&session_id, kind, payload).await
            } else {
                self.store.append(&session_id, kind, payload).await
            };

            match result {
                Ok(_) => self.spawn_auto_compaction(&session_id),
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "append rejected");
                    let reply = ServerMessage::session_error(&session_id, e.code(), e.to_string());
                    if self.send(&replies, &reply).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    fn spawn_auto_compaction(&self, session_id: &str) {
        if !self.engine.should_auto_compact(session_id) {
            return;
        }
        let engine = self.engine.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let _ = engine.maybe_auto_compact(&session_id).await;
        });
    }

    /// Run a compaction on a detached task and report the result to the
    /// requesting connection, if it is still there.
    fn spawn_compaction(
        &self,
        session_id: String,
        request_id: Option<String>,
        out: mpsc::Sender<ServerMessage>,
    ) {
        let engine = self.engine.clone();
        tokio::spawn(async move {
            let message = match engine.compact(&session_id).await {
                Ok(outcome) => ServerMessage::CompactionComplete {
                    msg_id: 0,
                    session_id,
                    request_id,
                    old_message_count: outcome.old_count,
                    new_message_count: outcome.new_count,
                    messages_removed: outcome.messages_removed,
                    pre_tokens: outcome.pre_tokens,
                },
                Err(e) => ServerMessage::CompactionError {
                    msg_id: 0,
                    session_id,
                    request_id,
                    error: e.code().to_string(),
                },
            };
            if out.send(message).await.is_err() {
                debug!("requester disconnected before the compaction finished");
            }
        });
    }

    async fn subscribe(
        &self,
        ctx: &mut ConnectionContext,
        sender: &FrameSender,
        session_id: String,
        last_message_id: Option<EntryId>,
    ) -> Result<()> {
        if let Some(previous) = ctx.subscriptions.remove(&session_id) {
            previous.abort();
        }

        if !self.store.exists(&session_id) {
            let err = StoreError::SessionNotFound(session_id.clone());
            let reply = ServerMessage::session_error(&session_id, err.code(), err.to_string());
            return self.send(sender, &reply).await;
        }

        debug!(session_id = %session_id, last_message_id = ?last_message_id, "subscribe");
        // Subscribe before reading so nothing committed in between is missed
        let events = self.store.subscribe();
        let task = tokio::spawn(tail_session(
            self.store.clone(),
            session_id.clone(),
            last_message_id,
            events,
            ctx.out_tx.clone(),
        ));
        ctx.subscriptions.insert(session_id, task);
        Ok(())
    }
}

/// Lazy, ordered stream of the entries after `after`.
///
/// An unknown cursor (compacted away, or never issued) yields the whole
/// current physical log so the client can rebuild from the boundary.
fn delta_stream(
    store: &LogStore,
    session_id: &str,
    after: Option<&EntryId>,
) -> tether_log::Result<impl Stream<Item = Entry>> {
    let range = match store.read_range(session_id, after, None) {
        Ok(range) => range,
        Err(StoreError::CursorNotFound { .. }) => {
            info!(session_id = %session_id, "cursor not in physical log, sending full log");
            store.read_range(session_id, None, None)?
        }
        Err(e) => return Err(e),
    };

    Ok(stream! {
        for entry in range {
            yield entry;
        }
    })
}

/// Send the delta after `last`, advancing `last` as entries go out.
/// Returns false once the connection is gone.
async fn send_delta(
    store: &LogStore,
    session_id: &str,
    last: &mut Option<EntryId>,
    out: &mpsc::Sender<ServerMessage>,
) -> bool {
    let delta = match delta_stream(store, session_id, last.as_ref()) {
        Ok(delta) => delta,
        Err(e) => {
            let reply = ServerMessage::session_error(session_id, e.code(), e.to_string());
            let _ = out.send(reply).await;
            return false;
        }
    };

    let mut delta = Box::pin(delta);
    let mut sent = 0usize;
    while let Some(entry) = delta.next().await {
        *last = Some(entry.id.clone());
        if out.send(ServerMessage::entry(entry)).await.is_err() {
            return false;
        }
        sent += 1;
    }
    debug!(session_id = %session_id, sent, "delta sync complete");
    true
}

/// Delta sync, then live-tail the session.
///
/// Live entries are forwarded only when they continue the chain already
/// sent, which drops events that the initial read already covered.
async fn tail_session(
    store: Arc<LogStore>,
    session_id: String,
    from: Option<EntryId>,
    mut events: broadcast::Receiver<StoreEvent>,
    out: mpsc::Sender<ServerMessage>,
) {
    let mut last = from;
    if !send_delta(&store, &session_id, &mut last, &out).await {
        return;
    }

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(session_id = %session_id, skipped, "subscriber lagged, resyncing");
                if !send_delta(&store, &session_id, &mut last, &out).await {
                    return;
                }
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        if event.session_id() != session_id {
            continue;
        }

        let batch = match event {
            StoreEvent::Appended(entry) if entry.parent_id == last => vec![entry],
            StoreEvent::Compacted {
                boundary, summary, ..
            } if boundary.logical_parent_id == last => vec![boundary, summary],
            StoreEvent::Deleted { .. } => {
                let reply =
                    ServerMessage::session_error(&session_id, "session_not_found", "session deleted");
                let _ = out.send(reply).await;
                return;
            }
            _ => continue,
        };

        for entry in batch {
            last = Some(entry.id.clone());
            if out.send(ServerMessage::entry(entry)).await.is_err() {
                return;
            }
        }
    }
}
