//! Client-side connection manager.
//!
//! A [`SyncClient`] is a handle onto one actor task that owns the connection
//! lifecycle: connect, handshake, resubscribe, heartbeat, and reconnect with
//! backoff when the link drops. The handle reads cached session logs and
//! compaction outcomes from shared state and publishes changes on a `watch`
//! channel (connection state) and a `broadcast` channel (events).

use crate::backoff::Backoff;
use crate::cache::{Applied, SessionCache};
use crate::error::{NetworkError, Result, SyncError};
use crate::heartbeat::{HeartbeatMonitor, HeartbeatPolicy, LinkQuality};
use crate::network::{Connection, Connector, FrameSender};
use crate::protocol::{ClientMessage, ServerMessage};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_log::{Entry, EntryId, EntryKind};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use ulid::Ulid;

/// Settled compaction requests remembered for [`SyncClient::compaction`].
const SETTLED_COMPACTIONS_KEPT: usize = 256;

/// Configuration for the sync client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Token presented in `hello`.
    pub token: Option<String>,
    /// Enable automatic reconnection.
    pub auto_reconnect: bool,
    /// Consecutive failed attempts before giving up. `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
    /// Bound on connecting plus the handshake.
    pub connect_timeout_ms: u64,
    pub ping_interval_ms: u64,
    pub degraded_rtt_factor: f64,
    pub min_degraded_ms: u64,
    pub server_heartbeat_tolerance: f64,
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            token: None,
            auto_reconnect: true,
            max_reconnect_attempts: None,
            backoff_min_ms: 250,
            backoff_max_ms: 30_000,
            connect_timeout_ms: 10_000,
            ping_interval_ms: 5_000,
            degraded_rtt_factor: 4.0,
            min_degraded_ms: 1_000,
            server_heartbeat_tolerance: 2.0,
            event_capacity: 256,
        }
    }
}

impl ClientConfig {
    fn heartbeat_policy(&self) -> HeartbeatPolicy {
        HeartbeatPolicy {
            degraded_rtt_factor: self.degraded_rtt_factor,
            min_degraded: Duration::from_millis(self.min_degraded_ms),
            server_tolerance: self.server_heartbeat_tolerance,
        }
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_min_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }
}

/// Builder for client configuration.
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = Some(token.into());
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.auto_reconnect = enabled;
        self
    }

    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.max_reconnect_attempts = Some(attempts);
        self
    }

    pub fn backoff(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.config.backoff_min_ms = min_ms;
        self.config.backoff_max_ms = max_ms;
        self
    }

    pub fn connect_timeout(mut self, ms: u64) -> Self {
        self.config.connect_timeout_ms = ms;
        self
    }

    pub fn ping_interval(mut self, ms: u64) -> Self {
        self.config.ping_interval_ms = ms;
        self
    }

    pub fn degraded_after(mut self, rtt_factor: f64, min_ms: u64) -> Self {
        self.config.degraded_rtt_factor = rtt_factor;
        self.config.min_degraded_ms = min_ms;
        self
    }

    pub fn server_heartbeat_tolerance(mut self, factor: f64) -> Self {
        self.config.server_heartbeat_tolerance = factor;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected(LinkQuality),
    /// Terminal: authentication failed or reconnect attempts ran out.
    Dead,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }
}

/// Counts reported by a completed compaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompactionReport {
    pub old_message_count: usize,
    pub new_message_count: usize,
    pub messages_removed: usize,
    pub pre_tokens: Option<u64>,
}

/// What the client knows about a compaction it requested.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompactionRequestState {
    /// Sent; no answer yet.
    Pending,
    /// The connection dropped before an answer arrived.
    Unresolved,
    Completed(CompactionReport),
    Failed(String),
    /// No answer arrived, but a newer boundary showed the compaction committed.
    Reconciled { boundary_id: EntryId },
}

impl CompactionRequestState {
    pub fn is_settled(&self) -> bool {
        !matches!(
            self,
            CompactionRequestState::Pending | CompactionRequestState::Unresolved
        )
    }
}

/// Events published by the client.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    StateChanged(ConnectionState),
    EntryReceived {
        session_id: String,
        entry: Entry,
    },
    CompactionCompleted {
        session_id: String,
        request_id: String,
        report: CompactionReport,
    },
    CompactionFailed {
        session_id: String,
        request_id: String,
        error: String,
    },
    CompactionUnresolved {
        session_id: String,
        request_id: String,
    },
    CompactionReconciled {
        session_id: String,
        request_id: String,
        boundary_id: EntryId,
    },
    Error {
        code: String,
        message: String,
        session_id: Option<String>,
    },
}

#[derive(Clone, Debug)]
struct PendingCompaction {
    session_id: String,
    state: CompactionRequestState,
    /// Cache boundary counter when the request was sent.
    boundaries_at_issue: u64,
}

enum Command {
    ConnectNow,
    Shutdown,
}

/// State shared between the handle and the actor.
struct Shared {
    config: ClientConfig,
    caches: RwLock<HashMap<String, SessionCache>>,
    compactions: Mutex<HashMap<String, PendingCompaction>>,
    /// Settled request ids, oldest first.
    settled: Mutex<VecDeque<String>>,
    link: Mutex<Option<FrameSender>>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ClientEvent>,
    stopped: AtomicBool,
}

impl Shared {
    fn new(config: ClientConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Shared {
            config,
            caches: RwLock::new(HashMap::new()),
            compactions: Mutex::new(HashMap::new()),
            settled: Mutex::new(VecDeque::new()),
            link: Mutex::new(None),
            state,
            events,
            stopped: AtomicBool::new(false),
        }
    }

    /// Remember that requests settled, forgetting the oldest settled ones
    /// beyond [`SETTLED_COMPACTIONS_KEPT`].
    fn record_settled(&self, request_ids: impl IntoIterator<Item = String>) {
        let mut settled = self.settled.lock();
        settled.extend(request_ids);
        if settled.len() <= SETTLED_COMPACTIONS_KEPT {
            return;
        }
        let mut compactions = self.compactions.lock();
        while settled.len() > SETTLED_COMPACTIONS_KEPT {
            if let Some(oldest) = settled.pop_front() {
                compactions.remove(&oldest);
            }
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            info!(state = ?next, "connection state changed");
            self.emit(ClientEvent::StateChanged(next));
        }
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    async fn send(&self, message: &ClientMessage) -> Result<()> {
        if self.is_stopped() {
            return Err(SyncError::Shutdown);
        }
        let link = self.link.lock().clone();
        let link = link.ok_or(SyncError::Network(NetworkError::Disconnected))?;
        link.send(message.encode()?).await?;
        Ok(())
    }
}

/// Handle onto a running sync client.
pub struct SyncClient {
    shared: Arc<Shared>,
    commands: mpsc::Sender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncClient {
    /// Start the connection manager. It begins connecting immediately.
    pub fn spawn(connector: Arc<dyn Connector>, config: ClientConfig) -> Self {
        let (commands, command_rx) = mpsc::channel(16);
        let shared = Arc::new(Shared::new(config.clone()));

        let manager = ConnectionManager {
            shared: shared.clone(),
            connector,
            commands: command_rx,
            backoff: config.backoff(),
        };
        let task = tokio::spawn(manager.run());

        SyncClient {
            shared,
            commands,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.current_state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Subscribe to client events.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    /// Wait until the connection state satisfies `predicate`.
    pub async fn wait_for_state(
        &self,
        mut predicate: impl FnMut(&ConnectionState) -> bool,
    ) -> ConnectionState {
        let mut rx = self.shared.state.subscribe();
        let result = rx.wait_for(|state| predicate(state)).await.map(|s| *s);
        // The sender lives in `shared`, so the channel cannot close under us
        result.unwrap_or(ConnectionState::Dead)
    }

    /// Skip the current backoff delay and connect now.
    pub fn connect_now(&self) {
        let _ = self.commands.try_send(Command::ConnectNow);
    }

    /// Track a session. Its log is synced now if connected and on every
    /// reconnect.
    pub async fn watch(&self, session_id: &str) -> Result<()> {
        if self.shared.is_stopped() {
            return Err(SyncError::Shutdown);
        }
        let last_message_id = {
            let mut caches = self.shared.caches.write();
            let cache = caches.entry(session_id.to_string()).or_default();
            cache.last_message_id().cloned()
        };

        if !self.state().is_connected() {
            return Ok(());
        }
        self.shared
            .send(&ClientMessage::Subscribe {
                session_id: session_id.to_string(),
                last_message_id,
            })
            .await
    }

    /// Stop caching a session. Entries still in flight are ignored.
    pub fn unwatch(&self, session_id: &str) {
        self.shared.caches.write().remove(session_id);
    }

    pub fn watched(&self) -> Vec<String> {
        self.shared.caches.read().keys().cloned().collect()
    }

    pub async fn append(
        &self,
        session_id: &str,
        kind: EntryKind,
        payload: Value,
        create: bool,
    ) -> Result<()> {
        self.shared
            .send(&ClientMessage::Append {
                session_id: session_id.to_string(),
                kind,
                payload,
                create,
            })
            .await
    }

    /// Request a compaction of a watched session. Returns the request id;
    /// the outcome arrives as an event and through [`SyncClient::compaction`].
    pub async fn compact_session(&self, session_id: &str) -> Result<String> {
        let boundaries_at_issue = self
            .shared
            .caches
            .read()
            .get(session_id)
            .map(SessionCache::boundaries_seen)
            .ok_or_else(|| SyncError::NotWatched(session_id.to_string()))?;

        let request_id = Ulid::new().to_string();
        self.shared.compactions.lock().insert(
            request_id.clone(),
            PendingCompaction {
                session_id: session_id.to_string(),
                state: CompactionRequestState::Pending,
                boundaries_at_issue,
            },
        );

        let message = ClientMessage::CompactSession {
            session_id: session_id.to_string(),
            request_id: Some(request_id.clone()),
        };
        if let Err(e) = self.shared.send(&message).await {
            self.shared.compactions.lock().remove(&request_id);
            return Err(e);
        }
        debug!(session_id = %session_id, request_id = %request_id, "compaction requested");
        Ok(request_id)
    }

    pub fn compaction(&self, request_id: &str) -> Option<CompactionRequestState> {
        self.shared
            .compactions
            .lock()
            .get(request_id)
            .map(|p| p.state.clone())
    }

    /// Cached physical log of a watched session.
    pub fn entries(&self, session_id: &str) -> Option<Vec<Entry>> {
        self.shared
            .caches
            .read()
            .get(session_id)
            .map(|c| c.entries().to_vec())
    }

    pub fn last_message_id(&self, session_id: &str) -> Option<EntryId> {
        self.shared
            .caches
            .read()
            .get(session_id)
            .and_then(|c| c.last_message_id().cloned())
    }

    /// Stop the connection manager and wait for it to exit.
    /// Later calls that talk to the server fail with [`SyncError::Shutdown`].
    pub async fn shutdown(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        let _ = self.commands.send(Command::Shutdown).await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

/// Why a connection ended.
enum Ended {
    Dropped(String),
    AuthFailure(String),
    Shutdown,
}

/// The actor driving one client's connection lifecycle.
struct ConnectionManager {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    commands: mpsc::Receiver<Command>,
    backoff: Backoff,
}

impl ConnectionManager {
    async fn run(mut self) {
        let connect_timeout = Duration::from_millis(self.shared.config.connect_timeout_ms);

        loop {
            self.shared.set_state(ConnectionState::Connecting);
            let ended = match tokio::time::timeout(connect_timeout, self.connector.connect()).await
            {
                Ok(Ok(connection)) => self.serve(connection).await,
                Ok(Err(e)) => Ended::Dropped(e.to_string()),
                Err(_) => Ended::Dropped("connect timed out".into()),
            };
            self.detach();

            match ended {
                Ended::Shutdown => {
                    self.shared.set_state(ConnectionState::Disconnected);
                    return;
                }
                Ended::AuthFailure(reason) => {
                    warn!(reason = %reason, "authentication failed, giving up");
                    self.shared.emit(ClientEvent::Error {
                        code: SyncError::AuthFailure(reason.clone()).code().to_string(),
                        message: reason,
                        session_id: None,
                    });
                    self.shared.set_state(ConnectionState::Dead);
                    return;
                }
                Ended::Dropped(reason) => {
                    debug!(reason = %reason, "connection ended");
                    self.shared.set_state(ConnectionState::Disconnected);
                }
            }

            if !self.shared.config.auto_reconnect {
                match self.commands.recv().await {
                    Some(Command::ConnectNow) => continue,
                    Some(Command::Shutdown) | None => return,
                }
            }

            if let Some(max) = self.shared.config.max_reconnect_attempts {
                if self.backoff.attempts() >= max {
                    warn!(attempts = max, "reconnect attempts exhausted");
                    self.shared.set_state(ConnectionState::Dead);
                    return;
                }
            }

            let delay = self.backoff.next_delay();
            debug!(
                delay_ms = delay.as_millis() as u64,
                attempt = self.backoff.attempts(),
                "reconnecting after backoff"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                command = self.commands.recv() => match command {
                    Some(Command::ConnectNow) => {}
                    Some(Command::Shutdown) | None => {
                        self.shared.set_state(ConnectionState::Disconnected);
                        return;
                    }
                },
            }
        }
    }

    /// Handshake, then pump frames until the connection ends.
    async fn serve(&mut self, connection: Connection) -> Ended {
        let (sender, mut frames) = connection.split();

        let hello = ClientMessage::Hello {
            token: self.shared.config.token.clone(),
        };
        let frame = match hello.encode() {
            Ok(frame) => frame,
            Err(e) => return Ended::Dropped(e.to_string()),
        };
        if let Err(e) = sender.send(frame).await {
            return Ended::Dropped(e.to_string());
        }

        let server_interval = match self.await_connected(&mut frames).await {
            Ok(interval) => interval,
            Err(ended) => return ended,
        };

        *self.shared.link.lock() = Some(sender.clone());
        self.backoff.reset();
        self.shared
            .set_state(ConnectionState::Connected(LinkQuality::Healthy));

        let mut monitor = HeartbeatMonitor::new(
            self.shared.config.heartbeat_policy(),
            server_interval,
            Instant::now(),
        );

        if let Err(e) = self.resubscribe().await {
            return Ended::Dropped(e.to_string());
        }

        let mut ping = tokio::time::interval(Duration::from_millis(
            self.shared.config.ping_interval_ms.max(1),
        ));
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.tick().await;

        loop {
            tokio::select! {
                frame = frames.recv() => match frame {
                    Some(text) => {
                        if let Some(ended) = self.on_frame(&text, &sender, &mut monitor).await {
                            return ended;
                        }
                    }
                    None => return Ended::Dropped("connection closed".into()),
                },
                _ = ping.tick() => {
                    let now = Instant::now();
                    if monitor.server_silent(now) {
                        return Ended::Dropped("server heartbeat missing".into());
                    }
                    self.update_quality(monitor.quality(now));

                    let message = ClientMessage::Ping { nonce: Some(monitor.ping(now)) };
                    if let Err(e) = self.send_on(&sender, &message).await {
                        return Ended::Dropped(e.to_string());
                    }
                }
                command = self.commands.recv() => match command {
                    Some(Command::ConnectNow) => {}
                    Some(Command::Shutdown) | None => return Ended::Shutdown,
                },
            }
        }
    }

    async fn await_connected(
        &mut self,
        frames: &mut mpsc::Receiver<String>,
    ) -> std::result::Result<Duration, Ended> {
        let wait = Duration::from_millis(self.shared.config.connect_timeout_ms);
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let frame = match tokio::time::timeout_at(deadline, frames.recv()).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return Err(Ended::Dropped("closed during handshake".into())),
                Err(_) => return Err(Ended::Dropped("handshake timed out".into())),
            };
            match ServerMessage::decode(&frame) {
                Ok(ServerMessage::Connected {
                    heartbeat_interval_ms,
                }) => return Ok(Duration::from_millis(heartbeat_interval_ms)),
                Ok(ServerMessage::Error { code, message, .. }) if code == "auth_failure" => {
                    return Err(Ended::AuthFailure(message));
                }
                Ok(other) => debug!(message = ?other, "ignoring message before handshake"),
                Err(e) => warn!(error = %e, "undecodable frame during handshake"),
            }
        }
    }

    async fn send_on(&self, sender: &FrameSender, message: &ClientMessage) -> Result<()> {
        sender.send(message.encode()?).await?;
        Ok(())
    }

    /// Issue `subscribe` for every watched session from its cached cursor.
    async fn resubscribe(&self) -> Result<()> {
        let cursors: Vec<(String, Option<EntryId>)> = self
            .shared
            .caches
            .read()
            .iter()
            .map(|(id, cache)| (id.clone(), cache.last_message_id().cloned()))
            .collect();

        for (session_id, last_message_id) in cursors {
            debug!(session_id = %session_id, last_message_id = ?last_message_id, "resubscribing");
            self.shared
                .send(&ClientMessage::Subscribe {
                    session_id,
                    last_message_id,
                })
                .await?;
        }
        Ok(())
    }

    async fn on_frame(
        &mut self,
        text: &str,
        sender: &FrameSender,
        monitor: &mut HeartbeatMonitor,
    ) -> Option<Ended> {
        let message = match ServerMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "ignoring undecodable server message");
                return None;
            }
        };

        if let Some(msg_id) = message.msg_id() {
            if let Err(e) = self.send_on(sender, &ClientMessage::Ack { msg_id }).await {
                return Some(Ended::Dropped(e.to_string()));
            }
        }

        let now = Instant::now();
        match message {
            ServerMessage::Entry { entry, .. } => self.apply_entry(entry),
            ServerMessage::CompactionComplete {
                session_id,
                request_id,
                old_message_count,
                new_message_count,
                messages_removed,
                pre_tokens,
                ..
            } => {
                let report = CompactionReport {
                    old_message_count,
                    new_message_count,
                    messages_removed,
                    pre_tokens,
                };
                self.settle(
                    &session_id,
                    request_id.as_deref(),
                    CompactionRequestState::Completed(report),
                );
            }
            ServerMessage::CompactionError {
                session_id,
                request_id,
                error,
                ..
            } => {
                self.settle(
                    &session_id,
                    request_id.as_deref(),
                    CompactionRequestState::Failed(error),
                );
            }
            ServerMessage::Error {
                code,
                message,
                session_id,
            } => {
                if code == "auth_failure" {
                    return Some(Ended::AuthFailure(message));
                }
                warn!(code = %code, message = %message, session_id = ?session_id, "server error");
                self.shared.emit(ClientEvent::Error {
                    code,
                    message,
                    session_id,
                });
            }
            ServerMessage::Heartbeat { interval_ms, .. } => {
                monitor.server_beat(Some(Duration::from_millis(interval_ms)), now);
            }
            ServerMessage::Pong { nonce: Some(nonce) } => {
                if let Some(rtt) = monitor.pong(nonce, now) {
                    debug!(rtt_ms = rtt.as_millis() as u64, "pong");
                    self.update_quality(monitor.quality(now));
                }
            }
            ServerMessage::Pong { nonce: None } | ServerMessage::Connected { .. } => {}
        }
        None
    }

    fn apply_entry(&self, entry: Entry) {
        let session_id = entry.session_id.clone();
        let (applied, boundaries_seen) = {
            let mut caches = self.shared.caches.write();
            let Some(cache) = caches.get_mut(&session_id) else {
                debug!(session_id = %session_id, "entry for unwatched session");
                return;
            };
            (cache.apply(entry.clone()), cache.boundaries_seen())
        };

        if applied == Applied::Duplicate {
            return;
        }
        if applied == Applied::Rebased {
            self.reconcile(&session_id, boundaries_seen, &entry.id);
        }
        self.shared.emit(ClientEvent::EntryReceived { session_id, entry });
    }

    /// A boundary newer than an unresolved request shows that the
    /// compaction committed while the client was away.
    fn reconcile(&self, session_id: &str, boundaries_seen: u64, boundary_id: &EntryId) {
        let mut reconciled = Vec::new();
        {
            let mut compactions = self.shared.compactions.lock();
            for (request_id, pending) in compactions.iter_mut() {
                if pending.session_id == session_id
                    && pending.state == CompactionRequestState::Unresolved
                    && boundaries_seen > pending.boundaries_at_issue
                {
                    pending.state = CompactionRequestState::Reconciled {
                        boundary_id: boundary_id.clone(),
                    };
                    reconciled.push(request_id.clone());
                }
            }
        }

        self.shared.record_settled(reconciled.iter().cloned());
        for request_id in reconciled {
            info!(session_id = %session_id, request_id = %request_id, "unresolved compaction reconciled");
            self.shared.emit(ClientEvent::CompactionReconciled {
                session_id: session_id.to_string(),
                request_id,
                boundary_id: boundary_id.clone(),
            });
        }
    }

    /// Record a compaction answer. Answers for settled or unknown requests
    /// are retransmissions or belong to someone else, and are dropped.
    fn settle(&self, session_id: &str, request_id: Option<&str>, outcome: CompactionRequestState) {
        let request_id = {
            let mut compactions = self.shared.compactions.lock();
            let found = match request_id {
                Some(id) => compactions
                    .get_mut(id)
                    .filter(|p| !p.state.is_settled())
                    .map(|p| (id.to_string(), p)),
                None => compactions
                    .iter_mut()
                    .find(|(_, p)| p.session_id == session_id && !p.state.is_settled())
                    .map(|(id, p)| (id.clone(), p)),
            };
            let Some((request_id, pending)) = found else {
                debug!(session_id = %session_id, "compaction answer for no pending request");
                return;
            };
            pending.state = outcome.clone();
            request_id
        };
        self.shared.record_settled([request_id.clone()]);

        let session_id = session_id.to_string();
        match outcome {
            CompactionRequestState::Completed(report) => {
                self.shared.emit(ClientEvent::CompactionCompleted {
                    session_id,
                    request_id,
                    report,
                })
            }
            CompactionRequestState::Failed(error) => {
                self.shared.emit(ClientEvent::CompactionFailed {
                    session_id,
                    request_id,
                    error,
                })
            }
            _ => {}
        }
    }

    fn update_quality(&mut self, quality: LinkQuality) {
        if !self.shared.current_state().is_connected() {
            return;
        }
        if quality == LinkQuality::Healthy {
            self.backoff.reset();
        }
        self.shared.set_state(ConnectionState::Connected(quality));
    }

    /// Forget the link and mark every pending compaction unresolved.
    fn detach(&self) {
        *self.shared.link.lock() = None;

        let mut unresolved = Vec::new();
        {
            let mut compactions = self.shared.compactions.lock();
            for (request_id, pending) in compactions.iter_mut() {
                if pending.state == CompactionRequestState::Pending {
                    pending.state = CompactionRequestState::Unresolved;
                    unresolved.push((pending.session_id.clone(), request_id.clone()));
                }
            }
        }

        for (session_id, request_id) in unresolved {
            warn!(session_id = %session_id, request_id = %request_id, "compaction outcome unknown after disconnect");
            self.shared.emit(ClientEvent::CompactionUnresolved {
                session_id,
                request_id,
            });
        }
    }
}
