//! Text-frame connections and the connectors that open them.
//!
//! A [`Connection`] is a pair of bounded channels carrying whole text frames.
//! The memory transport relays frames between two in-process endpoints; the
//! WebSocket transport in [`crate::ws`] bridges a socket into the same shape,
//! so the server and client never see which one is underneath.

use crate::error::NetworkError;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const FRAME_BUFFER: usize = 256;

/// Sending half of a connection. Cheap to clone.
#[derive(Clone, Debug)]
pub struct FrameSender {
    tx: mpsc::Sender<String>,
}

impl FrameSender {
    pub async fn send(&self, frame: String) -> Result<(), NetworkError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| NetworkError::Disconnected)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A bidirectional text-frame connection.
pub struct Connection {
    peer: String,
    tx: FrameSender,
    rx: mpsc::Receiver<String>,
}

impl Connection {
    pub fn new(peer: impl Into<String>, tx: mpsc::Sender<String>, rx: mpsc::Receiver<String>) -> Self {
        Connection {
            peer: peer.into(),
            tx: FrameSender { tx },
            rx,
        }
    }

    /// Label of the remote end, for logging.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn sender(&self) -> FrameSender {
        self.tx.clone()
    }

    pub async fn send(&self, frame: String) -> Result<(), NetworkError> {
        self.tx.send(frame).await
    }

    /// Next frame, or `None` once the remote end is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    pub fn split(self) -> (FrameSender, mpsc::Receiver<String>) {
        (self.tx, self.rx)
    }
}

/// Opens connections to a sync server.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Connection, NetworkError>;
}

/// Relay tasks behind one in-memory link. Aborting them severs the link.
struct Link {
    relays: [JoinHandle<()>; 2],
}

impl Link {
    fn sever(&self) {
        for relay in &self.relays {
            relay.abort();
        }
    }
}

fn relay(mut from: mpsc::Receiver<String>, to: mpsc::Sender<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = from.recv().await {
            if to.send(frame).await.is_err() {
                break;
            }
        }
    })
}

/// Two connected endpoints joined by relay tasks.
fn memory_link(client_label: String, server_label: String) -> (Connection, Connection, Link) {
    let (client_out, relay_up_rx) = mpsc::channel(FRAME_BUFFER);
    let (relay_up_tx, server_in) = mpsc::channel(FRAME_BUFFER);
    let (server_out, relay_down_rx) = mpsc::channel(FRAME_BUFFER);
    let (relay_down_tx, client_in) = mpsc::channel(FRAME_BUFFER);

    let link = Link {
        relays: [
            relay(relay_up_rx, relay_up_tx),
            relay(relay_down_rx, relay_down_tx),
        ],
    };

    (
        Connection::new(server_label, client_out, client_in),
        Connection::new(client_label, server_out, server_in),
        link,
    )
}

/// In-memory network for tests and the stress driver.
///
/// Connections handed to clients appear on the acceptor returned by
/// [`MemoryNetwork::new`]. The network can be made unreachable and live
/// links can be severed to simulate a flaky wireless link.
pub struct MemoryNetwork {
    acceptor: mpsc::Sender<Connection>,
    links: Mutex<Vec<Link>>,
    reachable: RwLock<bool>,
    next_id: AtomicU64,
}

impl MemoryNetwork {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<Connection>) {
        let (acceptor, incoming) = mpsc::channel(64);
        let network = Arc::new(MemoryNetwork {
            acceptor,
            links: Mutex::new(Vec::new()),
            reachable: RwLock::new(true),
            next_id: AtomicU64::new(1),
        });
        (network, incoming)
    }

    pub fn set_reachable(&self, reachable: bool) {
        *self.reachable.write() = reachable;
    }

    pub fn is_reachable(&self) -> bool {
        *self.reachable.read()
    }

    /// Drop every live link. Both ends observe a closed connection.
    pub fn sever_all(&self) -> usize {
        let links: Vec<Link> = self.links.lock().drain(..).collect();
        for link in &links {
            link.sever();
        }
        links.len()
    }

    /// Number of links opened and not yet severed or finished.
    pub fn live_links(&self) -> usize {
        let mut links = self.links.lock();
        links.retain(|link| link.relays.iter().any(|relay| !relay.is_finished()));
        links.len()
    }
}

#[async_trait]
impl Connector for MemoryNetwork {
    async fn connect(&self) -> Result<Connection, NetworkError> {
        if !self.is_reachable() {
            return Err(NetworkError::ConnectionFailed("network unreachable".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (client, server, link) =
            memory_link(format!("memory-client-{}", id), "memory-server".to_string());

        self.acceptor
            .send(server)
            .await
            .map_err(|_| NetworkError::ConnectionFailed("server is not accepting".into()))?;
        self.links.lock().push(link);
        Ok(client)
    }
}
