//! # tether-sync
//!
//! Resumable synchronization of Tether session logs over unreliable links.
//!
//! This crate provides:
//! - Protocol: typed JSON messages, one per text frame
//! - Transports: an in-memory network and a WebSocket bridge behind one
//!   [`Connection`] type
//! - Server: delta sync from a cursor, live tail, acknowledged delivery,
//!   asynchronous compaction requests
//! - Client: a connection manager with backoff, heartbeat-based quality
//!   classification and a deduplicated cache of each watched session
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tether_sync::{ClientConfig, MemoryNetwork, SyncClient, SyncServer, SyncServerConfig};
//!
//! let (network, incoming) = MemoryNetwork::new();
//! let server = Arc::new(SyncServer::new(store, engine, SyncServerConfig::default()));
//! tokio::spawn(server.clone().serve(incoming));
//!
//! let client = SyncClient::spawn(network, ClientConfig::default());
//! client.watch("s1").await?;
//! let request_id = client.compact_session("s1").await?;
//! ```

pub mod backoff;
pub mod cache;
pub mod client;
pub mod error;
pub mod heartbeat;
pub mod network;
pub mod outbox;
pub mod protocol;
pub mod server;
pub mod ws;

pub use backoff::Backoff;
pub use cache::{Applied, SessionCache};
pub use client::{
    ClientConfig, ClientConfigBuilder, ClientEvent, CompactionReport, CompactionRequestState,
    ConnectionState, SyncClient,
};
pub use error::{NetworkError, Result, SyncError};
pub use heartbeat::{HeartbeatMonitor, HeartbeatPolicy, LinkQuality, RttEstimator};
pub use network::{Connection, Connector, FrameSender, MemoryNetwork};
pub use outbox::{Outbox, Retransmit, RetryPolicy};
pub use protocol::{ClientMessage, ServerMessage};
pub use server::{SyncServer, SyncServerConfig, SyncServerConfigBuilder};
pub use ws::WsConnector;
