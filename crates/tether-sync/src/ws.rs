//! WebSocket transport.
//!
//! Bridges a WebSocket into a [`Connection`] with two pump tasks, one per
//! direction. Only text frames carry protocol messages; WebSocket control
//! frames are handled by tungstenite.

use crate::error::NetworkError;
use crate::network::{Connection, Connector};
use crate::server::SyncServer;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

const FRAME_BUFFER: usize = 256;
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Wrap an established WebSocket as a text-frame connection.
pub fn bridge<S>(ws: WebSocketStream<S>, peer: impl Into<String>) -> Connection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let peer = peer.into();
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(FRAME_BUFFER);
    let (in_tx, in_rx) = mpsc::channel::<String>(FRAME_BUFFER);

    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = sink.send(WsMessage::Text(frame.into())).await {
                debug!(error = %e, "websocket write failed");
                return;
            }
        }
        let _ = sink.close().await;
    });

    let label = peer.clone();
    tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    debug!(peer = %label, error = %e, "websocket read failed");
                    break;
                }
            };
            if message.is_close() {
                break;
            }
            if !message.is_text() {
                continue;
            }
            let text = match message.to_text() {
                Ok(text) => text.to_string(),
                Err(e) => {
                    warn!(peer = %label, error = %e, "dropping invalid text frame");
                    continue;
                }
            };
            if in_tx.send(text).await.is_err() {
                break;
            }
        }
    });

    Connection::new(peer, out_tx, in_rx)
}

/// How long to pause after a failed accept. Per-connection failures are
/// retried at once; anything else (such as running out of file
/// descriptors) backs off so the loop does not spin.
fn accept_pause(error: &io::Error) -> Duration {
    match error.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted => Duration::ZERO,
        _ => ACCEPT_ERROR_PAUSE,
    }
}

/// Accept WebSocket clients on `listener` and serve each on its own task.
///
/// Failed accepts are logged and never stop the listener.
pub async fn serve(listener: TcpListener, server: Arc<SyncServer>) -> io::Result<()> {
    info!(addr = %listener.local_addr()?, "websocket listener ready");
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                let pause = accept_pause(&e);
                warn!(error = %e, pause_ms = pause.as_millis() as u64, "accept failed");
                if !pause.is_zero() {
                    tokio::time::sleep(pause).await;
                }
                continue;
            }
        };
        let server = server.clone();
        tokio::spawn(async move {
            match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => server.handle(bridge(ws, addr.to_string())).await,
                Err(e) => warn!(peer = %addr, error = %e, "websocket handshake failed"),
            }
        });
    }
}

/// Connects to a sync server over WebSocket.
#[derive(Clone, Debug)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Connection, NetworkError> {
        let (ws, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;
        Ok(bridge(ws, self.url.clone()))
    }
}
