//! Signaling relay server
//!
//! A WebSocket fan-out that stands in for the browser's cross-tab broadcast
//! channel. Every text frame received on `/channel/{name}` is re-sent to every
//! socket connected to the same channel, the sender included. The relay never
//! inspects envelopes.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, State},
    response::{Json, Response},
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 512;

#[derive(Debug, Default)]
struct RelayState {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl RelayState {
    fn sender_for(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Drop channels nobody listens to anymore
    fn prune(&self, channel: &str) {
        let mut channels = self.channels.lock();
        if channels.get(channel).is_some_and(|s| s.receiver_count() == 0) {
            channels.remove(channel);
            debug!("Relay channel {} removed", channel);
        }
    }
}

/// WebSocket relay bound to a listening socket
pub struct RelayServer {
    listener: TcpListener,
    state: Arc<RelayState>,
}

impl RelayServer {
    /// Bind the relay to `addr` (e.g. `0.0.0.0:8790`)
    pub async fn bind(addr: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            state: Arc::new(RelayState::default()),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until the listener fails
    pub async fn run(self) -> std::io::Result<()> {
        info!("Signaling relay listening on ws://{}", self.listener.local_addr()?);
        let app = Router::new()
            .route("/health", get(health_handler))
            .route("/channel/{name}", get(channel_handler))
            .with_state(self.state);
        axum::serve(self.listener, app).await
    }
}

async fn health_handler(State(state): State<Arc<RelayState>>) -> Json<Value> {
    let channels = state.channels.lock().len();
    Json(json!({ "status": "ok", "channels": channels }))
}

async fn channel_handler(
    ws: WebSocketUpgrade,
    Path(name): Path<String>,
    State(state): State<Arc<RelayState>>,
) -> Response {
    let sender = state.sender_for(&name);
    // Subscribe before the upgrade completes so the client never misses a
    // message posted right after its handshake.
    let receiver = sender.subscribe();
    ws.on_upgrade(move |socket| handle_relay_connection(socket, name, sender, receiver, state))
}

async fn handle_relay_connection(
    socket: WebSocket,
    channel: String,
    sender: broadcast::Sender<String>,
    mut receiver: broadcast::Receiver<String>,
    state: Arc<RelayState>,
) {
    info!("Relay client joined channel {}", channel);
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let forward_channel = channel.clone();
    let forward_task = tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(msg) => {
                    if ws_sender.send(Message::Text(msg.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Relay client on {} lagged, dropped {} messages", forward_channel, n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let _ = sender.send(text.as_str().to_owned());
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Relay client on {} errored: {}", channel, e);
                break;
            }
        }
    }

    forward_task.abort();
    let _ = forward_task.await;
    drop(sender);
    state.prune(&channel);
    info!("Relay client left channel {}", channel);
}
