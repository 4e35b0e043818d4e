//! WebSocket broadcaster
//!
//! Opens channels on a relay server (`<relay_url>/channel/<name>`) so that
//! participants in different processes share one broadcast medium.

use super::{BroadcastError, Broadcaster, ChannelSender, OpenChannel};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;

/// Broadcaster backed by a WebSocket relay
#[derive(Debug, Clone)]
pub struct WsBroadcaster {
    relay_url: String,
}

impl WsBroadcaster {
    /// Create a broadcaster for the relay at `relay_url` (e.g. `ws://127.0.0.1:8790`)
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
        }
    }

    fn channel_url(&self, channel: &str) -> String {
        format!("{}/channel/{}", self.relay_url.trim_end_matches('/'), channel)
    }
}

struct WsSender {
    channel: String,
    outbound: mpsc::UnboundedSender<Message>,
    closed: AtomicBool,
}

impl ChannelSender for WsSender {
    fn post_message(&self, value: String) -> Result<(), BroadcastError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BroadcastError::Closed(self.channel.clone()));
        }
        self.outbound
            .send(Message::Text(value))
            .map_err(|_| BroadcastError::Delivery(format!("relay connection for {} lost", self.channel)))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.outbound.send(Message::Close(None));
        }
    }
}

#[async_trait]
impl Broadcaster for WsBroadcaster {
    async fn open(&self, channel: &str) -> Result<OpenChannel, BroadcastError> {
        let url = self.channel_url(channel);
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| BroadcastError::Open {
                channel: channel.to_string(),
                reason: e.to_string(),
            })?;
        info!("Connected to relay channel {}", url);

        let (mut write, read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if write.send(msg).await.is_err() || closing {
                    break;
                }
            }
            let _ = write.close().await;
        });

        let name = channel.to_string();
        let incoming = futures::stream::unfold(read, move |mut read| {
            let name = name.clone();
            async move {
                loop {
                    match read.next().await {
                        Some(Ok(Message::Text(text))) => return Some((text, read)),
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("Relay channel {} closed", name);
                            return None;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            warn!("Relay channel {} read error: {}", name, e);
                            return None;
                        }
                    }
                }
            }
        })
        .boxed();

        Ok(OpenChannel {
            sender: Box::new(WsSender {
                channel: channel.to_string(),
                outbound: outbound_tx,
                closed: AtomicBool::new(false),
            }),
            incoming,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_url_joins_relay_and_name() {
        let broadcaster = WsBroadcaster::new("ws://127.0.0.1:8790/");
        assert_eq!(
            broadcaster.channel_url("roomcall_signaling"),
            "ws://127.0.0.1:8790/channel/roomcall_signaling"
        );
    }

    #[tokio::test]
    async fn open_fails_without_relay() {
        let broadcaster = WsBroadcaster::new("ws://127.0.0.1:1");
        let result = broadcaster.open("nobody-home").await;
        assert!(matches!(result, Err(BroadcastError::Open { .. })));
    }
}
