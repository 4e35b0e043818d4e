//! In-process broadcaster
//!
//! Fans messages out to every channel opened on the same broadcaster under
//! the same name. Used by tests and when several participants share a process.

use super::{BroadcastError, Broadcaster, ChannelSender, OpenChannel};
use async_trait::async_trait;
use futures::StreamExt;
use log::warn;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

/// In-memory broadcaster keyed by channel name
#[derive(Debug, Default)]
pub struct LocalBroadcaster {
    channels: RwLock<HashMap<String, broadcast::Sender<String>>>,
}

impl LocalBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<String> {
        let mut guard = self.channels.write();
        guard
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

struct LocalSender {
    channel: String,
    sender: broadcast::Sender<String>,
    closed: AtomicBool,
}

impl ChannelSender for LocalSender {
    fn post_message(&self, value: String) -> Result<(), BroadcastError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BroadcastError::Closed(self.channel.clone()));
        }
        // A send with no live receivers is not an error for a broadcast medium.
        let _ = self.sender.send(value);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[async_trait]
impl Broadcaster for LocalBroadcaster {
    async fn open(&self, channel: &str) -> Result<OpenChannel, BroadcastError> {
        let sender = self.sender_for(channel);
        let receiver = sender.subscribe();
        let name = channel.to_string();

        let incoming = futures::stream::unfold(receiver, move |mut receiver| {
            let name = name.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(value) => return Some((value, receiver)),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Channel {} listener lagged, dropped {} messages", name, n);
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        })
        .boxed();

        Ok(OpenChannel {
            sender: Box::new(LocalSender {
                channel: channel.to_string(),
                sender,
                closed: AtomicBool::new(false),
            }),
            incoming,
        })
    }
}
