//! Broadcast transport for signaling
//!
//! A broadcaster delivers each posted message, best effort and at most once,
//! to every open channel sharing the same name, the posting channel included.
//! Ordering is preserved per sender only.

pub mod local;
pub mod relay;
pub mod websocket;

pub use local::LocalBroadcaster;
pub use relay::RelayServer;
pub use websocket::WsBroadcaster;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

/// Broadcast transport errors
#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("Channel {0} is closed")]
    Closed(String),
    #[error("Failed to open channel {channel}: {reason}")]
    Open { channel: String, reason: String },
    #[error("Broadcast delivery failed: {0}")]
    Delivery(String),
}

/// Outbound half of an open channel
pub trait ChannelSender: Send + Sync {
    /// Post a message to every listener on the channel
    fn post_message(&self, value: String) -> Result<(), BroadcastError>;

    /// Release the channel. Idempotent.
    fn close(&self);
}

/// An open broadcast channel
pub struct OpenChannel {
    pub sender: Box<dyn ChannelSender>,
    /// Messages delivered to this listener, in delivery order
    pub incoming: BoxStream<'static, String>,
}

/// Factory for named broadcast channels
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn open(&self, channel: &str) -> Result<OpenChannel, BroadcastError>;
}
