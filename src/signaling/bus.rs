//! Signal bus
//!
//! Pub/sub fan-out of decoded [`SignalEnvelope`]s on top of one broadcast
//! channel. One bus is created at start-up, handed to every consumer, and
//! closed at shutdown.
//!
//! Sending is fire-and-forget: delivery failures are logged and swallowed.
//! Filtering by room and sender is left to subscribers, since different
//! consumers apply different predicates to the same stream.

use super::envelope::SignalEnvelope;
use crate::transport::{BroadcastError, Broadcaster, ChannelSender, OpenChannel};
use futures::StreamExt;
use log::{debug, error, warn};
use parking_lot::{Mutex, RwLock};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

/// Envelope handler registered on the bus
pub type SignalHandler = Arc<dyn Fn(&SignalEnvelope) + Send + Sync>;

struct BusInner {
    channel_name: String,
    sender: Box<dyn ChannelSender>,
    handlers: RwLock<Vec<(u64, SignalHandler)>>,
    next_handler_id: AtomicU64,
    closed: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl BusInner {
    fn dispatch(&self, envelope: &SignalEnvelope) {
        // Snapshot so handlers may (un)subscribe while being called.
        let handlers: Vec<SignalHandler> = self.handlers.read().iter().map(|(_, h)| h.clone()).collect();
        for handler in handlers {
            let result = panic::catch_unwind(AssertUnwindSafe(|| handler(envelope)));
            if result.is_err() {
                error!(
                    "Signal handler panicked on {} from {}; continuing delivery",
                    envelope.kind(),
                    envelope.sender_id
                );
            }
        }
    }
}

/// Shared handle to the signaling channel
#[derive(Clone)]
pub struct SignalBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for SignalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalBus")
            .field("channel", &self.inner.channel_name)
            .field("handlers", &self.inner.handlers.read().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SignalBus {
    /// Open `channel_name` on `broadcaster` and start dispatching
    pub async fn connect(
        broadcaster: &dyn Broadcaster,
        channel_name: &str,
    ) -> Result<Self, BroadcastError> {
        let channel = broadcaster.open(channel_name).await?;
        Ok(Self::from_channel(channel_name, channel))
    }

    /// Wrap an already open channel. Must be called within a tokio runtime.
    pub fn from_channel(channel_name: &str, channel: OpenChannel) -> Self {
        let OpenChannel { sender, mut incoming } = channel;
        let inner = Arc::new(BusInner {
            channel_name: channel_name.to_string(),
            sender,
            handlers: RwLock::new(Vec::new()),
            next_handler_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            pump: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let pump = tokio::spawn(async move {
            while let Some(raw) = incoming.next().await {
                let Some(inner) = weak.upgrade() else { break };
                match SignalEnvelope::from_json(&raw) {
                    Ok(envelope) => inner.dispatch(&envelope),
                    Err(e) => warn!("Dropping undecodable signal on {}: {}", inner.channel_name, e),
                }
            }
            debug!("Signal bus pump finished");
        });
        *inner.pump.lock() = Some(pump);

        Self { inner }
    }

    /// Stamp and broadcast an envelope. Never fails from the caller's view.
    pub fn send(&self, mut envelope: SignalEnvelope) {
        if self.is_closed() {
            warn!(
                "Dropping {} for room {}: signal bus {} is closed",
                envelope.kind(),
                envelope.room_id,
                self.inner.channel_name
            );
            return;
        }

        envelope.timestamp = Some(now_millis());
        let json = match envelope.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to encode {} envelope: {}", envelope.kind(), e);
                return;
            }
        };

        match self.inner.sender.post_message(json) {
            Ok(()) => debug!("Sent {} for room {}", envelope.kind(), envelope.room_id),
            Err(e) => warn!("Signal delivery failed ({}): {}", envelope.kind(), e),
        }
    }

    /// Register a handler for every received envelope
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SignalEnvelope) + Send + Sync + 'static,
    {
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.write().push((id, Arc::new(handler)));
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Number of registered handlers
    pub fn handler_count(&self) -> usize {
        self.inner.handlers.read().len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Release the channel. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.sender.close();
        if let Some(pump) = self.inner.pump.lock().take() {
            pump.abort();
        }
        debug!("Signal bus {} closed", self.inner.channel_name);
    }
}

/// Registration token; dropping it removes the handler
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Remove the handler; same as dropping the token
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.handlers.write().retain(|(id, _)| *id != self.id);
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
