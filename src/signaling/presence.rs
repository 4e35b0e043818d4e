//! Room presence announcements

use super::bus::SignalBus;
use super::envelope::{RoomId, Signal, SignalEnvelope, User};
use log::info;

/// Announces a participant in a room so later call-initiate messages
/// have a chance of reaching a live listener. Holds no state of its own.
#[derive(Debug, Clone)]
pub struct RoomPresence {
    bus: SignalBus,
}

impl RoomPresence {
    pub fn new(bus: SignalBus) -> Self {
        Self { bus }
    }

    /// Broadcast a `ping` for `user` in `room`
    pub fn announce(&self, room: &RoomId, user: &User) {
        info!("Announcing {} in room {}", user, room);
        self.bus.send(SignalEnvelope::new(Signal::Ping, room, user));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::envelope::{SignalKind, UserId};
    use crate::transport::{Broadcaster, LocalBroadcaster};
    use futures::StreamExt;

    #[tokio::test]
    async fn announce_sends_ping_for_room() {
        let broadcaster = LocalBroadcaster::new();
        let bus = SignalBus::connect(&broadcaster, "signals").await.unwrap();
        let mut observer = broadcaster.open("signals").await.unwrap();
        let presence = RoomPresence::new(bus);

        let user = User::new(UserId::from("u1"), "Ada");
        presence.announce(&RoomId::new("stream-alpha"), &user);

        let raw = observer.incoming.next().await.unwrap();
        let envelope = SignalEnvelope::from_json(&raw).unwrap();
        assert_eq!(envelope.kind(), SignalKind::Ping);
        assert_eq!(envelope.room_id.as_str(), "STREAM-ALPHA");
        assert_eq!(envelope.sender_name, "Ada");
    }
}
