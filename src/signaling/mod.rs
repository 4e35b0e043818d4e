//! Room signaling
//!
//! This module provides:
//! - The typed envelope contract exchanged between participants
//! - The signal bus fanning envelopes out to in-process consumers
//! - Room presence announcements

pub mod bus;
pub mod envelope;
pub mod presence;

pub use bus::{SignalBus, Subscription};
pub use envelope::{
    EnvelopeError, IceCandidate, RoomId, SdpKind, SessionDescription, Signal, SignalEnvelope,
    SignalKind, User, UserId,
};
pub use presence::RoomPresence;
