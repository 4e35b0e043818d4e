//! roomcall - room-scoped peer-to-peer calling
//!
//! Participants join a named room over a shared broadcast channel, ring each
//! other, and negotiate a WebRTC media session through offer/answer and ICE
//! candidate exchange.

pub mod analysis;
pub mod call;
pub mod config;
pub mod media;
pub mod profile;
pub mod signaling;
pub mod transport;

// Re-exports
pub use analysis::{AnalysisReport, AnalysisService, TranscriptAnalyzer};
pub use call::{CallAgent, CallEvent, CallHandle, CallSessionMachine, CallStatus, NegotiationEngine};
pub use config::Config;
pub use media::{MediaTransport, TransportError};
pub use profile::ProfileStore;
pub use signaling::{RoomId, SignalBus, SignalEnvelope, User};
pub use transport::{Broadcaster, LocalBroadcaster, RelayServer, WsBroadcaster};
