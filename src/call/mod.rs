//! Call lifecycle
//!
//! This module provides:
//! - `CallSessionMachine`: the per-participant call state machine
//! - `NegotiationEngine`: offer/answer/ICE exchange over a `MediaTransport`
//! - `CallAgent`: the event loop tying both to the signal bus and user commands

pub mod agent;
pub mod machine;
pub mod negotiation;

pub use agent::{AgentSnapshot, CallAgent, CallCommand, CallHandle};
pub use machine::{CallAction, CallContext, CallSession, CallSessionMachine, CallStatus, SessionId};
pub use negotiation::{EngineEvent, NegotiationEngine, NegotiationError};

use crate::analysis::AnalysisReport;
use crate::media::{ConnectionState, RemoteMedia, TrackKind};
use crate::signaling::{RoomId, User};
use std::fmt;

/// Why a call returned to absent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    Rejected,
    RemoteRejected,
    RoomChanged,
    Failed(String),
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::LocalHangup => f.write_str("hung up"),
            EndReason::RemoteHangup => f.write_str("peer hung up"),
            EndReason::Rejected => f.write_str("rejected"),
            EndReason::RemoteRejected => f.write_str("peer rejected the call"),
            EndReason::RoomChanged => f.write_str("left the room"),
            EndReason::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Observable call events, published by the agent
#[derive(Debug, Clone)]
pub enum CallEvent {
    Joined {
        room: RoomId,
        user: User,
    },
    StatusChanged {
        status: Option<CallStatus>,
        counterparty: Option<User>,
    },
    IncomingCall {
        from: User,
    },
    Ended {
        reason: EndReason,
    },
    PeerPresent {
        user: User,
    },
    RemoteMedia(RemoteMedia),
    ConnectionState(ConnectionState),
    MediaToggled {
        kind: TrackKind,
        enabled: bool,
    },
    Analysis(AnalysisReport),
}
