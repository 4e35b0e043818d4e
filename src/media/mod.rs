//! Media transport abstraction
//!
//! This module provides:
//! - The `MediaTransport` capability the negotiation engine drives
//! - Scoped guards that release capture devices and close sessions on drop
//! - A webrtc-rs backed transport (feature `webrtc-transport`)

pub mod capture;
#[cfg(feature = "webrtc-transport")]
pub mod peer_connection;
#[cfg(test)]
pub(crate) mod mock;

pub use capture::{MediaCapture, TransportSession};
#[cfg(feature = "webrtc-transport")]
pub use peer_connection::WebRtcTransport;

use crate::config::IceServerConfig;
use crate::signaling::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Local media acquisition failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("Permission to capture media was denied")]
    PermissionDenied,
    #[error("No media device available: {0}")]
    DeviceUnavailable(String),
}

/// Transport session failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("SDP error: {0}")]
    Sdp(String),
    #[error("ICE error: {0}")]
    Ice(String),
    #[error("Media error: {0}")]
    Media(String),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
}

/// Peer connection state as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    #[default]
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which local media kinds to capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// A single local track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// Captured local media
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaHandle {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
}

/// Remote media announced by the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteMedia {
    pub stream_id: String,
    pub track_id: String,
    pub kind: TrackKind,
}

/// An open transport session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    pub id: String,
}

/// Transport session settings
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub ice_servers: Vec<IceServerConfig>,
}

/// Callback for locally gathered ICE candidates
pub type CandidateSink = Arc<dyn Fn(IceCandidate) + Send + Sync>;

/// Callback for remote tracks becoming available
pub type RemoteMediaSink = Arc<dyn Fn(RemoteMedia) + Send + Sync>;

/// Callback for connection state changes
pub type ConnectionStateSink = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Event sinks registered when a session is opened
#[derive(Clone)]
pub struct SessionSinks {
    pub on_local_candidate: CandidateSink,
    pub on_remote_media: RemoteMediaSink,
    pub on_connection_state: ConnectionStateSink,
}

/// Platform media capture and peer-to-peer transport primitives.
///
/// Sinks may be invoked from any task. Implementations must not invoke them
/// synchronously from `release_media` or `close_session`.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn get_local_media(&self, constraints: MediaConstraints) -> Result<MediaHandle, MediaError>;

    fn release_media(&self, media: &MediaHandle);

    fn set_track_enabled(&self, media: &MediaHandle, kind: TrackKind, enabled: bool);

    async fn open_session(
        &self,
        config: &SessionConfig,
        sinks: SessionSinks,
    ) -> Result<SessionHandle, TransportError>;

    async fn add_local_track(
        &self,
        session: &SessionHandle,
        media: &MediaHandle,
        track: &MediaTrack,
    ) -> Result<(), TransportError>;

    async fn create_offer(&self, session: &SessionHandle) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self, session: &SessionHandle) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(
        &self,
        session: &SessionHandle,
        description: &SessionDescription,
    ) -> Result<(), TransportError>;

    async fn set_remote_description(
        &self,
        session: &SessionHandle,
        description: &SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_remote_candidate(
        &self,
        session: &SessionHandle,
        candidate: &IceCandidate,
    ) -> Result<(), TransportError>;

    fn close_session(&self, session: &SessionHandle);
}
