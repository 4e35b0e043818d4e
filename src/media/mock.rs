//! In-memory transport for tests

use super::{
    ConnectionState, MediaConstraints, MediaError, MediaHandle, MediaTrack, MediaTransport,
    RemoteMedia, SessionConfig, SessionHandle, SessionSinks, TrackKind, TransportError,
};
use crate::signaling::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Counters and recorded calls
#[derive(Debug, Clone, Default)]
pub struct MockState {
    pub media_acquired: usize,
    pub media_released: usize,
    pub sessions_opened: usize,
    pub sessions_closed: usize,
    pub tracks_added: usize,
    pub offers_created: usize,
    pub answers_created: usize,
    pub local_descriptions: Vec<SessionDescription>,
    pub remote_descriptions: Vec<SessionDescription>,
    pub remote_candidates: Vec<IceCandidate>,
    pub track_toggles: Vec<(TrackKind, bool)>,
}

pub struct MockTransport {
    state: Mutex<MockState>,
    sinks: Mutex<Option<SessionSinks>>,
    media_failure: Mutex<Option<MediaError>>,
    reject_remote_description: Mutex<bool>,
    media_gate: Mutex<Option<Arc<Notify>>>,
    next_id: AtomicU64,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            sinks: Mutex::new(None),
            media_failure: Mutex::new(None),
            reject_remote_description: Mutex::new(false),
            media_gate: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Make `get_local_media` fail with `error`
    pub fn fail_media(&self, error: MediaError) {
        *self.media_failure.lock() = Some(error);
    }

    /// Make `set_remote_description` fail
    pub fn reject_remote_descriptions(&self) {
        *self.reject_remote_description.lock() = true;
    }

    /// Hold `get_local_media` until the returned gate is notified
    pub fn gate_media(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.media_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn snapshot(&self) -> MockState {
        self.state.lock().clone()
    }

    pub fn noop_sinks() -> SessionSinks {
        SessionSinks {
            on_local_candidate: Arc::new(|_| {}),
            on_remote_media: Arc::new(|_| {}),
            on_connection_state: Arc::new(|_| {}),
        }
    }

    /// Report a locally gathered candidate through the last opened session
    pub fn emit_local_candidate(&self, candidate: IceCandidate) {
        let sinks = self.sinks.lock().clone();
        if let Some(sinks) = sinks {
            (sinks.on_local_candidate)(candidate);
        }
    }

    pub fn emit_remote_media(&self, media: RemoteMedia) {
        let sinks = self.sinks.lock().clone();
        if let Some(sinks) = sinks {
            (sinks.on_remote_media)(media);
        }
    }

    pub fn emit_connection_state(&self, state: ConnectionState) {
        let sinks = self.sinks.lock().clone();
        if let Some(sinks) = sinks {
            (sinks.on_connection_state)(state);
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait]
impl MediaTransport for MockTransport {
    async fn get_local_media(&self, constraints: MediaConstraints) -> Result<MediaHandle, MediaError> {
        let gate = self.media_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(error) = self.media_failure.lock().clone() {
            return Err(error);
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack {
                id: self.next_id("audio"),
                kind: TrackKind::Audio,
            });
        }
        if constraints.video {
            tracks.push(MediaTrack {
                id: self.next_id("video"),
                kind: TrackKind::Video,
            });
        }
        self.state.lock().media_acquired += 1;
        Ok(MediaHandle {
            id: self.next_id("media"),
            tracks,
        })
    }

    fn release_media(&self, _media: &MediaHandle) {
        self.state.lock().media_released += 1;
    }

    fn set_track_enabled(&self, _media: &MediaHandle, kind: TrackKind, enabled: bool) {
        self.state.lock().track_toggles.push((kind, enabled));
    }

    async fn open_session(
        &self,
        _config: &SessionConfig,
        sinks: SessionSinks,
    ) -> Result<SessionHandle, TransportError> {
        *self.sinks.lock() = Some(sinks);
        self.state.lock().sessions_opened += 1;
        Ok(SessionHandle {
            id: self.next_id("session"),
        })
    }

    async fn add_local_track(
        &self,
        _session: &SessionHandle,
        _media: &MediaHandle,
        _track: &MediaTrack,
    ) -> Result<(), TransportError> {
        self.state.lock().tracks_added += 1;
        Ok(())
    }

    async fn create_offer(&self, session: &SessionHandle) -> Result<SessionDescription, TransportError> {
        self.state.lock().offers_created += 1;
        Ok(SessionDescription::offer(format!("v=0 offer {}", session.id)))
    }

    async fn create_answer(&self, session: &SessionHandle) -> Result<SessionDescription, TransportError> {
        let mut state = self.state.lock();
        if state.remote_descriptions.is_empty() {
            return Err(TransportError::Sdp("no remote offer".to_string()));
        }
        state.answers_created += 1;
        Ok(SessionDescription::answer(format!("v=0 answer {}", session.id)))
    }

    async fn set_local_description(
        &self,
        _session: &SessionHandle,
        description: &SessionDescription,
    ) -> Result<(), TransportError> {
        self.state.lock().local_descriptions.push(description.clone());
        Ok(())
    }

    async fn set_remote_description(
        &self,
        _session: &SessionHandle,
        description: &SessionDescription,
    ) -> Result<(), TransportError> {
        if *self.reject_remote_description.lock() {
            return Err(TransportError::Sdp("malformed remote description".to_string()));
        }
        self.state.lock().remote_descriptions.push(description.clone());
        Ok(())
    }

    async fn add_remote_candidate(
        &self,
        _session: &SessionHandle,
        candidate: &IceCandidate,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.remote_descriptions.is_empty() {
            return Err(TransportError::Ice("remote description not set".to_string()));
        }
        state.remote_candidates.push(candidate.clone());
        Ok(())
    }

    fn close_session(&self, _session: &SessionHandle) {
        self.sinks.lock().take();
        self.state.lock().sessions_closed += 1;
    }
}
