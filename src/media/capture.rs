//! Scoped media and session ownership
//!
//! Capture devices and transport sessions are released when their guard is
//! dropped, so every exit path (teardown, failure, cancelled task, process
//! shutdown) gives them back exactly once.

use super::{
    MediaConstraints, MediaError, MediaHandle, MediaTransport, SessionConfig, SessionHandle,
    SessionSinks, TrackKind, TransportError,
};
use log::{debug, info};
use std::sync::Arc;

/// Owned local media capture
pub struct MediaCapture {
    transport: Arc<dyn MediaTransport>,
    handle: MediaHandle,
}

impl MediaCapture {
    /// Acquire local media from `transport`
    pub async fn acquire(
        transport: Arc<dyn MediaTransport>,
        constraints: MediaConstraints,
    ) -> Result<Self, MediaError> {
        let handle = transport.get_local_media(constraints).await?;
        info!("Acquired local media {} ({} tracks)", handle.id, handle.tracks.len());
        Ok(Self { transport, handle })
    }

    pub fn handle(&self) -> &MediaHandle {
        &self.handle
    }

    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        self.transport.set_track_enabled(&self.handle, kind, enabled);
    }
}

impl Drop for MediaCapture {
    fn drop(&mut self) {
        self.transport.release_media(&self.handle);
        debug!("Released local media {}", self.handle.id);
    }
}

/// Owned transport session
pub struct TransportSession {
    transport: Arc<dyn MediaTransport>,
    handle: SessionHandle,
}

impl TransportSession {
    /// Open a session on `transport` with the given event sinks
    pub async fn open(
        transport: Arc<dyn MediaTransport>,
        config: &SessionConfig,
        sinks: SessionSinks,
    ) -> Result<Self, TransportError> {
        let handle = transport.open_session(config, sinks).await?;
        debug!("Opened transport session {}", handle.id);
        Ok(Self { transport, handle })
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.transport.close_session(&self.handle);
        debug!("Closed transport session {}", self.handle.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::mock::MockTransport;

    #[tokio::test]
    async fn capture_released_on_drop() {
        let mock = Arc::new(MockTransport::new());
        let capture = MediaCapture::acquire(mock.clone(), MediaConstraints::default())
            .await
            .unwrap();
        assert_eq!(capture.handle().tracks.len(), 2);
        assert_eq!(mock.snapshot().media_released, 0);

        drop(capture);
        assert_eq!(mock.snapshot().media_released, 1);
    }

    #[tokio::test]
    async fn session_closed_on_drop() {
        let mock = Arc::new(MockTransport::new());
        let session = TransportSession::open(mock.clone(), &SessionConfig::default(), MockTransport::noop_sinks())
            .await
            .unwrap();
        drop(session);
        let state = mock.snapshot();
        assert_eq!(state.sessions_opened, 1);
        assert_eq!(state.sessions_closed, 1);
    }
}
