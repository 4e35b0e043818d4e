//! Negotiation engine
//!
//! Drives one transport session per call through offer, answer and ICE
//! candidate exchange. Every operation captures the engine epoch when it
//! starts and re-checks it after each await; `teardown()` bumps the epoch,
//! so a completion that outlived its call is discarded and whatever it
//! acquired is released by the guards it still owns.

use super::machine::{CallContext, SessionId};
use crate::media::{
    ConnectionState, MediaCapture, MediaConstraints, MediaError, MediaTransport, RemoteMedia,
    SessionConfig, SessionHandle, SessionSinks, TrackKind, TransportError, TransportSession,
};
use crate::signaling::{IceCandidate, SessionDescription, Signal, SignalBus, SignalEnvelope, User};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("Local media unavailable: {0}")]
    Media(#[from] MediaError),
    #[error("Failed to apply session description: {0}")]
    Apply(String),
    #[error("Transport failure: {0}")]
    Transport(String),
    #[error("Negotiation already started for {0}")]
    AlreadyStarted(SessionId),
    #[error("No transport session is open")]
    NoSession,
    #[error("Remote answer already applied")]
    AnswerAlreadyApplied,
    #[error("Negotiation superseded by teardown")]
    Cancelled,
}

impl NegotiationError {
    /// Whether the owning call must be aborted
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NegotiationError::Media(_) | NegotiationError::Apply(_) | NegotiationError::Transport(_)
        )
    }
}

fn transport_error(e: TransportError) -> NegotiationError {
    NegotiationError::Transport(e.to_string())
}

fn apply_error(e: TransportError) -> NegotiationError {
    NegotiationError::Apply(e.to_string())
}

/// Transport events forwarded to the call agent
#[derive(Debug, Clone)]
pub enum EngineEvent {
    RemoteMedia { session: SessionId, media: RemoteMedia },
    ConnectionState { session: SessionId, state: ConnectionState },
}

struct NegotiationSession {
    // Field order is drop order: close the transport before releasing capture.
    transport: TransportSession,
    local_media: MediaCapture,
    remote_media: Option<RemoteMedia>,
}

#[derive(Default)]
struct EngineState {
    epoch: u64,
    bound: Option<SessionId>,
    /// Highest session torn down; it and every older session stay rejected
    retired: Option<SessionId>,
    started: bool,
    negotiation: Option<NegotiationSession>,
    remote_description_set: bool,
    answer_applied: bool,
    pending_candidates: Vec<IceCandidate>,
    connection_state: ConnectionState,
}

impl EngineState {
    /// Bind to `session`, resetting per-call state when it is newer than the
    /// current binding. Returns false for a stale session.
    fn bind(&mut self, session: SessionId) -> bool {
        if self.is_retired(session) {
            return false;
        }
        match self.bound {
            Some(current) if current > session => false,
            Some(current) if current == session => true,
            _ => {
                self.bound = Some(session);
                self.started = false;
                self.remote_description_set = false;
                self.answer_applied = false;
                self.pending_candidates.clear();
                true
            }
        }
    }

    fn is_retired(&self, session: SessionId) -> bool {
        self.retired.is_some_and(|retired| session <= retired)
    }

    fn retire(&mut self, session: SessionId) {
        if !self.is_retired(session) {
            self.retired = Some(session);
        }
    }
}

struct EngineInner {
    transport: Arc<dyn MediaTransport>,
    bus: SignalBus,
    session_config: SessionConfig,
    constraints: MediaConstraints,
    events: mpsc::UnboundedSender<EngineEvent>,
    state: Mutex<EngineState>,
}

/// Owner of the single negotiation session
#[derive(Clone)]
pub struct NegotiationEngine {
    inner: Arc<EngineInner>,
}

impl NegotiationEngine {
    pub fn new(
        transport: Arc<dyn MediaTransport>,
        bus: SignalBus,
        session_config: SessionConfig,
        constraints: MediaConstraints,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                transport,
                bus,
                session_config,
                constraints,
                events,
                state: Mutex::new(EngineState::default()),
            }),
        }
    }

    /// Initiator side: capture, open, offer
    pub async fn initiate(&self, ctx: CallContext) -> Result<(), NegotiationError> {
        let epoch = self.begin(&ctx)?;
        info!("Starting negotiation for {} in room {}", ctx.session, ctx.room);

        let session = self.open(epoch, &ctx).await?;
        let offer = self
            .inner
            .transport
            .create_offer(&session)
            .await
            .map_err(transport_error)?;
        self.check(epoch)?;
        self.inner
            .transport
            .set_local_description(&session, &offer)
            .await
            .map_err(apply_error)?;
        self.check(epoch)?;

        self.inner
            .bus
            .send(SignalEnvelope::new(Signal::Offer(offer), &ctx.room, &ctx.local));
        Ok(())
    }

    /// Responder side: capture, open, apply the offer, answer
    pub async fn on_remote_offer(
        &self,
        ctx: CallContext,
        offer: SessionDescription,
        from: User,
    ) -> Result<(), NegotiationError> {
        let epoch = self.begin(&ctx)?;
        info!("Answering offer from {} for {}", from, ctx.session);

        let session = self.open(epoch, &ctx).await?;
        self.inner
            .transport
            .set_remote_description(&session, &offer)
            .await
            .map_err(apply_error)?;
        self.check(epoch)?;
        self.replay_candidates(epoch, &session).await?;

        let answer = self
            .inner
            .transport
            .create_answer(&session)
            .await
            .map_err(transport_error)?;
        self.check(epoch)?;
        self.inner
            .transport
            .set_local_description(&session, &answer)
            .await
            .map_err(apply_error)?;
        self.check(epoch)?;

        self.inner
            .bus
            .send(SignalEnvelope::new(Signal::Answer(answer), &ctx.room, &ctx.local));
        Ok(())
    }

    /// Initiator side: apply the single answer
    pub async fn on_remote_answer(
        &self,
        ctx: CallContext,
        answer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let (epoch, session) = {
            let mut state = self.inner.state.lock();
            if state.is_retired(ctx.session) || state.bound.is_some_and(|bound| bound != ctx.session) {
                return Err(NegotiationError::Cancelled);
            }
            let Some(negotiation) = &state.negotiation else {
                return Err(NegotiationError::NoSession);
            };
            let session = negotiation.transport.handle().clone();
            if state.answer_applied {
                return Err(NegotiationError::AnswerAlreadyApplied);
            }
            state.answer_applied = true;
            (state.epoch, session)
        };

        self.inner
            .transport
            .set_remote_description(&session, &answer)
            .await
            .map_err(apply_error)?;
        self.check(epoch)?;
        debug!("Applied remote answer for {}", ctx.session);
        self.replay_candidates(epoch, &session).await
    }

    /// Apply a remote candidate, or buffer it until the remote description is set
    pub async fn on_remote_candidate(
        &self,
        ctx: CallContext,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        let session = {
            let mut state = self.inner.state.lock();
            if !state.bind(ctx.session) {
                return Err(NegotiationError::Cancelled);
            }
            let ready = state
                .negotiation
                .as_ref()
                .filter(|_| state.remote_description_set)
                .map(|n| n.transport.handle().clone());
            match ready {
                Some(session) => session,
                None => {
                    state.pending_candidates.push(candidate);
                    debug!(
                        "Buffered remote candidate for {} ({} pending)",
                        ctx.session,
                        state.pending_candidates.len()
                    );
                    return Ok(());
                }
            }
        };

        self.add_candidate(&session, &candidate).await;
        Ok(())
    }

    /// Tear down `session` and refuse any operation for it or an older one
    /// that has not started yet.
    pub fn retire(&self, session: SessionId) {
        self.inner.state.lock().retire(session);
        self.teardown();
    }

    /// Close the session, release media, invalidate in-flight work. Idempotent.
    pub fn teardown(&self) {
        let released = {
            let mut state = self.inner.state.lock();
            if let Some(bound) = state.bound {
                state.retire(bound);
            }
            state.epoch += 1;
            state.bound = None;
            state.started = false;
            state.remote_description_set = false;
            state.answer_applied = false;
            state.pending_candidates.clear();
            state.connection_state = ConnectionState::Disconnected;
            state.negotiation.take()
        };

        if let Some(negotiation) = released {
            info!("Closing transport session {}", negotiation.transport.handle().id);
            drop(negotiation);
        }
    }

    /// Enable or disable a local track. Returns false without local media.
    pub fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> bool {
        let state = self.inner.state.lock();
        match &state.negotiation {
            Some(negotiation) => {
                negotiation.local_media.set_enabled(kind, enabled);
                true
            }
            None => false,
        }
    }

    pub fn has_local_media(&self) -> bool {
        self.inner.state.lock().negotiation.is_some()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.lock().connection_state
    }

    pub fn remote_media(&self) -> Option<RemoteMedia> {
        self.inner
            .state
            .lock()
            .negotiation
            .as_ref()
            .and_then(|n| n.remote_media.clone())
    }

    fn begin(&self, ctx: &CallContext) -> Result<u64, NegotiationError> {
        let mut state = self.inner.state.lock();
        if !state.bind(ctx.session) {
            return Err(NegotiationError::Cancelled);
        }
        if state.started {
            return Err(NegotiationError::AlreadyStarted(ctx.session));
        }
        state.started = true;
        Ok(state.epoch)
    }

    fn check(&self, epoch: u64) -> Result<(), NegotiationError> {
        if self.inner.state.lock().epoch == epoch {
            Ok(())
        } else {
            Err(NegotiationError::Cancelled)
        }
    }

    /// Acquire media and open a session carrying every local track
    async fn open(&self, epoch: u64, ctx: &CallContext) -> Result<SessionHandle, NegotiationError> {
        let capture = MediaCapture::acquire(self.inner.transport.clone(), self.inner.constraints).await?;
        self.check(epoch)?;

        let transport = TransportSession::open(
            self.inner.transport.clone(),
            &self.inner.session_config,
            self.sinks(epoch, ctx),
        )
        .await
        .map_err(transport_error)?;
        self.check(epoch)?;

        for track in &capture.handle().tracks {
            self.inner
                .transport
                .add_local_track(transport.handle(), capture.handle(), track)
                .await
                .map_err(transport_error)?;
            self.check(epoch)?;
        }

        let session = transport.handle().clone();
        let mut state = self.inner.state.lock();
        if state.epoch != epoch {
            drop(state);
            return Err(NegotiationError::Cancelled);
        }
        state.negotiation = Some(NegotiationSession {
            transport,
            local_media: capture,
            remote_media: None,
        });
        state.connection_state = ConnectionState::New;
        Ok(session)
    }

    /// Drain buffered candidates in arrival order, then mark the remote
    /// description as set. Candidates arriving meanwhile join the queue.
    async fn replay_candidates(&self, epoch: u64, session: &SessionHandle) -> Result<(), NegotiationError> {
        loop {
            let next = {
                let mut state = self.inner.state.lock();
                if state.epoch != epoch {
                    return Err(NegotiationError::Cancelled);
                }
                if state.pending_candidates.is_empty() {
                    state.remote_description_set = true;
                    return Ok(());
                }
                state.pending_candidates.remove(0)
            };
            self.add_candidate(session, &next).await;
        }
    }

    async fn add_candidate(&self, session: &SessionHandle, candidate: &IceCandidate) {
        if let Err(e) = self.inner.transport.add_remote_candidate(session, candidate).await {
            warn!("Ignoring remote candidate: {}", e);
        }
    }

    fn sinks(&self, epoch: u64, ctx: &CallContext) -> SessionSinks {
        let weak = Arc::downgrade(&self.inner);
        let session = ctx.session;

        let on_local_candidate = {
            let weak = weak.clone();
            let room = ctx.room.clone();
            let local = ctx.local.clone();
            Arc::new(move |candidate: IceCandidate| {
                let Some(inner) = live(&weak, epoch) else { return };
                inner
                    .bus
                    .send(SignalEnvelope::new(Signal::Candidate(candidate), &room, &local));
            })
        };

        let on_remote_media = {
            let weak = weak.clone();
            Arc::new(move |media: RemoteMedia| {
                let Some(inner) = live(&weak, epoch) else { return };
                if let Some(negotiation) = inner.state.lock().negotiation.as_mut() {
                    negotiation.remote_media = Some(media.clone());
                }
                let _ = inner.events.send(EngineEvent::RemoteMedia { session, media });
            })
        };

        let on_connection_state = Arc::new(move |state: ConnectionState| {
            let Some(inner) = live(&weak, epoch) else { return };
            inner.state.lock().connection_state = state;
            let _ = inner.events.send(EngineEvent::ConnectionState { session, state });
        });

        SessionSinks {
            on_local_candidate,
            on_remote_media,
            on_connection_state,
        }
    }
}

/// The engine, if it is still alive and still on `epoch`
fn live(weak: &Weak<EngineInner>, epoch: u64) -> Option<Arc<EngineInner>> {
    let inner = weak.upgrade()?;
    let current = inner.state.lock().epoch == epoch;
    current.then_some(inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::mock::MockTransport;
    use crate::signaling::{RoomId, SignalKind, UserId};
    use crate::transport::{Broadcaster, LocalBroadcaster, OpenChannel};
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Harness {
        engine: NegotiationEngine,
        mock: Arc<MockTransport>,
        observer: OpenChannel,
        events: mpsc::UnboundedReceiver<EngineEvent>,
    }

    async fn harness() -> Harness {
        let broadcaster = LocalBroadcaster::new();
        let bus = SignalBus::connect(&broadcaster, "signals").await.unwrap();
        let observer = broadcaster.open("signals").await.unwrap();
        let mock = Arc::new(MockTransport::new());
        let (tx, events) = mpsc::unbounded_channel();
        let engine = NegotiationEngine::new(
            mock.clone(),
            bus,
            SessionConfig::default(),
            MediaConstraints::default(),
            tx,
        );
        Harness {
            engine,
            mock,
            observer,
            events,
        }
    }

    fn ctx(session: u64) -> CallContext {
        CallContext {
            session: SessionId::from_raw(session),
            room: RoomId::new("R"),
            local: User::new(UserId::from("alice"), "Alice"),
        }
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{} 1 udp 2122260223 10.0.0.{} 5000 typ host", n, n),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    fn bob() -> User {
        User::new(UserId::from("bob"), "Bob")
    }

    async fn next_kind(observer: &mut OpenChannel) -> Option<SignalKind> {
        let raw = timeout(Duration::from_millis(200), observer.incoming.next()).await.ok()??;
        Some(SignalEnvelope::from_json(&raw).unwrap().kind())
    }

    #[tokio::test]
    async fn initiate_sends_offer_once() {
        let mut h = harness().await;
        h.engine.initiate(ctx(1)).await.unwrap();
        assert_eq!(next_kind(&mut h.observer).await, Some(SignalKind::Offer));

        let err = h.engine.initiate(ctx(1)).await.unwrap_err();
        assert!(matches!(err, NegotiationError::AlreadyStarted(_)));

        let state = h.mock.snapshot();
        assert_eq!(state.media_acquired, 1);
        assert_eq!(state.offers_created, 1);
        assert_eq!(state.tracks_added, 2);
        assert!(h.engine.has_local_media());
        assert_eq!(h.engine.connection_state(), ConnectionState::New);
    }

    #[tokio::test]
    async fn permission_denied_leaves_no_session() {
        let h = harness().await;
        h.mock.fail_media(MediaError::PermissionDenied);

        let err = h.engine.initiate(ctx(1)).await.unwrap_err();
        assert!(matches!(err, NegotiationError::Media(MediaError::PermissionDenied)));
        assert!(err.is_fatal());
        assert!(!h.engine.has_local_media());
        assert_eq!(h.mock.snapshot().sessions_opened, 0);
    }

    #[tokio::test]
    async fn teardown_twice_releases_once() {
        let h = harness().await;
        h.engine.initiate(ctx(1)).await.unwrap();

        h.engine.teardown();
        h.engine.teardown();

        let state = h.mock.snapshot();
        assert_eq!(state.media_released, 1);
        assert_eq!(state.sessions_closed, 1);
        assert!(!h.engine.has_local_media());
        assert_eq!(h.engine.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn early_candidates_replayed_in_order_after_offer() {
        let mut h = harness().await;
        h.engine.on_remote_candidate(ctx(1), candidate(1)).await.unwrap();
        h.engine.on_remote_candidate(ctx(1), candidate(2)).await.unwrap();
        assert!(h.mock.snapshot().remote_candidates.is_empty());

        h.engine
            .on_remote_offer(ctx(1), SessionDescription::offer("v=0 remote"), bob())
            .await
            .unwrap();
        assert_eq!(next_kind(&mut h.observer).await, Some(SignalKind::Answer));

        h.engine.on_remote_candidate(ctx(1), candidate(3)).await.unwrap();
        let state = h.mock.snapshot();
        assert_eq!(state.remote_candidates, vec![candidate(1), candidate(2), candidate(3)]);
        assert_eq!(state.answers_created, 1);
    }

    #[tokio::test]
    async fn answer_applied_only_once() {
        let h = harness().await;
        let err = h
            .engine
            .on_remote_answer(ctx(1), SessionDescription::answer("v=0"))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::NoSession));

        h.engine.initiate(ctx(1)).await.unwrap();
        h.engine.on_remote_candidate(ctx(1), candidate(1)).await.unwrap();
        h.engine
            .on_remote_answer(ctx(1), SessionDescription::answer("v=0 answer"))
            .await
            .unwrap();
        let err = h
            .engine
            .on_remote_answer(ctx(1), SessionDescription::answer("v=0 again"))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::AnswerAlreadyApplied));
        assert!(!err.is_fatal());

        let state = h.mock.snapshot();
        assert_eq!(state.remote_descriptions.len(), 1);
        assert_eq!(state.remote_candidates, vec![candidate(1)]);
    }

    #[tokio::test]
    async fn rejected_offer_is_fatal() {
        let h = harness().await;
        h.mock.reject_remote_descriptions();
        let err = h
            .engine
            .on_remote_offer(ctx(1), SessionDescription::offer("garbage"), bob())
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::Apply(_)));
        assert!(err.is_fatal());

        h.engine.teardown();
        assert_eq!(h.mock.snapshot().sessions_closed, 1);
    }

    #[tokio::test]
    async fn teardown_during_media_acquisition_discards_completion() {
        let mut h = harness().await;
        let gate = h.mock.gate_media();

        let engine = h.engine.clone();
        let pending = tokio::spawn(async move { engine.initiate(ctx(1)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.engine.teardown();
        gate.notify_one();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, NegotiationError::Cancelled));
        assert!(!err.is_fatal());

        let state = h.mock.snapshot();
        assert_eq!(state.media_acquired, 1);
        assert_eq!(state.media_released, 1);
        assert_eq!(state.sessions_opened, 0);
        assert_eq!(next_kind(&mut h.observer).await, None);
    }

    #[tokio::test]
    async fn local_candidates_sent_until_teardown() {
        let mut h = harness().await;
        h.engine.initiate(ctx(1)).await.unwrap();
        assert_eq!(next_kind(&mut h.observer).await, Some(SignalKind::Offer));

        h.mock.emit_local_candidate(candidate(9));
        assert_eq!(next_kind(&mut h.observer).await, Some(SignalKind::Candidate));

        h.mock.emit_connection_state(ConnectionState::Connected);
        assert_eq!(h.engine.connection_state(), ConnectionState::Connected);
        assert!(matches!(
            h.events.recv().await,
            Some(EngineEvent::ConnectionState { state: ConnectionState::Connected, .. })
        ));

        let stale = h.mock.clone();
        h.engine.teardown();
        stale.emit_local_candidate(candidate(10));
        assert_eq!(next_kind(&mut h.observer).await, None);
    }

    #[tokio::test]
    async fn remote_media_recorded() {
        let mut h = harness().await;
        h.engine.initiate(ctx(1)).await.unwrap();
        let media = RemoteMedia {
            stream_id: "remote".to_string(),
            track_id: "video-1".to_string(),
            kind: TrackKind::Video,
        };
        h.mock.emit_remote_media(media.clone());

        assert_eq!(h.engine.remote_media(), Some(media.clone()));
        assert!(matches!(h.events.recv().await, Some(EngineEvent::RemoteMedia { media: m, .. }) if m == media));

        h.engine.teardown();
        assert_eq!(h.engine.remote_media(), None);
    }

    #[tokio::test]
    async fn track_toggle_requires_media() {
        let h = harness().await;
        assert!(!h.engine.set_track_enabled(TrackKind::Audio, false));

        h.engine.initiate(ctx(1)).await.unwrap();
        assert!(h.engine.set_track_enabled(TrackKind::Audio, false));
        assert_eq!(h.mock.snapshot().track_toggles, vec![(TrackKind::Audio, false)]);
    }

    #[tokio::test]
    async fn retired_session_never_starts() {
        let mut h = harness().await;
        h.engine.retire(SessionId::from_raw(1));

        assert!(matches!(h.engine.initiate(ctx(1)).await, Err(NegotiationError::Cancelled)));
        assert!(matches!(
            h.engine
                .on_remote_offer(ctx(1), SessionDescription::offer("v=0 late"), bob())
                .await,
            Err(NegotiationError::Cancelled)
        ));
        assert!(matches!(
            h.engine.on_remote_candidate(ctx(1), candidate(1)).await,
            Err(NegotiationError::Cancelled)
        ));

        let state = h.mock.snapshot();
        assert_eq!(state.media_acquired, 0);
        assert_eq!(state.sessions_opened, 0);
        assert_eq!(next_kind(&mut h.observer).await, None);

        h.engine.initiate(ctx(2)).await.unwrap();
        assert_eq!(next_kind(&mut h.observer).await, Some(SignalKind::Offer));
    }

    #[tokio::test]
    async fn torn_down_session_cannot_rebind() {
        let h = harness().await;
        h.engine.on_remote_candidate(ctx(1), candidate(1)).await.unwrap();
        h.engine.teardown();

        assert!(matches!(h.engine.initiate(ctx(1)).await, Err(NegotiationError::Cancelled)));
        assert!(matches!(
            h.engine.on_remote_answer(ctx(1), SessionDescription::answer("v=0")).await,
            Err(NegotiationError::Cancelled)
        ));
        assert_eq!(h.mock.snapshot().media_acquired, 0);
    }

    #[tokio::test]
    async fn stale_session_operations_are_cancelled() {
        let h = harness().await;
        h.engine.initiate(ctx(2)).await.unwrap();
        let err = h.engine.on_remote_candidate(ctx(1), candidate(1)).await.unwrap_err();
        assert!(matches!(err, NegotiationError::Cancelled));
        assert!(matches!(h.engine.initiate(ctx(1)).await, Err(NegotiationError::Cancelled)));
    }
}
