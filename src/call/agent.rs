//! Call agent
//!
//! The single owner of the call state. One task receives user commands,
//! admitted envelopes and transport events, feeds them through the
//! [`CallSessionMachine`] and executes the resulting actions. Negotiation
//! steps run as spawned tasks; their failures come back through a queue and
//! are checked against the live session before they can end a call.

use super::machine::{CallAction, CallSessionMachine, CallStatus, SessionId};
use super::negotiation::{EngineEvent, NegotiationEngine, NegotiationError};
use super::{CallContext, CallEvent};
use crate::analysis::AnalysisService;
use crate::config::MediaConfig;
use crate::media::{ConnectionState, MediaConstraints, MediaTransport, RemoteMedia, SessionConfig, TrackKind};
use crate::profile::ProfileStore;
use crate::signaling::{
    IceCandidate, RoomId, RoomPresence, SignalBus, SignalEnvelope, Subscription, User, UserId,
};
use log::{debug, info, warn};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};

const EVENT_CAPACITY: usize = 128;

/// User intents, all fire-and-forget
#[derive(Debug, Clone)]
pub enum CallCommand {
    Join { room: String, display_name: String },
    StartCall,
    AcceptCall,
    RejectCall,
    EndCall,
    ToggleMic,
    ToggleVideo,
    RequestAnalysis { transcript: String },
    Shutdown,
}

/// Point-in-time view of the agent
#[derive(Debug, Clone)]
pub struct AgentSnapshot {
    pub user: Option<User>,
    pub room: Option<RoomId>,
    pub status: Option<CallStatus>,
    pub counterparty: Option<User>,
    pub connection: ConnectionState,
    pub remote_media: Option<RemoteMedia>,
    pub mic_enabled: bool,
    pub video_enabled: bool,
}

impl Default for AgentSnapshot {
    fn default() -> Self {
        Self {
            user: None,
            room: None,
            status: None,
            counterparty: None,
            connection: ConnectionState::Disconnected,
            remote_media: None,
            mic_enabled: true,
            video_enabled: true,
        }
    }
}

/// Command and event surface of a running agent
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::UnboundedSender<CallCommand>,
    events: broadcast::Sender<CallEvent>,
    snapshot: watch::Receiver<AgentSnapshot>,
}

impl CallHandle {
    pub fn send(&self, command: CallCommand) {
        if self.commands.send(command).is_err() {
            warn!("Call agent is not running; command dropped");
        }
    }

    pub fn join(&self, room: &str, display_name: &str) {
        self.send(CallCommand::Join {
            room: room.to_string(),
            display_name: display_name.to_string(),
        });
    }

    pub fn start_call(&self) {
        self.send(CallCommand::StartCall);
    }

    pub fn accept(&self) {
        self.send(CallCommand::AcceptCall);
    }

    pub fn reject(&self) {
        self.send(CallCommand::RejectCall);
    }

    pub fn hang_up(&self) {
        self.send(CallCommand::EndCall);
    }

    pub fn toggle_mic(&self) {
        self.send(CallCommand::ToggleMic);
    }

    pub fn toggle_video(&self) {
        self.send(CallCommand::ToggleVideo);
    }

    pub fn request_analysis(&self, transcript: &str) {
        self.send(CallCommand::RequestAnalysis {
            transcript: transcript.to_string(),
        });
    }

    pub fn shutdown(&self) {
        self.send(CallCommand::Shutdown);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        self.snapshot.borrow().clone()
    }
}

pub struct CallAgent {
    machine: CallSessionMachine,
    engine: NegotiationEngine,
    bus: SignalBus,
    presence: RoomPresence,
    analysis: AnalysisService,
    profile: Option<ProfileStore>,
    local_id: UserId,
    mic_enabled: bool,
    video_enabled: bool,
    commands: mpsc::UnboundedReceiver<CallCommand>,
    envelopes: mpsc::UnboundedReceiver<SignalEnvelope>,
    engine_events: mpsc::UnboundedReceiver<EngineEvent>,
    failures_tx: mpsc::UnboundedSender<(SessionId, NegotiationError)>,
    failures: mpsc::UnboundedReceiver<(SessionId, NegotiationError)>,
    candidates: mpsc::UnboundedSender<(CallContext, IceCandidate)>,
    events: broadcast::Sender<CallEvent>,
    snapshot: watch::Sender<AgentSnapshot>,
    _subscription: Subscription,
}

impl CallAgent {
    /// Create an agent bound to `bus`. Must be called within a tokio runtime.
    pub fn new(
        bus: SignalBus,
        transport: Arc<dyn MediaTransport>,
        media: &MediaConfig,
        analysis: AnalysisService,
        profile: Option<ProfileStore>,
    ) -> (Self, CallHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (envelopes_tx, envelopes) = mpsc::unbounded_channel();
        let (engine_tx, engine_events) = mpsc::unbounded_channel();
        let (failures_tx, failures) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (snapshot, snapshot_rx) = watch::channel(AgentSnapshot::default());

        let subscription = bus.subscribe(move |envelope: &SignalEnvelope| {
            let _ = envelopes_tx.send(envelope.clone());
        });

        let engine = NegotiationEngine::new(
            transport,
            bus.clone(),
            SessionConfig {
                ice_servers: media.ice_servers.clone(),
            },
            MediaConstraints {
                video: media.video,
                audio: media.audio,
            },
            engine_tx,
        );
        let candidates = spawn_candidate_worker(engine.clone());

        let handle = CallHandle {
            commands: commands_tx,
            events: events.clone(),
            snapshot: snapshot_rx,
        };
        let agent = Self {
            machine: CallSessionMachine::new(),
            engine,
            presence: RoomPresence::new(bus.clone()),
            bus,
            analysis,
            profile,
            local_id: UserId::generate(),
            mic_enabled: true,
            video_enabled: true,
            commands,
            envelopes,
            engine_events,
            failures_tx,
            failures,
            candidates,
            events,
            snapshot,
            _subscription: subscription,
        };
        (agent, handle)
    }

    /// Process commands and signals until shutdown
    pub async fn run(mut self) {
        info!("Call agent started ({})", self.local_id);
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(CallCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(envelope) = self.envelopes.recv() => {
                    let actions = self.machine.handle_envelope(&envelope);
                    self.execute(actions);
                }
                Some(event) = self.engine_events.recv() => self.handle_engine_event(event),
                Some((session, error)) = self.failures.recv() => {
                    warn!("Negotiation failed for {}: {}", session, error);
                    let actions = self.machine.negotiation_failed(session, &error.to_string());
                    self.execute(actions);
                }
            }
            self.publish_snapshot();
        }

        self.shutdown();
    }

    fn handle_command(&mut self, command: CallCommand) {
        match command {
            CallCommand::Join { room, display_name } => self.join(&room, &display_name),
            CallCommand::StartCall => {
                let actions = self.machine.start_call();
                self.execute(actions);
            }
            CallCommand::AcceptCall => {
                let actions = self.machine.accept();
                self.execute(actions);
            }
            CallCommand::RejectCall => {
                let actions = self.machine.reject();
                self.execute(actions);
            }
            CallCommand::EndCall => {
                let actions = self.machine.end();
                self.execute(actions);
            }
            CallCommand::ToggleMic => self.toggle(TrackKind::Audio),
            CallCommand::ToggleVideo => self.toggle(TrackKind::Video),
            CallCommand::RequestAnalysis { transcript } => self.request_analysis(transcript),
            CallCommand::Shutdown => {}
        }
    }

    fn join(&mut self, room: &str, display_name: &str) {
        let display_name = display_name.trim();
        let room = RoomId::new(room);
        if display_name.is_empty() || room.as_str().is_empty() {
            warn!("Join needs a room and a display name");
            return;
        }

        if let Some(profile) = &self.profile {
            if let Err(e) = profile.save_display_name(display_name) {
                warn!("Failed to persist display name: {}", e);
            }
        }

        let user = User::new(self.local_id.clone(), display_name);
        let actions = self.machine.join(user.clone(), room.clone());
        self.execute(actions);
        self.presence.announce(&room, &user);
    }

    fn toggle(&mut self, kind: TrackKind) {
        if self.machine.status() != Some(CallStatus::Active) {
            debug!("Ignoring {} toggle outside an active call", kind);
            return;
        }

        let enabled = match kind {
            TrackKind::Audio => !self.mic_enabled,
            TrackKind::Video => !self.video_enabled,
        };
        if !self.engine.set_track_enabled(kind, enabled) {
            debug!("Ignoring {} toggle: no local media yet", kind);
            return;
        }

        match kind {
            TrackKind::Audio => self.mic_enabled = enabled,
            TrackKind::Video => self.video_enabled = enabled,
        }
        let _ = self.events.send(CallEvent::MediaToggled { kind, enabled });
    }

    fn request_analysis(&self, transcript: String) {
        if self.machine.status() != Some(CallStatus::Active) {
            debug!("Ignoring analysis request outside an active call");
            return;
        }

        let analysis = self.analysis.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let report = analysis.analyze(&transcript).await;
            let _ = events.send(CallEvent::Analysis(report));
        });
    }

    fn handle_engine_event(&mut self, event: EngineEvent) {
        let live = self.machine.session().map(|s| s.id);
        match event {
            EngineEvent::RemoteMedia { session, media } if live == Some(session) => {
                info!("Remote {} track {} available", media.kind, media.track_id);
                let _ = self.events.send(CallEvent::RemoteMedia(media));
            }
            EngineEvent::ConnectionState { session, state } if live == Some(session) => {
                info!("Connection {}", state);
                let _ = self.events.send(CallEvent::ConnectionState(state));
            }
            other => debug!("Dropping engine event for a finished call: {:?}", other),
        }
    }

    fn execute(&mut self, actions: Vec<CallAction>) {
        for action in actions {
            match action {
                CallAction::Send(envelope) => self.bus.send(envelope),
                CallAction::Initiate(ctx) => {
                    let engine = self.engine.clone();
                    self.spawn_negotiation(ctx.session, async move { engine.initiate(ctx).await });
                }
                CallAction::RespondToOffer { ctx, offer, from } => {
                    let engine = self.engine.clone();
                    self.spawn_negotiation(ctx.session, async move {
                        engine.on_remote_offer(ctx, offer, from).await
                    });
                }
                CallAction::ApplyAnswer { ctx, answer } => {
                    let engine = self.engine.clone();
                    self.spawn_negotiation(ctx.session, async move {
                        engine.on_remote_answer(ctx, answer).await
                    });
                }
                CallAction::ApplyCandidate { ctx, candidate } => {
                    if self.candidates.send((ctx, candidate)).is_err() {
                        warn!("Candidate worker stopped; dropping remote candidate");
                    }
                }
                CallAction::Teardown(ended) => {
                    match ended {
                        Some(session) => self.engine.retire(session),
                        None => self.engine.teardown(),
                    }
                    self.mic_enabled = true;
                    self.video_enabled = true;
                }
                CallAction::Notify(event) => {
                    let _ = self.events.send(event);
                }
            }
        }
    }

    fn spawn_negotiation<F>(&self, session: SessionId, operation: F)
    where
        F: Future<Output = Result<(), NegotiationError>> + Send + 'static,
    {
        let failures = self.failures_tx.clone();
        tokio::spawn(async move {
            match operation.await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    let _ = failures.send((session, e));
                }
                Err(NegotiationError::Cancelled) => debug!("Negotiation for {} superseded", session),
                Err(e) => warn!("Negotiation step ignored for {}: {}", session, e),
            }
        });
    }

    fn publish_snapshot(&self) {
        let session = self.machine.session();
        self.snapshot.send_replace(AgentSnapshot {
            user: self.machine.local_user().cloned(),
            room: self.machine.room().cloned(),
            status: session.map(|s| s.status),
            counterparty: session.and_then(|s| s.counterparty.clone()),
            connection: self.engine.connection_state(),
            remote_media: self.engine.remote_media(),
            mic_enabled: self.mic_enabled,
            video_enabled: self.video_enabled,
        });
    }

    fn shutdown(&mut self) {
        info!("Call agent shutting down");
        let mut actions = self.machine.end();
        actions.extend(self.machine.reset());
        self.execute(actions);
        self.engine.teardown();
        self.publish_snapshot();
        self.bus.close();
    }
}

/// Apply remote candidates one at a time so arrival order is kept
fn spawn_candidate_worker(engine: NegotiationEngine) -> mpsc::UnboundedSender<(CallContext, IceCandidate)> {
    let (tx, mut rx) = mpsc::unbounded_channel::<(CallContext, IceCandidate)>();
    tokio::spawn(async move {
        while let Some((ctx, candidate)) = rx.recv().await {
            let session = ctx.session;
            if let Err(e) = engine.on_remote_candidate(ctx, candidate).await {
                debug!("Remote candidate for {} not applied: {}", session, e);
            }
        }
    });
    tx
}
