//! Call session state machine
//!
//! Turns admitted envelopes and local intents into transitions. The machine
//! is synchronous and owns no I/O: every trigger returns the list of
//! [`CallAction`]s the caller must execute, in order.
//!
//! ```text
//! absent --start--> calling --accepted--> active
//! absent --initiate--> incoming --accept--> active
//! calling|incoming|active --end/reject/ended/rejected--> absent
//! ```

use super::{CallEvent, EndReason};
use crate::signaling::{IceCandidate, RoomId, SessionDescription, Signal, SignalEnvelope, User};
use log::{debug, info};
use std::fmt;

/// Identity of one call session, monotonic per process
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Calling,
    Incoming,
    Active,
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallStatus::Calling => f.write_str("calling"),
            CallStatus::Incoming => f.write_str("incoming"),
            CallStatus::Active => f.write_str("active"),
        }
    }
}

/// The live call, if any
#[derive(Debug, Clone)]
pub struct CallSession {
    pub id: SessionId,
    pub room_id: RoomId,
    pub counterparty: Option<User>,
    pub status: CallStatus,
    pub is_initiator: bool,
    negotiation_started: bool,
    offer_routed: bool,
    answer_routed: bool,
}

impl CallSession {
    fn is_from_counterparty(&self, envelope: &SignalEnvelope) -> bool {
        self.counterparty
            .as_ref()
            .map_or(true, |peer| peer.id == envelope.sender_id)
    }
}

/// Everything a negotiation operation needs to address its envelopes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    pub session: SessionId,
    pub room: RoomId,
    pub local: User,
}

/// Side effects requested by a transition
#[derive(Debug, Clone)]
pub enum CallAction {
    Send(SignalEnvelope),
    Initiate(CallContext),
    RespondToOffer {
        ctx: CallContext,
        offer: SessionDescription,
        from: User,
    },
    ApplyAnswer {
        ctx: CallContext,
        answer: SessionDescription,
    },
    ApplyCandidate {
        ctx: CallContext,
        candidate: IceCandidate,
    },
    /// Release negotiation resources; carries the session that ended, if any
    Teardown(Option<SessionId>),
    Notify(CallEvent),
}

#[derive(Debug, Default)]
pub struct CallSessionMachine {
    local: Option<User>,
    room: Option<RoomId>,
    session: Option<CallSession>,
    next_session: u64,
}

impl CallSessionMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> Option<CallStatus> {
        self.session.as_ref().map(|s| s.status)
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    pub fn local_user(&self) -> Option<&User> {
        self.local.as_ref()
    }

    pub fn room(&self) -> Option<&RoomId> {
        self.room.as_ref()
    }

    /// Set the local identity and joined room. A live call in another room is ended.
    pub fn join(&mut self, user: User, room: RoomId) -> Vec<CallAction> {
        let mut actions = Vec::new();
        if self.session.as_ref().is_some_and(|s| s.room_id != room) {
            actions.extend(self.finish(EndReason::RoomChanged, Some(Signal::CallEnded)));
        }

        info!("{} joined room {}", user, room);
        actions.push(CallAction::Notify(CallEvent::Joined {
            room: room.clone(),
            user: user.clone(),
        }));
        self.local = Some(user);
        self.room = Some(room);
        actions
    }

    /// Local start-call
    pub fn start_call(&mut self) -> Vec<CallAction> {
        let (Some(local), Some(room)) = (self.local.clone(), self.room.clone()) else {
            debug!("Ignoring start-call: no room joined");
            return Vec::new();
        };
        if let Some(session) = &self.session {
            debug!("Ignoring start-call while {}", session.status);
            return Vec::new();
        }

        let session = self.create(room.clone(), None, CallStatus::Calling, true);
        info!("Calling in room {} ({})", room, session.id);
        vec![
            CallAction::Send(SignalEnvelope::new(Signal::CallInitiate, &room, &local)),
            self.status_event(),
        ]
    }

    /// Local accept of an incoming call
    pub fn accept(&mut self) -> Vec<CallAction> {
        let Some(session) = self.session.as_mut().filter(|s| s.status == CallStatus::Incoming) else {
            debug!("Ignoring accept: no incoming call");
            return Vec::new();
        };
        session.status = CallStatus::Active;
        info!("Accepted call {} in room {}", session.id, session.room_id);

        let envelope = self.envelope(Signal::CallAccepted);
        let mut actions: Vec<CallAction> = envelope.into_iter().map(CallAction::Send).collect();
        actions.push(self.status_event());
        actions
    }

    /// Local reject of an incoming call
    pub fn reject(&mut self) -> Vec<CallAction> {
        if self.status() != Some(CallStatus::Incoming) {
            debug!("Ignoring reject: no incoming call");
            return Vec::new();
        }
        self.finish(EndReason::Rejected, Some(Signal::CallRejected))
    }

    /// Local hang-up or cancel
    pub fn end(&mut self) -> Vec<CallAction> {
        if self.session.is_none() {
            debug!("Ignoring end: no call");
            return Vec::new();
        }
        self.finish(EndReason::LocalHangup, Some(Signal::CallEnded))
    }

    /// Abort the call after a negotiation failure in session `id`
    pub fn negotiation_failed(&mut self, id: SessionId, reason: &str) -> Vec<CallAction> {
        if self.session.as_ref().map(|s| s.id) != Some(id) {
            debug!("Ignoring negotiation failure for stale {}", id);
            return Vec::new();
        }
        self.finish(EndReason::Failed(reason.to_string()), Some(Signal::CallEnded))
    }

    /// Drop any live session without notifying the peer
    pub fn reset(&mut self) -> Vec<CallAction> {
        match self.session.take() {
            Some(session) => {
                debug!("Reset {}", session.id);
                vec![CallAction::Teardown(Some(session.id))]
            }
            None => Vec::new(),
        }
    }

    /// Apply a received envelope
    pub fn handle_envelope(&mut self, envelope: &SignalEnvelope) -> Vec<CallAction> {
        let (Some(local), Some(room)) = (&self.local, &self.room) else {
            debug!("Ignoring {}: no room joined", envelope.kind());
            return Vec::new();
        };
        if &envelope.room_id != room || envelope.sender_id == local.id {
            return Vec::new();
        }

        match &envelope.signal {
            Signal::Ping => vec![CallAction::Notify(CallEvent::PeerPresent {
                user: envelope.sender(),
            })],
            Signal::CallInitiate => self.on_call_initiate(envelope),
            Signal::CallAccepted => self.on_call_accepted(envelope),
            Signal::CallRejected => self.on_remote_end(envelope, EndReason::RemoteRejected),
            Signal::CallEnded => self.on_remote_end(envelope, EndReason::RemoteHangup),
            Signal::Offer(offer) => self.on_offer(envelope, offer),
            Signal::Answer(answer) => self.on_answer(envelope, answer),
            Signal::Candidate(candidate) => self.on_candidate(envelope, candidate),
        }
    }

    fn on_call_initiate(&mut self, envelope: &SignalEnvelope) -> Vec<CallAction> {
        if let Some(session) = &self.session {
            debug!("Dropping call-initiate from {} while {}", envelope.sender_id, session.status);
            return Vec::new();
        }

        let from = envelope.sender();
        let session = self.create(envelope.room_id.clone(), Some(from.clone()), CallStatus::Incoming, false);
        info!("Incoming call {} from {}", session.id, from);
        vec![
            CallAction::Notify(CallEvent::IncomingCall { from }),
            self.status_event(),
        ]
    }

    fn on_call_accepted(&mut self, envelope: &SignalEnvelope) -> Vec<CallAction> {
        let Some(session) = self.session.as_mut().filter(|s| s.status == CallStatus::Calling) else {
            debug!("Ignoring call-accepted from {}", envelope.sender_id);
            return Vec::new();
        };
        session.status = CallStatus::Active;
        session.counterparty = Some(envelope.sender());
        info!("Call {} accepted by {}", session.id, envelope.sender());

        let mut actions = vec![self.status_event()];
        if let Some(ctx) = self.start_negotiation() {
            actions.push(CallAction::Initiate(ctx));
        }
        actions
    }

    fn on_remote_end(&mut self, envelope: &SignalEnvelope, reason: EndReason) -> Vec<CallAction> {
        match &self.session {
            Some(session) if session.is_from_counterparty(envelope) => self.finish(reason, None),
            Some(_) => {
                debug!("Ignoring {} from non-participant {}", envelope.kind(), envelope.sender_id);
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    fn on_offer(&mut self, envelope: &SignalEnvelope, offer: &SessionDescription) -> Vec<CallAction> {
        let ctx = self.context();
        let Some(session) = self.session.as_mut() else { return Vec::new() };
        if session.status != CallStatus::Active
            || session.is_initiator
            || session.offer_routed
            || !session.is_from_counterparty(envelope)
        {
            debug!("Ignoring offer from {}", envelope.sender_id);
            return Vec::new();
        }
        session.offer_routed = true;
        session.negotiation_started = true;

        ctx.map(|ctx| CallAction::RespondToOffer {
            ctx,
            offer: offer.clone(),
            from: envelope.sender(),
        })
        .into_iter()
        .collect()
    }

    fn on_answer(&mut self, envelope: &SignalEnvelope, answer: &SessionDescription) -> Vec<CallAction> {
        let ctx = self.context();
        let Some(session) = self.session.as_mut() else { return Vec::new() };
        if session.status != CallStatus::Active
            || !session.is_initiator
            || !session.negotiation_started
            || session.answer_routed
            || !session.is_from_counterparty(envelope)
        {
            debug!("Ignoring answer from {}", envelope.sender_id);
            return Vec::new();
        }
        session.answer_routed = true;

        ctx.map(|ctx| CallAction::ApplyAnswer {
            ctx,
            answer: answer.clone(),
        })
        .into_iter()
        .collect()
    }

    fn on_candidate(&mut self, envelope: &SignalEnvelope, candidate: &IceCandidate) -> Vec<CallAction> {
        let routed = self
            .session
            .as_ref()
            .is_some_and(|s| s.status == CallStatus::Active && s.is_from_counterparty(envelope));
        if !routed {
            debug!("Ignoring candidate from {}", envelope.sender_id);
            return Vec::new();
        }

        self.context()
            .map(|ctx| CallAction::ApplyCandidate {
                ctx,
                candidate: candidate.clone(),
            })
            .into_iter()
            .collect()
    }

    fn create(
        &mut self,
        room_id: RoomId,
        counterparty: Option<User>,
        status: CallStatus,
        is_initiator: bool,
    ) -> &CallSession {
        self.next_session += 1;
        self.session.insert(CallSession {
            id: SessionId::from_raw(self.next_session),
            room_id,
            counterparty,
            status,
            is_initiator,
            negotiation_started: false,
            offer_routed: false,
            answer_routed: false,
        })
    }

    /// Latch the initiator's single `initiate()`
    fn start_negotiation(&mut self) -> Option<CallContext> {
        let ctx = self.context()?;
        let session = self.session.as_mut()?;
        if !session.is_initiator || session.negotiation_started {
            return None;
        }
        session.negotiation_started = true;
        Some(ctx)
    }

    fn context(&self) -> Option<CallContext> {
        let session = self.session.as_ref()?;
        Some(CallContext {
            session: session.id,
            room: session.room_id.clone(),
            local: self.local.clone()?,
        })
    }

    fn envelope(&self, signal: Signal) -> Option<SignalEnvelope> {
        let session = self.session.as_ref()?;
        let local = self.local.as_ref()?;
        Some(SignalEnvelope::new(signal, &session.room_id, local))
    }

    fn status_event(&self) -> CallAction {
        CallAction::Notify(CallEvent::StatusChanged {
            status: self.status(),
            counterparty: self.session.as_ref().and_then(|s| s.counterparty.clone()),
        })
    }

    /// Transition to absent, optionally notifying the peer first
    fn finish(&mut self, reason: EndReason, notify: Option<Signal>) -> Vec<CallAction> {
        let mut actions = Vec::new();
        if let Some(envelope) = notify.and_then(|signal| self.envelope(signal)) {
            actions.push(CallAction::Send(envelope));
        }
        let ended = self.session.take().map(|session| {
            info!("Call {} ended: {}", session.id, reason);
            session.id
        });
        actions.push(CallAction::Teardown(ended));
        actions.push(CallAction::Notify(CallEvent::Ended { reason }));
        actions.push(self.status_event());
        actions
    }
}
