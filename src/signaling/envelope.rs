//! Signaling envelope contract
//!
//! Typed call-control and negotiation messages exchanged between the
//! participants of a room over the broadcast channel. On the wire an
//! envelope is a flat JSON object:
//!
//! `{"type": "offer", "roomId": "ROOM", "senderId": "...", "senderName": "...", "payload": {...}, "timestamp": 0}`
//!
//! In memory the payload is carried by the [`Signal`] variant, so consumers
//! never inspect an untyped value.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Envelope encoding/decoding errors
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Invalid signaling message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Missing payload in {0} message")]
    MissingPayload(SignalKind),
    #[error("Malformed {kind} payload: {reason}")]
    MalformedPayload { kind: SignalKind, reason: String },
}

/// Room identifier, upper-cased on construction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(raw: &str) -> Self {
        Self(raw.trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-process participant identifier. Uniqueness is best effort.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Generate a fresh random id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A room participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub display_name: String,
}

impl User {
    pub fn new(id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
        }
    }

    /// Create a user with a freshly generated id
    pub fn generate(display_name: impl Into<String>) -> Self {
        Self::new(UserId::generate(), display_name)
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.id)
    }
}

/// Envelope type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    CallInitiate,
    CallAccepted,
    CallRejected,
    CallEnded,
    Ping,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
            SignalKind::CallInitiate => "call-initiate",
            SignalKind::CallAccepted => "call-accepted",
            SignalKind::CallRejected => "call-rejected",
            SignalKind::CallEnded => "call-ended",
            SignalKind::Ping => "ping",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SDP descriptor type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Offer/answer descriptor, shaped like the browser's `RTCSessionDescriptionInit`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate, shaped like the browser's `RTCIceCandidateInit`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Envelope body; each tag carries its own payload type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
    CallInitiate,
    CallAccepted,
    CallRejected,
    CallEnded,
    Ping,
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::Offer(_) => SignalKind::Offer,
            Signal::Answer(_) => SignalKind::Answer,
            Signal::Candidate(_) => SignalKind::Candidate,
            Signal::CallInitiate => SignalKind::CallInitiate,
            Signal::CallAccepted => SignalKind::CallAccepted,
            Signal::CallRejected => SignalKind::CallRejected,
            Signal::CallEnded => SignalKind::CallEnded,
            Signal::Ping => SignalKind::Ping,
        }
    }
}

/// The signaling wire unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub struct SignalEnvelope {
    pub signal: Signal,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub sender_name: String,
    /// Milliseconds since the Unix epoch, stamped by the sending bus. Advisory only.
    pub timestamp: Option<u64>,
}

impl SignalEnvelope {
    /// Create an unstamped envelope from `sender` for `room`
    pub fn new(signal: Signal, room: &RoomId, sender: &User) -> Self {
        Self {
            signal,
            room_id: room.clone(),
            sender_id: sender.id.clone(),
            sender_name: sender.display_name.clone(),
            timestamp: None,
        }
    }

    /// Parse an envelope from JSON
    pub fn from_json(json: &str) -> Result<Self, EnvelopeError> {
        let wire: WireEnvelope = serde_json::from_str(json)?;
        Self::try_from(wire)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(&WireEnvelope::from(self.clone()))?)
    }

    pub fn kind(&self) -> SignalKind {
        self.signal.kind()
    }

    /// The sending participant
    pub fn sender(&self) -> User {
        User::new(self.sender_id.clone(), self.sender_name.clone())
    }
}

/// Flat JSON representation of an envelope
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: SignalKind,
    room_id: RoomId,
    sender_id: UserId,
    sender_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<u64>,
}

impl From<SignalEnvelope> for WireEnvelope {
    fn from(envelope: SignalEnvelope) -> Self {
        let kind = envelope.signal.kind();
        let payload = match envelope.signal {
            Signal::Offer(description) | Signal::Answer(description) => {
                serde_json::to_value(description).ok()
            }
            Signal::Candidate(candidate) => serde_json::to_value(candidate).ok(),
            Signal::CallInitiate
            | Signal::CallAccepted
            | Signal::CallRejected
            | Signal::CallEnded
            | Signal::Ping => None,
        };

        Self {
            kind,
            room_id: envelope.room_id,
            sender_id: envelope.sender_id,
            sender_name: envelope.sender_name,
            payload,
            timestamp: envelope.timestamp,
        }
    }
}

impl TryFrom<WireEnvelope> for SignalEnvelope {
    type Error = EnvelopeError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let kind = wire.kind;
        let signal = match kind {
            SignalKind::Offer => Signal::Offer(description(kind, wire.payload, SdpKind::Offer)?),
            SignalKind::Answer => {
                Signal::Answer(description(kind, wire.payload, SdpKind::Answer)?)
            }
            SignalKind::Candidate => Signal::Candidate(decode_payload(kind, wire.payload)?),
            SignalKind::CallInitiate => Signal::CallInitiate,
            SignalKind::CallAccepted => Signal::CallAccepted,
            SignalKind::CallRejected => Signal::CallRejected,
            SignalKind::CallEnded => Signal::CallEnded,
            SignalKind::Ping => Signal::Ping,
        };

        Ok(Self {
            signal,
            room_id: wire.room_id,
            sender_id: wire.sender_id,
            sender_name: wire.sender_name,
            timestamp: wire.timestamp,
        })
    }
}

fn decode_payload<T: DeserializeOwned>(
    kind: SignalKind,
    payload: Option<Value>,
) -> Result<T, EnvelopeError> {
    match payload {
        None | Some(Value::Null) => Err(EnvelopeError::MissingPayload(kind)),
        Some(value) => serde_json::from_value(value).map_err(|e| EnvelopeError::MalformedPayload {
            kind,
            reason: e.to_string(),
        }),
    }
}

fn description(
    kind: SignalKind,
    payload: Option<Value>,
    expected: SdpKind,
) -> Result<SessionDescription, EnvelopeError> {
    let description: SessionDescription = decode_payload(kind, payload)?;
    if description.kind != expected {
        return Err(EnvelopeError::MalformedPayload {
            kind,
            reason: format!("descriptor type {:?} does not match message type", description.kind),
        });
    }
    if description.sdp.trim().is_empty() {
        return Err(EnvelopeError::MalformedPayload {
            kind,
            reason: "empty SDP".to_string(),
        });
    }
    Ok(description)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> User {
        User::new(UserId::from("alice01"), "Alice")
    }

    #[test]
    fn test_parse_browser_offer() {
        let json = r#"{
            "type": "offer",
            "roomId": "STREAM-ALPHA",
            "senderId": "k3j9x1abc",
            "senderName": "Bob",
            "payload": {"type": "offer", "sdp": "v=0\r\n..."},
            "timestamp": 1700000000000
        }"#;
        let envelope = SignalEnvelope::from_json(json).unwrap();
        assert_eq!(envelope.room_id, RoomId::new("stream-alpha"));
        assert_eq!(envelope.sender().display_name, "Bob");
        assert_eq!(envelope.timestamp, Some(1_700_000_000_000));
        match envelope.signal {
            Signal::Offer(description) => assert!(description.sdp.starts_with("v=0")),
            other => panic!("Expected Offer, got {:?}", other),
        }
    }

    #[test]
    fn test_control_message_has_no_payload() {
        let envelope = SignalEnvelope::new(Signal::CallInitiate, &RoomId::new("r1"), &alice());
        let json = envelope.to_json().unwrap();
        assert!(json.contains(r#""type":"call-initiate""#));
        assert!(json.contains(r#""roomId":"R1""#));
        assert!(!json.contains("payload"));
        assert!(!json.contains("timestamp"));
    }

    #[test]
    fn test_candidate_uses_browser_field_names() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let envelope =
            SignalEnvelope::new(Signal::Candidate(candidate.clone()), &RoomId::new("R1"), &alice());
        let json = envelope.to_json().unwrap();
        assert!(json.contains(r#""sdpMid":"0""#));
        assert!(json.contains(r#""sdpMLineIndex":0"#));

        let parsed = SignalEnvelope::from_json(&json).unwrap();
        assert_eq!(parsed.signal, Signal::Candidate(candidate));
    }

    #[test]
    fn test_negotiation_message_requires_payload() {
        let json = r#"{"type": "answer", "roomId": "R1", "senderId": "a", "senderName": "A"}"#;
        let err = SignalEnvelope::from_json(json).unwrap_err();
        assert!(matches!(err, EnvelopeError::MissingPayload(SignalKind::Answer)));
    }

    #[test]
    fn test_descriptor_type_must_match_message_type() {
        let json = r#"{"type": "offer", "roomId": "R1", "senderId": "a", "senderName": "A",
                       "payload": {"type": "answer", "sdp": "v=0"}}"#;
        let err = SignalEnvelope::from_json(json).unwrap_err();
        assert!(matches!(err, EnvelopeError::MalformedPayload { kind: SignalKind::Offer, .. }));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let json = r#"{"type": "call-waiting", "roomId": "R1", "senderId": "a", "senderName": "A"}"#;
        assert!(SignalEnvelope::from_json(json).is_err());
    }

    #[test]
    fn test_room_id_is_upper_cased() {
        assert_eq!(RoomId::new("  stream-alpha ").as_str(), "STREAM-ALPHA");
    }
}
