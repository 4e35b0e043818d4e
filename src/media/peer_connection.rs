//! webrtc-rs backed media transport
//!
//! Each transport session is one `RTCPeerConnection`. Local media is a set of
//! sample tracks (Opus audio, VP8 video) that a capture pipeline can feed;
//! this process has no capture device of its own.

use super::{
    ConnectionState, MediaConstraints, MediaError, MediaHandle, MediaTrack, MediaTransport,
    RemoteMedia, SessionConfig, SessionHandle, SessionSinks, TrackKind, TransportError,
};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

const STREAM_ID: &str = "roomcall-local";

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
        }
    }
}

struct LocalMedia {
    tracks: HashMap<String, (TrackKind, Arc<TrackLocalStaticSample>)>,
    enabled: HashMap<TrackKind, bool>,
}

/// Media transport over webrtc-rs peer connections
pub struct WebRtcTransport {
    api: API,
    peers: Mutex<HashMap<String, Arc<RTCPeerConnection>>>,
    media: Mutex<HashMap<String, LocalMedia>>,
}

impl WebRtcTransport {
    pub fn new() -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| TransportError::ConnectionFailed(format!("Failed to register codecs: {}", e)))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| TransportError::ConnectionFailed(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            peers: Mutex::new(HashMap::new()),
            media: Mutex::new(HashMap::new()),
        })
    }

    /// Whether `kind` is currently enabled on `media`
    pub fn is_track_enabled(&self, media: &MediaHandle, kind: TrackKind) -> bool {
        self.media
            .lock()
            .get(&media.id)
            .and_then(|local| local.enabled.get(&kind).copied())
            .unwrap_or(false)
    }

    fn peer(&self, session: &SessionHandle) -> Result<Arc<RTCPeerConnection>, TransportError> {
        self.peers
            .lock()
            .get(&session.id)
            .cloned()
            .ok_or_else(|| TransportError::SessionNotFound(session.id.clone()))
    }
}

fn sample_track(kind: TrackKind) -> Arc<TrackLocalStaticSample> {
    let mime_type = match kind {
        TrackKind::Audio => MIME_TYPE_OPUS,
        TrackKind::Video => MIME_TYPE_VP8,
    };
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: mime_type.to_string(),
            ..Default::default()
        },
        format!("{}-{}", kind, uuid::Uuid::new_v4()),
        STREAM_ID.to_string(),
    ))
}

fn to_rtc_description(description: &SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let parsed = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp.clone()),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp.clone()),
    };
    parsed.map_err(|e| TransportError::Sdp(format!("Invalid SDP: {}", e)))
}

#[async_trait]
impl MediaTransport for WebRtcTransport {
    async fn get_local_media(&self, constraints: MediaConstraints) -> Result<MediaHandle, MediaError> {
        let mut kinds = Vec::new();
        if constraints.audio {
            kinds.push(TrackKind::Audio);
        }
        if constraints.video {
            kinds.push(TrackKind::Video);
        }
        if kinds.is_empty() {
            return Err(MediaError::DeviceUnavailable("no media kinds requested".to_string()));
        }

        let mut local = LocalMedia {
            tracks: HashMap::new(),
            enabled: HashMap::new(),
        };
        let mut tracks = Vec::new();
        for kind in kinds {
            let track = sample_track(kind);
            let id = track.id().to_string();
            tracks.push(MediaTrack { id: id.clone(), kind });
            local.tracks.insert(id, (kind, track));
            local.enabled.insert(kind, true);
        }

        let handle = MediaHandle {
            id: uuid::Uuid::new_v4().to_string(),
            tracks,
        };
        self.media.lock().insert(handle.id.clone(), local);
        Ok(handle)
    }

    fn release_media(&self, media: &MediaHandle) {
        if self.media.lock().remove(&media.id).is_none() {
            debug!("Local media {} already released", media.id);
        }
    }

    fn set_track_enabled(&self, media: &MediaHandle, kind: TrackKind, enabled: bool) {
        match self.media.lock().get_mut(&media.id) {
            Some(local) => {
                local.enabled.insert(kind, enabled);
                info!("Local {} track {}", kind, if enabled { "enabled" } else { "disabled" });
            }
            None => warn!("Cannot toggle {} on released media {}", kind, media.id),
        }
    }

    async fn open_session(
        &self,
        config: &SessionConfig,
        sinks: SessionSinks,
    ) -> Result<SessionHandle, TransportError> {
        let ice_servers = config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let peer_connection = self
            .api
            .new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("Failed to create peer connection: {}", e)))?;
        let peer_connection = Arc::new(peer_connection);

        let on_candidate = sinks.on_local_candidate.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate| {
            let on_candidate = on_candidate.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => on_candidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }),
                    Err(e) => warn!("Failed to serialize local ICE candidate: {}", e),
                }
            })
        }));

        let on_remote_media = sinks.on_remote_media.clone();
        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            let on_remote_media = on_remote_media.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    _ => TrackKind::Video,
                };
                on_remote_media(RemoteMedia {
                    stream_id: track.stream_id(),
                    track_id: track.id(),
                    kind,
                });
            })
        }));

        let on_state = sinks.on_connection_state.clone();
        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            let on_state = on_state.clone();
            Box::pin(async move {
                on_state(ConnectionState::from(state));
            })
        }));

        let handle = SessionHandle {
            id: uuid::Uuid::new_v4().to_string(),
        };
        self.peers.lock().insert(handle.id.clone(), peer_connection);
        Ok(handle)
    }

    async fn add_local_track(
        &self,
        session: &SessionHandle,
        media: &MediaHandle,
        track: &MediaTrack,
    ) -> Result<(), TransportError> {
        let peer_connection = self.peer(session)?;
        let local = self
            .media
            .lock()
            .get(&media.id)
            .and_then(|local| local.tracks.get(&track.id).map(|(_, t)| t.clone()))
            .ok_or_else(|| TransportError::Media(format!("Unknown local track {}", track.id)))?;

        peer_connection
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| TransportError::Media(format!("Failed to add {} track: {}", track.kind, e)))?;
        Ok(())
    }

    async fn create_offer(&self, session: &SessionHandle) -> Result<SessionDescription, TransportError> {
        let offer = self
            .peer(session)?
            .create_offer(None)
            .await
            .map_err(|e| TransportError::Sdp(format!("Failed to create offer: {}", e)))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self, session: &SessionHandle) -> Result<SessionDescription, TransportError> {
        let answer = self
            .peer(session)?
            .create_answer(None)
            .await
            .map_err(|e| TransportError::Sdp(format!("Failed to create answer: {}", e)))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        session: &SessionHandle,
        description: &SessionDescription,
    ) -> Result<(), TransportError> {
        let peer_connection = self.peer(session)?;
        peer_connection
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(|e| TransportError::Sdp(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(
        &self,
        session: &SessionHandle,
        description: &SessionDescription,
    ) -> Result<(), TransportError> {
        let peer_connection = self.peer(session)?;
        peer_connection
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(|e| TransportError::Sdp(format!("Failed to set remote description: {}", e)))
    }

    async fn add_remote_candidate(
        &self,
        session: &SessionHandle,
        candidate: &IceCandidate,
    ) -> Result<(), TransportError> {
        let peer_connection = self.peer(session)?;
        peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment.clone(),
            })
            .await
            .map_err(|e| TransportError::Ice(format!("Failed to add ICE candidate: {}", e)))
    }

    fn close_session(&self, session: &SessionHandle) {
        let Some(peer_connection) = self.peers.lock().remove(&session.id) else {
            debug!("Transport session {} already closed", session.id);
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let id = session.id.clone();
                runtime.spawn(async move {
                    if let Err(e) = peer_connection.close().await {
                        warn!("Failed to close peer connection {}: {}", id, e);
                    }
                });
            }
            Err(_) => warn!("No runtime available to close peer connection {}", session.id),
        }
    }
}
