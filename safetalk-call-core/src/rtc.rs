//! Underlying peer connection engine
//!
//! [`RtcPeer`] is the narrow surface the controller needs from a peer
//! connection. [`WebRtcPeerFactory`] builds real ones on webrtc-rs; the
//! `testing` module has a scripted fake.
//!
//! Engine callbacks (local candidates, inbound tracks, connection state) are
//! delivered as [`PeerEvent`]s on the channel passed to
//! [`PeerFactory::create_peer`].

use crate::media::MediaTrack;
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

/// Peer engine errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RtcError {
    /// A session description could not be parsed or applied
    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    /// An ICE candidate was rejected
    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    /// No sender with this id
    #[error("Unknown sender: {0}")]
    UnknownSender(usize),

    /// Engine failure
    #[error("Engine error: {0}")]
    Engine(String),
}

/// Handle to an outbound track slot on a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub usize);

/// Connection state reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Created, nothing negotiated
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Media can flow
    Connected,
    /// Connectivity lost, may recover
    Disconnected,
    /// Connectivity checks failed
    Failed,
    /// Closed locally
    Closed,
}

impl From<RTCPeerConnectionState> for PeerState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => Self::New,
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
        }
    }
}

/// Callback from the engine
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local ICE candidate was gathered
    LocalCandidate(IceCandidate),
    /// A remote track arrived
    Track(Arc<MediaTrack>),
    /// Connection state changed
    StateChanged(PeerState),
}

/// One ICE server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// `stun:`, `turn:` or `turns:` URLs
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// A STUN server
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// A TURN relay with long-term credentials
    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    /// Whether any URL is a TURN relay
    #[must_use]
    pub fn is_turn(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }

    fn to_rtc(&self) -> RTCIceServer {
        RTCIceServer {
            urls: self.urls.clone(),
            username: self.username.clone().unwrap_or_default(),
            credential: self.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Peer connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// ICE servers, STUN and TURN
    pub ice_servers: Vec<IceServer>,
    /// Gather candidates on loopback interfaces
    #[serde(default)]
    pub include_loopback_candidates: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
            include_loopback_candidates: false,
        }
    }
}

impl PeerConfig {
    /// Config for two peers in the same process: no servers, loopback host candidates
    #[must_use]
    pub fn loopback() -> Self {
        Self {
            ice_servers: Vec::new(),
            include_loopback_candidates: true,
        }
    }

    /// Whether a TURN relay is configured
    #[must_use]
    pub fn has_turn(&self) -> bool {
        self.ice_servers.iter().any(IceServer::is_turn)
    }
}

/// Operations the controller performs on a peer connection
#[async_trait]
pub trait RtcPeer: Send + Sync {
    /// Attach a local track as a new outbound sender
    async fn add_track(&self, track: &Arc<MediaTrack>) -> Result<SenderId, RtcError>;

    /// Swap the track on an existing sender without renegotiation
    async fn replace_track(&self, sender: SenderId, track: &Arc<MediaTrack>)
        -> Result<(), RtcError>;

    /// Generate an offer
    async fn create_offer(&self) -> Result<SessionDescription, RtcError>;

    /// Generate an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, RtcError>;

    /// Apply a local description
    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), RtcError>;

    /// Apply a remote description
    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), RtcError>;

    /// Add a remote ICE candidate
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), RtcError>;

    /// Close the connection
    async fn close(&self) -> Result<(), RtcError>;
}

/// Builds peer connections
#[async_trait]
pub trait PeerFactory: Send + Sync {
    /// Create a peer that reports its callbacks on `events`
    async fn create_peer(
        &self,
        config: &PeerConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn RtcPeer>, RtcError>;
}

/// Builds [`WebRtcPeer`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct WebRtcPeerFactory;

impl WebRtcPeerFactory {
    /// Create a factory
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create_peer(
        &self,
        config: &PeerConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn RtcPeer>, RtcError> {
        let peer = WebRtcPeer::new(config, events).await?;
        Ok(Arc::new(peer))
    }
}

/// Peer connection on webrtc-rs
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    senders: parking_lot::Mutex<Vec<Arc<RTCRtpSender>>>,
}

fn engine_err(e: webrtc::Error) -> RtcError {
    RtcError::Engine(e.to_string())
}

impl WebRtcPeer {
    /// Create a peer connection and register its callbacks
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot be built
    pub async fn new(
        config: &PeerConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self, RtcError> {
        if !config.has_turn() {
            tracing::warn!(
                ice_servers = config.ice_servers.len(),
                "No TURN relay configured, calls across restrictive NATs will fail"
            );
        }

        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(engine_err)?;
        let registry =
            register_default_interceptors(Registry::new(), &mut media_engine).map_err(engine_err)?;

        let mut setting_engine = SettingEngine::default();
        if config.include_loopback_candidates {
            setting_engine.set_include_loopback_candidate(true);
        }

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers.iter().map(IceServer::to_rtc).collect(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to create peer connection");
            engine_err(e)
        })?);

        Self::register_callbacks(&pc, events);
        tracing::debug!("Created peer connection");

        Ok(Self {
            pc,
            senders: parking_lot::Mutex::new(Vec::new()),
        })
    }

    fn register_callbacks(pc: &RTCPeerConnection, events: mpsc::UnboundedSender<PeerEvent>) {
        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                // None marks the end of gathering
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => tracing::warn!(error = %e, "Dropping unserializable local candidate"),
                }
            })
        }));

        let tx = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let tx = tx.clone();
                Box::pin(async move {
                    let track = MediaTrack::remote(track);
                    tracing::debug!(track_id = %track.id(), kind = ?track.kind(), "Remote track arrived");
                    let _ = tx.send(PeerEvent::Track(Arc::new(track)));
                })
            },
        ));

        let tx = events;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                tracing::debug!(state = %state, "Peer connection state changed");
                let _ = tx.send(PeerEvent::StateChanged(PeerState::from(state)));
            })
        }));
    }

    fn to_rtc_description(desc: &SessionDescription) -> Result<RTCSessionDescription, RtcError> {
        let parsed = match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
        };
        parsed.map_err(|e| RtcError::InvalidDescription(e.to_string()))
    }
}

#[async_trait]
impl RtcPeer for WebRtcPeer {
    async fn add_track(&self, track: &Arc<MediaTrack>) -> Result<SenderId, RtcError> {
        let local = track.local_track().ok_or_else(|| {
            RtcError::Engine(format!("track {} cannot be sent", track.id()))
        })?;
        let sender = self.pc.add_track(local).await.map_err(engine_err)?;

        let mut senders = self.senders.lock();
        senders.push(sender);
        Ok(SenderId(senders.len() - 1))
    }

    async fn replace_track(
        &self,
        sender: SenderId,
        track: &Arc<MediaTrack>,
    ) -> Result<(), RtcError> {
        let rtp_sender = self
            .senders
            .lock()
            .get(sender.0)
            .cloned()
            .ok_or(RtcError::UnknownSender(sender.0))?;
        let local = track.local_track().ok_or_else(|| {
            RtcError::Engine(format!("track {} cannot be sent", track.id()))
        })?;
        rtp_sender
            .replace_track(Some(local))
            .await
            .map_err(engine_err)
    }

    async fn create_offer(&self) -> Result<SessionDescription, RtcError> {
        let offer = self.pc.create_offer(None).await.map_err(engine_err)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        let answer = self.pc.create_answer(None).await.map_err(engine_err)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), RtcError> {
        let rtc_desc = Self::to_rtc_description(desc)?;
        self.pc
            .set_local_description(rtc_desc)
            .await
            .map_err(|e| RtcError::InvalidDescription(e.to_string()))
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), RtcError> {
        let rtc_desc = Self::to_rtc_description(desc)?;
        self.pc
            .set_remote_description(rtc_desc)
            .await
            .map_err(|e| RtcError::InvalidDescription(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), RtcError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| RtcError::InvalidCandidate(e.to_string()))
    }

    async fn close(&self) -> Result<(), RtcError> {
        self.pc.close().await.map_err(engine_err)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{MediaKind, TrackSource};

    fn offline_config() -> PeerConfig {
        PeerConfig {
            ice_servers: Vec::new(),
            include_loopback_candidates: false,
        }
    }

    #[test]
    fn test_default_config_has_stun_only() {
        let config = PeerConfig::default();
        assert_eq!(config.ice_servers.len(), 1);
        assert!(config.ice_servers[0].urls[0].starts_with("stun:"));
        assert!(!config.has_turn());

        let mut with_turn = config.clone();
        with_turn
            .ice_servers
            .push(IceServer::turn("turn:relay.example:3478", "u", "p"));
        assert!(with_turn.has_turn());
    }

    #[test]
    fn test_peer_config_json() {
        let json = r#"{"ice_servers":[{"urls":["stun:stun.example:3478"]}]}"#;
        let config: PeerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.ice_servers, vec![IceServer::stun("stun:stun.example:3478")]);
        assert!(!config.include_loopback_candidates);
    }

    #[test]
    fn test_peer_state_mapping() {
        assert_eq!(
            PeerState::from(RTCPeerConnectionState::Connected),
            PeerState::Connected
        );
        assert_eq!(
            PeerState::from(RTCPeerConnectionState::Unspecified),
            PeerState::New
        );
        assert_eq!(PeerState::from(RTCPeerConnectionState::Failed), PeerState::Failed);
    }

    #[tokio::test]
    async fn test_webrtc_offer_carries_local_tracks() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = WebRtcPeer::new(&offline_config(), tx).await.unwrap();

        let audio = Arc::new(MediaTrack::local("mic-0", MediaKind::Audio, TrackSource::Microphone));
        let video = Arc::new(MediaTrack::local("cam-0", MediaKind::Video, TrackSource::Camera));
        assert_eq!(peer.add_track(&audio).await.unwrap(), SenderId(0));
        assert_eq!(peer.add_track(&video).await.unwrap(), SenderId(1));

        let offer = peer.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));

        peer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_webrtc_replace_track_unknown_sender() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = WebRtcPeer::new(&offline_config(), tx).await.unwrap();
        let screen = Arc::new(MediaTrack::local("screen-0", MediaKind::Video, TrackSource::Screen));

        let result = peer.replace_track(SenderId(3), &screen).await;
        assert_eq!(result, Err(RtcError::UnknownSender(3)));
        peer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_webrtc_rejects_answer_without_offer() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = WebRtcPeer::new(&offline_config(), tx).await.unwrap();

        let result = peer
            .set_remote_description(&SessionDescription::answer("not sdp"))
            .await;
        assert!(matches!(result, Err(RtcError::InvalidDescription(_))));
        peer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_webrtc_detached_track_cannot_be_sent() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = WebRtcPeer::new(&offline_config(), tx).await.unwrap();
        let remote = Arc::new(MediaTrack::detached("r", MediaKind::Audio, TrackSource::Remote));

        assert!(matches!(
            peer.add_track(&remote).await,
            Err(RtcError::Engine(_))
        ));
        peer.close().await.unwrap();
    }
}
