//! Fakes for driving sessions without a network
//!
//! [`FakePeerFactory`] hands out [`FakePeer`]s that produce synthetic SDP,
//! announce one host candidate per local description and, when asked,
//! report `Connected` once both descriptions are applied. Every call is
//! counted so tests can check what the controller did.

use crate::media::MediaTrack;
use crate::rtc::{PeerConfig, PeerEvent, PeerFactory, PeerState, RtcError, RtcPeer, SenderId};
use crate::session::{CallControlPlane, ControlPlaneError};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use crate::types::{MediaKind, SessionId, TrackSource};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Builds [`FakePeer`]s and keeps every one it built
#[derive(Default)]
pub struct FakePeerFactory {
    auto_connect: bool,
    fail_creation: AtomicBool,
    peers: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerFactory {
    /// Peers that stay in `New` until told otherwise
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Peers that report `Connecting` then `Connected` once both
    /// descriptions are applied
    #[must_use]
    pub fn auto_connecting() -> Self {
        Self {
            auto_connect: true,
            ..Default::default()
        }
    }

    /// Make later `create_peer` calls fail
    pub fn fail_creation(&self, fail: bool) {
        self.fail_creation.store(fail, Ordering::SeqCst);
    }

    /// Number of peers created
    #[must_use]
    pub fn peers_created(&self) -> usize {
        self.peers.lock().len()
    }

    /// All peers created, oldest first
    #[must_use]
    pub fn peers(&self) -> Vec<Arc<FakePeer>> {
        self.peers.lock().clone()
    }

    /// Most recently created peer
    #[must_use]
    pub fn last_peer(&self) -> Option<Arc<FakePeer>> {
        self.peers.lock().last().cloned()
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create_peer(
        &self,
        _config: &PeerConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn RtcPeer>, RtcError> {
        if self.fail_creation.load(Ordering::SeqCst) {
            return Err(RtcError::Engine("peer creation disabled".to_string()));
        }
        let mut peers = self.peers.lock();
        let peer = Arc::new(FakePeer::new(peers.len(), events, self.auto_connect));
        peers.push(peer.clone());
        Ok(peer)
    }
}

#[derive(Default)]
struct FakeState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    senders: Vec<Arc<MediaTrack>>,
    candidates: Vec<IceCandidate>,
    connected: bool,
}

/// Scripted peer connection
pub struct FakePeer {
    id: usize,
    events: mpsc::UnboundedSender<PeerEvent>,
    auto_connect: bool,
    state: Mutex<FakeState>,
    add_track_calls: AtomicUsize,
    replace_track_calls: AtomicUsize,
    close_calls: AtomicUsize,
    reject_candidates: AtomicBool,
}

impl FakePeer {
    fn new(id: usize, events: mpsc::UnboundedSender<PeerEvent>, auto_connect: bool) -> Self {
        Self {
            id,
            events,
            auto_connect,
            state: Mutex::new(FakeState::default()),
            add_track_calls: AtomicUsize::new(0),
            replace_track_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            reject_candidates: AtomicBool::new(false),
        }
    }

    /// Report a connection state as the engine would
    pub fn emit_state(&self, state: PeerState) {
        let _ = self.events.send(PeerEvent::StateChanged(state));
    }

    /// Deliver a remote track as the engine would
    pub fn emit_remote_track(&self, kind: MediaKind) -> Arc<MediaTrack> {
        let n = self.state.lock().senders.len();
        let track = Arc::new(MediaTrack::detached(
            format!("remote-{}-{kind:?}-{n}", self.id),
            kind,
            TrackSource::Remote,
        ));
        let _ = self.events.send(PeerEvent::Track(track.clone()));
        track
    }

    /// Refuse every remote candidate from now on
    pub fn reject_candidates(&self, reject: bool) {
        self.reject_candidates.store(reject, Ordering::SeqCst);
    }

    /// Tracks currently on the outbound senders, in sender order
    #[must_use]
    pub fn sender_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.state.lock().senders.clone()
    }

    /// Remote candidates added, in order
    #[must_use]
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    /// Applied local description
    #[must_use]
    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    /// Applied remote description
    #[must_use]
    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    /// Number of `add_track` calls
    #[must_use]
    pub fn add_track_calls(&self) -> usize {
        self.add_track_calls.load(Ordering::SeqCst)
    }

    /// Number of `replace_track` calls
    #[must_use]
    pub fn replace_track_calls(&self) -> usize {
        self.replace_track_calls.load(Ordering::SeqCst)
    }

    /// Number of `close` calls
    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.close_calls() > 0
    }

    fn ensure_open(&self) -> Result<(), RtcError> {
        if self.is_closed() {
            return Err(RtcError::Engine("peer connection closed".to_string()));
        }
        Ok(())
    }

    fn synthetic_sdp(&self, senders: &[Arc<MediaTrack>]) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.id
        );
        for track in senders {
            match track.kind() {
                MediaKind::Audio => sdp.push_str("m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n"),
                MediaKind::Video => sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\n"),
            }
        }
        sdp
    }

    fn maybe_connect(&self) {
        let remote_kinds = {
            let mut state = self.state.lock();
            if !self.auto_connect || state.connected || state.local.is_none() {
                return;
            }
            let Some(remote) = state.remote.as_ref() else {
                return;
            };
            let kinds: Vec<MediaKind> = remote
                .sdp
                .lines()
                .filter_map(|line| {
                    if line.starts_with("m=audio") {
                        Some(MediaKind::Audio)
                    } else if line.starts_with("m=video") {
                        Some(MediaKind::Video)
                    } else {
                        None
                    }
                })
                .collect();
            state.connected = true;
            kinds
        };

        self.emit_state(PeerState::Connecting);
        for kind in remote_kinds {
            self.emit_remote_track(kind);
        }
        self.emit_state(PeerState::Connected);
    }
}

#[async_trait]
impl RtcPeer for FakePeer {
    async fn add_track(&self, track: &Arc<MediaTrack>) -> Result<SenderId, RtcError> {
        self.ensure_open()?;
        self.add_track_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.senders.push(track.clone());
        Ok(SenderId(state.senders.len() - 1))
    }

    async fn replace_track(
        &self,
        sender: SenderId,
        track: &Arc<MediaTrack>,
    ) -> Result<(), RtcError> {
        self.ensure_open()?;
        self.replace_track_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        let slot = state
            .senders
            .get_mut(sender.0)
            .ok_or(RtcError::UnknownSender(sender.0))?;
        *slot = track.clone();
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, RtcError> {
        self.ensure_open()?;
        let senders = self.sender_tracks();
        Ok(SessionDescription::offer(self.synthetic_sdp(&senders)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        self.ensure_open()?;
        let has_offer = self
            .state
            .lock()
            .remote
            .as_ref()
            .is_some_and(|d| d.sdp_type == SdpType::Offer);
        if !has_offer {
            return Err(RtcError::Engine("no remote offer".to_string()));
        }
        let senders = self.sender_tracks();
        Ok(SessionDescription::answer(self.synthetic_sdp(&senders)))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), RtcError> {
        self.ensure_open()?;
        self.state.lock().local = Some(desc.clone());

        let _ = self.events.send(PeerEvent::LocalCandidate(IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
                self.id,
                5000 + self.id
            ),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), RtcError> {
        self.ensure_open()?;
        if !desc.sdp.starts_with("v=0") {
            return Err(RtcError::InvalidDescription(
                "SDP must start with v=0".to_string(),
            ));
        }
        self.state.lock().remote = Some(desc.clone());
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), RtcError> {
        self.ensure_open()?;
        if self.reject_candidates.load(Ordering::SeqCst) {
            return Err(RtcError::InvalidCandidate(candidate.candidate.clone()));
        }
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(RtcError::InvalidCandidate(
                "remote description not set".to_string(),
            ));
        }
        state.candidates.push(candidate.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), RtcError> {
        if self.close_calls.fetch_add(1, Ordering::SeqCst) == 0 {
            self.emit_state(PeerState::Closed);
        }
        Ok(())
    }
}

/// Control plane that records every request
#[derive(Default)]
pub struct RecordingControlPlane {
    accepted: Mutex<Vec<SessionId>>,
    declined: Mutex<Vec<SessionId>>,
    fail: AtomicBool,
}

impl RecordingControlPlane {
    /// Create an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make later requests fail
    pub fn fail_requests(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Sessions accepted so far
    #[must_use]
    pub fn accepted(&self) -> Vec<SessionId> {
        self.accepted.lock().clone()
    }

    /// Sessions declined so far
    #[must_use]
    pub fn declined(&self) -> Vec<SessionId> {
        self.declined.lock().clone()
    }

    fn check(&self) -> Result<(), ControlPlaneError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ControlPlaneError("control plane unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CallControlPlane for RecordingControlPlane {
    async fn accept_call(&self, session_id: &SessionId) -> Result<(), ControlPlaneError> {
        self.accepted.lock().push(session_id.clone());
        self.check()
    }

    async fn decline_call(&self, session_id: &SessionId) -> Result<(), ControlPlaneError> {
        self.declined.lock().push(session_id.clone());
        self.check()
    }
}
