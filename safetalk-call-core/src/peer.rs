//! Peer connection controller
//!
//! Owns the single peer connection of a call session: local media, the
//! offer/answer exchange, remote ICE candidates, outbound track swaps for
//! screen sharing, and teardown.
//!
//! # Negotiation
//!
//! ```text
//!   initiator:  Fresh ──create_offer──► LocalOfferSent ──answer──► Stable
//!   responder:  Fresh ──offer──► RemoteOfferApplied ──create_answer──► Stable
//! ```
//!
//! Steps out of this order fail with [`PeerError::InvalidSignalingState`]
//! and leave the controller untouched. Negotiation steps are serialized, so
//! a remote description is never applied while an answer is being created.
//!
//! Remote candidates that arrive before the remote description are queued
//! and applied, in arrival order, right after it.

use crate::media::{MediaDevices, MediaError, MediaStreamHandle, MediaTrack, StreamKind};
use crate::rtc::{PeerConfig, PeerEvent, PeerFactory, PeerState, RtcError, RtcPeer, SenderId};
use crate::session::SessionEvent;
use crate::signaling::{
    IceCandidate, SdpType, SessionDescription, SignalingError, SignalingHandler, SignalingMessage,
};
use crate::types::{
    CallRole, CallType, FailureReason, MediaConstraints, MediaKind, SessionId, VideoResolution,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};

/// Peer connection controller errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// Negotiation step called out of order or by the wrong role
    #[error("Invalid signaling state: {operation} not allowed for {role:?} in {phase:?}")]
    InvalidSignalingState {
        /// Rejected operation
        operation: &'static str,
        /// Role of this participant
        role: CallRole,
        /// Phase at the time of the call
        phase: NegotiationPhase,
    },

    /// Offer/answer generation or application failed
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// No peer connection has been created yet
    #[error("Peer connection not created")]
    NotConnected,

    /// Peer connection could not be created or configured
    #[error("Connection error: {0}")]
    Connection(String),

    /// Local media could not be acquired
    #[error(transparent)]
    Media(#[from] MediaError),

    /// Signaling send failed
    #[error(transparent)]
    Signaling(#[from] SignalingError),

    /// Controller has been torn down
    #[error("Controller closed")]
    Closed,
}

impl PeerError {
    /// Reason to surface with `CallState::Failed`
    #[must_use]
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            Self::InvalidSignalingState { .. } | Self::Negotiation(_) => {
                FailureReason::NegotiationError
            }
            Self::Media(MediaError::PermissionDenied(_)) => FailureReason::PermissionDenied,
            Self::Media(_) => FailureReason::DeviceUnavailable,
            Self::Signaling(_) => FailureReason::SignalingTransportError,
            Self::NotConnected | Self::Connection(_) | Self::Closed => {
                FailureReason::ConnectionFailed
            }
        }
    }
}

fn negotiation_err(e: RtcError) -> PeerError {
    PeerError::Negotiation(e.to_string())
}

/// Offer/answer progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    /// Nothing exchanged
    Fresh,
    /// Initiator applied and sent its offer
    LocalOfferSent,
    /// Responder applied the remote offer
    RemoteOfferApplied,
    /// Both descriptions applied
    Stable,
}

impl NegotiationPhase {
    /// Whether the remote description has been applied
    #[must_use]
    pub fn has_remote_description(self) -> bool {
        matches!(self, Self::RemoteOfferApplied | Self::Stable)
    }
}

/// What happened to a remote candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    /// Added to the connection
    Applied,
    /// Queued until the remote description is applied
    Buffered,
    /// End-of-candidates marker or empty candidate
    Ignored,
    /// The engine refused it; the call goes on
    Rejected,
}

struct Negotiation {
    phase: NegotiationPhase,
    pending: Vec<IceCandidate>,
}

struct ScreenShare {
    track: Arc<MediaTrack>,
    camera_enabled: bool,
}

/// Owns the peer connection of one call session
pub struct PeerConnectionController {
    session_id: SessionId,
    role: CallRole,
    resolution: VideoResolution,
    devices: Arc<dyn MediaDevices>,
    signaling: Arc<SignalingHandler>,
    events: broadcast::Sender<SessionEvent>,
    peer: parking_lot::Mutex<Option<Arc<dyn RtcPeer>>>,
    negotiation: Mutex<Negotiation>,
    local: parking_lot::Mutex<Option<MediaStreamHandle>>,
    remote: parking_lot::Mutex<Option<MediaStreamHandle>>,
    video_sender: parking_lot::Mutex<Option<SenderId>>,
    screen: parking_lot::Mutex<Option<ScreenShare>>,
    screen_op: Mutex<()>,
    remote_hung_up: AtomicBool,
    closed: AtomicBool,
}

impl PeerConnectionController {
    /// Create a controller for one session
    #[must_use]
    pub fn new(
        session_id: SessionId,
        role: CallRole,
        resolution: VideoResolution,
        devices: Arc<dyn MediaDevices>,
        signaling: Arc<SignalingHandler>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            session_id,
            role,
            resolution,
            devices,
            signaling,
            events,
            peer: parking_lot::Mutex::new(None),
            negotiation: Mutex::new(Negotiation {
                phase: NegotiationPhase::Fresh,
                pending: Vec::new(),
            }),
            local: parking_lot::Mutex::new(None),
            remote: parking_lot::Mutex::new(None),
            video_sender: parking_lot::Mutex::new(None),
            screen: parking_lot::Mutex::new(None),
            screen_op: Mutex::new(()),
            remote_hung_up: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Role fixed at session start
    #[must_use]
    pub fn role(&self) -> CallRole {
        self.role
    }

    /// Signaling endpoint shared with the session
    #[must_use]
    pub fn signaling(&self) -> &Arc<SignalingHandler> {
        &self.signaling
    }

    /// Whether `teardown` has run
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Current local stream
    #[must_use]
    pub fn local_stream(&self) -> Option<MediaStreamHandle> {
        self.local.lock().clone()
    }

    /// Current remote stream
    #[must_use]
    pub fn remote_stream(&self) -> Option<MediaStreamHandle> {
        self.remote.lock().clone()
    }

    /// Whether the outbound video is the screen
    #[must_use]
    pub fn is_screen_sharing(&self) -> bool {
        self.screen.lock().is_some()
    }

    /// Current negotiation phase
    pub async fn negotiation_phase(&self) -> NegotiationPhase {
        self.negotiation.lock().await.phase
    }

    /// Remote candidates waiting for the remote description
    pub async fn buffered_candidates(&self) -> usize {
        self.negotiation.lock().await.pending.len()
    }

    fn peer(&self) -> Result<Arc<dyn RtcPeer>, PeerError> {
        if self.is_closed() {
            return Err(PeerError::Closed);
        }
        self.peer.lock().clone().ok_or(PeerError::NotConnected)
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Store `stream` as the local stream unless torn down
    ///
    /// `closed` is checked under the stream lock, so a stream installed here
    /// is always seen by `teardown`.
    fn install_local(&self, stream: MediaStreamHandle) -> bool {
        let mut local = self.local.lock();
        if self.is_closed() {
            drop(local);
            stream.stop_all();
            return false;
        }
        *local = Some(stream.clone());
        drop(local);
        self.emit(SessionEvent::LocalStream(stream));
        true
    }

    /// Capture microphone, and the camera for video calls
    ///
    /// # Errors
    ///
    /// Returns error if capture is refused or no device exists
    #[tracing::instrument(skip(self), fields(session_id = %self.session_id))]
    pub async fn acquire_local_media(
        &self,
        call_type: CallType,
    ) -> Result<MediaStreamHandle, PeerError> {
        let constraints = MediaConstraints::for_call(call_type, self.resolution);
        let stream = self
            .devices
            .get_user_media(&constraints)
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "Local media acquisition failed");
                PeerError::Media(e)
            })?;

        if !self.install_local(stream.clone()) {
            return Err(PeerError::Closed);
        }
        tracing::info!(tracks = stream.tracks().len(), "Local media ready");
        Ok(stream)
    }

    /// Create the peer connection and attach every local track
    ///
    /// Returns the channel on which the engine reports candidates, inbound
    /// tracks and connection state; feed it to [`Self::handle_peer_event`].
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot create the connection or attach a
    /// track
    #[tracing::instrument(skip(self, factory, config), fields(session_id = %self.session_id))]
    pub async fn create_connection(
        &self,
        factory: &dyn PeerFactory,
        config: &PeerConfig,
    ) -> Result<mpsc::UnboundedReceiver<PeerEvent>, PeerError> {
        if self.is_closed() {
            return Err(PeerError::Closed);
        }
        if self.peer.lock().is_some() {
            return Err(PeerError::Connection(
                "peer connection already created".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let peer = factory
            .create_peer(config, tx)
            .await
            .map_err(|e| PeerError::Connection(e.to_string()))?;

        let tracks = self
            .local_stream()
            .map(|s| s.tracks().to_vec())
            .unwrap_or_default();
        for track in &tracks {
            let sender = match peer.add_track(track).await {
                Ok(sender) => sender,
                Err(e) => {
                    let _ = peer.close().await;
                    return Err(PeerError::Connection(e.to_string()));
                }
            };
            if track.kind() == MediaKind::Video {
                *self.video_sender.lock() = Some(sender);
            }
            tracing::debug!(track_id = %track.id(), sender = sender.0, "Attached local track");
        }

        {
            let mut slot = self.peer.lock();
            if !self.is_closed() {
                *slot = Some(peer);
                tracing::info!(tracks = tracks.len(), "Peer connection created");
                return Ok(rx);
            }
        }
        let _ = peer.close().await;
        Err(PeerError::Closed)
    }

    /// Generate the offer and apply it locally
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::InvalidSignalingState`] unless this is the
    /// initiator and nothing has been exchanged yet
    #[tracing::instrument(skip(self), fields(session_id = %self.session_id))]
    pub async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let mut negotiation = self.negotiation.lock().await;
        if self.role != CallRole::Initiator || negotiation.phase != NegotiationPhase::Fresh {
            return Err(PeerError::InvalidSignalingState {
                operation: "create_offer",
                role: self.role,
                phase: negotiation.phase,
            });
        }

        let peer = self.peer()?;
        let offer = peer.create_offer().await.map_err(negotiation_err)?;
        peer.set_local_description(&offer)
            .await
            .map_err(negotiation_err)?;
        negotiation.phase = NegotiationPhase::LocalOfferSent;

        tracing::debug!(sdp_len = offer.sdp.len(), "Offer created");
        Ok(offer)
    }

    /// Generate the answer to the applied offer and apply it locally
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::InvalidSignalingState`] unless this is the
    /// responder and the remote offer has been applied
    #[tracing::instrument(skip(self), fields(session_id = %self.session_id))]
    pub async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let mut negotiation = self.negotiation.lock().await;
        if self.role != CallRole::Responder
            || negotiation.phase != NegotiationPhase::RemoteOfferApplied
        {
            return Err(PeerError::InvalidSignalingState {
                operation: "create_answer",
                role: self.role,
                phase: negotiation.phase,
            });
        }

        let peer = self.peer()?;
        let answer = peer.create_answer().await.map_err(negotiation_err)?;
        peer.set_local_description(&answer)
            .await
            .map_err(negotiation_err)?;
        negotiation.phase = NegotiationPhase::Stable;

        tracing::debug!(sdp_len = answer.sdp.len(), "Answer created");
        Ok(answer)
    }

    /// Apply the remote offer (responder) or answer (initiator)
    ///
    /// Buffered remote candidates are applied right after.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::InvalidSignalingState`] if `desc` is not the
    /// expected next step, or [`PeerError::Negotiation`] if the engine
    /// rejects it
    #[tracing::instrument(skip(self, desc), fields(session_id = %self.session_id, sdp_type = ?desc.sdp_type, sdp_len = desc.sdp.len()))]
    pub async fn apply_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), PeerError> {
        let mut negotiation = self.negotiation.lock().await;
        let expected = match (self.role, negotiation.phase) {
            (CallRole::Responder, NegotiationPhase::Fresh) => Some(SdpType::Offer),
            (CallRole::Initiator, NegotiationPhase::LocalOfferSent) => Some(SdpType::Answer),
            _ => None,
        };
        let Some(expected) = expected.filter(|t| *t == desc.sdp_type) else {
            return Err(PeerError::InvalidSignalingState {
                operation: "apply_remote_description",
                role: self.role,
                phase: negotiation.phase,
            });
        };

        let peer = self.peer()?;
        peer.set_remote_description(desc)
            .await
            .map_err(negotiation_err)?;
        negotiation.phase = match expected {
            SdpType::Offer => NegotiationPhase::RemoteOfferApplied,
            SdpType::Answer => NegotiationPhase::Stable,
        };

        let pending = std::mem::take(&mut negotiation.pending);
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), "Flushing buffered remote candidates");
        }
        for candidate in &pending {
            Self::add_candidate(peer.as_ref(), candidate).await;
        }
        Ok(())
    }

    /// Add a remote ICE candidate, or queue it until the remote description
    /// is applied
    ///
    /// `None` and empty candidates mark the end of candidates and are
    /// ignored. A candidate the engine refuses is logged; the call goes on.
    pub async fn apply_remote_candidate(&self, candidate: Option<IceCandidate>) -> CandidateOutcome {
        let Some(candidate) = candidate.filter(|c| !c.is_end_of_candidates()) else {
            tracing::debug!(session_id = %self.session_id, "Remote end of candidates");
            return CandidateOutcome::Ignored;
        };

        let mut negotiation = self.negotiation.lock().await;
        if !negotiation.phase.has_remote_description() {
            negotiation.pending.push(candidate);
            tracing::debug!(
                session_id = %self.session_id,
                buffered = negotiation.pending.len(),
                "Buffered early remote candidate"
            );
            return CandidateOutcome::Buffered;
        }

        let Ok(peer) = self.peer() else {
            return CandidateOutcome::Rejected;
        };
        if Self::add_candidate(peer.as_ref(), &candidate).await {
            CandidateOutcome::Applied
        } else {
            CandidateOutcome::Rejected
        }
    }

    async fn add_candidate(peer: &dyn RtcPeer, candidate: &IceCandidate) -> bool {
        match peer.add_ice_candidate(candidate).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, candidate = %candidate.candidate, "Failed to apply remote candidate");
                false
            }
        }
    }

    /// Handle a callback from the engine
    ///
    /// Local candidates are sent to the remote side and inbound tracks join
    /// the remote stream. Connection state changes are returned for the
    /// session to act on.
    pub async fn handle_peer_event(&self, event: PeerEvent) -> Option<PeerState> {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if self.is_closed() {
                    return None;
                }
                let message = SignalingMessage::IceCandidate(Some(candidate));
                if let Err(e) = self.signaling.send(&message).await {
                    tracing::warn!(session_id = %self.session_id, error = %e, "Failed to send local candidate");
                }
                None
            }
            PeerEvent::Track(track) => {
                self.add_remote_track(track);
                None
            }
            PeerEvent::StateChanged(state) => Some(state),
        }
    }

    fn add_remote_track(&self, track: Arc<MediaTrack>) {
        let mut remote = self.remote.lock();
        if self.is_closed() {
            drop(remote);
            track.stop();
            return;
        }
        let handle = match remote.as_ref() {
            Some(existing) => existing.with_track(track),
            None => MediaStreamHandle::new(StreamKind::Remote, vec![track]),
        };
        *remote = Some(handle.clone());
        drop(remote);

        tracing::info!(session_id = %self.session_id, tracks = handle.tracks().len(), "Remote stream updated");
        self.emit(SessionEvent::RemoteStream(handle));
    }

    fn toggle(&self, kind: MediaKind) -> bool {
        let local = self.local.lock();
        let track = local.as_ref().and_then(|s| match kind {
            MediaKind::Audio => s.audio_track(),
            MediaKind::Video => s.video_track(),
        });
        match track {
            Some(track) if !track.is_stopped() => {
                let enabled = !track.is_enabled();
                track.set_enabled(enabled);
                enabled
            }
            _ => false,
        }
    }

    /// Flip the microphone mute switch
    ///
    /// Returns the new enabled state, or false if there is no audio track.
    pub fn toggle_audio(&self) -> bool {
        self.toggle(MediaKind::Audio)
    }

    /// Flip the camera on/off switch
    ///
    /// Returns the new enabled state, or false if there is no video track.
    pub fn toggle_video(&self) -> bool {
        self.toggle(MediaKind::Video)
    }

    /// Send the screen instead of the camera
    ///
    /// The screen track takes the camera's sender, so no renegotiation
    /// happens. If the screen track is stopped from outside the call, the
    /// camera comes back on its own. Returns false if there is no outbound
    /// video or the screen cannot be captured.
    pub async fn start_screen_share(self: &Arc<Self>) -> bool {
        let _op = self.screen_op.lock().await;
        if self.is_screen_sharing() {
            return true;
        }
        let Some(sender) = *self.video_sender.lock() else {
            tracing::debug!(session_id = %self.session_id, "No outbound video to replace with screen");
            return false;
        };
        let Ok(peer) = self.peer() else {
            return false;
        };

        let display = match self.devices.get_display_media().await {
            Ok(display) => display,
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "Screen capture failed");
                return false;
            }
        };
        let Some(screen) = display.video_track().cloned() else {
            display.stop_all();
            return false;
        };

        if let Err(e) = peer.replace_track(sender, &screen).await {
            tracing::warn!(session_id = %self.session_id, error = %e, "Failed to swap in screen track");
            screen.stop();
            return false;
        }

        let swapped = {
            let mut local = self.local.lock();
            match local.as_ref() {
                Some(stream) if !self.is_closed() => {
                    let camera = stream.video_track().cloned();
                    let next = stream.with_video_track(screen.clone());
                    *local = Some(next.clone());
                    Some((camera, next))
                }
                _ => None,
            }
        };
        let Some((camera, stream)) = swapped else {
            screen.stop();
            return false;
        };

        let camera_enabled = camera.as_ref().is_some_and(|c| c.is_enabled());
        if let Some(camera) = camera {
            camera.stop();
        }
        *self.screen.lock() = Some(ScreenShare {
            track: screen.clone(),
            camera_enabled,
        });
        self.emit(SessionEvent::LocalStream(stream));
        tracing::info!(session_id = %self.session_id, track_id = %screen.id(), "Screen share started");

        let this: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            screen.ended().await;
            if let Some(this) = this.upgrade() {
                let _op = this.screen_op.lock().await;
                if this.revert_screen_share(Some(&screen)).await {
                    tracing::info!(session_id = %this.session_id, "Screen share ended outside the call");
                }
            }
        });
        true
    }

    /// Send the camera again instead of the screen
    ///
    /// Returns false if no screen share was active.
    pub async fn stop_screen_share(&self) -> bool {
        let _op = self.screen_op.lock().await;
        self.revert_screen_share(None).await
    }

    async fn revert_screen_share(&self, only: Option<&Arc<MediaTrack>>) -> bool {
        let share = {
            let mut screen = self.screen.lock();
            match (screen.as_ref(), only) {
                (Some(current), Some(track)) if !Arc::ptr_eq(&current.track, track) => None,
                _ => screen.take(),
            }
        };
        let Some(share) = share else {
            return false;
        };
        share.track.stop();

        let (Some(sender), Ok(peer)) = (*self.video_sender.lock(), self.peer()) else {
            return true;
        };

        let camera = match self
            .devices
            .get_user_media(&MediaConstraints::camera_only(self.resolution))
            .await
        {
            Ok(stream) => stream.video_track().cloned(),
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "Could not reacquire camera, video stays off");
                None
            }
        };
        let Some(camera) = camera else {
            return true;
        };
        camera.set_enabled(share.camera_enabled);

        if let Err(e) = peer.replace_track(sender, &camera).await {
            tracing::warn!(session_id = %self.session_id, error = %e, "Failed to swap camera back in");
        }

        let stream = {
            let mut local = self.local.lock();
            match local.as_ref() {
                Some(stream) if !self.is_closed() => {
                    let next = stream.with_video_track(camera.clone());
                    *local = Some(next.clone());
                    Some(next)
                }
                _ => None,
            }
        };
        match stream {
            Some(stream) => {
                self.emit(SessionEvent::LocalStream(stream));
                tracing::info!(session_id = %self.session_id, track_id = %camera.id(), "Camera restored");
            }
            None => {
                camera.stop();
            }
        }
        true
    }

    /// Record that the remote side hung up, so teardown does not echo it
    pub fn mark_remote_hangup(&self) {
        self.remote_hung_up.store(true, Ordering::SeqCst);
    }

    /// Release everything the controller holds
    ///
    /// Sends a hangup (unless the remote side already did), closes the peer
    /// connection, stops every local and remote track, and closes the
    /// signaling channel. Only the first call does anything; returns `true`
    /// for that call.
    #[tracing::instrument(skip(self), fields(session_id = %self.session_id))]
    pub async fn teardown(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        if !self.remote_hung_up.load(Ordering::SeqCst) {
            if let Err(e) = self.signaling.send(&SignalingMessage::hangup()).await {
                tracing::debug!(error = %e, "Hangup not delivered");
            }
        }

        let peer = self.peer.lock().take();
        if let Some(peer) = peer {
            if let Err(e) = peer.close().await {
                tracing::warn!(error = %e, "Failed to close peer connection");
            }
        }

        let mut stopped = 0;
        if let Some(stream) = self.local.lock().as_ref() {
            stopped += stream.stop_all();
        }
        if let Some(share) = self.screen.lock().take() {
            if share.track.stop() {
                stopped += 1;
            }
        }
        if let Some(stream) = self.remote.lock().as_ref() {
            stream.stop_all();
        }

        self.signaling.close().await;
        tracing::info!(local_tracks_stopped = stopped, "Call resources released");
        true
    }
}

impl std::fmt::Debug for PeerConnectionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnectionController")
            .field("session_id", &self.session_id)
            .field("role", &self.role)
            .field("closed", &self.is_closed())
            .field("screen_sharing", &self.is_screen_sharing())
            .finish()
    }
}
