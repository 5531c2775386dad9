//! Call session state machine
//!
//! A [`CallSession`] is the single source of truth for one call's state. It
//! opens the signaling channel, drives the [`PeerConnectionController`], and
//! turns signaling messages, engine callbacks, timeouts and user actions into
//! [`CallState`] transitions.
//!
//! Transitions are checked against [`CallState::can_transition_to`] and made
//! under one lock, with the `StateChanged` event emitted under the same lock,
//! so subscribers see changes in the order they happened. `Ended` and
//! `Failed` are reached exactly once; whoever makes that transition releases
//! the call's resources.

use crate::media::{MediaDevices, MediaStreamHandle};
use crate::peer::{PeerConnectionController, PeerError};
use crate::rtc::{PeerConfig, PeerEvent, PeerFactory, PeerState};
use crate::signaling::{
    SdpType, SessionDescription, SignalingConnector, SignalingHandler, SignalingMessage,
    DECLINED_REASON,
};
use crate::types::{
    CallRole, CallState, CallType, EndReason, FailureReason, SessionId, VideoResolution,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

/// Session errors
///
/// Only misuse of the API is an error. Runtime failures end the call in
/// `CallState::Failed` instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Operation not valid in the current state
    #[error("Invalid state: {operation} not allowed in {state:?}")]
    InvalidState {
        /// Rejected operation
        operation: &'static str,
        /// State at the time of the call
        state: CallState,
    },

    /// Operation names a different session than the ringing one
    #[error("Session mismatch: ringing {ringing}, got {requested}")]
    SessionMismatch {
        /// Session that is ringing
        ringing: SessionId,
        /// Session named by the caller
        requested: SessionId,
    },
}

/// Control plane errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Control plane error: {0}")]
pub struct ControlPlaneError(pub String);

/// Out-of-band call lifecycle requests (accept, decline)
///
/// The call is created by the control plane, which hands out the session id.
/// Accepting and declining are reported back to it.
#[async_trait]
pub trait CallControlPlane: Send + Sync {
    /// Tell the control plane this participant accepted the call
    async fn accept_call(&self, session_id: &SessionId) -> Result<(), ControlPlaneError>;

    /// Tell the control plane this participant declined the call
    async fn decline_call(&self, session_id: &SessionId) -> Result<(), ControlPlaneError>;
}

/// Control plane that accepts everything and does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopControlPlane;

#[async_trait]
impl CallControlPlane for NoopControlPlane {
    async fn accept_call(&self, _session_id: &SessionId) -> Result<(), ControlPlaneError> {
        Ok(())
    }

    async fn decline_call(&self, _session_id: &SessionId) -> Result<(), ControlPlaneError> {
        Ok(())
    }
}

/// Session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Peer connection settings
    pub peer: PeerConfig,
    /// Ideal camera resolution
    pub video_resolution: VideoResolution,
    /// Seconds allowed from start to `Connected`
    pub negotiation_timeout_secs: u64,
    /// Seconds an incoming call may ring
    pub ring_timeout_secs: u64,
    /// Buffered events per subscriber
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            peer: PeerConfig::default(),
            video_resolution: VideoResolution::HD720,
            negotiation_timeout_secs: 30,
            ring_timeout_secs: 45,
            event_capacity: 100,
        }
    }
}

impl SessionConfig {
    /// Negotiation timeout as a duration
    #[must_use]
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    /// Ring timeout as a duration
    #[must_use]
    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }
}

/// Events delivered to subscribers, in the order they happen
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The call state changed
    StateChanged(CallState),
    /// The local stream is ready or its tracks changed
    LocalStream(MediaStreamHandle),
    /// A remote track arrived
    RemoteStream(MediaStreamHandle),
}

/// Summary of a finished (or running) call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    /// Session id, once known
    pub session_id: Option<SessionId>,
    /// Voice or video
    pub call_type: Option<CallType>,
    /// Initiator or responder
    pub role: Option<CallRole>,
    /// State when the record was taken
    pub state: CallState,
    /// When the session left `Idle`
    pub started_at: Option<DateTime<Utc>>,
    /// When the session reached a terminal state
    pub ended_at: Option<DateTime<Utc>>,
    /// Time spent connected
    pub duration: Option<Duration>,
}

struct Core {
    state: CallState,
    session_id: Option<SessionId>,
    call_type: Option<CallType>,
    role: Option<CallRole>,
    controller: Option<Arc<PeerConnectionController>>,
    signaling: Option<Arc<SignalingHandler>>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    connected_at: Option<Instant>,
    finished_at: Option<Instant>,
}

#[derive(Clone)]
struct Dependencies {
    connector: Arc<dyn SignalingConnector>,
    devices: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerFactory>,
    control_plane: Arc<dyn CallControlPlane>,
    config: SessionConfig,
}

struct SessionInner {
    deps: Dependencies,
    core: parking_lot::Mutex<Core>,
    events: broadcast::Sender<SessionEvent>,
    finished: watch::Sender<bool>,
}

impl SessionInner {
    fn state(&self) -> CallState {
        self.core.lock().state
    }

    /// Move to `next` if the current state satisfies `allowed` and the move
    /// is a valid transition
    fn transition_if(
        &self,
        allowed: impl FnOnce(&CallState) -> bool,
        next: CallState,
    ) -> Result<CallState, CallState> {
        let mut core = self.core.lock();
        let old = core.state;
        if !allowed(&old) || !old.can_transition_to(&next) {
            return Err(old);
        }
        core.state = next;

        let now = Instant::now();
        if next == CallState::Connected {
            core.connected_at = Some(now);
        }
        if next.is_terminal() {
            core.finished_at = Some(now);
            core.ended_at = Some(Utc::now());
            self.finished.send_replace(true);
        }

        tracing::info!(
            session_id = ?core.session_id.as_ref().map(SessionId::as_str),
            old_state = ?old,
            new_state = ?next,
            "Call state transition"
        );
        let _ = self.events.send(SessionEvent::StateChanged(next));
        Ok(old)
    }

    fn transition(&self, next: CallState) -> bool {
        self.transition_if(|_| true, next).is_ok()
    }

    /// Reach a terminal state and release resources, once
    async fn terminate(&self, next: CallState) -> bool {
        if !self.transition(next) {
            return false;
        }
        self.release().await;
        true
    }

    async fn fail(&self, reason: FailureReason) -> bool {
        let failed = self.terminate(CallState::Failed(reason)).await;
        if failed {
            tracing::error!(reason = %reason, "Call failed");
        }
        failed
    }

    async fn release(&self) {
        let (controller, signaling) = {
            let core = self.core.lock();
            (core.controller.clone(), core.signaling.clone())
        };
        match (controller, signaling) {
            (Some(controller), _) => {
                controller.teardown().await;
            }
            (None, Some(signaling)) => {
                signaling.close().await;
            }
            (None, None) => {}
        }
    }

    /// Record the controller unless the call already finished
    fn install(&self, controller: &Arc<PeerConnectionController>) -> bool {
        let mut core = self.core.lock();
        if core.state.is_terminal() {
            return false;
        }
        core.signaling = Some(controller.signaling().clone());
        core.controller = Some(controller.clone());
        true
    }

    fn controller(&self) -> Option<Arc<PeerConnectionController>> {
        self.core.lock().controller.clone()
    }

    /// Fail with `Timeout` if the call is still `waiting` after `after`
    fn arm_timeout(self: &Arc<Self>, waiting: CallState, after: Duration) {
        let inner = self.clone();
        tokio::spawn(async move {
            let mut finished = inner.finished.subscribe();
            tokio::select! {
                () = async { let _ = finished.wait_for(|done| *done).await; } => {}
                () = tokio::time::sleep(after) => {
                    let timed_out = inner
                        .transition_if(|s| *s == waiting, CallState::Failed(FailureReason::Timeout))
                        .is_ok();
                    if timed_out {
                        tracing::warn!(state = ?waiting, timeout = ?after, "Call timed out");
                        inner.release().await;
                    }
                }
            }
        });
    }

    /// Run one setup step, giving up if the call finishes first
    async fn unless_finished<T>(&self, step: impl Future<Output = T>) -> Option<T> {
        let mut finished = self.finished.subscribe();
        tokio::select! {
            out = step => Some(out),
            () = async { let _ = finished.wait_for(|done| *done).await; } => None,
        }
    }

    /// Bring the call up from `Connecting`
    async fn launch(self: &Arc<Self>, session_id: SessionId, call_type: CallType, role: CallRole) {
        let Some(connected) = self
            .unless_finished(self.deps.connector.connect(&session_id))
            .await
        else {
            tracing::debug!("Call finished while opening signaling");
            return;
        };
        let transport = match connected {
            Ok(transport) => transport,
            Err(e) => {
                tracing::error!(error = %e, "Failed to open signaling channel");
                self.fail(FailureReason::SignalingTransportError).await;
                return;
            }
        };

        let signaling = Arc::new(SignalingHandler::new(session_id.clone(), transport));
        let controller = Arc::new(PeerConnectionController::new(
            session_id,
            role,
            self.deps.config.video_resolution,
            self.deps.devices.clone(),
            signaling,
            self.events.clone(),
        ));
        if !self.install(&controller) {
            controller.teardown().await;
            return;
        }

        match self
            .unless_finished(controller.acquire_local_media(call_type))
            .await
        {
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                self.fail_with(e).await;
                return;
            }
            None => {
                tracing::debug!("Call finished while acquiring media");
                return;
            }
        }

        let peer_events = match controller
            .create_connection(self.deps.peers.as_ref(), &self.deps.config.peer)
            .await
        {
            Ok(rx) => rx,
            Err(e) => {
                self.fail_with(e).await;
                return;
            }
        };

        tokio::spawn(drive(self.clone(), controller.clone(), peer_events));

        if role == CallRole::Initiator {
            self.send_description(&controller, controller.create_offer().await)
                .await;
        }
    }

    async fn fail_with(&self, error: PeerError) {
        if matches!(error, PeerError::Closed) {
            return;
        }
        tracing::warn!(error = %error, "Call setup step failed");
        self.fail(error.failure_reason()).await;
    }

    async fn send_description(
        &self,
        controller: &PeerConnectionController,
        desc: Result<SessionDescription, PeerError>,
    ) {
        let desc = match desc {
            Ok(desc) => desc,
            Err(e) => {
                self.fail_with(e).await;
                return;
            }
        };
        let message = match desc.sdp_type {
            SdpType::Offer => SignalingMessage::Offer(desc),
            SdpType::Answer => SignalingMessage::Answer(desc),
        };
        if let Err(e) = controller.signaling().send(&message).await {
            if !self.state().is_terminal() {
                tracing::error!(error = %e, message_type = message.kind(), "Failed to send description");
                self.fail(FailureReason::SignalingTransportError).await;
            }
        }
    }

    async fn on_signal(&self, controller: &PeerConnectionController, message: SignalingMessage) {
        match message {
            SignalingMessage::Offer(desc) | SignalingMessage::Answer(desc) => {
                match controller.apply_remote_description(&desc).await {
                    Ok(()) => {
                        if controller.role() == CallRole::Responder {
                            self.send_description(controller, controller.create_answer().await)
                                .await;
                        }
                    }
                    Err(e @ PeerError::InvalidSignalingState { .. }) => {
                        tracing::warn!(error = %e, "Dropping out-of-order remote description");
                    }
                    Err(e) => self.fail_with(e).await,
                }
            }
            SignalingMessage::IceCandidate(candidate) => {
                controller.apply_remote_candidate(candidate).await;
            }
            SignalingMessage::Hangup(hangup) => {
                controller.mark_remote_hangup();
                let reason = if hangup.reason.as_deref() == Some(DECLINED_REASON) {
                    EndReason::Declined
                } else {
                    EndReason::RemoteHangup
                };
                self.terminate(CallState::Ended(reason)).await;
            }
        }
    }

    async fn on_peer_state(&self, state: PeerState) {
        tracing::debug!(peer_state = ?state, "Peer connection state");
        match state {
            PeerState::Connected => {
                self.transition(CallState::Connected);
            }
            PeerState::Failed => {
                self.fail(FailureReason::ConnectionFailed).await;
            }
            PeerState::Disconnected | PeerState::Closed => match self.state() {
                CallState::Connected => {
                    self.terminate(CallState::Ended(EndReason::ConnectionLost))
                        .await;
                }
                CallState::Connecting => {
                    self.fail(FailureReason::ConnectionFailed).await;
                }
                CallState::Idle
                | CallState::Ringing
                | CallState::Ended(_)
                | CallState::Failed(_) => {}
            },
            PeerState::New | PeerState::Connecting => {}
        }
    }

    async fn on_signaling_lost(&self, reason: &str) {
        match self.state() {
            CallState::Connected => {
                tracing::warn!(reason, "Signaling channel lost, media continues peer to peer");
            }
            CallState::Idle | CallState::Ringing | CallState::Connecting => {
                tracing::error!(reason, "Signaling channel lost before connecting");
                self.fail(FailureReason::SignalingTransportError).await;
            }
            CallState::Ended(_) | CallState::Failed(_) => {}
        }
    }
}

/// Per-call event loop
///
/// Runs until the call reaches a terminal state.
async fn drive(
    inner: Arc<SessionInner>,
    controller: Arc<PeerConnectionController>,
    mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
) {
    let mut finished = inner.finished.subscribe();
    let signaling = controller.signaling().clone();
    let mut signaling_open = true;
    let mut peer_open = true;

    loop {
        if *finished.borrow_and_update() {
            break;
        }
        tokio::select! {
            changed = finished.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            message = signaling.recv(), if signaling_open => match message {
                Ok(Some(message)) => inner.on_signal(&controller, message).await,
                Ok(None) => {
                    signaling_open = false;
                    inner.on_signaling_lost("channel closed").await;
                }
                Err(e) => {
                    signaling_open = false;
                    inner.on_signaling_lost(&e.to_string()).await;
                }
            },
            event = peer_events.recv(), if peer_open => match event {
                Some(event) => {
                    if let Some(state) = controller.handle_peer_event(event).await {
                        inner.on_peer_state(state).await;
                    }
                }
                None => peer_open = false,
            },
        }
    }
    tracing::debug!("Call driver stopped");
}

/// Builds a fresh [`CallSession`] per call from shared dependencies
#[derive(Clone)]
pub struct CallFactory {
    deps: Dependencies,
}

impl CallFactory {
    /// Create a factory with a no-op control plane and default config
    pub fn new(
        connector: Arc<dyn SignalingConnector>,
        devices: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerFactory>,
    ) -> Self {
        Self {
            deps: Dependencies {
                connector,
                devices,
                peers,
                control_plane: Arc::new(NoopControlPlane),
                config: SessionConfig::default(),
            },
        }
    }

    /// Use this control plane for accept/decline
    #[must_use]
    pub fn with_control_plane(mut self, control_plane: Arc<dyn CallControlPlane>) -> Self {
        self.deps.control_plane = control_plane;
        self
    }

    /// Use this session configuration
    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.deps.config = config;
        self
    }

    /// Configuration handed to new sessions
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.deps.config
    }

    /// Create an idle session
    #[must_use]
    pub fn create(&self) -> CallSession {
        let (events, _) = broadcast::channel(self.deps.config.event_capacity.max(1));
        let (finished, _) = watch::channel(false);
        CallSession {
            inner: Arc::new(SessionInner {
                deps: self.deps.clone(),
                core: parking_lot::Mutex::new(Core {
                    state: CallState::Idle,
                    session_id: None,
                    call_type: None,
                    role: None,
                    controller: None,
                    signaling: None,
                    started_at: None,
                    ended_at: None,
                    connected_at: None,
                    finished_at: None,
                }),
                events,
                finished,
            }),
        }
    }
}

/// One call, from idle to its terminal state
///
/// Cheap to clone; clones share the same call.
#[derive(Clone)]
pub struct CallSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.inner.core.lock();
        f.debug_struct("CallSession")
            .field("session_id", &core.session_id)
            .field("state", &core.state)
            .field("call_type", &core.call_type)
            .field("role", &core.role)
            .finish()
    }
}

impl CallSession {
    /// Current state
    #[must_use]
    pub fn state(&self) -> CallState {
        self.inner.state()
    }

    /// Session id, once the session has left `Idle`
    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.core.lock().session_id.clone()
    }

    /// Subscribe to state and stream events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Wait until the call reaches `Ended` or `Failed`
    pub async fn finished(&self) -> CallState {
        let mut finished = self.inner.finished.subscribe();
        let _ = finished.wait_for(|done| *done).await;
        self.state()
    }

    fn claim(
        &self,
        operation: &'static str,
        session_id: &SessionId,
        call_type: CallType,
        role: CallRole,
        allow_ringing: bool,
    ) -> Result<(), SessionError> {
        let mut core = self.inner.core.lock();
        match core.state {
            CallState::Idle => {}
            CallState::Ringing if allow_ringing => {
                if let Some(ringing) = core.session_id.as_ref().filter(|id| *id != session_id) {
                    return Err(SessionError::SessionMismatch {
                        ringing: ringing.clone(),
                        requested: session_id.clone(),
                    });
                }
            }
            state => return Err(SessionError::InvalidState { operation, state }),
        }
        core.session_id = Some(session_id.clone());
        core.call_type = Some(call_type);
        core.role = Some(role);
        if core.started_at.is_none() {
            core.started_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn begin(&self, session_id: SessionId, call_type: CallType, role: CallRole) -> CallState {
        if self.inner.transition(CallState::Connecting) {
            self.inner.arm_timeout(
                CallState::Connecting,
                self.inner.deps.config.negotiation_timeout(),
            );
            self.inner.launch(session_id, call_type, role).await;
        }
        self.state()
    }

    /// Start a call
    ///
    /// Opens signaling, acquires media, creates the peer connection and, for
    /// the initiator, sends the offer. Returns the state once those steps are
    /// done: `Connecting` while negotiation continues, or `Failed` if a step
    /// failed.
    ///
    /// # Errors
    ///
    /// Returns error if the session is not idle
    #[tracing::instrument(skip(self, session_id), fields(session_id = %session_id))]
    pub async fn start(
        &self,
        session_id: SessionId,
        call_type: CallType,
        role: CallRole,
    ) -> Result<CallState, SessionError> {
        self.claim("start", &session_id, call_type, role, false)?;
        Ok(self.begin(session_id, call_type, role).await)
    }

    /// Show an incoming call
    ///
    /// Moves `Idle → Ringing`. If the call is neither accepted nor declined
    /// within the ring timeout it fails with `Timeout`.
    ///
    /// # Errors
    ///
    /// Returns error if the session is not idle
    pub fn notify_incoming(
        &self,
        session_id: SessionId,
        call_type: CallType,
    ) -> Result<(), SessionError> {
        self.claim(
            "notify_incoming",
            &session_id,
            call_type,
            CallRole::Responder,
            false,
        )?;
        self.inner
            .transition_if(|s| *s == CallState::Idle, CallState::Ringing)
            .map_err(|state| SessionError::InvalidState {
                operation: "notify_incoming",
                state,
            })?;

        self.inner
            .arm_timeout(CallState::Ringing, self.inner.deps.config.ring_timeout());
        Ok(())
    }

    /// Accept an incoming call
    ///
    /// Reports the accept to the control plane, then starts as responder.
    ///
    /// # Errors
    ///
    /// Returns error if the session is neither idle nor ringing, or is
    /// ringing for another session
    #[tracing::instrument(skip(self, session_id), fields(session_id = %session_id))]
    pub async fn accept_incoming(
        &self,
        session_id: SessionId,
        call_type: CallType,
    ) -> Result<CallState, SessionError> {
        self.claim(
            "accept_incoming",
            &session_id,
            call_type,
            CallRole::Responder,
            true,
        )?;

        if !self.inner.transition(CallState::Connecting) {
            return Ok(self.state());
        }
        self.inner.arm_timeout(
            CallState::Connecting,
            self.inner.deps.config.negotiation_timeout(),
        );
        let accepted = self
            .inner
            .unless_finished(self.inner.deps.control_plane.accept_call(&session_id))
            .await;
        if let Some(Err(e)) = accepted {
            tracing::error!(error = %e, "Control plane rejected accept");
            self.inner.fail(FailureReason::SignalingTransportError).await;
            return Ok(self.state());
        }
        if self.state() == CallState::Connecting {
            self.inner
                .launch(session_id, call_type, CallRole::Responder)
                .await;
        }
        Ok(self.state())
    }

    /// Decline an incoming call without acquiring media
    ///
    /// Reports the decline to the control plane and sends a `hangup` with
    /// reason `declined` to the caller.
    ///
    /// # Errors
    ///
    /// Returns error if the session is neither idle nor ringing, or is
    /// ringing for another session
    #[tracing::instrument(skip(self, session_id), fields(session_id = %session_id))]
    pub async fn decline(&self, session_id: &SessionId) -> Result<(), SessionError> {
        {
            let mut core = self.inner.core.lock();
            if let (CallState::Ringing, Some(ringing)) = (core.state, core.session_id.as_ref()) {
                if ringing != session_id {
                    return Err(SessionError::SessionMismatch {
                        ringing: ringing.clone(),
                        requested: session_id.clone(),
                    });
                }
            }
            if core.session_id.is_none() {
                core.session_id = Some(session_id.clone());
            }
        }

        self.inner
            .transition_if(
                |s| matches!(s, CallState::Idle | CallState::Ringing),
                CallState::Ended(EndReason::Declined),
            )
            .map_err(|state| SessionError::InvalidState {
                operation: "decline",
                state,
            })?;

        if let Err(e) = self.inner.deps.control_plane.decline_call(session_id).await {
            tracing::warn!(error = %e, "Control plane did not take the decline");
        }

        match self.inner.deps.connector.connect(session_id).await {
            Ok(transport) => {
                let signaling = SignalingHandler::new(session_id.clone(), transport);
                if let Err(e) = signaling.send(&SignalingMessage::decline()).await {
                    tracing::warn!(error = %e, "Decline not delivered");
                }
                signaling.close().await;
            }
            Err(e) => tracing::warn!(error = %e, "No signaling channel to deliver decline"),
        }
        Ok(())
    }

    /// Hang up
    ///
    /// Valid in any non-terminal state. Hanging up a ringing call declines
    /// it, so the caller is told. Returns false if the call had already
    /// ended.
    #[tracing::instrument(skip(self))]
    pub async fn hangup(&self) -> bool {
        let ringing = {
            let core = self.inner.core.lock();
            match core.state {
                CallState::Ringing => core.session_id.clone(),
                _ => None,
            }
        };
        if let Some(session_id) = ringing {
            if self.decline(&session_id).await.is_ok() {
                return true;
            }
        }
        self.inner
            .terminate(CallState::Ended(EndReason::LocalHangup))
            .await
    }

    /// Flip the microphone mute switch; see
    /// [`PeerConnectionController::toggle_audio`]
    pub fn toggle_audio(&self) -> bool {
        self.live_controller()
            .is_some_and(|controller| controller.toggle_audio())
    }

    /// Flip the camera switch; see [`PeerConnectionController::toggle_video`]
    pub fn toggle_video(&self) -> bool {
        self.live_controller()
            .is_some_and(|controller| controller.toggle_video())
    }

    /// Share the screen instead of the camera
    pub async fn start_screen_share(&self) -> bool {
        match self.live_controller() {
            Some(controller) => controller.start_screen_share().await,
            None => false,
        }
    }

    /// Go back from the screen to the camera
    pub async fn stop_screen_share(&self) -> bool {
        match self.live_controller() {
            Some(controller) => controller.stop_screen_share().await,
            None => false,
        }
    }

    fn live_controller(&self) -> Option<Arc<PeerConnectionController>> {
        let core = self.inner.core.lock();
        if core.state.is_terminal() {
            return None;
        }
        core.controller.clone()
    }

    /// Local stream, once media has been acquired
    #[must_use]
    pub fn local_stream(&self) -> Option<MediaStreamHandle> {
        self.inner.controller().and_then(|c| c.local_stream())
    }

    /// Remote stream, once a remote track has arrived
    #[must_use]
    pub fn remote_stream(&self) -> Option<MediaStreamHandle> {
        self.inner.controller().and_then(|c| c.remote_stream())
    }

    /// Peer connection controller, once created
    #[must_use]
    pub fn controller(&self) -> Option<Arc<PeerConnectionController>> {
        self.inner.controller()
    }

    /// Time spent connected; stops counting at the terminal transition
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        let core = self.inner.core.lock();
        let connected_at = core.connected_at?;
        let until = core.finished_at.unwrap_or_else(Instant::now);
        Some(until.saturating_duration_since(connected_at))
    }

    /// Summary of this call
    #[must_use]
    pub fn record(&self) -> CallRecord {
        let duration = self.duration();
        let core = self.inner.core.lock();
        CallRecord {
            session_id: core.session_id.clone(),
            call_type: core.call_type,
            role: core.role,
            state: core.state,
            started_at: core.started_at,
            ended_at: core.ended_at,
            duration,
        }
    }
}
