//! End-to-end call session tests
//!
//! Two sessions talk through an in-process signaling hub with scripted peer
//! connections, so every flow here runs without a network or real devices.

use pretty_assertions::assert_eq;
use safetalk_call_core::testing::{FakePeerFactory, RecordingControlPlane};
use safetalk_call_core::{
    CallFactory, CallRole, CallSession, CallState, CallType, DeviceAccess, DevicePolicy,
    EndReason, FailureReason, IceCandidate, MediaConstraints, MediaDevices, MediaError,
    MediaKind, MediaStreamHandle, MemorySignalingHub, PeerState, SessionConfig,
    SessionDescription, SessionEvent, SessionId, SignalingConnector, SignalingError,
    SignalingMessage, SignalingTransport, SyntheticDevices, TrackSource,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

struct Side {
    session: CallSession,
    devices: Arc<SyntheticDevices>,
    peers: Arc<FakePeerFactory>,
}

fn side(hub: &Arc<MemorySignalingHub>, peers: FakePeerFactory) -> Side {
    let devices = Arc::new(SyntheticDevices::default());
    let peers = Arc::new(peers);
    let session = CallFactory::new(hub.clone(), devices.clone(), peers.clone()).create();
    Side {
        session,
        devices,
        peers,
    }
}

async fn wait_for_state(session: &CallSession, want: CallState) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while session.state() != want {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "expected {want:?}, still {:?}", session.state());
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "condition not reached in time");
}

fn drain_states(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<CallState> {
    let mut states = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let SessionEvent::StateChanged(state) = event {
            states.push(state);
        }
    }
    states
}

fn hangups(messages: &[SignalingMessage]) -> usize {
    messages
        .iter()
        .filter(|m| matches!(m, SignalingMessage::Hangup(_)))
        .count()
}

/// Start a video call between two fresh sessions and wait for both ends to
/// connect
async fn connected_pair(hub: &Arc<MemorySignalingHub>, id: &SessionId) -> (Side, Side) {
    let caller = side(hub, FakePeerFactory::auto_connecting());
    let callee = side(hub, FakePeerFactory::auto_connecting());

    let state = caller
        .session
        .start(id.clone(), CallType::Video, CallRole::Initiator)
        .await
        .unwrap();
    assert_eq!(state, CallState::Connecting);
    callee
        .session
        .start(id.clone(), CallType::Video, CallRole::Responder)
        .await
        .unwrap();

    wait_for_state(&caller.session, CallState::Connected).await;
    wait_for_state(&callee.session, CallState::Connected).await;
    (caller, callee)
}

#[tokio::test]
async fn video_call_connects_both_sides() {
    let hub = Arc::new(MemorySignalingHub::new());
    let id = SessionId::from("42");
    let caller = side(&hub, FakePeerFactory::auto_connecting());
    let callee = side(&hub, FakePeerFactory::auto_connecting());
    let mut caller_events = caller.session.subscribe();

    caller
        .session
        .start(id.clone(), CallType::Video, CallRole::Initiator)
        .await
        .unwrap();
    callee
        .session
        .start(id.clone(), CallType::Video, CallRole::Responder)
        .await
        .unwrap();

    wait_for_state(&caller.session, CallState::Connected).await;
    wait_for_state(&callee.session, CallState::Connected).await;

    let ends = hub.endpoints(&id);
    assert_eq!(ends.len(), 2);
    let caller_sent = ends[0].sent_messages();
    let callee_sent = ends[1].sent_messages();
    assert!(caller_sent
        .iter()
        .any(|m| matches!(m, SignalingMessage::Offer(_))));
    assert!(callee_sent
        .iter()
        .any(|m| matches!(m, SignalingMessage::Answer(_))));
    assert!(caller_sent
        .iter()
        .any(|m| matches!(m, SignalingMessage::IceCandidate(Some(_)))));

    // Each side sends a microphone and a camera track
    let caller_peer = caller.peers.last_peer().unwrap();
    let kinds: Vec<MediaKind> = caller_peer.sender_tracks().iter().map(|t| t.kind()).collect();
    assert_eq!(kinds, vec![MediaKind::Audio, MediaKind::Video]);

    let remote = caller.session.remote_stream().unwrap();
    assert!(remote.audio_track().is_some());
    assert!(remote.video_track().is_some());

    let states = drain_states(&mut caller_events);
    assert_eq!(states, vec![CallState::Connecting, CallState::Connected]);
}

#[tokio::test]
async fn permission_denied_fails_before_peer_connection() {
    let hub = Arc::new(MemorySignalingHub::new());
    let caller = side(&hub, FakePeerFactory::auto_connecting());
    caller.devices.set_policy(DevicePolicy {
        camera: DeviceAccess::Denied,
        ..DevicePolicy::granted()
    });

    let state = caller
        .session
        .start(SessionId::from("denied"), CallType::Video, CallRole::Initiator)
        .await
        .unwrap();

    assert_eq!(state, CallState::Failed(FailureReason::PermissionDenied));
    assert_eq!(caller.peers.peers_created(), 0);
    assert!(caller.devices.issued_tracks().is_empty());
    assert!(caller.session.local_stream().is_none());
}

#[tokio::test]
async fn missing_microphone_fails_voice_call() {
    let hub = Arc::new(MemorySignalingHub::new());
    let caller = side(&hub, FakePeerFactory::new());
    caller.devices.set_policy(DevicePolicy {
        microphone: DeviceAccess::Missing,
        ..DevicePolicy::granted()
    });

    let state = caller
        .session
        .start(SessionId::from("mute"), CallType::Voice, CallRole::Initiator)
        .await
        .unwrap();
    assert_eq!(state, CallState::Failed(FailureReason::DeviceUnavailable));
}

#[tokio::test]
async fn connection_failure_after_connected_tears_down_once() {
    let hub = Arc::new(MemorySignalingHub::new());
    let id = SessionId::from("drop");
    let (caller, callee) = connected_pair(&hub, &id).await;
    let mut events = caller.session.subscribe();

    let peer = caller.peers.last_peer().unwrap();
    peer.emit_state(PeerState::Failed);
    peer.emit_state(PeerState::Failed);

    let state = caller.session.finished().await;
    assert_eq!(state, CallState::Failed(FailureReason::ConnectionFailed));
    wait_until(|| caller.devices.live_tracks().is_empty()).await;
    assert_eq!(peer.close_calls(), 1);

    let local = caller.session.local_stream().unwrap();
    assert!(local.tracks().iter().all(|t| t.is_stopped()));

    // The other side hears about it through the hangup
    assert_eq!(
        callee.session.finished().await,
        CallState::Ended(EndReason::RemoteHangup)
    );

    tokio::time::sleep(Duration::from_millis(20)).await;
    let terminal: Vec<CallState> = drain_states(&mut events)
        .into_iter()
        .filter(CallState::is_terminal)
        .collect();
    assert_eq!(terminal, vec![CallState::Failed(FailureReason::ConnectionFailed)]);
}

#[tokio::test]
async fn disconnect_after_connected_ends_call() {
    let hub = Arc::new(MemorySignalingHub::new());
    let (caller, _callee) = connected_pair(&hub, &SessionId::from("lost")).await;

    caller
        .peers
        .last_peer()
        .unwrap()
        .emit_state(PeerState::Disconnected);

    assert_eq!(
        caller.session.finished().await,
        CallState::Ended(EndReason::ConnectionLost)
    );
}

#[tokio::test]
async fn hangup_is_idempotent() {
    let hub = Arc::new(MemorySignalingHub::new());
    let id = SessionId::from("bye");
    let (caller, callee) = connected_pair(&hub, &id).await;
    let mut events = caller.session.subscribe();

    assert!(caller.session.hangup().await);
    assert!(!caller.session.hangup().await);
    assert!(!caller.session.hangup().await);

    assert_eq!(caller.session.state(), CallState::Ended(EndReason::LocalHangup));
    assert_eq!(caller.peers.last_peer().unwrap().close_calls(), 1);
    assert_eq!(hangups(&hub.endpoints(&id)[0].sent_messages()), 1);
    assert_eq!(
        drain_states(&mut events),
        vec![CallState::Ended(EndReason::LocalHangup)]
    );

    assert_eq!(
        callee.session.finished().await,
        CallState::Ended(EndReason::RemoteHangup)
    );
    assert_eq!(callee.peers.last_peer().unwrap().close_calls(), 1);
    // The side that received the hangup does not send one back
    assert_eq!(hangups(&hub.endpoints(&id)[1].sent_messages()), 0);
    assert!(caller.devices.live_tracks().is_empty());
    assert!(callee.devices.live_tracks().is_empty());
}

#[tokio::test]
async fn simultaneous_hangups_close_each_peer_once() {
    let hub = Arc::new(MemorySignalingHub::new());
    let (caller, callee) = connected_pair(&hub, &SessionId::from("both")).await;

    let (a, b) = tokio::join!(caller.session.hangup(), callee.session.hangup());
    assert!(a);
    assert!(b);

    for side in [&caller, &callee] {
        let state = side.session.finished().await;
        assert!(matches!(state, CallState::Ended(_)), "{state:?}");
        assert_eq!(side.peers.last_peer().unwrap().close_calls(), 1);
    }
}

#[tokio::test]
async fn stale_answer_for_responder_is_dropped() {
    let hub = Arc::new(MemorySignalingHub::new());
    let id = SessionId::from("stale");
    let callee = side(&hub, FakePeerFactory::new());
    callee
        .session
        .start(id.clone(), CallType::Voice, CallRole::Responder)
        .await
        .unwrap();
    let remote = hub.take_waiting(&id).unwrap();

    let answer = SignalingMessage::Answer(SessionDescription::answer("v=0\r\n"));
    remote.send_text(answer.encode().unwrap()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(callee.session.state(), CallState::Connecting);
    assert!(callee.peers.last_peer().unwrap().remote_description().is_none());
}

#[tokio::test]
async fn malformed_offer_fails_negotiation() {
    let hub = Arc::new(MemorySignalingHub::new());
    let id = SessionId::from("garbled");
    let callee = side(&hub, FakePeerFactory::new());
    callee
        .session
        .start(id.clone(), CallType::Voice, CallRole::Responder)
        .await
        .unwrap();
    let remote = hub.take_waiting(&id).unwrap();

    // Unparseable frames are skipped; a bad SDP is not
    remote.send_text("{not json".to_string()).await.unwrap();
    let offer = SignalingMessage::Offer(SessionDescription::offer("garbage"));
    remote.send_text(offer.encode().unwrap()).await.unwrap();

    assert_eq!(
        callee.session.finished().await,
        CallState::Failed(FailureReason::NegotiationError)
    );
}

#[tokio::test]
async fn early_candidates_are_buffered_until_offer() {
    let hub = Arc::new(MemorySignalingHub::new());
    let id = SessionId::from("early");
    let callee = side(&hub, FakePeerFactory::new());
    callee
        .session
        .start(id.clone(), CallType::Voice, CallRole::Responder)
        .await
        .unwrap();
    let remote = hub.take_waiting(&id).unwrap();

    for n in 0..2 {
        let candidate = IceCandidate {
            candidate: format!("candidate:{n} 1 udp 1 10.0.0.{n} 9 typ host"),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let frame = SignalingMessage::IceCandidate(Some(candidate))
            .encode()
            .unwrap();
        remote.send_text(frame).await.unwrap();
    }

    let controller = callee.session.controller().unwrap();
    let buffered = tokio::time::timeout(Duration::from_secs(5), async {
        while controller.buffered_candidates().await < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(buffered.is_ok());
    let peer = callee.peers.last_peer().unwrap();
    assert!(peer.applied_candidates().is_empty());

    let offer = SignalingMessage::Offer(SessionDescription::offer(
        "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n",
    ));
    remote.send_text(offer.encode().unwrap()).await.unwrap();

    wait_until(|| peer.applied_candidates().len() == 2).await;
    let applied: Vec<String> = peer
        .applied_candidates()
        .into_iter()
        .map(|c| c.candidate)
        .collect();
    assert!(applied[0].starts_with("candidate:0"));
    assert!(applied[1].starts_with("candidate:1"));
    assert_eq!(controller.buffered_candidates().await, 0);

    let answer = loop {
        let text = remote.recv_text().await.unwrap().unwrap();
        if let Some(SignalingMessage::Answer(desc)) = SignalingMessage::decode(&text).unwrap() {
            break desc;
        }
    };
    assert!(answer.sdp.contains("m=audio"));
}

#[tokio::test]
async fn toggles_flip_local_tracks() {
    let hub = Arc::new(MemorySignalingHub::new());
    let (caller, _callee) = connected_pair(&hub, &SessionId::from("mute")).await;
    let local = caller.session.local_stream().unwrap();
    let audio = local.audio_track().unwrap().clone();
    let video = local.video_track().unwrap().clone();

    assert!(!caller.session.toggle_audio());
    assert!(!audio.is_enabled());
    assert!(caller.session.toggle_audio());
    assert!(audio.is_enabled());

    assert!(!caller.session.toggle_video());
    assert!(!video.is_enabled());
    assert!(audio.is_enabled());

    caller.session.hangup().await;
    assert!(!caller.session.toggle_audio());
}

#[tokio::test]
async fn screen_share_swaps_outbound_video() {
    let hub = Arc::new(MemorySignalingHub::new());
    let (caller, _callee) = connected_pair(&hub, &SessionId::from("share")).await;
    let peer = caller.peers.last_peer().unwrap();
    let mut events = caller.session.subscribe();

    assert!(caller.session.start_screen_share().await);
    assert_eq!(peer.sender_tracks()[1].source(), TrackSource::Screen);
    assert_eq!(peer.add_track_calls(), 2);
    assert_eq!(caller.devices.display_media_requests(), 1);

    assert!(caller.session.stop_screen_share().await);
    assert!(!caller.session.stop_screen_share().await);
    let camera = peer.sender_tracks()[1].clone();
    assert_eq!(camera.source(), TrackSource::Camera);
    assert!(!camera.is_stopped());
    assert_eq!(peer.replace_track_calls(), 2);

    // No renegotiation, no state change
    assert_eq!(caller.session.state(), CallState::Connected);
    assert!(drain_states(&mut events).is_empty());
    assert_eq!(hangups(&hub.endpoints(&SessionId::from("share"))[0].sent_messages()), 0);
}

#[tokio::test]
async fn screen_share_denied_keeps_camera() {
    let hub = Arc::new(MemorySignalingHub::new());
    let (caller, _callee) = connected_pair(&hub, &SessionId::from("noshare")).await;
    caller.devices.set_policy(DevicePolicy {
        screen: DeviceAccess::Denied,
        ..DevicePolicy::granted()
    });

    assert!(!caller.session.start_screen_share().await);
    let peer = caller.peers.last_peer().unwrap();
    assert_eq!(peer.sender_tracks()[1].source(), TrackSource::Camera);
    assert_eq!(caller.session.state(), CallState::Connected);
}

#[tokio::test]
async fn decline_ends_both_sides() {
    let hub = Arc::new(MemorySignalingHub::new());
    let id = SessionId::from("no-thanks");
    let caller = side(&hub, FakePeerFactory::auto_connecting());

    let control_plane = Arc::new(RecordingControlPlane::new());
    let callee_devices = Arc::new(SyntheticDevices::default());
    let callee = CallFactory::new(
        hub.clone(),
        callee_devices.clone(),
        Arc::new(FakePeerFactory::new()),
    )
    .with_control_plane(control_plane.clone())
    .create();

    caller
        .session
        .start(id.clone(), CallType::Video, CallRole::Initiator)
        .await
        .unwrap();
    callee.notify_incoming(id.clone(), CallType::Video).unwrap();
    callee.decline(&id).await.unwrap();

    assert_eq!(callee.state(), CallState::Ended(EndReason::Declined));
    assert_eq!(control_plane.declined(), vec![id.clone()]);
    assert_eq!(callee_devices.user_media_requests(), 0);
    assert_eq!(
        caller.session.finished().await,
        CallState::Ended(EndReason::Declined)
    );

    let err = callee.decline(&id).await.unwrap_err();
    assert!(matches!(err, safetalk_call_core::SessionError::InvalidState { .. }));
}

#[tokio::test]
async fn hangup_while_ringing_declines() {
    let hub = Arc::new(MemorySignalingHub::new());
    let id = SessionId::from("not-now");
    let caller = side(&hub, FakePeerFactory::auto_connecting());
    let control_plane = Arc::new(RecordingControlPlane::new());
    let callee = CallFactory::new(
        hub.clone(),
        Arc::new(SyntheticDevices::default()),
        Arc::new(FakePeerFactory::new()),
    )
    .with_control_plane(control_plane.clone())
    .create();

    caller
        .session
        .start(id.clone(), CallType::Voice, CallRole::Initiator)
        .await
        .unwrap();
    callee.notify_incoming(id.clone(), CallType::Voice).unwrap();

    assert!(callee.hangup().await);
    assert_eq!(callee.state(), CallState::Ended(EndReason::Declined));
    assert_eq!(control_plane.declined(), vec![id]);
    assert_eq!(
        caller.session.finished().await,
        CallState::Ended(EndReason::Declined)
    );
    assert!(!callee.hangup().await);
}

#[tokio::test]
async fn accept_reports_to_control_plane() {
    let hub = Arc::new(MemorySignalingHub::new());
    let id = SessionId::from("yes");
    let caller = side(&hub, FakePeerFactory::auto_connecting());
    let control_plane = Arc::new(RecordingControlPlane::new());
    let callee = CallFactory::new(
        hub.clone(),
        Arc::new(SyntheticDevices::default()),
        Arc::new(FakePeerFactory::auto_connecting()),
    )
    .with_control_plane(control_plane.clone())
    .create();

    caller
        .session
        .start(id.clone(), CallType::Voice, CallRole::Initiator)
        .await
        .unwrap();
    callee.notify_incoming(id.clone(), CallType::Voice).unwrap();
    assert_eq!(callee.state(), CallState::Ringing);

    callee.accept_incoming(id.clone(), CallType::Voice).await.unwrap();
    assert_eq!(control_plane.accepted(), vec![id]);
    wait_for_state(&callee, CallState::Connected).await;
    wait_for_state(&caller.session, CallState::Connected).await;
}

#[tokio::test]
async fn accept_fails_when_control_plane_refuses() {
    let hub = Arc::new(MemorySignalingHub::new());
    let control_plane = Arc::new(RecordingControlPlane::new());
    control_plane.fail_requests(true);
    let devices = Arc::new(SyntheticDevices::default());
    let callee = CallFactory::new(hub.clone(), devices.clone(), Arc::new(FakePeerFactory::new()))
        .with_control_plane(control_plane)
        .create();

    let state = callee
        .accept_incoming(SessionId::from("refused"), CallType::Video)
        .await
        .unwrap();
    assert_eq!(state, CallState::Failed(FailureReason::SignalingTransportError));
    assert_eq!(devices.user_media_requests(), 0);
}

struct UnreachableConnector;

#[async_trait::async_trait]
impl SignalingConnector for UnreachableConnector {
    async fn connect(
        &self,
        _session_id: &SessionId,
    ) -> Result<Arc<dyn SignalingTransport>, SignalingError> {
        Err(SignalingError::Connect("connection refused".to_string()))
    }
}

#[tokio::test]
async fn signaling_connect_failure_fails_call() {
    let devices = Arc::new(SyntheticDevices::default());
    let peers = Arc::new(FakePeerFactory::new());
    let session = CallFactory::new(Arc::new(UnreachableConnector), devices.clone(), peers.clone())
        .create();

    let state = session
        .start(SessionId::from("offline"), CallType::Video, CallRole::Initiator)
        .await
        .unwrap();

    assert_eq!(state, CallState::Failed(FailureReason::SignalingTransportError));
    assert_eq!(devices.user_media_requests(), 0);
    assert_eq!(peers.peers_created(), 0);
}

#[tokio::test]
async fn signaling_lost_while_connecting_fails_call() {
    let hub = Arc::new(MemorySignalingHub::new());
    let id = SessionId::from("cut");
    let caller = side(&hub, FakePeerFactory::new());
    caller
        .session
        .start(id.clone(), CallType::Voice, CallRole::Initiator)
        .await
        .unwrap();

    let remote = hub.take_waiting(&id).unwrap();
    remote.close().await.unwrap();
    drop(remote);

    assert_eq!(
        caller.session.finished().await,
        CallState::Failed(FailureReason::SignalingTransportError)
    );
    wait_until(|| caller.devices.live_tracks().is_empty()).await;
}

#[tokio::test]
async fn signaling_lost_after_connected_keeps_call() {
    let hub = Arc::new(MemorySignalingHub::new());
    let id = SessionId::from("media-only");
    let (caller, _callee) = connected_pair(&hub, &id).await;

    let ends = hub.endpoints(&id);
    assert_eq!(ends.len(), 2);
    ends[1].close().await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(caller.session.state(), CallState::Connected);
    assert_eq!(caller.peers.last_peer().unwrap().close_calls(), 0);
    assert!(!caller.devices.live_tracks().is_empty());
    assert_eq!(hangups(&ends[0].sent_messages()), 0);

    assert!(caller.session.hangup().await);
    assert_eq!(caller.peers.last_peer().unwrap().close_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn unanswered_call_times_out() {
    let hub = Arc::new(MemorySignalingHub::new());
    let devices = Arc::new(SyntheticDevices::default());
    let peers = Arc::new(FakePeerFactory::new());
    let session = CallFactory::new(hub.clone(), devices.clone(), peers.clone())
        .with_config(SessionConfig {
            negotiation_timeout_secs: 5,
            ..SessionConfig::default()
        })
        .create();

    session
        .start(SessionId::from("silence"), CallType::Video, CallRole::Initiator)
        .await
        .unwrap();

    assert_eq!(
        session.finished().await,
        CallState::Failed(FailureReason::Timeout)
    );
    wait_until(|| devices.live_tracks().is_empty()).await;
    assert_eq!(peers.last_peer().unwrap().close_calls(), 1);
}

struct StalledConnector;

#[async_trait::async_trait]
impl SignalingConnector for StalledConnector {
    async fn connect(
        &self,
        _session_id: &SessionId,
    ) -> Result<Arc<dyn SignalingTransport>, SignalingError> {
        std::future::pending().await
    }
}

/// Devices whose permission prompt is never answered
struct UnansweredPrompt;

#[async_trait::async_trait]
impl MediaDevices for UnansweredPrompt {
    async fn get_user_media(
        &self,
        _constraints: &MediaConstraints,
    ) -> Result<MediaStreamHandle, MediaError> {
        std::future::pending().await
    }

    async fn get_display_media(&self) -> Result<MediaStreamHandle, MediaError> {
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn stalled_signaling_connect_times_out() {
    let devices = Arc::new(SyntheticDevices::default());
    let peers = Arc::new(FakePeerFactory::new());
    let session = CallFactory::new(Arc::new(StalledConnector), devices.clone(), peers.clone())
        .create();

    let state = session
        .start(SessionId::from("blackhole"), CallType::Video, CallRole::Initiator)
        .await
        .unwrap();

    assert_eq!(state, CallState::Failed(FailureReason::Timeout));
    assert_eq!(devices.user_media_requests(), 0);
    assert_eq!(peers.peers_created(), 0);
}

#[tokio::test(start_paused = true)]
async fn unanswered_permission_prompt_times_out() {
    let hub = Arc::new(MemorySignalingHub::new());
    let id = SessionId::from("prompt");
    let peers = Arc::new(FakePeerFactory::new());
    let session = CallFactory::new(hub.clone(), Arc::new(UnansweredPrompt), peers.clone())
        .create();

    let state = session
        .start(id.clone(), CallType::Video, CallRole::Initiator)
        .await
        .unwrap();

    assert_eq!(state, CallState::Failed(FailureReason::Timeout));
    assert_eq!(peers.peers_created(), 0);
    wait_until(|| hub.endpoints(&id).first().is_some_and(|end| end.is_closed())).await;
    assert_eq!(hangups(&hub.endpoints(&id)[0].sent_messages()), 1);
}

#[tokio::test(start_paused = true)]
async fn connected_call_outlives_negotiation_timeout() {
    let hub = Arc::new(MemorySignalingHub::new());
    let (caller, _callee) = connected_pair(&hub, &SessionId::from("long")).await;

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(caller.session.state(), CallState::Connected);
    assert!(caller.session.duration().unwrap() >= Duration::from_secs(120));

    caller.session.hangup().await;
    let frozen = caller.session.duration().unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(caller.session.duration().unwrap(), frozen);
}

#[tokio::test(start_paused = true)]
async fn unanswered_ring_times_out() {
    let hub = Arc::new(MemorySignalingHub::new());
    let callee = side(&hub, FakePeerFactory::new());
    callee
        .session
        .notify_incoming(SessionId::from("ring"), CallType::Voice)
        .unwrap();

    assert_eq!(
        callee.session.finished().await,
        CallState::Failed(FailureReason::Timeout)
    );
    assert_eq!(callee.devices.user_media_requests(), 0);
}

#[tokio::test]
async fn record_summarizes_finished_call() {
    let hub = Arc::new(MemorySignalingHub::new());
    let id = SessionId::from("summary");
    let (caller, _callee) = connected_pair(&hub, &id).await;
    caller.session.hangup().await;

    let record = caller.session.record();
    assert_eq!(record.session_id, Some(id));
    assert_eq!(record.call_type, Some(CallType::Video));
    assert_eq!(record.role, Some(CallRole::Initiator));
    assert_eq!(record.state, CallState::Ended(EndReason::LocalHangup));
    assert!(record.started_at.unwrap() <= record.ended_at.unwrap());
    assert!(record.duration.is_some());

    let json = serde_json::to_string(&record).unwrap();
    assert!(json.contains("LocalHangup"));
}
