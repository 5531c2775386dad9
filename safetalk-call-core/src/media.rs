//! Local and remote media for calls
//!
//! Capture goes through the [`MediaDevices`] trait so the session never talks
//! to a platform API directly. Captured tracks are backed by
//! [`TrackLocalStaticSample`] and can be attached to a peer connection as-is;
//! tracks received from the remote side wrap a [`TrackRemote`].

use crate::types::{MediaConstraints, MediaKind, TrackSource};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// The user or platform refused capture access
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// No matching capture device exists
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Track was stopped
    #[error("Track stopped: {0}")]
    TrackStopped(String),

    /// Stream error
    #[error("Stream error: {0}")]
    StreamError(String),
}

fn codec_for(kind: MediaKind) -> RTCRtpCodecCapability {
    match kind {
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "".to_string(),
            rtcp_feedback: vec![],
        },
        MediaKind::Video => RTCRtpCodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: "".to_string(),
            rtcp_feedback: vec![],
        },
    }
}

enum TrackBacking {
    Local(Arc<TrackLocalStaticSample>),
    Remote(Arc<TrackRemote>),
    Detached,
}

/// A single audio or video track
///
/// `enabled` is the mute switch: a disabled track stays attached but its
/// samples are dropped. `stop` is final and releases the source.
pub struct MediaTrack {
    id: String,
    kind: MediaKind,
    source: TrackSource,
    enabled: AtomicBool,
    stopped: AtomicBool,
    ended: watch::Sender<bool>,
    backing: TrackBacking,
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backing = match self.backing {
            TrackBacking::Local(_) => "local",
            TrackBacking::Remote(_) => "remote",
            TrackBacking::Detached => "detached",
        };
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("source", &self.source)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .field("backing", &backing)
            .finish()
    }
}

impl MediaTrack {
    fn with_backing(
        id: String,
        kind: MediaKind,
        source: TrackSource,
        backing: TrackBacking,
    ) -> Self {
        let (ended, _) = watch::channel(false);
        Self {
            id,
            kind,
            source,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            ended,
            backing,
        }
    }

    /// Create a local capture track backed by a sample track
    #[must_use]
    pub fn local(id: impl Into<String>, kind: MediaKind, source: TrackSource) -> Self {
        let id = id.into();
        let codec = codec_for(kind);
        tracing::debug!(track_id = %id, codec = %codec.mime_type, clock_rate = codec.clock_rate, "Creating local track");

        let stream_id = match kind {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        };
        let sample_track = Arc::new(TrackLocalStaticSample::new(
            codec,
            id.clone(),
            stream_id.to_string(),
        ));
        Self::with_backing(id, kind, source, TrackBacking::Local(sample_track))
    }

    /// Wrap a track received from the remote peer
    #[must_use]
    pub fn remote(track: Arc<TrackRemote>) -> Self {
        let kind = match track.kind() {
            RTPCodecType::Video => MediaKind::Video,
            _ => MediaKind::Audio,
        };
        let id = track.id();
        Self::with_backing(id, kind, TrackSource::Remote, TrackBacking::Remote(track))
    }

    /// A track with no engine object behind it
    ///
    /// Used by peer engines that do not carry real media.
    #[must_use]
    pub fn detached(id: impl Into<String>, kind: MediaKind, source: TrackSource) -> Self {
        Self::with_backing(id.into(), kind, source, TrackBacking::Detached)
    }

    /// Track identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Audio or video
    #[must_use]
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Capture source
    #[must_use]
    pub fn source(&self) -> TrackSource {
        self.source
    }

    /// Whether samples are currently transmitted
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Whether the track has been stopped
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        tracing::debug!(track_id = %self.id, enabled, "Track enabled flag changed");
    }

    /// Stop the track and release its source
    ///
    /// Returns false if it was already stopped. A stop initiated outside the
    /// call (the platform "stop sharing" control) goes through here too.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.enabled.store(false, Ordering::SeqCst);
        self.ended.send_replace(true);
        tracing::debug!(track_id = %self.id, source = ?self.source, "Track stopped");
        true
    }

    /// Wait until the track is stopped
    pub async fn ended(&self) {
        let mut ended = self.ended.subscribe();
        let _ = ended.wait_for(|stopped| *stopped).await;
    }

    /// Engine track to attach to a peer connection, for local tracks
    #[must_use]
    pub fn local_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        match &self.backing {
            TrackBacking::Local(track) => Some(track.clone()),
            TrackBacking::Remote(_) | TrackBacking::Detached => None,
        }
    }

    /// Engine track for media received from the remote peer
    #[must_use]
    pub fn remote_track(&self) -> Option<&Arc<TrackRemote>> {
        match &self.backing {
            TrackBacking::Remote(track) => Some(track),
            TrackBacking::Local(_) | TrackBacking::Detached => None,
        }
    }

    /// Write one encoded sample to a local track
    ///
    /// Samples written while the track is disabled are dropped.
    ///
    /// # Errors
    ///
    /// Returns error if the track is stopped, is not a local track, or the
    /// engine rejects the sample
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<(), MediaError> {
        if self.is_stopped() {
            return Err(MediaError::TrackStopped(self.id.clone()));
        }
        if !self.is_enabled() {
            return Ok(());
        }

        let TrackBacking::Local(track) = &self.backing else {
            return Err(MediaError::StreamError(format!(
                "track {} does not accept samples",
                self.id
            )));
        };

        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };
        track
            .write_sample(&sample)
            .await
            .map_err(|e| MediaError::StreamError(e.to_string()))
    }
}

/// Whether a stream was captured here or received from the remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Captured on this device
    Local,
    /// Received from the remote peer
    Remote,
}

/// A group of tracks handed to the UI layer
#[derive(Debug, Clone)]
pub struct MediaStreamHandle {
    id: String,
    kind: StreamKind,
    tracks: Vec<Arc<MediaTrack>>,
}

impl MediaStreamHandle {
    /// Create a stream from tracks
    #[must_use]
    pub fn new(kind: StreamKind, tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            tracks,
        }
    }

    /// Stream identifier, stable across track swaps
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Local or remote
    #[must_use]
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// All tracks
    #[must_use]
    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    /// First audio track
    #[must_use]
    pub fn audio_track(&self) -> Option<&Arc<MediaTrack>> {
        self.tracks.iter().find(|t| t.kind() == MediaKind::Audio)
    }

    /// First video track
    #[must_use]
    pub fn video_track(&self) -> Option<&Arc<MediaTrack>> {
        self.tracks.iter().find(|t| t.kind() == MediaKind::Video)
    }

    /// Same stream with its video track swapped for `track`
    #[must_use]
    pub fn with_video_track(&self, track: Arc<MediaTrack>) -> Self {
        let mut tracks: Vec<_> = self
            .tracks
            .iter()
            .filter(|t| t.kind() != MediaKind::Video)
            .cloned()
            .collect();
        tracks.push(track);
        Self {
            id: self.id.clone(),
            kind: self.kind,
            tracks,
        }
    }

    /// Same stream with `track` appended
    #[must_use]
    pub fn with_track(&self, track: Arc<MediaTrack>) -> Self {
        let mut tracks = self.tracks.clone();
        tracks.push(track);
        Self {
            id: self.id.clone(),
            kind: self.kind,
            tracks,
        }
    }

    /// Stop every track, returning how many were still live
    pub fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }
}

/// Capture interface of the platform
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Capture microphone and/or camera
    ///
    /// Either every requested track is returned or none is.
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStreamHandle, MediaError>;

    /// Capture the screen as a single video track
    async fn get_display_media(&self) -> Result<MediaStreamHandle, MediaError>;
}

/// How a synthetic device responds to capture requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceAccess {
    /// Capture succeeds
    #[default]
    Granted,
    /// The user refused access
    Denied,
    /// No such device
    Missing,
}

/// Access policy per capture source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DevicePolicy {
    /// Microphone
    pub microphone: DeviceAccess,
    /// Camera
    pub camera: DeviceAccess,
    /// Screen capture
    pub screen: DeviceAccess,
}

impl DevicePolicy {
    /// Everything granted
    #[must_use]
    pub fn granted() -> Self {
        Self::default()
    }

    /// Camera and microphone access refused
    #[must_use]
    pub fn denied() -> Self {
        Self {
            microphone: DeviceAccess::Denied,
            camera: DeviceAccess::Denied,
            screen: DeviceAccess::Denied,
        }
    }
}

/// Capture devices that produce empty sample tracks
///
/// Tracks are real engine tracks and can be negotiated and written to; the
/// devices just never capture anything. Every issued track is remembered.
#[derive(Default)]
pub struct SyntheticDevices {
    policy: parking_lot::RwLock<DevicePolicy>,
    next_track: AtomicU64,
    user_media_requests: AtomicU64,
    display_media_requests: AtomicU64,
    issued: parking_lot::Mutex<Vec<Arc<MediaTrack>>>,
}

impl SyntheticDevices {
    /// Devices with the given access policy
    #[must_use]
    pub fn new(policy: DevicePolicy) -> Self {
        Self {
            policy: parking_lot::RwLock::new(policy),
            ..Default::default()
        }
    }

    /// Change the access policy for later requests
    pub fn set_policy(&self, policy: DevicePolicy) {
        *self.policy.write() = policy;
    }

    /// Number of `get_user_media` calls
    #[must_use]
    pub fn user_media_requests(&self) -> u64 {
        self.user_media_requests.load(Ordering::SeqCst)
    }

    /// Number of `get_display_media` calls
    #[must_use]
    pub fn display_media_requests(&self) -> u64 {
        self.display_media_requests.load(Ordering::SeqCst)
    }

    /// Every track handed out so far
    #[must_use]
    pub fn issued_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.issued.lock().clone()
    }

    /// Tracks handed out and not yet stopped
    #[must_use]
    pub fn live_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.issued
            .lock()
            .iter()
            .filter(|t| !t.is_stopped())
            .cloned()
            .collect()
    }

    fn check(access: DeviceAccess, device: &str) -> Result<(), MediaError> {
        match access {
            DeviceAccess::Granted => Ok(()),
            DeviceAccess::Denied => Err(MediaError::PermissionDenied(format!(
                "{device} access denied"
            ))),
            DeviceAccess::Missing => Err(MediaError::DeviceUnavailable(format!(
                "no {device} found"
            ))),
        }
    }

    fn issue(&self, kind: MediaKind, source: TrackSource) -> Arc<MediaTrack> {
        let n = self.next_track.fetch_add(1, Ordering::SeqCst);
        let label = match source {
            TrackSource::Microphone => "microphone",
            TrackSource::Camera => "camera",
            TrackSource::Screen => "screen",
            TrackSource::Remote => "remote",
        };
        let track = Arc::new(MediaTrack::local(format!("{label}-{n}"), kind, source));
        self.issued.lock().push(track.clone());
        track
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStreamHandle, MediaError> {
        self.user_media_requests.fetch_add(1, Ordering::SeqCst);
        let policy = *self.policy.read();

        if constraints.has_audio() {
            Self::check(policy.microphone, "microphone")?;
        }
        if constraints.has_video() {
            Self::check(policy.camera, "camera")?;
        }

        let mut tracks = Vec::new();
        if constraints.has_audio() {
            tracks.push(self.issue(MediaKind::Audio, TrackSource::Microphone));
        }
        if let Some(resolution) = constraints.video {
            let track = self.issue(MediaKind::Video, TrackSource::Camera);
            tracing::debug!(
                track_id = %track.id(),
                width = resolution.width(),
                height = resolution.height(),
                "Synthetic camera opened"
            );
            tracks.push(track);
        }

        if tracks.is_empty() {
            return Err(MediaError::StreamError("no media requested".to_string()));
        }
        Ok(MediaStreamHandle::new(StreamKind::Local, tracks))
    }

    async fn get_display_media(&self) -> Result<MediaStreamHandle, MediaError> {
        self.display_media_requests.fetch_add(1, Ordering::SeqCst);
        Self::check(self.policy.read().screen, "screen")?;
        let track = self.issue(MediaKind::Video, TrackSource::Screen);
        Ok(MediaStreamHandle::new(StreamKind::Local, vec![track]))
    }
}
