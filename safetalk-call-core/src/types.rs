//! Call types and data structures

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of one call attempt, shared by both participants
///
/// The control plane hands this out as `call_session_id`; it keys the
/// signaling channel. It is opaque to this crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap an identifier issued by the control plane
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Create a new random session ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Kind of call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    /// Audio only
    Voice,
    /// Audio and camera video
    Video,
}

impl CallType {
    /// Whether the call carries camera video
    #[must_use]
    pub fn has_video(self) -> bool {
        matches!(self, Self::Video)
    }
}

impl std::str::FromStr for CallType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "voice" | "audio" => Ok(Self::Voice),
            "video" => Ok(Self::Video),
            other => Err(format!("unknown call type: {other}")),
        }
    }
}

/// Which side of the negotiation this participant plays
///
/// Fixed when the session starts. The initiator sends the offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    /// Sends the initial offer
    Initiator,
    /// Waits for an offer and answers it
    Responder,
}

impl CallRole {
    /// Map the `is_initiator` flag of the control plane to a role
    #[must_use]
    pub fn from_initiator_flag(is_initiator: bool) -> Self {
        if is_initiator {
            Self::Initiator
        } else {
            Self::Responder
        }
    }
}

/// Why a call reached `Ended`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// This participant hung up
    LocalHangup,
    /// The remote participant sent a hangup
    RemoteHangup,
    /// The incoming call was declined before media was acquired
    Declined,
    /// An established connection dropped
    ConnectionLost,
}

/// Why a call reached `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// Camera or microphone access was denied
    PermissionDenied,
    /// No capture device is present
    DeviceUnavailable,
    /// Offer/answer generation or application failed
    NegotiationError,
    /// The signaling channel closed or errored before negotiation completed
    SignalingTransportError,
    /// The peer connection reported failure
    ConnectionFailed,
    /// The call did not connect (or was not answered) in time
    Timeout,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::PermissionDenied => "camera or microphone permission denied",
            Self::DeviceUnavailable => "no capture device available",
            Self::NegotiationError => "call negotiation failed",
            Self::SignalingTransportError => "signaling channel lost",
            Self::ConnectionFailed => "connection failed",
            Self::Timeout => "call timed out",
        };
        f.write_str(text)
    }
}

/// Call state
///
/// ```text
///   Idle ──► Ringing ──► Connecting ──► Connected ──► Ended
///     │         │            │              │
///     └─────────┴────────────┴──────────────┴───────► Failed
/// ```
///
/// `Ended` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    /// No resources held
    Idle,
    /// Incoming call shown to the user, not yet accepted
    Ringing,
    /// Media requested, negotiation in progress
    Connecting,
    /// Peer connection established, media flowing
    Connected,
    /// Call finished normally
    Ended(EndReason),
    /// Call failed
    Failed(FailureReason),
}

impl CallState {
    /// Whether this state is `Ended` or `Failed`
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Ended(_) | Self::Failed(_) => true,
            Self::Idle | Self::Ringing | Self::Connecting | Self::Connected => false,
        }
    }

    /// Check whether a transition to `next` is allowed
    ///
    /// # Valid Transitions
    ///
    /// - **Incoming**: Idle → Ringing → Connecting
    /// - **Outgoing/accepted**: Idle → Connecting → Connected
    /// - **Teardown**: any non-terminal state → Ended
    /// - **Failure**: Ringing, Connecting or Connected → Failed
    /// - Idle → Failed when the signaling channel cannot be opened
    #[must_use]
    pub fn can_transition_to(&self, next: &CallState) -> bool {
        match (self, next) {
            (Self::Idle, Self::Ringing | Self::Connecting) => true,
            (Self::Ringing, Self::Connecting) => true,
            (Self::Connecting, Self::Connected) => true,
            (Self::Idle | Self::Ringing | Self::Connecting | Self::Connected, Self::Ended(_)) => {
                true
            }
            (Self::Idle | Self::Ringing | Self::Connecting | Self::Connected, Self::Failed(_)) => {
                true
            }
            (Self::Ended(_) | Self::Failed(_), _) => false,
            (
                Self::Idle | Self::Ringing | Self::Connecting | Self::Connected,
                Self::Idle | Self::Ringing | Self::Connecting | Self::Connected,
            ) => false,
        }
    }
}

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    /// Audio
    Audio,
    /// Video (camera or screen)
    Video,
}

/// Where a track's media comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackSource {
    /// Local microphone
    Microphone,
    /// Local camera
    Camera,
    /// Local screen capture
    Screen,
    /// Received from the remote peer
    Remote,
}

/// Video resolution options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoResolution {
    /// 320x240
    QVGA240,
    /// 640x480
    SD480,
    /// 1280x720
    HD720,
    /// 1920x1080
    HD1080,
}

impl VideoResolution {
    /// Get width in pixels
    pub fn width(&self) -> u32 {
        match self {
            Self::QVGA240 => 320,
            Self::SD480 => 640,
            Self::HD720 => 1280,
            Self::HD1080 => 1920,
        }
    }

    /// Get height in pixels
    pub fn height(&self) -> u32 {
        match self {
            Self::QVGA240 => 240,
            Self::SD480 => 480,
            Self::HD720 => 720,
            Self::HD1080 => 1080,
        }
    }
}

impl Default for VideoResolution {
    fn default() -> Self {
        Self::HD720
    }
}

/// Capture request handed to the media devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Capture the microphone
    pub audio: bool,
    /// Capture the camera at this ideal resolution
    pub video: Option<VideoResolution>,
}

impl MediaConstraints {
    /// Audio-only capture
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: None,
        }
    }

    /// Audio plus camera at the given ideal resolution
    pub fn video_call(resolution: VideoResolution) -> Self {
        Self {
            audio: true,
            video: Some(resolution),
        }
    }

    /// Camera only, used when switching back from a screen share
    pub fn camera_only(resolution: VideoResolution) -> Self {
        Self {
            audio: false,
            video: Some(resolution),
        }
    }

    /// Constraints for a call: audio always, video only for video calls
    pub fn for_call(call_type: CallType, resolution: VideoResolution) -> Self {
        match call_type {
            CallType::Voice => Self::audio_only(),
            CallType::Video => Self::video_call(resolution),
        }
    }

    /// Check if audio is requested
    pub fn has_audio(&self) -> bool {
        self.audio
    }

    /// Check if video is requested
    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }
}
