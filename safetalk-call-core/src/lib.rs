//! SafeTalk call core - voice/video call sessions over WebRTC
//!
//! This library runs one side of a SafeTalk call: it opens the session's
//! signaling channel, captures local media, negotiates a WebRTC peer
//! connection with the other participant and tracks the call through its
//! lifecycle. It features:
//!
//! - **Explicit call state machine**: `Idle → (Ringing) → Connecting →
//!   Connected → Ended/Failed`, with exactly one terminal transition
//! - **JSON signaling**: offer, answer, ICE candidate and hangup messages over
//!   a WebSocket channel keyed by the call session id
//! - **Early ICE buffering**: remote candidates that beat the remote
//!   description are queued, not dropped
//! - **Screen sharing** by swapping the outbound video track in place
//! - **Timeouts** for unanswered and stalled calls
//!
//! # Examples
//!
//! ```rust,no_run
//! use safetalk_call_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let factory = CallFactory::new(
//!     Arc::new(WebSocketConnector::new(WebSocketConfig::default())),
//!     Arc::new(SyntheticDevices::default()),
//!     Arc::new(WebRtcPeerFactory::new()),
//! );
//!
//! let session = factory.create();
//! let mut events = session.subscribe();
//! session
//!     .start(SessionId::from("42"), CallType::Video, CallRole::Initiator)
//!     .await?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let SessionEvent::StateChanged(state) = event {
//!         println!("call is {state:?}");
//!         if state.is_terminal() {
//!             break;
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::unused_async)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::derivable_impls)]

/// Core call types and data structures
pub mod types;

/// Signaling protocol and handlers
pub mod signaling;

/// Signaling transports (WebSocket, in-process)
pub mod transport;

/// Local and remote media
pub mod media;

/// Peer connection engine seam
pub mod rtc;

/// Peer connection controller
pub mod peer;

/// Call session state machine
pub mod session;

/// Fakes for tests and offline runs
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-export main types at crate root
pub use media::{
    DeviceAccess, DevicePolicy, MediaDevices, MediaError, MediaStreamHandle, MediaTrack,
    StreamKind, SyntheticDevices,
};
pub use peer::{CandidateOutcome, NegotiationPhase, PeerConnectionController, PeerError};
pub use rtc::{
    IceServer, PeerConfig, PeerEvent, PeerFactory, PeerState, RtcError, RtcPeer, SenderId,
    WebRtcPeerFactory,
};
pub use session::{
    CallControlPlane, CallFactory, CallRecord, CallSession, ControlPlaneError, NoopControlPlane,
    SessionConfig, SessionError, SessionEvent,
};
pub use signaling::{
    IceCandidate, SdpType, SessionDescription, SignalingConnector, SignalingError,
    SignalingHandler, SignalingMessage, SignalingTransport,
};
pub use transport::{
    MemorySignalingHub, MemoryTransport, WebSocketConfig, WebSocketConnector, WebSocketTransport,
};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::media::{MediaDevices, MediaStreamHandle, SyntheticDevices};
    pub use crate::rtc::{IceServer, PeerConfig, WebRtcPeerFactory};
    pub use crate::session::{CallFactory, CallSession, SessionConfig, SessionEvent};
    pub use crate::signaling::{SignalingMessage, SignalingTransport};
    pub use crate::transport::{MemorySignalingHub, WebSocketConfig, WebSocketConnector};
    pub use crate::types::{
        CallRole, CallState, CallType, EndReason, FailureReason, MediaConstraints, SessionId,
        VideoResolution,
    };
}
