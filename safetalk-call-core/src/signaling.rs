//! Call signaling protocol
//!
//! Messages are JSON objects carried over a channel scoped to one session id.
//! The `type` field names the message and the payload sits under a key of the
//! same name:
//!
//! ```text
//! { "type": "offer",         "offer": { "sdp": "...", "type": "offer" } }
//! { "type": "answer",        "answer": { "sdp": "...", "type": "answer" } }
//! { "type": "ice_candidate", "ice_candidate": { "candidate": "...", "sdpMid": "0", "sdpMLineIndex": 0 } }
//! { "type": "hangup",        "hangup": {} }
//! ```
//!
//! Unknown `type` values are ignored by the receiver.

use crate::types::SessionId;
use async_trait::async_trait;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// A frame could not be decoded
    #[error("Malformed signaling message: {0}")]
    Malformed(String),

    /// Could not open the channel
    #[error("Connect error: {0}")]
    Connect(String),

    /// Transport error
    #[error("Transport error: {0}")]
    TransportError(String),

    /// The channel has been closed
    #[error("Signaling channel closed")]
    Closed,
}

/// SDP type carried inside offer/answer payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

impl SdpType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
        }
    }
}

/// Session description exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate attribute line
    pub candidate: String,
    /// Media stream identification tag
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Index of the m-line the candidate belongs to
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    /// ICE username fragment
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Candidate with only the attribute line set
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    /// An empty candidate string signals end-of-candidates
    #[must_use]
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.trim().is_empty()
    }
}

/// Hangup payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hangup {
    /// Optional reason, e.g. `"declined"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Reason string sent when an incoming call is declined
pub const DECLINED_REASON: &str = "declined";

/// Signaling message types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    /// SDP offer
    Offer(SessionDescription),
    /// SDP answer
    Answer(SessionDescription),
    /// ICE candidate; `None` marks end-of-candidates
    IceCandidate(Option<IceCandidate>),
    /// End the call
    Hangup(Hangup),
}

impl SignalingMessage {
    /// Wire name of this message
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::IceCandidate(_) => "ice_candidate",
            Self::Hangup(_) => "hangup",
        }
    }

    /// Plain hangup
    #[must_use]
    pub fn hangup() -> Self {
        Self::Hangup(Hangup::default())
    }

    /// Hangup sent when declining an incoming call
    #[must_use]
    pub fn decline() -> Self {
        Self::Hangup(Hangup {
            reason: Some(DECLINED_REASON.to_string()),
        })
    }

    /// Encode to a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn encode(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::Malformed(e.to_string()))
    }

    /// Decode a JSON text frame
    ///
    /// Returns `Ok(None)` for a well-formed frame whose `type` is unknown.
    ///
    /// # Errors
    ///
    /// Returns error if the frame is not JSON, has no `type`, or the payload
    /// does not match its type.
    pub fn decode(text: &str) -> Result<Option<Self>, SignalingError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| SignalingError::Malformed(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| SignalingError::Malformed("missing message type".to_string()))?;
        let payload = value.get(kind).cloned().unwrap_or(Value::Null);

        let message = match kind {
            "offer" => Self::Offer(decode_description(payload, SdpType::Offer)?),
            "answer" => Self::Answer(decode_description(payload, SdpType::Answer)?),
            "ice_candidate" => Self::IceCandidate(
                serde_json::from_value::<Option<IceCandidate>>(payload)
                    .map_err(|e| SignalingError::Malformed(format!("ice_candidate: {e}")))?,
            ),
            "hangup" => Self::Hangup(if payload.is_null() {
                Hangup::default()
            } else {
                serde_json::from_value(payload)
                    .map_err(|e| SignalingError::Malformed(format!("hangup: {e}")))?
            }),
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

impl Serialize for SignalingMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("type", self.kind())?;
        match self {
            Self::Offer(desc) | Self::Answer(desc) => map.serialize_entry(self.kind(), desc)?,
            Self::IceCandidate(candidate) => map.serialize_entry(self.kind(), candidate)?,
            Self::Hangup(hangup) => map.serialize_entry(self.kind(), hangup)?,
        }
        map.end()
    }
}

#[derive(Deserialize)]
struct WireDescription {
    sdp: String,
    #[serde(rename = "type", default)]
    sdp_type: Option<SdpType>,
}

fn decode_description(
    payload: Value,
    expected: SdpType,
) -> Result<SessionDescription, SignalingError> {
    let wire: WireDescription = serde_json::from_value(payload)
        .map_err(|e| SignalingError::Malformed(format!("{}: {e}", expected.as_str())))?;
    match wire.sdp_type {
        Some(found) if found != expected => Err(SignalingError::Malformed(format!(
            "{} message carries a {} description",
            expected.as_str(),
            found.as_str()
        ))),
        _ => Ok(SessionDescription {
            sdp_type: expected,
            sdp: wire.sdp,
        }),
    }
}

/// Bidirectional text channel for one call session
///
/// The channel is brokered by the server; implement this for the concrete
/// transport (WebSocket, in-memory, ...).
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Send one text frame
    async fn send_text(&self, text: String) -> Result<(), SignalingError>;

    /// Receive the next text frame, `None` once the channel has closed
    async fn recv_text(&self) -> Result<Option<String>, SignalingError>;

    /// Close the channel
    async fn close(&self) -> Result<(), SignalingError>;
}

/// Opens the signaling channel for a session id
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    /// Open the channel keyed by `session_id`
    async fn connect(
        &self,
        session_id: &SessionId,
    ) -> Result<Arc<dyn SignalingTransport>, SignalingError>;
}

/// Typed signaling endpoint for one session
///
/// Encodes outbound messages, decodes inbound frames and skips frames it
/// cannot use.
pub struct SignalingHandler {
    session_id: SessionId,
    transport: Arc<dyn SignalingTransport>,
    closed: AtomicBool,
}

impl SignalingHandler {
    /// Create new signaling handler
    #[must_use]
    pub fn new(session_id: SessionId, transport: Arc<dyn SignalingTransport>) -> Self {
        Self {
            session_id,
            transport,
            closed: AtomicBool::new(false),
        }
    }

    /// Session this handler is scoped to
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Whether `close` has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send a signaling message
    ///
    /// # Errors
    ///
    /// Returns error if the handler is closed or the transport fails
    #[tracing::instrument(skip(self, message), fields(session_id = %self.session_id, message_type = message.kind()))]
    pub async fn send(&self, message: &SignalingMessage) -> Result<(), SignalingError> {
        if self.is_closed() {
            return Err(SignalingError::Closed);
        }
        let text = message.encode()?;
        tracing::debug!(bytes = text.len(), "Sending signaling message");
        self.transport.send_text(text).await
    }

    /// Receive the next usable signaling message
    ///
    /// Frames with an unknown type and frames that fail to decode are logged
    /// and skipped. Returns `Ok(None)` once the channel has closed.
    ///
    /// # Errors
    ///
    /// Returns error if the transport fails
    pub async fn recv(&self) -> Result<Option<SignalingMessage>, SignalingError> {
        loop {
            let Some(text) = self.transport.recv_text().await? else {
                tracing::debug!(session_id = %self.session_id, "Signaling channel closed by remote");
                return Ok(None);
            };
            match SignalingMessage::decode(&text) {
                Ok(Some(message)) => {
                    tracing::debug!(
                        session_id = %self.session_id,
                        message_type = message.kind(),
                        "Received signaling message"
                    );
                    return Ok(Some(message));
                }
                Ok(None) => {
                    tracing::debug!(session_id = %self.session_id, "Ignoring signaling message of unknown type");
                }
                Err(e) => {
                    tracing::warn!(session_id = %self.session_id, error = %e, "Dropping malformed signaling frame");
                }
            }
        }
    }

    /// Close the underlying transport
    ///
    /// Only the first call closes the transport; returns `true` for that call.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Err(e) = self.transport.close().await {
            tracing::warn!(session_id = %self.session_id, error = %e, "Failed to close signaling transport");
        } else {
            tracing::debug!(session_id = %self.session_id, "Signaling transport closed");
        }
        true
    }
}
