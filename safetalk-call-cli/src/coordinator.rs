//! Terminal call coordinator
//!
//! Prints session events as lines and turns single-key commands read from
//! stdin into session operations.

use anyhow::Result;
use safetalk_call_core::{
    CallSession, CallState, CallType, EndReason, MediaStreamHandle, SessionEvent, SessionId,
    StreamKind,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::broadcast;

/// A user control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Mute or unmute the microphone
    ToggleAudio,
    /// Turn the camera off or on
    ToggleVideo,
    /// Share the screen
    StartScreenShare,
    /// Back to the camera
    StopScreenShare,
    /// Hang up
    Hangup,
    /// Accept the ringing call
    Accept,
    /// Decline the ringing call
    Decline,
}

impl Control {
    /// Map a typed line to a control
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "m" => Some(Self::ToggleAudio),
            "v" => Some(Self::ToggleVideo),
            "s" => Some(Self::StartScreenShare),
            "S" => Some(Self::StopScreenShare),
            "h" | "q" => Some(Self::Hangup),
            "a" => Some(Self::Accept),
            "d" => Some(Self::Decline),
            _ => None,
        }
    }
}

/// Key help shown when a call starts
pub const HELP: &str = "keys: m mute | v camera | s share screen | S stop sharing | h hang up";

/// Key help shown while ringing
pub const RING_HELP: &str = "keys: a accept | d decline";

fn describe_stream(stream: &MediaStreamHandle) -> String {
    let who = match stream.kind() {
        StreamKind::Local => "local",
        StreamKind::Remote => "remote",
    };
    let tracks: Vec<String> = stream
        .tracks()
        .iter()
        .map(|t| {
            let flag = if t.is_enabled() { "" } else { " (off)" };
            format!("{:?}/{:?}{flag}", t.kind(), t.source()).to_lowercase()
        })
        .collect();
    format!("{who} stream: {}", tracks.join(", "))
}

fn describe_state(state: CallState) -> String {
    match state {
        CallState::Idle => "idle".to_string(),
        CallState::Ringing => "incoming call".to_string(),
        CallState::Connecting => "connecting...".to_string(),
        CallState::Connected => "connected".to_string(),
        CallState::Ended(EndReason::LocalHangup) => "call ended".to_string(),
        CallState::Ended(EndReason::RemoteHangup) => "the other side hung up".to_string(),
        CallState::Ended(EndReason::Declined) => "call declined".to_string(),
        CallState::Ended(EndReason::ConnectionLost) => "call dropped".to_string(),
        CallState::Failed(reason) => format!("call failed: {reason}"),
    }
}

/// One terminal line for an event
pub fn describe(event: &SessionEvent) -> String {
    match event {
        SessionEvent::StateChanged(state) => describe_state(*state),
        SessionEvent::LocalStream(stream) | SessionEvent::RemoteStream(stream) => {
            describe_stream(stream)
        }
    }
}

/// Drives one call from the terminal
pub struct Coordinator {
    session: CallSession,
    session_id: SessionId,
    call_type: CallType,
}

impl Coordinator {
    /// Coordinate `session`, which is (or will be) on `session_id`
    pub fn new(session: CallSession, session_id: SessionId, call_type: CallType) -> Self {
        Self {
            session,
            session_id,
            call_type,
        }
    }

    /// Apply one control; returns the line to print
    pub async fn apply(&self, control: Control) -> Result<String> {
        let line = match control {
            Control::ToggleAudio => {
                if self.session.toggle_audio() {
                    "microphone on"
                } else {
                    "microphone muted"
                }
            }
            Control::ToggleVideo => {
                if self.session.toggle_video() {
                    "camera on"
                } else {
                    "camera off"
                }
            }
            Control::StartScreenShare => {
                if self.session.start_screen_share().await {
                    "sharing screen"
                } else {
                    "screen share unavailable"
                }
            }
            Control::StopScreenShare => {
                if self.session.stop_screen_share().await {
                    "back to camera"
                } else {
                    "not sharing"
                }
            }
            Control::Hangup => {
                self.session.hangup().await;
                "hanging up"
            }
            Control::Accept => {
                self.session
                    .accept_incoming(self.session_id.clone(), self.call_type)
                    .await?;
                "accepted"
            }
            Control::Decline => {
                self.session.decline(&self.session_id).await?;
                "declined"
            }
        };
        Ok(line.to_string())
    }

    /// Run until the call reaches a terminal state
    ///
    /// Returns the terminal state. Closing the input hangs up.
    pub async fn run<R>(&self, input: R) -> Result<CallState>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut events = self.session.subscribe();
        let mut lines = input.lines();
        let mut input_open = true;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        println!("{}", describe(&event));
                        if let SessionEvent::StateChanged(state) = event {
                            if state.is_terminal() {
                                return Ok(state);
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "Event display fell behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Ok(self.session.state());
                    }
                },
                line = lines.next_line(), if input_open => match line? {
                    Some(line) => match Control::parse(&line) {
                        Some(control) => match self.apply(control).await {
                            Ok(text) => println!("{text}"),
                            Err(e) => println!("{e}"),
                        },
                        None if line.trim().is_empty() => {}
                        None => println!("{HELP}"),
                    },
                    None => {
                        input_open = false;
                        self.session.hangup().await;
                    }
                },
                state = self.session.finished() => {
                    return Ok(state);
                }
            }
        }
    }
}
