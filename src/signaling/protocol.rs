#![forbid(unsafe_code)]

// Signaling protocol - Message types for WebSocket communication.
// Every frame is an `{ "event": "<group>/<name>", "payload": { ... } }` envelope.

use crate::capture::BroadcastStatus;
use crate::desktop::ScreenSize;
use crate::media::IceCandidateInit;
use crate::session::Profile;
use crate::turn::IceServer;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    #[error("Invalid payload for {event}: {source}")]
    InvalidPayload {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Deserialize)]
struct VideoRequest {
    #[serde(default)]
    video: Option<String>,
}

#[derive(Deserialize)]
struct Answer {
    sdp: String,
}

#[derive(Deserialize)]
struct Video {
    video: String,
}

#[derive(Deserialize)]
struct Target {
    id: String,
}

#[derive(Deserialize)]
struct Mute {
    id: String,
    #[serde(default = "default_muted")]
    muted: bool,
}

fn default_muted() -> bool {
    true
}

/// Client-to-Server messages
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Ask for a media peer, optionally naming the video source
    SignalRequest { video: Option<String> },
    /// ICE restart on the existing peer
    SignalRestart,
    /// Remote description for our offer
    SignalAnswer { sdp: String },
    SignalCandidate(IceCandidateInit),
    /// Switch the active video source
    SignalVideo { video: String },
    /// Admin snapshot request
    SystemAdmin,
    ControlRequest,
    ControlRelease,
    AdminControl { id: String },
    AdminRelease,
    AdminKick { id: String },
    AdminMute { id: String, muted: bool },
}

fn payload<T: DeserializeOwned>(event: &str, value: serde_json::Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|source| ProtocolError::InvalidPayload {
        event: event.to_string(),
        source,
    })
}

impl ClientMessage {
    /// Parse one text frame. A missing or null payload is read as `{}`.
    ///
    /// # Errors
    /// Returns `ProtocolError` for malformed JSON, unknown events or bad payloads
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
        let event = envelope.event.as_str();
        let body = match envelope.payload {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            other => other,
        };

        let message = match event {
            "signal/request" => {
                let req: VideoRequest = payload(event, body)?;
                ClientMessage::SignalRequest { video: req.video }
            }
            "signal/restart" => ClientMessage::SignalRestart,
            "signal/answer" => {
                let answer: Answer = payload(event, body)?;
                ClientMessage::SignalAnswer { sdp: answer.sdp }
            }
            "signal/candidate" => ClientMessage::SignalCandidate(payload(event, body)?),
            "signal/video" => {
                let video: Video = payload(event, body)?;
                ClientMessage::SignalVideo { video: video.video }
            }
            "system/admin" => ClientMessage::SystemAdmin,
            "control/request" => ClientMessage::ControlRequest,
            "control/release" => ClientMessage::ControlRelease,
            "admin/control" => {
                let target: Target = payload(event, body)?;
                ClientMessage::AdminControl { id: target.id }
            }
            "admin/release" => ClientMessage::AdminRelease,
            "admin/kick" => {
                let target: Target = payload(event, body)?;
                ClientMessage::AdminKick { id: target.id }
            }
            "admin/mute" => {
                let mute: Mute = payload(event, body)?;
                ClientMessage::AdminMute {
                    id: mute.id,
                    muted: mute.muted,
                }
            }
            other => return Err(ProtocolError::UnknownEvent(other.to_string())),
        };
        Ok(message)
    }
}

/// Per-session flags shown to other clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStateView {
    pub is_connected: bool,
    pub is_watching: bool,
    pub is_host: bool,
    pub is_muted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionData {
    pub id: String,
    pub profile: Profile,
    pub state: SessionStateView,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlHost {
    pub has_host: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebRtcInfo {
    pub videos: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInit {
    pub session_id: String,
    pub control_host: ControlHost,
    pub screen_size: ScreenSize,
    pub sessions: BTreeMap<String, SessionData>,
    pub implicit_hosting: bool,
    pub screencast_enabled: bool,
    pub webrtc: WebRtcInfo,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemAdmin {
    pub screen_sizes_list: Vec<ScreenSize>,
    pub broadcast_status: BroadcastStatus,
}

/// Server-to-Client messages
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload")]
pub enum ServerMessage {
    /// Offer for a freshly created peer
    #[serde(rename = "signal/provide", rename_all = "camelCase")]
    SignalProvide {
        sdp: String,
        ice_servers: Vec<IceServer>,
        video: String,
    },
    /// Offer after an ICE restart
    #[serde(rename = "signal/restart")]
    SignalRestart { sdp: String },
    /// Video switch confirmation
    #[serde(rename = "signal/video")]
    SignalVideo { video: String },
    #[serde(rename = "system/init")]
    SystemInit(SystemInit),
    #[serde(rename = "system/admin")]
    SystemAdmin(SystemAdmin),
    /// Sent right before the server closes the connection
    #[serde(rename = "system/disconnect")]
    SystemDisconnect { message: String },
    #[serde(rename = "system/error")]
    SystemError { message: String },
    #[serde(rename = "session/connected")]
    SessionConnected(SessionData),
    #[serde(rename = "session/disconnected")]
    SessionDisconnected { id: String },
    #[serde(rename = "session/state")]
    SessionState { id: String, state: SessionStateView },
    #[serde(rename = "control/host")]
    ControlHost(ControlHost),
    /// Someone asked the current host for control
    #[serde(rename = "control/request")]
    ControlRequest { id: String },
}
