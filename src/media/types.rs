#![forbid(unsafe_code)]

// Common types and error handling for the media module

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures reported by the media collaborator
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Unknown video source: {0}")]
    UnknownVideo(String),

    #[error("No video sources available")]
    NoVideoSources,

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias for media operations
pub type MediaResult<T> = Result<T, MediaError>;

/// Remote ICE candidate as sent by the browser
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}
