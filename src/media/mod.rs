#![forbid(unsafe_code)]

// Media module - collaborator seam between the signaling core and the WebRTC engine.
// The core only asks for offers, answers, candidates and video switches; capture,
// encoding and transport live behind these traits.

pub mod types;
pub mod rtc;

#[cfg(test)]
pub mod testing;

pub use types::{IceCandidateInit, MediaError, MediaResult};
pub use rtc::WebRtcEngine;

use async_trait::async_trait;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// Creates media peers for sessions.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Create a peer sending `video_id` and return it with its first offer SDP.
    async fn create_peer(&self, session_id: &str, video_id: &str) -> MediaResult<(Arc<dyn MediaPeer>, String)>;

    /// Video sources currently offered, in preference order.
    fn video_ids(&self) -> Vec<String>;
}

/// One session's real-time media negotiation.
#[async_trait]
pub trait MediaPeer: Send + Sync {
    /// Produce a new local offer. With `ice_restart` the ICE credentials are regenerated.
    async fn create_offer(&self, ice_restart: bool) -> MediaResult<String>;

    async fn set_remote_answer(&self, sdp: &str) -> MediaResult<()>;

    async fn add_remote_candidate(&self, candidate: IceCandidateInit) -> MediaResult<()>;

    async fn set_video(&self, video_id: &str) -> MediaResult<()>;

    async fn close(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Local offer sent, waiting for the client's answer
    Offered,
    /// Remote answer applied
    Established,
}

struct Progress {
    state: PeerState,
    video_id: String,
    offered_at: Instant,
}

/// A session's media peer plus where it is in the offer/answer exchange.
///
/// A session without a handle is in the absent state. The handle itself only
/// exists once an offer was created, so it starts out `Offered`.
pub struct PeerHandle {
    peer: Arc<dyn MediaPeer>,
    progress: StdMutex<Progress>,
}

impl PeerHandle {
    pub fn offered(peer: Arc<dyn MediaPeer>, video_id: impl Into<String>) -> Self {
        Self {
            peer,
            progress: StdMutex::new(Progress {
                state: PeerState::Offered,
                video_id: video_id.into(),
                offered_at: Instant::now(),
            }),
        }
    }

    fn progress(&self) -> std::sync::MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> PeerState {
        self.progress().state
    }

    pub fn video_id(&self) -> String {
        self.progress().video_id.clone()
    }

    /// True when the handle has waited for an answer longer than `timeout`.
    pub fn offer_expired(&self, timeout: Duration) -> bool {
        let progress = self.progress();
        progress.state == PeerState::Offered && progress.offered_at.elapsed() > timeout
    }

    /// ICE restart: regenerate the offer. The handle goes back to `Offered`.
    pub async fn restart(&self) -> MediaResult<String> {
        let sdp = self.peer.create_offer(true).await?;
        let mut progress = self.progress();
        progress.state = PeerState::Offered;
        progress.offered_at = Instant::now();
        Ok(sdp)
    }

    pub async fn answer(&self, sdp: &str) -> MediaResult<()> {
        self.peer.set_remote_answer(sdp).await?;
        self.progress().state = PeerState::Established;
        Ok(())
    }

    pub async fn candidate(&self, candidate: IceCandidateInit) -> MediaResult<()> {
        self.peer.add_remote_candidate(candidate).await
    }

    pub async fn switch_video(&self, video_id: &str) -> MediaResult<()> {
        self.peer.set_video(video_id).await?;
        self.progress().video_id = video_id.to_string();
        Ok(())
    }

    pub async fn close(&self) {
        debug!("Closing media peer (video {})", self.video_id());
        self.peer.close().await;
    }
}
