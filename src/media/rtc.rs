#![forbid(unsafe_code)]

// webrtc-rs backed media engine. Each session gets its own RTCPeerConnection
// sending the shared capture tracks; video switching swaps the sender's track.

use super::{IceCandidateInit, MediaEngine, MediaError, MediaPeer, MediaResult};
use crate::capture::CaptureManager;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine as RtcMediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

/// Wait this long for ICE gathering so the first offer carries candidates.
const ICE_GATHER_TIMEOUT: Duration = Duration::from_millis(2500);

impl From<webrtc::Error> for MediaError {
    fn from(e: webrtc::Error) -> Self {
        MediaError::Negotiation(e.to_string())
    }
}

pub struct WebRtcEngine {
    api: API,
    stun_urls: Vec<String>,
    capture: Arc<CaptureManager>,
}

impl WebRtcEngine {
    /// # Errors
    /// Returns `MediaError` if codec or interceptor registration fails
    pub fn new(capture: Arc<CaptureManager>, stun_urls: Vec<String>) -> MediaResult<Self> {
        let mut media_engine = RtcMediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            stun_urls,
            capture,
        })
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.stun_urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.stun_urls.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

async fn add_tracks(
    pc: &RTCPeerConnection,
    video: Arc<dyn TrackLocal + Send + Sync>,
    audio: Arc<dyn TrackLocal + Send + Sync>,
) -> Result<Arc<RTCRtpSender>, webrtc::Error> {
    let video_sender = pc.add_track(video).await?;
    pc.add_track(audio).await?;
    Ok(video_sender)
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    async fn create_peer(&self, session_id: &str, video_id: &str) -> MediaResult<(Arc<dyn MediaPeer>, String)> {
        let video_track = self.capture.video_track(video_id)?;

        let pc = Arc::new(self.api.new_peer_connection(self.rtc_configuration()).await?);

        let video_sender = match add_tracks(&pc, video_track, self.capture.audio_track()).await {
            Ok(sender) => sender,
            Err(e) => {
                if let Err(close_err) = pc.close().await {
                    debug!("Closing peer for {} after track failure: {}", session_id, close_err);
                }
                return Err(e.into());
            }
        };

        let peer = Arc::new(WebRtcPeer {
            session_id: session_id.to_string(),
            pc,
            video_sender,
            capture: self.capture.clone(),
        });

        let sdp = match peer.create_offer(false).await {
            Ok(sdp) => sdp,
            Err(e) => {
                peer.close().await;
                return Err(e);
            }
        };

        info!("Created peer for session {} on video {}", session_id, video_id);
        Ok((peer as Arc<dyn MediaPeer>, sdp))
    }

    fn video_ids(&self) -> Vec<String> {
        self.capture.video_ids()
    }
}

pub struct WebRtcPeer {
    session_id: String,
    pc: Arc<RTCPeerConnection>,
    video_sender: Arc<RTCRtpSender>,
    capture: Arc<CaptureManager>,
}

#[async_trait]
impl MediaPeer for WebRtcPeer {
    async fn create_offer(&self, ice_restart: bool) -> MediaResult<String> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self.pc.create_offer(options).await?;

        let mut gather_complete = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(offer).await?;

        if tokio::time::timeout(ICE_GATHER_TIMEOUT, gather_complete.recv())
            .await
            .is_err()
        {
            debug!(
                "ICE gathering timeout after {:?} for session {}",
                ICE_GATHER_TIMEOUT, self.session_id
            );
        }

        self.pc
            .local_description()
            .await
            .map(|d| d.sdp)
            .ok_or_else(|| MediaError::InvalidState("no local description after offer".into()))
    }

    async fn set_remote_answer(&self, sdp: &str) -> MediaResult<()> {
        let answer = RTCSessionDescription::answer(sdp.to_string())?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidateInit) -> MediaResult<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn set_video(&self, video_id: &str) -> MediaResult<()> {
        let track = self.capture.video_track(video_id)?;
        self.video_sender
            .replace_track(Some(track as Arc<dyn TrackLocal + Send + Sync>))
            .await?;
        debug!("Session {} switched to video {}", self.session_id, video_id);
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("Failed to close peer connection for session {}: {}", self.session_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

    fn engine() -> WebRtcEngine {
        let capture = Arc::new(CaptureManager::new(&["hd".to_string()], false, None).unwrap());
        WebRtcEngine::new(capture, Vec::new()).unwrap()
    }

    #[tokio::test]
    async fn test_add_tracks_fails_on_closed_connection() {
        let engine = engine();
        let pc = engine.api.new_peer_connection(engine.rtc_configuration()).await.unwrap();
        pc.close().await.unwrap();

        let result = add_tracks(
            &pc,
            engine.capture.video_track("hd").unwrap(),
            engine.capture.audio_track(),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(pc.connection_state(), RTCPeerConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_unknown_video_creates_no_peer() {
        let engine = engine();
        assert!(matches!(
            engine.create_peer("s-1", "4k").await,
            Err(MediaError::UnknownVideo(_))
        ));
    }
}
