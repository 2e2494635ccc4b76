#![forbid(unsafe_code)]

// Capture - screen/audio feed control, offered video sources and broadcast relay status.
// The feed only runs while at least one watcher is connected.

use crate::media::{MediaError, MediaResult};
use crate::session::{Session, SessionManager};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use tracing::{debug, info};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

const STREAM_ID: &str = "deskshare";

/// External streaming relay state shown to admins
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastStatus {
    pub is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// One encoded video variant peers can subscribe to
pub struct VideoSource {
    pub id: String,
    pub track: Arc<TrackLocalStaticSample>,
}

#[derive(Default)]
struct Watchers {
    ids: HashSet<String>,
    running: bool,
}

pub struct CaptureManager {
    videos: Vec<VideoSource>,
    audio: Arc<TrackLocalStaticSample>,
    screencast_enabled: bool,
    broadcast_url: StdRwLock<Option<String>>,
    watchers: StdMutex<Watchers>,
}

impl CaptureManager {
    /// # Errors
    /// Returns `NoVideoSources` when `video_ids` is empty
    pub fn new(video_ids: &[String], screencast_enabled: bool, broadcast_url: Option<String>) -> MediaResult<Self> {
        if video_ids.is_empty() {
            return Err(MediaError::NoVideoSources);
        }

        let videos = video_ids
            .iter()
            .map(|id| VideoSource {
                id: id.clone(),
                track: Arc::new(TrackLocalStaticSample::new(
                    RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_VP8.to_owned(),
                        ..Default::default()
                    },
                    format!("video-{id}"),
                    STREAM_ID.to_owned(),
                )),
            })
            .collect();

        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            STREAM_ID.to_owned(),
        ));

        Ok(Self {
            videos,
            audio,
            screencast_enabled,
            broadcast_url: StdRwLock::new(broadcast_url),
            watchers: StdMutex::new(Watchers::default()),
        })
    }

    pub fn video_ids(&self) -> Vec<String> {
        self.videos.iter().map(|v| v.id.clone()).collect()
    }

    pub fn video_track(&self, id: &str) -> MediaResult<Arc<TrackLocalStaticSample>> {
        self.videos
            .iter()
            .find(|v| v.id == id)
            .map(|v| v.track.clone())
            .ok_or_else(|| MediaError::UnknownVideo(id.to_string()))
    }

    pub fn audio_track(&self) -> Arc<TrackLocalStaticSample> {
        self.audio.clone()
    }

    pub fn screencast_enabled(&self) -> bool {
        self.screencast_enabled
    }

    pub fn broadcast_status(&self) -> BroadcastStatus {
        let url = self.broadcast_url.read().unwrap_or_else(|e| e.into_inner()).clone();
        BroadcastStatus {
            is_active: url.is_some(),
            url,
        }
    }

    pub fn set_broadcast_url(&self, url: Option<String>) {
        *self.broadcast_url.write().unwrap_or_else(|e| e.into_inner()) = url;
    }

    pub fn is_running(&self) -> bool {
        self.watchers.lock().unwrap_or_else(|e| e.into_inner()).running
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.lock().unwrap_or_else(|e| e.into_inner()).ids.len()
    }

    fn add_watcher(&self, session: &Session) {
        if !session.profile().can_watch {
            return;
        }
        let mut watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        if watchers.ids.insert(session.id().to_string()) && !watchers.running {
            watchers.running = true;
            info!("Starting capture, first watcher {}", session.id());
        }
    }

    fn remove_watcher(&self, session: &Session) {
        let mut watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        if !watchers.ids.remove(session.id()) {
            return;
        }
        debug!("Watcher {} left, {} remaining", session.id(), watchers.ids.len());
        if watchers.ids.is_empty() && watchers.running {
            watchers.running = false;
            info!("Stopping capture, no watchers left");
        }
    }

    /// Follow registry transitions to start and stop the feed.
    pub fn attach(self: &Arc<Self>, sessions: &SessionManager) {
        let capture = Arc::downgrade(self);
        sessions.on_connected(move |session| {
            if let Some(capture) = capture.upgrade() {
                capture.add_watcher(session);
            }
        });

        let capture = Arc::downgrade(self);
        sessions.on_before_destroy(move |session| {
            if let Some(capture) = capture.upgrade() {
                capture.remove_watcher(session);
            }
        });
    }
}
