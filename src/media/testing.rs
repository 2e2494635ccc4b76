#![forbid(unsafe_code)]

// Recording fakes for the media engine and session transport, shared by unit tests

use super::{IceCandidateInit, MediaEngine, MediaError, MediaPeer, MediaResult};
use crate::session::{DeliveryError, SessionTransport};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub struct FakePeer {
    videos: Vec<String>,
    offers: AtomicUsize,
    calls: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl FakePeer {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl MediaPeer for FakePeer {
    async fn create_offer(&self, ice_restart: bool) -> MediaResult<String> {
        let n = self.offers.fetch_add(1, Ordering::SeqCst) + 1;
        self.record(format!("offer:{ice_restart}"));
        Ok(format!("offer-{n}"))
    }

    async fn set_remote_answer(&self, sdp: &str) -> MediaResult<()> {
        if sdp.is_empty() {
            return Err(MediaError::Negotiation("empty answer".into()));
        }
        self.record(format!("answer:{sdp}"));
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidateInit) -> MediaResult<()> {
        self.record(format!("candidate:{}", candidate.candidate));
        Ok(())
    }

    async fn set_video(&self, video_id: &str) -> MediaResult<()> {
        if !self.videos.iter().any(|v| v == video_id) {
            return Err(MediaError::UnknownVideo(video_id.to_string()));
        }
        self.record(format!("video:{video_id}"));
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeEngine {
    videos: Vec<String>,
    peers: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakeEngine {
    pub fn new(videos: &[&str]) -> Self {
        Self {
            videos: videos.iter().map(|v| v.to_string()).collect(),
            peers: Mutex::new(Vec::new()),
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn peer(&self, index: usize) -> Arc<FakePeer> {
        self.peers.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn create_peer(&self, _session_id: &str, video_id: &str) -> MediaResult<(Arc<dyn MediaPeer>, String)> {
        if !self.videos.iter().any(|v| v == video_id) {
            return Err(MediaError::UnknownVideo(video_id.to_string()));
        }
        let peer = Arc::new(FakePeer {
            videos: self.videos.clone(),
            offers: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        let sdp = peer.create_offer(false).await?;
        self.peers.lock().unwrap().push(peer.clone());
        Ok((peer as Arc<dyn MediaPeer>, sdp))
    }

    fn video_ids(&self) -> Vec<String> {
        self.videos.clone()
    }
}

/// Transport that keeps every payload it was handed. Can be switched to fail.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<String>>,
    failing: AtomicBool,
    closed_with: Mutex<Option<String>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let transport = Self::default();
        transport.failing.store(true, Ordering::SeqCst);
        Arc::new(transport)
    }

    pub fn messages(&self) -> Vec<serde_json::Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|s| serde_json::from_str(s).unwrap())
            .collect()
    }

    pub fn events(&self) -> Vec<String> {
        self.messages()
            .iter()
            .map(|m| m["event"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    pub fn last(&self, event: &str) -> Option<serde_json::Value> {
        self.messages().into_iter().rev().find(|m| m["event"] == event)
    }

    pub fn closed_with(&self) -> Option<String> {
        self.closed_with.lock().unwrap().clone()
    }
}

impl SessionTransport for RecordingTransport {
    fn send(&self, payload: Arc<String>) -> Result<(), DeliveryError> {
        if self.failing.load(Ordering::SeqCst) || self.is_closed() {
            return Err(DeliveryError::Closed);
        }
        self.sent.lock().unwrap().push((*payload).clone());
        Ok(())
    }

    fn close(&self, reason: &str) {
        let mut closed = self.closed_with.lock().unwrap();
        if closed.is_none() {
            *closed = Some(reason.to_string());
        }
    }

    fn is_closed(&self) -> bool {
        self.closed_with.lock().unwrap().is_some()
    }

    fn remote_addr(&self) -> Option<String> {
        Some("127.0.0.1:50000".to_string())
    }
}
