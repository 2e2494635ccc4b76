#![forbid(unsafe_code)]

// Message handler - per-session signaling transitions, init/admin snapshots and
// control/admin commands. Signaling replies go to the originating session only.

use super::protocol::{
    ClientMessage, ControlHost, ServerMessage, SessionData, SystemAdmin, SystemInit, WebRtcInfo,
};
use crate::auth;
use crate::capture::CaptureManager;
use crate::desktop::Desktop;
use crate::media::{IceCandidateInit, MediaEngine, MediaError, PeerHandle};
use crate::metrics::ServerMetrics;
use crate::session::{Session, SessionError, SessionManager};
use crate::turn::IceServerProvider;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// An Offered handle unanswered for this long is released.
pub const OFFER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct MessageHandler {
    sessions: Arc<SessionManager>,
    media: Arc<dyn MediaEngine>,
    ice: IceServerProvider,
    desktop: Arc<Desktop>,
    capture: Arc<CaptureManager>,
    metrics: ServerMetrics,
}

impl MessageHandler {
    pub fn new(
        sessions: Arc<SessionManager>,
        media: Arc<dyn MediaEngine>,
        ice: IceServerProvider,
        desktop: Arc<Desktop>,
        capture: Arc<CaptureManager>,
        metrics: ServerMetrics,
    ) -> Self {
        Self {
            sessions,
            media,
            ice,
            desktop,
            capture,
            metrics,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Dispatch one inbound message for `session`.
    ///
    /// # Errors
    /// Media collaborator failures and unexpected delivery errors. Unauthorized
    /// and stale messages are absorbed here.
    pub async fn handle(&self, session: &Arc<Session>, message: ClientMessage) -> anyhow::Result<()> {
        match message {
            ClientMessage::SignalRequest { video } => self.signal_request(session, video).await?,
            ClientMessage::SignalRestart => self.signal_restart(session).await?,
            ClientMessage::SignalAnswer { sdp } => self.signal_answer(session, &sdp).await?,
            ClientMessage::SignalCandidate(candidate) => self.signal_candidate(session, candidate).await?,
            ClientMessage::SignalVideo { video } => self.signal_video(session, &video).await?,
            ClientMessage::SystemAdmin => self.system_admin(session)?,
            ClientMessage::ControlRequest => self.control_request(session)?,
            ClientMessage::ControlRelease => self.control_release(session),
            ClientMessage::AdminControl { id } => self.admin_control(session, &id)?,
            ClientMessage::AdminRelease => self.admin_release(session),
            ClientMessage::AdminKick { id } => self.admin_kick(session, &id).await?,
            ClientMessage::AdminMute { id, muted } => self.admin_mute(session, &id, muted)?,
        }
        Ok(())
    }

    // --- signaling ---

    pub async fn signal_request(&self, session: &Arc<Session>, video: Option<String>) -> Result<(), MediaError> {
        if let Err(e) = auth::can_watch_only(session) {
            debug!("Ignoring signal/request from {}: {}", session.id(), e);
            return Ok(());
        }

        let video = match video {
            Some(v) => v,
            None => self
                .media
                .video_ids()
                .into_iter()
                .next()
                .ok_or(MediaError::NoVideoSources)?,
        };

        let (peer, sdp) = self.media.create_peer(session.id(), &video).await?;
        self.metrics.inc_offers_created();

        if let Some(old) = session.set_peer(Some(Arc::new(PeerHandle::offered(peer, video.clone())))) {
            debug!("Replacing existing peer for session {}", session.id());
            old.close().await;
        }

        // destroy may have released the peer slot while create_peer was pending
        if session.is_destroyed() {
            debug!("Session {} destroyed during signal/request, releasing peer", session.id());
            if let Some(peer) = session.take_peer() {
                peer.close().await;
            }
            return Ok(());
        }

        self.reply(
            session,
            &ServerMessage::SignalProvide {
                sdp,
                ice_servers: self.ice.ice_servers(session.id()),
                video,
            },
        );

        if self.sessions.implicit_hosting() && auth::can_host_only(session, self.sessions.private_mode()).is_ok() {
            match self.sessions.set_host_if_vacant(session.id()) {
                Ok(true) => debug!("Session {} implicitly hosting", session.id()),
                Ok(false) => {}
                Err(e) => debug!("Implicit hosting skipped for {}: {}", session.id(), e),
            }
        }
        Ok(())
    }

    pub async fn signal_restart(&self, session: &Arc<Session>) -> Result<(), MediaError> {
        let Some(peer) = session.peer() else {
            debug!("Ignoring signal/restart for {}: no peer", session.id());
            return Ok(());
        };

        let sdp = peer.restart().await?;
        self.metrics.inc_offers_created();
        self.reply(session, &ServerMessage::SignalRestart { sdp });
        Ok(())
    }

    pub async fn signal_answer(&self, session: &Arc<Session>, sdp: &str) -> Result<(), MediaError> {
        let Some(peer) = session.peer() else {
            debug!("Ignoring signal/answer for {}: no peer", session.id());
            return Ok(());
        };
        peer.answer(sdp).await
    }

    pub async fn signal_candidate(&self, session: &Arc<Session>, candidate: IceCandidateInit) -> Result<(), MediaError> {
        let Some(peer) = session.peer() else {
            debug!("Ignoring signal/candidate for {}: no peer", session.id());
            return Ok(());
        };
        peer.candidate(candidate).await
    }

    pub async fn signal_video(&self, session: &Arc<Session>, video: &str) -> Result<(), MediaError> {
        let Some(peer) = session.peer() else {
            debug!("Ignoring signal/video for {}: no peer", session.id());
            return Ok(());
        };

        peer.switch_video(video).await?;
        self.reply(session, &ServerMessage::SignalVideo { video: video.to_string() });
        Ok(())
    }

    /// Release the peer if it sat in Offered past `timeout`. Returns whether it did.
    pub async fn expire_offer(&self, session: &Session, timeout: Duration) -> bool {
        let expired = session.peer().is_some_and(|p| p.offer_expired(timeout));
        if !expired {
            return false;
        }
        if let Some(peer) = session.take_peer() {
            debug!("Offer for session {} expired unanswered", session.id());
            peer.close().await;
        }
        true
    }

    // --- snapshots ---

    pub fn system_init(&self, session: &Session) -> SystemInit {
        let host = self.sessions.get_host();
        let sessions = self
            .sessions
            .list()
            .into_iter()
            .filter(|s| s.is_connected())
            .map(|s| {
                let data = SessionData {
                    id: s.id().to_string(),
                    profile: s.profile().clone(),
                    state: s.state(),
                };
                (data.id.clone(), data)
            })
            .collect();

        SystemInit {
            session_id: session.id().to_string(),
            control_host: ControlHost {
                has_host: host.is_some(),
                host_id: host.map(|h| h.id().to_string()),
            },
            screen_size: self.desktop.screen_size(),
            sessions,
            implicit_hosting: self.sessions.implicit_hosting(),
            screencast_enabled: self.capture.screencast_enabled(),
            webrtc: WebRtcInfo {
                videos: self.media.video_ids(),
            },
        }
    }

    pub fn admin_snapshot(&self) -> SystemAdmin {
        SystemAdmin {
            screen_sizes_list: self.desktop.screen_sizes(),
            broadcast_status: self.capture.broadcast_status(),
        }
    }

    /// First contact: `system/init`, plus `system/admin` for admins.
    pub fn send_init(&self, session: &Session) -> Result<(), SessionError> {
        session.send(&ServerMessage::SystemInit(self.system_init(session)))?;
        if session.is_admin() {
            session.send(&ServerMessage::SystemAdmin(self.admin_snapshot()))?;
        }
        Ok(())
    }

    fn system_admin(&self, session: &Session) -> Result<(), SessionError> {
        if let Err(e) = auth::admins_only(session) {
            debug!("Ignoring system/admin from {}: {}", session.id(), e);
            return Ok(());
        }
        session.send(&ServerMessage::SystemAdmin(self.admin_snapshot()))
    }

    // --- control ---

    fn control_request(&self, session: &Arc<Session>) -> Result<(), SessionError> {
        if let Err(e) = auth::can_host_only(session, self.sessions.private_mode()) {
            debug!("Ignoring control/request from {}: {}", session.id(), e);
            return Ok(());
        }
        if session.is_host() {
            return Ok(());
        }

        if session.is_admin() {
            return self.sessions.set_host(session.id());
        }
        if self.sessions.set_host_if_vacant(session.id())? {
            return Ok(());
        }

        if let Some(host) = self.sessions.get_host() {
            self.reply(&host, &ServerMessage::ControlRequest { id: session.id().to_string() });
        }
        session.send(&ServerMessage::SystemError {
            message: "control is held by another session".to_string(),
        })
    }

    fn control_release(&self, session: &Session) {
        if !self.sessions.release_host(session.id()) {
            debug!("Ignoring control/release from {}: not host", session.id());
        }
    }

    // --- admin ---

    fn admin_control(&self, session: &Session, target: &str) -> Result<(), SessionError> {
        if let Err(e) = auth::admins_only(session) {
            debug!("Ignoring admin/control from {}: {}", session.id(), e);
            return Ok(());
        }
        match self.sessions.set_host(target) {
            Err(SessionError::NotFound(id)) => session.send(&ServerMessage::SystemError {
                message: format!("session {id} not found"),
            }),
            other => other,
        }
    }

    fn admin_release(&self, session: &Session) {
        if let Err(e) = auth::admins_only(session) {
            debug!("Ignoring admin/release from {}: {}", session.id(), e);
            return;
        }
        self.sessions.clear_host();
    }

    async fn admin_kick(&self, session: &Session, target: &str) -> Result<(), SessionError> {
        if let Err(e) = auth::admins_only(session) {
            debug!("Ignoring admin/kick from {}: {}", session.id(), e);
            return Ok(());
        }
        match self.sessions.destroy_with_reason(target, "kicked").await {
            Ok(()) => {
                info!("Session {} kicked by {}", target, session.id());
                Ok(())
            }
            Err(SessionError::NotFound(id)) => session.send(&ServerMessage::SystemError {
                message: format!("session {id} not found"),
            }),
            Err(e) => Err(e),
        }
    }

    fn admin_mute(&self, session: &Session, target: &str, muted: bool) -> Result<(), SessionError> {
        if let Err(e) = auth::admins_only(session) {
            debug!("Ignoring admin/mute from {}: {}", session.id(), e);
            return Ok(());
        }
        let Some(target) = self.sessions.get(target) else {
            return session.send(&ServerMessage::SystemError {
                message: format!("session {target} not found"),
            });
        };

        target.set_muted(muted);
        let update = ServerMessage::SessionState {
            id: target.id().to_string(),
            state: target.state(),
        };
        if let Err(e) = self.sessions.broadcast(&update, None) {
            debug!("{}", e);
            self.metrics.add_broadcast_failures(e.failures.len());
        }
        Ok(())
    }

    /// Direct reply. A dead recipient is the transport's business, not an error here.
    fn reply(&self, session: &Session, message: &ServerMessage) {
        if let Err(e) = session.send(message) {
            debug!("Reply to {} dropped: {}", session.id(), e);
        }
    }
}

/// Fan registry transitions out to every client.
pub fn register_broadcast_hooks(sessions: &Arc<SessionManager>, metrics: &ServerMetrics) {
    fn deliver(sessions: &SessionManager, metrics: &ServerMetrics, message: &ServerMessage, exclude: Option<&str>) {
        if let Err(e) = sessions.broadcast(message, exclude) {
            debug!("{}", e);
            metrics.add_broadcast_failures(e.failures.len());
        }
    }

    let m = metrics.clone();
    sessions.on_created(move |_| m.inc_sessions_created());

    let (weak, m) = (Arc::downgrade(sessions), metrics.clone());
    sessions.on_connected(move |session| {
        if let Some(sessions) = weak.upgrade() {
            let message = ServerMessage::SessionConnected(SessionData {
                id: session.id().to_string(),
                profile: session.profile().clone(),
                state: session.state(),
            });
            deliver(&sessions, &m, &message, Some(session.id()));
        }
    });

    let (weak, m) = (Arc::downgrade(sessions), metrics.clone());
    sessions.on_before_destroy(move |session| {
        m.inc_sessions_destroyed();
        if let Some(sessions) = weak.upgrade() {
            let message = ServerMessage::SessionDisconnected {
                id: session.id().to_string(),
            };
            deliver(&sessions, &m, &message, Some(session.id()));
        }
    });

    let (weak, m) = (Arc::downgrade(sessions), metrics.clone());
    sessions.on_host(move |session| {
        m.inc_host_elections();
        if let Some(sessions) = weak.upgrade() {
            let message = ServerMessage::ControlHost(ControlHost {
                has_host: true,
                host_id: Some(session.id().to_string()),
            });
            deliver(&sessions, &m, &message, None);
        }
    });

    let (weak, m) = (Arc::downgrade(sessions), metrics.clone());
    sessions.on_host_cleared(move |_| {
        if let Some(sessions) = weak.upgrade() {
            let message = ServerMessage::ControlHost(ControlHost {
                has_host: false,
                host_id: None,
            });
            deliver(&sessions, &m, &message, None);
        }
    });
}
