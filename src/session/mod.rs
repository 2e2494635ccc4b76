#![forbid(unsafe_code)]

// Session module - connected sessions, host arbitration and fan-out delivery

pub mod hooks;
pub mod member;
pub mod types;

pub use hooks::{Listener, SessionEvent};
pub use member::{Member, PluginPermissionError, PluginValue, Profile};
pub use types::{BroadcastError, DeliveryError, SessionError, SessionResult};

use crate::media::PeerHandle;
use crate::signaling::protocol::{ServerMessage, SessionStateView};
use hooks::Hooks;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, RwLock as StdRwLock};
use tracing::{debug, info, warn};

/// Outbound side of one client's connection.
///
/// `send` never blocks: a full buffer is reported as `DeliveryError::Full`
/// and the payload is dropped.
pub trait SessionTransport: Send + Sync {
    fn send(&self, payload: Arc<String>) -> Result<(), DeliveryError>;

    /// Ask the connection to shut down after telling the client why.
    fn close(&self, reason: &str);

    fn is_closed(&self) -> bool;

    fn remote_addr(&self) -> Option<String>;
}

#[derive(Debug, Default, Clone, Copy)]
struct Flags {
    host: bool,
    muted: bool,
    connected: bool,
    destroying: bool,
}

/// One connected identity's runtime state
pub struct Session {
    id: String,
    profile: Profile,
    flags: StdRwLock<Flags>,
    transport: StdRwLock<Option<Arc<dyn SessionTransport>>>,
    peer: StdRwLock<Option<Arc<PeerHandle>>>,
}

impl Session {
    fn new(id: String, profile: Profile, transport: Arc<dyn SessionTransport>) -> Self {
        Self {
            id,
            profile,
            flags: StdRwLock::new(Flags::default()),
            transport: StdRwLock::new(Some(transport)),
            peer: StdRwLock::new(None),
        }
    }

    fn flags(&self) -> Flags {
        *self.flags.read().unwrap_or_else(|e| e.into_inner())
    }

    fn update_flags(&self, f: impl FnOnce(&mut Flags)) {
        let mut flags = self.flags.write().unwrap_or_else(|e| e.into_inner());
        f(&mut flags);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.profile.name
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn is_admin(&self) -> bool {
        self.profile.is_admin
    }

    pub fn is_host(&self) -> bool {
        self.flags().host
    }

    pub fn is_muted(&self) -> bool {
        self.flags().muted
    }

    pub fn is_connected(&self) -> bool {
        self.flags().connected
    }

    pub fn is_watching(&self) -> bool {
        self.peer().is_some()
    }

    fn is_live(&self) -> bool {
        !self.flags().destroying
    }

    /// True once `destroy` has claimed the session.
    pub fn is_destroyed(&self) -> bool {
        self.flags().destroying
    }

    pub fn set_muted(&self, muted: bool) {
        self.update_flags(|f| f.muted = muted);
    }

    pub fn member(&self) -> Member {
        Member {
            id: self.id.clone(),
            name: self.profile.name.clone(),
            admin: self.profile.is_admin,
            muted: self.is_muted(),
        }
    }

    pub fn state(&self) -> SessionStateView {
        let flags = self.flags();
        SessionStateView {
            is_connected: flags.connected,
            is_watching: self.is_watching(),
            is_host: flags.host,
            is_muted: flags.muted,
        }
    }

    /// Remote endpoint of the attached transport, for diagnostics.
    pub fn address(&self) -> Option<String> {
        self.transport().and_then(|t| t.remote_addr())
    }

    fn transport(&self) -> Option<Arc<dyn SessionTransport>> {
        self.transport.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Attach a new transport. A previous one is closed, never shared.
    pub fn set_transport(&self, transport: Arc<dyn SessionTransport>) {
        let old = {
            let mut slot = self.transport.write().unwrap_or_else(|e| e.into_inner());
            slot.replace(transport)
        };
        if let Some(old) = old {
            old.close("connection replaced");
        }
    }

    pub fn peer(&self) -> Option<Arc<PeerHandle>> {
        self.peer.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Store a new media peer handle, returning the one it replaces.
    pub fn set_peer(&self, peer: Option<Arc<PeerHandle>>) -> Option<Arc<PeerHandle>> {
        let mut slot = self.peer.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *slot, peer)
    }

    pub fn take_peer(&self) -> Option<Arc<PeerHandle>> {
        self.set_peer(None)
    }

    /// Serialize and deliver a message to this client only.
    pub fn send(&self, message: &ServerMessage) -> SessionResult<()> {
        let json = Arc::new(serde_json::to_string(message)?);
        self.send_raw(json)
    }

    pub fn send_raw(&self, json: Arc<String>) -> SessionResult<()> {
        let transport = self.transport().ok_or_else(|| SessionError::Closed(self.id.clone()))?;
        transport.send(json).map_err(|e| match e {
            DeliveryError::Closed => SessionError::Closed(self.id.clone()),
            DeliveryError::Full => SessionError::Full(self.id.clone()),
        })
    }

    pub fn disconnect(&self, reason: &str) {
        if let Some(transport) = self.transport() {
            transport.close(reason);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.profile.name)
            .field("flags", &self.flags())
            .finish()
    }
}

/// Registry-wide behaviour switches
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// The first can-host watcher is elected host without asking
    pub implicit_hosting: bool,
    /// Hosting is disabled for everyone
    pub private_mode: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            implicit_hosting: true,
            private_mode: false,
        }
    }
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<String, Arc<Session>>,
    /// Insertion order for deterministic listing
    order: Vec<String>,
    host_id: Option<String>,
}

impl Registry {
    fn live(&self, id: &str) -> Option<&Arc<Session>> {
        self.sessions.get(id).filter(|s| s.is_live())
    }

    fn ordered(&self) -> impl Iterator<Item = &Arc<Session>> {
        self.order.iter().filter_map(|id| self.sessions.get(id))
    }
}

/// Owns every session and the single host slot.
///
/// All membership and host mutations happen under one std::sync::RwLock that is
/// never held across an await point or while listeners run. Hooks fire after
/// the lock is released, so listeners may call back into the manager.
///
/// Host transitions additionally hold `host_order` from the state change until
/// their hook has run, so `host`/`hostCleared` listeners observe transitions in
/// the order they were applied. Those listeners must not change the host
/// themselves.
pub struct SessionManager {
    registry: StdRwLock<Registry>,
    host_order: StdMutex<()>,
    hooks: Hooks,
    settings: SessionSettings,
}

impl SessionManager {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            registry: StdRwLock::new(Registry::default()),
            host_order: StdMutex::new(()),
            hooks: Hooks::default(),
            settings,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Taken before the registry lock and held through the host hook.
    fn host_order(&self) -> MutexGuard<'_, ()> {
        self.host_order.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn implicit_hosting(&self) -> bool {
        self.settings.implicit_hosting
    }

    pub fn private_mode(&self) -> bool {
        self.settings.private_mode
    }

    /// Register a new, not yet connected session.
    ///
    /// # Errors
    /// Returns `AlreadyExists` if `id` denotes a session still in the registry
    pub fn create(
        &self,
        id: impl Into<String>,
        profile: Profile,
        transport: Arc<dyn SessionTransport>,
    ) -> SessionResult<Arc<Session>> {
        let id = id.into();
        let session = {
            let mut registry = self.write();
            if registry.sessions.contains_key(&id) {
                return Err(SessionError::AlreadyExists(id));
            }
            let session = Arc::new(Session::new(id.clone(), profile, transport));
            registry.sessions.insert(id.clone(), session.clone());
            registry.order.push(id);
            session
        };

        info!("Session {} ({}) created", session.id(), session.name());
        self.hooks.emit(SessionEvent::Created, &session);
        Ok(session)
    }

    /// Mark the transport handshake as finished. Returns false (and fires nothing)
    /// if the session was already connected or is no longer registered.
    pub fn mark_connected(&self, session: &Arc<Session>) -> bool {
        let transitioned = {
            let registry = self.read();
            match registry.live(session.id()) {
                Some(current) if Arc::ptr_eq(current, session) => {
                    let mut flags = session.flags.write().unwrap_or_else(|e| e.into_inner());
                    if flags.connected {
                        false
                    } else {
                        flags.connected = true;
                        true
                    }
                }
                _ => false,
            }
        };

        if transitioned {
            debug!("Session {} connected", session.id());
            self.hooks.emit(SessionEvent::Connected, session);
        }
        transitioned
    }

    pub fn has_host(&self) -> bool {
        self.get_host().is_some()
    }

    pub fn get_host(&self) -> Option<Arc<Session>> {
        let registry = self.read();
        registry
            .host_id
            .as_deref()
            .and_then(|id| registry.live(id))
            .filter(|s| s.is_connected())
            .cloned()
    }

    /// Make `id` the host, clearing the previous host's flag in the same step.
    /// Only `host(new)` fires; re-electing the current host is a no-op.
    ///
    /// # Errors
    /// Returns `NotFound` if `id` is not a live session
    pub fn set_host(&self, id: &str) -> SessionResult<()> {
        self.elect(id, false).map(|_| ())
    }

    /// Elect `id` only when nobody currently holds host. Check and set happen
    /// under one lock acquisition. Returns whether `id` is host afterwards.
    ///
    /// # Errors
    /// Returns `NotFound` if `id` is not a live session
    pub fn set_host_if_vacant(&self, id: &str) -> SessionResult<bool> {
        self.elect(id, true)
    }

    fn elect(&self, id: &str, only_if_vacant: bool) -> SessionResult<bool> {
        let _order = self.host_order();
        let elected = {
            let mut registry = self.write();
            let session = registry
                .live(id)
                .cloned()
                .ok_or_else(|| SessionError::NotFound(id.to_string()))?;

            let occupied = registry
                .host_id
                .as_deref()
                .and_then(|h| registry.live(h))
                .is_some_and(|h| h.is_connected());

            if registry.host_id.as_deref() == Some(id) {
                None
            } else if only_if_vacant && occupied {
                return Ok(false);
            } else {
                if let Some(previous) = registry.host_id.take() {
                    if let Some(old) = registry.sessions.get(&previous) {
                        old.update_flags(|f| f.host = false);
                    }
                }
                session.update_flags(|f| f.host = true);
                registry.host_id = Some(id.to_string());
                Some(session)
            }
        };

        if let Some(session) = elected {
            info!("Session {} is now host", session.id());
            self.hooks.emit(SessionEvent::Host, &session);
        }
        Ok(true)
    }

    pub fn clear_host(&self) {
        self.clear_host_matching(None);
    }

    /// Clear host only if `id` currently holds it. Returns whether it did.
    pub fn release_host(&self, id: &str) -> bool {
        self.clear_host_matching(Some(id))
    }

    fn clear_host_matching(&self, id: Option<&str>) -> bool {
        let _order = self.host_order();
        let cleared = {
            let mut registry = self.write();
            if id.is_some() && registry.host_id.as_deref() != id {
                return false;
            }
            let session = registry
                .host_id
                .take()
                .and_then(|id| registry.sessions.get(&id).cloned());
            if let Some(session) = &session {
                session.update_flags(|f| f.host = false);
            }
            session
        };

        let Some(session) = cleared else {
            return false;
        };
        info!("Host {} cleared", session.id());
        self.hooks.emit(SessionEvent::HostCleared, &session);
        true
    }

    pub fn has(&self, id: &str) -> bool {
        self.read().sessions.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.read().sessions.get(id).cloned()
    }

    /// Every registered session, connected or not, in insertion order
    pub fn list(&self) -> Vec<Arc<Session>> {
        self.read().ordered().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.read().sessions.len()
    }

    pub fn members(&self) -> Vec<Member> {
        self.read()
            .ordered()
            .filter(|s| s.is_connected())
            .map(|s| s.member())
            .collect()
    }

    pub fn admins(&self) -> Vec<Member> {
        self.read()
            .ordered()
            .filter(|s| s.is_connected() && s.is_admin())
            .map(|s| s.member())
            .collect()
    }

    /// Remove a session, closing its transport and releasing its media peer.
    ///
    /// # Errors
    /// Returns `NotFound` if the session is absent or already being destroyed
    pub async fn destroy(&self, id: &str) -> SessionResult<()> {
        self.destroy_with_reason(id, "session destroyed").await
    }

    pub async fn destroy_with_reason(&self, id: &str, reason: &str) -> SessionResult<()> {
        // Claim the session first so a concurrent destroy of the same id fails
        // instead of firing hooks twice.
        let session = {
            let registry = self.write();
            let session = registry
                .live(id)
                .cloned()
                .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
            session.update_flags(|f| f.destroying = true);
            session
        };

        self.hooks.emit(SessionEvent::BeforeDestroy, &session);

        {
            let _order = self.host_order();
            let was_host = {
                let mut registry = self.write();
                registry.sessions.remove(id);
                registry.order.retain(|other| other != id);
                if registry.host_id.as_deref() == Some(id) {
                    registry.host_id = None;
                    true
                } else {
                    false
                }
            };

            if was_host {
                session.update_flags(|f| f.host = false);
                info!("Host {} cleared by destroy", id);
                self.hooks.emit(SessionEvent::HostCleared, &session);
            }
        }

        session.update_flags(|f| f.connected = false);
        session.disconnect(reason);

        if let Some(peer) = session.take_peer() {
            peer.close().await;
        }

        info!("Session {} destroyed: {}", id, reason);
        Ok(())
    }

    /// Deliver `message` to every connected session except `exclude`.
    ///
    /// Recipients are snapshotted under the lock and written to outside it. A
    /// failed recipient never stops delivery to the others and is not destroyed.
    pub fn broadcast(&self, message: &ServerMessage, exclude: Option<&str>) -> Result<(), BroadcastError> {
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize broadcast message: {}", e);
                return Ok(());
            }
        };

        let recipients: Vec<Arc<Session>> = self
            .read()
            .ordered()
            .filter(|s| s.is_connected() && s.is_live() && Some(s.id()) != exclude)
            .cloned()
            .collect();

        let attempted = recipients.len();
        let mut failures = Vec::new();
        for session in recipients {
            if let Err(e) = session.send_raw(json.clone()) {
                match &e {
                    SessionError::Full(_) => {
                        warn!("Channel full for session {}, dropping broadcast", session.id());
                    }
                    _ => {
                        debug!("Broadcast to session {} failed: {}", session.id(), e);
                    }
                }
                failures.push((session.id().to_string(), e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BroadcastError { attempted, failures })
        }
    }

    /// Destroy every session, firing the usual hooks.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.read().order.clone();
        for id in ids {
            if let Err(e) = self.destroy_with_reason(&id, "server shutdown").await {
                debug!("Session {} already gone during shutdown: {}", id, e);
            }
        }
    }

    pub fn on_created(&self, listener: impl Fn(&Arc<Session>) + Send + Sync + 'static) {
        self.hooks.register(SessionEvent::Created, Arc::new(listener));
    }

    pub fn on_connected(&self, listener: impl Fn(&Arc<Session>) + Send + Sync + 'static) {
        self.hooks.register(SessionEvent::Connected, Arc::new(listener));
    }

    pub fn on_host(&self, listener: impl Fn(&Arc<Session>) + Send + Sync + 'static) {
        self.hooks.register(SessionEvent::Host, Arc::new(listener));
    }

    pub fn on_host_cleared(&self, listener: impl Fn(&Arc<Session>) + Send + Sync + 'static) {
        self.hooks.register(SessionEvent::HostCleared, Arc::new(listener));
    }

    pub fn on_before_destroy(&self, listener: impl Fn(&Arc<Session>) + Send + Sync + 'static) {
        self.hooks.register(SessionEvent::BeforeDestroy, Arc::new(listener));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::testing::{FakeEngine, RecordingTransport};
    use crate::media::MediaEngine;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn manager() -> Arc<SessionManager> {
        Arc::new(SessionManager::new(SessionSettings::default()))
    }

    fn admin_profile(name: &str) -> Profile {
        Profile {
            is_admin: true,
            ..Profile::guest(name)
        }
    }

    fn connect(manager: &SessionManager, id: &str, profile: Profile) -> (Arc<Session>, Arc<RecordingTransport>) {
        let transport = RecordingTransport::new();
        let session = manager.create(id, profile, transport.clone()).unwrap();
        assert!(manager.mark_connected(&session));
        (session, transport)
    }

    fn record(manager: &SessionManager) -> Arc<Mutex<Vec<String>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        manager.on_host(move |s| l.lock().unwrap().push(format!("host:{}", s.id())));
        let l = log.clone();
        manager.on_host_cleared(move |s| l.lock().unwrap().push(format!("cleared:{}", s.id())));
        let l = log.clone();
        manager.on_before_destroy(move |s| l.lock().unwrap().push(format!("destroy:{}", s.id())));
        log
    }

    #[test]
    fn test_create_rejects_live_duplicate() {
        let manager = manager();
        manager.create("a", Profile::guest("A"), RecordingTransport::new()).unwrap();
        let result = manager.create("a", Profile::guest("A2"), RecordingTransport::new());
        assert!(matches!(result, Err(SessionError::AlreadyExists(_))));
    }

    #[test]
    fn test_created_session_is_not_connected() {
        let manager = manager();
        let session = manager.create("a", Profile::guest("A"), RecordingTransport::new()).unwrap();
        assert!(!session.is_connected());
        assert!(manager.has("a"));
        assert!(manager.members().is_empty());
    }

    #[test]
    fn test_connected_hook_fires_once() {
        let manager = manager();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        manager.on_connected(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        let session = manager.create("a", Profile::guest("A"), RecordingTransport::new()).unwrap();
        assert!(manager.mark_connected(&session));
        assert!(!manager.mark_connected(&session));
        assert!(!manager.mark_connected(&session));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mark_connected_after_destroy_is_noop() {
        let manager = manager();
        let session = manager.create("a", Profile::guest("A"), RecordingTransport::new()).unwrap();
        manager.destroy("a").await.unwrap();
        assert!(!manager.mark_connected(&session));
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_host_scenario() {
        let manager = manager();
        let (a, _) = connect(&manager, "A", admin_profile("Alice"));
        let (b, _) = connect(&manager, "B", Profile::guest("Bob"));
        let log = record(&manager);

        manager.set_host("A").unwrap();
        assert_eq!(manager.get_host().unwrap().id(), "A");

        manager.set_host("B").unwrap();
        assert_eq!(manager.get_host().unwrap().id(), "B");
        assert!(!a.is_host());
        assert!(b.is_host());

        manager.destroy("B").await.unwrap();
        assert!(!manager.has_host());
        assert!(manager.get_host().is_none());

        assert_eq!(
            *log.lock().unwrap(),
            vec!["host:A", "host:B", "destroy:B", "cleared:B"]
        );
    }

    #[test]
    fn test_set_host_unknown_is_not_found() {
        let manager = manager();
        assert!(matches!(manager.set_host("ghost"), Err(SessionError::NotFound(_))));
        assert!(!manager.has_host());
    }

    #[test]
    fn test_reelecting_same_host_fires_nothing() {
        let manager = manager();
        connect(&manager, "A", Profile::guest("A"));
        let log = record(&manager);

        manager.set_host("A").unwrap();
        manager.set_host("A").unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["host:A"]);
    }

    #[test]
    fn test_clear_host() {
        let manager = manager();
        let (a, _) = connect(&manager, "A", Profile::guest("A"));
        let log = record(&manager);

        manager.clear_host();
        assert!(log.lock().unwrap().is_empty());

        manager.set_host("A").unwrap();
        manager.clear_host();
        assert!(!a.is_host());
        assert!(!manager.has_host());
        assert_eq!(*log.lock().unwrap(), vec!["host:A", "cleared:A"]);
    }

    #[test]
    fn test_host_not_connected_is_not_reported() {
        let manager = manager();
        manager.create("A", Profile::guest("A"), RecordingTransport::new()).unwrap();
        manager.set_host("A").unwrap();
        assert!(!manager.has_host());
    }

    #[tokio::test]
    async fn test_destroy_visibility() {
        let manager = manager();
        let (_a, transport) = connect(&manager, "A", Profile::guest("A"));
        connect(&manager, "B", Profile::guest("B"));

        manager.destroy("A").await.unwrap();
        assert!(!manager.has("A"));
        assert!(manager.members().iter().all(|m| m.id != "A"));
        assert_eq!(transport.closed_with().as_deref(), Some("session destroyed"));
        assert!(matches!(manager.destroy("A").await, Err(SessionError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_before_destroy_sees_session_present() {
        let manager = manager();
        connect(&manager, "A", Profile::guest("A"));

        let observed = Arc::new(Mutex::new(None));
        let o = observed.clone();
        let weak = Arc::downgrade(&manager);
        manager.on_before_destroy(move |s| {
            let manager = weak.upgrade().unwrap();
            *o.lock().unwrap() = Some((manager.has(s.id()), manager.get(s.id()).is_some()));
        });

        manager.destroy("A").await.unwrap();
        assert_eq!(*observed.lock().unwrap(), Some((true, true)));
    }

    #[tokio::test]
    async fn test_concurrent_destroy_fires_once() {
        let manager = manager();
        connect(&manager, "A", Profile::guest("A"));
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        manager.on_before_destroy(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = manager.clone();
                tokio::spawn(async move { m.destroy("A").await.is_ok() })
            })
            .collect();

        let mut succeeded = 0;
        for handle in handles {
            if handle.await.unwrap() {
                succeeded += 1;
            }
        }
        assert_eq!(succeeded, 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_destroy_releases_peer() {
        let manager = manager();
        let (session, _) = connect(&manager, "A", Profile::guest("A"));
        let engine = FakeEngine::new(&["hd"]);
        let (peer, _) = engine.create_peer("A", "hd").await.unwrap();
        session.set_peer(Some(Arc::new(PeerHandle::offered(peer, "hd"))));

        manager.destroy("A").await.unwrap();
        assert!(engine.peer(0).is_closed());
        assert!(session.peer().is_none());
    }

    #[tokio::test]
    async fn test_single_host_under_concurrency() {
        let manager = manager();
        for i in 0..10 {
            connect(&manager, &format!("s{i}"), Profile::guest("x"));
        }

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let m = manager.clone();
                tokio::spawn(async move {
                    for round in 0..20 {
                        let target = format!("s{}", (i + round) % 10);
                        let _ = m.set_host(&target);
                        if round % 7 == 0 {
                            m.clear_host();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let hosts = manager.list().iter().filter(|s| s.is_host()).count();
        assert!(hosts <= 1);
        assert_eq!(hosts == 1, manager.has_host());
    }

    #[test]
    fn test_broadcast_isolates_failures() {
        let manager = manager();
        let mut transports = Vec::new();
        for i in 0..5 {
            let transport = if i == 2 {
                RecordingTransport::failing()
            } else {
                RecordingTransport::new()
            };
            let session = manager.create(format!("s{i}"), Profile::guest("x"), transport.clone()).unwrap();
            manager.mark_connected(&session);
            transports.push(transport);
        }

        let message = ServerMessage::SystemError { message: "hello".into() };
        let err = manager.broadcast(&message, None).unwrap_err();
        assert_eq!(err.attempted, 5);
        assert_eq!(err.failed_ids().collect::<Vec<_>>(), vec!["s2"]);

        for (i, transport) in transports.iter().enumerate() {
            if i != 2 {
                assert_eq!(transport.events(), vec!["system/error"]);
            }
        }
        assert!(manager.has("s2"));
    }

    #[test]
    fn test_broadcast_excludes_and_skips_unconnected() {
        let manager = manager();
        let (_a, ta) = connect(&manager, "A", Profile::guest("A"));
        let (_b, tb) = connect(&manager, "B", Profile::guest("B"));
        let tc = RecordingTransport::new();
        manager.create("C", Profile::guest("C"), tc.clone()).unwrap();

        manager
            .broadcast(&ServerMessage::SystemError { message: "x".into() }, Some("A"))
            .unwrap();
        assert!(ta.events().is_empty());
        assert_eq!(tb.events().len(), 1);
        assert!(tc.events().is_empty());
    }

    #[test]
    fn test_members_and_admins_in_insertion_order() {
        let manager = manager();
        connect(&manager, "c", Profile::guest("Carol"));
        connect(&manager, "a", admin_profile("Alice"));
        connect(&manager, "b", admin_profile("Bob"));

        let members: Vec<_> = manager.members().into_iter().map(|m| m.id).collect();
        assert_eq!(members, vec!["c", "a", "b"]);
        let admins: Vec<_> = manager.admins().into_iter().map(|m| m.id).collect();
        assert_eq!(admins, vec!["a", "b"]);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let manager = manager();
        let fired = Arc::new(AtomicUsize::new(0));
        manager.on_created(|_| panic!("listener bug"));
        let f = fired.clone();
        manager.on_created(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        let session = manager.create("a", Profile::guest("A"), RecordingTransport::new()).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(manager.mark_connected(&session));
        assert_eq!(manager.members().len(), 1);
    }

    #[test]
    fn test_set_transport_closes_previous() {
        let manager = manager();
        let first = RecordingTransport::new();
        let session = manager.create("a", Profile::guest("A"), first.clone()).unwrap();
        let second = RecordingTransport::new();
        session.set_transport(second.clone());

        assert_eq!(first.closed_with().as_deref(), Some("connection replaced"));
        session.send(&ServerMessage::SystemError { message: "x".into() }).unwrap();
        assert_eq!(second.events(), vec!["system/error"]);
        assert!(first.events().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_destroys_everyone() {
        let manager = manager();
        connect(&manager, "A", Profile::guest("A"));
        connect(&manager, "B", Profile::guest("B"));
        manager.set_host("A").unwrap();
        let log = record(&manager);

        manager.shutdown().await;
        assert_eq!(manager.count(), 0);
        assert!(!manager.has_host());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["destroy:A", "cleared:A", "destroy:B"]
        );
    }

    #[test]
    fn test_set_host_if_vacant() {
        let manager = manager();
        connect(&manager, "A", Profile::guest("A"));
        connect(&manager, "B", Profile::guest("B"));
        let log = record(&manager);

        assert!(manager.set_host_if_vacant("A").unwrap());
        assert!(!manager.set_host_if_vacant("B").unwrap());
        assert!(manager.set_host_if_vacant("A").unwrap());
        assert_eq!(manager.get_host().unwrap().id(), "A");
        assert_eq!(*log.lock().unwrap(), vec!["host:A"]);
    }

    #[test]
    fn test_host_hooks_follow_transition_order() {
        use std::sync::mpsc;
        use std::time::Duration;

        let manager = manager();
        connect(&manager, "A", Profile::guest("A"));
        connect(&manager, "B", Profile::guest("B"));

        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let announced = Arc::new(Mutex::new(Vec::new()));
        let seen = announced.clone();
        manager.on_host(move |s| {
            if s.id() == "A" {
                entered_tx.send(()).unwrap();
                release_rx.lock().unwrap().recv().unwrap();
            }
            seen.lock().unwrap().push(s.id().to_string());
        });

        let m = manager.clone();
        let first = std::thread::spawn(move || m.set_host("A").unwrap());
        entered_rx.recv().unwrap();

        let m = manager.clone();
        let second = std::thread::spawn(move || m.set_host("B").unwrap());
        std::thread::sleep(Duration::from_millis(50));
        release_tx.send(()).unwrap();
        first.join().unwrap();
        second.join().unwrap();

        assert_eq!(*announced.lock().unwrap(), vec!["A", "B"]);
        assert_eq!(manager.get_host().unwrap().id(), "B");
    }

    #[test]
    fn test_clear_racing_election_ends_consistent() {
        let manager = manager();
        connect(&manager, "A", Profile::guest("A"));
        let log = record(&manager);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let m = manager.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        if i % 2 == 0 {
                            m.set_host("A").unwrap();
                        } else {
                            m.clear_host();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let last = log.lock().unwrap().last().cloned();
        match last.as_deref() {
            Some("host:A") => assert!(manager.has_host()),
            Some("cleared:A") => assert!(!manager.has_host()),
            other => panic!("unexpected hook sequence end: {other:?}"),
        }
    }

    #[test]
    fn test_release_host_only_by_holder() {
        let manager = manager();
        connect(&manager, "A", Profile::guest("A"));
        connect(&manager, "B", Profile::guest("B"));
        manager.set_host("A").unwrap();

        assert!(!manager.release_host("B"));
        assert!(manager.has_host());
        assert!(manager.release_host("A"));
        assert!(!manager.has_host());
        assert!(!manager.release_host("A"));
    }
}
