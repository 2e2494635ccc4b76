#![forbid(unsafe_code)]

// Registry transition hooks. Listeners run synchronously in registration order;
// a panicking listener is logged and skipped so the rest still run.

use super::Session;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock as StdRwLock};
use tracing::error;

pub type Listener = Arc<dyn Fn(&Arc<Session>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    Created,
    Connected,
    Host,
    HostCleared,
    BeforeDestroy,
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Created => "created",
            SessionEvent::Connected => "connected",
            SessionEvent::Host => "host",
            SessionEvent::HostCleared => "host_cleared",
            SessionEvent::BeforeDestroy => "before_destroy",
        }
    }
}

#[derive(Default)]
pub(crate) struct Hooks {
    listeners: StdRwLock<HashMap<SessionEvent, Vec<Listener>>>,
}

impl Hooks {
    pub(crate) fn register(&self, event: SessionEvent, listener: Listener) {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.entry(event).or_default().push(listener);
    }

    /// Invoke every listener for `event`. The list is copied first so listeners
    /// may register more listeners or call back into the registry.
    pub(crate) fn emit(&self, event: SessionEvent, session: &Arc<Session>) {
        let snapshot: Vec<Listener> = {
            let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
            match listeners.get(&event) {
                Some(list) => list.clone(),
                None => return,
            }
        };

        for (index, listener) in snapshot.iter().enumerate() {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(session))) {
                error!(
                    "Listener #{} for {} hook panicked on session {}: {}",
                    index,
                    event.name(),
                    session.id(),
                    panic_message(panic.as_ref())
                );
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
