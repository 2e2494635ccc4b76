#![forbid(unsafe_code)]

// Auth - JWT profile resolution and capability guards for session commands

pub mod types;
pub mod jwt;

pub use types::{AuthError, Claims};

use crate::session::{PluginValue, Session};

pub fn admins_only(session: &Session) -> Result<(), AuthError> {
    if !session.is_admin() {
        return Err(AuthError::Forbidden("session is not admin"));
    }
    Ok(())
}

pub fn hosts_only(session: &Session) -> Result<(), AuthError> {
    if !session.is_host() {
        return Err(AuthError::Forbidden("session is not the host"));
    }
    Ok(())
}

pub fn hosts_or_admins_only(session: &Session) -> Result<(), AuthError> {
    if !session.is_host() && !session.is_admin() {
        return Err(AuthError::Forbidden("session is not the host or an admin"));
    }
    Ok(())
}

pub fn can_watch_only(session: &Session) -> Result<(), AuthError> {
    if !session.profile().can_watch {
        return Err(AuthError::Forbidden("session cannot watch"));
    }
    Ok(())
}

/// Hosting additionally requires private mode to be off.
pub fn can_host_only(session: &Session, private_mode: bool) -> Result<(), AuthError> {
    if !session.profile().can_host {
        return Err(AuthError::Forbidden("session cannot host"));
    }
    if private_mode {
        return Err(AuthError::PrivateMode);
    }
    Ok(())
}

pub fn can_access_clipboard_only(session: &Session) -> Result<(), AuthError> {
    if !session.profile().can_access_clipboard {
        return Err(AuthError::Forbidden("session cannot access clipboard"));
    }
    Ok(())
}

pub fn plugin_only(session: &Session, key: &str, expected: &PluginValue) -> Result<(), AuthError> {
    session.profile().check_plugin(key, expected)?;
    Ok(())
}
