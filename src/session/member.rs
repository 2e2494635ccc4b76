#![forbid(unsafe_code)]

// Public member view and the resolved permission profile attached to every session

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Snapshot of a session as other clients see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    #[serde(rename = "displayname")]
    pub name: String,
    pub admin: bool,
    pub muted: bool,
}

/// Value of a plugin-specific permission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PluginValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl PluginValue {
    fn type_name(&self) -> &'static str {
        match self {
            PluginValue::Bool(_) => "bool",
            PluginValue::Int(_) => "int",
            PluginValue::Str(_) => "string",
        }
    }

    fn same_type(&self, other: &PluginValue) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PluginPermissionError {
    #[error("missing plugin permission: {key}={expected}")]
    Missing { key: String, expected: &'static str },

    #[error("invalid plugin permission type: {key}={found} expected {expected}")]
    WrongType {
        key: String,
        found: &'static str,
        expected: &'static str,
    },

    #[error("wrong plugin permission value for {key}")]
    WrongValue { key: String },
}

/// Capability flags resolved by the authorization layer. Read-only for the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Profile {
    pub name: String,
    pub is_admin: bool,
    pub can_login: bool,
    pub can_connect: bool,
    pub can_watch: bool,
    pub can_host: bool,
    pub can_share_media: bool,
    pub can_access_clipboard: bool,
    pub sends_inactive_cursor: bool,
    pub can_see_inactive_cursors: bool,
    pub plugins: HashMap<String, PluginValue>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            name: String::new(),
            is_admin: false,
            can_login: true,
            can_connect: true,
            can_watch: true,
            can_host: true,
            can_share_media: true,
            can_access_clipboard: true,
            sends_inactive_cursor: true,
            can_see_inactive_cursors: true,
            plugins: HashMap::new(),
        }
    }
}

impl Profile {
    /// Profile for a named guest when authentication is disabled.
    pub fn guest(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Lookup `key`, check it holds the same variant as `expected`, then compare.
    pub fn check_plugin(&self, key: &str, expected: &PluginValue) -> Result<(), PluginPermissionError> {
        let value = self.plugins.get(key).ok_or_else(|| PluginPermissionError::Missing {
            key: key.to_string(),
            expected: expected.type_name(),
        })?;

        if !value.same_type(expected) {
            return Err(PluginPermissionError::WrongType {
                key: key.to_string(),
                found: value.type_name(),
                expected: expected.type_name(),
            });
        }

        if value != expected {
            return Err(PluginPermissionError::WrongValue { key: key.to_string() });
        }

        Ok(())
    }
}
