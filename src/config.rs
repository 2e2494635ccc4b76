#![forbid(unsafe_code)]

// Server configuration loaded from environment variables.
// Secrets are redacted in Debug output.

use crate::desktop::{ScreenConfiguration, ScreenSize};
use crate::turn::TurnConfig;
use std::collections::HashMap;
use std::env;
use std::fmt;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
pub const DEFAULT_VIDEO_IDS: &str = "hd,hq,lq";
pub const DEFAULT_SCREEN_SIZE: &str = "1280x720@30";
pub const DEFAULT_SCREEN_CONFIGURATIONS: &str = "1920x1080@60|30,1280x720@60|30,1024x768@60";
pub const DEFAULT_STUN_URLS: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_TURN_TTL_SECS: u64 = 86_400;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: '{value}'")]
    InvalidValue { name: &'static str, value: String },

    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("Invalid screen size in {name}: {source}")]
    InvalidScreen {
        name: &'static str,
        #[source]
        source: crate::desktop::ScreenSizeParseError,
    },
}

#[derive(Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub max_connections: usize,
    /// Unset disables authentication; every client gets the guest profile
    pub jwt_secret: Option<String>,
    pub metrics_token: Option<String>,
    pub implicit_hosting: bool,
    pub private_mode: bool,
    pub screencast_enabled: bool,
    pub video_ids: Vec<String>,
    pub screen_size: ScreenSize,
    pub screen_configurations: Vec<ScreenConfiguration>,
    pub broadcast_url: Option<String>,
    pub stun_urls: Vec<String>,
    pub turn: Option<TurnConfig>,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("port", &self.port)
            .field("max_connections", &self.max_connections)
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "[REDACTED]"))
            .field("metrics_token", &self.metrics_token.as_ref().map(|_| "[REDACTED]"))
            .field("implicit_hosting", &self.implicit_hosting)
            .field("private_mode", &self.private_mode)
            .field("screencast_enabled", &self.screencast_enabled)
            .field("video_ids", &self.video_ids)
            .field("screen_size", &self.screen_size)
            .field("screen_configurations", &self.screen_configurations)
            .field("broadcast_url", &self.broadcast_url)
            .field("stun_urls", &self.stun_urls)
            .field("turn_urls", &self.turn.as_ref().map(|t| &t.urls))
            .finish()
    }
}

fn parse_bool(vars: &HashMap<String, String>, name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match vars.get(name).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue { name, value: v.clone() }),
        },
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn non_empty(vars: &HashMap<String, String>, name: &str) -> Option<String> {
    vars.get(name).filter(|v| !v.trim().is_empty()).cloned()
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    /// Returns `ConfigError` for malformed values
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let port = match vars.get("PORT") {
            Some(v) => v.parse().map_err(|_| ConfigError::InvalidValue {
                name: "PORT",
                value: v.clone(),
            })?,
            None => DEFAULT_PORT,
        };

        let mut max_connections = match vars.get("MAX_CONNECTIONS") {
            Some(v) => v.parse().map_err(|_| ConfigError::InvalidValue {
                name: "MAX_CONNECTIONS",
                value: v.clone(),
            })?,
            None => DEFAULT_MAX_CONNECTIONS,
        };
        if max_connections == 0 {
            warn!("MAX_CONNECTIONS=0 would reject all connections, using default {}", DEFAULT_MAX_CONNECTIONS);
            max_connections = DEFAULT_MAX_CONNECTIONS;
        }

        let video_ids = parse_list(vars.get("VIDEO_IDS").map_or(DEFAULT_VIDEO_IDS, String::as_str));
        if video_ids.is_empty() {
            return Err(ConfigError::Empty("VIDEO_IDS"));
        }

        let screen_size: ScreenSize = vars
            .get("SCREEN_SIZE")
            .map_or(DEFAULT_SCREEN_SIZE, String::as_str)
            .parse()
            .map_err(|source| ConfigError::InvalidScreen { name: "SCREEN_SIZE", source })?;

        let screen_configurations = parse_list(
            vars.get("SCREEN_CONFIGURATIONS")
                .map_or(DEFAULT_SCREEN_CONFIGURATIONS, String::as_str),
        )
        .iter()
        .map(|c| c.parse::<ScreenConfiguration>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| ConfigError::InvalidScreen {
            name: "SCREEN_CONFIGURATIONS",
            source,
        })?;

        let stun_urls = parse_list(vars.get("STUN_URLS").map_or(DEFAULT_STUN_URLS, String::as_str));

        let turn = match (non_empty(vars, "TURN_URLS"), non_empty(vars, "TURN_SECRET")) {
            (Some(urls), Some(secret)) => {
                let ttl_secs = match vars.get("TURN_TTL") {
                    Some(v) => v.parse().map_err(|_| ConfigError::InvalidValue {
                        name: "TURN_TTL",
                        value: v.clone(),
                    })?,
                    None => DEFAULT_TURN_TTL_SECS,
                };
                Some(TurnConfig {
                    urls: parse_list(&urls),
                    secret,
                    ttl_secs,
                })
            }
            (Some(_), None) => {
                warn!("TURN_URLS set without TURN_SECRET, TURN disabled");
                None
            }
            _ => None,
        };

        Ok(Self {
            port,
            max_connections,
            jwt_secret: non_empty(vars, "JWT_SECRET"),
            metrics_token: non_empty(vars, "METRICS_TOKEN"),
            implicit_hosting: parse_bool(vars, "IMPLICIT_HOSTING", true)?,
            private_mode: parse_bool(vars, "PRIVATE_MODE", false)?,
            screencast_enabled: parse_bool(vars, "SCREENCAST_ENABLED", false)?,
            video_ids,
            screen_size,
            screen_configurations,
            broadcast_url: non_empty(vars, "BROADCAST_URL"),
            stun_urls,
            turn,
        })
    }
}
