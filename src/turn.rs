#![forbid(unsafe_code)]

// ICE servers handed to clients in signal/provide: static STUN entries plus
// coturn time-limited TURN credentials (TURN REST API, --use-auth-secret).

use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::error;

type HmacSha1 = Hmac<Sha1>;

/// TURN server configuration
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// TURN server URLs (e.g. ["turn:example.com:3478", "turns:example.com:5349"])
    pub urls: Vec<String>,
    /// Shared secret for generating time-limited credentials
    pub secret: String,
    /// Credential TTL in seconds (default: 24h)
    pub ttl_secs: u64,
}

/// ICE server entry sent to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl TurnConfig {
    /// Generate time-limited credentials for a session.
    ///
    /// coturn format: username = "expiry_timestamp:arbitrary_id"
    ///               credential = base64(HMAC-SHA1(secret, username))
    pub fn generate_credentials(&self, session_id: &str) -> Option<IceServer> {
        let expiry = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            + self.ttl_secs;

        let username = format!("{expiry}:{session_id}");

        let mut mac = match HmacSha1::new_from_slice(self.secret.as_bytes()) {
            Ok(mac) => mac,
            Err(e) => {
                error!("Failed to key TURN credential HMAC: {}", e);
                return None;
            }
        };
        mac.update(username.as_bytes());
        let credential = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        Some(IceServer {
            urls: self.urls.clone(),
            username: Some(username),
            credential: Some(credential),
        })
    }
}

/// Builds the per-session ICE server list
#[derive(Debug, Clone, Default)]
pub struct IceServerProvider {
    stun_urls: Vec<String>,
    turn: Option<TurnConfig>,
}

impl IceServerProvider {
    pub fn new(stun_urls: Vec<String>, turn: Option<TurnConfig>) -> Self {
        Self { stun_urls, turn }
    }

    pub fn stun_urls(&self) -> &[String] {
        &self.stun_urls
    }

    pub fn ice_servers(&self, session_id: &str) -> Vec<IceServer> {
        let mut servers = Vec::new();
        if !self.stun_urls.is_empty() {
            servers.push(IceServer {
                urls: self.stun_urls.clone(),
                username: None,
                credential: None,
            });
        }
        if let Some(turn) = self.turn.as_ref().and_then(|t| t.generate_credentials(session_id)) {
            servers.push(turn);
        }
        servers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn() -> TurnConfig {
        TurnConfig {
            urls: vec!["turn:turn.example.com:3478".into()],
            secret: "s3cret".into(),
            ttl_secs: 3600,
        }
    }

    #[test]
    fn test_credentials_match_coturn_scheme() {
        let server = turn().generate_credentials("alice-1234abcd").unwrap();
        let username = server.username.unwrap();
        let (expiry, id) = username.split_once(':').unwrap();
        assert_eq!(id, "alice-1234abcd");
        assert!(expiry.parse::<u64>().unwrap() > 3600);

        let mut mac = HmacSha1::new_from_slice(b"s3cret").unwrap();
        mac.update(username.as_bytes());
        let expected = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
        assert_eq!(server.credential.unwrap(), expected);
    }

    #[test]
    fn test_provider_lists_stun_then_turn() {
        let provider = IceServerProvider::new(vec!["stun:stun.example.com:19302".into()], Some(turn()));
        let servers = provider.ice_servers("s1");
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.example.com:19302"]);
        assert!(servers[0].username.is_none());
        assert!(servers[1].credential.is_some());
    }

    #[test]
    fn test_stun_only_serialization() {
        let provider = IceServerProvider::new(vec!["stun:a".into()], None);
        let json = serde_json::to_value(provider.ice_servers("s1")).unwrap();
        assert_eq!(json, serde_json::json!([{ "urls": ["stun:a"] }]));
    }
}
