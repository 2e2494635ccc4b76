#![forbid(unsafe_code)]

use crate::auth::types::{AuthError, Claims};
use crate::session::Profile;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(12 * 60 * 60);

pub fn create_token(identity: &str, profile: &Profile, secret: &str, ttl: Duration) -> Result<String, AuthError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| AuthError::TokenCreation("System clock error".to_string()))?;

    let claims = Claims {
        sub: identity.to_string(),
        exp: (now + ttl).as_secs() as usize,
        profile: profile.clone(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AuthError::TokenCreation(format!("JWT encode error: {e}")))
}

pub fn validate_token(token: &str, secret: &str) -> Result<Claims, AuthError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
        _ => AuthError::InvalidToken,
    })?;

    Ok(data.claims)
}

/// Resolve the identity and profile for a connecting client.
///
/// With no secret configured every client is a guest named by `name`.
/// The profile's display name falls back to the token subject.
pub fn resolve_profile(
    token: Option<&str>,
    name: Option<&str>,
    secret: Option<&str>,
) -> Result<(String, Profile), AuthError> {
    let Some(secret) = secret else {
        let name = name.filter(|n| !n.trim().is_empty()).unwrap_or("guest").trim();
        return Ok((name.to_string(), Profile::guest(name)));
    };

    let token = token.ok_or(AuthError::MissingToken)?;
    let claims = validate_token(token, secret)?;
    let mut profile = claims.profile;
    if profile.name.is_empty() {
        profile.name = claims.sub.clone();
    }
    if !profile.can_connect {
        return Err(AuthError::Forbidden("profile cannot connect"));
    }
    Ok((claims.sub, profile))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-at-least-32-bytes-long!!";

    #[test]
    fn test_create_and_validate_token() {
        let profile = Profile { is_admin: true, ..Profile::guest("Alice") };
        let token = create_token("alice", &profile, SECRET, DEFAULT_TOKEN_LIFETIME).unwrap();
        let claims = validate_token(&token, SECRET).unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.profile, profile);
    }

    #[test]
    fn test_invalid_secret_rejects() {
        let token = create_token("alice", &Profile::guest("Alice"), "secret-1", DEFAULT_TOKEN_LIFETIME).unwrap();
        let result = validate_token(&token, "secret-2");
        assert!(matches!(result, Err(AuthError::InvalidToken)));
    }

    #[test]
    fn test_garbage_token_rejects() {
        let result = validate_token("not.a.jwt", "secret");
        assert!(matches!(result, Err(AuthError::InvalidToken)));
    }

    #[test]
    fn test_resolve_without_secret_is_guest() {
        let (identity, profile) = resolve_profile(None, Some("bob"), None).unwrap();
        assert_eq!(identity, "bob");
        assert_eq!(profile.name, "bob");
        assert!(profile.can_watch);
        assert!(!profile.is_admin);

        let (identity, _) = resolve_profile(None, None, None).unwrap();
        assert_eq!(identity, "guest");
    }

    #[test]
    fn test_resolve_requires_token_when_secret_set() {
        assert!(matches!(
            resolve_profile(None, Some("bob"), Some(SECRET)),
            Err(AuthError::MissingToken)
        ));
    }

    #[test]
    fn test_resolve_fills_name_and_checks_connect() {
        let token = create_token("carol", &Profile::default(), SECRET, DEFAULT_TOKEN_LIFETIME).unwrap();
        let (identity, profile) = resolve_profile(Some(&token), None, Some(SECRET)).unwrap();
        assert_eq!(identity, "carol");
        assert_eq!(profile.name, "carol");

        let banned = Profile { can_connect: false, ..Profile::guest("Dan") };
        let token = create_token("dan", &banned, SECRET, DEFAULT_TOKEN_LIFETIME).unwrap();
        assert!(matches!(
            resolve_profile(Some(&token), None, Some(SECRET)),
            Err(AuthError::Forbidden(_))
        ));
    }
}
