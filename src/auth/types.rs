#![forbid(unsafe_code)]

use crate::session::{PluginPermissionError, Profile};
use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid token")]
    InvalidToken,

    #[error("Missing authorization")]
    MissingToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Token creation failed: {0}")]
    TokenCreation(String),

    #[error("Forbidden: {0}")]
    Forbidden(&'static str),

    #[error("Private mode is enabled")]
    PrivateMode,

    #[error(transparent)]
    Plugin(#[from] PluginPermissionError),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid token".to_string()),
            AuthError::MissingToken => (StatusCode::UNAUTHORIZED, "Missing authorization".to_string()),
            AuthError::TokenExpired => (StatusCode::UNAUTHORIZED, "Token expired".to_string()),
            AuthError::TokenCreation(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Token error".to_string()),
            AuthError::Forbidden(_) | AuthError::PrivateMode => (StatusCode::FORBIDDEN, self.to_string()),
            AuthError::Plugin(e) => (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Token claims: the identity plus the resolved permission profile
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    #[serde(default)]
    pub profile: Profile,
}
