//! Operator gate for protected routes

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use super::{Operator, ProbeAuthorizer};

/// Rejects the request unless the bearer token belongs to an operator.
/// On success the [`Operator`] is stored in request extensions.
pub async fn require_operator(
    State(authorizer): State<Arc<dyn ProbeAuthorizer>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let header = req
        .headers()
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingToken)?
        .to_str()
        .map_err(|_| AuthError::InvalidFormat)?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or(AuthError::InvalidFormat)?;

    let operator = authorizer.authorize(token.trim()).map_err(|e| {
        debug!(path = %req.uri().path(), reason = ?e, "authorization_denied");
        e
    })?;
    req.extensions_mut().insert(operator);

    Ok(next.run(req).await)
}

/// Extract the caller (use after `require_operator`)
pub fn extract_operator(req: &Request) -> Option<&Operator> {
    req.extensions().get::<Operator>()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    MissingToken,
    InvalidFormat,
    InvalidToken,
    /// Valid token without an operator role
    Forbidden,
    /// No signing secret configured
    NotConfigured,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            AuthError::MissingToken => "Missing authorization token",
            AuthError::InvalidFormat => "Invalid authorization format. Use: Bearer {token}",
            AuthError::InvalidToken => "Invalid or expired token",
            AuthError::Forbidden => "Operator role required",
            AuthError::NotConfigured => "Authorization is not configured",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for AuthError {}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match self {
            AuthError::Forbidden => StatusCode::FORBIDDEN,
            _ => StatusCode::UNAUTHORIZED,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
