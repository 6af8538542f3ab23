//! Probe and control-plane authorization.
//!
//! Token issuance lives elsewhere; this side only validates bearer tokens and
//! checks the caller holds an operator role. With no secret configured every
//! protected request is denied.

pub mod jwt;
pub mod middleware;

pub use jwt::{DenyAll, JwtProbeAuthorizer, Operator, ProbeClaims};
pub use middleware::{require_operator, AuthError};

use std::sync::Arc;
use tracing::warn;

/// Decides whether a bearer token may reach protected routes
pub trait ProbeAuthorizer: Send + Sync {
    fn authorize(&self, token: &str) -> Result<Operator, AuthError>;
}

/// Build the authorizer from `PROBE_JWT_SECRET` / `PROBE_OPERATOR_ROLES`
pub fn authorizer_from_env() -> Arc<dyn ProbeAuthorizer> {
    let secret = std::env::var("PROBE_JWT_SECRET").unwrap_or_default();
    if secret.trim().is_empty() {
        warn!("PROBE_JWT_SECRET not set; protected routes will deny every request");
        return Arc::new(DenyAll);
    }

    let roles = std::env::var("PROBE_OPERATOR_ROLES")
        .ok()
        .map(|v| {
            v.split(',')
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect::<Vec<_>>()
        })
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| vec!["operator".to_string(), "admin".to_string()]);

    Arc::new(JwtProbeAuthorizer::new(secret, roles))
}
