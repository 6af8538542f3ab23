//! HS256 bearer token validation

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{AuthError, ProbeAuthorizer};

/// Claims carried by an operator token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeClaims {
    pub sub: String,
    pub role: String,
    pub exp: usize,
}

/// Caller identity after a successful check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operator {
    pub subject: String,
    pub role: String,
}

pub struct JwtProbeAuthorizer {
    secret: String,
    operator_roles: Vec<String>,
}

impl JwtProbeAuthorizer {
    pub fn new(secret: impl Into<String>, operator_roles: Vec<String>) -> Self {
        Self {
            secret: secret.into(),
            operator_roles,
        }
    }

    /// Mint a token with the same key. Used by tooling and tests.
    pub fn issue(&self, subject: &str, role: &str, ttl_secs: i64) -> anyhow::Result<String> {
        let claims = ProbeClaims {
            sub: subject.to_string(),
            role: role.to_string(),
            exp: (Utc::now().timestamp() + ttl_secs).max(0) as usize,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )?;
        Ok(token)
    }
}

impl ProbeAuthorizer for JwtProbeAuthorizer {
    fn authorize(&self, token: &str) -> Result<Operator, AuthError> {
        let decoded = decode::<ProbeClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::new(Algorithm::HS256),
        )
        .map_err(|_| AuthError::InvalidToken)?;

        let claims = decoded.claims;
        if !self
            .operator_roles
            .iter()
            .any(|r| r.eq_ignore_ascii_case(&claims.role))
        {
            return Err(AuthError::Forbidden);
        }

        debug!(subject = %claims.sub, role = %claims.role, "operator_authorized");
        Ok(Operator {
            subject: claims.sub,
            role: claims.role,
        })
    }
}

/// Authorizer used when no secret is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyAll;

impl ProbeAuthorizer for DenyAll {
    fn authorize(&self, _token: &str) -> Result<Operator, AuthError> {
        Err(AuthError::NotConfigured)
    }
}
