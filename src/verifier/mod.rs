//! Bearer token verification
//!
//! # Verification order
//!
//! 1. Structure: three segments, decodable header, `kid` present, algorithm
//!    on the asymmetric allow-list.
//! 2. Signature, with the key selected by `kid` from the [`JwksCache`].
//! 3. `exp` (required) and `nbf` (if present), with leeway.
//! 4. Audience contains one of the expected values.
//! 5. Required scopes.
//! 6. Issuer, only under [`IssuerPolicy::Strict`].
//!
//! Every failure surfaces as [`Error::TokenValidation`]; the reason is only
//! logged at debug level.

mod jwks;

pub use jwks::{JwksCache, JwksError};

use std::collections::HashSet;

use jsonwebtoken::{Algorithm, Validation};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::config::{Config, IssuerPolicy};
use crate::{Error, Result};

/// Algorithms accepted on bearer tokens
const ALLOWED_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
    Algorithm::ES256,
    Algorithm::ES384,
];

/// Verified view of a bearer token
#[derive(Debug, Clone, Serialize)]
pub struct VerifiedToken {
    /// `sub` claim
    pub subject: String,
    /// `aud` claim, normalized to a list
    pub audience: Vec<String>,
    /// Granted scopes (`scope` or `scp`)
    pub scopes: Vec<String>,
    /// `iss` claim
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    /// `iat` claim (Unix seconds)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<i64>,
    /// `exp` claim (Unix seconds)
    pub expires_at: i64,
    /// All claims as received
    #[serde(skip)]
    pub claims: Map<String, Value>,
}

/// Why a token was rejected. Logged, never returned to the caller.
#[derive(Debug, Error)]
enum Rejection {
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("token header has no kid")]
    MissingKeyId,
    #[error("algorithm {0:?} is not allowed")]
    AlgorithmNotAllowed(Algorithm),
    #[error("signing key unavailable: {0}")]
    Key(#[from] JwksError),
    #[error("signature invalid: {0}")]
    Signature(jsonwebtoken::errors::Error),
    #[error("missing claim: {0}")]
    MissingClaim(&'static str),
    #[error("token expired")]
    Expired,
    #[error("token not yet valid")]
    NotYetValid,
    #[error("audience mismatch")]
    Audience,
    #[error("missing required scope: {0}")]
    MissingScope(String),
    #[error("issuer not accepted: {0}")]
    Issuer(String),
}

/// Verifies bearer tokens issued by the upstream provider
pub struct TokenVerifier {
    jwks: JwksCache,
    audiences: Vec<String>,
    issuer_policy: IssuerPolicy,
    issuers: Vec<String>,
    required_scopes: Vec<String>,
    leeway: u64,
}

impl TokenVerifier {
    /// Build a verifier from configuration. `upstream_issuer` is the accepted
    /// issuer under the strict policy when none are configured.
    #[must_use]
    pub fn new(config: &Config, jwks: JwksCache, upstream_issuer: &str) -> Self {
        let issuers = if config.verifier.issuers.is_empty() {
            vec![upstream_issuer.to_string()]
        } else {
            config.verifier.issuers.clone()
        };
        Self {
            jwks,
            audiences: config.expected_audiences(),
            issuer_policy: config.verifier.issuer_policy,
            issuers,
            required_scopes: config.verifier.required_scopes.clone(),
            leeway: config.verifier.leeway.as_secs(),
        }
    }

    /// Key cache backing this verifier
    pub fn jwks(&self) -> &JwksCache {
        &self.jwks
    }

    /// Verify a bearer token
    ///
    /// # Errors
    ///
    /// Returns [`Error::TokenValidation`] on any failure.
    pub async fn verify(&self, token: &str) -> Result<VerifiedToken> {
        self.check(token).await.map_err(|reason| {
            debug!(reason = %reason, "Bearer token rejected");
            Error::TokenValidation
        })
    }

    async fn check(&self, token: &str) -> std::result::Result<VerifiedToken, Rejection> {
        // 1. Structure
        if token.split('.').count() != 3 {
            return Err(Rejection::Malformed("expected three segments".to_string()));
        }
        let header =
            jsonwebtoken::decode_header(token).map_err(|e| Rejection::Malformed(e.to_string()))?;
        let kid = header.kid.as_deref().ok_or(Rejection::MissingKeyId)?;
        if !ALLOWED_ALGORITHMS.contains(&header.alg) {
            return Err(Rejection::AlgorithmNotAllowed(header.alg));
        }

        // 2. Signature only; claims are checked below in a fixed order
        let key = self.jwks.get_key(kid).await?;
        let claims = jsonwebtoken::decode::<Map<String, Value>>(
            token,
            &key,
            &signature_only(header.alg),
        )
        .map_err(Rejection::Signature)?
        .claims;

        // 3. Time
        let now = chrono::Utc::now().timestamp();
        let leeway = i64::try_from(self.leeway).unwrap_or(i64::MAX);
        let expires_at = numeric_claim(&claims, "exp").ok_or(Rejection::MissingClaim("exp"))?;
        if expires_at.saturating_add(leeway) <= now {
            return Err(Rejection::Expired);
        }
        if let Some(nbf) = numeric_claim(&claims, "nbf") {
            if nbf > now.saturating_add(leeway) {
                return Err(Rejection::NotYetValid);
            }
        }

        // 4. Audience
        let audience = string_list(claims.get("aud"));
        if !audience.iter().any(|a| self.audiences.contains(a)) {
            return Err(Rejection::Audience);
        }

        // 5. Scopes
        let scopes = token_scopes(&claims);
        if let Some(missing) = self
            .required_scopes
            .iter()
            .find(|s| !scopes.contains(*s))
        {
            return Err(Rejection::MissingScope(missing.clone()));
        }

        // 6. Issuer
        let issuer = claims.get("iss").and_then(Value::as_str).map(String::from);
        if self.issuer_policy == IssuerPolicy::Strict {
            match &issuer {
                Some(iss) if self.issuers.contains(iss) => {}
                other => return Err(Rejection::Issuer(other.clone().unwrap_or_default())),
            }
        }

        let subject = claims
            .get("sub")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or(Rejection::MissingClaim("sub"))?;

        Ok(VerifiedToken {
            subject,
            audience,
            scopes,
            issuer,
            issued_at: numeric_claim(&claims, "iat"),
            expires_at,
            claims,
        })
    }
}

/// Validation that checks the signature and nothing else
fn signature_only(alg: Algorithm) -> Validation {
    let mut v = Validation::new(alg);
    v.validate_exp = false;
    v.validate_nbf = false;
    v.validate_aud = false;
    v.required_spec_claims = HashSet::new();
    v
}

#[allow(clippy::cast_possible_truncation)]
fn numeric_claim(claims: &Map<String, Value>, name: &str) -> Option<i64> {
    let value = claims.get(name)?;
    value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))
}

/// A claim that may be a single string or an array of strings
fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

/// `scope` (space-separated) or `scp` (array)
fn token_scopes(claims: &Map<String, Value>) -> Vec<String> {
    match claims.get("scope") {
        Some(Value::String(s)) => s.split_whitespace().map(String::from).collect(),
        _ => string_list(claims.get("scp")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn claims(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn string_list_accepts_string_or_array() {
        assert_eq!(string_list(Some(&json!("a"))), vec!["a"]);
        assert_eq!(string_list(Some(&json!(["a", "b", 3]))), vec!["a", "b"]);
        assert!(string_list(Some(&json!(42))).is_empty());
        assert!(string_list(None).is_empty());
    }

    #[test]
    fn scopes_from_scope_or_scp() {
        assert_eq!(
            token_scopes(&claims(json!({"scope": "openid mcp:tools"}))),
            vec!["openid", "mcp:tools"]
        );
        assert_eq!(token_scopes(&claims(json!({"scp": ["read"]}))), vec!["read"]);
        assert!(token_scopes(&claims(json!({}))).is_empty());
    }

    #[test]
    fn numeric_claim_accepts_float_timestamps() {
        let c = claims(json!({"exp": 1_700_000_000, "iat": 1_699_999_000.5}));
        assert_eq!(numeric_claim(&c, "exp"), Some(1_700_000_000));
        assert_eq!(numeric_claim(&c, "iat"), Some(1_699_999_000));
        assert_eq!(numeric_claim(&c, "nbf"), None);
    }

    #[test]
    fn symmetric_algorithms_are_not_allowed() {
        assert!(!ALLOWED_ALGORITHMS.contains(&Algorithm::HS256));
        assert!(ALLOWED_ALGORITHMS.contains(&Algorithm::RS256));
    }
}
