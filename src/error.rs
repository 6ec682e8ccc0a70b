//! Error types for the OAuth origin proxy

use std::io;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Result type alias for the proxy
pub type Result<T> = std::result::Result<T, Error>;

/// Proxy errors
///
/// Every variant maps onto an RFC 6749 error response via [`IntoResponse`].
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Identity provider unreachable, timed out, or answering with a gateway error
    #[error("Upstream identity provider unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Authorization code expired, already consumed, or rejected by the provider
    #[error("Invalid authorization code: {0}")]
    InvalidAuthorizationCode(String),

    /// Bearer token rejected. Carries no detail on purpose.
    #[error("Invalid token")]
    TokenValidation,

    /// Client registration rejected (caller-supplied metadata)
    #[error("Registration rejected: {message}")]
    Registration {
        /// RFC 7591 error code
        code: &'static str,
        /// Human-readable reason
        message: String,
    },

    /// Authorization session evicted or never existed
    #[error("Authorization session expired or unknown")]
    SessionExpired,

    /// Malformed protocol request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Unknown client or bad client credentials
    #[error("Invalid client: {0}")]
    InvalidClient(String),

    /// Grant type not supported by this proxy
    #[error("Unsupported grant type: {0}")]
    UnsupportedGrantType(String),

    /// Too many requests
    #[error("Rate limit exceeded")]
    RateLimited,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a missing or malformed redirect URI at registration
    pub fn invalid_redirect_uri(message: impl Into<String>) -> Self {
        Self::Registration {
            code: "invalid_redirect_uri",
            message: message.into(),
        }
    }

    /// Shorthand for unacceptable client metadata at registration
    pub fn invalid_client_metadata(message: impl Into<String>) -> Self {
        Self::Registration {
            code: "invalid_client_metadata",
            message: message.into(),
        }
    }

    /// RFC 6749 / RFC 7591 `error` code for this failure
    #[must_use]
    pub fn oauth_code(&self) -> &'static str {
        match self {
            Self::UpstreamUnavailable(_) => "temporarily_unavailable",
            Self::InvalidAuthorizationCode(_) => "invalid_grant",
            Self::TokenValidation => "invalid_token",
            Self::Registration { code, .. } => *code,
            Self::SessionExpired | Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidClient(_) => "invalid_client",
            Self::UnsupportedGrantType(_) => "unsupported_grant_type",
            Self::RateLimited => "slow_down",
            _ => "server_error",
        }
    }

    /// HTTP status for this failure
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::TokenValidation | Self::InvalidClient(_) => StatusCode::UNAUTHORIZED,
            Self::InvalidAuthorizationCode(_)
            | Self::Registration { .. }
            | Self::SessionExpired
            | Self::InvalidRequest(_)
            | Self::UnsupportedGrantType(_) => StatusCode::BAD_REQUEST,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Description safe to return to the caller, if any
    fn public_description(&self) -> Option<String> {
        match self {
            // Uniform 401: never reveal which check failed
            Self::TokenValidation => None,
            // Internal detail stays in the logs
            Self::Config(_) | Self::Io(_) | Self::Json(_) | Self::Http(_) | Self::Internal(_) => {
                Some("internal error".to_string())
            }
            Self::Registration { message, .. } => Some(message.clone()),
            other => Some(other.to_string()),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, "Request rejected");
        }

        let body = match self.public_description() {
            Some(description) => json!({
                "error": self.oauth_code(),
                "error_description": description,
            }),
            None => json!({ "error": self.oauth_code() }),
        };

        let mut response = (status, Json(body)).into_response();
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        if matches!(status, StatusCode::TOO_MANY_REQUESTS) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("60"));
        }
        response
    }
}
