//! Token exchange against the upstream provider
//!
//! The `redirect_uri` sent with the code must be byte-identical to the one
//! sent upstream at `/authorize`. It is therefore taken from the session,
//! never from the request that happens to carry the code.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::token::TokenSet;
use crate::config::UpstreamConfig;
use crate::retry::{RetryPolicy, with_retry};
use crate::{Error, Result};

/// An upstream authorization code ready for exchange
#[derive(Debug, Clone)]
pub struct CodeGrant {
    /// Code issued by the upstream provider
    pub code: String,
    /// `redirect_uri` used when the code was requested
    pub redirect_uri: String,
    /// The proxy's PKCE verifier for the upstream leg
    pub code_verifier: String,
}

/// Upstream token endpoint operations
#[async_trait::async_trait]
pub trait TokenExchange: Send + Sync + 'static {
    /// Exchange an upstream authorization code for tokens
    async fn exchange_code(&self, grant: &CodeGrant) -> Result<TokenSet>;

    /// Redeem a refresh token
    async fn refresh(&self, refresh_token: &str, scope: Option<&str>) -> Result<TokenSet>;
}

/// OAuth error body returned by the provider
#[derive(Debug, Default, Deserialize)]
struct UpstreamError {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// [`TokenExchange`] over HTTP with bounded retries
pub struct UpstreamTokenExchange {
    http: Client,
    token_endpoint: String,
    client_id: String,
    client_secret: Option<String>,
    retry: RetryPolicy,
}

impl UpstreamTokenExchange {
    /// Create an exchange against `token_endpoint`
    #[must_use]
    pub fn new(
        http: Client,
        token_endpoint: impl Into<String>,
        upstream: &UpstreamConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            http,
            token_endpoint: token_endpoint.into(),
            client_id: upstream.client_id.clone(),
            client_secret: upstream.client_secret.clone(),
            retry,
        }
    }

    /// HTTP client for upstream calls, with the configured timeout
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the client cannot be built.
    pub fn http_client(timeout: Duration) -> Result<Client> {
        Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))
    }

    async fn post_form(&self, operation: &str, params: &[(&str, &str)]) -> Result<TokenSet> {
        let mut form: Vec<(&str, &str)> = params.to_vec();
        form.push(("client_id", self.client_id.as_str()));
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        with_retry(&self.retry, operation, || self.post_once(&form)).await
    }

    async fn post_once(&self, form: &[(&str, &str)]) -> Result<TokenSet> {
        let response = self
            .http
            .post(&self.token_endpoint)
            .form(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    Error::UpstreamUnavailable(e.to_string())
                } else {
                    Error::Http(e)
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<TokenSet>().await?);
        }

        if matches!(
            status,
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
        ) {
            return Err(Error::UpstreamUnavailable(format!(
                "token endpoint returned HTTP {status}"
            )));
        }

        let body: UpstreamError = response.json().await.unwrap_or_default();
        if status.is_client_error() {
            warn!(
                status = %status,
                error = %body.error,
                description = body.error_description.as_deref().unwrap_or(""),
                "Upstream rejected token request"
            );
            let code = if body.error.is_empty() {
                "invalid_grant"
            } else {
                body.error.as_str()
            };
            return Err(Error::InvalidAuthorizationCode(format!(
                "upstream rejected the grant: {code}"
            )));
        }

        Err(Error::Internal(format!(
            "token endpoint returned HTTP {status}"
        )))
    }
}

#[async_trait::async_trait]
impl TokenExchange for UpstreamTokenExchange {
    async fn exchange_code(&self, grant: &CodeGrant) -> Result<TokenSet> {
        debug!(redirect_uri = %grant.redirect_uri, "Exchanging authorization code upstream");
        let tokens = self
            .post_form(
                "exchange_code",
                &[
                    ("grant_type", "authorization_code"),
                    ("code", grant.code.as_str()),
                    ("redirect_uri", grant.redirect_uri.as_str()),
                    ("code_verifier", grant.code_verifier.as_str()),
                ],
            )
            .await?;
        info!("Authorization code exchanged");
        Ok(tokens)
    }

    async fn refresh(&self, refresh_token: &str, scope: Option<&str>) -> Result<TokenSet> {
        let mut params = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        if let Some(scope) = scope {
            params.push(("scope", scope));
        }
        let tokens = self.post_form("refresh_token", &params).await?;
        info!("Refresh token redeemed");
        Ok(tokens)
    }
}
