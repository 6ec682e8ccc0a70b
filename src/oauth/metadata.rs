//! OAuth Metadata
//!
//! Documents the proxy publishes (RFC 8414 authorization server metadata,
//! RFC 9728 protected resource metadata) and the upstream OIDC discovery
//! document it consumes. Published documents are built against the internal
//! base URL and rewritten to the request's public origin before they leave.

use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// Authorization endpoint path
pub const AUTHORIZE_PATH: &str = "/authorize";
/// Token endpoint path
pub const TOKEN_PATH: &str = "/token";
/// Registration endpoint path
pub const REGISTER_PATH: &str = "/register";
/// Upstream callback path
pub const CALLBACK_PATH: &str = "/auth/callback";
/// Published key set path
pub const JWKS_PATH: &str = "/.well-known/jwks.json";
/// Authorization server metadata path
pub const AUTHORIZATION_SERVER_METADATA_PATH: &str = "/.well-known/oauth-authorization-server";
/// OIDC discovery alias
pub const OPENID_CONFIGURATION_PATH: &str = "/.well-known/openid-configuration";
/// Protected resource metadata path prefix
pub const PROTECTED_RESOURCE_METADATA_PATH: &str = "/.well-known/oauth-protected-resource";

/// OAuth Authorization Server Metadata (RFC 8414)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    /// Authorization server issuer URL
    pub issuer: String,

    /// Authorization endpoint URL
    pub authorization_endpoint: String,

    /// Token endpoint URL
    pub token_endpoint: String,

    /// Dynamic client registration endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,

    /// Signing key set URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,

    /// Supported response types
    #[serde(default)]
    pub response_types_supported: Vec<String>,

    /// Supported grant types
    #[serde(default)]
    pub grant_types_supported: Vec<String>,

    /// Supported token endpoint auth methods
    #[serde(default)]
    pub token_endpoint_auth_methods_supported: Vec<String>,

    /// Supported PKCE code challenge methods
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,

    /// Supported scopes (may be string or array due to implementation bugs)
    #[serde(default, deserialize_with = "deserialize_scopes")]
    pub scopes_supported: Vec<String>,

    /// Resources this server issues tokens for (RFC 9728 §4)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub protected_resources: Vec<String>,
}

impl AuthorizationServerMetadata {
    /// Metadata for this proxy, with every URL under `base`
    #[must_use]
    pub fn for_proxy(base: &str, resource_path: &str, scopes: &[String]) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            issuer: base.to_string(),
            authorization_endpoint: format!("{base}{AUTHORIZE_PATH}"),
            token_endpoint: format!("{base}{TOKEN_PATH}"),
            registration_endpoint: Some(format!("{base}{REGISTER_PATH}")),
            jwks_uri: Some(format!("{base}{JWKS_PATH}")),
            response_types_supported: vec!["code".to_string()],
            grant_types_supported: vec![
                "authorization_code".to_string(),
                "refresh_token".to_string(),
            ],
            token_endpoint_auth_methods_supported: vec![
                "client_secret_basic".to_string(),
                "client_secret_post".to_string(),
                "none".to_string(),
            ],
            code_challenge_methods_supported: vec!["S256".to_string()],
            scopes_supported: scopes.to_vec(),
            protected_resources: vec![format!("{base}{resource_path}")],
        }
    }

    /// Check if PKCE is supported (S256 method)
    #[must_use]
    pub fn supports_pkce(&self) -> bool {
        self.code_challenge_methods_supported
            .iter()
            .any(|m| m == "S256")
    }
}

/// OAuth Protected Resource Metadata (RFC 9728)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectedResourceMetadata {
    /// Protected resource identifier
    pub resource: String,

    /// Authorization servers that can issue tokens for this resource
    #[serde(default)]
    pub authorization_servers: Vec<String>,

    /// Supported scopes (may be string or array due to implementation bugs)
    #[serde(default, deserialize_with = "deserialize_scopes")]
    pub scopes_supported: Vec<String>,

    /// Supported bearer token methods
    #[serde(default)]
    pub bearer_methods_supported: Vec<String>,
}

impl ProtectedResourceMetadata {
    /// Metadata for the resource at `resource_path`, served by this proxy at `base`
    #[must_use]
    pub fn for_resource(base: &str, resource_path: &str, scopes: &[String]) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            resource: format!("{base}{resource_path}"),
            authorization_servers: vec![base.to_string()],
            scopes_supported: scopes.to_vec(),
            bearer_methods_supported: vec!["header".to_string()],
        }
    }
}

/// Path at which the metadata for `resource_path` is published
#[must_use]
pub fn resource_metadata_path(resource_path: &str) -> String {
    format!("{PROTECTED_RESOURCE_METADATA_PATH}{resource_path}")
}

/// Upstream OpenID Provider configuration (the subset the proxy consumes)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenIdConfiguration {
    /// Issuer identifier
    pub issuer: String,

    /// Authorization endpoint URL
    pub authorization_endpoint: String,

    /// Token endpoint URL
    pub token_endpoint: String,

    /// Signing key set URL
    pub jwks_uri: String,

    /// Supported PKCE code challenge methods
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,

    /// Supported scopes
    #[serde(default, deserialize_with = "deserialize_scopes")]
    pub scopes_supported: Vec<String>,
}

impl OpenIdConfiguration {
    /// Fetch an OpenID Provider configuration document
    ///
    /// # Errors
    ///
    /// Returns [`Error::UpstreamUnavailable`] if the document is unreachable
    /// or not valid provider metadata.
    pub async fn discover(client: &Client, url: &str) -> Result<Self> {
        debug!(url = %url, "Discovering upstream OpenID configuration");

        let response = client.get(url).send().await.map_err(|e| {
            Error::UpstreamUnavailable(format!("Failed to fetch OpenID configuration: {e}"))
        })?;

        if !response.status().is_success() {
            return Err(Error::UpstreamUnavailable(format!(
                "OpenID configuration discovery failed: HTTP {}",
                response.status()
            )));
        }

        let config: Self = response.json().await.map_err(|e| {
            Error::UpstreamUnavailable(format!("Failed to parse OpenID configuration: {e}"))
        })?;

        debug!(issuer = %config.issuer, "Discovered upstream provider");
        Ok(config)
    }

    /// Check if PKCE is supported (S256 method)
    #[must_use]
    pub fn supports_pkce(&self) -> bool {
        self.code_challenge_methods_supported
            .iter()
            .any(|m| m == "S256")
    }
}

/// Deserialize scopes that may be either a string or array
/// Some providers return `"read write"` instead of `["read", "write"]`
fn deserialize_scopes<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrVec {
        String(String),
        Vec(Vec<String>),
    }

    match StringOrVec::deserialize(deserializer)? {
        StringOrVec::String(s) => Ok(s.split_whitespace().map(String::from).collect()),
        StringOrVec::Vec(v) => Ok(v),
    }
}
