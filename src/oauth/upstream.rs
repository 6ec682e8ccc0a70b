//! Upstream identity provider endpoints

use reqwest::Client;
use tracing::{info, warn};

use super::metadata::OpenIdConfiguration;
use crate::config::UpstreamConfig;

/// Resolved endpoints of the upstream identity provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamEndpoints {
    /// Issuer identifier
    pub issuer: String,
    /// Where users are sent to log in
    pub authorization_endpoint: String,
    /// Code exchange and refresh
    pub token_endpoint: String,
    /// Signing keys
    pub jwks_uri: String,
}

impl UpstreamEndpoints {
    /// Endpoints from configuration alone, following the provider's path
    /// conventions for anything not overridden
    #[must_use]
    pub fn from_config(config: &UpstreamConfig) -> Self {
        let realm = config.realm_url();
        let conventional = Self {
            issuer: realm.clone(),
            authorization_endpoint: format!("{realm}/protocol/openid-connect/auth"),
            token_endpoint: format!("{realm}/protocol/openid-connect/token"),
            jwks_uri: format!("{realm}/protocol/openid-connect/certs"),
        };
        conventional.with_overrides(config)
    }

    /// Discovery document URL for the configured realm
    #[must_use]
    pub fn discovery_url(config: &UpstreamConfig) -> String {
        format!("{}/.well-known/openid-configuration", config.realm_url())
    }

    /// Resolve endpoints, consulting the provider's discovery document when
    /// enabled. Discovery failure falls back to conventions with a warning;
    /// explicit overrides always win.
    pub async fn discover(client: &Client, config: &UpstreamConfig) -> Self {
        if !config.discovery {
            return Self::from_config(config);
        }

        let url = Self::discovery_url(config);
        match OpenIdConfiguration::discover(client, &url).await {
            Ok(doc) => {
                if !doc.supports_pkce() {
                    warn!(
                        issuer = %doc.issuer,
                        "Upstream provider does not advertise S256 PKCE; continuing anyway"
                    );
                }
                let endpoints = Self {
                    issuer: doc.issuer,
                    authorization_endpoint: doc.authorization_endpoint,
                    token_endpoint: doc.token_endpoint,
                    jwks_uri: doc.jwks_uri,
                }
                .with_overrides(config);
                info!(issuer = %endpoints.issuer, "Upstream endpoints discovered");
                endpoints
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Upstream discovery failed, using conventional endpoints");
                Self::from_config(config)
            }
        }
    }

    fn with_overrides(mut self, config: &UpstreamConfig) -> Self {
        if let Some(v) = &config.issuer {
            self.issuer.clone_from(v);
        }
        if let Some(v) = &config.authorization_endpoint {
            self.authorization_endpoint.clone_from(v);
        }
        if let Some(v) = &config.token_endpoint {
            self.token_endpoint.clone_from(v);
        }
        if let Some(v) = &config.jwks_uri {
            self.jwks_uri.clone_from(v);
        }
        self
    }
}
