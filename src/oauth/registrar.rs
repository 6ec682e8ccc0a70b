//! Dynamic client registration (RFC 7591)
//!
//! Clients register themselves at `/register` and receive a `client_id`
//! (UUIDv4) plus, unless they declare themselves public, a random
//! `client_secret`. Registrations live in a [`ClientStore`].

use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{info, warn};
use url::Url;

use super::pkce::random_token;
use crate::config::{RedirectPolicy, RegistrationConfig};
use crate::{Error, Result};

type RegistrationLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const AUTH_METHOD_NONE: &str = "none";
const AUTH_METHOD_BASIC: &str = "client_secret_basic";
const AUTH_METHOD_POST: &str = "client_secret_post";

/// A registered client
#[derive(Clone, Serialize)]
pub struct ClientRegistration {
    /// UUIDv4
    pub client_id: String,
    /// Absent for public clients
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Registered redirect URIs (patterns under the wildcard policy)
    pub redirect_uris: Vec<String>,
    /// Display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    /// Allowed grant types
    pub grant_types: Vec<String>,
    /// Allowed response types
    pub response_types: Vec<String>,
    /// `none`, `client_secret_basic` or `client_secret_post`
    pub token_endpoint_auth_method: String,
    /// Requested scope
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Registration time
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
}

impl ClientRegistration {
    /// Public clients authenticate with PKCE only
    pub fn is_public(&self) -> bool {
        self.client_secret.is_none()
    }

    /// Whether this client may use `grant_type`
    pub fn allows_grant(&self, grant_type: &str) -> bool {
        self.grant_types.iter().any(|g| g == grant_type)
    }
}

impl fmt::Debug for ClientRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRegistration")
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .field("redirect_uris", &self.redirect_uris)
            .field("client_name", &self.client_name)
            .field("token_endpoint_auth_method", &self.token_endpoint_auth_method)
            .finish_non_exhaustive()
    }
}

/// RFC 7591 registration request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistrationRequest {
    /// Redirect URIs (at least one)
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    /// Display name
    #[serde(default)]
    pub client_name: Option<String>,
    /// Defaults to `authorization_code`
    #[serde(default)]
    pub grant_types: Vec<String>,
    /// Defaults to `code`
    #[serde(default)]
    pub response_types: Vec<String>,
    /// Defaults to `client_secret_basic`
    #[serde(default)]
    pub token_endpoint_auth_method: Option<String>,
    /// Requested scope
    #[serde(default)]
    pub scope: Option<String>,
}

/// RFC 7591 registration response
#[derive(Debug, Serialize)]
pub struct RegistrationResponse {
    /// The registered client
    #[serde(flatten)]
    pub client: ClientRegistration,
    /// Issue time (Unix seconds)
    pub client_id_issued_at: i64,
    /// `0` (never) when a secret was issued
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret_expires_at: Option<i64>,
}

impl From<ClientRegistration> for RegistrationResponse {
    fn from(client: ClientRegistration) -> Self {
        let client_secret_expires_at = client.client_secret.as_ref().map(|_| 0);
        Self {
            client_id_issued_at: client.created_at.timestamp(),
            client_secret_expires_at,
            client,
        }
    }
}

/// Storage backend for client registrations.
///
/// Implementations must be `Send + Sync` because the store is shared across
/// async tasks.
#[async_trait::async_trait]
pub trait ClientStore: Send + Sync + 'static {
    /// Insert a registration. Returns `false` if the `client_id` is taken.
    async fn insert(&self, client: ClientRegistration) -> bool;

    /// Look up a registration by `client_id`
    async fn get(&self, client_id: &str) -> Option<ClientRegistration>;

    /// Number of registered clients
    async fn len(&self) -> usize;
}

/// Process-lifetime client store
#[derive(Default)]
pub struct InMemoryClientStore {
    clients: DashMap<String, ClientRegistration>,
}

impl InMemoryClientStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ClientStore for InMemoryClientStore {
    async fn insert(&self, client: ClientRegistration) -> bool {
        match self.clients.entry(client.client_id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(client);
                true
            }
        }
    }

    async fn get(&self, client_id: &str) -> Option<ClientRegistration> {
        self.clients.get(client_id).map(|c| c.clone())
    }

    async fn len(&self) -> usize {
        self.clients.len()
    }
}

/// Validates registrations, issues credentials, and matches redirect URIs
pub struct ClientRegistrar {
    store: Arc<dyn ClientStore>,
    policy: RedirectPolicy,
    limiter: Option<RegistrationLimiter>,
}

impl ClientRegistrar {
    /// Create a registrar over `store`
    #[must_use]
    pub fn new(store: Arc<dyn ClientStore>, config: &RegistrationConfig) -> Self {
        if config.redirect_policy == RedirectPolicy::Wildcard {
            warn!(
                "Wildcard redirect URIs are enabled: registered clients may receive \
                 authorization codes at any matching address"
            );
        }
        Self {
            store,
            policy: config.redirect_policy,
            limiter: NonZeroU32::new(config.rate_limit)
                .map(|n| RateLimiter::direct(Quota::per_minute(n))),
        }
    }

    /// Register a new client
    ///
    /// # Errors
    ///
    /// Returns [`Error::RateLimited`] when throttled, or [`Error::Registration`]
    /// for unacceptable metadata.
    pub async fn register(&self, request: RegistrationRequest) -> Result<ClientRegistration> {
        if let Some(limiter) = &self.limiter {
            if limiter.check().is_err() {
                warn!("Client registration rate limit exceeded");
                return Err(Error::RateLimited);
            }
        }

        if request.redirect_uris.is_empty() {
            return Err(Error::invalid_redirect_uri(
                "at least one redirect URI is required",
            ));
        }
        for uri in &request.redirect_uris {
            self.validate_redirect_uri(uri)?;
        }

        let grant_types = or_default(request.grant_types, "authorization_code");
        if let Some(bad) = grant_types
            .iter()
            .find(|g| !matches!(g.as_str(), "authorization_code" | "refresh_token"))
        {
            return Err(Error::invalid_client_metadata(format!(
                "unsupported grant type '{bad}'"
            )));
        }

        let response_types = or_default(request.response_types, "code");
        if response_types.iter().any(|r| r != "code") {
            return Err(Error::invalid_client_metadata(
                "only the 'code' response type is supported",
            ));
        }

        let auth_method = request
            .token_endpoint_auth_method
            .unwrap_or_else(|| AUTH_METHOD_BASIC.to_string());
        let client_secret = match auth_method.as_str() {
            AUTH_METHOD_NONE => None,
            AUTH_METHOD_BASIC | AUTH_METHOD_POST => Some(random_token()),
            other => {
                return Err(Error::invalid_client_metadata(format!(
                    "unsupported token endpoint auth method '{other}'"
                )));
            }
        };

        let mut client = ClientRegistration {
            client_id: String::new(),
            client_secret,
            redirect_uris: request.redirect_uris,
            client_name: request.client_name,
            grant_types,
            response_types,
            token_endpoint_auth_method: auth_method,
            scope: request.scope,
            created_at: Utc::now(),
        };

        // A v4 collision is vanishingly rare; insert is still atomic per id
        for _ in 0..3 {
            client.client_id = uuid::Uuid::new_v4().to_string();
            if self.store.insert(client.clone()).await {
                info!(
                    client_id = %client.client_id,
                    client_name = client.client_name.as_deref().unwrap_or(""),
                    public = client.is_public(),
                    "Client registered"
                );
                return Ok(client);
            }
        }
        Err(Error::Internal("could not allocate a unique client_id".to_string()))
    }

    /// Look up a registered client
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidClient`] for unknown ids.
    pub async fn lookup(&self, client_id: &str) -> Result<ClientRegistration> {
        self.store
            .get(client_id)
            .await
            .ok_or_else(|| Error::InvalidClient("unknown client".to_string()))
    }

    /// Authenticate a client at the token endpoint. Confidential clients must
    /// present their secret; the comparison is constant-time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidClient`] for unknown clients or bad credentials.
    pub async fn authenticate(
        &self,
        client_id: &str,
        client_secret: Option<&str>,
    ) -> Result<ClientRegistration> {
        let client = self.lookup(client_id).await?;
        if let Some(expected) = &client.client_secret {
            let presented = client_secret.unwrap_or("");
            let matches: bool = presented.as_bytes().ct_eq(expected.as_bytes()).into();
            if !matches {
                warn!(client_id = %client_id, "Client authentication failed");
                return Err(Error::InvalidClient("client authentication failed".to_string()));
            }
        }
        Ok(client)
    }

    /// Pick the redirect URI for an authorization request
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if the URI is missing where required
    /// or does not match any registered URI.
    pub fn resolve_redirect(
        &self,
        client: &ClientRegistration,
        requested: Option<&str>,
    ) -> Result<String> {
        let Some(requested) = requested else {
            return match client.redirect_uris.as_slice() {
                [only] if !is_pattern(only) => Ok(only.clone()),
                _ => Err(Error::InvalidRequest("redirect_uri is required".to_string())),
            };
        };

        let matched = client.redirect_uris.iter().any(|registered| {
            registered == requested
                || match self.policy {
                    RedirectPolicy::Strict => loopback_match(registered, requested),
                    RedirectPolicy::Wildcard => wildcard_match(registered, requested),
                }
        });

        if matched {
            Ok(requested.to_string())
        } else {
            Err(Error::InvalidRequest(
                "redirect_uri does not match a registered redirect URI".to_string(),
            ))
        }
    }

    fn validate_redirect_uri(&self, uri: &str) -> Result<()> {
        if !is_pattern(uri) {
            return validate_absolute_uri(uri);
        }
        match self.policy {
            RedirectPolicy::Strict => Err(Error::invalid_redirect_uri(format!(
                "wildcards are not allowed: {uri}"
            ))),
            RedirectPolicy::Wildcard => {
                if uri == MATCH_ANY {
                    return Ok(());
                }
                let (scheme, authority, path) = split_pattern(uri).ok_or_else(|| {
                    Error::invalid_redirect_uri(format!(
                        "pattern must be http(s)://host/path: {uri}"
                    ))
                })?;
                if !matches!(scheme, "http" | "https") {
                    return Err(Error::invalid_redirect_uri(format!(
                        "scheme not allowed: {uri}"
                    )));
                }
                for part in [authority, path] {
                    glob::Pattern::new(part).map_err(|e| {
                        Error::invalid_redirect_uri(format!("invalid redirect pattern {uri}: {e}"))
                    })?;
                }
                Ok(())
            }
        }
    }
}

fn validate_absolute_uri(uri: &str) -> Result<()> {
    let parsed = Url::parse(uri)
        .map_err(|_| Error::invalid_redirect_uri(format!("not an absolute URI: {uri}")))?;
    if parsed.fragment().is_some() {
        return Err(Error::invalid_redirect_uri(format!(
            "fragments are not allowed: {uri}"
        )));
    }
    if matches!(parsed.scheme(), "javascript" | "data" | "file") {
        return Err(Error::invalid_redirect_uri(format!(
            "scheme not allowed: {uri}"
        )));
    }
    Ok(())
}

fn or_default(values: Vec<String>, default: &str) -> Vec<String> {
    if values.is_empty() {
        vec![default.to_string()]
    } else {
        values
    }
}

/// `?` and `[` also occur in plain URIs (queries, IPv6 hosts); only `*` marks a pattern
fn is_pattern(uri: &str) -> bool {
    uri.contains('*')
}

/// Registered pattern accepting any http(s) redirect URI
const MATCH_ANY: &str = "*";

/// `scheme://authority/path` of a registered pattern; the path defaults to `/`
fn split_pattern(pattern: &str) -> Option<(&str, &str, &str)> {
    let (scheme, rest) = pattern.split_once("://")?;
    let (authority, path) = match rest.find('/') {
        Some(i) => rest.split_at(i),
        None => (rest, "/"),
    };
    (!authority.is_empty()).then_some((scheme, authority, path))
}

/// Match a requested redirect URI against a registered glob, one URL
/// component at a time so `*` never spans the host and path.
fn wildcard_match(pattern: &str, requested: &str) -> bool {
    let Ok(url) = Url::parse(requested) else {
        return false;
    };
    if !matches!(url.scheme(), "http" | "https")
        || url.fragment().is_some()
        || !url.username().is_empty()
        || url.password().is_some()
    {
        return false;
    }
    if pattern == MATCH_ANY {
        return true;
    }

    let Some((scheme, authority, path)) = split_pattern(pattern) else {
        return false;
    };
    let Some(host) = url.host_str() else {
        return false;
    };
    let requested_authority = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let mut requested_path = url.path().to_string();
    if let Some(query) = url.query() {
        requested_path.push('?');
        requested_path.push_str(query);
    }

    let options = glob::MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    let glob_match = |pattern: &str, value: &str| {
        glob::Pattern::new(pattern).is_ok_and(|p| p.matches_with(value, options))
    };

    scheme.eq_ignore_ascii_case(url.scheme())
        && glob_match(&authority.to_ascii_lowercase(), &requested_authority)
        && glob_match(path, &requested_path)
}

/// Loopback redirect URIs match on any port (RFC 8252 §7.3)
fn loopback_match(registered: &str, requested: &str) -> bool {
    let (Ok(a), Ok(b)) = (Url::parse(registered), Url::parse(requested)) else {
        return false;
    };
    let is_loopback = |u: &Url| {
        matches!(
            u.host_str(),
            Some("localhost" | "127.0.0.1" | "[::1]")
        )
    };
    is_loopback(&a)
        && a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.path() == b.path()
        && a.query() == b.query()
        && b.fragment().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registrar(policy: RedirectPolicy) -> ClientRegistrar {
        ClientRegistrar::new(
            Arc::new(InMemoryClientStore::new()),
            &RegistrationConfig {
                redirect_policy: policy,
                rate_limit: 0,
            },
        )
    }

    fn request(uris: &[&str]) -> RegistrationRequest {
        RegistrationRequest {
            redirect_uris: uris.iter().map(ToString::to_string).collect(),
            client_name: Some("test client".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn zero_redirect_uris_is_rejected() {
        let err = registrar(RedirectPolicy::Strict)
            .register(request(&[]))
            .await
            .unwrap_err();
        assert_eq!(err.oauth_code(), "invalid_redirect_uri");
    }

    #[tokio::test]
    async fn confidential_client_gets_secret_with_defaults() {
        let client = registrar(RedirectPolicy::Strict)
            .register(request(&["https://app.example.com/cb"]))
            .await
            .unwrap();
        assert!(uuid::Uuid::parse_str(&client.client_id).is_ok());
        assert_eq!(client.client_secret.as_ref().map(String::len), Some(43));
        assert_eq!(client.grant_types, vec!["authorization_code"]);
        assert_eq!(client.response_types, vec!["code"]);
        assert_eq!(client.token_endpoint_auth_method, "client_secret_basic");
    }

    #[tokio::test]
    async fn public_client_gets_no_secret() {
        let mut req = request(&["http://127.0.0.1/cb"]);
        req.token_endpoint_auth_method = Some("none".to_string());
        let client = registrar(RedirectPolicy::Strict).register(req).await.unwrap();
        assert!(client.is_public());
    }

    #[tokio::test]
    async fn strict_policy_rejects_wildcards_and_fragments() {
        let r = registrar(RedirectPolicy::Strict);
        for bad in ["*", "https://*.example.com/cb", "https://app.example.com/cb#frag", "not a uri", "javascript:alert(1)"] {
            let err = r.register(request(&[bad])).await.unwrap_err();
            assert_eq!(err.oauth_code(), "invalid_redirect_uri", "{bad}");
        }
    }

    #[tokio::test]
    async fn unsupported_metadata_is_rejected() {
        let r = registrar(RedirectPolicy::Strict);
        let mut req = request(&["https://app.example.com/cb"]);
        req.grant_types = vec!["client_credentials".to_string()];
        assert_eq!(
            r.register(req).await.unwrap_err().oauth_code(),
            "invalid_client_metadata"
        );

        let mut req = request(&["https://app.example.com/cb"]);
        req.token_endpoint_auth_method = Some("private_key_jwt".to_string());
        assert_eq!(
            r.register(req).await.unwrap_err().oauth_code(),
            "invalid_client_metadata"
        );
    }

    #[tokio::test]
    async fn concurrent_registrations_get_distinct_ids() {
        let r = Arc::new(registrar(RedirectPolicy::Strict));
        let mut handles = Vec::new();
        for _ in 0..32 {
            let r = Arc::clone(&r);
            handles.push(tokio::spawn(async move {
                r.register(request(&["https://app.example.com/cb"]))
                    .await
                    .unwrap()
                    .client_id
            }));
        }
        let mut ids = std::collections::HashSet::new();
        for h in handles {
            ids.insert(h.await.unwrap());
        }
        assert_eq!(ids.len(), 32);
    }

    #[tokio::test]
    async fn registration_is_rate_limited() {
        let r = ClientRegistrar::new(
            Arc::new(InMemoryClientStore::new()),
            &RegistrationConfig {
                redirect_policy: RedirectPolicy::Strict,
                rate_limit: 2,
            },
        );
        assert!(r.register(request(&["https://a.example/cb"])).await.is_ok());
        assert!(r.register(request(&["https://a.example/cb"])).await.is_ok());
        assert!(matches!(
            r.register(request(&["https://a.example/cb"])).await,
            Err(Error::RateLimited)
        ));
    }

    #[tokio::test]
    async fn authenticate_checks_secret() {
        let r = registrar(RedirectPolicy::Strict);
        let client = r
            .register(request(&["https://app.example.com/cb"]))
            .await
            .unwrap();
        let secret = client.client_secret.clone().unwrap();

        assert!(r.authenticate(&client.client_id, Some(&secret)).await.is_ok());
        assert!(matches!(
            r.authenticate(&client.client_id, Some("wrong")).await,
            Err(Error::InvalidClient(_))
        ));
        assert!(matches!(
            r.authenticate(&client.client_id, None).await,
            Err(Error::InvalidClient(_))
        ));
        assert!(matches!(
            r.authenticate("no-such-client", Some(&secret)).await,
            Err(Error::InvalidClient(_))
        ));
    }

    #[tokio::test]
    async fn strict_redirect_matching() {
        let r = registrar(RedirectPolicy::Strict);
        let client = r
            .register(request(&["https://app.example.com/cb", "http://127.0.0.1:3000/callback"]))
            .await
            .unwrap();

        assert!(r.resolve_redirect(&client, Some("https://app.example.com/cb")).is_ok());
        // Loopback: any port
        assert_eq!(
            r.resolve_redirect(&client, Some("http://127.0.0.1:51234/callback")).unwrap(),
            "http://127.0.0.1:51234/callback"
        );
        // Loopback: path still has to match
        assert!(r.resolve_redirect(&client, Some("http://127.0.0.1:3000/other")).is_err());
        assert!(r.resolve_redirect(&client, Some("https://app.example.com/cb2")).is_err());
        assert!(r.resolve_redirect(&client, Some("https://evil.example/cb")).is_err());
        // Two registered URIs: must name one
        assert!(r.resolve_redirect(&client, None).is_err());
    }

    #[tokio::test]
    async fn single_registered_uri_is_the_default() {
        let r = registrar(RedirectPolicy::Strict);
        let client = r
            .register(request(&["https://app.example.com/cb"]))
            .await
            .unwrap();
        assert_eq!(
            r.resolve_redirect(&client, None).unwrap(),
            "https://app.example.com/cb"
        );
    }

    #[tokio::test]
    async fn wildcard_policy_uses_glob_matching() {
        let r = registrar(RedirectPolicy::Wildcard);
        let client = r
            .register(request(&["https://*.example.com/cb"]))
            .await
            .unwrap();
        assert!(r.resolve_redirect(&client, Some("https://app.example.com/cb")).is_ok());
        assert!(r.resolve_redirect(&client, Some("https://example.org/cb")).is_err());
        assert!(r.resolve_redirect(&client, None).is_err());

        let any = r.register(request(&["*"])).await.unwrap();
        assert!(r.resolve_redirect(&any, Some("http://anything.test/x")).is_ok());
    }

    #[tokio::test]
    async fn wildcard_never_crosses_into_another_host() {
        // GIVEN: a subdomain pattern
        let r = registrar(RedirectPolicy::Wildcard);
        let client = r
            .register(request(&["https://*.example.com/cb"]))
            .await
            .unwrap();

        // WHEN / THEN: URIs whose host is elsewhere are refused
        for foreign in [
            "https://attacker.test/x.example.com/cb",
            "https://attacker.test?.example.com/cb",
            "https://attacker.test#.example.com/cb",
            "https://user@app.example.com/cb",
            "http://app.example.com/cb",
            "https://app.example.com/cb/extra",
        ] {
            assert!(
                r.resolve_redirect(&client, Some(foreign)).is_err(),
                "accepted {foreign}"
            );
        }
        assert!(r.resolve_redirect(&client, Some("https://a.b.example.com/cb")).is_ok());
    }

    #[tokio::test]
    async fn wildcard_rejects_script_schemes() {
        let r = registrar(RedirectPolicy::Wildcard);
        let any = r.register(request(&["*"])).await.unwrap();

        assert!(r.resolve_redirect(&any, Some("javascript:alert(1)")).is_err());
        assert!(r.resolve_redirect(&any, Some("data:text/html,hi")).is_err());
        assert!(r.register(request(&["javascript:*"])).await.is_err());
        assert!(r.register(request(&["data:text/html,hi"])).await.is_err());
    }
}
