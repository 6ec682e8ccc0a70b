//! Configuration management
//!
//! Sources, later ones win:
//!
//! 1. Built-in defaults
//! 2. YAML file (`--config`)
//! 3. `OAUTH_PROXY_*` environment variables (`__` separates nesting)
//! 4. The identity provider's conventional variables (`KEYCLOAK_URL`,
//!    `KEYCLOAK_REALM`, `KEYCLOAK_CLIENT_ID`, `KEYCLOAK_CLIENT_SECRET`)

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable prefix for nested configuration keys
pub const ENV_PREFIX: &str = "OAUTH_PROXY_";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before resolving secrets.
    /// Paths support ~ expansion. Missing files are skipped.
    pub env_files: Vec<String>,
    /// Listener configuration
    pub server: ServerConfig,
    /// Public origin resolution
    pub origin: OriginConfig,
    /// Upstream identity provider
    pub upstream: UpstreamConfig,
    /// Bearer token verification
    pub verifier: VerifierConfig,
    /// Signing key cache
    pub jwks: JwksConfig,
    /// Dynamic client registration
    pub registration: RegistrationConfig,
    /// Authorization session lifetimes
    pub sessions: SessionConfig,
    /// Retry policy for upstream calls
    pub retry: RetryConfig,
    /// Protected resource served behind the proxy
    pub resource: ResourceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env_files: vec![".env".to_string()],
            server: ServerConfig::default(),
            origin: OriginConfig::default(),
            upstream: UpstreamConfig::default(),
            verifier: VerifierConfig::default(),
            jwks: JwksConfig::default(),
            registration: RegistrationConfig::default(),
            sessions: SessionConfig::default(),
            retry: RetryConfig::default(),
            resource: ResourceConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // Env files must land in the process environment before figment reads it
        load_env_files(&Self::default().env_files);

        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .merge(keycloak_env());

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        load_env_files(&config.env_files);
        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Expand `${VAR}` / `${VAR:-default}` and `env:VAR` in secret-bearing fields
    fn expand_env_vars(&mut self) {
        let re = env_pattern();

        self.upstream.base_url = expand_string(&re, &self.upstream.base_url);
        self.upstream.client_id = expand_string(&re, &self.upstream.client_id);
        self.upstream.client_secret = self
            .upstream
            .client_secret
            .as_deref()
            .map(|s| resolve_secret(&expand_string(&re, s)))
            .filter(|s| !s.is_empty());

        if let Some(url) = self.resource.backend_url.as_mut() {
            *url = expand_string(&re, url);
        }
    }

    /// Reject configurations the proxy cannot serve correctly
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.upstream.base_url)
            .map_err(|e| Error::Config(format!("upstream.base_url is not a URL: {e}")))?;
        url::Url::parse(&self.origin.internal_base_url)
            .map_err(|e| Error::Config(format!("origin.internal_base_url is not a URL: {e}")))?;

        if self.upstream.client_id.is_empty() {
            return Err(Error::Config("upstream.client_id must be set".to_string()));
        }
        if !self.resource.path.starts_with('/') || self.resource.path.len() < 2 {
            return Err(Error::Config(format!(
                "resource.path must be an absolute, non-root path, got '{}'",
                self.resource.path
            )));
        }
        if !matches!(self.origin.observed_scheme.as_str(), "http" | "https") {
            return Err(Error::Config(format!(
                "origin.observed_scheme must be http or https, got '{}'",
                self.origin.observed_scheme
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Audiences a bearer token must carry (defaults to the upstream client id)
    #[must_use]
    pub fn expected_audiences(&self) -> Vec<String> {
        if self.verifier.audiences.is_empty() {
            vec![self.upstream.client_id.clone()]
        } else {
            self.verifier.audiences.clone()
        }
    }

    /// Copy of this configuration with secrets replaced, for display
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.upstream.client_secret.is_some() {
            copy.upstream.client_secret = Some("<redacted>".to_string());
        }
        copy
    }
}

/// Map the identity provider's conventional variables onto `upstream.*`
fn keycloak_env() -> Env {
    Env::raw()
        .only(&[
            "KEYCLOAK_URL",
            "KEYCLOAK_REALM",
            "KEYCLOAK_CLIENT_ID",
            "KEYCLOAK_CLIENT_SECRET",
        ])
        .map(|key| {
            let mapped = match key.as_str().to_ascii_uppercase().as_str() {
                "KEYCLOAK_URL" => "upstream.base_url",
                "KEYCLOAK_REALM" => "upstream.realm",
                "KEYCLOAK_CLIENT_ID" => "upstream.client_id",
                "KEYCLOAK_CLIENT_SECRET" => "upstream.client_secret",
                _ => return key.into(),
            };
            mapped.into()
        })
}

/// Load environment files into the process environment.
/// Supports ~ expansion. Files that don't exist are silently skipped.
fn load_env_files(paths: &[String]) {
    for path_str in paths {
        let expanded = if path_str.starts_with('~') {
            if let Some(home) = dirs::home_dir() {
                path_str.replacen('~', &home.display().to_string(), 1)
            } else {
                path_str.clone()
            }
        } else {
            path_str.clone()
        };

        let path = Path::new(&expanded);
        if path.exists() {
            match dotenvy::from_path(path) {
                Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
            }
        } else {
            tracing::debug!("Env file not found (skipped): {expanded}");
        }
    }
}

fn env_pattern() -> Regex {
    // ${VAR} or ${VAR:-default}
    Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").expect("static regex is valid")
}

/// Expand environment variables in a string
fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

/// Resolve `env:VAR_NAME` indirection, falling back to the literal value
fn resolve_secret(value: &str) -> String {
    if let Some(var_name) = value.strip_prefix("env:") {
        env::var(var_name).unwrap_or_else(|_| value.to_string())
    } else {
        value.to_string()
    }
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8007,
            max_body_size: 1024 * 1024,
        }
    }
}

/// Public origin resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OriginConfig {
    /// Base URL used in metadata templates; rewritten to the public origin per request
    pub internal_base_url: String,
    /// Additional internal bases that must never leak to clients
    pub extra_internal_bases: Vec<String>,
    /// Honor `X-Forwarded-Proto` / `X-Forwarded-Host`
    pub trust_forwarded_headers: bool,
    /// Scheme of the listener itself, used when forwarded headers are absent
    pub observed_scheme: String,
    /// Origin used when the request carries no usable `Host` header
    pub default_origin: String,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            internal_base_url: "http://localhost:9000".to_string(),
            extra_internal_bases: Vec::new(),
            trust_forwarded_headers: true,
            observed_scheme: "http".to_string(),
            default_origin: "http://localhost:9000".to_string(),
        }
    }
}

/// Upstream identity provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Provider base address (e.g. `http://localhost:9090`)
    pub base_url: String,
    /// Realm / tenant identifier
    pub realm: String,
    /// Client id the proxy uses against the provider
    pub client_id: String,
    /// Client secret (supports `env:VAR` and `${VAR}`)
    pub client_secret: Option<String>,
    /// Fetch endpoints from the provider's OIDC discovery document at startup
    pub discovery: bool,
    /// Override: authorization endpoint
    pub authorization_endpoint: Option<String>,
    /// Override: token endpoint
    pub token_endpoint: Option<String>,
    /// Override: JWKS address
    pub jwks_uri: Option<String>,
    /// Override: issuer
    pub issuer: Option<String>,
    /// Scopes requested upstream when the client asks for none
    pub default_scopes: Vec<String>,
    /// Timeout for every upstream HTTP call
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9090".to_string(),
            realm: "mcp".to_string(),
            client_id: "mcp-server".to_string(),
            client_secret: None,
            discovery: true,
            authorization_endpoint: None,
            token_endpoint: None,
            jwks_uri: None,
            issuer: None,
            default_scopes: vec!["openid".to_string()],
            timeout: Duration::from_secs(10),
        }
    }
}

impl UpstreamConfig {
    /// `{base_url}/realms/{realm}`, the provider's issuer by convention
    #[must_use]
    pub fn realm_url(&self) -> String {
        format!(
            "{}/realms/{}",
            self.base_url.trim_end_matches('/'),
            self.realm
        )
    }
}

/// Issuer check policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IssuerPolicy {
    /// Do not check `iss`: tokens minted under different public origins carry
    /// different issuers. Weaker than pinning.
    #[default]
    Relaxed,
    /// `iss` must be one of the configured issuers
    Strict,
}

/// Bearer token verification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Accepted audiences (empty = the upstream client id)
    pub audiences: Vec<String>,
    /// Issuer policy
    pub issuer_policy: IssuerPolicy,
    /// Accepted issuers under the strict policy (empty = upstream issuer)
    pub issuers: Vec<String>,
    /// Scopes every token must carry
    pub required_scopes: Vec<String>,
    /// Clock skew tolerance
    #[serde(with = "humantime_serde")]
    pub leeway: Duration,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            audiences: Vec::new(),
            issuer_policy: IssuerPolicy::Relaxed,
            issuers: Vec::new(),
            required_scopes: Vec::new(),
            leeway: Duration::from_secs(60),
        }
    }
}

/// Signing key cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwksConfig {
    /// How long a fetched key set is considered fresh
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Longest a lookup waits on a forced refresh
    #[serde(with = "humantime_serde")]
    pub refresh_timeout: Duration,
    /// Minimum spacing between forced refreshes triggered by unknown key ids
    #[serde(with = "humantime_serde")]
    pub min_refresh_interval: Duration,
}

impl Default for JwksConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            refresh_timeout: Duration::from_secs(5),
            min_refresh_interval: Duration::from_secs(10),
        }
    }
}

/// Redirect URI matching policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RedirectPolicy {
    /// Exact match (loopback URIs match on any port)
    #[default]
    Strict,
    /// Glob patterns, including a bare `*`. Weakens protection against
    /// authorization code interception.
    Wildcard,
}

/// Dynamic client registration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Redirect URI policy
    pub redirect_policy: RedirectPolicy,
    /// Registrations per minute, process-wide (0 = unlimited)
    pub rate_limit: u32,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            redirect_policy: RedirectPolicy::Strict,
            rate_limit: 60,
        }
    }
}

/// Authorization session lifetimes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Time allowed between `/authorize` and the upstream callback
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Lifetime of a proxy-issued authorization code
    #[serde(with = "humantime_serde")]
    pub code_ttl: Duration,
    /// Reaper interval
    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            code_ttl: Duration::from_secs(300),
            reap_interval: Duration::from_secs(60),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts, including the first
    pub max_attempts: u32,
    /// Initial backoff duration
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

/// Protected resource served behind the proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Path prefix of the protected resource
    pub path: String,
    /// Scopes advertised in resource metadata
    pub scopes_supported: Vec<String>,
    /// Application backend authenticated requests are forwarded to
    pub backend_url: Option<String>,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            path: "/mcp".to_string(),
            scopes_supported: Vec::new(),
            backend_url: None,
        }
    }
}

/// Human-readable serde for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse "100ms", "30s", "5m", "1h" or a bare number of seconds
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        // "ms" before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim().parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim().parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.trim().parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.trim().parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.verifier.issuer_policy, IssuerPolicy::Relaxed);
        assert_eq!(config.registration.redirect_policy, RedirectPolicy::Strict);
    }

    #[test]
    fn expected_audience_defaults_to_client_id() {
        let config = Config::default();
        assert_eq!(config.expected_audiences(), vec!["mcp-server".to_string()]);

        let mut config = Config::default();
        config.verifier.audiences = vec!["api".to_string()];
        assert_eq!(config.expected_audiences(), vec!["api".to_string()]);
    }

    #[test]
    fn realm_url_trims_trailing_slash() {
        let upstream = UpstreamConfig {
            base_url: "https://id.example.com/".to_string(),
            realm: "acme".to_string(),
            ..Default::default()
        };
        assert_eq!(upstream.realm_url(), "https://id.example.com/realms/acme");
    }

    #[test]
    fn validate_rejects_root_resource_path() {
        let mut config = Config::default();
        config.resource.path = "/".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn validate_rejects_unknown_observed_scheme() {
        let mut config = Config::default();
        config.origin.observed_scheme = "gopher".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn yaml_policies_deserialize_lowercase() {
        let yaml = r#"
verifier:
  issuer_policy: strict
  issuers: ["https://id.example.com/realms/mcp"]
registration:
  redirect_policy: wildcard
sessions:
  ttl: 5m
  code_ttl: 90s
retry:
  initial_backoff: 250ms
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.verifier.issuer_policy, IssuerPolicy::Strict);
        assert_eq!(config.registration.redirect_policy, RedirectPolicy::Wildcard);
        assert_eq!(config.sessions.ttl, Duration::from_secs(300));
        assert_eq!(config.sessions.code_ttl, Duration::from_secs(90));
        assert_eq!(config.retry.initial_backoff, Duration::from_millis(250));
        // Untouched sections keep their defaults
        assert_eq!(config.resource.path, "/mcp");
    }

    #[test]
    fn humantime_parse_handles_units() {
        assert_eq!(humantime_serde::parse("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(humantime_serde::parse("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(humantime_serde::parse("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(humantime_serde::parse("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(humantime_serde::parse("45").unwrap(), Duration::from_secs(45));
        assert!(humantime_serde::parse("soon").is_err());
    }

    #[test]
    fn load_reads_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "env_files: []").unwrap();
        writeln!(f, "upstream:").unwrap();
        writeln!(f, "  base_url: https://id.example.com").unwrap();
        writeln!(f, "  realm: acme").unwrap();
        writeln!(f, "  discovery: false").unwrap();
        writeln!(f, "resource:").unwrap();
        writeln!(f, "  path: /api").unwrap();
        drop(f);

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.upstream.realm, "acme");
        assert!(!config.upstream.discovery);
        assert_eq!(config.resource.path, "/api");
    }

    #[test]
    fn load_rejects_missing_file() {
        let result = Config::load(Some(Path::new("/nonexistent/proxy.yaml")));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn expand_string_uses_default() {
        let re = env_pattern();
        assert_eq!(
            expand_string(&re, "${OAUTH_PROXY_TEST_SURELY_UNSET:-fallback}"),
            "fallback"
        );
    }

    #[test]
    fn resolve_secret_passes_literals_through() {
        assert_eq!(resolve_secret("plain-secret"), "plain-secret");
        // Unset variable: literal kept so the misconfiguration is visible
        assert_eq!(
            resolve_secret("env:OAUTH_PROXY_TEST_SURELY_UNSET"),
            "env:OAUTH_PROXY_TEST_SURELY_UNSET"
        );
    }

    #[test]
    fn redacted_hides_client_secret() {
        let mut config = Config::default();
        config.upstream.client_secret = Some("s3cret".to_string());
        let shown = config.redacted();
        assert_eq!(shown.upstream.client_secret.as_deref(), Some("<redacted>"));
    }
}
