//! Per-request public origin resolution
//!
//! The proxy is reachable through tunnels and reverse proxies whose public
//! hostname changes without a restart. Every URL handed to a client is built
//! from the origin resolved here, for the request that produced it.

use std::fmt;

use axum::http::{HeaderMap, header};
use serde::Serialize;
use thiserror::Error;

use crate::config::OriginConfig;

/// Forwarded scheme header
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
/// Forwarded host header
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Canonical public origin: lowercase scheme and host, default port elided
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PublicOrigin {
    scheme: String,
    host: String,
    port: Option<u16>,
}

impl PublicOrigin {
    /// Build a canonical origin. Returns `None` for unsupported schemes or
    /// hosts that are not plain authority hostnames.
    pub fn new(scheme: &str, host: &str, port: Option<u16>) -> Option<Self> {
        let scheme = scheme.trim().to_ascii_lowercase();
        let default_port = match scheme.as_str() {
            "http" => 80,
            "https" => 443,
            _ => return None,
        };
        let host = host.trim().to_ascii_lowercase();
        if !is_valid_host(&host) {
            return None;
        }
        Some(Self {
            scheme,
            host,
            port: port.filter(|p| *p != default_port),
        })
    }

    /// Parse `scheme://host[:port]` (a trailing `/` is tolerated)
    pub fn parse(value: &str) -> Option<Self> {
        let (scheme, rest) = value.trim().split_once("://")?;
        let authority = rest.strip_suffix('/').unwrap_or(rest);
        let (host, port) = split_authority(authority)?;
        Self::new(scheme, host, port)
    }

    /// Lowercase scheme (`http` or `https`)
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Lowercase host, brackets kept for IPv6 literals
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Explicit port, `None` when it is the scheme default
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Absolute URL for `path` under this origin
    pub fn url(&self, path: &str) -> String {
        if path.is_empty() || path.starts_with('/') {
            format!("{self}{path}")
        } else {
            format!("{self}/{path}")
        }
    }
}

impl fmt::Display for PublicOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}://{}:{}", self.scheme, self.host, port),
            None => write!(f, "{}://{}", self.scheme, self.host),
        }
    }
}

/// Why the resolver did not use the forwarded headers (or `Host`)
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginFallback {
    /// Forwarded headers are configured as untrusted
    #[error("forwarded headers are not trusted")]
    ForwardedHeadersUntrusted,
    /// One or both forwarded headers absent
    #[error("X-Forwarded-Proto and X-Forwarded-Host are not both present")]
    MissingForwardedHeaders,
    /// Forwarded scheme is not http/https
    #[error("X-Forwarded-Proto is not http or https")]
    MalformedProto,
    /// Forwarded host carries userinfo, a path, or illegal characters
    #[error("X-Forwarded-Host is not a valid host")]
    MalformedHost,
    /// No usable `Host` either; the configured default origin was used
    #[error("no usable Host header")]
    MissingHost,
}

/// Result of resolving one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOrigin {
    /// The origin every URL in the response must use
    pub origin: PublicOrigin,
    /// Set when the forwarded headers were not used
    pub fallback: Option<OriginFallback>,
}

/// Derives the public origin from request headers. Pure: no I/O, no state.
#[derive(Debug, Clone)]
pub struct OriginResolver {
    trust_forwarded: bool,
    observed_scheme: String,
    default_origin: PublicOrigin,
}

impl OriginResolver {
    /// Build a resolver from configuration
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] if the default origin is not a valid origin.
    pub fn new(config: &OriginConfig) -> crate::Result<Self> {
        let default_origin = PublicOrigin::parse(&config.default_origin).ok_or_else(|| {
            crate::Error::Config(format!(
                "origin.default_origin is not a valid origin: '{}'",
                config.default_origin
            ))
        })?;
        Ok(Self {
            trust_forwarded: config.trust_forwarded_headers,
            observed_scheme: config.observed_scheme.to_ascii_lowercase(),
            default_origin,
        })
    }

    /// Resolve the public origin for a request
    pub fn resolve(&self, headers: &HeaderMap) -> ResolvedOrigin {
        let forwarded = if self.trust_forwarded {
            from_forwarded(headers)
        } else {
            Err(OriginFallback::ForwardedHeadersUntrusted)
        };

        let reason = match forwarded {
            Ok(origin) => {
                return ResolvedOrigin {
                    origin,
                    fallback: None,
                };
            }
            Err(reason) => reason,
        };

        let from_host = header_str(headers, header::HOST.as_str())
            .and_then(split_authority)
            .and_then(|(host, port)| PublicOrigin::new(&self.observed_scheme, host, port));

        let (origin, fallback) = match from_host {
            Some(origin) => (origin, reason),
            None => (self.default_origin.clone(), OriginFallback::MissingHost),
        };

        tracing::debug!(origin = %origin, reason = %fallback, "Public origin fallback");
        ResolvedOrigin {
            origin,
            fallback: Some(fallback),
        }
    }
}

fn from_forwarded(headers: &HeaderMap) -> Result<PublicOrigin, OriginFallback> {
    let (Some(proto), Some(host)) = (
        header_str(headers, X_FORWARDED_PROTO),
        header_str(headers, X_FORWARDED_HOST),
    ) else {
        return Err(OriginFallback::MissingForwardedHeaders);
    };

    let scheme = first_hop(proto).to_ascii_lowercase();
    if scheme != "http" && scheme != "https" {
        return Err(OriginFallback::MalformedProto);
    }

    let (host, port) = split_authority(first_hop(host)).ok_or(OriginFallback::MalformedHost)?;
    PublicOrigin::new(&scheme, host, port).ok_or(OriginFallback::MalformedHost)
}

/// First (client-facing) entry of a comma-separated multi-hop value
fn first_hop(value: &str) -> &str {
    value.split(',').next().unwrap_or(value).trim()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Split `host[:port]` / `[v6][:port]`. Rejects userinfo and paths.
fn split_authority(authority: &str) -> Option<(&str, Option<u16>)> {
    if authority.is_empty()
        || authority.contains(['@', '/', '?', '#', ' ', '\\'])
    {
        return None;
    }

    if authority.starts_with('[') {
        let end = authority.find(']')?;
        let host = &authority[..=end];
        return match &authority[end + 1..] {
            "" => Some((host, None)),
            rest => {
                let port = rest.strip_prefix(':')?.parse().ok()?;
                Some((host, Some(port)))
            }
        };
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => Some((host, Some(port.parse().ok()?))),
        None => Some((authority, None)),
    }
}

/// Host must already be in the canonical form `url` would serialize
fn is_valid_host(host: &str) -> bool {
    let Ok(parsed) = url::Host::parse(host) else {
        return false;
    };
    if parsed.to_string() != host {
        return false;
    }
    match parsed {
        url::Host::Domain(domain) => {
            domain.len() <= 253
                && domain.split('.').all(|label| {
                    !label.is_empty()
                        && label.len() <= 63
                        && !label.starts_with('-')
                        && !label.ends_with('-')
                })
        }
        url::Host::Ipv4(_) | url::Host::Ipv6(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn resolver() -> OriginResolver {
        OriginResolver::new(&OriginConfig::default()).unwrap()
    }

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn forwarded_headers_win() {
        let h = headers(&[
            ("x-forwarded-proto", "https"),
            ("x-forwarded-host", "example.ngrok.app"),
            ("host", "localhost:9000"),
        ]);
        let resolved = resolver().resolve(&h);
        assert_eq!(resolved.origin.to_string(), "https://example.ngrok.app");
        assert!(resolved.fallback.is_none());
    }

    #[test]
    fn multi_hop_uses_first_entry() {
        let h = headers(&[
            ("x-forwarded-proto", "https, http"),
            ("x-forwarded-host", "public.example.com, internal.lan"),
        ]);
        let resolved = resolver().resolve(&h);
        assert_eq!(resolved.origin.to_string(), "https://public.example.com");
    }

    #[test]
    fn default_port_is_elided_and_host_lowercased() {
        let h = headers(&[
            ("x-forwarded-proto", "HTTPS"),
            ("x-forwarded-host", "Example.COM:443"),
        ]);
        assert_eq!(resolver().resolve(&h).origin.to_string(), "https://example.com");

        let h = headers(&[
            ("x-forwarded-proto", "https"),
            ("x-forwarded-host", "example.com:8443"),
        ]);
        assert_eq!(
            resolver().resolve(&h).origin.to_string(),
            "https://example.com:8443"
        );
    }

    #[test]
    fn only_one_forwarded_header_falls_back_to_host() {
        let h = headers(&[("x-forwarded-host", "tunnel.example"), ("host", "proxy:9000")]);
        let resolved = resolver().resolve(&h);
        assert_eq!(resolved.origin.to_string(), "http://proxy:9000");
        assert_eq!(resolved.fallback, Some(OriginFallback::MissingForwardedHeaders));
    }

    #[test]
    fn malformed_forwarded_values_fall_back() {
        let h = headers(&[
            ("x-forwarded-proto", "ftp"),
            ("x-forwarded-host", "a.example"),
            ("host", "localhost:9000"),
        ]);
        assert_eq!(resolver().resolve(&h).fallback, Some(OriginFallback::MalformedProto));

        for bad_host in ["user@evil.example", "a.example/path", "a.example:notaport", "-bad"] {
            let h = headers(&[
                ("x-forwarded-proto", "https"),
                ("x-forwarded-host", bad_host),
                ("host", "localhost:9000"),
            ]);
            let resolved = resolver().resolve(&h);
            assert_eq!(resolved.fallback, Some(OriginFallback::MalformedHost), "{bad_host}");
            assert_eq!(resolved.origin.to_string(), "http://localhost:9000");
        }
    }

    #[test]
    fn no_headers_uses_default_origin() {
        let resolved = resolver().resolve(&HeaderMap::new());
        assert_eq!(resolved.origin.to_string(), "http://localhost:9000");
        assert_eq!(resolved.fallback, Some(OriginFallback::MissingHost));
    }

    #[test]
    fn untrusted_forwarded_headers_are_ignored() {
        let config = OriginConfig {
            trust_forwarded_headers: false,
            ..Default::default()
        };
        let resolver = OriginResolver::new(&config).unwrap();
        let h = headers(&[
            ("x-forwarded-proto", "https"),
            ("x-forwarded-host", "spoofed.example"),
            ("host", "proxy.internal:8007"),
        ]);
        let resolved = resolver.resolve(&h);
        assert_eq!(resolved.origin.to_string(), "http://proxy.internal:8007");
        assert_eq!(resolved.fallback, Some(OriginFallback::ForwardedHeadersUntrusted));
    }

    #[test]
    fn ipv6_hosts_keep_brackets() {
        let h = headers(&[("x-forwarded-proto", "http"), ("x-forwarded-host", "[::1]:8080")]);
        assert_eq!(resolver().resolve(&h).origin.to_string(), "http://[::1]:8080");
    }

    #[test]
    fn resolution_is_deterministic() {
        let h = headers(&[
            ("x-forwarded-proto", "https"),
            ("x-forwarded-host", "stable.example"),
        ]);
        let r = resolver();
        assert_eq!(r.resolve(&h), r.resolve(&h));
    }

    #[test]
    fn url_joins_paths() {
        let origin = PublicOrigin::parse("https://h.example/").unwrap();
        assert_eq!(origin.url("/token"), "https://h.example/token");
        assert_eq!(origin.url("token"), "https://h.example/token");
        assert_eq!(origin.url(""), "https://h.example");
    }

    #[test]
    fn invalid_default_origin_is_a_config_error() {
        let config = OriginConfig {
            default_origin: "not a url".to_string(),
            ..Default::default()
        };
        assert!(OriginResolver::new(&config).is_err());
    }

    #[test]
    fn malformed_forwarded_hosts_fall_back_to_default() {
        // GIVEN: forwarded hosts that are not canonical hostnames
        let r = resolver();
        let fallback = r.resolve(&HeaderMap::new()).origin;

        for bad in ["a..b", "host-", "-host", "0x7f.1", "exa mple.com", "ex%41mple.com"] {
            // WHEN: one arrives as X-Forwarded-Host
            let h = headers(&[("x-forwarded-proto", "https"), ("x-forwarded-host", bad)]);

            // THEN: the default origin is used
            assert_eq!(r.resolve(&h).origin, fallback, "accepted {bad}");
        }
    }

    #[test]
    fn canonical_hosts_are_accepted() {
        for good in ["tunnel-1.ngrok.app", "10.0.0.7", "[::1]", "my_host.internal"] {
            assert!(PublicOrigin::new("https", good, None).is_some(), "rejected {good}");
        }
    }
}
