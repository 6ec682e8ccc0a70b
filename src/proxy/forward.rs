//! Forwarding authenticated requests to the application backend

use axum::{
    body::{Body, to_bytes},
    http::{HeaderMap, HeaderName, HeaderValue, Request, header},
    response::Response,
};
use bytes::{Bytes, BytesMut};
use reqwest::Client;
use tracing::{debug, warn};

use crate::oauth::MetadataRewriter;
use crate::origin::{PublicOrigin, X_FORWARDED_HOST, X_FORWARDED_PROTO};
use crate::verifier::VerifiedToken;
use crate::{Error, Result};

/// Header carrying the verified subject to the backend
pub const AUTHENTICATED_SUBJECT: &str = "x-authenticated-subject";

/// Connection-scoped headers (RFC 9110 §7.6.1) never forwarded in either direction
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Response headers that may carry absolute URLs back to the client
const URL_HEADERS: &[HeaderName] = &[
    header::LOCATION,
    header::CONTENT_LOCATION,
    header::WWW_AUTHENTICATE,
];

/// Relays requests to `resource.backend_url`
pub struct Forwarder {
    http: Client,
    backend_url: String,
    max_body_size: usize,
}

impl Forwarder {
    /// Create a forwarder for `backend_url`
    #[must_use]
    pub fn new(http: Client, backend_url: &str, max_body_size: usize) -> Self {
        Self {
            http,
            backend_url: backend_url.trim_end_matches('/').to_string(),
            max_body_size,
        }
    }

    /// Forward a verified request, keeping its path and query. Internal URLs
    /// in the response headers and JSON bodies are rewritten to `origin`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for an unreadable body and
    /// [`Error::UpstreamUnavailable`] if the backend cannot be reached or its
    /// response exceeds the body limit.
    pub async fn forward(
        &self,
        request: Request<Body>,
        token: &VerifiedToken,
        origin: &PublicOrigin,
        rewriter: &MetadataRewriter,
    ) -> Result<Response> {
        let (parts, body) = request.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map_or("/", |pq| pq.as_str());
        let url = format!("{}{path_and_query}", self.backend_url);

        let body: Bytes = to_bytes(body, self.max_body_size)
            .await
            .map_err(|e| Error::InvalidRequest(format!("unreadable request body: {e}")))?;

        let mut headers = strip_hop_by_hop(&parts.headers);
        headers.remove(header::HOST);
        headers.remove(header::AUTHORIZATION);
        headers.remove(HeaderName::from_static(AUTHENTICATED_SUBJECT));
        if let Ok(subject) = HeaderValue::from_str(&token.subject) {
            headers.insert(HeaderName::from_static(AUTHENTICATED_SUBJECT), subject);
        }
        if let Ok(proto) = HeaderValue::from_str(origin.scheme()) {
            headers.insert(HeaderName::from_static(X_FORWARDED_PROTO), proto);
        }
        let public_host = match origin.port() {
            Some(port) => format!("{}:{port}", origin.host()),
            None => origin.host().to_string(),
        };
        if let Ok(host) = HeaderValue::from_str(&public_host) {
            headers.insert(HeaderName::from_static(X_FORWARDED_HOST), host);
        }

        debug!(url = %url, subject = %token.subject, "Forwarding to backend");
        let upstream = self
            .http
            .request(parts.method, &url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                warn!(url = %url, error = %e, "Backend request failed");
                Error::UpstreamUnavailable(format!("backend unreachable: {e}"))
            })?;

        let status = upstream.status();
        let mut response_headers = strip_hop_by_hop(upstream.headers());
        rewrite_url_headers(&mut response_headers, rewriter, origin);

        let payload = self.read_limited(upstream).await?;
        let payload = if is_json(&response_headers) {
            rewrite_json_body(payload, rewriter, origin)
        } else {
            payload
        };

        let mut response = Response::new(Body::from(payload));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        // Body is buffered and possibly rewritten; axum sets the new length
        response.headers_mut().remove(header::CONTENT_LENGTH);
        Ok(response)
    }

    /// Buffer the backend body, failing once it exceeds `max_body_size`
    async fn read_limited(&self, mut upstream: reqwest::Response) -> Result<Bytes> {
        let too_large = || {
            warn!(limit = self.max_body_size, "Backend response exceeds body limit");
            Error::UpstreamUnavailable("backend response too large".to_string())
        };

        if upstream
            .content_length()
            .is_some_and(|len| len > u64::try_from(self.max_body_size).unwrap_or(u64::MAX))
        {
            return Err(too_large());
        }

        let mut buf = BytesMut::new();
        while let Some(chunk) = upstream.chunk().await? {
            if buf.len() + chunk.len() > self.max_body_size {
                return Err(too_large());
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

fn rewrite_url_headers(headers: &mut HeaderMap, rewriter: &MetadataRewriter, origin: &PublicOrigin) {
    for name in URL_HEADERS {
        let rewritten: Vec<HeaderValue> = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(|v| rewriter.rewrite_str(v, origin))
            .filter_map(|v| HeaderValue::from_str(&v).ok())
            .collect();
        if rewritten.is_empty() {
            continue;
        }
        headers.remove(name);
        for value in rewritten {
            headers.append(name.clone(), value);
        }
    }
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|mime| {
            let mime = mime.trim();
            mime.eq_ignore_ascii_case("application/json") || mime.ends_with("+json")
        })
}

/// Unparseable bodies are relayed untouched
fn rewrite_json_body(payload: Bytes, rewriter: &MetadataRewriter, origin: &PublicOrigin) -> Bytes {
    match serde_json::from_slice::<serde_json::Value>(&payload) {
        Ok(value) => match serde_json::to_vec(&rewriter.rewrite(value, origin)) {
            Ok(bytes) => Bytes::from(bytes),
            Err(_) => payload,
        },
        Err(_) => payload,
    }
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    // Headers named in `Connection` are hop-by-hop too
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .collect();

    headers
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            !HOP_BY_HOP.contains(&name) && !listed.iter().any(|l| l == name)
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-trace"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let kept = strip_hop_by_hop(&headers);
        assert_eq!(kept.len(), 1);
        assert!(kept.contains_key(header::CONTENT_TYPE));
    }

    fn public() -> PublicOrigin {
        PublicOrigin::parse("https://example.ngrok.app").unwrap()
    }

    #[test]
    fn url_headers_are_rewritten_to_public_origin() {
        // GIVEN: a backend redirect pointing at the internal base
        let rewriter = MetadataRewriter::new(["http://localhost:9000"]);
        let mut headers = HeaderMap::new();
        headers.insert(
            header::LOCATION,
            HeaderValue::from_static("http://localhost:9000/mcp/next"),
        );
        headers.insert(header::ETAG, HeaderValue::from_static("\"abc\""));

        // WHEN: rewriting
        rewrite_url_headers(&mut headers, &rewriter, &public());

        // THEN: only URL-bearing headers change
        assert_eq!(headers[header::LOCATION], "https://example.ngrok.app/mcp/next");
        assert_eq!(headers[header::ETAG], "\"abc\"");
    }

    #[test]
    fn json_bodies_are_rewritten_and_others_left_alone() {
        let rewriter = MetadataRewriter::new(["http://localhost:9000"]);

        let body = rewrite_json_body(
            Bytes::from_static(br#"{"next":"http://localhost:9000/mcp/next"}"#),
            &rewriter,
            &public(),
        );
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["next"], "https://example.ngrok.app/mcp/next");

        let raw = Bytes::from_static(b"not json http://localhost:9000");
        assert_eq!(rewrite_json_body(raw.clone(), &rewriter, &public()), raw);
    }

    #[test]
    fn json_content_types_are_detected() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        assert!(is_json(&headers));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/problem+json"));
        assert!(is_json(&headers));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        assert!(!is_json(&headers));
    }
}
