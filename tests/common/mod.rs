//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, Response};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use oauth_origin_proxy::Result;
use oauth_origin_proxy::config::Config;
use oauth_origin_proxy::oauth::{
    CodeGrant, InMemoryClientStore, TokenExchange, TokenSet, UpstreamEndpoints,
    UpstreamTokenExchange,
};
use oauth_origin_proxy::proxy::{AppState, create_router};

pub const SIGNING_KEY: &[u8] = include_bytes!("../fixtures/signing_rsa.pem");
pub const ROGUE_KEY: &[u8] = include_bytes!("../fixtures/rogue_rsa.pem");
pub const JWKS: &str = include_str!("../fixtures/jwks.json");
pub const KID: &str = "signing-key-1";
pub const AUDIENCE: &str = "mcp-server";

/// Records every grant and answers with a fixed token set
#[derive(Default)]
pub struct RecordingExchange {
    pub code_grants: Mutex<Vec<CodeGrant>>,
    pub refreshes: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl TokenExchange for RecordingExchange {
    async fn exchange_code(&self, grant: &CodeGrant) -> Result<TokenSet> {
        self.code_grants.lock().push(grant.clone());
        Ok(token_set("upstream-access-token"))
    }

    async fn refresh(&self, refresh_token: &str, _scope: Option<&str>) -> Result<TokenSet> {
        self.refreshes.lock().push(refresh_token.to_string());
        Ok(token_set("refreshed-access-token"))
    }
}

pub fn token_set(access_token: &str) -> TokenSet {
    TokenSet {
        access_token: access_token.to_string(),
        token_type: "Bearer".to_string(),
        expires_in: Some(300),
        refresh_token: Some("upstream-refresh-token".to_string()),
        id_token: None,
        scope: Some("openid".to_string()),
        extra: Map::new(),
    }
}

/// Mock provider serving the fixture key set
pub async fn jwks_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/certs"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(JWKS, "application/json"))
        .mount(&server)
        .await;
    server
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.env_files.clear();
    config.upstream.base_url = "http://keycloak.internal:8080".to_string();
    config.upstream.discovery = false;
    config
}

pub fn endpoints(config: &Config, jwks_uri: &str) -> UpstreamEndpoints {
    let mut upstream = UpstreamEndpoints::from_config(&config.upstream);
    upstream.jwks_uri = jwks_uri.to_string();
    upstream
}

pub fn app(config: &Config, jwks_uri: &str, exchange: Arc<dyn TokenExchange>) -> Router {
    let http = UpstreamTokenExchange::http_client(config.upstream.timeout).unwrap();
    let state = AppState::new(
        config,
        endpoints(config, jwks_uri),
        http,
        exchange,
        Arc::new(InMemoryClientStore::new()),
    )
    .unwrap();
    create_router(Arc::new(state))
}

pub async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.unwrap()
}

pub async fn json_body(response: Response<Body>) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Claims the default configuration accepts
pub fn valid_claims() -> Value {
    json!({
        "sub": "user-123",
        "aud": AUDIENCE,
        "iss": "http://keycloak.internal:8080/realms/mcp",
        "iat": now(),
        "exp": now() + 300,
        "scope": "openid mcp:tools",
    })
}

pub fn sign(claims: &Value, kid: &str, pem: &[u8]) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    let key = EncodingKey::from_rsa_pem(pem).unwrap();
    jsonwebtoken::encode(&header, claims, &key).unwrap()
}
