//! HTTP router, shared state, and the read-only handlers

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, Method, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{any, get, post},
};
use reqwest::Client;
use serde_json::{Value, json};
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::auth::require_bearer;
use super::forward::Forwarder;
use super::handlers::{authorize, callback, register, resource, token};
use crate::config::{Config, ResourceConfig};
use crate::oauth::metadata::{
    AUTHORIZATION_SERVER_METADATA_PATH, AUTHORIZE_PATH, CALLBACK_PATH, JWKS_PATH,
    OPENID_CONFIGURATION_PATH, PROTECTED_RESOURCE_METADATA_PATH, REGISTER_PATH, TOKEN_PATH,
};
use crate::oauth::{
    AuthorizationServerMetadata, ClientRegistrar, ClientStore, MetadataRewriter,
    ProtectedResourceMetadata, SessionStore, TokenExchange, UpstreamEndpoints,
};
use crate::origin::{OriginResolver, X_FORWARDED_HOST, X_FORWARDED_PROTO};
use crate::verifier::{JwksCache, TokenVerifier};
use crate::{Error, Result};

/// Shared application state
pub struct AppState {
    /// Per-request public origin
    pub resolver: OriginResolver,
    /// Internal base -> public origin
    pub rewriter: MetadataRewriter,
    /// Base URL metadata templates are built against
    pub internal_base: String,
    /// Upstream provider endpoints
    pub upstream: UpstreamEndpoints,
    /// Client id the proxy uses upstream
    pub upstream_client_id: String,
    /// Scopes requested upstream when the client names none
    pub default_scopes: Vec<String>,
    /// Dynamic client registration
    pub registrar: ClientRegistrar,
    /// In-flight authorization flows
    pub sessions: Arc<SessionStore>,
    /// Upstream token endpoint
    pub exchange: Arc<dyn TokenExchange>,
    /// Bearer token verification
    pub verifier: TokenVerifier,
    /// Protected resource settings
    pub resource: ResourceConfig,
    /// Application backend, when configured
    pub forwarder: Option<Forwarder>,
    /// Request body limit
    pub max_body_size: usize,
}

impl AppState {
    /// Wire the components together
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid origin configuration.
    pub fn new(
        config: &Config,
        upstream: UpstreamEndpoints,
        http: Client,
        exchange: Arc<dyn TokenExchange>,
        clients: Arc<dyn ClientStore>,
    ) -> Result<Self> {
        let resolver = OriginResolver::new(&config.origin)?;
        let rewriter = MetadataRewriter::new(
            std::iter::once(&config.origin.internal_base_url)
                .chain(&config.origin.extra_internal_bases),
        );
        let jwks = JwksCache::new(upstream.jwks_uri.clone(), http.clone(), &config.jwks);
        let verifier = TokenVerifier::new(config, jwks, &upstream.issuer);
        let forwarder = config
            .resource
            .backend_url
            .as_ref()
            .map(|url| Forwarder::new(http, url, config.server.max_body_size));

        Ok(Self {
            resolver,
            rewriter,
            internal_base: config.origin.internal_base_url.trim_end_matches('/').to_string(),
            upstream_client_id: config.upstream.client_id.clone(),
            default_scopes: config.upstream.default_scopes.clone(),
            registrar: ClientRegistrar::new(clients, &config.registration),
            sessions: Arc::new(SessionStore::new(
                config.sessions.ttl,
                config.sessions.code_ttl,
            )),
            exchange,
            verifier,
            resource: config.resource.clone(),
            forwarder,
            upstream,
            max_body_size: config.server.max_body_size,
        })
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let resource_path = state.resource.path.trim_end_matches('/').to_string();

    let protected = Router::new()
        .route(&resource_path, any(resource))
        .route(&format!("{resource_path}/{{*rest}}"), any(resource))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_bearer,
        ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers([header::WWW_AUTHENTICATE]);

    Router::new()
        .route(AUTHORIZATION_SERVER_METADATA_PATH, get(authorization_server_metadata))
        .route(OPENID_CONFIGURATION_PATH, get(authorization_server_metadata))
        .route(PROTECTED_RESOURCE_METADATA_PATH, get(default_resource_metadata))
        .route(
            &format!("{PROTECTED_RESOURCE_METADATA_PATH}/{{*resource}}"),
            get(resource_metadata),
        )
        .route(JWKS_PATH, get(jwks))
        .route(REGISTER_PATH, post(register))
        .route(AUTHORIZE_PATH, get(authorize))
        .route(CALLBACK_PATH, get(callback))
        .route(TOKEN_PATH, post(token))
        .route("/debug/origin", get(debug_origin))
        .route("/health", get(health))
        .merge(protected)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(CatchPanicLayer::new())
                .layer(DefaultBodyLimit::max(state.max_body_size)),
        )
        .with_state(state)
}

/// GET /.well-known/oauth-authorization-server
async fn authorization_server_metadata(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let resolved = state.resolver.resolve(&headers);
    let doc = AuthorizationServerMetadata::for_proxy(
        &state.internal_base,
        &state.resource.path,
        &state.resource.scopes_supported,
    );
    Ok(Json(
        state
            .rewriter
            .rewrite(serde_json::to_value(doc)?, &resolved.origin),
    ))
}

/// GET /.well-known/oauth-protected-resource
async fn default_resource_metadata(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    protected_resource_document(&state, &headers)
}

/// GET /.well-known/oauth-protected-resource/{*resource}
async fn resource_metadata(
    State(state): State<Arc<AppState>>,
    Path(requested): Path<String>,
    headers: HeaderMap,
) -> Response {
    let requested = format!("/{}", requested.trim_matches('/'));
    if requested != state.resource.path.trim_end_matches('/') {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown resource" })),
        )
            .into_response();
    }
    protected_resource_document(&state, &headers).into_response()
}

fn protected_resource_document(state: &AppState, headers: &HeaderMap) -> Result<Json<Value>> {
    let resolved = state.resolver.resolve(headers);
    let doc = ProtectedResourceMetadata::for_resource(
        &state.internal_base,
        &state.resource.path,
        &state.resource.scopes_supported,
    );
    Ok(Json(
        state
            .rewriter
            .rewrite(serde_json::to_value(doc)?, &resolved.origin),
    ))
}

/// GET /.well-known/jwks.json
async fn jwks(State(state): State<Arc<AppState>>) -> Result<Json<Value>> {
    let set = state
        .verifier
        .jwks()
        .current_set()
        .await
        .map_err(|e| Error::UpstreamUnavailable(e.to_string()))?;
    Ok(Json(serde_json::to_value(set.as_ref())?))
}

/// GET /debug/origin
async fn debug_origin(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Json<Value> {
    let resolved = state.resolver.resolve(&headers);
    let get_header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    Json(json!({
        "origin": resolved.origin.to_string(),
        "fallback": resolved.fallback.as_ref().map(ToString::to_string),
        "headers": {
            "x-forwarded-proto": get_header(X_FORWARDED_PROTO),
            "x-forwarded-host": get_header(X_FORWARDED_HOST),
            "host": get_header(header::HOST.as_str()),
        },
        "internal_base_url": state.internal_base,
    }))
}

/// GET /health
async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "pending_sessions": state.sessions.pending_count(),
        "issued_codes": state.sessions.issued_count(),
    }))
}
