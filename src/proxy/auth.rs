//! Bearer token middleware for the protected resource

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::debug;

use super::router::AppState;
use crate::oauth::metadata::resource_metadata_path;
use crate::origin::PublicOrigin;

/// Require a valid bearer token; the [`crate::verifier::VerifiedToken`] is
/// inserted into the request extensions for downstream handlers.
pub async fn require_bearer(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .map(str::to_string);

    let Some(token) = token else {
        debug!(path = %request.uri().path(), "Missing bearer token");
        let origin = state.resolver.resolve(request.headers()).origin;
        return unauthorized_response(&state, &origin);
    };

    match state.verifier.verify(&token).await {
        Ok(verified) => {
            debug!(subject = %verified.subject, path = %request.uri().path(), "Authenticated request");
            request.extensions_mut().insert(verified);
            next.run(request).await
        }
        Err(_) => {
            let origin = state.resolver.resolve(request.headers()).origin;
            unauthorized_response(&state, &origin)
        }
    }
}

/// `Authorization: Bearer <token>`, scheme matched case-insensitively
fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Uniform 401 pointing the client at the resource metadata for this origin
fn unauthorized_response(state: &AppState, origin: &PublicOrigin) -> Response {
    let challenge = format!(
        r#"Bearer error="invalid_token", resource_metadata="{}{}""#,
        state.internal_base,
        resource_metadata_path(&state.resource.path)
    );
    let challenge = state.rewriter.rewrite_str(&challenge, origin);

    let mut response = (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "invalid_token" })),
    )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&challenge) {
        response
            .headers_mut()
            .insert(header::WWW_AUTHENTICATE, value);
    }
    response
}
