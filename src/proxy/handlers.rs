//! OAuth flow handlers: registration, authorize, callback, token, resource

use std::sync::Arc;

use axum::{
    Extension, Json,
    body::Body,
    extract::{Form, Query, State, rejection::FormRejection, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use url::Url;

use super::router::AppState;
use crate::oauth::metadata::CALLBACK_PATH;
use crate::oauth::pkce::{generate_pkce, random_token, verify_s256};
use crate::oauth::{
    AuthorizationSession, CodeGrant, RegistrationRequest, RegistrationResponse, TokenSet,
};
use crate::verifier::VerifiedToken;
use crate::{Error, Result};

/// POST /register
pub async fn register(
    State(state): State<Arc<AppState>>,
    body: std::result::Result<Json<RegistrationRequest>, JsonRejection>,
) -> Result<Response> {
    let Json(request) = body.map_err(|e| Error::invalid_client_metadata(e.body_text()))?;
    let client = state.registrar.register(request).await?;

    let mut response = (
        StatusCode::CREATED,
        Json(RegistrationResponse::from(client)),
    )
        .into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    Ok(response)
}

/// Query parameters of `GET /authorize`
#[derive(Debug, Deserialize)]
pub struct AuthorizeParams {
    response_type: Option<String>,
    client_id: String,
    redirect_uri: Option<String>,
    state: Option<String>,
    code_challenge: Option<String>,
    code_challenge_method: Option<String>,
    scope: Option<String>,
    resource: Option<String>,
}

/// GET /authorize
///
/// Client and redirect URI problems are answered directly; once the redirect
/// URI is trusted, protocol errors go back to the client through it.
pub async fn authorize(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<AuthorizeParams>,
) -> Result<Response> {
    let client = state.registrar.lookup(&params.client_id).await?;
    let redirect_uri = state
        .registrar
        .resolve_redirect(&client, params.redirect_uri.as_deref())?;
    let redirect_uri_supplied = params.redirect_uri.is_some();

    let client_state = params.state.as_deref();
    if params.response_type.as_deref() != Some("code") {
        return redirect_error(
            &redirect_uri,
            "unsupported_response_type",
            "only the 'code' response type is supported",
            client_state,
        );
    }
    if !client.allows_grant("authorization_code") {
        return redirect_error(
            &redirect_uri,
            "unauthorized_client",
            "client is not registered for the authorization_code grant",
            client_state,
        );
    }
    let Some(code_challenge) = params.code_challenge.filter(|c| !c.is_empty()) else {
        return redirect_error(
            &redirect_uri,
            "invalid_request",
            "code_challenge is required",
            client_state,
        );
    };
    let method = params
        .code_challenge_method
        .unwrap_or_else(|| "plain".to_string());
    if method != "S256" {
        return redirect_error(
            &redirect_uri,
            "invalid_request",
            "code_challenge_method must be S256",
            client_state,
        );
    }

    let origin = state.resolver.resolve(&headers).origin;
    let upstream_redirect_uri = origin.url(CALLBACK_PATH);
    let (upstream_verifier, upstream_challenge) = generate_pkce();
    let upstream_state = random_token();

    let scope = params
        .scope
        .clone()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| state.default_scopes.join(" "));

    let mut location = Url::parse(&state.upstream.authorization_endpoint)
        .map_err(|e| Error::Internal(format!("invalid upstream authorization endpoint: {e}")))?;
    location
        .query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", &state.upstream_client_id)
        .append_pair("redirect_uri", &upstream_redirect_uri)
        .append_pair("state", &upstream_state)
        .append_pair("code_challenge", &upstream_challenge)
        .append_pair("code_challenge_method", "S256")
        .append_pair("scope", &scope);

    info!(
        client_id = %client.client_id,
        origin = %origin,
        redirect_uri = %upstream_redirect_uri,
        "Authorization flow started"
    );

    state.sessions.begin(AuthorizationSession {
        state: upstream_state,
        client_state: params.state,
        code_challenge,
        code_challenge_method: method,
        client_id: client.client_id,
        requested_redirect_uri: redirect_uri,
        redirect_uri_supplied,
        scope: params.scope,
        resource: params.resource,
        origin_at_start: origin,
        upstream_redirect_uri,
        upstream_code_verifier: upstream_verifier,
        upstream_authorization_code: None,
        created_at: Utc::now(),
    });

    Ok(Redirect::to(location.as_str()).into_response())
}

/// Query parameters of `GET /auth/callback`
#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// GET /auth/callback
pub async fn callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> Result<Response> {
    let upstream_state = params
        .state
        .ok_or_else(|| Error::InvalidRequest("missing state".to_string()))?;

    if let Some(error) = params.error {
        let session = state
            .sessions
            .abandon(&upstream_state)
            .ok_or(Error::SessionExpired)?;
        warn!(
            client_id = %session.client_id,
            error = %error,
            "Upstream provider refused authorization"
        );
        return redirect_error(
            &session.requested_redirect_uri,
            &error,
            params.error_description.as_deref().unwrap_or(""),
            session.client_state.as_deref(),
        );
    }

    let code = params
        .code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| Error::InvalidRequest("missing code".to_string()))?;
    let (proxy_code, session) = state.sessions.complete_callback(&upstream_state, code)?;

    let mut location = Url::parse(&session.requested_redirect_uri)
        .map_err(|e| Error::Internal(format!("stored redirect URI is invalid: {e}")))?;
    {
        let mut pairs = location.query_pairs_mut();
        pairs.append_pair("code", &proxy_code);
        if let Some(client_state) = &session.client_state {
            pairs.append_pair("state", client_state);
        }
    }

    info!(
        client_id = %session.client_id,
        origin = %session.origin_at_start,
        "Authorization callback completed"
    );
    Ok(Redirect::to(location.as_str()).into_response())
}

/// Form body of `POST /token`
#[derive(Debug, Default, Deserialize)]
pub struct TokenRequest {
    grant_type: String,
    code: Option<String>,
    redirect_uri: Option<String>,
    code_verifier: Option<String>,
    refresh_token: Option<String>,
    scope: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
}

/// POST /token
pub async fn token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    form: std::result::Result<Form<TokenRequest>, FormRejection>,
) -> Result<Response> {
    let Form(request) = form.map_err(|e| Error::InvalidRequest(e.body_text()))?;

    let (client_id, client_secret) = match basic_credentials(&headers) {
        Some(credentials) => credentials,
        None => (
            request
                .client_id
                .clone()
                .ok_or_else(|| Error::InvalidClient("missing client_id".to_string()))?,
            request.client_secret.clone(),
        ),
    };
    let client = state
        .registrar
        .authenticate(&client_id, client_secret.as_deref())
        .await?;

    let grant_type = request.grant_type.clone();
    let tokens = match grant_type.as_str() {
        "authorization_code" => {
            exchange_authorization_code(&state, &client.client_id, request).await?
        }
        "refresh_token" => {
            if !client.allows_grant("refresh_token") {
                return Err(Error::UnsupportedGrantType(
                    "refresh_token is not registered for this client".to_string(),
                ));
            }
            let refresh_token = request
                .refresh_token
                .ok_or_else(|| Error::InvalidRequest("missing refresh_token".to_string()))?;
            let tokens = state
                .exchange
                .refresh(&refresh_token, request.scope.as_deref())
                .await?;
            info!(client_id = %client.client_id, "Refresh token redeemed");
            tokens
        }
        other => return Err(Error::UnsupportedGrantType(other.to_string())),
    };

    Ok(token_response(tokens))
}

async fn exchange_authorization_code(
    state: &AppState,
    client_id: &str,
    request: TokenRequest,
) -> Result<TokenSet> {
    let code = request
        .code
        .ok_or_else(|| Error::InvalidRequest("missing code".to_string()))?;
    let code_verifier = request
        .code_verifier
        .ok_or_else(|| Error::InvalidRequest("missing code_verifier".to_string()))?;

    // Single use: the code is consumed whether or not the checks below pass
    let session = state.sessions.redeem(&code)?;

    if session.client_id != client_id {
        warn!(client_id = %client_id, "Authorization code issued to a different client");
        return Err(Error::InvalidAuthorizationCode(
            "code was issued to another client".to_string(),
        ));
    }
    match &request.redirect_uri {
        Some(redirect_uri) if *redirect_uri != session.requested_redirect_uri => {
            return Err(Error::InvalidAuthorizationCode(
                "redirect_uri does not match the authorization request".to_string(),
            ));
        }
        None if session.redirect_uri_supplied => {
            return Err(Error::InvalidAuthorizationCode(
                "redirect_uri is required when it was sent to /authorize".to_string(),
            ));
        }
        _ => {}
    }
    if !verify_s256(&code_verifier, &session.code_challenge) {
        return Err(Error::InvalidAuthorizationCode(
            "PKCE verification failed".to_string(),
        ));
    }

    let upstream_code = session
        .upstream_authorization_code
        .ok_or_else(|| Error::Internal("session has no upstream code".to_string()))?;
    let grant = CodeGrant {
        code: upstream_code,
        redirect_uri: session.upstream_redirect_uri,
        code_verifier: session.upstream_code_verifier,
    };

    let tokens = state.exchange.exchange_code(&grant).await?;
    info!(
        client_id = %client_id,
        origin = %session.origin_at_start,
        "Authorization code exchanged"
    );
    Ok(tokens)
}

fn token_response(tokens: TokenSet) -> Response {
    let mut response = Json(tokens).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    response
}

/// Protected resource handler, reached only with a verified token
pub async fn resource(
    State(state): State<Arc<AppState>>,
    Extension(token): Extension<VerifiedToken>,
    request: Request<Body>,
) -> Result<Response> {
    match &state.forwarder {
        Some(forwarder) => {
            let origin = state.resolver.resolve(request.headers()).origin;
            forwarder
                .forward(request, &token, &origin, &state.rewriter)
                .await
        }
        None => Ok(Json(json!({
            "subject": token.subject,
            "audience": token.audience,
            "scopes": token.scopes,
            "issuer": token.issuer,
            "expires_at": token.expires_at,
        }))
        .into_response()),
    }
}

/// `Authorization: Basic base64(client_id:client_secret)`
fn basic_credentials(headers: &HeaderMap) -> Option<(String, Option<String>)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (id, secret) = decoded.split_once(':')?;
    let id = form_decode(id);
    let secret = form_decode(secret);
    Some((id, (!secret.is_empty()).then_some(secret)))
}

/// Credentials in the Basic header are form-urlencoded (RFC 6749 §2.3.1)
fn form_decode(value: &str) -> String {
    url::form_urlencoded::parse(format!("v={value}").as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_default()
}

/// Redirect an error to the client's (already validated) redirect URI
fn redirect_error(
    redirect_uri: &str,
    error: &str,
    description: &str,
    client_state: Option<&str>,
) -> Result<Response> {
    let mut location = Url::parse(redirect_uri)
        .map_err(|e| Error::InvalidRequest(format!("invalid redirect_uri: {e}")))?;
    {
        let mut pairs = location.query_pairs_mut();
        pairs.append_pair("error", error);
        if !description.is_empty() {
            pairs.append_pair("error_description", description);
        }
        if let Some(client_state) = client_state {
            pairs.append_pair("state", client_state);
        }
    }
    Ok(Redirect::to(location.as_str()).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_credentials_are_decoded() {
        // GIVEN: a Basic header with a form-encoded secret
        let mut headers = HeaderMap::new();
        let encoded = STANDARD.encode("client-1:s3cr%2Bt");
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {encoded}")).unwrap(),
        );

        // WHEN: parsing the credentials
        let (id, secret) = basic_credentials(&headers).unwrap();

        // THEN: both parts are decoded
        assert_eq!(id, "client-1");
        assert_eq!(secret.as_deref(), Some("s3cr+t"));
    }

    #[test]
    fn bearer_header_is_not_client_credentials() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert!(basic_credentials(&headers).is_none());
    }

    #[test]
    fn redirect_error_preserves_existing_query_and_state() {
        let response =
            redirect_error("http://localhost:3000/cb?x=1", "access_denied", "", Some("xyz"))
                .unwrap();
        let location = response.headers()[header::LOCATION].to_str().unwrap();
        assert_eq!(
            location,
            "http://localhost:3000/cb?x=1&error=access_denied&state=xyz"
        );
    }
}
