//! Upstream token exchange against a mock token endpoint

use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use oauth_origin_proxy::Error;
use oauth_origin_proxy::config::UpstreamConfig;
use oauth_origin_proxy::oauth::{CodeGrant, TokenExchange, UpstreamTokenExchange};
use oauth_origin_proxy::retry::RetryPolicy;

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        multiplier: 2.0,
    }
}

fn exchange(server: &MockServer, retry: RetryPolicy) -> UpstreamTokenExchange {
    let upstream = UpstreamConfig {
        client_id: "mcp-server".to_string(),
        client_secret: Some("upstream-secret".to_string()),
        ..Default::default()
    };
    let http = UpstreamTokenExchange::http_client(Duration::from_secs(5)).unwrap();
    UpstreamTokenExchange::new(http, format!("{}/token", server.uri()), &upstream, retry)
}

fn grant() -> CodeGrant {
    CodeGrant {
        code: "upstream-code".to_string(),
        redirect_uri: "https://a.ngrok.app/auth/callback".to_string(),
        code_verifier: "v".repeat(43),
    }
}

#[tokio::test]
async fn pinned_redirect_uri_is_sent_upstream() {
    // GIVEN: a token endpoint that only accepts origin A's callback
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains(
            "redirect_uri=https%3A%2F%2Fa.ngrok.app%2Fauth%2Fcallback",
        ))
        .and(body_string_contains("client_secret=upstream-secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "at",
            "token_type": "Bearer",
            "expires_in": 300,
            "refresh_token": "rt",
            "session_state": "abc",
        })))
        .expect(1)
        .mount(&server)
        .await;

    // WHEN: exchanging the code
    let tokens = exchange(&server, fast_retry(3))
        .exchange_code(&grant())
        .await
        .unwrap();

    // THEN: the response is passed through, provider extras included
    assert_eq!(tokens.access_token, "at");
    assert_eq!(tokens.refresh_token.as_deref(), Some("rt"));
    assert_eq!(tokens.extra["session_state"], "abc");
}

#[tokio::test]
async fn rejected_grant_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "Code not valid",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let err = exchange(&server, fast_retry(3))
        .exchange_code(&grant())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::InvalidAuthorizationCode(_)));
    assert_eq!(err.oauth_code(), "invalid_grant");
}

#[tokio::test]
async fn unavailable_provider_is_retried_then_surfaces() {
    // GIVEN: a provider that stays unavailable
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    // WHEN: exchanging with three attempts
    let err = exchange(&server, fast_retry(3))
        .exchange_code(&grant())
        .await
        .unwrap_err();

    // THEN: every attempt is used and the failure is temporary
    assert!(matches!(err, Error::UpstreamUnavailable(_)));
    assert_eq!(err.oauth_code(), "temporarily_unavailable");
}

#[tokio::test]
async fn transient_failure_recovers() {
    let server = MockServer::start().await;
    let _outage = Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .expect(1)
        .mount_as_scoped(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "access_token": "at" })))
        .mount(&server)
        .await;

    let tokens = exchange(&server, fast_retry(3))
        .exchange_code(&grant())
        .await
        .unwrap();

    assert_eq!(tokens.access_token, "at");
    assert_eq!(tokens.token_type, "Bearer");
}

#[tokio::test]
async fn unreachable_provider_is_unavailable() {
    let upstream = UpstreamConfig::default();
    let http = UpstreamTokenExchange::http_client(Duration::from_secs(1)).unwrap();
    // Port 9 (discard) is closed on test hosts
    let exchange = UpstreamTokenExchange::new(
        http,
        "http://127.0.0.1:9/token",
        &upstream,
        RetryPolicy::none(),
    );

    let err = exchange.exchange_code(&grant()).await.unwrap_err();

    assert!(matches!(err, Error::UpstreamUnavailable(_)));
}

#[tokio::test]
async fn refresh_forwards_token_and_scope() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=rt-1"))
        .and(body_string_contains("scope=openid"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "access_token": "fresh" })))
        .expect(1)
        .mount(&server)
        .await;

    let tokens = exchange(&server, RetryPolicy::none())
        .refresh("rt-1", Some("openid"))
        .await
        .unwrap();

    assert_eq!(tokens.access_token, "fresh");
}
