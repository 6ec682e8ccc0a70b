//! Proxy server lifecycle

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::router::{AppState, create_router};
use crate::config::{Config, IssuerPolicy, RedirectPolicy};
use crate::oauth::{InMemoryClientStore, UpstreamEndpoints, UpstreamTokenExchange, spawn_reaper};
use crate::retry::RetryPolicy;
use crate::{Error, Result};

/// The OAuth origin proxy
pub struct ProxyServer {
    config: Config,
    state: Arc<AppState>,
}

impl ProxyServer {
    /// Resolve upstream endpoints and wire the application state
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client or origin configuration is invalid.
    pub async fn new(config: Config) -> Result<Self> {
        let http = UpstreamTokenExchange::http_client(config.upstream.timeout)?;
        let upstream = UpstreamEndpoints::discover(&http, &config.upstream).await;

        let exchange = Arc::new(UpstreamTokenExchange::new(
            http.clone(),
            upstream.token_endpoint.clone(),
            &config.upstream,
            RetryPolicy::new(&config.retry),
        ));
        let state = AppState::new(
            &config,
            upstream,
            http,
            exchange,
            Arc::new(InMemoryClientStore::new()),
        )?;

        Ok(Self {
            config,
            state: Arc::new(state),
        })
    }

    /// Shared state, for embedding the router elsewhere
    #[must_use]
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Serve until Ctrl+C or SIGTERM
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound or the server fails.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

        let app = create_router(Arc::clone(&self.state));
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("OAUTH ORIGIN PROXY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(
            authorization_endpoint = %self.state.upstream.authorization_endpoint,
            token_endpoint = %self.state.upstream.token_endpoint,
            jwks_uri = %self.state.upstream.jwks_uri,
            "Upstream provider"
        );
        info!(
            internal_base_url = %self.config.origin.internal_base_url,
            trust_forwarded_headers = self.config.origin.trust_forwarded_headers,
            "Origin resolution"
        );
        info!(resource = %self.config.resource.path, "Protected resource");
        self.log_policy_warnings();

        // Warm the key cache; failures are retried on the first lookup
        let jwks = self.state.verifier.jwks().clone();
        tokio::spawn(async move {
            if let Err(e) = jwks.refresh().await {
                warn!(jwks_uri = %jwks.jwks_uri(), error = %e, "Initial JWKS fetch failed");
            }
        });

        spawn_reaper(
            Arc::clone(&self.state.sessions),
            self.config.sessions.reap_interval,
            shutdown_tx.subscribe(),
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        Ok(())
    }

    fn log_policy_warnings(&self) {
        if self.config.verifier.issuer_policy == IssuerPolicy::Relaxed {
            warn!(
                "Relaxed issuer validation: tokens from any issuer signed by the upstream keys are accepted"
            );
        }
        if self.config.registration.redirect_policy == RedirectPolicy::Wildcard {
            warn!("Wildcard redirect URIs are accepted at registration");
        }
        if self.config.upstream.client_secret.is_none() {
            warn!(
                client_id = %self.config.upstream.client_id,
                "No upstream client secret configured; the proxy acts as a public client"
            );
        }
        if !self.config.origin.trust_forwarded_headers {
            info!(
                default_origin = %self.config.origin.default_origin,
                "Forwarded headers ignored; all URLs use the default origin"
            );
        }
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
