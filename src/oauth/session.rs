//! Authorization sessions
//!
//! A session is created at `/authorize`, keyed by the state the proxy sends
//! upstream. The upstream callback moves it to the issued table under a
//! fresh proxy code, and `/token` removes it for good. Both tables are
//! `DashMap`s, so every transition is a single atomic per-key remove or
//! insert: a code can be redeemed once, a state completed once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use super::pkce::random_token;
use crate::origin::PublicOrigin;
use crate::{Error, Result};

/// One in-flight authorization flow
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationSession {
    /// State sent to the upstream provider (the session key)
    pub state: String,
    /// State supplied by the client, echoed back on its redirect
    pub client_state: Option<String>,
    /// Client's PKCE challenge
    pub code_challenge: String,
    /// Always `S256`
    pub code_challenge_method: String,
    /// Registered client
    pub client_id: String,
    /// Where the client wants the code delivered
    pub requested_redirect_uri: String,
    /// Whether `redirect_uri` was sent explicitly (RFC 6749 §4.1.3 then
    /// requires it at the token endpoint)
    pub redirect_uri_supplied: bool,
    /// Requested scopes
    pub scope: Option<String>,
    /// RFC 8707 resource indicator
    pub resource: Option<String>,
    /// Public origin the flow started under
    pub origin_at_start: PublicOrigin,
    /// `redirect_uri` sent upstream, replayed at code exchange
    pub upstream_redirect_uri: String,
    /// The proxy's own PKCE verifier for the upstream leg
    #[serde(skip)]
    pub upstream_code_verifier: String,
    /// Set once the upstream provider calls back
    #[serde(skip)]
    pub upstream_authorization_code: Option<String>,
    /// When `/authorize` was hit
    pub created_at: DateTime<Utc>,
}

struct Entry {
    session: AuthorizationSession,
    since: Instant,
}

/// Pending sessions and issued proxy codes
pub struct SessionStore {
    pending: DashMap<String, Entry>,
    issued: DashMap<String, Entry>,
    ttl: Duration,
    code_ttl: Duration,
}

impl SessionStore {
    /// `ttl` bounds `/authorize` to callback, `code_ttl` bounds callback to `/token`
    #[must_use]
    pub fn new(ttl: Duration, code_ttl: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            issued: DashMap::new(),
            ttl,
            code_ttl,
        }
    }

    /// Record a new flow
    pub fn begin(&self, session: AuthorizationSession) {
        debug!(client_id = %session.client_id, origin = %session.origin_at_start, "Authorization session started");
        self.pending.insert(
            session.state.clone(),
            Entry {
                session,
                since: Instant::now(),
            },
        );
    }

    /// Attach the upstream code and issue a single-use proxy code
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionExpired`] if the state is unknown, already used,
    /// or older than the session lifetime.
    pub fn complete_callback(
        &self,
        state: &str,
        upstream_code: String,
    ) -> Result<(String, AuthorizationSession)> {
        let (_, entry) = self.pending.remove(state).ok_or(Error::SessionExpired)?;
        if entry.since.elapsed() >= self.ttl {
            return Err(Error::SessionExpired);
        }

        let mut session = entry.session;
        session.upstream_authorization_code = Some(upstream_code);

        let proxy_code = random_token();
        self.issued.insert(
            proxy_code.clone(),
            Entry {
                session: session.clone(),
                since: Instant::now(),
            },
        );
        Ok((proxy_code, session))
    }

    /// Drop a pending flow the upstream provider refused. Returns the session
    /// so the error can be relayed to the client.
    pub fn abandon(&self, state: &str) -> Option<AuthorizationSession> {
        let (_, entry) = self.pending.remove(state)?;
        (entry.since.elapsed() < self.ttl).then_some(entry.session)
    }

    /// Consume a proxy code
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAuthorizationCode`] if the code is unknown,
    /// already redeemed, or expired.
    pub fn redeem(&self, proxy_code: &str) -> Result<AuthorizationSession> {
        let (_, entry) = self.issued.remove(proxy_code).ok_or_else(|| {
            Error::InvalidAuthorizationCode("unknown or already redeemed".to_string())
        })?;
        if entry.since.elapsed() >= self.code_ttl {
            return Err(Error::InvalidAuthorizationCode("expired".to_string()));
        }
        Ok(entry.session)
    }

    /// Evict expired sessions and codes
    pub fn reap_expired(&self) -> usize {
        let before = self.pending.len() + self.issued.len();
        self.pending.retain(|_, e| e.since.elapsed() < self.ttl);
        self.issued.retain(|_, e| e.since.elapsed() < self.code_ttl);
        before.saturating_sub(self.pending.len() + self.issued.len())
    }

    /// Flows awaiting the upstream callback
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Codes awaiting redemption
    pub fn issued_count(&self) -> usize {
        self.issued.len()
    }
}

/// Spawn a background task that reaps expired sessions every `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_reaper(
    store: Arc<SessionStore>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = store.reap_expired();
                    if reaped > 0 {
                        debug!(count = reaped, "Reaped expired authorization sessions");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Session reaper shutting down");
                    break;
                }
            }
        }
    });
}
