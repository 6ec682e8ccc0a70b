//! Upstream signing key cache
//!
//! # Refresh model
//!
//! - Lookups read an immutable snapshot behind a read lock and never wait on
//!   the network when the `kid` is cached.
//! - A stale snapshot keeps serving while one background task refetches
//!   (stale-while-revalidate).
//! - An unknown `kid` forces a refresh. Forced refreshes are serialized through
//!   one async mutex, bounded by `refresh_timeout`, and throttled by
//!   `min_refresh_interval`. A task that waited on the mutex while another
//!   task refreshed does not fetch again.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use jsonwebtoken::{
    DecodingKey,
    jwk::{AlgorithmParameters, JwkSet},
};
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::JwksConfig;

/// Key lookup failures
#[derive(Debug, Error)]
pub enum JwksError {
    /// The key set could not be fetched or parsed
    #[error("JWKS fetch failed: {0}")]
    Fetch(String),

    /// A refresh did not finish within the configured bound
    #[error("JWKS refresh timed out")]
    Timeout,

    /// No key with this id, even after a refresh
    #[error("Unknown key ID: {0}")]
    UnknownKeyId(String),
}

/// One fetched key set
struct Snapshot {
    set: Arc<JwkSet>,
    keys: HashMap<String, DecodingKey>,
    fetched_at: Instant,
}

impl Snapshot {
    fn from_set(set: JwkSet) -> Self {
        let keys = set
            .keys
            .iter()
            .filter_map(|jwk| {
                let kid = jwk.common.key_id.clone()?;
                decoding_key(&jwk.algorithm).map(|key| (kid, key))
            })
            .collect();
        Self {
            set: Arc::new(set),
            keys,
            fetched_at: Instant::now(),
        }
    }
}

/// Convert public JWK parameters to a decoding key (RSA and EC only)
fn decoding_key(params: &AlgorithmParameters) -> Option<DecodingKey> {
    match params {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
        AlgorithmParameters::EllipticCurve(ec) => {
            DecodingKey::from_ec_components(&ec.x, &ec.y).ok()
        }
        AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => None,
    }
}

struct Inner {
    jwks_uri: String,
    http: Client,
    ttl: Duration,
    refresh_timeout: Duration,
    min_refresh_interval: Duration,
    snapshot: RwLock<Option<Arc<Snapshot>>>,
    refresh_lock: tokio::sync::Mutex<()>,
    /// Bumped on every successful fetch
    generation: AtomicU64,
    last_forced: Mutex<Option<Instant>>,
    background_running: AtomicBool,
}

/// Cache of the upstream provider's JWKS. Cheap to clone.
#[derive(Clone)]
pub struct JwksCache {
    inner: Arc<Inner>,
}

impl JwksCache {
    /// Create an empty cache for `jwks_uri`
    #[must_use]
    pub fn new(jwks_uri: impl Into<String>, http: Client, config: &JwksConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                jwks_uri: jwks_uri.into(),
                http,
                ttl: config.ttl,
                refresh_timeout: config.refresh_timeout,
                min_refresh_interval: config.min_refresh_interval,
                snapshot: RwLock::new(None),
                refresh_lock: tokio::sync::Mutex::new(()),
                generation: AtomicU64::new(0),
                last_forced: Mutex::new(None),
                background_running: AtomicBool::new(false),
            }),
        }
    }

    /// Address the keys are fetched from
    pub fn jwks_uri(&self) -> &str {
        &self.inner.jwks_uri
    }

    /// Decoding key for `kid`, forcing at most one refresh on a miss
    ///
    /// # Errors
    ///
    /// Returns [`JwksError`] if the key is unknown after refreshing or the
    /// refresh failed.
    pub async fn get_key(&self, kid: &str) -> Result<DecodingKey, JwksError> {
        if let Some(snapshot) = self.snapshot() {
            if let Some(key) = snapshot.keys.get(kid) {
                if snapshot.fetched_at.elapsed() >= self.inner.ttl {
                    self.spawn_background_refresh();
                }
                return Ok(key.clone());
            }
        }

        debug!(kid = %kid, "Key not found in cached JWKS, refreshing");
        self.forced_refresh().await?;

        self.snapshot()
            .and_then(|s| s.keys.get(kid).cloned())
            .ok_or_else(|| JwksError::UnknownKeyId(kid.to_string()))
    }

    /// The current key set, fetching it first if nothing is cached
    ///
    /// # Errors
    ///
    /// Returns [`JwksError`] if nothing is cached and the fetch fails.
    pub async fn current_set(&self) -> Result<Arc<JwkSet>, JwksError> {
        if let Some(snapshot) = self.snapshot() {
            if snapshot.fetched_at.elapsed() >= self.inner.ttl {
                self.spawn_background_refresh();
            }
            return Ok(Arc::clone(&snapshot.set));
        }

        self.forced_refresh().await?;
        self.snapshot()
            .map(|s| Arc::clone(&s.set))
            .ok_or_else(|| JwksError::Fetch("no key set available".to_string()))
    }

    /// Fetch unconditionally (used to warm the cache at startup)
    ///
    /// # Errors
    ///
    /// Returns [`JwksError`] if the fetch fails or times out.
    pub async fn refresh(&self) -> Result<(), JwksError> {
        let _guard = self.inner.refresh_lock.lock().await;
        timeout(self.inner.refresh_timeout, self.fetch_and_store())
            .await
            .map_err(|_| JwksError::Timeout)?
    }

    fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.inner.snapshot.read().clone()
    }

    async fn forced_refresh(&self) -> Result<(), JwksError> {
        let seen = self.inner.generation.load(Ordering::Acquire);

        let _guard = timeout(self.inner.refresh_timeout, self.inner.refresh_lock.lock())
            .await
            .map_err(|_| JwksError::Timeout)?;

        if self.inner.generation.load(Ordering::Acquire) != seen {
            debug!("JWKS refreshed by another task while waiting");
            return Ok(());
        }

        {
            let mut last = self.inner.last_forced.lock();
            if let Some(at) = *last {
                if at.elapsed() < self.inner.min_refresh_interval {
                    debug!("Forced JWKS refresh throttled");
                    return Ok(());
                }
            }
            *last = Some(Instant::now());
        }

        timeout(self.inner.refresh_timeout, self.fetch_and_store())
            .await
            .map_err(|_| JwksError::Timeout)?
    }

    fn spawn_background_refresh(&self) {
        if self.inner.background_running.swap(true, Ordering::AcqRel) {
            return;
        }

        let cache = self.clone();
        tokio::spawn(async move {
            let seen = cache.inner.generation.load(Ordering::Acquire);
            {
                let _guard = cache.inner.refresh_lock.lock().await;
                if cache.inner.generation.load(Ordering::Acquire) == seen {
                    match timeout(cache.inner.refresh_timeout, cache.fetch_and_store()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(error = %e, "Background JWKS refresh failed, serving stale keys"),
                        Err(_) => warn!("Background JWKS refresh timed out, serving stale keys"),
                    }
                }
            }
            cache.inner.background_running.store(false, Ordering::Release);
        });
    }

    async fn fetch_and_store(&self) -> Result<(), JwksError> {
        debug!(uri = %self.inner.jwks_uri, "Fetching JWKS");
        let response = self
            .inner
            .http
            .get(&self.inner.jwks_uri)
            .send()
            .await
            .map_err(|e| JwksError::Fetch(e.to_string()))?;

        if !response.status().is_success() {
            return Err(JwksError::Fetch(format!("HTTP {}", response.status())));
        }

        let set: JwkSet = response
            .json()
            .await
            .map_err(|e| JwksError::Fetch(e.to_string()))?;

        let snapshot = Snapshot::from_set(set);
        info!(keys = snapshot.keys.len(), "JWKS loaded");
        *self.inner.snapshot.write() = Some(Arc::new(snapshot));
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}
