//! Dynamic-Origin OAuth Proxy
//!
//! Fronts a fixed identity provider for a service whose public address is
//! not fixed (tunnels, reverse proxies, ephemeral hostnames).
//!
//! # Features
//!
//! - **Per-request origin**: discovery documents, redirects and error headers
//!   always use the origin the request arrived through
//! - **Flow-pinned exchange**: the code exchange replays the redirect URI the
//!   flow started with, even if the client finishes under another origin
//! - **Dynamic client registration** (RFC 7591) with strict or glob redirect policies
//! - **Bearer verification** against the provider's JWKS, relaxed or strict issuer policy
//! - **Production ready**: structured logging, retries, graceful shutdown

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod oauth;
pub mod origin;
pub mod proxy;
pub mod retry;
pub mod verifier;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` wins over `level` when set.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {e}"))),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {e}"))),
    }
}
