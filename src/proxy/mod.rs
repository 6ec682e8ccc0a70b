//! HTTP front of the proxy

mod auth;
mod forward;
mod handlers;
mod router;
mod server;

pub use forward::{AUTHENTICATED_SUBJECT, Forwarder};
pub use router::{AppState, create_router};
pub use server::ProxyServer;
