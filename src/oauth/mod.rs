//! OAuth 2.0 building blocks for the proxy
//!
//! - Published metadata (RFC 8414, RFC 9728) and its per-origin rewriting
//! - Dynamic client registration (RFC 7591)
//! - Authorization sessions spanning `/authorize` to `/token`
//! - PKCE (RFC 7636) on both legs of the flow
//! - Token exchange against the upstream identity provider

mod exchange;
pub mod metadata;
pub mod pkce;
mod registrar;
mod rewrite;
mod session;
mod token;
mod upstream;

pub use exchange::{CodeGrant, TokenExchange, UpstreamTokenExchange};
pub use metadata::{AuthorizationServerMetadata, OpenIdConfiguration, ProtectedResourceMetadata};
pub use registrar::{
    ClientRegistrar, ClientRegistration, ClientStore, InMemoryClientStore, RegistrationRequest,
    RegistrationResponse,
};
pub use rewrite::MetadataRewriter;
pub use session::{AuthorizationSession, SessionStore, spawn_reaper};
pub use token::TokenSet;
pub use upstream::UpstreamEndpoints;
