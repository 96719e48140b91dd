//! HTTP edge server for multi-tenant static sites.
//!
//! This crate provides the request plane:
//! - Domain map, reconciliation watcher, TLS SNI certificate selection
//! - The request pipeline (health, redirects, ACME, artifact proxy,
//!   access control, rate limiting, `_redirects`, file serving)
//! - OAuth session layer and cross-domain code relay handlers
//! - Shared connection limiting across listeners

pub mod acme;
pub mod artifact;
pub mod auth;
pub mod domains;
pub mod error;
pub mod listener;
pub mod metrics;
pub mod pipeline;
pub mod ratelimit;
pub mod redirects;
pub mod serving;
pub mod state;
pub mod tls;

pub use error::PagesError;
pub use pipeline::{create_router, ListenerKind};
pub use ratelimit::RateLimitState;
pub use state::AppState;
