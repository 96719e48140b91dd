//! Domain-source client for the pagoda edge server.
//!
//! Virtual-domain descriptors come from the GitLab internal pages API.
//! [`client::Client`] speaks the wire protocol; [`cache::CachedSource`]
//! wraps it in a short-TTL positive/negative cache, which is what the
//! request hot path talks to.

pub mod api;
pub mod cache;
pub mod client;
pub mod error;

pub use cache::CachedSource;
pub use client::Client;
pub use error::{SourceError, SourceResult};
