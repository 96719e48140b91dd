//! Core domain types and shared logic for the pagoda edge server.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Virtual domains and their lookup paths
//! - Lookup-path resolution for request paths
//! - Application configuration
//! - Host normalization helpers

pub mod config;
pub mod domain;
pub mod error;
pub mod host;

pub use config::AppConfig;
pub use domain::{LookupPath, ResolvedLookup, VirtualDomain};
pub use error::{Error, Result};

/// Default lifetime of an authenticated session cookie: 10 minutes.
pub const SESSION_MAX_AGE_SECS: u64 = 60 * 10;

/// Name of the session cookie presented to tenant browsers.
pub const SESSION_COOKIE_NAME: &str = "gitlab-pages";

/// Path serving OAuth callbacks on the pages domain and on tenants.
pub const AUTH_CALLBACK_PATH: &str = "/auth";

/// Prefix of ACME HTTP-01 challenge requests.
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";
