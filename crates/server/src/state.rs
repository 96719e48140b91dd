//! Application state shared across handlers.

use crate::artifact::Artifact;
use crate::auth::Auth;
use crate::domains::DomainMap;
use crate::ratelimit::RateLimitState;
use crate::redirects::Redirects;
use axum::http::{HeaderName, HeaderValue};
use pagoda_core::config::AppConfig;
use pagoda_source::CachedSource;
use pagoda_vfs::cache::BoundedCache;
use pagoda_vfs::ZipVfs;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// ZIP virtual file system.
    pub vfs: ZipVfs,
    /// Cached domain source.
    pub source: CachedSource,
    /// Process-wide host map, swapped by the watcher.
    pub domains: Arc<DomainMap>,
    /// OAuth layer, when access control is configured.
    pub auth: Option<Arc<Auth>>,
    /// Per-domain rate limiting.
    pub rate_limit: RateLimitState,
    /// Artifact reverse proxy, when configured.
    pub artifact: Option<Arc<Artifact>>,
    /// Parsed `_redirects` per archive namespace.
    pub redirects: Arc<BoundedCache<Arc<Redirects>>>,
    /// Extra response headers from configuration.
    pub custom_headers: Arc<Vec<(HeaderName, HeaderValue)>>,
}

impl AppState {
    /// Build the state from configuration.
    ///
    /// # Panics
    ///
    /// Panics when the rate-limit configuration is invalid; warnings for
    /// odd but usable settings are logged.
    pub fn new(config: AppConfig, source: CachedSource) -> Self {
        match config.rate_limit.validate() {
            Ok(warnings) => {
                for warning in warnings {
                    tracing::warn!("configuration warning: {warning}");
                }
            }
            Err(error) => panic!("invalid rate limit configuration: {error}"),
        }

        let vfs = ZipVfs::new(&config.zip);
        let rate_limit = RateLimitState::new(&config.rate_limit);
        let auth = config
            .auth
            .as_ref()
            .map(|auth_config| Arc::new(Auth::new(auth_config, &config.gitlab)));

        let artifact = match (&config.artifacts, &config.server.pages_domain) {
            (Some(artifacts), Some(pages_domain)) => {
                Some(Arc::new(Artifact::new(artifacts, pages_domain)))
            }
            (Some(_), None) => {
                tracing::warn!(
                    "artifacts server configured without server.pages_domain, disabling artifact proxy"
                );
                None
            }
            _ => None,
        };

        let custom_headers = config
            .server
            .parsed_custom_headers()
            .into_iter()
            .filter_map(|(name, value)| {
                match (
                    name.parse::<HeaderName>(),
                    value.parse::<HeaderValue>(),
                ) {
                    (Ok(name), Ok(value)) => Some((name, value)),
                    _ => {
                        tracing::warn!(header = %name, "skipping malformed custom header");
                        None
                    }
                }
            })
            .collect();

        Self {
            config: Arc::new(config),
            vfs,
            source,
            domains: DomainMap::new(),
            auth,
            rate_limit,
            artifact,
            redirects: Arc::new(BoundedCache::new(1000)),
            custom_headers: Arc::new(custom_headers),
        }
    }
}
