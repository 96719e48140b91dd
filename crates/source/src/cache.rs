//! Short-TTL positive/negative cache in front of the domain source.

use crate::client::Client;
use crate::error::SourceResult;
use pagoda_core::config::GitLabConfig;
use pagoda_core::domain::VirtualDomain;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A cached lookup outcome. Negative results (unknown hosts) are cached
/// too, with their own shorter TTL, so hammering an unconfigured host does
/// not hammer the API.
#[derive(Clone)]
enum CachedLookup {
    Found(Arc<VirtualDomain>),
    NotFound,
}

struct CacheEntry {
    lookup: CachedLookup,
    expires_at: Instant,
}

/// Domain source with per-host result caching.
#[derive(Clone)]
pub struct CachedSource {
    client: Client,
    positive_ttl: Duration,
    negative_ttl: Duration,
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl CachedSource {
    pub fn new(config: &GitLabConfig) -> SourceResult<Self> {
        Ok(Self {
            client: Client::new(config)?,
            positive_ttl: Duration::from_secs(config.domain_cache_secs),
            negative_ttl: Duration::from_secs(config.negative_cache_secs),
            entries: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Resolve a host, consulting the cache first. Errors are not cached:
    /// a flaky source should not pin failures.
    pub async fn get_domain(&self, host: &str) -> SourceResult<Option<Arc<VirtualDomain>>> {
        if let Some(cached) = self.lookup_cached(host) {
            return Ok(match cached {
                CachedLookup::Found(domain) => Some(domain),
                CachedLookup::NotFound => None,
            });
        }

        let resolved = self.client.get_virtual_domain(host).await?;
        let (lookup, ttl) = match resolved {
            Some(domain) => (CachedLookup::Found(Arc::new(domain)), self.positive_ttl),
            None => (CachedLookup::NotFound, self.negative_ttl),
        };

        let result = match &lookup {
            CachedLookup::Found(domain) => Some(domain.clone()),
            CachedLookup::NotFound => None,
        };

        self.entries.lock().expect("source cache lock poisoned").insert(
            host.to_string(),
            CacheEntry {
                lookup,
                expires_at: Instant::now() + ttl,
            },
        );

        Ok(result)
    }

    /// Resolve a host, bypassing and repopulating the cache. Used by the
    /// domain-map watcher.
    pub async fn refresh_domain(&self, host: &str) -> SourceResult<Option<Arc<VirtualDomain>>> {
        self.entries
            .lock()
            .expect("source cache lock poisoned")
            .remove(host);
        self.get_domain(host).await
    }

    fn lookup_cached(&self, host: &str) -> Option<CachedLookup> {
        let mut entries = self.entries.lock().expect("source cache lock poisoned");
        match entries.get(host) {
            Some(entry) if Instant::now() < entry.expires_at => {
                metrics_hit();
                Some(entry.lookup.clone())
            }
            Some(_) => {
                entries.remove(host);
                metrics_miss();
                None
            }
            None => {
                metrics_miss();
                None
            }
        }
    }

    /// Shed expired entries; called opportunistically by the watcher.
    pub fn prune(&self) {
        let now = Instant::now();
        self.entries
            .lock()
            .expect("source cache lock poisoned")
            .retain(|_, entry| now < entry.expires_at);
    }

    pub async fn poll(&self, retries: u32, interval: Duration) -> SourceResult<()> {
        self.client.poll(retries, interval).await
    }
}

// Metric hooks live in the server crate's registry; the source crate only
// counts through these free functions so it stays prometheus-free.
fn metrics_hit() {
    counter_hook(true);
}

fn metrics_miss() {
    counter_hook(false);
}

static COUNTER_HOOK: std::sync::OnceLock<fn(bool)> = std::sync::OnceLock::new();

fn counter_hook(hit: bool) {
    if let Some(hook) = COUNTER_HOOK.get() {
        hook(hit);
    }
}

/// Install a cache hit/miss observer (`true` = hit). One installation per
/// process; later calls are ignored.
pub fn set_cache_observer(hook: fn(bool)) {
    let _ = COUNTER_HOOK.set(hook);
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn config(base: &str, positive: u64, negative: u64) -> GitLabConfig {
        GitLabConfig {
            internal_server: base.to_string(),
            domain_cache_secs: positive,
            negative_cache_secs: negative,
            ..Default::default()
        }
    }

    fn domain_body() -> serde_json::Value {
        serde_json::json!({
            "lookup_paths": [{
                "prefix": "/",
                "source": {"type": "zip", "path": "http://store/pub.zip"}
            }]
        })
    }

    #[tokio::test]
    async fn positive_results_are_cached() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/v4/internal/pages")
                    .query_param("host", "foo.test");
                then.status(200).json_body(domain_body());
            })
            .await;

        let source = CachedSource::new(&config(&server.base_url(), 60, 10)).unwrap();
        let first = source.get_domain("foo.test").await.unwrap().unwrap();
        let second = source.get_domain("foo.test").await.unwrap().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn negative_results_are_cached() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/api/v4/internal/pages");
                then.status(204);
            })
            .await;

        let source = CachedSource::new(&config(&server.base_url(), 60, 60)).unwrap();
        assert!(source.get_domain("nope.test").await.unwrap().is_none());
        assert!(source.get_domain("nope.test").await.unwrap().is_none());
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let server = MockServer::start_async().await;
        let failing = server
            .mock_async(|when, then| {
                when.method(GET).path("/api/v4/internal/pages");
                then.status(502);
            })
            .await;

        let source = CachedSource::new(&config(&server.base_url(), 60, 60)).unwrap();
        assert!(source.get_domain("foo.test").await.is_err());

        failing.delete_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/v4/internal/pages");
                then.status(200).json_body(domain_body());
            })
            .await;

        assert!(source.get_domain("foo.test").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn refresh_bypasses_the_cache() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/api/v4/internal/pages");
                then.status(200).json_body(domain_body());
            })
            .await;

        let source = CachedSource::new(&config(&server.base_url(), 600, 600)).unwrap();
        source.get_domain("foo.test").await.unwrap();
        source.refresh_domain("foo.test").await.unwrap();
        mock.assert_hits_async(2).await;
    }
}
