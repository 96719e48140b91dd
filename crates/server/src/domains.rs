//! Process-wide domain map, on-demand resolution and the reconciliation
//! watcher.

use crate::state::AppState;
use pagoda_core::domain::VirtualDomain;
use pagoda_core::host;
use pagoda_source::{CachedSource, SourceResult};
use rustls::sign::CertifiedKey;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;

/// A virtual domain plus its request-plane companions: the lazily
/// assembled TLS key pair.
pub struct Domain {
    pub inner: Arc<VirtualDomain>,
    /// Memoized parse of the tenant certificate. `Some(None)` records a
    /// parse failure so it is paid once, not per handshake.
    certified: OnceLock<Option<Arc<CertifiedKey>>>,
}

impl Domain {
    pub fn new(inner: Arc<VirtualDomain>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            certified: OnceLock::new(),
        })
    }

    /// The tenant's TLS key pair, assembled on first use.
    pub fn certificate(&self) -> Option<Arc<CertifiedKey>> {
        self.certified
            .get_or_init(|| {
                let (cert, key) = match (&self.inner.certificate, &self.inner.key) {
                    (Some(cert), Some(key)) => (cert, key),
                    _ => return None,
                };
                match crate::tls::certified_key_from_pem(cert.as_bytes(), key.as_bytes()) {
                    Ok(certified) => Some(Arc::new(certified)),
                    Err(err) => {
                        tracing::warn!(
                            domain = %self.inner.name,
                            error = %err,
                            "failed to assemble tenant certificate"
                        );
                        None
                    }
                }
            })
            .clone()
    }

}

/// `host -> domain` mapping behind an RW lock. The map reference is swapped
/// wholesale by the watcher; it is never mutated entry by entry, so readers
/// see either the pre- or the post-swap view.
pub struct DomainMap {
    map: RwLock<Option<Arc<HashMap<String, Arc<Domain>>>>>,
    /// Hosts ever resolved through the source; the watcher reconciles these.
    known_hosts: Mutex<HashSet<String>>,
}

impl DomainMap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            map: RwLock::new(None),
            known_hosts: Mutex::new(HashSet::new()),
        })
    }

    /// Readiness: the watcher has published at least one map.
    pub fn is_ready(&self) -> bool {
        self.map.read().expect("domain map lock poisoned").is_some()
    }

    pub fn get(&self, request_host: &str) -> Option<Arc<Domain>> {
        let normalized = host::normalize(request_host);
        self.map
            .read()
            .expect("domain map lock poisoned")
            .as_ref()?
            .get(&normalized)
            .cloned()
    }

    /// Swap in a freshly built map.
    pub fn update(&self, new_map: HashMap<String, Arc<Domain>>) {
        *self.map.write().expect("domain map lock poisoned") = Some(Arc::new(new_map));
    }

    pub fn record_host(&self, normalized_host: &str) {
        self.known_hosts
            .lock()
            .expect("known hosts lock poisoned")
            .insert(normalized_host.to_string());
    }

    fn known_hosts(&self) -> Vec<String> {
        self.known_hosts
            .lock()
            .expect("known hosts lock poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

impl Default for DomainMap {
    fn default() -> Self {
        Self {
            map: RwLock::new(None),
            known_hosts: Mutex::new(HashSet::new()),
        }
    }
}

/// Resolve a request host to a domain: the published map first, the cached
/// source on a miss. Hosts resolved on demand are remembered so the watcher
/// folds them into the next swap.
pub async fn resolve_domain(
    state: &AppState,
    request_host: &str,
) -> SourceResult<Option<Arc<Domain>>> {
    let normalized = host::normalize(request_host);

    if let Some(domain) = state.domains.get(&normalized) {
        return Ok(Some(domain));
    }

    match state.source.get_domain(&normalized).await? {
        Some(inner) => {
            state.domains.record_host(&normalized);
            Ok(Some(Domain::new(inner)))
        }
        None => Ok(None),
    }
}

/// Spawn the watcher that periodically re-resolves every known host and
/// swaps the map atomically. The first tick publishes an initial (possibly
/// empty) map, flipping the readiness probe.
pub fn spawn_watcher(
    domains: Arc<DomainMap>,
    source: CachedSource,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        reconcile(&domains, &source).await;

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // first tick fires immediately
        loop {
            ticker.tick().await;
            reconcile(&domains, &source).await;
            source.prune();
        }
    })
}

async fn reconcile(domains: &Arc<DomainMap>, source: &CachedSource) {
    let hosts = domains.known_hosts();
    let mut new_map = HashMap::with_capacity(hosts.len());

    for host in hosts {
        match source.refresh_domain(&host).await {
            Ok(Some(inner)) => {
                new_map.insert(host, Domain::new(inner));
            }
            Ok(None) => {
                tracing::debug!(%host, "host no longer configured, dropping from map");
            }
            Err(err) => {
                // Keep serving the last-known state for this host.
                tracing::warn!(%host, error = %err, "domain refresh failed, keeping last-known entry");
                if let Some(previous) = domains.get(&host) {
                    new_map.insert(host, previous);
                }
            }
        }
    }

    domains.update(new_map);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagoda_core::domain::LookupPath;

    fn virtual_domain(name: &str) -> Arc<VirtualDomain> {
        Arc::new(VirtualDomain {
            name: name.to_string(),
            lookup_paths: vec![LookupPath {
                prefix: "/".to_string(),
                source: "http://store/pub.zip".to_string(),
                https_only: false,
                access_control: false,
                project_id: 0,
            }],
            ..Default::default()
        })
    }

    #[test]
    fn map_swap_is_wholesale() {
        let map = DomainMap::new();
        assert!(!map.is_ready());
        assert!(map.get("foo.test").is_none());

        let mut first = HashMap::new();
        first.insert("foo.test".to_string(), Domain::new(virtual_domain("foo.test")));
        map.update(first);

        assert!(map.is_ready());
        assert!(map.get("foo.test").is_some());
        assert!(map.get("FOO.test:8080").is_some()); // normalized lookup

        // An empty swap removes everything at once.
        map.update(HashMap::new());
        assert!(map.is_ready());
        assert!(map.get("foo.test").is_none());
    }

    #[test]
    fn certificate_memoizes_failures() {
        let inner = Arc::new(VirtualDomain {
            name: "bad.test".to_string(),
            certificate: Some("not a pem".to_string()),
            key: Some("not a key".to_string()),
            ..Default::default()
        });
        let domain = Domain::new(inner);
        assert!(domain.certificate().is_none());
        assert!(domain.certificate().is_none());
    }
}
