//! The archive cache: canonical-URL keyed, TTL'd, size-capped.

use crate::archive::{AuxCaches, ZipArchive};
use crate::chunks::ChunkCache;
use crate::error::{VfsError, VfsResult};
use crate::metrics;
use pagoda_core::config::ZipConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use url::Url;

struct ArchiveEntry {
    archive: Arc<ZipArchive>,
    expires_at: Instant,
    last_used: Instant,
}

struct ZipVfsInner {
    client: reqwest::Client,
    chunk_cache: Arc<ChunkCache>,
    aux: Arc<AuxCaches>,
    archives: Mutex<HashMap<String, ArchiveEntry>>,
    open_timeout: Duration,
    expiration: Duration,
    refresh: Duration,
    cleanup: Duration,
    max_archives: usize,
}

/// ZIP virtual file system: hands out opened archives for artifact URLs.
///
/// Archives are keyed by their canonical URL (query string stripped) so
/// that re-signed URLs land on the same cache entry while the resource's
/// fetch URL is refreshed in place.
#[derive(Clone)]
pub struct ZipVfs {
    inner: Arc<ZipVfsInner>,
}

impl ZipVfs {
    pub fn new(config: &ZipConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("building vfs http client");

        Self {
            inner: Arc::new(ZipVfsInner {
                client,
                chunk_cache: Arc::new(ChunkCache::new(
                    config.chunk_size,
                    config.chunk_cache_bytes,
                )),
                aux: Arc::new(AuxCaches::new(
                    config.data_offset_items,
                    config.readlink_items,
                )),
                archives: Mutex::new(HashMap::new()),
                open_timeout: config.open_timeout(),
                expiration: config.cache_expiration(),
                refresh: config.cache_refresh(),
                cleanup: config.cache_cleanup(),
                max_archives: config.max_archives.max(1),
            }),
        }
    }

    /// Open (or fetch from cache) the archive serving `url` and return it as
    /// a serving root.
    pub async fn root(&self, url: &str) -> VfsResult<Arc<ZipArchive>> {
        let key = canonical_key(url)?;

        let archive = {
            let mut archives = self.inner.archives.lock().expect("archive cache lock poisoned");
            let now = Instant::now();

            let reuse = match archives.get_mut(&key) {
                Some(entry) if now < entry.expires_at => {
                    metrics::ZIP_ARCHIVE_CACHE.with_label_values(&["hit"]).inc();
                    entry.last_used = now;
                    Some(entry.archive.clone())
                }
                // Recently expired entries are refreshed in place rather than
                // re-parsed; the content validator keeps stale data honest.
                Some(entry) if now < entry.expires_at + self.inner.refresh => {
                    metrics::ZIP_ARCHIVE_CACHE
                        .with_label_values(&["refresh"])
                        .inc();
                    entry.expires_at = now + self.inner.expiration;
                    entry.last_used = now;
                    Some(entry.archive.clone())
                }
                _ => None,
            };

            match reuse {
                Some(archive) => archive,
                None => {
                    if let Some(old) = archives.remove(&key) {
                        metrics::ZIP_CACHED_ARCHIVES.dec();
                        old.archive.on_evicted();
                    }
                    metrics::ZIP_ARCHIVE_CACHE.with_label_values(&["miss"]).inc();

                    if archives.len() >= self.inner.max_archives {
                        self.evict_for_capacity(&mut archives);
                    }

                    let archive = ZipArchive::new(
                        key.clone(),
                        self.inner.client.clone(),
                        self.inner.chunk_cache.clone(),
                        self.inner.aux.clone(),
                        self.inner.open_timeout,
                    );
                    archives.insert(
                        key.clone(),
                        ArchiveEntry {
                            archive: archive.clone(),
                            expires_at: now + self.inner.expiration,
                            last_used: now,
                        },
                    );
                    metrics::ZIP_CACHED_ARCHIVES.inc();
                    archive
                }
            }
        };

        // Subsequent range reads must use the freshest signature.
        archive.set_url(url);
        archive.ensure_open(url).await?;
        Ok(archive)
    }

    /// Spawn the background task that expires idle archives.
    pub fn spawn_cleanup_task(&self) -> tokio::task::JoinHandle<()> {
        let vfs = self.clone();
        let interval = self.inner.cleanup.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let evicted = vfs.cleanup();
                if evicted > 0 {
                    tracing::debug!(evicted, "evicted expired zip archives");
                }
            }
        })
    }

    /// Remove archives expired beyond the refresh window. Returns the number
    /// evicted.
    pub fn cleanup(&self) -> usize {
        let mut archives = self.inner.archives.lock().expect("archive cache lock poisoned");
        let now = Instant::now();
        let refresh = self.inner.refresh;

        let before = archives.len();
        let mut evicted = Vec::new();
        archives.retain(|_, entry| {
            if now >= entry.expires_at + refresh {
                evicted.push(entry.archive.clone());
                false
            } else {
                true
            }
        });

        for archive in &evicted {
            metrics::ZIP_CACHED_ARCHIVES.dec();
            archive.on_evicted();
        }
        before - archives.len()
    }

    /// Evict a fifth of the cache, least recently used first. Called with
    /// the lock held, never across I/O.
    fn evict_for_capacity(&self, archives: &mut HashMap<String, ArchiveEntry>) {
        let prune = (self.inner.max_archives / 5).max(1);
        let mut by_age: Vec<(String, Instant)> = archives
            .iter()
            .map(|(key, entry)| (key.clone(), entry.last_used))
            .collect();
        by_age.sort_by_key(|(_, at)| *at);

        for (key, _) in by_age.into_iter().take(prune) {
            if let Some(entry) = archives.remove(&key) {
                metrics::ZIP_CACHED_ARCHIVES.dec();
                entry.archive.on_evicted();
            }
        }
    }

    pub fn cached_archives(&self) -> usize {
        self.inner.archives.lock().expect("archive cache lock poisoned").len()
    }
}

/// Cache key for an archive URL: scheme, host and path, with the volatile
/// query string (signatures) and fragment stripped.
fn canonical_key(url: &str) -> VfsResult<String> {
    let mut parsed = Url::parse(url).map_err(|e| VfsError::InvalidUrl(e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(VfsError::InvalidUrl(format!(
            "unsupported scheme: {}",
            parsed.scheme()
        )));
    }
    parsed.set_query(None);
    parsed.set_fragment(None);
    Ok(parsed.to_string())
}
