//! Prometheus metrics for the ZIP VFS.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::LazyLock;

pub static ZIP_OPENED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("pagoda_zip_opened_total", "Zip archives opened, by outcome"),
        &["state"],
    )
    .expect("metric creation failed")
});

pub static ZIP_OPENED_ENTRIES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "pagoda_zip_opened_entries_total",
        "File entries indexed while opening zip archives",
    )
    .expect("metric creation failed")
});

pub static ZIP_CACHED_ARCHIVES: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "pagoda_zip_cached_archives",
        "Zip archives currently held in the VFS cache",
    )
    .expect("metric creation failed")
});

pub static ZIP_ARCHIVE_ENTRIES_CACHED: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "pagoda_zip_archive_entries_cached",
        "File entries currently held by cached archives",
    )
    .expect("metric creation failed")
});

pub static ZIP_ARCHIVE_CACHE: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "pagoda_zip_archive_cache_total",
            "Archive cache operations, by kind",
        ),
        &["op"],
    )
    .expect("metric creation failed")
});

pub static ZIP_CHUNK_FETCHES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "pagoda_zip_chunk_fetches_total",
        "Range requests issued against remote archives",
    )
    .expect("metric creation failed")
});

/// Register the VFS metrics into a registry. Duplicate registration (tests
/// building several servers) is ignored.
pub fn register(registry: &Registry) {
    let _ = registry.register(Box::new(ZIP_OPENED.clone()));
    let _ = registry.register(Box::new(ZIP_OPENED_ENTRIES.clone()));
    let _ = registry.register(Box::new(ZIP_CACHED_ARCHIVES.clone()));
    let _ = registry.register(Box::new(ZIP_ARCHIVE_ENTRIES_CACHED.clone()));
    let _ = registry.register(Box::new(ZIP_ARCHIVE_CACHE.clone()));
    let _ = registry.register(Box::new(ZIP_CHUNK_FETCHES.clone()));
}
