//! Prometheus metrics for the request plane.
//!
//! The `/metrics` endpoint is served on its own listener address and is
//! expected to be network-restricted to the Prometheus scrapers at the
//! infrastructure level.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static SESSIONS_ACTIVE: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "pagoda_sessions_active",
        "HTTP requests currently being served",
    )
    .expect("metric creation failed")
});

pub static REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("pagoda_requests_total", "Processed requests"),
        &["status", "method"],
    )
    .expect("metric creation failed")
});

pub static RATE_LIMITED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "pagoda_rate_limited_total",
        "Requests rejected by the per-domain rate limiter",
    )
    .expect("metric creation failed")
});

pub static DOMAIN_SOURCE_CACHE: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "pagoda_domain_source_cache_total",
            "Domain source cache lookups, by outcome",
        ),
        &["op"],
    )
    .expect("metric creation failed")
});

pub static LIMIT_LISTENER_MAX_CONNS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "pagoda_limit_listener_max_conns",
        "Configured shared connection cap across listeners",
    )
    .expect("metric creation failed")
});

static REGISTER: Once = Once::new();

/// Register all metrics (server and VFS) into [`REGISTRY`]. Idempotent.
pub fn register_metrics() {
    REGISTER.call_once(|| {
        let _ = REGISTRY.register(Box::new(SESSIONS_ACTIVE.clone()));
        let _ = REGISTRY.register(Box::new(REQUESTS_TOTAL.clone()));
        let _ = REGISTRY.register(Box::new(RATE_LIMITED_TOTAL.clone()));
        let _ = REGISTRY.register(Box::new(DOMAIN_SOURCE_CACHE.clone()));
        let _ = REGISTRY.register(Box::new(LIMIT_LISTENER_MAX_CONNS.clone()));
        pagoda_vfs::metrics::register(&REGISTRY);

        pagoda_source::cache::set_cache_observer(|hit| {
            let op = if hit { "hit" } else { "miss" };
            DOMAIN_SOURCE_CACHE.with_label_values(&[op]).inc();
        });
    });
}

/// Serve the registry in Prometheus text format.
pub async fn metrics_handler() -> impl IntoResponse {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", prometheus::TEXT_FORMAT)],
            buffer,
        )
            .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
