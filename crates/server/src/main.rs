//! Pagoda server binary.

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use pagoda_core::config::AppConfig;
use pagoda_server::listener::{serve_tls, LimitedTcpListener, SharedLimiter};
use pagoda_server::tls::{certified_key_from_pem, server_config, SniResolver};
use pagoda_server::{create_router, domains, metrics, ratelimit, AppState, ListenerKind};
use pagoda_source::CachedSource;
use rustls::sign::CertifiedKey;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Pagoda - a multi-tenant static site server for zip archives
#[derive(Parser, Debug)]
#[command(name = "pagodad")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "PAGODA_CONFIG",
        default_value = "config/pagoda.toml"
    )]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Pagoda v{}", env!("CARGO_PKG_VERSION"));

    // Configuration: optional file, PAGODA_ env vars provide or override.
    let config_path = std::path::Path::new(&args.config);
    let mut figment = Figment::new();
    if config_path.exists() {
        tracing::info!(config_path = %args.config, "loading configuration from file");
        figment = figment.merge(Toml::file(&args.config));
    } else {
        tracing::debug!("no config file found at {}", args.config);
    }
    let config: AppConfig = figment
        .merge(Env::prefixed("PAGODA_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    if config.server.listen_http.is_empty()
        && config.server.listen_https.is_empty()
        && config.server.listen_proxy.is_empty()
    {
        anyhow::bail!(
            "no listeners configured: set server.listen_http, server.listen_https \
             or server.listen_proxy"
        );
    }

    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .ok();

    metrics::register_metrics();
    tracing::info!("prometheus metrics registered");

    let source = CachedSource::new(&config.gitlab).context("building domain source client")?;

    // The server starts serving only once the domain source answers; the
    // readiness probe stays 503 until the watcher publishes its first map.
    source
        .poll(3, Duration::from_secs(1))
        .await
        .context("domain source is not reachable")?;

    let watch_interval = Duration::from_secs(config.gitlab.watch_interval_secs.max(1));
    let state = AppState::new(config, source);

    let _watcher = domains::spawn_watcher(state.domains.clone(), state.source.clone(), watch_interval);
    let _vfs_cleanup = state.vfs.spawn_cleanup_task();
    if state.rate_limit.is_enabled() {
        let interval = state.config.rate_limit.cleanup_interval();
        let _rate_limit_cleanup = ratelimit::spawn_cleanup_task(state.rate_limit.clone(), interval);
        tracing::info!(
            interval_secs = interval.as_secs(),
            "rate limiter cleanup task spawned"
        );
    }

    let limiter = SharedLimiter::new(state.config.server.max_conns);
    metrics::LIMIT_LISTENER_MAX_CONNS.set(state.config.server.max_conns as i64);

    let mut tasks = Vec::new();

    for addr in &state.config.server.listen_http {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind http listener {addr}"))?;
        tracing::info!(%addr, "listening for http");
        let app = create_router(state.clone(), ListenerKind::Http);
        let listener = LimitedTcpListener::new(listener, limiter.clone());
        tasks.push(tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                tracing::error!(error = %err, "http listener failed");
            }
        }));
    }

    for addr in &state.config.server.listen_proxy {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind proxy listener {addr}"))?;
        tracing::info!(%addr, "listening for proxied http");
        let app = create_router(state.clone(), ListenerKind::Proxy);
        let listener = LimitedTcpListener::new(listener, limiter.clone());
        tasks.push(tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                tracing::error!(error = %err, "proxy listener failed");
            }
        }));
    }

    if !state.config.server.listen_https.is_empty() {
        let default_cert = load_default_certificate(&state).await?;
        if default_cert.is_none() {
            tracing::warn!(
                "no default tls certificate configured; handshakes for hosts \
                 without their own certificate will fail"
            );
        }
        let resolver = Arc::new(SniResolver::new(state.domains.clone(), default_cert));
        let acceptor = TlsAcceptor::from(Arc::new(server_config(resolver)));

        for addr in &state.config.server.listen_https {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind https listener {addr}"))?;
            tracing::info!(%addr, "listening for https");
            let app = create_router(state.clone(), ListenerKind::Https);
            let limiter = limiter.clone();
            let acceptor = acceptor.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(err) = serve_tls(listener, limiter, acceptor, app).await {
                    tracing::error!(error = %err, "https listener failed");
                }
            }));
        }
    }

    if let Some(addr) = &state.config.server.listen_metrics {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind metrics listener {addr}"))?;
        tracing::info!(%addr, "serving metrics");
        let app = Router::new().route("/metrics", get(metrics::metrics_handler));
        tasks.push(tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                tracing::error!(error = %err, "metrics listener failed");
            }
        }));
    }

    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}

async fn load_default_certificate(state: &AppState) -> Result<Option<Arc<CertifiedKey>>> {
    let Some(tls) = &state.config.tls else {
        return Ok(None);
    };

    let cert_pem = tokio::fs::read(&tls.certificate)
        .await
        .with_context(|| format!("failed to read {}", tls.certificate.display()))?;
    let key_pem = tokio::fs::read(&tls.key)
        .await
        .with_context(|| format!("failed to read {}", tls.key.display()))?;

    let certified = certified_key_from_pem(&cert_pem, &key_pem)
        .context("failed to parse default certificate")?;
    tracing::info!(certificate = %tls.certificate.display(), "loaded default tls certificate");
    Ok(Some(Arc::new(certified)))
}
