//! HTTP client for the internal pages API.

use crate::api::VirtualDomainResponse;
use crate::error::{SourceError, SourceResult};
use pagoda_core::config::GitLabConfig;
use pagoda_core::domain::VirtualDomain;
use reqwest::StatusCode;
use std::time::Duration;

const LOOKUP_PATH: &str = "/api/v4/internal/pages";
const STATUS_PATH: &str = "/api/v4/internal/pages/status";

/// Client for the GitLab internal pages API.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    api_secret: Option<String>,
}

impl Client {
    pub fn new(config: &GitLabConfig) -> SourceResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.client_timeout())
            .build()
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.internal_server_url().trim_end_matches('/').to_string(),
            api_secret: config.api_secret.clone(),
        })
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.get(format!("{}{}", self.base_url, path));
        if let Some(secret) = &self.api_secret {
            builder = builder.bearer_auth(secret);
        }
        builder
    }

    /// Fetch the virtual-domain descriptor for a host. `Ok(None)` means the
    /// host is authoritatively unknown.
    pub async fn get_virtual_domain(&self, host: &str) -> SourceResult<Option<VirtualDomain>> {
        let response = self
            .request(LOOKUP_PATH)
            .query(&[("host", host)])
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;

        match response.status() {
            StatusCode::OK => {
                let body: VirtualDomainResponse = response
                    .json()
                    .await
                    .map_err(|e| SourceError::InvalidResponse(e.to_string()))?;
                Ok(Some(body.into_domain(host)))
            }
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(None),
            status if status.is_server_error() => {
                Err(SourceError::Unavailable(format!("status {status}")))
            }
            status => Err(SourceError::InvalidResponse(format!("status {status}"))),
        }
    }

    /// One call against the health endpoint.
    pub async fn status(&self) -> SourceResult<()> {
        let response = self
            .request(STATUS_PATH)
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(SourceError::Unavailable(format!(
                "status {}",
                response.status()
            )))
        }
    }

    /// Poll the health endpoint until it succeeds, retrying up to `retries`
    /// times with `interval` between attempts.
    pub async fn poll(&self, retries: u32, interval: Duration) -> SourceResult<()> {
        let attempts = retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.status().await {
                Ok(()) => {
                    tracing::info!(attempt, "domain source is ready");
                    return Ok(());
                }
                Err(err) if err.is_retryable() => {
                    tracing::warn!(attempt, error = %err, "domain source not yet reachable");
                    last_error = err.to_string();
                }
                Err(err) => return Err(err),
            }
            if attempt < attempts {
                tokio::time::sleep(interval).await;
            }
        }

        Err(SourceError::PollingFailed {
            attempts,
            last_error,
        })
    }
}
