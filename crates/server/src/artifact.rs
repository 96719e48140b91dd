//! Reverse proxy for the artifacts server.

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::TryStreamExt;
use pagoda_core::config::ArtifactsConfig;
use pagoda_core::host;
use serde::Deserialize;

#[derive(Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error: String,
}

/// Result of an artifact proxy attempt.
pub enum ProxyOutcome {
    Response(Response),
    /// Upstream said the bearer token is invalid; the caller destroys the
    /// session.
    InvalidToken,
}

/// Proxies requests for the artifact host to the artifacts server.
pub struct Artifact {
    client: reqwest::Client,
    server: String,
    artifact_host: String,
}

impl Artifact {
    pub fn new(config: &ArtifactsConfig, pages_domain: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .expect("building artifact proxy client");

        Self {
            client,
            server: config.server.trim_end_matches('/').to_string(),
            artifact_host: format!("{}.{}", config.host_prefix, pages_domain),
        }
    }

    /// Whether this request host addresses the artifact proxy.
    pub fn matches(&self, request_host: &str) -> bool {
        host::normalize(request_host) == self.artifact_host
    }

    /// Stream the upstream response back to the client.
    pub async fn proxy(&self, path: &str, query: Option<&str>, token: Option<&str>) -> ProxyOutcome {
        let mut url = format!("{}{}", self.server, path);
        if let Some(query) = query {
            url.push('?');
            url.push_str(query);
        }

        let mut request = self.client.get(&url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let upstream = match request.send().await {
            Ok(upstream) => upstream,
            Err(err) => {
                tracing::warn!(error = %err, "artifact proxy request failed");
                return ProxyOutcome::Response(
                    crate::error::PagesError::BadGateway(err.to_string()).into_response(),
                );
            }
        };

        let status =
            StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);

        if status == StatusCode::UNAUTHORIZED {
            let invalid_token = upstream
                .json::<ErrorResponse>()
                .await
                .map(|body| body.error == "invalid_token")
                .unwrap_or(false);
            if invalid_token {
                return ProxyOutcome::InvalidToken;
            }
            return ProxyOutcome::Response(
                crate::error::PagesError::Unauthorized.into_response(),
            );
        }

        let content_type = upstream
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let stream = upstream
            .bytes_stream()
            .map_err(|err| std::io::Error::other(err.to_string()));
        let mut response = Response::new(Body::from_stream(stream));
        *response.status_mut() = status;
        if let Ok(value) = content_type.parse() {
            response.headers_mut().insert(header::CONTENT_TYPE, value);
        }
        ProxyOutcome::Response(response)
    }
}
