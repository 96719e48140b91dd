//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub gitlab: GitLabConfig,
    /// OAuth access control. Absent means access-controlled lookup paths
    /// cannot be served and fail with 404.
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub zip: ZipConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Artifact proxying. Absent disables the artifact handler.
    #[serde(default)]
    pub artifacts: Option<ArtifactsConfig>,
}

/// Listener and pipeline configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Cleartext HTTP bind addresses.
    #[serde(default)]
    pub listen_http: Vec<String>,
    /// TLS bind addresses (SNI certificate selection).
    #[serde(default)]
    pub listen_https: Vec<String>,
    /// Reverse-proxy bind addresses; scheme is taken from `X-Forwarded-Proto`.
    #[serde(default)]
    pub listen_proxy: Vec<String>,
    /// Prometheus metrics bind address.
    #[serde(default)]
    pub listen_metrics: Option<String>,
    /// Root domain the service itself lives under (e.g. `example.io`).
    /// Needed by handlers that recognize service-owned hosts, like the
    /// artifact proxy.
    #[serde(default)]
    pub pages_domain: Option<String>,
    /// Readiness probe path.
    #[serde(default = "default_status_path")]
    pub status_path: String,
    /// Redirect every cleartext request to HTTPS.
    #[serde(default)]
    pub redirect_http: bool,
    /// Do not emit CORS headers on GET responses.
    #[serde(default)]
    pub disable_cross_origin_requests: bool,
    /// Shared cap on concurrently accepted connections across listeners.
    /// Zero disables the limit.
    #[serde(default = "default_max_conns")]
    pub max_conns: usize,
    /// Extra `Name: value` headers appended to every response.
    #[serde(default)]
    pub custom_headers: Vec<String>,
}

fn default_status_path() -> String {
    "/-/healthy".to_string()
}

fn default_max_conns() -> usize {
    5000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_http: Vec::new(),
            listen_https: Vec::new(),
            listen_proxy: Vec::new(),
            listen_metrics: None,
            pages_domain: None,
            status_path: default_status_path(),
            redirect_http: false,
            disable_cross_origin_requests: false,
            max_conns: default_max_conns(),
            custom_headers: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Parse `custom_headers` entries into name/value pairs, skipping
    /// malformed entries.
    pub fn parsed_custom_headers(&self) -> Vec<(String, String)> {
        self.custom_headers
            .iter()
            .filter_map(|h| {
                let (name, value) = h.split_once(':')?;
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                Some((name.to_string(), value.trim().to_string()))
            })
            .collect()
    }
}

/// GitLab instance endpoints.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GitLabConfig {
    /// Public GitLab URL, used for the OAuth dance and access checks.
    #[serde(default = "default_gitlab_server")]
    pub public_server: String,
    /// Internal GitLab URL serving the pages domain-source API. Falls back
    /// to `public_server` when empty.
    #[serde(default)]
    pub internal_server: String,
    /// Bearer secret for the internal API.
    #[serde(default)]
    pub api_secret: Option<String>,
    /// Timeout for identity and domain-source API calls.
    #[serde(default = "default_client_timeout_secs")]
    pub client_http_timeout_secs: u64,
    /// Positive domain-lookup cache TTL.
    #[serde(default = "default_domain_cache_secs")]
    pub domain_cache_secs: u64,
    /// Negative domain-lookup cache TTL.
    #[serde(default = "default_negative_cache_secs")]
    pub negative_cache_secs: u64,
    /// Interval of the domain map reconciliation watcher.
    #[serde(default = "default_watch_interval_secs")]
    pub watch_interval_secs: u64,
}

fn default_gitlab_server() -> String {
    "https://gitlab.com".to_string()
}

fn default_client_timeout_secs() -> u64 {
    5
}

fn default_domain_cache_secs() -> u64 {
    30
}

fn default_negative_cache_secs() -> u64 {
    10
}

fn default_watch_interval_secs() -> u64 {
    60
}

impl Default for GitLabConfig {
    fn default() -> Self {
        Self {
            public_server: default_gitlab_server(),
            internal_server: String::new(),
            api_secret: None,
            client_http_timeout_secs: default_client_timeout_secs(),
            domain_cache_secs: default_domain_cache_secs(),
            negative_cache_secs: default_negative_cache_secs(),
            watch_interval_secs: default_watch_interval_secs(),
        }
    }
}

impl GitLabConfig {
    /// Base URL of the internal pages API.
    pub fn internal_server_url(&self) -> &str {
        if self.internal_server.is_empty() {
            &self.public_server
        } else {
            &self.internal_server
        }
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_http_timeout_secs)
    }
}

/// OAuth access-control configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Central pages domain mediating OAuth for tenants.
    pub pages_domain: String,
    /// Long secret every sealing key is derived from.
    pub secret: String,
    pub client_id: String,
    pub client_secret: String,
    /// OAuth redirect URI, `https://<pages_domain>/auth`.
    pub redirect_uri: String,
    #[serde(default = "default_auth_scope")]
    pub scope: String,
    /// Lifetime of the sealed cross-domain authorization code.
    #[serde(default = "default_relay_expiry_secs")]
    pub relay_expiry_secs: u64,
}

fn default_auth_scope() -> String {
    "api".to_string()
}

fn default_relay_expiry_secs() -> u64 {
    60
}

impl AuthConfig {
    pub fn relay_expiry(&self) -> Duration {
        Duration::from_secs(self.relay_expiry_secs)
    }
}

/// Default TLS material for hosts without their own certificate.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TlsConfig {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

/// ZIP VFS tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ZipConfig {
    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,
    #[serde(default = "default_cache_expiration_secs")]
    pub cache_expiration_secs: u64,
    #[serde(default = "default_cache_refresh_secs")]
    pub cache_refresh_secs: u64,
    #[serde(default = "default_cache_cleanup_secs")]
    pub cache_cleanup_secs: u64,
    #[serde(default = "default_max_archives")]
    pub max_archives: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_cache_bytes")]
    pub chunk_cache_bytes: usize,
    #[serde(default = "default_data_offset_items")]
    pub data_offset_items: usize,
    #[serde(default = "default_readlink_items")]
    pub readlink_items: usize,
}

fn default_open_timeout_secs() -> u64 {
    30
}

fn default_cache_expiration_secs() -> u64 {
    60
}

fn default_cache_refresh_secs() -> u64 {
    30
}

fn default_cache_cleanup_secs() -> u64 {
    30
}

fn default_max_archives() -> usize {
    1000
}

fn default_chunk_size() -> usize {
    128 * 1024
}

fn default_chunk_cache_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_data_offset_items() -> usize {
    10_000
}

fn default_readlink_items() -> usize {
    1000
}

impl Default for ZipConfig {
    fn default() -> Self {
        Self {
            open_timeout_secs: default_open_timeout_secs(),
            cache_expiration_secs: default_cache_expiration_secs(),
            cache_refresh_secs: default_cache_refresh_secs(),
            cache_cleanup_secs: default_cache_cleanup_secs(),
            max_archives: default_max_archives(),
            chunk_size: default_chunk_size(),
            chunk_cache_bytes: default_chunk_cache_bytes(),
            data_offset_items: default_data_offset_items(),
            readlink_items: default_readlink_items(),
        }
    }
}

impl ZipConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    pub fn cache_expiration(&self) -> Duration {
        Duration::from_secs(self.cache_expiration_secs)
    }

    pub fn cache_refresh(&self) -> Duration {
        Duration::from_secs(self.cache_refresh_secs)
    }

    pub fn cache_cleanup(&self) -> Duration {
        Duration::from_secs(self.cache_cleanup_secs)
    }
}

/// Per-domain token-bucket rate limiting.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Refill period of one token, in milliseconds. 25ms equals one request
    /// every 25ms, 40 rps.
    #[serde(default = "default_per_domain_frequency_ms")]
    pub per_domain_frequency_ms: u64,
    #[serde(default = "default_per_domain_burst")]
    pub per_domain_burst: u32,
    #[serde(default = "default_rate_limit_entries")]
    pub max_entries: usize,
    #[serde(default = "default_rate_limit_ttl_secs")]
    pub entry_ttl_secs: u64,
    #[serde(default = "default_rate_limit_cleanup_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_per_domain_frequency_ms() -> u64 {
    25
}

fn default_per_domain_burst() -> u32 {
    40
}

fn default_rate_limit_entries() -> usize {
    20_000
}

fn default_rate_limit_ttl_secs() -> u64 {
    3600
}

fn default_rate_limit_cleanup_secs() -> u64 {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            per_domain_frequency_ms: default_per_domain_frequency_ms(),
            per_domain_burst: default_per_domain_burst(),
            max_entries: default_rate_limit_entries(),
            entry_ttl_secs: default_rate_limit_ttl_secs(),
            cleanup_interval_secs: default_rate_limit_cleanup_secs(),
        }
    }
}

impl RateLimitConfig {
    /// Validate the configuration, returning warnings for odd but usable
    /// settings.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();

        if self.enabled {
            if self.per_domain_frequency_ms == 0 {
                return Err("per_domain_frequency_ms must be non-zero".to_string());
            }
            if self.per_domain_burst == 0 {
                return Err("per_domain_burst must be non-zero".to_string());
            }
            if self.max_entries < 100 {
                warnings.push(format!(
                    "rate_limit.max_entries = {} is very small; bursts of distinct \
                     hosts will be rejected at capacity",
                    self.max_entries
                ));
            }
        }

        Ok(warnings)
    }

    pub fn entry_ttl(&self) -> Duration {
        Duration::from_secs(self.entry_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

/// Artifact reverse-proxy configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArtifactsConfig {
    /// Artifacts server base URL.
    pub server: String,
    #[serde(default = "default_artifacts_timeout_secs")]
    pub timeout_secs: u64,
    /// Host label selecting the artifact handler: requests for
    /// `<host_prefix>.<pages_domain>` are proxied.
    #[serde(default = "default_artifacts_prefix")]
    pub host_prefix: String,
}

fn default_artifacts_timeout_secs() -> u64 {
    10
}

fn default_artifacts_prefix() -> String {
    "artifacts".to_string()
}

impl ArtifactsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl AppConfig {
    /// Create a test configuration with fast timeouts and no listeners.
    ///
    /// **For testing only.**
    pub fn for_testing() -> Self {
        Self {
            zip: ZipConfig {
                open_timeout_secs: 5,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.server.status_path, "/-/healthy");
        assert_eq!(config.zip.chunk_size, 128 * 1024);
        assert_eq!(config.zip.max_archives, 1000);
        assert_eq!(config.rate_limit.per_domain_burst, 40);
        assert_eq!(config.rate_limit.max_entries, 20_000);
        assert!(config.auth.is_none());
    }

    #[test]
    fn rate_limit_validation() {
        let mut config = RateLimitConfig {
            enabled: true,
            ..Default::default()
        };
        assert!(config.validate().unwrap().is_empty());

        config.per_domain_frequency_ms = 0;
        assert!(config.validate().is_err());

        config.per_domain_frequency_ms = 25;
        config.max_entries = 10;
        assert_eq!(config.validate().unwrap().len(), 1);
    }

    #[test]
    fn custom_headers_parsing() {
        let config = ServerConfig {
            custom_headers: vec![
                "X-Custom: value".to_string(),
                "broken".to_string(),
                "X-Other:v".to_string(),
            ],
            ..Default::default()
        };
        let parsed = config.parsed_custom_headers();
        assert_eq!(
            parsed,
            vec![
                ("X-Custom".to_string(), "value".to_string()),
                ("X-Other".to_string(), "v".to_string()),
            ]
        );
    }

    #[test]
    fn internal_server_falls_back_to_public() {
        let config = GitLabConfig::default();
        assert_eq!(config.internal_server_url(), "https://gitlab.com");

        let config = GitLabConfig {
            internal_server: "http://gitlab.internal".to_string(),
            ..Default::default()
        };
        assert_eq!(config.internal_server_url(), "http://gitlab.internal");
    }
}
