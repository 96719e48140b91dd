//! Shared fixtures for server integration tests: an in-process object
//! store serving ZIP fixtures over byte ranges, a mock GitLab API, and a
//! ready-to-call router.

// Each test file compiles common/ separately, so not every helper is used
// from every binary.
#![allow(dead_code)]

pub mod store;

use axum::body::Body;
use axum::http::{header, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use httpmock::MockServer;
use pagoda_core::config::AppConfig;
use pagoda_server::{create_router, AppState, ListenerKind};
use pagoda_source::CachedSource;
use std::io::Write;
use store::FixtureStore;
use tower::ServiceExt;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Build a ZIP archive in memory: `(name, content, unix_mode)` entries,
/// stored uncompressed.
pub fn build_archive(entries: &[(&str, &[u8], Option<u32>)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, content, mode) in entries {
        let mut options =
            SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        // Symlink entries carry the POSIX LNK mode and their target as
        // content; the writer has a dedicated API for them.
        if mode.is_some_and(|m| m & 0o170_000 == 0o120_000) {
            let target = String::from_utf8(content.to_vec()).expect("symlink target");
            writer
                .add_symlink(*name, target, options)
                .expect("add_symlink");
            continue;
        }
        if let Some(mode) = mode {
            options = options.unix_permissions(*mode);
        }
        writer.start_file(*name, options).expect("start_file");
        writer.write_all(content).expect("write entry");
    }
    writer.finish().expect("finish archive").into_inner()
}

/// The canonical test site.
pub fn site_archive() -> Vec<u8> {
    build_archive(&[
        ("public/index.html", b"hello\n", None),
        ("public/subdir/hello.html", b"sub hello\n", None),
        ("public/link.html", b"index.html", Some(0o120_777)),
        ("public/escape.html", b"../outside.html", Some(0o120_777)),
    ])
}

/// One assembled test application.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub gitlab: MockServer,
    pub store: FixtureStore,
    pub store_url: String,
}

impl TestApp {
    /// Build the app against a mock GitLab and an empty fixture store.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(configure: impl FnOnce(&mut AppConfig)) -> Self {
        let gitlab = MockServer::start_async().await;
        let store = FixtureStore::new();
        let store_url = store.serve().await;

        let mut config = AppConfig::for_testing();
        config.gitlab.internal_server = gitlab.base_url();
        config.gitlab.public_server = gitlab.base_url();
        configure(&mut config);

        let source = CachedSource::new(&config.gitlab).expect("building source");
        let state = AppState::new(config, source);
        let router = create_router(state.clone(), ListenerKind::Http);

        Self {
            router,
            state,
            gitlab,
            store,
            store_url,
        }
    }

    /// Register a host in the mock domain source with a single root lookup
    /// path serving `archive_path` from the fixture store.
    pub async fn register_domain(&self, host: &str, archive_path: &str) {
        self.register_domain_with(host, archive_path, false, false, 0)
            .await;
    }

    pub async fn register_domain_with(
        &self,
        host: &str,
        archive_path: &str,
        https_only: bool,
        access_control: bool,
        project_id: u64,
    ) {
        let body = serde_json::json!({
            "lookup_paths": [{
                "prefix": "/",
                "source": {"type": "zip", "path": format!("{}{}", self.store_url, archive_path)},
                "https_only": https_only,
                "access_control": access_control,
                "project_id": project_id,
            }]
        });
        let host = host.to_string();
        self.gitlab
            .mock_async(move |when, then| {
                when.method(httpmock::Method::GET)
                    .path("/api/v4/internal/pages")
                    .query_param("host", &host);
                then.status(200).json_body(body);
            })
            .await;
    }

    /// One request against the router.
    pub async fn request(&self, request: Request<Body>) -> Response<Body> {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router call")
    }

    pub async fn get(&self, host: &str, path_and_query: &str) -> Response<Body> {
        self.request(
            Request::builder()
                .uri(path_and_query)
                .header(header::HOST, host)
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }
}

/// Collect a response body into bytes.
pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes()
        .to_vec()
}

/// Extract the session cookie value from a `Set-Cookie` header.
pub fn session_cookie(response: &Response<Body>) -> Option<String> {
    let raw = response.headers().get(header::SET_COOKIE)?.to_str().ok()?;
    let pair = raw.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    assert_eq!(name, "gitlab-pages");
    Some(value.to_string())
}
