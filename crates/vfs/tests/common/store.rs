//! In-process object store serving fixtures over HTTP byte ranges, with a
//! request log so range-level properties (single-flight, dedup, URL
//! refresh) are observable.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// One observed request.
#[derive(Clone, Debug)]
pub struct SeenRequest {
    pub path: String,
    pub query: Option<String>,
    pub range: Option<String>,
}

#[derive(Clone, Default)]
pub struct FixtureStore {
    objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    requests: Arc<Mutex<Vec<SeenRequest>>>,
    ignore_ranges: Arc<AtomicBool>,
}

impl FixtureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, path: &str, bytes: Vec<u8>) {
        self.objects
            .lock()
            .unwrap()
            .insert(path.to_string(), bytes);
    }

    /// Make the store answer 200 with the full body regardless of `Range`.
    pub fn set_ignore_ranges(&self, ignore: bool) {
        self.ignore_ranges.store(ignore, Ordering::Relaxed);
    }

    pub fn requests(&self) -> Vec<SeenRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Every `Range` header value seen for `path`.
    pub fn ranges_for(&self, path: &str) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path == path)
            .filter_map(|r| r.range.clone())
            .collect()
    }

    /// Bind on an ephemeral port and serve forever; returns the base URL.
    pub async fn serve(&self) -> String {
        let router = Router::new().fallback(handle).with_state(self.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("binding fixture store");
        let addr = listener.local_addr().expect("fixture store addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("fixture store");
        });
        format!("http://{addr}")
    }
}

async fn handle(State(store): State<FixtureStore>, request: Request<Body>) -> Response {
    let path = request.uri().path().to_string();
    let query = request.uri().query().map(str::to_string);
    let range = request
        .headers()
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    store.requests.lock().unwrap().push(SeenRequest {
        path: path.clone(),
        query,
        range: range.clone(),
    });

    let body = match store.objects.lock().unwrap().get(&path) {
        Some(bytes) => bytes.clone(),
        None => return StatusCode::NOT_FOUND.into_response(),
    };
    let total = body.len() as u64;

    let range = if store.ignore_ranges.load(Ordering::Relaxed) {
        None
    } else {
        range
    };

    match range.as_deref().and_then(parse_range) {
        Some((start, end)) => {
            if start >= total {
                let mut headers = HeaderMap::new();
                headers.insert(
                    header::CONTENT_RANGE,
                    format!("bytes */{total}").parse().unwrap(),
                );
                return (StatusCode::RANGE_NOT_SATISFIABLE, headers).into_response();
            }
            let end = end.min(total - 1);
            let slice = body[start as usize..=end as usize].to_vec();
            let mut headers = HeaderMap::new();
            headers.insert(
                header::CONTENT_RANGE,
                format!("bytes {start}-{end}/{total}").parse().unwrap(),
            );
            headers.insert(header::ETAG, "\"fixture-v1\"".parse().unwrap());
            (StatusCode::PARTIAL_CONTENT, headers, slice).into_response()
        }
        None => {
            let mut headers = HeaderMap::new();
            headers.insert(header::ETAG, "\"fixture-v1\"".parse().unwrap());
            (StatusCode::OK, headers, body).into_response()
        }
    }
}

fn parse_range(value: &str) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}
