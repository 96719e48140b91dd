//! Remote artifacts addressed by URL and read with HTTP range requests.

use crate::error::{VfsError, VfsResult};
use crate::metrics;
use bytes::Bytes;
use reqwest::header::{CONTENT_RANGE, ETAG, RANGE};
use reqwest::StatusCode;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use url::Url;

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// A remote artifact. The URL may be replaced while the resource is alive
/// (object stores re-sign URLs); identity and size are fixed at creation.
pub struct Resource {
    id: u64,
    client: reqwest::Client,
    url: RwLock<Url>,
    size: AtomicU64,
    etag: Option<String>,
    /// Set when a response proves the backend no longer matches what was
    /// indexed; a corrupted resource is never read again.
    last_error: Mutex<Option<VfsError>>,
    size_relearned: AtomicBool,
}

impl Resource {
    /// Probe `url` with a one-byte ranged GET to learn the total size and
    /// validate accessibility.
    pub async fn new(client: reqwest::Client, url: &str) -> VfsResult<Self> {
        let url = Url::parse(url).map_err(|e| VfsError::InvalidUrl(e.to_string()))?;

        let response = client
            .get(url.clone())
            .header(RANGE, "bytes=0-0")
            .send()
            .await
            .map_err(|e| VfsError::TemporaryBackend(e.to_string()))?;

        let status = response.status();
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let size = match status {
            StatusCode::PARTIAL_CONTENT => content_range_total(&response)?,
            // Backend ignored the range header but the object is readable.
            StatusCode::OK => response
                .content_length()
                .ok_or_else(|| VfsError::InvalidResponse("missing content length".into()))?,
            other => return Err(status_error(other)),
        };

        Ok(Self {
            id: NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed),
            client,
            url: RwLock::new(url),
            size: AtomicU64::new(size),
            etag,
            last_error: Mutex::new(None),
            size_relearned: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// ETag when the backend sent one, otherwise the size: both change when
    /// the object content changes, which is what cache namespaces need.
    pub fn validator(&self) -> String {
        match &self.etag {
            Some(etag) => etag.trim_matches('"').to_string(),
            None => self.size().to_string(),
        }
    }

    /// Replace the fetch URL, preserving identity. Subsequent range reads
    /// use the new (typically re-signed) URL.
    pub fn set_url(&self, url: &str) -> VfsResult<()> {
        let parsed = Url::parse(url).map_err(|e| VfsError::InvalidUrl(e.to_string()))?;
        *self.url.write().expect("resource url lock poisoned") = parsed;
        Ok(())
    }

    pub fn url(&self) -> Url {
        self.url.read().expect("resource url lock poisoned").clone()
    }

    pub fn last_error(&self) -> Option<VfsError> {
        self.last_error
            .lock()
            .expect("resource error lock poisoned")
            .clone()
    }

    fn set_corrupted(&self, reason: &str) -> VfsError {
        let err = VfsError::Corrupted(reason.to_string());
        let mut last = self
            .last_error
            .lock()
            .expect("resource error lock poisoned");
        if last.is_none() {
            *last = Some(err.clone());
        }
        err
    }

    /// Fetch `length` bytes at `offset`.
    ///
    /// A 416 means our cached size is stale; the size is re-learned once per
    /// resource and the read retried. A response whose `Content-Range`
    /// disagrees with the request marks the resource corrupted.
    pub async fn read_range(&self, offset: u64, length: u64) -> VfsResult<Bytes> {
        if let Some(err) = self.last_error() {
            return Err(err);
        }
        if length == 0 {
            return Ok(Bytes::new());
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let end = offset + length - 1;
            let response = self
                .client
                .get(self.url())
                .header(RANGE, format!("bytes={offset}-{end}"))
                .send()
                .await
                .map_err(|e| VfsError::TemporaryBackend(e.to_string()))?;

            metrics::ZIP_CHUNK_FETCHES.inc();

            match response.status() {
                StatusCode::PARTIAL_CONTENT => {
                    let (got_start, got_end) = content_range_bounds(&response)?;
                    if got_start != offset || got_end != end {
                        return Err(self.set_corrupted(&format!(
                            "backend returned range {got_start}-{got_end}, requested {offset}-{end}"
                        )));
                    }

                    let body = response
                        .bytes()
                        .await
                        .map_err(|e| VfsError::TemporaryBackend(e.to_string()))?;
                    if body.len() as u64 != length {
                        return Err(self.set_corrupted(&format!(
                            "backend returned {} bytes, requested {length}",
                            body.len()
                        )));
                    }
                    return Ok(body);
                }
                StatusCode::RANGE_NOT_SATISFIABLE => {
                    if attempt > 1 || self.size_relearned.swap(true, Ordering::AcqRel) {
                        return Err(self.set_corrupted("range not satisfiable"));
                    }
                    self.relearn_size().await?;
                    continue;
                }
                StatusCode::OK => {
                    return Err(self.set_corrupted("backend ignored range request"));
                }
                other => return Err(status_error(other)),
            }
        }
    }

    async fn relearn_size(&self) -> VfsResult<()> {
        let response = self
            .client
            .get(self.url())
            .header(RANGE, "bytes=0-0")
            .send()
            .await
            .map_err(|e| VfsError::TemporaryBackend(e.to_string()))?;

        let size = match response.status() {
            StatusCode::PARTIAL_CONTENT => content_range_total(&response)?,
            StatusCode::OK => response
                .content_length()
                .ok_or_else(|| VfsError::InvalidResponse("missing content length".into()))?,
            other => return Err(status_error(other)),
        };

        tracing::debug!(resource_id = self.id, size, "re-learned resource size");
        self.size.store(size, Ordering::Release);
        Ok(())
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.id)
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}

fn status_error(status: StatusCode) -> VfsError {
    match status {
        StatusCode::NOT_FOUND => VfsError::NotFound,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => VfsError::Unauthorized,
        s if s.is_server_error() => VfsError::TemporaryBackend(format!("status {s}")),
        s => VfsError::InvalidResponse(format!("status {s}")),
    }
}

/// Total size from a `Content-Range: bytes a-b/total` header.
fn content_range_total(response: &reqwest::Response) -> VfsResult<u64> {
    let header = content_range_str(response)?;
    let total = header
        .rsplit('/')
        .next()
        .ok_or_else(|| VfsError::InvalidResponse(format!("bad content-range: {header}")))?;
    total
        .parse()
        .map_err(|_| VfsError::InvalidResponse(format!("bad content-range: {header}")))
}

/// Start and end offsets from a `Content-Range: bytes a-b/total` header.
fn content_range_bounds(response: &reqwest::Response) -> VfsResult<(u64, u64)> {
    let header = content_range_str(response)?;
    let bad = || VfsError::InvalidResponse(format!("bad content-range: {header}"));

    let range = header
        .strip_prefix("bytes ")
        .and_then(|r| r.split('/').next())
        .ok_or_else(bad)?;
    let (start, end) = range.split_once('-').ok_or_else(bad)?;
    Ok((
        start.parse().map_err(|_| bad())?,
        end.parse().map_err(|_| bad())?,
    ))
}

fn content_range_str(response: &reqwest::Response) -> VfsResult<String> {
    response
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| VfsError::InvalidResponse("missing content-range".into()))
}
