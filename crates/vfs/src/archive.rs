//! A parsed ZIP archive behind a single-flight open gate.

use crate::cache::BoundedCache;
use crate::chunks::ChunkCache;
use crate::error::{VfsError, VfsResult};
use crate::metrics;
use crate::reader::{RangedReader, SectionReader};
use crate::resource::Resource;
use crate::zip::{
    self, CentralDirEntry, CentralDirectory, EOCD64_SIZE, LOCAL_HEADER_SIZE, METHOD_DEFLATE,
    METHOD_STORE,
};
use crate::{clean_path, escapes_root, EOCD_SCAN_SIZE, MAX_SYMLINK_SIZE};
use async_compression::tokio::bufread::DeflateDecoder;
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Arc, Once, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::watch;

/// Auxiliary caches that outlive individual archives, keyed by archive
/// namespace so offsets survive eviction as long as the content validator
/// is unchanged.
pub struct AuxCaches {
    pub data_offsets: BoundedCache<u64>,
    pub readlinks: BoundedCache<String>,
}

impl AuxCaches {
    pub fn new(data_offset_items: usize, readlink_items: usize) -> Self {
        Self {
            data_offsets: BoundedCache::new(data_offset_items),
            readlinks: BoundedCache::new(readlink_items),
        }
    }

    fn drop_namespace(&self, namespace: &str) {
        self.data_offsets.drop_namespace(namespace);
        self.readlinks.drop_namespace(namespace);
    }
}

/// Stat result for a file or synthesized directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub modified: Option<OffsetDateTime>,
    pub is_dir: bool,
    pub is_symlink: bool,
}

impl FileStat {
    pub fn is_regular(&self) -> bool {
        !self.is_dir && !self.is_symlink
    }
}

/// Streaming reader over one file's data bytes.
pub enum FileReader {
    Stored(SectionReader),
    Deflated(DeflateDecoder<SectionReader>),
}

impl AsyncRead for FileReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            FileReader::Stored(r) => Pin::new(r).poll_read(cx, buf),
            FileReader::Deflated(r) => Pin::new(r).poll_read(cx, buf),
        }
    }
}

struct Opened {
    resource: Arc<Resource>,
    reader: RangedReader,
    namespace: String,
    /// Public directory name without trailing slash; empty when the whole
    /// archive is public.
    public_prefix: String,
    files: HashMap<String, CentralDirEntry>,
    directories: HashSet<String>,
}

/// A remote ZIP archive. Opening happens at most once, on a background task
/// with its own timeout; every concurrent caller awaits the same outcome
/// through the `done` gate.
pub struct ZipArchive {
    canonical_key: String,
    open_timeout: Duration,
    client: reqwest::Client,
    chunk_cache: Arc<ChunkCache>,
    aux: Arc<AuxCaches>,
    spawn: Once,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    outcome: OnceLock<Result<Opened, VfsError>>,
}

impl std::fmt::Debug for ZipArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZipArchive")
            .field("canonical_key", &self.canonical_key)
            .finish_non_exhaustive()
    }
}

impl ZipArchive {
    pub(crate) fn new(
        canonical_key: String,
        client: reqwest::Client,
        chunk_cache: Arc<ChunkCache>,
        aux: Arc<AuxCaches>,
        open_timeout: Duration,
    ) -> Arc<Self> {
        let (done_tx, done_rx) = watch::channel(false);
        Arc::new(Self {
            canonical_key,
            open_timeout,
            client,
            chunk_cache,
            aux,
            spawn: Once::new(),
            done_tx,
            done_rx,
            outcome: OnceLock::new(),
        })
    }

    /// Point the underlying resource at a fresh (re-signed) URL. A no-op
    /// until the archive has opened.
    pub fn set_url(&self, url: &str) {
        if let Some(Ok(opened)) = self.outcome.get() {
            if let Err(err) = opened.resource.set_url(url) {
                tracing::warn!(error = %err, "ignoring invalid refreshed archive URL");
            }
        }
    }

    /// Wait for the archive to be opened, kicking off the parse on first
    /// call. The parse runs detached with its own timeout: a caller that
    /// gives up does not abort it for the callers that come after.
    pub async fn ensure_open(self: &Arc<Self>, url: &str) -> VfsResult<()> {
        self.spawn.call_once(|| {
            let this = Arc::clone(self);
            let url = url.to_string();
            tokio::spawn(async move { this.read_archive(url).await });
        });

        let mut done = self.done_rx.clone();
        if !*done.borrow_and_update() {
            match tokio::time::timeout(self.open_timeout, done.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => return Err(VfsError::OpenTimeout),
            }
        }

        match self.outcome.get() {
            Some(Ok(opened)) => match opened.resource.last_error() {
                Some(err) => Err(err),
                None => Ok(()),
            },
            Some(Err(err)) => Err(err.clone()),
            // done flipped before the outcome was stored; cannot happen, the
            // task stores first.
            None => Err(VfsError::OpenTimeout),
        }
    }

    async fn read_archive(self: Arc<Self>, url: String) {
        let result = match tokio::time::timeout(self.open_timeout, self.parse(&url)).await {
            Ok(result) => result,
            Err(_) => Err(VfsError::OpenTimeout),
        };

        match &result {
            Ok(opened) => {
                let count = opened.files.len() as i64;
                metrics::ZIP_OPENED.with_label_values(&["ok"]).inc();
                metrics::ZIP_OPENED_ENTRIES.inc_by(count as u64);
                metrics::ZIP_ARCHIVE_ENTRIES_CACHED.add(count);
                tracing::debug!(
                    key = %self.canonical_key,
                    files = count,
                    prefix = %opened.public_prefix,
                    "opened zip archive"
                );
            }
            Err(err) => {
                metrics::ZIP_OPENED.with_label_values(&["error"]).inc();
                tracing::debug!(key = %self.canonical_key, error = %err, "opening zip archive failed");
            }
        }

        let _ = self.outcome.set(result);
        let _ = self.done_tx.send(true);
    }

    async fn parse(&self, url: &str) -> VfsResult<Opened> {
        let resource = Arc::new(Resource::new(self.client.clone(), url).await?);
        let reader = RangedReader::new(resource.clone(), self.chunk_cache.clone());
        let size = resource.size();

        let tail_len = size.min(EOCD_SCAN_SIZE);
        let tail_offset = size - tail_len;
        let tail = reader.read(tail_offset, tail_len).await?;

        let located = match zip::find_central_directory(&tail, tail_offset)? {
            CentralDirectory::NeedZip64 { record_offset } => {
                let buf = reader.read(record_offset, EOCD64_SIZE as u64).await?;
                zip::parse_zip64_eocd(&buf)?
            }
            located => located,
        };
        let CentralDirectory::Located {
            offset,
            size: cd_size,
            entries,
        } = located
        else {
            return Err(VfsError::BadArchive("unresolvable zip64 directory".into()));
        };

        if offset.checked_add(cd_size).map_or(true, |end| end > size) {
            return Err(VfsError::BadArchive("central directory out of bounds".into()));
        }

        let cd_buf = reader.read(offset, cd_size).await?;
        let records = zip::parse_central_directory(&cd_buf, entries)?;

        let public_prefix = guess_public_prefix(&records);
        let prefix_slash = if public_prefix.is_empty() {
            String::new()
        } else {
            format!("{public_prefix}/")
        };

        let mut files = HashMap::new();
        let mut directories = HashSet::new();
        for record in records {
            if !prefix_slash.is_empty() && !record.name.starts_with(&prefix_slash) {
                continue;
            }
            add_ancestor_directories(&mut directories, &record.name);
            if record.is_dir() {
                let mut name = record.name;
                if !name.ends_with('/') {
                    name.push('/');
                }
                directories.insert(name);
            } else {
                files.insert(record.name.clone(), record);
            }
        }

        let namespace = format!("{}#{}", self.canonical_key, resource.validator());

        Ok(Opened {
            resource,
            reader,
            namespace,
            public_prefix,
            files,
            directories,
        })
    }

    fn opened(&self) -> VfsResult<&Opened> {
        match self.outcome.get() {
            Some(Ok(opened)) => Ok(opened),
            Some(Err(err)) => Err(err.clone()),
            None => Err(VfsError::TemporaryBackend("archive not opened".into())),
        }
    }

    /// Full archive key for a request path, or `None` when the cleaned path
    /// escapes the public prefix.
    fn full_name(&self, opened: &Opened, name: &str) -> Option<String> {
        let rel = clean_path(name);
        if escapes_root(&rel) {
            return None;
        }
        Some(match (opened.public_prefix.is_empty(), rel.is_empty()) {
            (true, _) => rel,
            (false, true) => opened.public_prefix.clone(),
            (false, false) => format!("{}/{}", opened.public_prefix, rel),
        })
    }

    fn find_file<'a>(&self, opened: &'a Opened, name: &str) -> Option<&'a CentralDirEntry> {
        let full = self.full_name(opened, name)?;
        opened.files.get(&full)
    }

    fn find_directory(&self, opened: &Opened, name: &str) -> bool {
        let Some(full) = self.full_name(opened, name) else {
            return false;
        };
        // The public root itself is always a directory.
        if full.is_empty() || full == opened.public_prefix {
            return true;
        }
        opened.directories.contains(&format!("{full}/"))
    }

    /// Open a regular file as a streaming reader over its data bytes.
    pub async fn open(&self, name: &str) -> VfsResult<FileReader> {
        let opened = self.opened()?;
        let Some(entry) = self.find_file(opened, name) else {
            if self.find_directory(opened, name) {
                return Err(VfsError::NotFile);
            }
            return Err(VfsError::NotFound);
        };
        if !entry.is_regular() {
            return Err(VfsError::NotFile);
        }
        self.entry_reader(opened, entry).await
    }

    async fn entry_reader(&self, opened: &Opened, entry: &CentralDirEntry) -> VfsResult<FileReader> {
        let data_offset = self.data_offset(opened, entry).await?;
        let section = opened
            .reader
            .section_reader(data_offset, entry.compressed_size);

        match entry.method {
            METHOD_STORE => Ok(FileReader::Stored(section)),
            METHOD_DEFLATE => Ok(FileReader::Deflated(DeflateDecoder::new(section))),
            method => Err(VfsError::UnsupportedCompression(method)),
        }
    }

    /// Resolve the absolute offset of an entry's data, reading the local
    /// file header on first access. The offset is constant for the archive
    /// content, so it is cached under the archive namespace and survives
    /// eviction.
    async fn data_offset(&self, opened: &Opened, entry: &CentralDirEntry) -> VfsResult<u64> {
        if let Some(offset) = self.aux.data_offsets.get(&opened.namespace, &entry.name) {
            return Ok(offset);
        }

        let header = opened
            .reader
            .read(entry.header_offset, LOCAL_HEADER_SIZE as u64)
            .await?;
        let offset = zip::local_header_data_offset(&header, entry.header_offset)?;

        self.aux
            .data_offsets
            .insert(&opened.namespace, &entry.name, offset);
        Ok(offset)
    }

    /// Stat a file or synthesized directory without following symlinks.
    pub fn lstat(&self, name: &str) -> VfsResult<FileStat> {
        let opened = self.opened()?;
        if let Some(entry) = self.find_file(opened, name) {
            return Ok(FileStat {
                size: entry.uncompressed_size,
                modified: entry.modified,
                is_dir: false,
                is_symlink: entry.is_symlink(),
            });
        }
        if self.find_directory(opened, name) {
            return Ok(FileStat {
                size: 0,
                modified: None,
                is_dir: true,
                is_symlink: false,
            });
        }
        Err(VfsError::NotFound)
    }

    /// Read the target of a symlink entry; targets longer than
    /// [`MAX_SYMLINK_SIZE`] are rejected.
    pub async fn readlink(&self, name: &str) -> VfsResult<String> {
        let opened = self.opened()?;
        let Some(entry) = self.find_file(opened, name) else {
            if self.find_directory(opened, name) {
                return Err(VfsError::NotSymlink);
            }
            return Err(VfsError::NotFound);
        };
        if !entry.is_symlink() {
            return Err(VfsError::NotSymlink);
        }

        let target = match self.aux.readlinks.get(&opened.namespace, &entry.name) {
            Some(cached) => cached,
            None => {
                let reader = self.entry_reader(opened, entry).await?;
                let mut buf = Vec::with_capacity(MAX_SYMLINK_SIZE + 1);
                reader
                    .take(MAX_SYMLINK_SIZE as u64 + 1)
                    .read_to_end(&mut buf)
                    .await
                    .map_err(|e| VfsError::TemporaryBackend(e.to_string()))?;
                let target = String::from_utf8_lossy(&buf).into_owned();
                self.aux
                    .readlinks
                    .insert(&opened.namespace, &entry.name, target.clone());
                target
            }
        };

        if target.len() > MAX_SYMLINK_SIZE {
            return Err(VfsError::SymlinkTooLong);
        }
        Ok(target)
    }

    /// Cache namespace for this archive's content: the canonical key plus
    /// the backend validator. `None` until the archive has opened.
    pub fn namespace(&self) -> Option<&str> {
        self.outcome
            .get()
            .and_then(|outcome| outcome.as_ref().ok())
            .map(|opened| opened.namespace.as_str())
    }

    /// Called by the VFS when this archive leaves the cache.
    pub(crate) fn on_evicted(&self) {
        if let Some(Ok(opened)) = self.outcome.get() {
            self.aux.drop_namespace(&opened.namespace);
            self.chunk_cache.drop_resource(opened.resource.id());
            metrics::ZIP_ARCHIVE_ENTRIES_CACHED.sub(opened.files.len() as i64);
        }
    }

}

/// Choose the directory inside the archive whose contents are publicly
/// addressable: the sole top-level directory when there is exactly one and
/// no loose top-level files, otherwise the first known build-output name
/// present, otherwise none.
fn guess_public_prefix(records: &[CentralDirEntry]) -> String {
    // Folder names used by popular static site generators, by popularity.
    const CANDIDATES: [&str; 5] = ["public", "build", "dist", "out", "_site"];

    let mut root_dirs: Vec<&str> = Vec::new();
    let mut has_root_files = false;
    for record in records {
        match record.name.split_once('/') {
            Some((root, _)) if !root.is_empty() => {
                if !root_dirs.contains(&root) {
                    root_dirs.push(root);
                }
            }
            Some(_) => {}
            None => {
                if !record.is_dir() {
                    has_root_files = true;
                }
            }
        }
    }

    if root_dirs.len() == 1 && !has_root_files {
        return root_dirs[0].to_string();
    }
    for candidate in CANDIDATES {
        if root_dirs.contains(&candidate) {
            return candidate.to_string();
        }
    }
    String::new()
}

/// Record every ancestor directory of `name` so stat on intermediate
/// directories succeeds even when the archive has no explicit records for
/// them.
fn add_ancestor_directories(directories: &mut HashSet<String>, name: &str) {
    let mut end = name.len();
    while let Some(idx) = name[..end].rfind('/') {
        let dir = &name[..=idx];
        if !directories.insert(dir.to_string()) {
            break;
        }
        end = idx;
    }
}
