//! `_redirects` file support, a Netlify-compatible subset.
//!
//! Grammar: `<from> <to> [status]`, one rule per line, `#` comments.
//! Splats, placeholders and per-rule options are not supported and fail
//! the parse; a failed parse only disables redirects for the site, never
//! the site itself.

use pagoda_vfs::{VfsError, ZipArchive};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncReadExt;

/// File looked up at the archive root.
pub const CONFIG_FILE: &str = "_redirects";

/// Maximum accepted `_redirects` size.
pub const MAX_CONFIG_SIZE: usize = 64 * 1024;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RedirectsError {
    #[error("_redirects file too large")]
    FileTooLarge,

    #[error("failed to parse _redirects: {0}")]
    Parse(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedirectRule {
    pub from: String,
    pub to: String,
    pub status: u16,
}

/// Parsed rule set for one archive.
#[derive(Clone, Debug, Default)]
pub struct Redirects {
    rules: Vec<RedirectRule>,
}

impl Redirects {
    /// Parse the file contents. Lines that are not rules (comments, blank,
    /// single token) are skipped; structurally unsupported lines fail the
    /// whole file.
    pub fn parse(content: &str) -> Result<Self, RedirectsError> {
        let mut rules = Vec::new();

        for (number, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.len() {
                0 | 1 => continue,
                2 | 3 => {
                    let from = fields[0];
                    if !from.starts_with('/') || from.contains(':') || from.contains('*') {
                        return Err(RedirectsError::Parse(format!(
                            "unsupported rule on line {}",
                            number + 1
                        )));
                    }
                    let status = match fields.get(2) {
                        Some(raw) => raw.parse::<u16>().map_err(|_| {
                            RedirectsError::Parse(format!(
                                "invalid status on line {}",
                                number + 1
                            ))
                        })?,
                        None => 301,
                    };
                    rules.push(RedirectRule {
                        from: from.to_string(),
                        to: fields[1].to_string(),
                        status,
                    });
                }
                _ => {
                    return Err(RedirectsError::Parse(format!(
                        "too many fields on line {}",
                        number + 1
                    )))
                }
            }
        }

        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First-match evaluation of a request path. Trailing slashes match
    /// both the slashed and the non-slashed form. Rules whose destination
    /// is not a site-absolute path are skipped.
    pub fn rewrite(&self, path: &str) -> Option<(&str, u16)> {
        let wanted = trim_trailing_slash(path);
        for rule in &self.rules {
            if !rule.to.starts_with('/') {
                continue;
            }
            if trim_trailing_slash(&rule.from) == wanted {
                return Some((&rule.to, rule.status));
            }
        }
        None
    }
}

fn trim_trailing_slash(path: &str) -> &str {
    if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    }
}

/// Load (or fetch from cache) the rule set for an archive. Absent or
/// broken files yield an empty set; the outcome is cached under the
/// archive key either way.
pub async fn for_archive(
    cache: &pagoda_vfs::cache::BoundedCache<Arc<Redirects>>,
    archive: &ZipArchive,
) -> Arc<Redirects> {
    let Some(namespace) = archive.namespace() else {
        return Arc::new(Redirects::default());
    };

    if let Some(cached) = cache.get(namespace, CONFIG_FILE) {
        return cached;
    }

    let parsed = Arc::new(load(archive).await.unwrap_or_else(|err| {
        tracing::debug!(error = %err, "serving without redirects");
        Redirects::default()
    }));
    cache.insert(namespace, CONFIG_FILE, parsed.clone());
    parsed
}

async fn load(archive: &ZipArchive) -> Result<Redirects, RedirectsError> {
    let stat = match archive.lstat(CONFIG_FILE) {
        Ok(stat) => stat,
        Err(VfsError::NotFound) => return Ok(Redirects::default()),
        Err(err) => return Err(RedirectsError::Parse(err.to_string())),
    };
    if stat.size as usize > MAX_CONFIG_SIZE {
        return Err(RedirectsError::FileTooLarge);
    }

    let reader = match archive.open(CONFIG_FILE).await {
        Ok(reader) => reader,
        Err(VfsError::NotFound | VfsError::NotFile) => return Ok(Redirects::default()),
        Err(err) => return Err(RedirectsError::Parse(err.to_string())),
    };

    let mut content = Vec::with_capacity(stat.size as usize);
    reader
        .take(MAX_CONFIG_SIZE as u64 + 1)
        .read_to_end(&mut content)
        .await
        .map_err(|e| RedirectsError::Parse(e.to_string()))?;
    if content.len() > MAX_CONFIG_SIZE {
        return Err(RedirectsError::FileTooLarge);
    }

    Redirects::parse(&String::from_utf8_lossy(&content))
}
