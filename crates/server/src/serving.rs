//! Serving files out of archive roots: path resolution, symlink policy,
//! directory handling, `_redirects`, conditional requests.

use crate::error::{error_page, PagesError};
use crate::pipeline::RequestCtx;
use crate::redirects;
use crate::state::AppState;
use axum::body::Body;
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use pagoda_core::domain::LookupPath;
use pagoda_vfs::{clean_path, escapes_root, FileStat, VfsError, ZipArchive};
use std::sync::Arc;
use time::format_description::well_known::Rfc2822;
use time::OffsetDateTime;
use tokio_util::io::ReaderStream;

/// Bound on symlink hops while resolving one request path.
const MAX_SYMLINK_HOPS: usize = 4;

/// Serve a request that resolved to a lookup path.
pub async fn serve_lookup(
    state: &AppState,
    lookup: &LookupPath,
    request_path: &str,
    ctx: &RequestCtx<'_>,
) -> Response {
    let source = lookup.source.as_str();
    if !source.starts_with("http://") && !source.starts_with("https://") {
        tracing::warn!(source, "lookup path source is not an archive URL");
        return not_found_page();
    }

    let archive = match state.vfs.root(source).await {
        Ok(archive) => archive,
        Err(err) => return PagesError::from(err).into_response(),
    };

    // The redirects engine sees site-absolute paths under this lookup.
    let site_path = format!("/{request_path}");
    let rules = redirects::for_archive(&state.redirects, &archive).await;
    if let Some((to, status)) = rules.rewrite(&site_path) {
        let location = join_prefix(&lookup.prefix, to);
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::MOVED_PERMANENTLY);
        return (status, [(header::LOCATION, location)]).into_response();
    }

    serve_path(&archive, request_path, ctx).await
}

async fn serve_path(archive: &Arc<ZipArchive>, request_path: &str, ctx: &RequestCtx<'_>) -> Response {
    let had_trailing_slash = request_path.is_empty() || request_path.ends_with('/');
    let mut path = clean_path(request_path);
    if escapes_root(&path) {
        return serve_not_found(archive).await;
    }

    let mut hops = 0;
    loop {
        let stat = match archive.lstat(&path) {
            Ok(stat) => stat,
            Err(VfsError::NotFound) => return serve_not_found(archive).await,
            Err(err) => return PagesError::from(err).into_response(),
        };

        if stat.is_symlink {
            hops += 1;
            if hops > MAX_SYMLINK_HOPS {
                return serve_not_found(archive).await;
            }
            let target = match archive.readlink(&path).await {
                Ok(target) => target,
                Err(VfsError::NotFound) => return serve_not_found(archive).await,
                Err(err) => return PagesError::from(err).into_response(),
            };
            // Follow only within the public root.
            let parent = path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
            path = clean_path(&format!("{parent}/{target}"));
            if escapes_root(&path) {
                return serve_not_found(archive).await;
            }
            continue;
        }

        if stat.is_dir {
            // Canonical directory URLs end in a slash; anything else moves
            // there before the index lookup.
            if !had_trailing_slash {
                let mut location = format!("{}/", ctx.path);
                if let Some(query) = ctx.query {
                    location.push('?');
                    location.push_str(query);
                }
                return (StatusCode::FOUND, [(header::LOCATION, location)]).into_response();
            }
            path = if path.is_empty() {
                "index.html".to_string()
            } else {
                format!("{path}/index.html")
            };
            continue;
        }

        return serve_file(archive, &path, &stat, ctx).await;
    }
}

async fn serve_file(
    archive: &Arc<ZipArchive>,
    path: &str,
    stat: &FileStat,
    ctx: &RequestCtx<'_>,
) -> Response {
    if let (Some(modified), Some(since)) = (stat.modified, if_modified_since(ctx)) {
        if modified <= since {
            return StatusCode::NOT_MODIFIED.into_response();
        }
    }

    let reader = match archive.open(path).await {
        Ok(reader) => reader,
        Err(VfsError::NotFound) => return serve_not_found(archive).await,
        Err(err) => return PagesError::from(err).into_response(),
    };

    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, mime.as_ref())
        .header(header::CONTENT_LENGTH, stat.size);
    if let Some(modified) = stat.modified {
        builder = builder.header(header::LAST_MODIFIED, http_date(modified));
    }

    let body = if ctx.method == Method::HEAD {
        Body::empty()
    } else {
        Body::from_stream(ReaderStream::new(reader))
    };

    builder
        .body(body)
        .unwrap_or_else(|_| PagesError::Internal("building response".into()).into_response())
}

/// The tenant's own 404 page when the archive carries one, otherwise the
/// built-in page.
pub async fn serve_not_found(archive: &Arc<ZipArchive>) -> Response {
    match archive.open("404.html").await {
        Ok(reader) => {
            let mut response = Response::new(Body::from_stream(ReaderStream::new(reader)));
            *response.status_mut() = StatusCode::NOT_FOUND;
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                "text/html; charset=utf-8".parse().expect("static header"),
            );
            response
        }
        Err(_) => not_found_page(),
    }
}

pub fn not_found_page() -> Response {
    error_page(
        StatusCode::NOT_FOUND,
        "The page you're looking for could not be found.",
    )
}

fn join_prefix(prefix: &str, to: &str) -> String {
    if prefix == "/" {
        to.to_string()
    } else {
        format!("{}{}", prefix.trim_end_matches('/'), to)
    }
}

fn if_modified_since(ctx: &RequestCtx<'_>) -> Option<OffsetDateTime> {
    let raw = ctx.headers.get(header::IF_MODIFIED_SINCE)?.to_str().ok()?;
    parse_http_date(raw)
}

fn parse_http_date(raw: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(&raw.replace("GMT", "+0000"), &Rfc2822).ok()
}

/// IMF-fixdate per RFC 7231, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
fn http_date(t: OffsetDateTime) -> String {
    const DAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    let day = DAYS[t.weekday().number_days_from_monday() as usize];
    let month = MONTHS[t.month() as usize - 1];
    format!(
        "{day}, {:02} {month} {:04} {:02}:{:02}:{:02} GMT",
        t.day(),
        t.year(),
        t.hour(),
        t.minute(),
        t.second()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn http_date_format() {
        let date = datetime!(1994-11-06 08:49:37 UTC);
        assert_eq!(http_date(date), "Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[test]
    fn http_date_roundtrip() {
        let date = datetime!(2023-04-01 12:00:00 UTC);
        assert_eq!(parse_http_date(&http_date(date)), Some(date));
    }

    #[test]
    fn prefix_joining() {
        assert_eq!(join_prefix("/", "/still-alive.html"), "/still-alive.html");
        assert_eq!(
            join_prefix("/project/", "/still-alive.html"),
            "/project/still-alive.html"
        );
    }
}
