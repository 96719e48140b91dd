//! The request pipeline: one entry handler dispatching auxiliary
//! handlers, domain resolution, access control, rate limiting and file
//! serving.

use crate::acme;
use crate::artifact::ProxyOutcome;
use crate::auth::AuthOutcome;
use crate::domains::resolve_domain;
use crate::error::{error_page, PagesError};
use crate::metrics;
use crate::serving;
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Router};
use pagoda_core::host;
use percent_encoding::percent_decode_str;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

/// How a listener derives the request scheme.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerKind {
    Http,
    Https,
    /// Reverse-proxy mode: trust `X-Forwarded-Proto`.
    Proxy,
}

/// Per-request facts shared by the pipeline stages.
pub struct RequestCtx<'a> {
    pub method: Method,
    pub https: bool,
    /// Normalized host (lowercased, port stripped).
    pub host: String,
    /// Host header as received, for building redirects.
    pub raw_host: String,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub headers: &'a HeaderMap,
}

impl RequestCtx<'_> {
    fn scheme(&self) -> &'static str {
        if self.https {
            "https"
        } else {
            "http"
        }
    }

    /// `scheme://host/path?query` of this request.
    pub fn request_address(&self) -> String {
        let mut address = format!("{}://{}{}", self.scheme(), self.raw_host, self.path);
        if let Some(query) = self.query {
            address.push('?');
            address.push_str(query);
        }
        address
    }

    /// `scheme://host` of this request.
    pub fn request_domain(&self) -> String {
        format!("{}://{}", self.scheme(), self.raw_host)
    }
}

/// Create the application router for one listener kind.
pub fn create_router(state: AppState, kind: ListenerKind) -> Router {
    Router::new()
        .fallback(handle)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            finalize_response,
        ))
        .layer(Extension(kind))
        .with_state(state)
}

fn panic_response(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s
    } else {
        "unknown panic"
    };
    tracing::error!(panic = detail, "request handler panicked");
    error_page(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Something went wrong serving this page.",
    )
}

/// Outermost middleware: in-flight gauge, request counter and the
/// configured custom headers.
async fn finalize_response(State(state): State<AppState>, request: Request, next: Next) -> Response {
    metrics::SESSIONS_ACTIVE.inc();
    let method = request.method().clone();

    let mut response = next.run(request).await;
    metrics::SESSIONS_ACTIVE.dec();
    metrics::REQUESTS_TOTAL
        .with_label_values(&[response.status().as_str(), method.as_str()])
        .inc();

    for (name, value) in state.custom_headers.iter() {
        response.headers_mut().insert(name.clone(), value.clone());
    }
    response
}

async fn handle(
    State(state): State<AppState>,
    Extension(kind): Extension<ListenerKind>,
    request: Request<Body>,
) -> Response {
    let (parts, _body) = request.into_parts();
    let raw_host = request_host(&parts.uri, &parts.headers);
    let ctx = RequestCtx {
        method: parts.method.clone(),
        https: request_is_https(kind, &parts.headers),
        host: host::normalize(&raw_host),
        raw_host,
        path: parts.uri.path(),
        query: parts.uri.query(),
        headers: &parts.headers,
    };

    // Readiness probe short-circuits everything else.
    if ctx.path == state.config.server.status_path {
        return health_check(&state);
    }

    // Global cleartext-to-HTTPS upgrade, method preserved.
    if state.config.server.redirect_http && !ctx.https {
        return redirect_to_https(&ctx, StatusCode::TEMPORARY_REDIRECT);
    }

    // Artifact hosts proxy to the artifacts server instead of serving.
    if let Some(artifact) = &state.artifact {
        if artifact.matches(&ctx.host) {
            let token = state
                .auth
                .as_ref()
                .and_then(|auth| auth.token_if_exists(ctx.headers));
            return match artifact.proxy(ctx.path, ctx.query, token.as_deref()).await {
                ProxyOutcome::Response(response) => response,
                ProxyOutcome::InvalidToken => match &state.auth {
                    Some(auth) => auth.destroy_session(&ctx),
                    None => PagesError::Unauthorized.into_response(),
                },
            };
        }
    }

    let domain = match resolve_domain(&state, &ctx.host).await {
        Ok(domain) => domain,
        Err(err) => return PagesError::from(err).into_response(),
    };

    if let Some(response) = acme::try_serve_challenge(domain.as_ref(), ctx.path) {
        return response;
    }

    // The OAuth callback is answered on every host, including the pages
    // domain itself, which may not be a tenant.
    if let Some(auth) = &state.auth {
        if let Some(response) = auth.try_authenticate(&state, &ctx).await {
            return response;
        }
    }

    let Some(domain) = domain else {
        return serving::not_found_page();
    };

    let decoded_path = percent_decode_str(ctx.path).decode_utf8_lossy().into_owned();

    if !ctx.https && domain.inner.is_https_only(&decoded_path) {
        return redirect_to_https(&ctx, StatusCode::MOVED_PERMANENTLY);
    }

    let Ok(resolved) = domain.inner.resolve(&decoded_path) else {
        return serving::not_found_page();
    };
    let lookup = resolved.lookup.clone();
    let request_path = resolved.request_path;

    if lookup.access_control {
        let Some(auth) = &state.auth else {
            // Access-controlled content without an auth layer stays hidden.
            return serving::not_found_page();
        };
        let session = match auth.require_auth(&ctx) {
            Ok(session) => session,
            Err(response) => return response,
        };
        match auth
            .check_authorization(&ctx, &session, lookup.project_id)
            .await
        {
            AuthOutcome::Allowed => {}
            AuthOutcome::Respond(response) => return response,
            AuthOutcome::NotFoundHook => {
                return serve_not_found_auth_failed(&state, &lookup, &ctx).await
            }
        }
    }

    if let Err(limited) = state.rate_limit.host_allowed(&ctx.host) {
        tracing::debug!(host = %ctx.host, "rate limit exceeded");
        return PagesError::TooManyRequests {
            retry_after_secs: limited.retry_after_secs,
        }
        .into_response();
    }

    if ctx.method == Method::OPTIONS {
        return cors_preflight(&state, &ctx);
    }

    let mut response = serving::serve_lookup(&state, &lookup, &request_path, &ctx).await;
    apply_cors(&state, &ctx, &mut response);
    response
}

/// The tenant-controlled 404 served when authorization fails for a reason
/// other than an invalid token.
async fn serve_not_found_auth_failed(
    state: &AppState,
    lookup: &pagoda_core::domain::LookupPath,
    _ctx: &RequestCtx<'_>,
) -> Response {
    let source = lookup.source.as_str();
    if source.starts_with("http://") || source.starts_with("https://") {
        if let Ok(archive) = state.vfs.root(source).await {
            return serving::serve_not_found(&archive).await;
        }
    }
    serving::not_found_page()
}

fn health_check(state: &AppState) -> Response {
    if state.domains.is_ready() {
        (StatusCode::OK, "success").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not yet ready").into_response()
    }
}

fn redirect_to_https(ctx: &RequestCtx<'_>, status: StatusCode) -> Response {
    let mut location = format!("https://{}{}", ctx.raw_host, ctx.path);
    if let Some(query) = ctx.query {
        location.push('?');
        location.push_str(query);
    }
    (status, [(header::LOCATION, location)]).into_response()
}

fn request_host(uri: &Uri, headers: &HeaderMap) -> String {
    if let Some(authority) = uri.authority() {
        return authority.to_string();
    }
    headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn request_is_https(kind: ListenerKind, headers: &HeaderMap) -> bool {
    match kind {
        ListenerKind::Https => true,
        ListenerKind::Http => false,
        ListenerKind::Proxy => headers
            .get("x-forwarded-proto")
            .and_then(|value| value.to_str().ok())
            .map(|proto| proto.eq_ignore_ascii_case("https"))
            .unwrap_or(false),
    }
}

/// GET-only CORS, unless cross-origin requests are disabled.
fn apply_cors(state: &AppState, ctx: &RequestCtx<'_>, response: &mut Response) {
    if state.config.server.disable_cross_origin_requests {
        return;
    }
    if ctx.method == Method::GET && ctx.headers.contains_key(header::ORIGIN) {
        response.headers_mut().insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            header::HeaderValue::from_static("*"),
        );
    }
}

fn cors_preflight(state: &AppState, ctx: &RequestCtx<'_>) -> Response {
    if state.config.server.disable_cross_origin_requests
        || !ctx.headers.contains_key(header::ORIGIN)
    {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    (
        StatusCode::NO_CONTENT,
        [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (header::ACCESS_CONTROL_ALLOW_METHODS, "GET"),
        ],
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_detection_per_listener() {
        let headers = HeaderMap::new();
        assert!(!request_is_https(ListenerKind::Http, &headers));
        assert!(request_is_https(ListenerKind::Https, &headers));
        assert!(!request_is_https(ListenerKind::Proxy, &headers));

        let mut forwarded = HeaderMap::new();
        forwarded.insert("x-forwarded-proto", "https".parse().unwrap());
        assert!(request_is_https(ListenerKind::Proxy, &forwarded));
        assert!(!request_is_https(ListenerKind::Http, &forwarded));
    }

    #[test]
    fn request_address_building() {
        let headers = HeaderMap::new();
        let ctx = RequestCtx {
            method: Method::GET,
            https: true,
            host: "a.test".to_string(),
            raw_host: "a.test".to_string(),
            path: "/secret/",
            query: Some("x=1"),
            headers: &headers,
        };
        assert_eq!(ctx.request_address(), "https://a.test/secret/?x=1");
        assert_eq!(ctx.request_domain(), "https://a.test");
    }
}
