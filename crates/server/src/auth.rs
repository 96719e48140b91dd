//! OAuth access control: session cookies, the cross-domain authorization
//! dance proxied through the pages domain, and per-request authorization
//! against the identity API.

use crate::error::error_page;
use crate::pipeline::RequestCtx;
use crate::state::AppState;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use pagoda_core::config::{AuthConfig, GitLabConfig};
use pagoda_core::{host, AUTH_CALLBACK_PATH, SESSION_COOKIE_NAME, SESSION_MAX_AGE_SECS};
use pagoda_sealer::{
    constant_time_eq, random_state, CodeRelay, CookieSealer, SealerKeys, SessionValues,
};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error: String,
}

/// Outcome of the per-request authorization check.
pub enum AuthOutcome {
    /// Token accepted by the identity API.
    Allowed,
    /// A response was produced (session destroyed, flow restarted).
    Respond(Response),
    /// Authorization failed for another reason; the caller serves the
    /// tenant's not-found page.
    NotFoundHook,
}

/// The OAuth layer for one process.
pub struct Auth {
    pages_domain: String,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    gitlab_server: String,
    scope: String,
    cookie: CookieSealer,
    relay: CodeRelay,
    api_client: reqwest::Client,
}

impl Auth {
    pub fn new(config: &AuthConfig, gitlab: &GitLabConfig) -> Self {
        let keys = SealerKeys::derive(&config.secret);
        let api_client = reqwest::Client::builder()
            .timeout(gitlab.client_timeout())
            .build()
            .expect("building identity api client");

        Self {
            pages_domain: config.pages_domain.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri.clone(),
            gitlab_server: gitlab.public_server.trim_end_matches('/').to_string(),
            scope: config.scope.clone(),
            cookie: CookieSealer::new(&keys, Duration::from_secs(SESSION_MAX_AGE_SECS)),
            relay: CodeRelay::new(&keys, config.relay_expiry()),
            api_client,
        }
    }

    /// Load the session from the request cookie. `Err` means a cookie was
    /// presented but rejected.
    pub fn load_session(&self, headers: &HeaderMap) -> Result<SessionValues, ()> {
        match session_cookie(headers) {
            Some(value) => self.cookie.unseal(&value).map_err(|_| ()),
            None => Ok(SessionValues::default()),
        }
    }

    /// The access token, if the request carries a valid session with one.
    pub fn token_if_exists(&self, headers: &HeaderMap) -> Option<String> {
        self.load_session(headers).ok()?.access_token
    }

    fn set_cookie_value(&self, values: &SessionValues, https: bool) -> Option<HeaderValue> {
        let sealed = self.cookie.seal(values).ok()?;
        let mut cookie = format!(
            "{SESSION_COOKIE_NAME}={sealed}; Path=/; Max-Age={SESSION_MAX_AGE_SECS}; HttpOnly"
        );
        if https {
            cookie.push_str("; Secure");
        }
        cookie.parse().ok()
    }

    /// A redirect carrying a rotated session cookie.
    fn redirect_with_session(
        &self,
        location: &str,
        values: &SessionValues,
        https: bool,
    ) -> Response {
        let mut response = (
            StatusCode::FOUND,
            [(header::LOCATION, location.to_string())],
        )
            .into_response();
        if let Some(cookie) = self.set_cookie_value(values, https) {
            response.headers_mut().insert(header::SET_COOKIE, cookie);
        } else {
            tracing::error!("failed to seal session");
            return error_page(StatusCode::INTERNAL_SERVER_ERROR, "Failed to save session.");
        }
        response
    }

    /// Handle `/auth` on any host: the pages-domain proxy legs and the
    /// tenant callback. `None` means the request is not an auth request and
    /// serving continues.
    pub async fn try_authenticate(
        &self,
        state: &AppState,
        ctx: &RequestCtx<'_>,
    ) -> Option<Response> {
        if ctx.path != AUTH_CALLBACK_PATH {
            return None;
        }
        tracing::info!(host = %ctx.host, "received oauth authentication callback");

        let session = match self.load_session(ctx.headers) {
            Ok(session) => session,
            // Unreadable cookie: issue a fresh session and retry the same
            // address, as if the user had just arrived.
            Err(()) => {
                return Some(self.redirect_with_session(
                    &ctx.request_address(),
                    &SessionValues::default(),
                    ctx.https,
                ))
            }
        };

        let query = parse_query(ctx.query);

        if let (Some(domain), Some(nonce)) = (q_get(&query, "domain"), q_get(&query, "state")) {
            return Some(
                self.proxy_to_identity_provider(state, ctx, session, domain, nonce)
                    .await,
            );
        }

        if session.proxy_auth_domain.is_some() {
            return Some(self.relay_to_tenant(ctx, session, &query));
        }

        if let Some(error) = q_get(&query, "error") {
            tracing::warn!(%error, "oauth endpoint returned error");
            return Some(error_page(
                StatusCode::UNAUTHORIZED,
                "Authentication failed.",
            ));
        }

        if let (Some(code), Some(nonce)) = (q_get(&query, "code"), q_get(&query, "state")) {
            return Some(self.finish_authentication(ctx, session, code, nonce).await);
        }

        None
    }

    /// Pages domain, step one: a tenant sent the user here to start the
    /// dance. Remember where to send the code and bounce to the provider.
    async fn proxy_to_identity_provider(
        &self,
        state: &AppState,
        ctx: &RequestCtx<'_>,
        mut session: SessionValues,
        domain_param: &str,
        state_param: &str,
    ) -> Response {
        let Ok(proxy_url) = Url::parse(domain_param) else {
            tracing::warn!(domain = %domain_param, "failed to parse domain query parameter");
            return error_page(StatusCode::INTERNAL_SERVER_ERROR, "Bad auth request.");
        };
        let proxy_host = proxy_url.host_str().unwrap_or_default();

        if !self.domain_allowed(state, proxy_host).await {
            tracing::warn!(domain = %proxy_host, "domain is not configured");
            return error_page(StatusCode::UNAUTHORIZED, "Domain is not configured.");
        }

        tracing::info!(domain = %domain_param, "user is authenticating via domain");
        session.proxy_auth_domain = Some(domain_param.to_string());

        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("state", state_param)
            .append_pair("scope", &self.scope);
        let location = format!("{}/oauth/authorize?{}", self.gitlab_server, query.finish());

        self.redirect_with_session(&location, &session, ctx.https)
    }

    /// Pages domain, step two: the provider called back. Seal the code for
    /// the originating tenant and send the browser there.
    fn relay_to_tenant(
        &self,
        ctx: &RequestCtx<'_>,
        mut session: SessionValues,
        query: &[(String, String)],
    ) -> Response {
        let proxy_domain = session.proxy_auth_domain.take().unwrap_or_default();
        tracing::info!(domain = %proxy_domain, "redirecting auth callback to custom domain");

        let code = q_get(query, "code").unwrap_or_default();
        let sealed = match self.relay.seal(code, &proxy_domain) {
            Ok(sealed) => sealed,
            Err(err) => {
                tracing::error!(error = %err, "failed to seal authorization code");
                return error_page(StatusCode::SERVICE_UNAVAILABLE, "Authentication failed.");
            }
        };

        // Rebuild the query with the sealed code; never forward a `token`
        // parameter across domains.
        let mut rebuilt = url::form_urlencoded::Serializer::new(String::new());
        for (name, value) in query {
            match name.as_str() {
                "token" | "code" => {}
                _ => {
                    rebuilt.append_pair(name, value);
                }
            }
        }
        rebuilt.append_pair("code", &sealed);

        let location = format!("{proxy_domain}{AUTH_CALLBACK_PATH}?{}", rebuilt.finish());
        self.redirect_with_session(&location, &session, ctx.https)
    }

    /// Tenant domain: validate state, unseal the relayed code, exchange it
    /// for an access token and return to the page the user wanted.
    async fn finish_authentication(
        &self,
        ctx: &RequestCtx<'_>,
        mut session: SessionValues,
        code_param: &str,
        state_param: &str,
    ) -> Response {
        let state_matches = session
            .state
            .as_deref()
            .map(|expected| constant_time_eq(expected, state_param))
            .unwrap_or(false);
        if !state_matches {
            tracing::warn!("authentication state did not match expected");
            return error_page(StatusCode::UNAUTHORIZED, "Authentication failed.");
        }

        let Some(return_uri) = session.uri.clone() else {
            tracing::error!("cannot extract redirect uri from session");
            return error_page(StatusCode::INTERNAL_SERVER_ERROR, "Authentication failed.");
        };

        let code = match self.relay.open(code_param, &ctx.request_domain()) {
            Ok(code) => code,
            Err(err) => {
                tracing::error!(error = %err, "failed to unseal authorization code");
                return error_page(StatusCode::INTERNAL_SERVER_ERROR, "Authentication failed.");
            }
        };

        let token = match self.fetch_access_token(&code).await {
            Ok(token) => token,
            Err(err) => {
                tracing::error!(error = %err, redirect_uri = %return_uri, "fetching access token failed");
                return error_page(StatusCode::SERVICE_UNAVAILABLE, "Authentication failed.");
            }
        };

        session.access_token = Some(token);
        session.state = None;

        tracing::info!(redirect_uri = %return_uri, "authentication successful, redirecting back");
        self.redirect_with_session(&return_uri, &session, ctx.https)
    }

    /// Gate a protected request: with no usable token, kick off the login
    /// flow via the pages domain.
    pub fn require_auth(&self, ctx: &RequestCtx<'_>) -> Result<SessionValues, Response> {
        let session = match self.load_session(ctx.headers) {
            Ok(session) => session,
            Err(()) => {
                return Err(self.redirect_with_session(
                    &ctx.request_address(),
                    &SessionValues::default(),
                    ctx.https,
                ))
            }
        };

        if session.access_token.is_some() {
            return Ok(session);
        }

        tracing::debug!("no access token, redirecting user to oauth login");
        let nonce = random_state();
        let values = SessionValues {
            state: Some(nonce.clone()),
            uri: Some(ctx.request_address()),
            ..SessionValues::default()
        };

        // The pages domain may sit on the public suffix list, so the flow
        // always starts there rather than on the tenant host.
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query
            .append_pair("domain", &ctx.request_domain())
            .append_pair("state", &nonce);
        let location = format!("{}?{}", self.redirect_uri, query.finish());

        Err(self.redirect_with_session(&location, &values, ctx.https))
    }

    /// Authorize an authenticated request against the identity API.
    pub async fn check_authorization(
        &self,
        ctx: &RequestCtx<'_>,
        session: &SessionValues,
        project_id: u64,
    ) -> AuthOutcome {
        let Some(token) = session.access_token.clone() else {
            return AuthOutcome::NotFoundHook;
        };

        let url = if project_id > 0 {
            format!(
                "{}/api/v4/projects/{}/pages_access",
                self.gitlab_server, project_id
            )
        } else {
            format!("{}/api/v4/user", self.gitlab_server)
        };

        let response = match self.api_client.get(url).bearer_auth(token).send().await {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(error = %err, "failed to retrieve info with token");
                return AuthOutcome::NotFoundHook;
            }
        };

        match response.status() {
            StatusCode::OK => AuthOutcome::Allowed,
            StatusCode::UNAUTHORIZED => {
                let invalid_token = response
                    .json::<ErrorResponse>()
                    .await
                    .map(|body| body.error == "invalid_token")
                    .unwrap_or(false);
                if invalid_token {
                    tracing::warn!("access token was invalid, destroying session");
                    AuthOutcome::Respond(self.destroy_session(ctx))
                } else {
                    AuthOutcome::NotFoundHook
                }
            }
            _ => AuthOutcome::NotFoundHook,
        }
    }

    /// Drop the access token and restart at the same address.
    pub fn destroy_session(&self, ctx: &RequestCtx<'_>) -> Response {
        tracing::debug!("destroying session");
        let values = SessionValues::default();
        self.redirect_with_session(&ctx.request_address(), &values, ctx.https)
    }

    async fn domain_allowed(&self, state: &AppState, name: &str) -> bool {
        if host::is_subdomain_of(name, &self.pages_domain) {
            return true;
        }
        matches!(state.source.get_domain(name).await, Ok(Some(_)))
    }

    async fn fetch_access_token(&self, code: &str) -> anyhow::Result<String> {
        let response = self
            .api_client
            .post(format!("{}/oauth/token", self.gitlab_server))
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("code", code),
                ("grant_type", "authorization_code"),
                ("redirect_uri", self.redirect_uri.as_str()),
            ])
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            anyhow::bail!("token endpoint returned {}", response.status());
        }
        let token: TokenResponse = response.json().await?;
        Ok(token.access_token)
    }
}

/// Extract the session cookie value from a Cookie header.
fn session_cookie(headers: &HeaderMap) -> Option<String> {
    for header_value in headers.get_all(header::COOKIE) {
        let Ok(raw) = header_value.to_str() else {
            continue;
        };
        for pair in raw.split(';') {
            let Some((name, value)) = pair.trim().split_once('=') else {
                continue;
            };
            if name == SESSION_COOKIE_NAME {
                return Some(value.to_string());
            }
        }
    }
    None
}

fn parse_query(query: Option<&str>) -> Vec<(String, String)> {
    match query {
        Some(query) => url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect(),
        None => Vec::new(),
    }
}

fn q_get<'a>(query: &'a [(String, String)], name: &str) -> Option<&'a str> {
    query
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_cookie_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            "other=1; gitlab-pages=abc123; x=y".parse().unwrap(),
        );
        assert_eq!(session_cookie(&headers).as_deref(), Some("abc123"));

        let empty = HeaderMap::new();
        assert!(session_cookie(&empty).is_none());
    }

    #[test]
    fn query_helpers() {
        let query = parse_query(Some("code=abc&state=xyz&code=second"));
        assert_eq!(q_get(&query, "code"), Some("abc"));
        assert_eq!(q_get(&query, "state"), Some("xyz"));
        assert_eq!(q_get(&query, "missing"), None);
    }
}
