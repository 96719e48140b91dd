//! ACME HTTP-01 challenge serving.

use crate::domains::Domain;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use pagoda_core::ACME_CHALLENGE_PREFIX;
use std::sync::Arc;

/// Serve a recorded challenge response, if the request is a challenge for
/// a token this domain knows. Anything else falls through to normal
/// serving.
pub fn try_serve_challenge(domain: Option<&Arc<Domain>>, path: &str) -> Option<Response> {
    let token = path.strip_prefix(ACME_CHALLENGE_PREFIX)?;
    if token.is_empty() || token.contains('/') {
        return None;
    }

    let key_auth = domain?.inner.acme_challenges.get(token)?.clone();
    tracing::debug!(token, "serving acme challenge");
    Some(
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain")],
            key_auth,
        )
            .into_response(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagoda_core::domain::VirtualDomain;

    fn domain_with_challenge(token: &str, key_auth: &str) -> Arc<Domain> {
        let mut inner = VirtualDomain {
            name: "foo.test".to_string(),
            ..Default::default()
        };
        inner
            .acme_challenges
            .insert(token.to_string(), key_auth.to_string());
        Domain::new(Arc::new(inner))
    }

    #[test]
    fn serves_known_challenge() {
        let domain = domain_with_challenge("tok123", "tok123.keyauth");
        let response =
            try_serve_challenge(Some(&domain), "/.well-known/acme-challenge/tok123");
        assert_eq!(response.unwrap().status(), StatusCode::OK);
    }

    #[test]
    fn unknown_token_falls_through() {
        let domain = domain_with_challenge("tok123", "tok123.keyauth");
        assert!(try_serve_challenge(Some(&domain), "/.well-known/acme-challenge/other").is_none());
        assert!(try_serve_challenge(Some(&domain), "/.well-known/acme-challenge/").is_none());
        assert!(try_serve_challenge(None, "/.well-known/acme-challenge/tok123").is_none());
        assert!(try_serve_challenge(Some(&domain), "/index.html").is_none());
    }
}
