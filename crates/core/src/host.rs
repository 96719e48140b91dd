//! Host header normalization.

/// Normalize a request host for domain lookup: strip an optional port and
/// lowercase the name.
///
/// IPv6 literals keep their brackets so `[::1]:8080` and `[::1]` normalize
/// to the same key.
pub fn normalize(host: &str) -> String {
    let host = host.trim();

    let without_port = if let Some(end) = host.rfind(']') {
        // bracketed IPv6, port (if any) follows the bracket
        &host[..=end]
    } else if let Some(idx) = host.rfind(':') {
        // reject bare IPv6 without brackets (more than one colon)
        if host[..idx].contains(':') {
            host
        } else {
            &host[..idx]
        }
    } else {
        host
    };

    without_port.to_ascii_lowercase()
}

/// Whether `host` is `parent` itself or a subdomain of it.
pub fn is_subdomain_of(host: &str, parent: &str) -> bool {
    let host = normalize(host);
    let parent = normalize(parent);
    host == parent || host.ends_with(&format!(".{parent}"))
}
