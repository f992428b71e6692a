//! Session-id extraction for sticky routing.
//!
//! Lookup order: URL-rewrite marker in the path, then the SSL session
//! cookie on secure connections, then the plain session cookie.

use axum::http::HeaderMap;

use crate::config::SessionConfig;

/// Extract the session id a sticky-session lookup should use, if any.
pub fn requested_session_id(
    path: &str,
    headers: &HeaderMap,
    is_secure: bool,
    config: &SessionConfig,
) -> Option<String> {
    if let Some(idx) = path.rfind(&config.url_prefix) {
        let id = &path[idx + config.url_prefix.len()..];
        if !id.is_empty() {
            return Some(id.to_string());
        }
    }

    if is_secure {
        if let Some(id) = cookie_value(headers, &config.ssl_cookie_name) {
            return Some(id);
        }
    }

    cookie_value(headers, &config.cookie_name)
}

/// Find a cookie by name across all `Cookie` headers.
fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for value in headers.get_all(axum::http::header::COOKIE) {
        let Ok(value) = value.to_str() else { continue };

        for pair in value.split(';') {
            let mut parts = pair.trim().splitn(2, '=');
            if parts.next() == Some(name) {
                return parts.next().map(|v| v.to_string());
            }
        }
    }

    None
}
