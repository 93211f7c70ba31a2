use axum::http::HeaderMap;
use std::collections::HashMap;
use uuid::Uuid;

pub const AUTH_COOKIE: &str = "auth_token";
pub const SESSION_COOKIE: &str = "session_token";
pub const PROJECT_COOKIE: &str = "project_token";

/// Parses the Cookie header into a name -> value map. Malformed pairs are
/// skipped rather than rejected; token validation happens downstream anyway.
pub fn parse_cookies(headers: &HeaderMap) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for value in headers.get_all(axum::http::header::COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some((name, value)) = pair.split_once('=') {
                cookies.insert(name.trim().to_string(), value.trim().to_string());
            }
        }
    }
    cookies
}

pub fn cookie_token(headers: &HeaderMap, name: &str) -> Option<Uuid> {
    parse_cookies(headers)
        .get(name)
        .and_then(|raw| Uuid::parse_str(raw).ok())
}

/// Session cookies are opaque identifiers: unreadable from scripts, never
/// sent cross-site, expiring with the record they name.
pub fn set_cookie_header(name: &str, token: &Uuid, max_age_secs: u64) -> String {
    format!("{name}={token}; HttpOnly; SameSite=Strict; Path=/; Max-Age={max_age_secs}")
}

pub fn clear_cookie_header(name: &str) -> String {
    format!("{name}=; HttpOnly; SameSite=Strict; Path=/; Max-Age=0")
}

/// Client address for rate limiting, preferring the proxy-provided header.
pub fn client_ip(headers: &HeaderMap, fallback: &str) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| fallback.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_parse_cookies() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_static(
                "session_token=018f7b33-7a39-7d2a-b7c8-111111111111; theme=dark",
            ),
        );

        let cookies = parse_cookies(&headers);
        assert_eq!(cookies.len(), 2);
        assert!(cookie_token(&headers, SESSION_COOKIE).is_some());
        assert!(cookie_token(&headers, AUTH_COOKIE).is_none());
    }

    #[test]
    fn test_malformed_cookie_skipped() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_static("session_token=not-a-uuid; lone-token"),
        );
        assert!(cookie_token(&headers, SESSION_COOKIE).is_none());
    }

    #[test]
    fn test_set_cookie_flags() {
        let header = set_cookie_header(SESSION_COOKIE, &Uuid::nil(), 3600);
        assert!(header.contains("HttpOnly"));
        assert!(header.contains("SameSite=Strict"));
        assert!(header.contains("Max-Age=3600"));
    }

    #[test]
    fn test_client_ip_prefers_forwarded() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.2"),
        );
        assert_eq!(client_ip(&headers, "127.0.0.1"), "203.0.113.9");
        assert_eq!(client_ip(&HeaderMap::new(), "127.0.0.1"), "127.0.0.1");
    }
}
