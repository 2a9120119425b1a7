//! Small request-path helpers.

use axum::http::HeaderMap;

/// Headers that may carry the real client address when the gateway sits
/// behind a proxy, in precedence order. X-Forwarded-For lists hops
/// left-to-right, so only its first entry is the client.
const CLIENT_IP_HEADERS: [&str; 3] = ["x-forwarded-for", "cf-connecting-ip", "x-real-ip"];

/// Extract the client IP, preferring proxy headers over the socket address.
pub fn extract_client_ip(headers: &HeaderMap, socket_ip: Option<&str>) -> String {
    let from_headers = CLIENT_IP_HEADERS.iter().find_map(|name| {
        let value = headers.get(*name)?.to_str().ok()?;
        let candidate = value.split(',').next()?.trim();
        (!candidate.is_empty()).then(|| candidate.to_string())
    });
    match (from_headers, socket_ip) {
        (Some(ip), _) => ip,
        (None, Some(ip)) => ip.to_string(),
        (None, None) => "unknown".to_string(),
    }
}

/// First characters of an API key, safe to persist in logs.
pub fn api_key_prefix(key: &str) -> String {
    let prefix: String = key.chars().take(8).collect();
    if key.chars().count() > 8 {
        format!("{}...", prefix)
    } else {
        prefix
    }
}
