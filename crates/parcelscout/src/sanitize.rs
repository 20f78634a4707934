//! Helpers for keeping credentials out of logs and span attributes.
//!
//! Bearer tokens are never logged; a short fingerprint is enough to tell
//! two tokens apart when correlating refreshes with fast-path failures.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Returns a short deterministic fingerprint of a token.
pub fn token_fingerprint(token: &str) -> String {
    let mut hasher = DefaultHasher::new();
    token.hash(&mut hasher);
    format!("{:08x}", hasher.finish() as u32)
}

/// Masks credential-bearing query parameters and URL userinfo.
///
/// - `https://api.example/search?token=abc&page=2` → `https://api.example/search?token=****&page=2`
/// - `wss://key@chrome.example/` → `wss://****@chrome.example/`
pub fn redact_url(url: &str) -> String {
    let mut out = url.to_string();

    if let Some(scheme_end) = out.find("://") {
        let after_scheme = &out[scheme_end + 3..];
        let authority_end = after_scheme
            .find(['/', '?', '#'])
            .unwrap_or(after_scheme.len());
        if let Some(at_pos) = after_scheme[..authority_end].find('@') {
            out = format!(
                "{}****{}",
                &out[..scheme_end + 3],
                &after_scheme[at_pos..]
            );
        }
    }

    let Some(query_start) = out.find('?') else {
        return out;
    };
    let (base, query) = out.split_at(query_start + 1);
    let redacted: Vec<String> = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((key, _)) if is_sensitive_key(key) => format!("{}=****", key),
            _ => pair.to_string(),
        })
        .collect();
    format!("{}{}", base, redacted.join("&"))
}

fn is_sensitive_key(key: &str) -> bool {
    matches!(
        key.to_ascii_lowercase().as_str(),
        "token" | "access_token" | "apikey" | "api_key" | "key" | "auth"
    )
}

/// Truncates a response body for error messages, on a char boundary.
pub fn truncate_body(body: &str, max_chars: usize) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(max_chars).collect();
    format!("{}…", cut)
}
