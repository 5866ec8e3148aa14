//! Shared utility functions

/// Safely truncate a string to at most `max_bytes` while respecting UTF-8 boundaries.
///
/// If the string is already shorter than `max_bytes`, returns it unchanged.
/// Otherwise, finds the last valid UTF-8 character boundary at or before `max_bytes`
/// and returns a slice up to that point.
pub fn truncate_utf8_safe(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Obfuscate a secret (token string, upstream API key) for logs and API output.
///
/// Keeps up to 4 leading and 3 trailing characters with a masked middle.
/// Short values are masked entirely so no useful substring survives.
///
/// ```
/// use tollbooth::util::obfuscate_secret;
///
/// assert_eq!(obfuscate_secret("wt_AZcadEirSKyLJXZGVBhK2g"), "wt_A****K2g");
/// assert_eq!(obfuscate_secret("short"), "****");
/// ```
pub fn obfuscate_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 3..].iter().collect();
    format!("{head}****{tail}")
}

/// Canonicalize a raw query string for cache-key derivation.
///
/// Pairs are split on `&`, percent-escapes are normalized to uppercase hex,
/// and pairs are sorted so `b=2&a=1` and `a=1&b=2` derive the same key.
/// The input is not decoded; only the escape spelling is normalized, so
/// semantically distinct queries never collide.
pub fn canonicalize_query(query: &str) -> String {
    if query.is_empty() {
        return String::new();
    }
    let mut pairs: Vec<String> = query.split('&').map(normalize_escapes).collect();
    pairs.sort();
    pairs.join("&")
}

/// Uppercase the hex digits of every `%XX` escape in a query component.
/// Only ASCII hex after `%` is touched, so valid UTF-8 stays valid.
fn normalize_escapes(component: &str) -> String {
    let bytes = component.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && bytes[i + 1].is_ascii_hexdigit()
            && bytes[i + 2].is_ascii_hexdigit()
        {
            out.push(b'%');
            out.push(bytes[i + 1].to_ascii_uppercase());
            out.push(bytes[i + 2].to_ascii_uppercase());
            i += 3;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out).unwrap_or_else(|_| component.to_string())
}
