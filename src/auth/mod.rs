//! Withering-token format and per-request auth context
//!
//! A token string is the fixed `wt_` prefix plus the unpadded url-safe
//! base64 of a 128-bit time-ordered id (UUIDv7). The string itself is the
//! hot-path lookup key; a separate UUID primary key is used for storage.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::util::obfuscate_secret;

mod cache;
mod project_cache;

pub use cache::{CachedToken, TokenCache, TokenCacheMetrics};
pub use project_cache::ActiveProjectCache;

pub const TOKEN_PREFIX: &str = "wt_";

/// Mint a new token string around a time-ordered 128-bit id.
pub fn generate_token_string() -> String {
    let id = Uuid::now_v7();
    format!("{TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(id.as_bytes()))
}

/// Structural validation of a presented token string.
///
/// Accepts exactly `wt_` + base64url(16 bytes); anything else is rejected
/// before any store or cache work happens.
pub fn is_well_formed(token: &str) -> bool {
    let Some(encoded) = token.strip_prefix(TOKEN_PREFIX) else {
        return false;
    };
    match URL_SAFE_NO_PAD.decode(encoded) {
        Ok(bytes) => bytes.len() == 16,
        Err(_) => false,
    }
}

/// Validated identity attached to the request after token validation.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub token_id: Uuid,
    pub project_id: Uuid,
    /// Raw token string; used for cache invalidation and rate-limit hashing,
    /// never written to logs or events
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthContext {
    /// Obfuscated token for logs and events.
    pub fn token_display(&self) -> String {
        obfuscate_secret(&self.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_are_well_formed() {
        let token = generate_token_string();
        assert!(token.starts_with(TOKEN_PREFIX));
        assert!(is_well_formed(&token));
        // 16 bytes base64url without padding is 22 chars
        assert_eq!(token.len(), TOKEN_PREFIX.len() + 22);
    }

    #[test]
    fn generated_tokens_are_unique_and_time_ordered() {
        let a = generate_token_string();
        let b = generate_token_string();
        assert_ne!(a, b);
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        assert!(!is_well_formed(""));
        assert!(!is_well_formed("wt_"));
        assert!(!is_well_formed("sk-1234567890"));
        assert!(!is_well_formed("wt_!!!not-base64!!!"));
        // Right alphabet, wrong length
        assert!(!is_well_formed("wt_AAAA"));
    }

    #[test]
    fn context_display_is_obfuscated() {
        let token = generate_token_string();
        let ctx = AuthContext {
            token_id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            token: token.clone(),
            expires_at: None,
        };
        let shown = ctx.token_display();
        assert_ne!(shown, token);
        assert!(shown.contains("****"));
    }
}
