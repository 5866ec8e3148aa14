//! Provider allowlist
//!
//! The proxy only forwards `(method, path-prefix)` pairs named here. The list
//! is loaded once at startup from a TOML document; without one, a built-in
//! set covering the common OpenAI-compatible endpoints applies.

use std::path::Path;

use anyhow::Context;
use axum::http::Method;
use serde::Deserialize;

/// One forwarding rule: any of `methods` under `path_prefix`.
#[derive(Debug, Clone, Deserialize)]
pub struct AllowRule {
    pub methods: Vec<String>,
    pub path_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Allowlist {
    #[serde(rename = "allow")]
    rules: Vec<AllowRule>,
}

/// Outcome of matching a request against the allowlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMatch {
    Allowed,
    /// No rule covers this path
    UnknownPath,
    /// A rule covers the path but not this method
    MethodNotAllowed,
}

impl Allowlist {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading allowlist {}", path.display()))?;
        let list: Allowlist = toml::from_str(&raw)
            .with_context(|| format!("parsing allowlist {}", path.display()))?;
        if list.rules.is_empty() {
            anyhow::bail!("allowlist {} contains no rules", path.display());
        }
        Ok(list)
    }

    /// Built-in rules for the OpenAI-compatible surface.
    pub fn builtin() -> Self {
        let raw = include_str!("default_allowlist.toml");
        toml::from_str(raw).expect("built-in allowlist is valid")
    }

    pub fn check(&self, method: &Method, path: &str) -> RouteMatch {
        let mut path_known = false;
        for rule in &self.rules {
            if !path.starts_with(&rule.path_prefix) {
                continue;
            }
            path_known = true;
            if rule
                .methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(method.as_str()))
            {
                return RouteMatch::Allowed;
            }
        }
        if path_known {
            RouteMatch::MethodNotAllowed
        } else {
            RouteMatch::UnknownPath
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_allows_models_get() {
        let list = Allowlist::builtin();
        assert_eq!(list.check(&Method::GET, "/v1/models"), RouteMatch::Allowed);
        assert_eq!(
            list.check(&Method::GET, "/v1/models/gpt-4o"),
            RouteMatch::Allowed
        );
    }

    #[test]
    fn builtin_allows_chat_completions_post() {
        let list = Allowlist::builtin();
        assert_eq!(
            list.check(&Method::POST, "/v1/chat/completions"),
            RouteMatch::Allowed
        );
    }

    #[test]
    fn unknown_path_vs_wrong_method() {
        let list = Allowlist::builtin();
        assert_eq!(
            list.check(&Method::GET, "/internal/secrets"),
            RouteMatch::UnknownPath
        );
        assert_eq!(
            list.check(&Method::DELETE, "/v1/chat/completions"),
            RouteMatch::MethodNotAllowed
        );
    }

    #[test]
    fn parses_custom_document() {
        let list: Allowlist = toml::from_str(
            r#"
            [[allow]]
            methods = ["GET", "POST"]
            path_prefix = "/v2/custom"
            "#,
        )
        .unwrap();
        assert_eq!(list.check(&Method::POST, "/v2/custom/x"), RouteMatch::Allowed);
        assert_eq!(
            list.check(&Method::PUT, "/v2/custom/x"),
            RouteMatch::MethodNotAllowed
        );
    }
}
