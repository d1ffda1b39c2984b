//! Route pattern parsing and matching.
//!
//! # Responsibilities
//! - Parse `[METHOD ][host]/path` patterns
//! - Match method, host and path against a request
//! - Rank matching patterns so the most specific one wins
//!
//! # Design Decisions
//! - Host matching is case-insensitive and ignores the port
//! - Path matching is case-sensitive
//! - A path ending in `/` matches its whole subtree; any other path is exact
//! - A `GET` pattern also serves `HEAD`
//! - No regex, no parameters

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use axum::http::{header, HeaderMap, Method};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("empty route pattern")]
    Empty,

    #[error("route pattern {0:?} has no path")]
    MissingPath(String),

    #[error("route pattern {0:?} has an invalid method")]
    Method(String),
}

/// Condition a request must satisfy to reach a route.
pub trait Matcher: Send + Sync + fmt::Debug {
    fn matches_path(&self, host: Option<&str>, path: &str) -> bool;

    fn matches_method(&self, method: &Method) -> bool;
}

/// A compiled route pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    raw: String,
    method: Option<Method>,
    host: Option<String>,
    path: String,
}

impl Pattern {
    pub fn parse(raw: &str) -> Result<Self, PatternError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PatternError::Empty);
        }

        let (method, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((method, rest)) => {
                let method = Method::from_bytes(method.as_bytes())
                    .map_err(|_| PatternError::Method(raw.to_string()))?;
                (Some(method), rest.trim_start())
            }
            None => (None, trimmed),
        };

        let slash = rest
            .find('/')
            .ok_or_else(|| PatternError::MissingPath(raw.to_string()))?;
        let host = (slash > 0).then(|| rest[..slash].to_ascii_lowercase());

        Ok(Self {
            raw: trimmed.to_string(),
            method,
            host,
            path: rest[slash..].to_string(),
        })
    }

    pub fn method(&self) -> Option<&Method> {
        self.method.as_ref()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_subtree(&self) -> bool {
        self.path.ends_with('/')
    }

    /// Orders patterns by how specific they are; greater wins.
    pub fn specificity(&self, other: &Self) -> Ordering {
        self.path
            .len()
            .cmp(&other.path.len())
            .then(self.host.is_some().cmp(&other.host.is_some()))
            .then(self.method.is_some().cmp(&other.method.is_some()))
    }
}

impl Matcher for Pattern {
    fn matches_path(&self, host: Option<&str>, path: &str) -> bool {
        if let Some(expected) = &self.host {
            let Some(host) = host else {
                return false;
            };
            let host = host.split(':').next().unwrap_or_default();
            if !host.eq_ignore_ascii_case(expected) {
                return false;
            }
        }
        if self.is_subtree() {
            path.starts_with(&self.path)
        } else {
            path == self.path
        }
    }

    fn matches_method(&self, method: &Method) -> bool {
        match &self.method {
            None => true,
            Some(expected) => expected == method || (*expected == Method::GET && *method == Method::HEAD),
        }
    }
}

impl FromStr for Pattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// The `Host` header value, if any.
pub fn request_host(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::HOST).and_then(|h| h.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_method_host_and_path() {
        let pattern = Pattern::parse("POST example.com/api/").unwrap();
        assert_eq!(pattern.method(), Some(&Method::POST));
        assert_eq!(pattern.path(), "/api/");
        assert!(pattern.is_subtree());
        assert_eq!(pattern.to_string(), "POST example.com/api/");
    }

    #[test]
    fn rejects_bad_patterns() {
        assert_eq!(Pattern::parse("  "), Err(PatternError::Empty));
        assert!(matches!(Pattern::parse("GET nopath"), Err(PatternError::MissingPath(_))));
        assert!(matches!(Pattern::parse("G(T /"), Err(PatternError::Method(_))));
    }

    #[test]
    fn exact_and_subtree_paths() {
        let exact = Pattern::parse("/health").unwrap();
        assert!(exact.matches_path(None, "/health"));
        assert!(!exact.matches_path(None, "/health/live"));

        let subtree = Pattern::parse("/static/").unwrap();
        assert!(subtree.matches_path(None, "/static/app.js"));
        assert!(subtree.matches_path(None, "/static/"));
        assert!(!subtree.matches_path(None, "/static"));
    }

    #[test]
    fn host_is_case_insensitive_and_ignores_port() {
        let pattern = Pattern::parse("Example.com/").unwrap();
        assert!(pattern.matches_path(Some("EXAMPLE.COM:8080"), "/x"));
        assert!(!pattern.matches_path(Some("other.com"), "/x"));
        assert!(!pattern.matches_path(None, "/x"));
    }

    #[test]
    fn get_pattern_serves_head() {
        let pattern = Pattern::parse("GET /").unwrap();
        assert!(pattern.matches_method(&Method::GET));
        assert!(pattern.matches_method(&Method::HEAD));
        assert!(!pattern.matches_method(&Method::POST));
        assert!(Pattern::parse("/").unwrap().matches_method(&Method::DELETE));
    }

    #[test]
    fn longer_path_is_more_specific() {
        let root = Pattern::parse("/").unwrap();
        let api = Pattern::parse("/api/").unwrap();
        let get_api = Pattern::parse("GET /api/").unwrap();
        assert_eq!(api.specificity(&root), Ordering::Greater);
        assert_eq!(get_api.specificity(&api), Ordering::Greater);
    }
}
