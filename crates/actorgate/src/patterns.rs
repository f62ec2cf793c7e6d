//! Servlet-style URL patterns used to classify request paths.
//!
//! | Pattern      | Matches                                  |
//! |--------------|------------------------------------------|
//! | `/chat`      | exactly `/chat`                          |
//! | `/api/*`     | `/api` and everything below `/api/`      |
//! | `*.json`     | any path ending in `.json`               |
//! | `/`          | every path (default)                     |
//! | `""`         | only the root `/`                        |
//!
//! Exact patterns are consulted before wildcard ones; otherwise the first
//! declared pattern wins.

use std::fmt;

use thiserror::Error;

/// Transport a request path is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Http,
    WebSocket,
    /// No pattern matched; answered with 404 without touching any actor.
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid URL pattern '{0}': expected '/path', '/prefix/*', '*.ext', '/' or ''")]
pub struct PatternError(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Matcher {
    Root,
    Default,
    Exact(String),
    /// Stored without the trailing `/*`.
    Prefix(String),
    /// Stored with the leading `.`.
    Extension(String),
}

/// One parsed URL pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlPattern {
    raw: String,
    matcher: Matcher,
}

impl UrlPattern {
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        let matcher = if pattern.is_empty() {
            Matcher::Root
        } else if pattern == "/" {
            Matcher::Default
        } else if let Some(prefix) = pattern.strip_suffix("/*") {
            if (!prefix.is_empty() && !prefix.starts_with('/')) || prefix.contains('*') {
                return Err(PatternError(pattern.to_string()));
            }
            Matcher::Prefix(prefix.to_string())
        } else if let Some(ext) = pattern.strip_prefix("*.") {
            if ext.is_empty() || ext.contains(['/', '*']) {
                return Err(PatternError(pattern.to_string()));
            }
            Matcher::Extension(format!(".{ext}"))
        } else if pattern.starts_with('/') && !pattern.contains('*') {
            Matcher::Exact(pattern.to_string())
        } else {
            return Err(PatternError(pattern.to_string()));
        };

        Ok(Self {
            raw: pattern.to_string(),
            matcher,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_exact(&self) -> bool {
        matches!(self.matcher, Matcher::Exact(_))
    }

    pub fn matches(&self, path: &str) -> bool {
        match &self.matcher {
            Matcher::Root => path == "/",
            Matcher::Default => true,
            Matcher::Exact(exact) => path == exact,
            Matcher::Prefix(prefix) => {
                path == prefix
                    || path
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            }
            Matcher::Extension(ext) => path.ends_with(ext.as_str()),
        }
    }
}

impl fmt::Display for UrlPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.raw)
    }
}

/// Ordered pattern table mapping paths to a [`Route`].
///
/// Every pattern belongs to exactly one route, so a path is never both
/// HTTP- and WebSocket-routed.
#[derive(Debug, Clone, Default)]
pub struct UrlPatterns {
    exact: Vec<(UrlPattern, Route)>,
    wildcard: Vec<(UrlPattern, Route)>,
}

impl UrlPatterns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the HTTP and WebSocket pattern lists.
    pub fn from_lists<S: AsRef<str>>(http: &[S], websocket: &[S]) -> Result<Self, PatternError> {
        let mut patterns = Self::new();
        for pattern in websocket {
            patterns.add(pattern.as_ref(), Route::WebSocket)?;
        }
        for pattern in http {
            patterns.add(pattern.as_ref(), Route::Http)?;
        }
        Ok(patterns)
    }

    pub fn http(mut self, pattern: &str) -> Result<Self, PatternError> {
        self.add(pattern, Route::Http)?;
        Ok(self)
    }

    pub fn websocket(mut self, pattern: &str) -> Result<Self, PatternError> {
        self.add(pattern, Route::WebSocket)?;
        Ok(self)
    }

    fn add(&mut self, pattern: &str, route: Route) -> Result<(), PatternError> {
        let parsed = UrlPattern::parse(pattern)?;
        if parsed.is_exact() {
            self.exact.push((parsed, route));
        } else {
            self.wildcard.push((parsed, route));
        }
        Ok(())
    }

    /// Route for a request path (query string excluded).
    pub fn classify(&self, path: &str) -> Route {
        self.exact
            .iter()
            .chain(self.wildcard.iter())
            .find(|(pattern, _)| pattern.matches(path))
            .map(|(_, route)| *route)
            .unwrap_or(Route::NotFound)
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcard.is_empty()
    }
}
