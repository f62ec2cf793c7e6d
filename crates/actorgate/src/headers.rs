//! Case-insensitive, read-only view over request headers.

use http::HeaderMap;
use http::header::{CONNECTION, CONTENT_TYPE, COOKIE, UPGRADE};

/// Read-only header collection handed to actors with every HTTP request.
///
/// Lookups follow RFC 7230: `Content-Type`, `content-type` and `CONTENT-TYPE`
/// resolve to the same entry. The view takes ownership of the transport's
/// native `HeaderMap`, so no header is copied.
#[derive(Debug, Clone, Default)]
pub struct HeaderView {
    inner: HeaderMap,
}

impl HeaderView {
    pub fn new(inner: HeaderMap) -> Self {
        Self { inner }
    }

    /// First value of `name`, if present and valid visible ASCII.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner.get(name).and_then(|v| v.to_str().ok())
    }

    /// All values of `name` in arrival order. Non-text values are skipped.
    pub fn get_all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> + use<'a> {
        self.inner
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get(CONTENT_TYPE.as_str())
    }

    /// Every request cookie as `(name, value)`, across all `Cookie` headers in
    /// arrival order.
    ///
    /// Surrounding double quotes are stripped from values.
    pub fn cookies(&self) -> impl Iterator<Item = (&str, &str)> {
        self.get_all(COOKIE.as_str())
            .flat_map(|header| header.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .map(|(name, value)| {
                let value = value.trim();
                let value = value
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .unwrap_or(value);
                (name.trim(), value)
            })
    }

    /// Value of the request cookie `name`. Cookie names are case-sensitive.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }

    /// Whether this is an HTTP/1.1 WebSocket upgrade request.
    pub fn is_websocket_upgrade(&self) -> bool {
        let upgrade = self
            .get(UPGRADE.as_str())
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"));
        let connection = self.get_all(CONNECTION.as_str()).any(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        });
        upgrade && connection
    }

    /// Iterate `(name, value)` pairs; names are lowercase.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str(), v)))
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn as_map(&self) -> &HeaderMap {
        &self.inner
    }
}

impl From<HeaderMap> for HeaderView {
    fn from(inner: HeaderMap) -> Self {
        Self::new(inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderName, HeaderValue};

    fn view(pairs: &[(&str, &'static str)]) -> HeaderView {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            let name = HeaderName::from_bytes(k.as_bytes()).unwrap();
            map.append(name, HeaderValue::from_static(v));
        }
        HeaderView::new(map)
    }

    #[test]
    fn lookup_ignores_name_case() {
        let headers = view(&[("Content-Type", "text/html")]);

        for name in ["Content-Type", "content-type", "CONTENT-TYPE", "Content-type"] {
            assert_eq!(headers.get(name), Some("text/html"), "lookup of {name}");
            assert!(headers.contains(name));
        }
        assert_eq!(headers.content_type(), Some("text/html"));
    }

    #[test]
    fn missing_or_invalid_names_are_absent() {
        let headers = view(&[("accept", "*/*")]);
        assert_eq!(headers.get("x-missing"), None);
        assert_eq!(headers.get("not a header"), None);
    }

    #[test]
    fn get_all_preserves_order() {
        let headers = view(&[("x-trace", "a"), ("X-Trace", "b")]);
        let values: Vec<_> = headers.get_all("x-TRACE").collect();
        assert_eq!(values, ["a", "b"]);
        assert_eq!(headers.get("x-trace"), Some("a"));
    }

    #[test]
    fn cookie_lookup_across_headers() {
        let headers = view(&[
            ("cookie", "theme=dark; JSESSIONID=\"sess_01\""),
            ("cookie", "lang=en"),
        ]);
        assert_eq!(headers.cookie("JSESSIONID"), Some("sess_01"));
        assert_eq!(headers.cookie("lang"), Some("en"));
        assert_eq!(headers.cookie("jsessionid"), None);
        assert_eq!(headers.cookie("missing"), None);
    }

    #[test]
    fn cookies_are_listed_in_arrival_order() {
        let headers = view(&[("cookie", "a=1; b=\"two\";broken"), ("cookie", "a=3")]);
        let cookies: Vec<_> = headers.cookies().collect();
        assert_eq!(cookies, [("a", "1"), ("b", "two"), ("a", "3")]);
        assert_eq!(view(&[]).cookies().count(), 0);
    }

    #[test]
    fn detects_websocket_upgrade() {
        let upgrade = view(&[("upgrade", "WebSocket"), ("connection", "keep-alive, Upgrade")]);
        assert!(upgrade.is_websocket_upgrade());

        let plain = view(&[("connection", "keep-alive")]);
        assert!(!plain.is_websocket_upgrade());
    }
}
