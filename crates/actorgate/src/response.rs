//! Reply vocabulary actors use to answer HTTP requests.
//!
//! An [`HttpResponse`] is transport-neutral: the gateway translates it into
//! whatever the bound transport writes (status line, headers, body).

use bytes::Bytes;
use http::StatusCode;

// ============================================================================
// Response Body
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ResponseBody {
    #[default]
    Empty,
    Text(String),
    Binary(Bytes),
}

impl ResponseBody {
    pub fn len(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_bytes(self) -> Bytes {
        match self {
            Self::Empty => Bytes::new(),
            Self::Text(s) => Bytes::from(s),
            Self::Binary(b) => b,
        }
    }
}

impl From<String> for ResponseBody {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for ResponseBody {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<Bytes> for ResponseBody {
    fn from(b: Bytes) -> Self {
        Self::Binary(b)
    }
}

impl From<Vec<u8>> for ResponseBody {
    fn from(b: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(b))
    }
}

// ============================================================================
// Cookie
// ============================================================================

/// A `Set-Cookie` entry attached to a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub path: Option<String>,
    pub domain: Option<String>,
    /// Lifetime in seconds; `Some(0)` deletes the cookie.
    pub max_age: Option<i64>,
    pub http_only: bool,
    pub secure: bool,
    pub same_site: Option<String>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            path: None,
            domain: None,
            max_age: None,
            http_only: false,
            secure: false,
            same_site: None,
        }
    }

    /// The cookie the gateway issues for a newly created session.
    pub fn session(name: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self::new(name, session_id).with_path("/").with_http_only(true)
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_max_age(mut self, seconds: i64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    pub fn with_http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_same_site(mut self, same_site: impl Into<String>) -> Self {
        self.same_site = Some(same_site.into());
        self
    }

    /// Render as a `Set-Cookie` header value.
    pub fn to_header_value(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        if let Some(path) = &self.path {
            out.push_str("; Path=");
            out.push_str(path);
        }
        if let Some(domain) = &self.domain {
            out.push_str("; Domain=");
            out.push_str(domain);
        }
        if let Some(max_age) = self.max_age {
            out.push_str(&format!("; Max-Age={max_age}"));
        }
        if let Some(same_site) = &self.same_site {
            out.push_str("; SameSite=");
            out.push_str(same_site);
        }
        if self.secure {
            out.push_str("; Secure");
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        out
    }
}

// ============================================================================
// HTTP Response
// ============================================================================

/// A single reply to an HTTP request envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    status: StatusCode,
    content_type: Option<String>,
    charset: Option<String>,
    headers: Vec<(String, String)>,
    cookies: Vec<Cookie>,
    body: ResponseBody,
    redirect: Option<String>,
    keep_open: bool,
}

impl HttpResponse {
    pub fn new(status: StatusCode, body: impl Into<ResponseBody>) -> Self {
        Self {
            status,
            content_type: None,
            charset: None,
            headers: Vec::new(),
            cookies: Vec::new(),
            body: body.into(),
            redirect: None,
            keep_open: false,
        }
    }

    /// `200 OK` with the given body.
    pub fn ok(body: impl Into<ResponseBody>) -> Self {
        Self::new(StatusCode::OK, body)
    }

    /// An error status with a plain-text message body.
    pub fn error(status: StatusCode, message: impl Into<String>) -> Self {
        Self::new(status, message.into()).with_content_type("text/plain")
    }

    /// `302 Found` pointing at `location`, which is sent as given.
    pub fn redirect(location: impl Into<String>) -> Self {
        let mut response = Self::new(StatusCode::FOUND, ResponseBody::Empty);
        response.redirect = Some(location.into());
        response
    }

    /// Turn this request into a Server-Sent Events stream.
    ///
    /// The gateway keeps the connection open and follows up with a
    /// `StreamOpened` envelope carrying the stream's sink.
    pub fn start_sse() -> Self {
        let mut response =
            Self::new(StatusCode::OK, ResponseBody::Empty).with_content_type(crate::sse::CONTENT_TYPE);
        response.keep_open = true;
        response
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = Some(charset.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_cookie(mut self, cookie: Cookie) -> Self {
        self.cookies.push(cookie);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Full `Content-Type` value including the charset parameter, if any.
    pub fn content_type(&self) -> Option<String> {
        let content_type = self.content_type.as_deref()?;
        Some(match &self.charset {
            Some(charset) => format!("{content_type}; charset={charset}"),
            None => content_type.to_string(),
        })
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    pub fn into_body(self) -> ResponseBody {
        self.body
    }

    pub fn redirect_location(&self) -> Option<&str> {
        self.redirect.as_deref()
    }

    /// Whether the reply opens a stream instead of completing the exchange.
    pub fn keeps_open(&self) -> bool {
        self.keep_open
    }
}
