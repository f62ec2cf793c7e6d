use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use tokio::fs;

use serde::Deserialize;
use thiserror::Error;

use crate::context::{DEFAULT_COOKIE_NAME, DEFAULT_MAILBOX_CAPACITY, WatchPolicy};
use crate::gateway::GatewayConfig;
use crate::patterns::UrlPatterns;
use crate::server::ServerLimits;

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub routes: RoutesConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),

    #[error("environment variable '{0}' is not set")]
    MissingEnvVar(String),

    #[error("unclosed variable reference '${{' (missing '}}')")]
    UnclosedVarReference,

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        let expanded = expand_env_vars(&contents)?;
        Ok(serde_saphyr::from_str(&expanded)?)
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.server.reply_timeout_seconds == 0 {
            return invalid("server.reply_timeout_seconds must be greater than 0");
        }
        if self.server.request_timeout_seconds == 0 {
            return invalid("server.request_timeout_seconds must be greater than 0");
        }
        if self.server.mailbox_send_timeout_ms == 0 {
            return invalid("server.mailbox_send_timeout_ms must be greater than 0");
        }
        if self.server.max_connections == 0 {
            return invalid("server.max_connections must be greater than 0");
        }
        if self.server.max_body_bytes == 0 {
            return invalid("server.max_body_bytes must be greater than 0");
        }
        if self.sessions.mailbox_capacity == 0 {
            return invalid("sessions.mailbox_capacity must be greater than 0");
        }
        if self.sessions.stream_buffer == 0 {
            return invalid("sessions.stream_buffer must be greater than 0");
        }
        if !is_cookie_token(&self.sessions.cookie_name) {
            return invalid("sessions.cookie_name must be a non-empty cookie token");
        }
        self.routes.patterns()?;
        Ok(())
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        let keep_alive = self.server.keep_alive_interval_seconds;
        GatewayConfig {
            reply_timeout: Duration::from_secs(self.server.reply_timeout_seconds),
            mailbox_send_timeout: Duration::from_millis(self.server.mailbox_send_timeout_ms),
            stream_buffer: self.sessions.stream_buffer,
            keep_alive_interval: (keep_alive > 0).then(|| Duration::from_secs(keep_alive)),
        }
    }

    pub fn server_limits(&self) -> ServerLimits {
        ServerLimits {
            max_connections: self.server.max_connections,
            max_body_bytes: self.server.max_body_bytes,
            request_timeout: Duration::from_secs(self.server.request_timeout_seconds),
        }
    }
}

/// RFC 6265 cookie-name token.
fn is_cookie_token(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| {
            b.is_ascii_graphic()
                && !matches!(
                    b,
                    b'(' | b')' | b'<' | b'>' | b'@' | b',' | b';' | b':' | b'\\' | b'"'
                        | b'/' | b'[' | b']' | b'?' | b'=' | b'{' | b'}'
                )
        })
}

// ============================================================================
// Private Helpers (Serde Defaults)
// ============================================================================

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_reply_timeout() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    300
}

fn default_mailbox_send_timeout() -> u64 {
    1000
}

fn default_keep_alive_interval() -> u64 {
    15
}

fn default_max_connections() -> usize {
    1024
}

fn default_max_body_bytes() -> usize {
    2 * 1024 * 1024
}

fn default_cookie_name() -> String {
    DEFAULT_COOKIE_NAME.to_string()
}

fn default_mailbox_capacity() -> usize {
    DEFAULT_MAILBOX_CAPACITY
}

fn default_stream_buffer() -> usize {
    64
}

fn default_http_routes() -> Vec<String> {
    vec!["/*".to_string()]
}

fn default_websocket_routes() -> Vec<String> {
    vec!["/ws".to_string()]
}

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand environment variables in a string.
///
/// Supports the following syntax (shell-compatible):
/// - `${VAR}` - Required variable, errors if not set
/// - `${VAR:-default}` - Optional variable with default value
/// - `${VAR:-}` - Optional variable, empty string if not set
/// - `$$` - Escaped `$` (only needed before `{` to prevent expansion)
///
/// No nested expansion: `${VAR:-${DEFAULT}}` is not supported.
///
/// ```yaml
/// server:
///   host: ${HOST:-0.0.0.0}
///   port: ${PORT:-8080}
/// sessions:
///   cookie_name: ${SESSION_COOKIE}
/// ```
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }
        match chars.peek() {
            Some('$') => {
                chars.next();
                result.push('$');
            }
            Some('{') => {
                chars.next();
                result.push_str(&parse_var_reference(&mut chars)?);
            }
            _ => result.push('$'),
        }
    }

    Ok(result)
}

/// Parse `VAR}` or `VAR:-default}` after a `${`.
fn parse_var_reference(
    chars: &mut std::iter::Peekable<std::str::Chars>,
) -> Result<String, ConfigError> {
    let mut var_name = String::new();
    let mut default_value: Option<String> = None;
    let mut closed = false;

    while let Some(c) = chars.next() {
        match c {
            '}' => {
                closed = true;
                break;
            }
            ':' if default_value.is_none() && chars.peek() == Some(&'-') => {
                chars.next();
                default_value = Some(String::new());
            }
            _ => match default_value.as_mut() {
                Some(default) => default.push(c),
                None => var_name.push(c),
            },
        }
    }

    if !closed {
        return Err(ConfigError::UnclosedVarReference);
    }

    match std::env::var(&var_name) {
        Ok(value) => Ok(value),
        Err(_) => default_value.ok_or(ConfigError::MissingEnvVar(var_name)),
    }
}

// ============================================================================
// ServerConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bounded wait for an actor's reply to an HTTP request.
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout_seconds: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// Bounded wait for space in a full actor mailbox.
    #[serde(default = "default_mailbox_send_timeout")]
    pub mailbox_send_timeout_ms: u64,
    /// SSE keep-alive comment interval; 0 disables.
    #[serde(default = "default_keep_alive_interval")]
    pub keep_alive_interval_seconds: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            reply_timeout_seconds: default_reply_timeout(),
            request_timeout_seconds: default_request_timeout(),
            mailbox_send_timeout_ms: default_mailbox_send_timeout(),
            keep_alive_interval_seconds: default_keep_alive_interval(),
            max_connections: default_max_connections(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

// ============================================================================
// SessionsConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SessionsConfig {
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    #[serde(default)]
    pub watch_policy: WatchPolicy,
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
    /// Outbound frames buffered per WebSocket or SSE connection.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
    /// Stop sessions idle for this long; 0 keeps them until shutdown.
    #[serde(default)]
    pub idle_ttl_seconds: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_cookie_name(),
            watch_policy: WatchPolicy::default(),
            mailbox_capacity: default_mailbox_capacity(),
            stream_buffer: default_stream_buffer(),
            idle_ttl_seconds: 0,
        }
    }
}

// ============================================================================
// RoutesConfig
// ============================================================================

/// URL patterns routed to HTTP and WebSocket handling.
#[derive(Debug, Deserialize)]
pub struct RoutesConfig {
    #[serde(default = "default_http_routes")]
    pub http: Vec<String>,
    #[serde(default = "default_websocket_routes")]
    pub websocket: Vec<String>,
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            http: default_http_routes(),
            websocket: default_websocket_routes(),
        }
    }
}

impl RoutesConfig {
    pub fn patterns(&self) -> Result<UrlPatterns, ConfigError> {
        UrlPatterns::from_lists(&self.http, &self.websocket)
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}
