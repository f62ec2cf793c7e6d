#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::http::{HeaderMap, header};

use actorgate::config::Config;
use actorgate::context::{ActorFactory, DefaultContext};
use actorgate::demo::{self, Room};
use actorgate::gateway::Gateway;
use actorgate::registry::SessionRegistry;
use actorgate::server::{self, AppState};

/// Demo routes, with everything else left unrouted.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.routes.http = ["", "/die", "/notfound", "/redirect", "/ssechannel", "/ssepublish"]
        .into_iter()
        .map(String::from)
        .collect();
    config.routes.websocket = vec!["/ws".to_string()];
    config.server.reply_timeout_seconds = 5;
    config
}

pub fn app_with(config: &Config) -> (Router, SessionRegistry) {
    app_with_factory(config, demo::factory(Arc::new(Room::new())))
}

pub fn app_with_factory(config: &Config, factory: ActorFactory) -> (Router, SessionRegistry) {
    config.validate().unwrap();
    let registry = SessionRegistry::new();
    let context = DefaultContext::new(config.routes.patterns().unwrap(), registry.clone(), factory)
    .with_cookie_name(config.sessions.cookie_name.clone())
    .with_watch_policy(config.sessions.watch_policy)
    .with_mailbox_capacity(config.sessions.mailbox_capacity);

    let state = AppState {
        gateway: Gateway::new(Arc::new(context), config.gateway_config()),
        registry: registry.clone(),
    };
    (server::build_app(state, &config.server_limits()), registry)
}

pub fn test_app() -> Router {
    app_with(&test_config()).0
}

/// Serve the test app on an ephemeral local port.
pub async fn spawn_server() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = test_app();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// `name=value` pair of the session cookie set by a response, if any.
pub fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|v| v.starts_with("JSESSIONID="))
        .and_then(|v| v.split(';').next())
        .map(str::to_string)
}
