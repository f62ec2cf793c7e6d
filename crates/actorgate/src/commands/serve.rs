//! HTTP server command implementation.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{info, warn};

use actorgate::config::Config;
use actorgate::context::DefaultContext;
use actorgate::demo::{self, Room};
use actorgate::gateway::Gateway;
use actorgate::registry::SessionRegistry;
use actorgate::server::{self, AppState};

/// How long shutdown waits for session actors to exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub async fn run(
    config_path: &str,
    host_override: Option<IpAddr>,
    port_override: Option<u16>,
) -> Result<()> {
    let mut config = Config::load(config_path)
        .await
        .with_context(|| format!("failed to load config from '{config_path}'"))?;

    // CLI overrides config
    if let Some(host) = host_override {
        config.server.host = host.to_string();
    }
    if let Some(port) = port_override {
        config.server.port = port;
    }
    config.validate()?;

    let registry = SessionRegistry::new();
    let context = DefaultContext::new(
        config.routes.patterns()?,
        registry.clone(),
        demo::factory(Arc::new(Room::new())),
    )
    .with_cookie_name(config.sessions.cookie_name.clone())
    .with_watch_policy(config.sessions.watch_policy)
    .with_mailbox_capacity(config.sessions.mailbox_capacity);
    let gateway = Gateway::new(Arc::new(context), config.gateway_config());

    // Spawn idle session expiry loop
    if config.sessions.idle_ttl_seconds > 0 {
        let expiry_registry = registry.clone();
        let ttl = Duration::from_secs(config.sessions.idle_ttl_seconds);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(expiry_interval(ttl));
            interval.tick().await; // skip immediate tick
            loop {
                interval.tick().await;
                expiry_registry.expire_idle(ttl);
            }
        });
        info!(
            idle_ttl_seconds = config.sessions.idle_ttl_seconds,
            "Idle session expiry enabled"
        );
    }

    let state = AppState {
        gateway,
        registry: registry.clone(),
    };
    let app = server::build_app(state, &config.server_limits());

    let ip: IpAddr = config.server.host.parse()?;
    let addr = SocketAddr::new(ip, config.server.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!(
        addr = %addr,
        watch_policy = ?config.sessions.watch_policy,
        http_routes = ?config.routes.http,
        websocket_routes = ?config.routes.websocket,
        "Starting server"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    registry.shutdown(SHUTDOWN_GRACE).await;

    info!("Server stopped");
    Ok(())
}

/// Sweep often enough that a session outlives its TTL by at most ~25%.
fn expiry_interval(ttl: Duration) -> Duration {
    (ttl / 4).clamp(Duration::from_secs(1), Duration::from_secs(60))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
