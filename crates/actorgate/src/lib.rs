//! Actorgate - a session-bound actor gateway.
//!
//! HTTP requests, WebSocket connections and Server-Sent Event streams are
//! routed to long-lived, per-session actors. The transport-agnostic core lives
//! in [`gateway`]; [`server`] and [`handlers`] bind it to axum.

// Core Infrastructure
pub mod config;

// Actor Runtime
pub mod actor;
pub mod envelope;
pub mod headers;
pub mod response;
pub mod sink;
pub mod sse;

// Sessions & Routing
pub mod context;
pub mod patterns;
pub mod registry;

// Gateway
pub mod gateway;

// Server & HTTP
pub mod handlers;
pub mod server;

// Sample Application
pub mod demo;
