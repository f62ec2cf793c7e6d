//! HTTP request handlers.

mod gateway;
mod health;
pub(crate) mod problem_details;

pub use gateway::dispatch;
pub use health::{livez, readyz};
