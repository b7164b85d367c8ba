//! Operator HTTP endpoints
//!
//! Serves liveness and the Prometheus metrics registry.

mod handlers;
mod server;

pub use server::run_server;
