//! HTTP request handlers for the connector service.

pub mod connectors;
pub mod health;
pub mod metrics;

pub use connectors::{
    connector_health, get_circuit_breaker, heartbeat, join, leave, list_sessions, reconnect,
    reset_circuit_breaker, run_reconcile, status,
};
pub use health::health_check;
pub use metrics::metrics_handler;
