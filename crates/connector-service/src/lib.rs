//! Meeting connector service library.
//!
//! Keeps an external meeting-platform integration alive for the live
//! transcription pipeline:
//!
//! - Join, reconnect and leave meetings on the external platform
//! - Serialize operations per meeting across instances (operation lock)
//! - Stop calling a failing provider (circuit breaker)
//! - Repair stale and failed sessions in the background (reconciliation)
//!
//! # Architecture
//!
//! ```text
//! routes/mod.rs -> handlers/*.rs -> services/*.rs -> store (repositories/, redis/)
//!                                   tasks/reconciliation.rs -> services/*.rs
//! ```
//!
//! # Modules
//!
//! - `config` - Service configuration from environment
//! - `errors` - Error types with HTTP status code mapping
//! - `handlers` - HTTP request handlers
//! - `middleware` - HTTP metrics middleware
//! - `models` - Sessions, breaker snapshots, run summaries, API bodies
//! - `observability` - Prometheus metrics
//! - `redis` - Redis-backed lock and breaker store
//! - `repositories` - Postgres-backed session store
//! - `routes` - Axum router setup
//! - `services` - Breaker, lock, external client, session state machine
//! - `store` - Storage traits (and in-memory implementations for tests)
//! - `tasks` - Background reconciliation worker

pub mod config;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod observability;
pub mod redis;
pub mod repositories;
pub mod routes;
pub mod services;
pub mod store;
pub mod tasks;
