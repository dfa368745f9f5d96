//! Background tasks for the connector service.
//!
//! # Tasks
//!
//! - `reconciliation` - Detects stale sessions, repairs them in bounded batches
//!   and auto-resets an expired circuit breaker

pub mod reconciliation;

pub use reconciliation::{start_reconciliation, ReconciliationConfig, ReconciliationWorker};
