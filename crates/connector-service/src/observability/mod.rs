//! Observability module for the connector service.
//!
//! Provides metrics definitions and instrumentation helpers.

pub mod metrics;
