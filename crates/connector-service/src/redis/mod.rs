//! Redis integration for operation locks and circuit breaker state.

pub mod client;
pub mod lua_scripts;

pub use client::ConnectorRedisClient;
