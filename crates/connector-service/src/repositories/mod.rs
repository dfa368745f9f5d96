//! Repository layer for the connector service.
//!
//! Durable storage of connector sessions in Postgres.

pub mod connector_sessions;

pub use connector_sessions::PgSessionStore;
