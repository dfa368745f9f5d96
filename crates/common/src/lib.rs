//! Common utilities and types shared across the meeting connector crates.

#![warn(clippy::pedantic)]

/// Module for common data types
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;
