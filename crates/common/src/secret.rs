//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports the [`secrecy`] types used for the external meeting-platform
//! API token and any other credential that flows through configuration.
//!
//! `SecretString` implements `Debug` with redaction, so a config struct that
//! derives `Debug` never prints the token, and `expose_secret()` marks every
//! place the raw value is actually read (the `Authorization` header builder).
//!
//! # Example
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct ApiCredentials {
//!     base_url: String,
//!     token: SecretString,
//! }
//!
//! let creds = ApiCredentials {
//!     base_url: "https://jazz.example.com".to_string(),
//!     token: SecretString::from("jazz-token"),
//! };
//!
//! assert!(!format!("{creds:?}").contains("jazz-token"));
//! assert_eq!(creds.token.expose_secret(), "jazz-token");
//! ```

pub use secrecy::{ExposeSecret, SecretString};
