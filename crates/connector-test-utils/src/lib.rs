//! Test utilities for the meeting connector service.
//!
//! - [`server_harness`] - `TestConnectorServer`, the real router on a random
//!   port over in-memory stores
//! - [`mock_jazz`] - `MockJazzApi`, a wiremock fake of the external meeting API
//! - [`fixtures`] - pre-built sessions and breaker snapshots

pub mod fixtures;
pub mod mock_jazz;
pub mod server_harness;

pub use fixtures::*;
pub use mock_jazz::MockJazzApi;
pub use server_harness::TestConnectorServer;
