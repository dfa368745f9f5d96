//! Service layer for the connector.
//!
//! # Components
//!
//! - `jazz_client` - Single-attempt HTTP transport for the external meeting platform
//! - `resilience` - Retry, backoff and breaker gating around the transport
//! - `circuit_breaker` - Shared per-connector circuit breaker
//! - `operation_lock` - Per-meeting mutual exclusion across instances
//! - `session_manager` - Connector session state machine

pub mod circuit_breaker;
pub mod jazz_client;
pub mod operation_lock;
pub mod resilience;
pub mod session_manager;

pub use circuit_breaker::{BreakerPolicy, CircuitBreaker};
pub use jazz_client::{HttpJazzTransport, JazzTransport};
pub use operation_lock::OperationLock;
pub use resilience::{ResilientJazzClient, RetryPolicy};
pub use session_manager::SessionManager;
