//! Wiremock-backed fake of the external meeting API.
//!
//! Use with [`crate::TestConnectorServer::spawn_with`] and
//! [`MockJazzApi::transport`] to exercise the real HTTP transport end to end.

use common::secret::SecretString;
use connector_service::services::{HttpJazzTransport, JazzTransport};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Bearer token the fake API expects.
pub const TEST_API_TOKEN: &str = "test-jazz-token";

/// Per-attempt timeout of transports built by [`MockJazzApi::transport`].
pub const TEST_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Fake external meeting API.
pub struct MockJazzApi {
    server: MockServer,
}

impl MockJazzApi {
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    pub fn uri(&self) -> String {
        self.server.uri()
    }

    /// Real HTTP transport pointed at this server.
    pub fn transport(&self) -> Arc<dyn JazzTransport> {
        let transport = HttpJazzTransport::new(
            &self.server.uri(),
            Some(SecretString::from(TEST_API_TOKEN)),
            TEST_REQUEST_TIMEOUT,
        )
        .expect("mock API transport should build");
        Arc::new(transport)
    }

    /// Join for `meeting_id` succeeds with `session_id`.
    pub async fn mount_join_success(&self, meeting_id: &str, session_id: &str) {
        Mock::given(method("POST"))
            .and(path(format!("/api/v1/meetings/{meeting_id}/join")))
            .and(header("authorization", format!("Bearer {TEST_API_TOKEN}").as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "session_id": session_id,
                "language": "ru",
                "participants": [],
            })))
            .mount(&self.server)
            .await;
    }

    /// Reconnect for `meeting_id` succeeds with an empty body.
    pub async fn mount_reconnect_success(&self, meeting_id: &str) {
        Mock::given(method("POST"))
            .and(path(format!("/api/v1/meetings/{meeting_id}/reconnect")))
            .respond_with(ResponseTemplate::new(200))
            .mount(&self.server)
            .await;
    }

    /// Leave for `meeting_id` succeeds.
    pub async fn mount_leave_success(&self, meeting_id: &str) {
        Mock::given(method("POST"))
            .and(path(format!("/api/v1/meetings/{meeting_id}/leave")))
            .respond_with(ResponseTemplate::new(204))
            .mount(&self.server)
            .await;
    }

    /// Every `operation` call (join, reconnect, leave) for any meeting answers
    /// with `status`.
    pub async fn mount_operation_status(&self, operation: &str, status: u16) {
        Mock::given(method("POST"))
            .and(path_regex(format!(r"^/api/v1/meetings/[^/]+/{operation}$")))
            .respond_with(ResponseTemplate::new(status).set_body_string("upstream says no"))
            .mount(&self.server)
            .await;
    }

    /// Every `operation` call for any meeting takes `delay` before answering.
    pub async fn mount_operation_delay(&self, operation: &str, delay: Duration) {
        Mock::given(method("POST"))
            .and(path_regex(format!(r"^/api/v1/meetings/[^/]+/{operation}$")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "session_id": "slow-session" }))
                    .set_delay(delay),
            )
            .mount(&self.server)
            .await;
    }

    /// Health probe answers with `status`.
    pub async fn mount_health(&self, status: u16) {
        Mock::given(method("GET"))
            .and(path("/api/v1/health"))
            .respond_with(ResponseTemplate::new(status).set_body_json(json!({ "ok": status < 400 })))
            .mount(&self.server)
            .await;
    }

    /// Number of requests received whose path ends with `suffix`.
    pub async fn received_count(&self, suffix: &str) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path().ends_with(suffix))
            .count()
    }
}
