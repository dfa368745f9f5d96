//! SberJazz meeting-platform HTTP client.
//!
//! [`JazzTransport`] performs exactly one HTTP attempt and classifies the
//! outcome. Retries, backoff and the circuit breaker live one layer up in
//! [`crate::services::resilience`].
//!
//! # Security
//!
//! - The bearer token is held as a `SecretString` and never logged
//! - Every attempt carries an explicit timeout
//! - Response bodies are read up to a fixed cap; error bodies are truncated
//!   before they reach logs or API responses

use crate::errors::{ConnectorError, ExternalErrorKind};
use async_trait::async_trait;
use common::secret::{ExposeSecret, SecretString};
use common::types::MeetingId;
use reqwest::{Client, Method};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, error};

/// Connect timeout for the external API, independent of the request timeout.
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Maximum number of characters of an error body kept in error details.
pub const MAX_ERROR_BODY_CHARS: usize = 300;

/// Largest 2xx body accepted from the external API.
pub const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

/// Bytes of an error body read before the rest is dropped (4 per char at most).
const MAX_ERROR_BODY_BYTES: usize = MAX_ERROR_BODY_CHARS * 4;

/// Language assumed when the join response does not name one.
pub const DEFAULT_LANGUAGE: &str = "ru";

/// External API operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JazzOperation {
    Join,
    Reconnect,
    Leave,
    Health,
}

impl JazzOperation {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            JazzOperation::Join => "join",
            JazzOperation::Reconnect => "reconnect",
            JazzOperation::Leave => "leave",
            JazzOperation::Health => "health",
        }
    }

    pub fn method(&self) -> Method {
        match self {
            JazzOperation::Health => Method::GET,
            JazzOperation::Join | JazzOperation::Reconnect | JazzOperation::Leave => Method::POST,
        }
    }
}

/// A single request to the external API.
#[derive(Debug, Clone, PartialEq)]
pub struct JazzRequest {
    pub operation: JazzOperation,
    /// Path relative to the API base, e.g. `/api/v1/meetings/m-1/join`.
    pub path: String,
    pub meeting_id: Option<MeetingId>,
    pub body: Option<Value>,
}

impl JazzRequest {
    fn for_meeting(operation: JazzOperation, meeting_id: &MeetingId, body: Option<Value>) -> Self {
        Self {
            operation,
            path: format!("/api/v1/meetings/{}/{}", meeting_id, operation.as_str()),
            meeting_id: Some(meeting_id.clone()),
            body,
        }
    }

    pub fn join(meeting_id: &MeetingId) -> Self {
        Self::for_meeting(JazzOperation::Join, meeting_id, None)
    }

    pub fn reconnect(meeting_id: &MeetingId, external_session_id: &str) -> Self {
        Self::for_meeting(
            JazzOperation::Reconnect,
            meeting_id,
            Some(json!({ "session_id": external_session_id })),
        )
    }

    pub fn leave(meeting_id: &MeetingId, external_session_id: Option<&str>) -> Self {
        let body = external_session_id.map(|id| json!({ "session_id": id }));
        Self::for_meeting(JazzOperation::Leave, meeting_id, body)
    }

    pub fn health() -> Self {
        Self {
            operation: JazzOperation::Health,
            path: "/api/v1/health".to_string(),
            meeting_id: None,
            body: None,
        }
    }
}

/// Failure of a single HTTP attempt, before retry classification.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptError {
    /// No API base URL configured.
    NotConfigured,
    /// Request never produced a response.
    Transport {
        kind: ExternalErrorKind,
        detail: String,
    },
    /// Non-2xx response. `body` is already truncated.
    Status { status: u16, body: String },
    /// 2xx response whose body is not valid JSON.
    InvalidBody { status: u16, detail: String },
}

impl AttemptError {
    /// The kind reported to callers if this attempt is the final one.
    pub fn kind(&self) -> ExternalErrorKind {
        match self {
            AttemptError::NotConfigured => ExternalErrorKind::NotConfigured,
            AttemptError::Transport { kind, .. } => *kind,
            AttemptError::Status { status, .. } => ExternalErrorKind::from_status(*status),
            AttemptError::InvalidBody { .. } => ExternalErrorKind::InvalidResponse,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            AttemptError::Status { status, .. } | AttemptError::InvalidBody { status, .. } => {
                Some(*status)
            }
            AttemptError::NotConfigured | AttemptError::Transport { .. } => None,
        }
    }

    pub fn into_connector_error(self) -> ConnectorError {
        let kind = self.kind();
        let status = self.status();
        let detail = match self {
            AttemptError::NotConfigured => "external API base URL is not configured".to_string(),
            AttemptError::Transport { detail, .. } | AttemptError::InvalidBody { detail, .. } => {
                detail
            }
            AttemptError::Status { status, body } if body.is_empty() => format!("HTTP {status}"),
            AttemptError::Status { status, body } => format!("HTTP {status}: {body}"),
        };
        ConnectorError::external(kind, status, detail)
    }
}

/// One HTTP attempt against the external API.
#[async_trait]
pub trait JazzTransport: Send + Sync {
    /// Send `request` once. Successful responses are JSON objects (`{}` when
    /// the body is empty or not an object).
    async fn send(&self, request: &JazzRequest) -> Result<Value, AttemptError>;
}

/// `reqwest`-backed transport.
#[derive(Clone)]
pub struct HttpJazzTransport {
    client: Client,
    base_url: String,
    api_token: Option<SecretString>,
}

impl HttpJazzTransport {
    /// Create a new transport.
    ///
    /// # Arguments
    ///
    /// * `base_url` - External API base URL without trailing slash; empty means not configured
    /// * `api_token` - Optional bearer token
    /// * `timeout` - Per-attempt request timeout
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::Internal` if the HTTP client cannot be built.
    pub fn new(
        base_url: &str,
        api_token: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, ConnectorError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS).min(timeout))
            .build()
            .map_err(|e| {
                error!(target: "connector.jazz_client", error = %e, "Failed to build HTTP client");
                ConnectorError::Internal(format!("Failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
        })
    }
}

#[async_trait]
impl JazzTransport for HttpJazzTransport {
    async fn send(&self, request: &JazzRequest) -> Result<Value, AttemptError> {
        if self.base_url.is_empty() {
            return Err(AttemptError::NotConfigured);
        }

        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self.client.request(request.operation.method(), &url);
        if let Some(token) = &self.api_token {
            builder = builder.bearer_auth(token.expose_secret());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(classify_transport_error)?;
        let status = response.status().as_u16();
        let body = read_capped(response, status).await?;

        debug!(
            target: "connector.jazz_client",
            operation = request.operation.as_str(),
            status = status,
            "External API responded"
        );

        parse_response(status, &body)
    }
}

/// Read the response body without buffering more than the cap allows.
///
/// A 2xx body over [`MAX_RESPONSE_BYTES`] is rejected as invalid. An error
/// body is cut at [`MAX_ERROR_BODY_BYTES`] since only its head is kept.
async fn read_capped(mut response: reqwest::Response, status: u16) -> Result<Vec<u8>, AttemptError> {
    let success = (200..300).contains(&status);
    let limit = if success {
        MAX_RESPONSE_BYTES
    } else {
        MAX_ERROR_BODY_BYTES
    };
    let too_large = || AttemptError::InvalidBody {
        status,
        detail: format!("response body exceeds {MAX_RESPONSE_BYTES} bytes"),
    };

    if success
        && response
            .content_length()
            .is_some_and(|len| len > u64::try_from(limit).unwrap_or(u64::MAX))
    {
        return Err(too_large());
    }

    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(classify_transport_error)? {
        let room = limit.saturating_sub(body.len());
        if chunk.len() > room {
            if success {
                return Err(too_large());
            }
            body.extend_from_slice(chunk.get(..room).unwrap_or_default());
            break;
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

fn classify_transport_error(e: reqwest::Error) -> AttemptError {
    let kind = if e.is_timeout() {
        ExternalErrorKind::Timeout
    } else if e.is_connect() {
        ExternalErrorKind::Unavailable
    } else {
        ExternalErrorKind::Provider
    };
    AttemptError::Transport {
        kind,
        detail: e.without_url().to_string(),
    }
}

/// Classify a received response.
///
/// # Errors
///
/// - `AttemptError::Status` for any non-2xx status
/// - `AttemptError::InvalidBody` for a 2xx body that is not JSON
pub fn parse_response(status: u16, body: &[u8]) -> Result<Value, AttemptError> {
    if !(200..300).contains(&status) {
        return Err(AttemptError::Status {
            status,
            body: truncate_body(&String::from_utf8_lossy(body)),
        });
    }

    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Map::new()));
    }

    match serde_json::from_slice::<Value>(body) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Ok(Value::Object(Map::new())),
        Err(e) => Err(AttemptError::InvalidBody {
            status,
            detail: format!("response body is not valid JSON: {e}"),
        }),
    }
}

/// Keep at most [`MAX_ERROR_BODY_CHARS`] characters of an error body.
pub fn truncate_body(text: &str) -> String {
    text.chars().take(MAX_ERROR_BODY_CHARS).collect()
}

/// Parsed join/reconnect response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinResult {
    /// External session id; the meeting id when the API does not return one.
    pub external_session_id: String,
    pub language: String,
    pub participants: Option<Vec<Value>>,
}

impl JoinResult {
    pub fn from_response(meeting_id: &MeetingId, data: &Value) -> Self {
        let external_session_id = data
            .get("session_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map_or_else(|| meeting_id.to_string(), str::to_string);

        let language = data
            .get("language")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_LANGUAGE)
            .to_string();

        let participants = data.get("participants").and_then(Value::as_array).cloned();

        Self {
            external_session_id,
            language,
            participants,
        }
    }
}

/// Scripted transport for tests.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, PoisonError};

    /// Reply to a single scripted request.
    #[derive(Debug, Clone)]
    pub enum MockReply {
        /// 2xx; join/reconnect return `{"session_id": "jazz-{meeting_id}"}`.
        Healthy,
        /// 2xx with this body.
        Json(Value),
        /// Non-2xx with an empty body.
        Status(u16),
        Timeout,
        Unreachable,
        /// 2xx with a body that is not JSON.
        InvalidBody,
    }

    /// Transport returning scripted replies, then a default reply.
    pub struct MockJazzTransport {
        replies: Mutex<VecDeque<MockReply>>,
        default_reply: MockReply,
        delay: Option<Duration>,
        call_count: AtomicUsize,
        calls: Mutex<Vec<JazzRequest>>,
        in_flight: Mutex<HashMap<String, usize>>,
        max_in_flight: AtomicUsize,
    }

    impl MockJazzTransport {
        fn build(replies: Vec<MockReply>, default_reply: MockReply) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                default_reply,
                delay: None,
                call_count: AtomicUsize::new(0),
                calls: Mutex::new(Vec::new()),
                in_flight: Mutex::new(HashMap::new()),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        /// Every request succeeds.
        pub fn healthy() -> Self {
            Self::build(Vec::new(), MockReply::Healthy)
        }

        /// Every request answers with `status`.
        pub fn failing_with_status(status: u16) -> Self {
            Self::build(Vec::new(), MockReply::Status(status))
        }

        /// Every request fails to connect.
        pub fn unreachable() -> Self {
            Self::build(Vec::new(), MockReply::Unreachable)
        }

        /// Scripted replies in order, then healthy.
        pub fn with_replies(replies: Vec<MockReply>) -> Self {
            Self::build(replies, MockReply::Healthy)
        }

        /// Hold every request for `delay` before replying.
        #[must_use]
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        /// Total number of requests sent.
        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }

        /// Number of requests sent for `operation`.
        pub fn calls_for(&self, operation: JazzOperation) -> usize {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .filter(|r| r.operation == operation)
                .count()
        }

        /// All requests sent so far.
        pub fn requests(&self) -> Vec<JazzRequest> {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Highest number of concurrent requests observed for a single meeting.
        pub fn max_in_flight_per_meeting(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }

        fn next_reply(&self) -> MockReply {
            self.replies
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
                .unwrap_or_else(|| self.default_reply.clone())
        }

        fn enter(&self, key: &str) {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            let count = in_flight.entry(key.to_string()).or_insert(0);
            *count += 1;
            self.max_in_flight.fetch_max(*count, Ordering::SeqCst);
        }

        fn exit(&self, key: &str) {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(count) = in_flight.get_mut(key) {
                *count = count.saturating_sub(1);
            }
        }
    }

    #[async_trait]
    impl JazzTransport for MockJazzTransport {
        async fn send(&self, request: &JazzRequest) -> Result<Value, AttemptError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(request.clone());
            let reply = self.next_reply();

            let key = request
                .meeting_id
                .as_ref()
                .map_or_else(String::new, ToString::to_string);
            self.enter(&key);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.exit(&key);

            match reply {
                MockReply::Healthy => Ok(match (&request.meeting_id, request.operation) {
                    (Some(id), JazzOperation::Join | JazzOperation::Reconnect) => {
                        json!({ "session_id": format!("jazz-{id}") })
                    }
                    _ => Value::Object(Map::new()),
                }),
                MockReply::Json(body) => Ok(body),
                MockReply::Status(status) => Err(AttemptError::Status {
                    status,
                    body: String::new(),
                }),
                MockReply::Timeout => Err(AttemptError::Transport {
                    kind: ExternalErrorKind::Timeout,
                    detail: "operation timed out".to_string(),
                }),
                MockReply::Unreachable => Err(AttemptError::Transport {
                    kind: ExternalErrorKind::Unavailable,
                    detail: "connection refused".to_string(),
                }),
                MockReply::InvalidBody => parse_response(200, b"<html>"),
            }
        }
    }

    #[cfg(test)]
    #[allow(clippy::unwrap_used, clippy::expect_used)]
    mod tests {
        use super::*;

        fn meeting() -> MeetingId {
            MeetingId::parse("m-1").unwrap()
        }

        #[tokio::test]
        async fn test_mock_scripted_then_default() {
            let mock = MockJazzTransport::with_replies(vec![MockReply::Status(503)]);

            let first = mock.send(&JazzRequest::join(&meeting())).await;
            assert!(matches!(first, Err(AttemptError::Status { status: 503, .. })));

            let second = mock.send(&JazzRequest::join(&meeting())).await.unwrap();
            assert_eq!(second["session_id"], "jazz-m-1");
            assert_eq!(mock.call_count(), 2);
            assert_eq!(mock.calls_for(JazzOperation::Join), 2);
        }

        #[tokio::test]
        async fn test_mock_unreachable_is_unavailable() {
            let mock = MockJazzTransport::unreachable();
            let err = mock.send(&JazzRequest::health()).await.unwrap_err();
            assert_eq!(err.kind(), ExternalErrorKind::Unavailable);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn meeting() -> MeetingId {
        MeetingId::parse("m-1").unwrap()
    }

    fn transport(base: &str) -> HttpJazzTransport {
        HttpJazzTransport::new(
            base,
            Some(SecretString::from("jazz-token")),
            Duration::from_secs(2),
        )
        .unwrap()
    }

    #[test]
    fn test_request_paths() {
        assert_eq!(JazzRequest::join(&meeting()).path, "/api/v1/meetings/m-1/join");
        assert_eq!(
            JazzRequest::reconnect(&meeting(), "ext").path,
            "/api/v1/meetings/m-1/reconnect"
        );
        assert_eq!(JazzRequest::leave(&meeting(), None).path, "/api/v1/meetings/m-1/leave");
        assert_eq!(JazzRequest::health().path, "/api/v1/health");
        assert_eq!(JazzOperation::Health.method(), Method::GET);
        assert_eq!(JazzOperation::Leave.method(), Method::POST);
    }

    #[test]
    fn test_parse_empty_success_body() {
        assert_eq!(parse_response(200, b"").unwrap(), json!({}));
        assert_eq!(parse_response(204, b"  \n").unwrap(), json!({}));
    }

    #[test]
    fn test_parse_non_object_success_body() {
        assert_eq!(parse_response(200, b"[1,2,3]").unwrap(), json!({}));
    }

    #[test]
    fn test_parse_invalid_json_success_body() {
        let err = parse_response(200, b"not json").unwrap_err();
        assert_eq!(err.kind(), ExternalErrorKind::InvalidResponse);
        assert_eq!(err.status(), Some(200));
    }

    #[test]
    fn test_parse_error_status_truncates_body() {
        let long = "x".repeat(1000);
        let err = parse_response(503, long.as_bytes()).unwrap_err();
        match &err {
            AttemptError::Status { status, body } => {
                assert_eq!(*status, 503);
                assert_eq!(body.chars().count(), MAX_ERROR_BODY_CHARS);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(err.kind(), ExternalErrorKind::Unavailable);
    }

    #[test]
    fn test_attempt_error_into_connector_error() {
        let err = AttemptError::Status {
            status: 401,
            body: "denied".to_string(),
        }
        .into_connector_error();
        match err {
            ConnectorError::ExternalApi {
                kind,
                status,
                detail,
            } => {
                assert_eq!(kind, ExternalErrorKind::Auth);
                assert_eq!(status, Some(401));
                assert_eq!(detail, "HTTP 401: denied");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_join_result_defaults() {
        let result = JoinResult::from_response(&meeting(), &json!({}));
        assert_eq!(result.external_session_id, "m-1");
        assert_eq!(result.language, DEFAULT_LANGUAGE);
        assert!(result.participants.is_none());
    }

    #[test]
    fn test_join_result_from_full_response() {
        let result = JoinResult::from_response(
            &meeting(),
            &json!({"session_id": "s-9", "language": "en", "participants": [{"name": "a"}]}),
        );
        assert_eq!(result.external_session_id, "s-9");
        assert_eq!(result.language, "en");
        assert_eq!(result.participants.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_http_transport_sends_bearer_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/meetings/m-1/reconnect"))
            .and(header("authorization", "Bearer jazz-token"))
            .and(body_json(json!({"session_id": "ext-1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"session_id": "ext-2"})))
            .expect(1)
            .mount(&server)
            .await;

        let value = transport(&server.uri())
            .send(&JazzRequest::reconnect(&meeting(), "ext-1"))
            .await
            .unwrap();
        assert_eq!(value["session_id"], "ext-2");
    }

    #[tokio::test]
    async fn test_http_transport_maps_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/health"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let err = transport(&server.uri())
            .send(&JazzRequest::health())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AttemptError::Status {
                status: 429,
                body: "slow down".to_string()
            }
        );
        assert_eq!(err.kind(), ExternalErrorKind::RateLimited);
    }

    #[tokio::test]
    async fn test_http_transport_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let transport =
            HttpJazzTransport::new(&server.uri(), None, Duration::from_millis(200)).unwrap();
        let err = transport.send(&JazzRequest::join(&meeting())).await.unwrap_err();
        assert_eq!(err.kind(), ExternalErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_http_transport_not_configured() {
        let transport = HttpJazzTransport::new("", None, Duration::from_secs(1)).unwrap();
        let err = transport.send(&JazzRequest::health()).await.unwrap_err();
        assert_eq!(err, AttemptError::NotConfigured);
    }

    #[tokio::test]
    async fn test_http_transport_caps_error_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("e".repeat(64 * 1024)))
            .mount(&server)
            .await;

        let err = transport(&server.uri())
            .send(&JazzRequest::join(&meeting()))
            .await
            .unwrap_err();

        assert!(matches!(
            &err,
            AttemptError::Status { status: 502, body } if body.chars().count() == MAX_ERROR_BODY_CHARS
        ));
    }

    #[tokio::test]
    async fn test_http_transport_rejects_oversized_success_body() {
        let server = MockServer::start().await;
        let oversized = format!("{{\"pad\":\"{}\"}}", "x".repeat(MAX_RESPONSE_BYTES));
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(oversized))
            .mount(&server)
            .await;

        let err = transport(&server.uri())
            .send(&JazzRequest::join(&meeting()))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ExternalErrorKind::InvalidResponse);
        assert_eq!(err.status(), Some(200));
    }
}
