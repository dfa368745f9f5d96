//! HTTP metrics middleware for the admin surface.
//!
//! Records every response, including ones produced by the framework before a
//! handler runs (404 for unknown routes, 405, JSON rejections).

use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

use crate::observability::metrics::record_http_request;

/// Records method, normalized path, status code and duration.
///
/// Applied as the outermost layer so it also sees timeouts.
pub async fn http_metrics_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    let duration = start.elapsed();
    let status_code = response.status().as_u16();
    record_http_request(&method, &path, status_code, duration);

    response
}
