//! Request tracing middleware
//!
//! Every HTTP request gets a request ID (taken from `X-Request-ID` when the
//! caller sends one), a span, a completion log line and a count in the
//! process metrics. The ID is echoed in the response headers.

use crate::common::METRICS;
use axum::{
    body::Body,
    http::{HeaderValue, Request, Response},
    middleware::Next,
};
use std::time::Instant;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

pub fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}

pub async fn request_tracing_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let start = Instant::now();

    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(generate_request_id);

    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let span = tracing::info_span!(
        "http_request",
        request_id = %request_id,
        method = %method,
        path = %path,
    );

    METRICS.http_requests.inc();
    let mut response = next.run(request).instrument(span.clone()).await;

    let duration = start.elapsed();
    let status = response.status();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    let _guard = span.enter();
    if status.is_success() {
        info!(
            status = status.as_u16(),
            duration_ms = duration.as_millis() as u64,
            "request completed"
        );
    } else {
        METRICS.http_errors.inc();
        warn!(
            status = status.as_u16(),
            duration_ms = duration.as_millis() as u64,
            "request failed"
        );
    }

    response
}
