//! Prometheus metrics for the API server.

use std::time::Instant;

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::{Request, Response};
use axum::middleware::Next;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder.
/// Returns a handle that can be used to render metrics.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Metric names as constants for consistency.
pub mod names {
    // HTTP metrics
    pub const HTTP_REQUESTS_TOTAL: &str = "vpipe_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "vpipe_http_request_duration_seconds";
    pub const HTTP_REQUESTS_IN_FLIGHT: &str = "vpipe_http_requests_in_flight";

    // Progress streams
    pub const PROGRESS_STREAMS_TOTAL: &str = "vpipe_progress_streams_total";
    pub const PROGRESS_STREAMS_ACTIVE: &str = "vpipe_progress_streams_active";
    pub const PROGRESS_FRAMES_SENT: &str = "vpipe_progress_frames_sent_total";

    // Rate limiting metrics
    pub const RATE_LIMIT_HITS_TOTAL: &str = "vpipe_rate_limit_hits_total";
}

/// Record an HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", path.to_string()),
        ("status", status.to_string()),
    ];

    counter!(names::HTTP_REQUESTS_TOTAL, &labels).increment(1);
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, &labels).record(duration_secs);
}

/// A progress stream opened; `transport` is `ws` or `sse`.
pub fn progress_stream_opened(transport: &'static str) {
    counter!(names::PROGRESS_STREAMS_TOTAL, "transport" => transport).increment(1);
    gauge!(names::PROGRESS_STREAMS_ACTIVE, "transport" => transport).increment(1.0);
}

pub fn progress_stream_closed(transport: &'static str) {
    gauge!(names::PROGRESS_STREAMS_ACTIVE, "transport" => transport).decrement(1.0);
}

pub fn record_progress_frame(transport: &'static str) {
    counter!(names::PROGRESS_FRAMES_SENT, "transport" => transport).increment(1);
}

/// Record rate limit hit.
pub fn record_rate_limit_hit(endpoint: &str) {
    let labels = [("endpoint", endpoint.to_string())];
    counter!(names::RATE_LIMIT_HITS_TOTAL, &labels).increment(1);
}

/// Metrics middleware for HTTP requests.
///
/// Labels use the matched route template so job ids never become label values.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let start = Instant::now();

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).increment(1.0);

    let response = next.run(request).await;

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).decrement(1.0);

    let status = response.status().as_u16();
    let duration = start.elapsed().as_secs_f64();

    record_http_request(&method, &path, status, duration);

    response
}
