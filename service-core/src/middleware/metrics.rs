use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};
use once_cell::sync::Lazy;
use prometheus::{HistogramVec, IntCounterVec, histogram_opts, opts};
use std::time::Instant;

static HTTP_REQUESTS_TOTAL: Lazy<Option<IntCounterVec>> = Lazy::new(|| {
    prometheus::register_int_counter_vec!(
        opts!("http_requests_total", "HTTP requests by route and status"),
        &["method", "path", "status"]
    )
    .map_err(|e| tracing::warn!(error = %e, "http_requests_total not registered"))
    .ok()
});

static HTTP_REQUEST_DURATION: Lazy<Option<HistogramVec>> = Lazy::new(|| {
    prometheus::register_histogram_vec!(
        histogram_opts!(
            "http_request_duration_seconds",
            "HTTP request latency by route",
            vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
        ),
        &["method", "path", "status"]
    )
    .map_err(|e| tracing::warn!(error = %e, "http_request_duration_seconds not registered"))
    .ok()
});

/// Records request counts and latency into the default Prometheus registry.
///
/// Paths are labelled with the matched route template, so ids in the URL do
/// not create new series. Unmatched requests share one label.
pub async fn metrics_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(req).await;

    let status = response.status().as_u16().to_string();
    let labels = [method.as_str(), path.as_str(), status.as_str()];

    if let Some(counter) = HTTP_REQUESTS_TOTAL.as_ref() {
        counter.with_label_values(&labels).inc();
    }
    if let Some(histogram) = HTTP_REQUEST_DURATION.as_ref() {
        histogram
            .with_label_values(&labels)
            .observe(start.elapsed().as_secs_f64());
    }

    response
}
