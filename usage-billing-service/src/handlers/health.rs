use crate::services::get_metrics;
use crate::startup::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

/// Health check endpoint for Docker/K8s liveness checks.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "usage-billing-service",
                    "version": env!("CARGO_PKG_VERSION"),
                    "store": state.store.backend(),
                    "counters": state.counters.backend(),
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - billing store unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "usage-billing-service",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness checks. Admission needs both
/// the durable store and the counter store.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if let Err(e) = state.store.health_check().await {
        tracing::warn!(error = %e, "Readiness check failed - billing store");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    if let Err(e) = state.counters.health_check().await {
        tracing::warn!(error = %e, "Readiness check failed - counter store");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    tracing::debug!("Readiness check passed");
    StatusCode::OK
}

/// Metrics endpoint for Prometheus scraping.
pub async fn metrics_handler() -> impl IntoResponse {
    let metrics = get_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        metrics,
    )
}
