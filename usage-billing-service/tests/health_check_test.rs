//! Health check integration tests for usage-billing-service.

mod common;

use common::TestApp;

#[tokio::test]
async fn health_check_works() {
    let app = TestApp::spawn().await;

    let response = app.get_anonymous("/health").await;
    assert!(response.status().is_success());

    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "usage-billing-service");
    assert_eq!(body["store"], "memory");
    assert_eq!(body["counters"], "memory");
}

#[tokio::test]
async fn readiness_check_works() {
    let app = TestApp::spawn().await;

    let response = app.get_anonymous("/ready").await;
    assert!(response.status().is_success());
}

#[tokio::test]
async fn metrics_endpoint_works() {
    let app = TestApp::spawn().await;

    let response = app.get_anonymous("/metrics").await;
    assert!(response.status().is_success());

    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/plain"));
}

#[tokio::test]
async fn api_routes_require_a_credential() {
    let app = TestApp::spawn().await;

    let response = app.get_anonymous("/v1/invoices/00000000-0000-0000-0000-000000000000").await;
    assert_eq!(response.status().as_u16(), 401);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["category"], "unauthenticated");
}
