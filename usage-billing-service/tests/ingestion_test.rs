//! Usage event intake: idempotency, rate limiting and batch admission.

mod common;

use chrono::{Duration, TimeZone, Utc};
use common::{default_settings, decimal, TestApp};
use futures::future::join_all;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::time::Duration as StdDuration;
use usage_billing_service::services::RatePolicy;
use uuid::Uuid;

fn per_unit(price: &str) -> Value {
    json!({ "type": "per_unit", "unit_price": price })
}

#[tokio::test]
async fn resubmitted_key_returns_the_original_event() {
    let app = TestApp::spawn().await;
    let token = app.admin_token(Uuid::new_v4());
    app.metered_subscription(&token, "api_calls", per_unit("0.01"))
        .await;
    let at = Utc.with_ymd_and_hms(2026, 4, 3, 9, 0, 0).unwrap();

    let first = app.ingest(&token, "api_calls", "5", at, "req-1").await;
    assert_eq!(first.status().as_u16(), 201);
    assert!(first.headers().get("x-ratelimit-remaining").is_some());
    let first: Value = first.json().await.unwrap();
    assert_eq!(first["status"], "accepted");

    // Same key, different payload: the stored event wins.
    let second = app.ingest(&token, "api_calls", "9", at, "req-1").await;
    assert_eq!(second.status().as_u16(), 200);
    let second: Value = second.json().await.unwrap();
    assert_eq!(second["status"], "duplicate");
    assert_eq!(second["event_id"], first["event_id"]);
    assert_eq!(decimal(&second["event"]["quantity"]), dec!(5));

    assert_eq!(app.store.event_count(), 1);
}

#[tokio::test]
async fn concurrent_duplicates_store_one_event() {
    let app = TestApp::spawn().await;
    let token = app.admin_token(Uuid::new_v4());
    app.metered_subscription(&token, "api_calls", per_unit("0.01"))
        .await;
    let at = Utc.with_ymd_and_hms(2026, 4, 3, 9, 0, 0).unwrap();

    let responses = join_all(
        (0..10).map(|_| app.ingest(&token, "api_calls", "1", at, "same-key")),
    )
    .await;

    let mut created = 0;
    let mut event_ids = Vec::new();
    for response in responses {
        let status = response.status().as_u16();
        assert!(status == 201 || status == 200, "unexpected status {}", status);
        if status == 201 {
            created += 1;
        }
        let body: Value = response.json().await.unwrap();
        event_ids.push(body["event_id"].as_str().unwrap().to_string());
    }

    assert_eq!(created, 1);
    event_ids.dedup();
    assert_eq!(event_ids.len(), 1);
    assert_eq!(app.store.event_count(), 1);
}

#[tokio::test]
async fn rate_limit_admits_exactly_the_window_maximum() {
    let mut settings = default_settings();
    settings.rate = RatePolicy {
        max_events: 5,
        window: StdDuration::from_secs(60),
    };
    let app = TestApp::spawn_with(settings, Decimal::ZERO).await;
    let token = app.admin_token(Uuid::new_v4());
    app.metered_subscription(&token, "api_calls", per_unit("0.01"))
        .await;
    let at = Utc.with_ymd_and_hms(2026, 4, 3, 9, 0, 0).unwrap();

    let keys: Vec<String> = (0..12).map(|i| format!("k-{}", i)).collect();
    let responses = join_all(
        keys.iter().map(|key| app.ingest(&token, "api_calls", "1", at, key)),
    )
    .await;

    let mut accepted = 0;
    let mut limited = 0;
    for response in responses {
        match response.status().as_u16() {
            201 => accepted += 1,
            429 => {
                limited += 1;
                assert!(response.headers().get("retry-after").is_some());
                let body: Value = response.json().await.unwrap();
                assert_eq!(body["category"], "rate_limited");
                assert!(body["retry_after_ms"].as_u64().unwrap() > 0);
            }
            other => panic!("unexpected status {}", other),
        }
    }
    assert_eq!(accepted, 5);
    assert_eq!(limited, 7);
    assert_eq!(app.store.event_count(), 5);

    // Once the window slides past the first admissions, events flow again.
    app.clock.advance(Duration::seconds(61));
    let response = app.ingest(&token, "api_calls", "1", at, "after-window").await;
    assert_eq!(response.status().as_u16(), 201);
}

#[tokio::test]
async fn rejected_events_are_not_stored() {
    let app = TestApp::spawn().await;
    let token = app.admin_token(Uuid::new_v4());
    app.metered_subscription(&token, "api_calls", per_unit("0.01"))
        .await;
    let at = Utc.with_ymd_and_hms(2026, 4, 3, 9, 0, 0).unwrap();

    let negative = app.ingest(&token, "api_calls", "-1", at, "neg").await;
    assert_eq!(negative.status().as_u16(), 422);

    let unknown = app.ingest(&token, "storage_gb", "1", at, "unknown").await;
    assert_eq!(unknown.status().as_u16(), 422);
    let body: Value = unknown.json().await.unwrap();
    assert_eq!(body["category"], "validation");

    let blank_key = app.ingest(&token, "api_calls", "1", at, "").await;
    assert_eq!(blank_key.status().as_u16(), 422);

    assert_eq!(app.store.event_count(), 0);
}

#[tokio::test]
async fn batch_results_follow_input_order() {
    let app = TestApp::spawn().await;
    let token = app.admin_token(Uuid::new_v4());
    app.metered_subscription(&token, "api_calls", per_unit("0.01"))
        .await;
    let at = Utc.with_ymd_and_hms(2026, 4, 3, 9, 0, 0).unwrap();

    let first = app.ingest(&token, "api_calls", "1", at, "seen").await;
    assert_eq!(first.status().as_u16(), 201);

    let response = app
        .post(
            "/v1/events/batch",
            &token,
            json!({
                "events": [
                    { "metric_name": "api_calls", "quantity": "2", "occurred_at": at, "idempotency_key": "b-1" },
                    { "metric_name": "api_calls", "quantity": "-2", "occurred_at": at, "idempotency_key": "b-2" },
                    { "metric_name": "api_calls", "quantity": "1", "occurred_at": at, "idempotency_key": "seen" },
                    { "metric_name": "api_calls", "quantity": "3", "occurred_at": at, "idempotency_key": "" }
                ]
            }),
        )
        .await;
    assert_eq!(response.status().as_u16(), 200);

    let body: Value = response.json().await.unwrap();
    let statuses: Vec<&str> = body["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["status"].as_str().unwrap())
        .collect();
    assert_eq!(statuses, vec!["accepted", "rejected", "duplicate", "rejected"]);
    assert_eq!(body["accepted"], 1);
    assert_eq!(body["duplicates"], 1);
    assert_eq!(body["rejected"], 2);
    assert_eq!(app.store.event_count(), 2);
}

#[tokio::test]
async fn oversized_batch_is_rejected_whole() {
    let mut settings = default_settings();
    settings.max_batch_size = 2;
    let app = TestApp::spawn_with(settings, Decimal::ZERO).await;
    let token = app.admin_token(Uuid::new_v4());
    app.metered_subscription(&token, "api_calls", per_unit("0.01"))
        .await;
    let at = Utc.with_ymd_and_hms(2026, 4, 3, 9, 0, 0).unwrap();

    let events: Vec<Value> = (0..3)
        .map(|i| {
            json!({ "metric_name": "api_calls", "quantity": "1", "occurred_at": at, "idempotency_key": format!("o-{}", i) })
        })
        .collect();
    let response = app
        .post("/v1/events/batch", &token, json!({ "events": events }))
        .await;
    assert_eq!(response.status().as_u16(), 422);
    assert_eq!(app.store.event_count(), 0);
}

#[tokio::test]
async fn empty_batch_is_a_validation_error() {
    let app = TestApp::spawn().await;
    let token = app.admin_token(Uuid::new_v4());
    app.metered_subscription(&token, "api_calls", per_unit("0.01"))
        .await;

    let response = app
        .post("/v1/events/batch", &token, json!({ "events": [] }))
        .await;
    assert_eq!(response.status().as_u16(), 422);
    assert_eq!(app.store.event_count(), 0);
}
