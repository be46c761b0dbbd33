//! Test helper module for usage-billing-service integration tests.
//!
//! Spawns the HTTP router on a random port over the in-memory store and
//! counters, with a manual clock and recording collaborators.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{Client, Response};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use service_core::error::AppError;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;
use tokio::net::TcpListener;
use usage_billing_service::models::Invoice;
use usage_billing_service::services::tenant::TenantClaims;
use usage_billing_service::services::{
    init_metrics, FlatRateTax, InMemoryCounterStore, InMemoryStore, IngestionSettings,
    LimitAlert, LimitAlertSink, ManualClock, PaymentCollector, RatePolicy, TenantResolver,
};
use usage_billing_service::startup::{router, AppState, Collaborators};
use uuid::Uuid;

pub const JWT_SECRET: &str = "integration-test-secret";

pub const ALL_SCOPES: &[&str] = &[
    "usage:write",
    "invoices:write",
    "invoices:read",
    "plans:write",
];

/// April 2026, the billing period most tests use.
pub fn period_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap()
}

pub fn period_end() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap()
}

pub fn default_settings() -> IngestionSettings {
    IngestionSettings {
        rate: RatePolicy {
            max_events: 1000,
            window: StdDuration::from_secs(60),
        },
        idempotency_ttl: StdDuration::from_secs(86_400),
        admission_timeout: StdDuration::from_secs(2),
        batch_concurrency: 8,
        max_batch_size: 100,
    }
}

#[derive(Default)]
pub struct RecordingPayments {
    pub opened: Mutex<Vec<Invoice>>,
}

#[async_trait]
impl PaymentCollector for RecordingPayments {
    async fn invoice_opened(&self, invoice: &Invoice) -> Result<(), AppError> {
        self.opened.lock().unwrap().push(invoice.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingAlerts {
    pub alerts: Mutex<Vec<LimitAlert>>,
}

#[async_trait]
impl LimitAlertSink for RecordingAlerts {
    async fn limit_alert(&self, alert: &LimitAlert) -> Result<(), AppError> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

/// Test application wrapper for integration tests.
pub struct TestApp {
    pub http_address: String,
    pub clock: Arc<ManualClock>,
    pub store: Arc<InMemoryStore>,
    pub counters: Arc<InMemoryCounterStore>,
    pub payments: Arc<RecordingPayments>,
    pub alerts: Arc<RecordingAlerts>,
    client: Client,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(default_settings(), Decimal::ZERO).await
    }

    /// Spawn with custom admission settings and a flat tax rate.
    pub async fn spawn_with(settings: IngestionSettings, tax_rate: Decimal) -> Self {
        init_metrics();

        // Mid-period, so events for April are accepted and not yet closed.
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 4, 15, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryStore::new(clock.clone()));
        let counters = Arc::new(InMemoryCounterStore::new());
        let payments = Arc::new(RecordingPayments::default());
        let alerts = Arc::new(RecordingAlerts::default());

        let state = AppState::from_parts(
            TenantResolver::new(JWT_SECRET, None),
            store.clone(),
            counters.clone(),
            Collaborators {
                payments: payments.clone(),
                alerts: alerts.clone(),
                tax: Arc::new(FlatRateTax::new(tax_rate)),
            },
            clock.clone(),
            settings,
            "USD".to_string(),
        );

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind random port");
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router(state))
                .await
                .expect("Test server failed");
        });

        Self {
            http_address: format!("http://127.0.0.1:{}", port),
            clock,
            store,
            counters,
            payments,
            alerts,
            client: Client::new(),
        }
    }

    /// Signed credential for `tenant_id`, valid for an hour of wall time.
    pub fn token(&self, tenant_id: Uuid, scopes: &[&str]) -> String {
        token_with(JWT_SECRET, tenant_id, scopes, 3600)
    }

    pub fn admin_token(&self, tenant_id: Uuid) -> String {
        self.token(tenant_id, ALL_SCOPES)
    }

    pub async fn post(&self, path: &str, token: &str, body: Value) -> Response {
        self.client
            .post(format!("{}{}", self.http_address, path))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn put(&self, path: &str, token: &str, body: Value) -> Response {
        self.client
            .put(format!("{}{}", self.http_address, path))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn get(&self, path: &str, token: &str) -> Response {
        self.client
            .get(format!("{}{}", self.http_address, path))
            .bearer_auth(token)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn get_anonymous(&self, path: &str) -> Response {
        self.client
            .get(format!("{}{}", self.http_address, path))
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn create_plan(&self, token: &str, name: &str, base_price: &str) -> Uuid {
        let response = self
            .post(
                "/v1/plans",
                token,
                json!({ "name": name, "base_price": base_price, "currency": "USD" }),
            )
            .await;
        assert_eq!(response.status().as_u16(), 201, "create_plan failed");
        id_field(&response.json::<Value>().await.unwrap(), "plan_id")
    }

    pub async fn publish_rule(&self, token: &str, plan_id: Uuid, metric: &str, model: Value) {
        self.publish_rule_with(token, plan_id, metric, model, None).await
    }

    pub async fn publish_rule_with(
        &self,
        token: &str,
        plan_id: Uuid,
        metric: &str,
        model: Value,
        overage_unit_price: Option<&str>,
    ) {
        let response = self
            .post(
                &format!("/v1/plans/{}/rules", plan_id),
                token,
                json!({
                    "metric_name": metric,
                    "unit": "unit",
                    "model": model,
                    "overage_unit_price": overage_unit_price,
                    "effective_from": period_start() - Duration::days(30),
                }),
            )
            .await;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        assert_eq!(status, 201, "publish_rule failed: {}", body);
    }

    pub async fn create_subscription(&self, token: &str, plan_id: Uuid) -> Uuid {
        let response = self
            .post(
                "/v1/subscriptions",
                token,
                json!({
                    "plan_id": plan_id,
                    "current_period_start": period_start(),
                    "current_period_end": period_end(),
                }),
            )
            .await;
        assert_eq!(response.status().as_u16(), 201, "create_subscription failed");
        id_field(&response.json::<Value>().await.unwrap(), "subscription_id")
    }

    /// Plan with no base fee, one rule for `metric`, and an active
    /// subscription on it for the April period.
    pub async fn metered_subscription(&self, token: &str, metric: &str, model: Value) -> Uuid {
        let plan_id = self.create_plan(token, "Metered", "0").await;
        self.publish_rule(token, plan_id, metric, model).await;
        self.create_subscription(token, plan_id).await
    }

    pub async fn ingest(
        &self,
        token: &str,
        metric: &str,
        quantity: &str,
        occurred_at: DateTime<Utc>,
        key: &str,
    ) -> Response {
        self.post(
            "/v1/events",
            token,
            json!({
                "metric_name": metric,
                "quantity": quantity,
                "occurred_at": occurred_at,
                "idempotency_key": key,
            }),
        )
        .await
    }

    pub async fn generate_invoice(&self, token: &str, subscription_id: Uuid) -> Response {
        self.post(
            &format!("/v1/subscriptions/{}/invoices", subscription_id),
            token,
            json!({ "period_start": period_start(), "period_end": period_end() }),
        )
        .await
    }
}

pub fn token_with(secret: &str, tenant_id: Uuid, scopes: &[&str], ttl_secs: i64) -> String {
    let now = Utc::now();
    let claims = TenantClaims {
        tenant_id,
        scopes: scopes.iter().map(|s| s.to_string()).collect(),
        iat: now.timestamp(),
        exp: (now + Duration::seconds(ttl_secs)).timestamp(),
        iss: None,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("Failed to sign test token")
}

pub fn id_field(body: &Value, field: &str) -> Uuid {
    Uuid::parse_str(body[field].as_str().expect("missing id field")).expect("invalid uuid")
}

/// Parse a decimal string field, e.g. an invoice amount.
pub fn decimal(value: &Value) -> Decimal {
    Decimal::from_str(value.as_str().expect("decimal fields are strings")).expect("bad decimal")
}

/// Line items of `kind` from an invoice body.
pub fn items_of<'a>(invoice: &'a Value, kind: &str) -> Vec<&'a Value> {
    invoice["line_items"]
        .as_array()
        .expect("line_items")
        .iter()
        .filter(|item| item["kind"] == kind)
        .collect()
}
