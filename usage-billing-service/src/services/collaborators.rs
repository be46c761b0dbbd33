//! Outbound collaborators: payment collection, limit alerts and tax.

use crate::models::{Invoice, LimitDecision};
use crate::services::money::round_money;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use service_core::observability::inject_trace_context;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Consumer of invoices that reached `open`.
#[async_trait]
pub trait PaymentCollector: Send + Sync {
    async fn invoice_opened(&self, invoice: &Invoice) -> Result<(), AppError>;
}

/// A `Block` or `Notify` decision raised during admission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimitAlert {
    pub tenant_id: Uuid,
    pub subscription_id: Uuid,
    pub metric_name: String,
    pub decision: LimitDecision,
    #[serde(with = "rust_decimal::serde::str")]
    pub limit_value: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub current_usage: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub attempted_quantity: Decimal,
    pub idempotency_key: String,
    pub raised_at: DateTime<Utc>,
}

#[async_trait]
pub trait LimitAlertSink: Send + Sync {
    async fn limit_alert(&self, alert: &LimitAlert) -> Result<(), AppError>;
}

/// Opaque tax amount for an invoice's subtotal.
#[async_trait]
pub trait TaxCalculator: Send + Sync {
    async fn tax_for(
        &self,
        tenant_id: Uuid,
        subtotal: Decimal,
        currency: &str,
    ) -> Result<Decimal, AppError>;
}

/// Posts JSON payloads to a webhook, or logs them when no URL is configured.
#[derive(Clone)]
pub struct WebhookPublisher {
    client: reqwest::Client,
    url: Option<String>,
    target: &'static str,
}

impl WebhookPublisher {
    pub fn new(url: Option<String>, target: &'static str) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| {
                AppError::InternalError(anyhow::anyhow!("Failed to build HTTP client: {}", e))
            })?;
        Ok(Self {
            client,
            url: url.filter(|u| !u.trim().is_empty()),
            target,
        })
    }

    #[instrument(skip(self, payload), fields(webhook = self.target))]
    async fn publish<T: Serialize + Sync>(&self, kind: &str, payload: &T) -> Result<(), AppError> {
        let Some(url) = &self.url else {
            info!(
                kind = kind,
                payload = %serde_json::to_string(payload).unwrap_or_default(),
                "No webhook configured, event logged only"
            );
            return Ok(());
        };

        let mut headers = HeaderMap::new();
        inject_trace_context(&mut headers);

        let response = self
            .client
            .post(url)
            .headers(headers)
            .json(&serde_json::json!({ "kind": kind, "data": payload }))
            .send()
            .await
            .map_err(|e| AppError::BadGateway(format!("{} webhook failed: {}", self.target, e)))?;

        if !response.status().is_success() {
            warn!(status = %response.status(), kind = kind, "Webhook rejected payload");
            return Err(AppError::BadGateway(format!(
                "{} webhook returned {}",
                self.target,
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentCollector for WebhookPublisher {
    async fn invoice_opened(&self, invoice: &Invoice) -> Result<(), AppError> {
        self.publish("invoice.opened", invoice).await
    }
}

#[async_trait]
impl LimitAlertSink for WebhookPublisher {
    async fn limit_alert(&self, alert: &LimitAlert) -> Result<(), AppError> {
        self.publish("usage_limit.alert", alert).await
    }
}

/// Single flat rate, rounded to the currency's minor units.
#[derive(Debug, Clone, Copy)]
pub struct FlatRateTax {
    rate: Decimal,
}

impl FlatRateTax {
    pub fn new(rate: Decimal) -> Self {
        Self { rate }
    }
}

#[async_trait]
impl TaxCalculator for FlatRateTax {
    async fn tax_for(
        &self,
        _tenant_id: Uuid,
        subtotal: Decimal,
        currency: &str,
    ) -> Result<Decimal, AppError> {
        Ok(round_money(subtotal * self.rate, currency))
    }
}
