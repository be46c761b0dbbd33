use crate::error::BillingError;
use crate::models::{EventDraft, UsageEvent};
use crate::services::gate::{Admission, MAX_IDEMPOTENCY_KEY_LEN, MAX_METRIC_NAME_LEN};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// One usage event as posted by a client. Quantities may be sent as JSON
/// numbers or decimal strings; strings keep full precision.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct IngestEventRequest {
    #[validate(length(min = 1, max = 128, message = "metric_name must be 1-128 characters"))]
    pub metric_name: String,
    pub quantity: Decimal,
    pub unit: Option<String>,
    pub occurred_at: DateTime<Utc>,
    #[validate(length(min = 1, max = 255, message = "idempotency_key must be 1-255 characters"))]
    pub idempotency_key: String,
    #[serde(default)]
    pub properties: serde_json::Value,
}

impl From<IngestEventRequest> for EventDraft {
    fn from(req: IngestEventRequest) -> Self {
        Self {
            metric_name: req.metric_name,
            quantity: req.quantity,
            unit: req.unit,
            occurred_at: req.occurred_at,
            idempotency_key: req.idempotency_key,
            properties: req.properties,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct BatchIngestRequest {
    #[validate(length(min = 1, message = "events cannot be empty"))]
    pub events: Vec<IngestEventRequest>,
}

#[derive(Debug, Serialize)]
pub struct EventResponse {
    pub event_id: Uuid,
    pub status: String,
    pub event: UsageEvent,
}

impl From<Admission> for EventResponse {
    fn from(admission: Admission) -> Self {
        Self {
            event_id: admission.event.event_id,
            status: admission.status.as_str().to_string(),
            event: admission.event,
        }
    }
}

/// Per-event outcome inside a batch response, in request order.
#[derive(Debug, Serialize)]
pub struct BatchItemResponse {
    pub index: usize,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl BatchItemResponse {
    pub fn from_result(index: usize, result: Result<Admission, BillingError>) -> Self {
        match result {
            Ok(admission) => Self {
                index,
                status: admission.status.as_str().to_string(),
                event_id: Some(admission.event.event_id),
                error: None,
                category: None,
                retry_after_ms: None,
            },
            Err(err) => {
                let retry_after_ms = match &err {
                    BillingError::RateLimited { retry_after_ms, .. } => Some(*retry_after_ms),
                    _ => None,
                };
                Self {
                    index,
                    status: "rejected".to_string(),
                    event_id: None,
                    category: Some(err.category().as_str().to_string()),
                    error: Some(err.to_string()),
                    retry_after_ms,
                }
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BatchIngestResponse {
    pub accepted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub results: Vec<BatchItemResponse>,
}

impl BatchIngestResponse {
    pub fn new(results: Vec<BatchItemResponse>) -> Self {
        let count = |status: &str| results.iter().filter(|r| r.status == status).count();
        Self {
            accepted: count("accepted"),
            duplicates: count("duplicate"),
            rejected: count("rejected"),
            results,
        }
    }
}
