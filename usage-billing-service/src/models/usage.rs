//! Usage event model.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A metered usage event accepted by the ingestion gate.
///
/// Events are append-only: once stored they are never mutated, only purged
/// after the retention window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub event_id: Uuid,
    pub tenant_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub metric_name: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub quantity: Decimal,
    /// Portion of `quantity` that landed above an `allow_overage` usage limit.
    #[serde(with = "rust_decimal::serde::str")]
    pub overage_quantity: Decimal,
    pub unit: String,
    pub occurred_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub idempotency_key: String,
    pub properties: serde_json::Value,
}

impl UsageEvent {
    /// Partition bucket (UTC day of `occurred_at`).
    pub fn time_bucket(&self) -> NaiveDate {
        self.occurred_at.date_naive()
    }
}

/// Event as submitted by a tenant client, before admission.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub metric_name: String,
    pub quantity: Decimal,
    pub unit: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub idempotency_key: String,
    pub properties: serde_json::Value,
}

/// Result of a durable insert keyed by `(tenant_id, idempotency_key)`.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Inserted(UsageEvent),
    Existing(UsageEvent),
    /// `occurred_at` falls in a period that was closed to usage before the
    /// insert could land. Nothing was written.
    PeriodClosed,
}

impl InsertOutcome {
    pub fn event(&self) -> Option<&UsageEvent> {
        match self {
            InsertOutcome::Inserted(event) | InsertOutcome::Existing(event) => Some(event),
            InsertOutcome::PeriodClosed => None,
        }
    }
}
