use crate::models::{
    AdjustmentKind, LimitAction, LimitPeriod, PricingModel, SubscriptionStatus,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct CreatePlanRequest {
    #[validate(length(min = 1, max = 255, message = "name must be 1-255 characters"))]
    pub name: String,
    pub base_price: Decimal,
    /// Defaults to the configured billing currency.
    pub currency: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct PublishRuleRequest {
    #[validate(length(min = 1, max = 128, message = "metric_name must be 1-128 characters"))]
    pub metric_name: String,
    #[validate(length(min = 1, max = 64, message = "unit must be 1-64 characters"))]
    pub unit: String,
    pub model: PricingModel,
    pub overage_unit_price: Option<Decimal>,
    /// Defaults to now.
    pub effective_from: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub plan_id: Uuid,
    #[serde(default = "default_status")]
    pub status: SubscriptionStatus,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    #[serde(default = "default_quantity")]
    pub quantity: Decimal,
}

fn default_status() -> SubscriptionStatus {
    SubscriptionStatus::Active
}

fn default_quantity() -> Decimal {
    Decimal::ONE
}

#[derive(Debug, Deserialize)]
pub struct PlanChangeRequest {
    pub effective_at: DateTime<Utc>,
    pub new_plan_id: Uuid,
    #[serde(default = "default_quantity")]
    pub new_quantity: Decimal,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SetLimitRequest {
    #[validate(length(min = 1, max = 128, message = "metric_name must be 1-128 characters"))]
    pub metric_name: String,
    pub limit_value: Decimal,
    pub period: LimitPeriod,
    pub action_on_exceed: LimitAction,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AddAdjustmentRequest {
    pub kind: AdjustmentKind,
    pub amount: Decimal,
    #[validate(length(max = 1024, message = "description is too long"))]
    #[serde(default)]
    pub description: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}
