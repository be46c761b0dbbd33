//! Discounts and credits attached to a subscription period.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentKind {
    /// `amount` is a percentage (e.g. `10` for 10%).
    PercentDiscount,
    FixedDiscount,
    Credit,
}

impl AdjustmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustmentKind::PercentDiscount => "percent_discount",
            AdjustmentKind::FixedDiscount => "fixed_discount",
            AdjustmentKind::Credit => "credit",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "percent_discount" => Some(AdjustmentKind::PercentDiscount),
            "fixed_discount" => Some(AdjustmentKind::FixedDiscount),
            "credit" => Some(AdjustmentKind::Credit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adjustment {
    pub adjustment_id: Uuid,
    pub tenant_id: Uuid,
    pub subscription_id: Uuid,
    pub kind: AdjustmentKind,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub description: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}
