//! Billing plan model.

use crate::error::BillingError;
use crate::services::money::checked_mul;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Billing plan.
///
/// `base_price` is the flat subscription fee per unit of subscription
/// quantity for one billing period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub base_price: Decimal,
    pub currency: String,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
}

impl Plan {
    /// Full-period fee for the given subscription quantity.
    pub fn fee_for(&self, quantity: Decimal) -> Result<Decimal, BillingError> {
        checked_mul(self.base_price, quantity)
    }
}

/// Input for creating a plan.
#[derive(Debug, Clone)]
pub struct CreatePlan {
    pub name: String,
    pub base_price: Decimal,
    pub currency: String,
}
