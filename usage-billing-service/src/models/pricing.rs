//! Pricing rule model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One tier of a tiered or volume schedule.
///
/// `upper_bound` is inclusive; `None` is the unbounded last tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub upper_bound: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::str")]
    pub unit_price: Decimal,
}

impl Tier {
    pub fn bounded(upper_bound: Decimal, unit_price: Decimal) -> Self {
        Self {
            upper_bound: Some(upper_bound),
            unit_price,
        }
    }

    pub fn unbounded(unit_price: Decimal) -> Self {
        Self {
            upper_bound: None,
            unit_price,
        }
    }
}

/// Pricing model with a typed payload per variant.
///
/// Unknown `type` tags fail deserialization, so they never reach storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PricingModel {
    /// Fixed amount, charged once per billing period.
    Flat {
        #[serde(with = "rust_decimal::serde::str")]
        amount: Decimal,
    },
    PerUnit {
        #[serde(with = "rust_decimal::serde::str")]
        unit_price: Decimal,
    },
    /// Graduated: each tier prices only the quantity that falls inside it.
    Tiered { tiers: Vec<Tier> },
    /// The whole quantity is priced at the tier that contains the total.
    Volume { tiers: Vec<Tier> },
    /// Units are bought in packages, always rounded up.
    Package {
        #[serde(with = "rust_decimal::serde::str")]
        package_size: Decimal,
        #[serde(with = "rust_decimal::serde::str")]
        package_price: Decimal,
    },
    /// Base price once per period, plus `usage` for quantity beyond the allowance.
    Hybrid {
        #[serde(with = "rust_decimal::serde::str")]
        base_price: Decimal,
        #[serde(with = "rust_decimal::serde::str")]
        included_quantity: Decimal,
        usage: Box<PricingModel>,
    },
}

impl PricingModel {
    pub fn pricing_type(&self) -> PricingType {
        match self {
            PricingModel::Flat { .. } => PricingType::Flat,
            PricingModel::PerUnit { .. } => PricingType::PerUnit,
            PricingModel::Tiered { .. } => PricingType::Tiered,
            PricingModel::Volume { .. } => PricingType::Volume,
            PricingModel::Package { .. } => PricingType::Package,
            PricingModel::Hybrid { .. } => PricingType::Hybrid,
        }
    }

    /// True for models that carry a once-per-period fee.
    pub fn has_period_fee(&self) -> bool {
        matches!(self, PricingModel::Flat { .. } | PricingModel::Hybrid { .. })
    }
}

/// Pricing type discriminant, stored alongside the model payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingType {
    Flat,
    PerUnit,
    Tiered,
    Volume,
    Package,
    Hybrid,
}

impl PricingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PricingType::Flat => "flat",
            PricingType::PerUnit => "per_unit",
            PricingType::Tiered => "tiered",
            PricingType::Volume => "volume",
            PricingType::Package => "package",
            PricingType::Hybrid => "hybrid",
        }
    }
}

/// A versioned pricing rule for one metric of one plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingRule {
    pub rule_id: Uuid,
    pub tenant_id: Uuid,
    pub plan_id: Uuid,
    pub metric_name: String,
    pub version: i32,
    pub unit: String,
    pub model: PricingModel,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub overage_unit_price: Option<Decimal>,
    pub is_active: bool,
    pub effective_from: DateTime<Utc>,
    pub superseded_at: Option<DateTime<Utc>>,
}

impl PricingRule {
    pub fn pricing_type(&self) -> PricingType {
        self.model.pricing_type()
    }

    /// Whether this version was the one in force at `at`.
    pub fn in_force_at(&self, at: DateTime<Utc>) -> bool {
        self.effective_from <= at && self.superseded_at.is_none_or(|s| s > at)
    }
}

/// Input for publishing a new rule version.
#[derive(Debug, Clone)]
pub struct PublishRule {
    pub plan_id: Uuid,
    pub metric_name: String,
    pub unit: String,
    pub model: PricingModel,
    pub overage_unit_price: Option<Decimal>,
    pub effective_from: DateTime<Utc>,
}
