//! Usage limit model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reset period of a usage limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitPeriod {
    Daily,
    Monthly,
    Total,
}

impl LimitPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitPeriod::Daily => "daily",
            LimitPeriod::Monthly => "monthly",
            LimitPeriod::Total => "total",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "daily" => Some(LimitPeriod::Daily),
            "total" => Some(LimitPeriod::Total),
            "monthly" => Some(LimitPeriod::Monthly),
            _ => None,
        }
    }
}

/// What happens when an event would push usage past the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitAction {
    Block,
    AllowOverage,
    Notify,
}

impl LimitAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitAction::Block => "block",
            LimitAction::AllowOverage => "allow_overage",
            LimitAction::Notify => "notify",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "allow_overage" => Some(LimitAction::AllowOverage),
            "notify" => Some(LimitAction::Notify),
            "block" => Some(LimitAction::Block),
            _ => None,
        }
    }
}

/// Limit configuration for one metric of one subscription.
///
/// The running `current_usage`/`reset_at` pair lives in the counter store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageLimit {
    pub subscription_id: Uuid,
    pub metric_name: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub limit_value: Decimal,
    pub period: LimitPeriod,
    pub action_on_exceed: LimitAction,
}

/// Counter state for a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LimitUsage {
    pub current_usage: Decimal,
    pub reset_at: Option<DateTime<Utc>>,
}

/// Decision of the usage limit enforcer for one incoming quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum LimitDecision {
    Allow,
    AllowWithOverage {
        #[serde(with = "rust_decimal::serde::str")]
        overage: Decimal,
    },
    Block,
    Notify,
}

impl LimitDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitDecision::Allow => "allow",
            LimitDecision::AllowWithOverage { .. } => "allow_with_overage",
            LimitDecision::Block => "block",
            LimitDecision::Notify => "notify",
        }
    }

    pub fn overage(&self) -> Decimal {
        match self {
            LimitDecision::AllowWithOverage { overage } => *overage,
            _ => Decimal::ZERO,
        }
    }
}

/// Full outcome of a limit check, used for alerts and state updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitOutcome {
    pub decision: LimitDecision,
    pub usage_before: Decimal,
    pub usage_after: Decimal,
    pub reset_at: Option<DateTime<Utc>>,
}
