//! Subscription model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
    Paused,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Paused => "paused",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "trialing" => Some(SubscriptionStatus::Trialing),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "canceled" => Some(SubscriptionStatus::Canceled),
            "paused" => Some(SubscriptionStatus::Paused),
            "active" => Some(SubscriptionStatus::Active),
            _ => None,
        }
    }

    /// Whether the subscription still meters usage.
    pub fn accepts_usage(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Trialing | SubscriptionStatus::Active | SubscriptionStatus::PastDue
        )
    }
}

/// A plan or quantity change taking effect mid-period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanChange {
    pub change_id: Uuid,
    pub subscription_id: Uuid,
    pub effective_at: DateTime<Utc>,
    pub old_plan_id: Uuid,
    #[serde(with = "rust_decimal::serde::str")]
    pub old_quantity: Decimal,
    pub new_plan_id: Uuid,
    #[serde(with = "rust_decimal::serde::str")]
    pub new_quantity: Decimal,
    pub recorded_at: DateTime<Utc>,
}

/// Subscription with its plan-change history, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub subscription_id: Uuid,
    pub tenant_id: Uuid,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    #[serde(with = "rust_decimal::serde::str")]
    pub quantity: Decimal,
    pub plan_changes: Vec<PlanChange>,
    pub created_utc: DateTime<Utc>,
}

/// Plan and quantity in force over some interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanConfig {
    pub plan_id: Uuid,
    pub quantity: Decimal,
}

impl Subscription {
    /// Plan and quantity in force at `at`, derived from the change history.
    ///
    /// Changes are ordered by `effective_at`; the configuration before the
    /// first change is that change's old side, otherwise the current one.
    pub fn config_at(&self, at: DateTime<Utc>) -> PlanConfig {
        let mut changes: Vec<&PlanChange> = self.plan_changes.iter().collect();
        changes.sort_by_key(|c| (c.effective_at, c.recorded_at));

        let mut config = match changes.first() {
            Some(first) => PlanConfig {
                plan_id: first.old_plan_id,
                quantity: first.old_quantity,
            },
            None => PlanConfig {
                plan_id: self.plan_id,
                quantity: self.quantity,
            },
        };

        for change in changes {
            if change.effective_at > at {
                break;
            }
            config = PlanConfig {
                plan_id: change.new_plan_id,
                quantity: change.new_quantity,
            };
        }
        config
    }

    /// Changes whose `effective_at` lies in `[start, end)`, oldest first.
    pub fn changes_within(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<PlanChange> {
        let mut changes: Vec<PlanChange> = self
            .plan_changes
            .iter()
            .filter(|c| c.effective_at >= start && c.effective_at < end)
            .cloned()
            .collect();
        changes.sort_by_key(|c| (c.effective_at, c.recorded_at));
        changes
    }
}

/// Input for creating a subscription.
#[derive(Debug, Clone)]
pub struct CreateSubscription {
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub quantity: Decimal,
}

/// Input for recording a plan change.
#[derive(Debug, Clone)]
pub struct RecordPlanChange {
    pub subscription_id: Uuid,
    pub effective_at: DateTime<Utc>,
    pub new_plan_id: Uuid,
    pub new_quantity: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn subscription(changes: Vec<PlanChange>, plan_id: Uuid, quantity: Decimal) -> Subscription {
        Subscription {
            subscription_id: Uuid::nil(),
            tenant_id: Uuid::nil(),
            plan_id,
            status: SubscriptionStatus::Active,
            current_period_start: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            current_period_end: Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap(),
            quantity,
            plan_changes: changes,
            created_utc: Utc.with_ymd_and_hms(2025, 12, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_config_at_walks_history() {
        let basic = Uuid::new_v4();
        let pro = Uuid::new_v4();
        let at = Utc.with_ymd_and_hms(2026, 1, 11, 0, 0, 0).unwrap();
        let change = PlanChange {
            change_id: Uuid::new_v4(),
            subscription_id: Uuid::nil(),
            effective_at: at,
            old_plan_id: basic,
            old_quantity: dec!(1),
            new_plan_id: pro,
            new_quantity: dec!(3),
            recorded_at: at,
        };
        let sub = subscription(vec![change], pro, dec!(3));

        let start = sub.config_at(sub.current_period_start);
        assert_eq!(start.plan_id, basic);
        assert_eq!(start.quantity, dec!(1));

        let after = sub.config_at(at);
        assert_eq!(after.plan_id, pro);
        assert_eq!(after.quantity, dec!(3));
    }

    #[test]
    fn test_status_round_trip_names() {
        for status in [
            SubscriptionStatus::Trialing,
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Canceled,
            SubscriptionStatus::Paused,
        ] {
            assert_eq!(SubscriptionStatus::from_string(status.as_str()), Some(status));
        }
        assert_eq!(SubscriptionStatus::from_string("suspended"), None);
        assert_eq!(SubscriptionStatus::from_string("Active"), None);
        assert!(!SubscriptionStatus::Canceled.accepts_usage());
        assert!(SubscriptionStatus::PastDue.accepts_usage());
    }
}
