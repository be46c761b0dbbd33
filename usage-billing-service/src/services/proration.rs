//! Proration of mid-period plan and quantity changes.
//!
//! Time fractions are exact ratios of whole seconds, measured between
//! second-truncated instants so sub-second offsets cancel. Each change produces a
//! credit for the old configuration and a charge for the new one over the
//! remainder of the period; applied in order, the sub-intervals between
//! changes cover the period exactly once.

use crate::error::BillingError;
use crate::models::{
    LineItem, LineItemKind, Plan, PlanChange, PlanConfig, PriceBasis, Subscription,
};
use crate::services::money::{checked_mul, round_money};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use uuid::Uuid;

/// Whole seconds from `from` to `to`, both truncated to the second.
fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    to.timestamp() - from.timestamp()
}

/// Exact `numerator / denominator` fraction of a billing period, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodFraction {
    pub numerator: i64,
    pub denominator: i64,
}

impl PeriodFraction {
    /// Remaining fraction of `[period_start, period_end)` from `from`.
    pub fn remaining(
        from: DateTime<Utc>,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Self {
        Self {
            numerator: seconds_between(from, period_end),
            denominator: seconds_between(period_start, period_end),
        }
    }

    /// `amount × numerator / denominator`, unrounded.
    pub fn apply(&self, amount: Decimal) -> Result<Decimal, BillingError> {
        let scaled = checked_mul(amount, Decimal::from(self.numerator))?;
        scaled
            .checked_div(Decimal::from(self.denominator))
            .ok_or_else(|| {
                BillingError::ConsistencyViolation(format!(
                    "cannot prorate {} by {}/{}",
                    amount, self.numerator, self.denominator
                ))
            })
    }
}

/// Split `[period_start, period_end)` at each change's `effective_at`.
///
/// Returns the fraction of each sub-interval; their numerators always sum to
/// the shared denominator.
pub fn segment_fractions(
    changes: &[PlanChange],
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
) -> Vec<PeriodFraction> {
    let denominator = seconds_between(period_start, period_end);
    let mut bounds: Vec<DateTime<Utc>> = Vec::with_capacity(changes.len() + 2);
    bounds.push(period_start);
    bounds.extend(changes.iter().map(|c| c.effective_at));
    bounds.push(period_end);

    bounds
        .windows(2)
        .map(|w| PeriodFraction {
            numerator: seconds_between(w[0], w[1]),
            denominator,
        })
        .collect()
}

fn check_period(
    change: &PlanChange,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
) -> Result<(), BillingError> {
    if change.effective_at < period_start || change.effective_at >= period_end {
        return Err(BillingError::OutOfOrderPlanChange {
            effective_at: change.effective_at,
            period_start,
            period_end,
        });
    }
    Ok(())
}

fn plan<'a>(plans: &'a HashMap<Uuid, Plan>, plan_id: Uuid) -> Result<&'a Plan, BillingError> {
    plans
        .get(&plan_id)
        .ok_or_else(|| BillingError::NotFound(format!("Plan {}", plan_id)))
}

/// Credit and charge items for one change within `[period_start, period_end)`.
pub fn prorate(
    change: &PlanChange,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    plans: &HashMap<Uuid, Plan>,
    currency: &str,
) -> Result<Vec<LineItem>, BillingError> {
    check_period(change, period_start, period_end)?;

    let fraction = PeriodFraction::remaining(change.effective_at, period_start, period_end);
    let old_plan = plan(plans, change.old_plan_id)?;
    let new_plan = plan(plans, change.new_plan_id)?;
    let old_fee = old_plan.fee_for(change.old_quantity)?;
    let new_fee = new_plan.fee_for(change.new_quantity)?;

    Ok(vec![
        LineItem {
            kind: LineItemKind::ProrationCredit,
            description: format!(
                "Unused time on {} x {} from {}",
                old_plan.name,
                change.old_quantity,
                change.effective_at.format("%Y-%m-%d %H:%M:%S UTC")
            ),
            metric_name: None,
            quantity: change.old_quantity,
            price_basis: PriceBasis::Prorated {
                full_fee: old_fee,
                numerator: fraction.numerator,
                denominator: fraction.denominator,
            },
            amount: -round_money(fraction.apply(old_fee)?, currency),
        },
        LineItem {
            kind: LineItemKind::ProrationCharge,
            description: format!(
                "Remaining time on {} x {} from {}",
                new_plan.name,
                change.new_quantity,
                change.effective_at.format("%Y-%m-%d %H:%M:%S UTC")
            ),
            metric_name: None,
            quantity: change.new_quantity,
            price_basis: PriceBasis::Prorated {
                full_fee: new_fee,
                numerator: fraction.numerator,
                denominator: fraction.denominator,
            },
            amount: round_money(fraction.apply(new_fee)?, currency),
        },
    ])
}

/// Check the remaining fractions that price each change against the
/// segments the changes cut the period into.
///
/// The configuration in force over segment k is billed for
/// `remaining_k - remaining_(k+1)` of the period (the full fee before the
/// first change, nothing after the period). Every such share must equal its
/// segment and the shares must cover the period exactly once.
pub fn check_fractions(
    segments: &[PeriodFraction],
    remaining: &[PeriodFraction],
) -> Result<(), String> {
    if segments.len() != remaining.len() + 1 {
        return Err(format!(
            "{} segments for {} changes",
            segments.len(),
            remaining.len()
        ));
    }
    let denominator = segments[0].denominator;
    if denominator <= 0 {
        return Err(format!("period length {}s is not positive", denominator));
    }

    let mut previous = denominator;
    let mut covered: i64 = 0;
    let shares = remaining
        .iter()
        .map(|r| (r.numerator, r.denominator))
        .chain(std::iter::once((0, denominator)));
    for (index, ((numerator, share_denominator), segment)) in shares.zip(segments).enumerate() {
        if share_denominator != denominator || segment.denominator != denominator {
            return Err(format!(
                "segment {} is measured over {}s, not {}s",
                index, share_denominator, denominator
            ));
        }
        let share = previous - numerator;
        if share < 0 || share != segment.numerator {
            return Err(format!(
                "segment {} is billed for {}/{} but spans {}/{}",
                index, share, denominator, segment.numerator, denominator
            ));
        }
        covered += share;
        previous = numerator;
    }

    if covered != denominator {
        return Err(format!("fractions sum to {}/{}", covered, denominator));
    }
    Ok(())
}

/// Configuration the period opens with, before any of `changes` apply.
///
/// A change effective exactly at period start is carried by proration, so
/// the opening configuration is its old side.
pub fn opening_config(
    subscription: &Subscription,
    changes: &[PlanChange],
    period_start: DateTime<Utc>,
) -> PlanConfig {
    match changes.first() {
        Some(first) if first.effective_at == period_start => PlanConfig {
            plan_id: first.old_plan_id,
            quantity: first.old_quantity,
        },
        _ => subscription.config_at(period_start),
    }
}

/// All proration items for a subscription's changes within the period.
///
/// Changes are applied in `effective_at` order; each must start from the
/// configuration left by the one before it.
pub fn prorate_period(
    subscription: &Subscription,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    plans: &HashMap<Uuid, Plan>,
    currency: &str,
) -> Result<Vec<LineItem>, BillingError> {
    let changes = subscription.changes_within(period_start, period_end);
    if changes.is_empty() {
        return Ok(Vec::new());
    }

    let segments = segment_fractions(&changes, period_start, period_end);
    let remaining: Vec<PeriodFraction> = changes
        .iter()
        .map(|c| PeriodFraction::remaining(c.effective_at, period_start, period_end))
        .collect();
    if let Err(reason) = check_fractions(&segments, &remaining) {
        tracing::error!(
            subscription_id = %subscription.subscription_id,
            reason = %reason,
            "Proration fractions do not sum to one"
        );
        return Err(BillingError::ConsistencyViolation(format!(
            "proration fractions for subscription {}: {}",
            subscription.subscription_id, reason
        )));
    }

    let mut in_force = opening_config(subscription, &changes, period_start);

    let mut items = Vec::with_capacity(changes.len() * 2);
    for change in &changes {
        if change.old_plan_id != in_force.plan_id || change.old_quantity != in_force.quantity {
            tracing::error!(
                subscription_id = %subscription.subscription_id,
                change_id = %change.change_id,
                "Plan change does not start from the configuration in force"
            );
            return Err(BillingError::ConsistencyViolation(format!(
                "plan change {} expects plan {} x {} but {} x {} is in force",
                change.change_id,
                change.old_plan_id,
                change.old_quantity,
                in_force.plan_id,
                in_force.quantity
            )));
        }
        items.extend(prorate(change, period_start, period_end, plans, currency)?);
        in_force = PlanConfig {
            plan_id: change.new_plan_id,
            quantity: change.new_quantity,
        };
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SubscriptionStatus;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, d, h, 0, 0).unwrap()
    }

    fn period() -> (DateTime<Utc>, DateTime<Utc>) {
        (at(1, 0), Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap())
    }

    fn plan_fixture(name: &str, price: Decimal) -> Plan {
        Plan {
            plan_id: Uuid::new_v4(),
            tenant_id: Uuid::nil(),
            name: name.to_string(),
            base_price: price,
            currency: "USD".to_string(),
            is_active: true,
            created_utc: at(1, 0),
        }
    }

    fn change(at: DateTime<Utc>, old: &Plan, oq: Decimal, new: &Plan, nq: Decimal) -> PlanChange {
        PlanChange {
            change_id: Uuid::new_v4(),
            subscription_id: Uuid::nil(),
            effective_at: at,
            old_plan_id: old.plan_id,
            old_quantity: oq,
            new_plan_id: new.plan_id,
            new_quantity: nq,
            recorded_at: at,
        }
    }

    fn subscription(plan: &Plan, changes: Vec<PlanChange>) -> Subscription {
        let (start, end) = period();
        Subscription {
            subscription_id: Uuid::new_v4(),
            tenant_id: Uuid::nil(),
            plan_id: plan.plan_id,
            status: SubscriptionStatus::Active,
            current_period_start: start,
            current_period_end: end,
            quantity: dec!(1),
            plan_changes: changes,
            created_utc: start,
        }
    }

    #[test]
    fn test_single_upgrade_halfway() {
        let (start, end) = period();
        let basic = plan_fixture("Basic", dec!(30));
        let pro = plan_fixture("Pro", dec!(90));
        let plans = HashMap::from([(basic.plan_id, basic.clone()), (pro.plan_id, pro.clone())]);
        let c = change(at(16, 0), &basic, dec!(1), &pro, dec!(1));

        let items = prorate(&c, start, end, &plans, "USD").unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].amount, dec!(-15.00));
        assert_eq!(items[1].amount, dec!(45.00));
    }

    #[test]
    fn test_segment_fractions_sum_to_one() {
        let (start, end) = period();
        let basic = plan_fixture("Basic", dec!(30));
        let pro = plan_fixture("Pro", dec!(90));
        let changes = vec![
            change(at(3, 7), &basic, dec!(1), &pro, dec!(1)),
            change(at(19, 13), &pro, dec!(1), &pro, dec!(4)),
        ];

        let fractions = segment_fractions(&changes, start, end);
        assert_eq!(fractions.len(), 3);
        let sum: i64 = fractions.iter().map(|f| f.numerator).sum();
        assert_eq!(sum, fractions[0].denominator);
    }

    #[test]
    fn test_sequential_changes_net_to_segment_costs() {
        let (start, end) = period();
        let basic = plan_fixture("Basic", dec!(30));
        let pro = plan_fixture("Pro", dec!(90));
        let plans = HashMap::from([(basic.plan_id, basic.clone()), (pro.plan_id, pro.clone())]);
        let sub = subscription(
            &pro,
            vec![
                change(at(11, 0), &basic, dec!(1), &pro, dec!(1)),
                change(at(21, 0), &pro, dec!(1), &pro, dec!(2)),
            ],
        );

        let items = prorate_period(&sub, start, end, &plans, "USD").unwrap();
        assert_eq!(items.len(), 4);
        let net: Decimal = items.iter().map(|i| i.amount).sum();
        // 30 full fee already billed; 10 days basic, 10 days pro, 10 days pro x2
        // cost 10 + 30 + 60 = 100, so proration nets to 70.
        assert_eq!(net, dec!(70.00));
    }

    #[test]
    fn test_sub_second_change_prorates_by_whole_seconds() {
        let (start, end) = period();
        let basic = plan_fixture("Basic", dec!(30));
        let pro = plan_fixture("Pro", dec!(90));
        let plans = HashMap::from([(basic.plan_id, basic.clone()), (pro.plan_id, pro.clone())]);
        let effective_at = at(16, 0) + chrono::Duration::milliseconds(500);
        let sub = subscription(
            &pro,
            vec![change(effective_at, &basic, dec!(1), &pro, dec!(1))],
        );

        let items = prorate_period(&sub, start, end, &plans, "USD").unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].amount, dec!(-15.00));
        assert_eq!(items[1].amount, dec!(45.00));

        let sub_second_bounds = prorate_period(
            &sub,
            start + chrono::Duration::milliseconds(250),
            end + chrono::Duration::milliseconds(750),
            &plans,
            "USD",
        );
        assert!(sub_second_bounds.is_ok());
    }

    #[test]
    fn test_fraction_check_catches_mismatched_shares() {
        let whole = |numerator| PeriodFraction {
            numerator,
            denominator: 30,
        };
        assert!(check_fractions(&[whole(10), whole(20)], &[whole(20)]).is_ok());

        // Amounts priced from 19/30 remaining while the segment spans 20/30.
        assert!(check_fractions(&[whole(10), whole(20)], &[whole(19)]).is_err());

        // Remaining fraction measured over a different period length.
        let other = PeriodFraction {
            numerator: 20,
            denominator: 31,
        };
        assert!(check_fractions(&[whole(10), whole(20)], &[other]).is_err());

        // Changes out of order give a negative share.
        assert!(check_fractions(
            &[whole(10), whole(-5), whole(25)],
            &[whole(20), whole(25)]
        )
        .is_err());
    }

    #[test]
    fn test_change_outside_period_rejected() {
        let (start, end) = period();
        let basic = plan_fixture("Basic", dec!(30));
        let plans = HashMap::from([(basic.plan_id, basic.clone())]);
        let c = change(end, &basic, dec!(1), &basic, dec!(2));

        let err = prorate(&c, start, end, &plans, "USD").unwrap_err();
        assert!(matches!(err, BillingError::OutOfOrderPlanChange { .. }));
    }

    #[test]
    fn test_mismatched_history_is_consistency_violation() {
        let (start, end) = period();
        let basic = plan_fixture("Basic", dec!(30));
        let pro = plan_fixture("Pro", dec!(90));
        let plans = HashMap::from([(basic.plan_id, basic.clone()), (pro.plan_id, pro.clone())]);
        let sub = subscription(
            &pro,
            vec![
                change(at(11, 0), &basic, dec!(1), &pro, dec!(1)),
                change(at(21, 0), &basic, dec!(1), &pro, dec!(2)),
            ],
        );

        let err = prorate_period(&sub, start, end, &plans, "USD").unwrap_err();
        assert!(matches!(err, BillingError::ConsistencyViolation(_)));
    }
}
