//! Usage limit enforcement.
//!
//! The decision logic is pure; the counter store applies it atomically with
//! the admission that triggered it.

use crate::models::{LimitAction, LimitDecision, LimitOutcome, LimitPeriod, UsageLimit};
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;

/// Start of the next reset window after `now`, or `None` for `total` limits.
pub fn next_reset(period: LimitPeriod, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match period {
        LimitPeriod::Daily => {
            let tomorrow = now.date_naive() + Duration::days(1);
            Some(start_of_day(tomorrow))
        }
        LimitPeriod::Monthly => {
            let (year, month) = if now.month() == 12 {
                (now.year() + 1, 1)
            } else {
                (now.year(), now.month() + 1)
            };
            NaiveDate::from_ymd_opt(year, month, 1).map(start_of_day)
        }
        LimitPeriod::Total => None,
    }
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}

/// Decide what to do with `incoming` given the stored counter state.
///
/// `current_usage` is treated as zero when `now >= reset_at`, and the returned
/// outcome carries the recomputed `reset_at`. A `Block` outcome reports the
/// pre-admission usage, since blocked admissions mutate nothing.
pub fn evaluate(
    limit: &UsageLimit,
    current_usage: Decimal,
    reset_at: Option<DateTime<Utc>>,
    incoming: Decimal,
    now: DateTime<Utc>,
) -> LimitOutcome {
    let expired = reset_at.is_some_and(|at| now >= at);
    let (usage_before, reset_at) = if expired {
        (Decimal::ZERO, next_reset(limit.period, now))
    } else {
        (current_usage, reset_at.or_else(|| next_reset(limit.period, now)))
    };

    // Saturates: a counter at the decimal ceiling is over any limit.
    let usage_after = usage_before.saturating_add(incoming);
    let decision = if usage_after <= limit.limit_value {
        LimitDecision::Allow
    } else {
        match limit.action_on_exceed {
            LimitAction::Block => LimitDecision::Block,
            LimitAction::AllowOverage => LimitDecision::AllowWithOverage {
                overage: usage_after.saturating_sub(usage_before.max(limit.limit_value)),
            },
            LimitAction::Notify => LimitDecision::Notify,
        }
    };

    LimitOutcome {
        decision,
        usage_before,
        usage_after: if decision == LimitDecision::Block {
            usage_before
        } else {
            usage_after
        },
        reset_at,
    }
}
