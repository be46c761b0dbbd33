//! Pricing rule evaluation.
//!
//! All arithmetic is exact decimal and unrounded; callers round once at the
//! line-item amount. A quantity sitting exactly on a tier's upper bound
//! belongs to that (lower) tier.

use crate::error::BillingError;
use crate::models::{PricingModel, PricingRule, PublishRule, Tier};
use crate::services::money::{checked_add, checked_mul, checked_sub};
use rust_decimal::Decimal;
use std::collections::HashSet;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleValidationError {
    #[error("tier schedule is empty")]
    EmptyTiers,

    #[error("tier {index} is unbounded but is not the last tier")]
    UnboundedTierNotLast { index: usize },

    #[error("last tier must be unbounded")]
    LastTierBounded,

    #[error("tier {index} upper bound {bound} must be greater than {previous}")]
    NonIncreasingBound {
        index: usize,
        bound: Decimal,
        previous: Decimal,
    },

    #[error("{field} must not be negative")]
    NegativeAmount { field: &'static str },

    #[error("package size must be greater than zero")]
    NonPositivePackageSize,

    #[error("hybrid usage model cannot be {0}")]
    InvalidHybridUsage(&'static str),
}

/// Validate a model before it is stored.
pub fn validate_model(model: &PricingModel) -> Result<(), RuleValidationError> {
    match model {
        PricingModel::Flat { amount } => non_negative(*amount, "amount"),
        PricingModel::PerUnit { unit_price } => non_negative(*unit_price, "unit_price"),
        PricingModel::Tiered { tiers } | PricingModel::Volume { tiers } => validate_tiers(tiers),
        PricingModel::Package {
            package_size,
            package_price,
        } => {
            if *package_size <= Decimal::ZERO {
                return Err(RuleValidationError::NonPositivePackageSize);
            }
            non_negative(*package_price, "package_price")
        }
        PricingModel::Hybrid {
            base_price,
            included_quantity,
            usage,
        } => {
            non_negative(*base_price, "base_price")?;
            non_negative(*included_quantity, "included_quantity")?;
            match usage.as_ref() {
                PricingModel::Flat { .. } => Err(RuleValidationError::InvalidHybridUsage("flat")),
                PricingModel::Hybrid { .. } => {
                    Err(RuleValidationError::InvalidHybridUsage("hybrid"))
                }
                other => validate_model(other),
            }
        }
    }
}

fn non_negative(value: Decimal, field: &'static str) -> Result<(), RuleValidationError> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(RuleValidationError::NegativeAmount { field });
    }
    Ok(())
}

fn validate_tiers(tiers: &[Tier]) -> Result<(), RuleValidationError> {
    if tiers.is_empty() {
        return Err(RuleValidationError::EmptyTiers);
    }

    let last = tiers.len() - 1;
    let mut previous = Decimal::ZERO;
    for (index, tier) in tiers.iter().enumerate() {
        non_negative(tier.unit_price, "unit_price")?;
        match tier.upper_bound {
            None if index != last => return Err(RuleValidationError::UnboundedTierNotLast { index }),
            None => {}
            Some(_) if index == last => return Err(RuleValidationError::LastTierBounded),
            Some(bound) => {
                if bound <= previous {
                    return Err(RuleValidationError::NonIncreasingBound {
                        index,
                        bound,
                        previous,
                    });
                }
                previous = bound;
            }
        }
    }
    Ok(())
}

/// Validate a rule publication, naming the metric on failure.
pub fn validate_rule(input: &PublishRule) -> Result<(), BillingError> {
    let invalid = |reason: String| BillingError::InvalidRule {
        metric_name: input.metric_name.clone(),
        reason,
    };

    validate_model(&input.model).map_err(|e| invalid(e.to_string()))?;
    if let Some(price) = input.overage_unit_price {
        non_negative(price, "overage_unit_price").map_err(|e| invalid(e.to_string()))?;
    }
    Ok(())
}

/// Graduated cost of the quantity in `(before, after]`.
///
/// Portion in tier i is `min(ub_i, after) - max(lb_i, before)`, clamped at zero.
pub fn tiered_cost(
    tiers: &[Tier],
    before: Decimal,
    after: Decimal,
) -> Result<Decimal, BillingError> {
    let mut lower = Decimal::ZERO;
    let mut total = Decimal::ZERO;

    for tier in tiers {
        let top = match tier.upper_bound {
            Some(bound) => bound.min(after),
            None => after,
        };
        let portion = checked_sub(top, lower.max(before))?;
        if portion > Decimal::ZERO {
            total = checked_add(total, checked_mul(portion, tier.unit_price)?)?;
        }
        match tier.upper_bound {
            Some(bound) => lower = bound,
            None => break,
        }
        if lower >= after {
            break;
        }
    }
    Ok(total)
}

/// Whole `total` priced at the rate of the tier that contains it.
pub fn volume_price(tiers: &[Tier], total: Decimal) -> Result<Decimal, BillingError> {
    if total <= Decimal::ZERO {
        return Ok(Decimal::ZERO);
    }
    let rate = tiers
        .iter()
        .find(|tier| tier.upper_bound.is_none_or(|bound| total <= bound))
        .or_else(|| tiers.last())
        .map(|tier| tier.unit_price)
        .unwrap_or(Decimal::ZERO);
    checked_mul(total, rate)
}

/// Packages needed for `quantity`, always rounded up.
pub fn packages_for(quantity: Decimal, package_size: Decimal) -> Result<Decimal, BillingError> {
    if quantity <= Decimal::ZERO {
        return Ok(Decimal::ZERO);
    }
    quantity
        .checked_div(package_size)
        .map(|packages| packages.ceil())
        .ok_or_else(|| {
            BillingError::ConsistencyViolation(format!(
                "package count overflow for {} / {}",
                quantity, package_size
            ))
        })
}

/// Charge for moving cumulative usage from `before` to `after` under a usage model.
pub fn usage_charge(
    model: &PricingModel,
    before: Decimal,
    after: Decimal,
) -> Result<Decimal, BillingError> {
    match model {
        PricingModel::PerUnit { unit_price } => {
            checked_mul(checked_sub(after, before)?, *unit_price)
        }
        PricingModel::Tiered { tiers } => tiered_cost(tiers, before, after),
        PricingModel::Volume { tiers } => {
            checked_sub(volume_price(tiers, after)?, volume_price(tiers, before)?)
        }
        PricingModel::Package {
            package_size,
            package_price,
        } => {
            let packages = checked_sub(
                packages_for(after, *package_size)?,
                packages_for(before, *package_size)?,
            )?;
            checked_mul(packages, *package_price)
        }
        PricingModel::Flat { .. } | PricingModel::Hybrid { .. } => {
            Err(BillingError::ConsistencyViolation(format!(
                "{} is not a usage model",
                model.pricing_type().as_str()
            )))
        }
    }
}

/// Prices usage for one billing period.
///
/// Holds the set of rules whose once-per-period fee has already been charged,
/// so re-evaluating a flat or hybrid rule within the period adds nothing.
#[derive(Debug, Default)]
pub struct PricingEvaluator {
    charged_once: HashSet<Uuid>,
}

impl PricingEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unrounded charge for `quantity` on top of `before` accumulated units.
    pub fn price(
        &mut self,
        metric_name: &str,
        before: Decimal,
        quantity: Decimal,
        rule: &PricingRule,
    ) -> Result<Decimal, BillingError> {
        if rule.metric_name != metric_name {
            return Err(BillingError::ConsistencyViolation(format!(
                "rule {} prices '{}', not '{}'",
                rule.rule_id, rule.metric_name, metric_name
            )));
        }
        if before < Decimal::ZERO || quantity < Decimal::ZERO {
            return Err(BillingError::InvalidQuantity {
                metric_name: metric_name.to_string(),
                quantity: quantity.min(before),
            });
        }

        let after = checked_add(before, quantity)?;
        match &rule.model {
            PricingModel::Flat { amount } => Ok(self.period_fee(rule.rule_id, *amount)),
            PricingModel::Hybrid {
                base_price,
                included_quantity,
                usage,
            } => {
                let base = self.period_fee(rule.rule_id, *base_price);
                let over_before = checked_sub(before, *included_quantity)?.max(Decimal::ZERO);
                let over_after = checked_sub(after, *included_quantity)?.max(Decimal::ZERO);
                checked_add(base, usage_charge(usage, over_before, over_after)?)
            }
            usage => usage_charge(usage, before, after),
        }
    }

    fn period_fee(&mut self, rule_id: Uuid, amount: Decimal) -> Decimal {
        if self.charged_once.insert(rule_id) {
            amount
        } else {
            Decimal::ZERO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn standard_tiers() -> Vec<Tier> {
        vec![
            Tier::bounded(dec!(1000), dec!(0.01)),
            Tier::unbounded(dec!(0.005)),
        ]
    }

    fn rule(model: PricingModel) -> PricingRule {
        PricingRule {
            rule_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            metric_name: "api_calls".to_string(),
            version: 1,
            unit: "call".to_string(),
            model,
            overage_unit_price: None,
            is_active: true,
            effective_from: Utc::now(),
            superseded_at: None,
        }
    }

    #[test]
    fn test_tiered_spans_boundary() {
        let r = rule(PricingModel::Tiered {
            tiers: standard_tiers(),
        });
        let mut eval = PricingEvaluator::new();
        let charge = eval.price("api_calls", dec!(900), dec!(200), &r).unwrap();
        assert_eq!(charge, dec!(1.50));
    }

    #[test]
    fn test_volume_prices_whole_quantity() {
        let r = rule(PricingModel::Volume {
            tiers: standard_tiers(),
        });
        let mut eval = PricingEvaluator::new();
        let charge = eval.price("api_calls", dec!(0), dec!(1100), &r).unwrap();
        assert_eq!(charge, dec!(5.50));
    }

    #[test]
    fn test_volume_delta_accumulates_to_total() {
        let r = rule(PricingModel::Volume {
            tiers: standard_tiers(),
        });
        let mut eval = PricingEvaluator::new();
        let first = eval.price("api_calls", dec!(0), dec!(900), &r).unwrap();
        let second = eval.price("api_calls", dec!(900), dec!(200), &r).unwrap();
        assert_eq!(first + second, dec!(5.50));
    }

    #[test]
    fn test_package_rounds_up() {
        let r = rule(PricingModel::Package {
            package_size: dec!(100),
            package_price: dec!(10),
        });
        let mut eval = PricingEvaluator::new();
        let charge = eval.price("api_calls", dec!(250), dec!(60), &r).unwrap();
        assert_eq!(charge, dec!(10));

        let within = eval.price("api_calls", dec!(310), dec!(80), &r).unwrap();
        assert_eq!(within, dec!(0));
    }

    #[test]
    fn test_boundary_quantity_belongs_to_lower_tier() {
        let tiers = standard_tiers();
        assert_eq!(volume_price(&tiers, dec!(1000)).unwrap(), dec!(10.00));
        assert_eq!(tiered_cost(&tiers, dec!(0), dec!(1000)).unwrap(), dec!(10.00));
        assert_eq!(volume_price(&tiers, dec!(1000.5)).unwrap(), dec!(5.0025));
    }

    #[test]
    fn test_per_unit() {
        let r = rule(PricingModel::PerUnit {
            unit_price: dec!(0.002),
        });
        let mut eval = PricingEvaluator::new();
        assert_eq!(
            eval.price("api_calls", dec!(10), dec!(1500), &r).unwrap(),
            dec!(3.000)
        );
    }

    #[test]
    fn test_flat_charged_once_per_period() {
        let r = rule(PricingModel::Flat { amount: dec!(25) });
        let mut eval = PricingEvaluator::new();
        assert_eq!(eval.price("api_calls", dec!(0), dec!(5), &r).unwrap(), dec!(25));
        assert_eq!(eval.price("api_calls", dec!(5), dec!(5), &r).unwrap(), dec!(0));

        let mut next_period = PricingEvaluator::new();
        assert_eq!(
            next_period.price("api_calls", dec!(0), dec!(0), &r).unwrap(),
            dec!(25)
        );
    }

    #[test]
    fn test_hybrid_charges_beyond_allowance() {
        let r = rule(PricingModel::Hybrid {
            base_price: dec!(49),
            included_quantity: dec!(1000),
            usage: Box::new(PricingModel::PerUnit {
                unit_price: dec!(0.02),
            }),
        });
        let mut eval = PricingEvaluator::new();
        assert_eq!(eval.price("api_calls", dec!(0), dec!(800), &r).unwrap(), dec!(49));
        assert_eq!(
            eval.price("api_calls", dec!(800), dec!(300), &r).unwrap(),
            dec!(2.00)
        );
    }

    #[test]
    fn test_overflowing_charge_is_an_error_not_a_panic() {
        let per_unit = PricingModel::PerUnit {
            unit_price: dec!(10),
        };
        let huge = Decimal::from_i128_with_scale(10_i128.pow(28), 0);
        assert!(matches!(
            usage_charge(&per_unit, dec!(0), huge),
            Err(BillingError::ConsistencyViolation(_))
        ));

        let r = rule(PricingModel::Tiered {
            tiers: standard_tiers(),
        });
        let mut eval = PricingEvaluator::new();
        assert!(eval.price("api_calls", Decimal::MAX, dec!(1), &r).is_err());
    }

    #[test]
    fn test_metric_mismatch_is_consistency_violation() {
        let r = rule(PricingModel::PerUnit {
            unit_price: dec!(1),
        });
        let mut eval = PricingEvaluator::new();
        let err = eval.price("storage_gb", dec!(0), dec!(1), &r).unwrap_err();
        assert!(matches!(err, BillingError::ConsistencyViolation(_)));
    }

    #[test]
    fn test_validation_rejects_bad_tiers() {
        let overlapping = PricingModel::Tiered {
            tiers: vec![
                Tier::bounded(dec!(1000), dec!(0.01)),
                Tier::bounded(dec!(500), dec!(0.02)),
                Tier::unbounded(dec!(0.005)),
            ],
        };
        assert!(matches!(
            validate_model(&overlapping),
            Err(RuleValidationError::NonIncreasingBound { index: 1, .. })
        ));

        let no_open_tier = PricingModel::Volume {
            tiers: vec![Tier::bounded(dec!(1000), dec!(0.01))],
        };
        assert_eq!(
            validate_model(&no_open_tier),
            Err(RuleValidationError::LastTierBounded)
        );

        let early_open_tier = PricingModel::Volume {
            tiers: vec![Tier::unbounded(dec!(0.01)), Tier::unbounded(dec!(0.005))],
        };
        assert_eq!(
            validate_model(&early_open_tier),
            Err(RuleValidationError::UnboundedTierNotLast { index: 0 })
        );

        assert_eq!(
            validate_model(&PricingModel::Tiered { tiers: vec![] }),
            Err(RuleValidationError::EmptyTiers)
        );
    }

    #[test]
    fn test_validation_rejects_bad_package_and_hybrid() {
        assert_eq!(
            validate_model(&PricingModel::Package {
                package_size: dec!(0),
                package_price: dec!(10),
            }),
            Err(RuleValidationError::NonPositivePackageSize)
        );
        assert_eq!(
            validate_model(&PricingModel::Hybrid {
                base_price: dec!(10),
                included_quantity: dec!(5),
                usage: Box::new(PricingModel::Flat { amount: dec!(1) }),
            }),
            Err(RuleValidationError::InvalidHybridUsage("flat"))
        );
    }
}
