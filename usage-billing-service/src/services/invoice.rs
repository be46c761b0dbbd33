//! Invoice aggregation: subscription fees, priced usage, proration and
//! adjustments rolled into a draft invoice, then finalized to `open`.

use crate::error::BillingError;
use crate::models::{
    AdjustmentKind, Invoice, InvoiceStatus, LineItem, LineItemKind, Plan, PlanChange, PlanConfig,
    PriceBasis, PricingModel, PricingRule, Subscription, UsageEvent,
};
use crate::services::clock::Clock;
use crate::services::collaborators::{PaymentCollector, TaxCalculator};
use crate::services::metrics::{record_invoice_finalized, record_invoice_generated};
use crate::services::money::{checked_add, checked_mul, checked_sub, checked_sum, round_money};
use crate::services::pricing::PricingEvaluator;
use crate::services::proration::{opening_config, prorate_period};
use crate::services::store::BillingStore;
use crate::services::tenant::{TenantContext, SCOPE_INVOICES_READ, SCOPE_INVOICES_WRITE};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

pub struct InvoiceAggregator {
    store: Arc<dyn BillingStore>,
    tax: Arc<dyn TaxCalculator>,
    payments: Arc<dyn PaymentCollector>,
    clock: Arc<dyn Clock>,
}

impl InvoiceAggregator {
    pub fn new(
        store: Arc<dyn BillingStore>,
        tax: Arc<dyn TaxCalculator>,
        payments: Arc<dyn PaymentCollector>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            tax,
            payments,
            clock,
        }
    }

    /// Build (or rebuild) the invoice of one subscription period.
    ///
    /// The result depends only on recorded events, rule versions and the
    /// subscription history, so repeated calls produce the same items and
    /// totals. A draft is overwritten; an invoice past draft is compared
    /// and returned unchanged.
    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id(), subscription_id = %subscription_id))]
    pub async fn generate(
        &self,
        ctx: &TenantContext,
        subscription_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Invoice, BillingError> {
        ctx.require_scope(SCOPE_INVOICES_WRITE)?;
        if period_start >= period_end {
            return Err(BillingError::InvalidRequest(format!(
                "period_start {} must be before period_end {}",
                period_start, period_end
            )));
        }

        let subscription = self
            .store
            .get_subscription(ctx, subscription_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Subscription {}", subscription_id)))?;

        let invoice_id =
            Invoice::derive_id(ctx.tenant_id(), subscription_id, period_start, period_end);
        let existing = self.store.get_invoice(ctx, invoice_id).await?;
        let created_at = existing
            .as_ref()
            .map(|i| i.created_at)
            .unwrap_or_else(|| self.clock.now());

        let computed = self
            .compute(ctx, &subscription, period_start, period_end, invoice_id, created_at)
            .await?;
        let tenant = ctx.tenant_id().to_string();

        match existing {
            Some(stored) if !stored.status.is_draft() => {
                if stored.same_content(&computed) {
                    record_invoice_generated(&tenant, "unchanged");
                    return Ok(stored);
                }
                error!(
                    invoice_id = %invoice_id,
                    stored_total = %stored.total,
                    computed_total = %computed.total,
                    "Regenerated invoice differs from the finalized one"
                );
                Err(BillingError::ConsistencyViolation(format!(
                    "invoice {} is {} and its recomputed content differs (stored total {}, computed {})",
                    invoice_id,
                    stored.status.as_str(),
                    stored.total,
                    computed.total
                )))
            }
            existing => {
                let saved = self.store.save_draft(ctx, &computed).await.map_err(|e| match e {
                    AppError::Conflict(_) => BillingError::InvoiceNotDraft(invoice_id),
                    other => BillingError::Store(other),
                })?;
                let result = if existing.is_some() { "regenerated" } else { "created" };
                record_invoice_generated(&tenant, result);
                info!(
                    invoice_id = %saved.invoice_id,
                    total = %saved.total,
                    items = saved.line_items.len(),
                    result = result,
                    "Draft invoice generated"
                );
                Ok(saved)
            }
        }
    }

    /// Move a draft to `open` once its period has closed, and hand it to the
    /// payment collector. The draft is rebuilt first so late events count.
    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id(), invoice_id = %invoice_id))]
    pub async fn finalize(
        &self,
        ctx: &TenantContext,
        invoice_id: Uuid,
    ) -> Result<Invoice, BillingError> {
        ctx.require_scope(SCOPE_INVOICES_WRITE)?;
        let draft = self
            .store
            .get_invoice(ctx, invoice_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Invoice {}", invoice_id)))?;

        if !draft.status.is_draft() {
            return Err(BillingError::InvoiceNotDraft(invoice_id));
        }
        let now = self.clock.now();
        if draft.period_end > now {
            return Err(BillingError::PeriodNotClosed {
                period_end: draft.period_end,
            });
        }

        // Stop admitting usage into the period before the last regeneration so
        // the opened invoice covers every stored event.
        if !self.store.close_period(ctx, invoice_id, now).await? {
            return Err(BillingError::InvoiceNotDraft(invoice_id));
        }
        self.generate(ctx, draft.subscription_id, draft.period_start, draft.period_end)
            .await?;

        let opened = self
            .store
            .mark_open(ctx, invoice_id, now)
            .await?
            .ok_or(BillingError::InvoiceNotDraft(invoice_id))?;

        record_invoice_finalized(
            &ctx.tenant_id().to_string(),
            &opened.currency,
            opened.total.to_f64().unwrap_or_default(),
        );
        info!(total = %opened.total, currency = %opened.currency, "Invoice finalized");

        if let Err(e) = self.payments.invoice_opened(&opened).await {
            warn!(error = %e, "Payment collector did not accept the open invoice");
        }
        Ok(opened)
    }

    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id(), invoice_id = %invoice_id))]
    pub async fn get(&self, ctx: &TenantContext, invoice_id: Uuid) -> Result<Invoice, BillingError> {
        ctx.require_scope(SCOPE_INVOICES_READ)?;
        self.store
            .get_invoice(ctx, invoice_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Invoice {}", invoice_id)))
    }

    async fn compute(
        &self,
        ctx: &TenantContext,
        subscription: &Subscription,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        invoice_id: Uuid,
        created_at: DateTime<Utc>,
    ) -> Result<Invoice, BillingError> {
        let changes = subscription.changes_within(period_start, period_end);
        let opening = opening_config(subscription, &changes, period_start);
        let closing = changes
            .last()
            .map(|c| PlanConfig {
                plan_id: c.new_plan_id,
                quantity: c.new_quantity,
            })
            .unwrap_or(opening);

        let mut plan_ids = vec![opening.plan_id, closing.plan_id];
        for change in &changes {
            plan_ids.push(change.old_plan_id);
            plan_ids.push(change.new_plan_id);
        }
        let plans = self.load_plans(ctx, plan_ids).await?;
        let opening_plan = plans
            .get(&opening.plan_id)
            .ok_or_else(|| BillingError::NotFound(format!("Plan {}", opening.plan_id)))?;
        let currency = opening_plan.currency.clone();
        if let Some(other) = plans.values().find(|p| p.currency != currency) {
            return Err(BillingError::ConsistencyViolation(format!(
                "plan {} bills in {} but the subscription bills in {}",
                other.plan_id, other.currency, currency
            )));
        }

        let mut items = vec![subscription_fee(opening_plan, opening.quantity, &currency)?];

        let events = self
            .store
            .list_period_events(ctx, subscription.subscription_id, period_start, period_end)
            .await?;
        let rules = self
            .usage_rules(ctx, closing.plan_id, &changes, &events, period_end)
            .await?;
        items.extend(price_usage(&rules, &events, &currency)?);

        items.extend(prorate_period(
            subscription,
            period_start,
            period_end,
            &plans,
            &currency,
        )?);

        let adjustments = self
            .store
            .list_adjustments(ctx, subscription.subscription_id, period_start, period_end)
            .await?;
        let positive = checked_sum(
            items
                .iter()
                .map(|i| i.amount)
                .filter(|a| *a > Decimal::ZERO),
        )?;
        let mut running = checked_sum(items.iter().map(|i| i.amount))?;
        for adjustment in &adjustments {
            let (kind, basis, requested) = match adjustment.kind {
                AdjustmentKind::PercentDiscount => (
                    LineItemKind::Discount,
                    PriceBasis::Percent {
                        percent: adjustment.amount,
                    },
                    round_money(
                        checked_mul(positive, adjustment.amount)? / Decimal::ONE_HUNDRED,
                        &currency,
                    ),
                ),
                AdjustmentKind::FixedDiscount => (
                    LineItemKind::Discount,
                    PriceBasis::Fixed,
                    round_money(adjustment.amount, &currency),
                ),
                AdjustmentKind::Credit => (
                    LineItemKind::Credit,
                    PriceBasis::Fixed,
                    round_money(adjustment.amount, &currency),
                ),
            };
            // Discounts never push the subtotal below zero.
            let applied = requested.min(running.max(Decimal::ZERO));
            if applied <= Decimal::ZERO {
                continue;
            }
            running -= applied;
            items.push(LineItem {
                kind,
                description: adjustment.description.clone(),
                metric_name: None,
                quantity: Decimal::ONE,
                price_basis: basis,
                amount: -applied,
            });
        }

        let subtotal = round_money(checked_sum(items.iter().map(|i| i.amount))?, &currency);
        let tax = if subtotal > Decimal::ZERO {
            round_money(
                self.tax
                    .tax_for(ctx.tenant_id(), subtotal, &currency)
                    .await?,
                &currency,
            )
        } else {
            round_money(Decimal::ZERO, &currency)
        };
        let total = checked_add(subtotal, tax)?;

        Ok(Invoice {
            invoice_id,
            tenant_id: ctx.tenant_id(),
            subscription_id: subscription.subscription_id,
            status: InvoiceStatus::Draft,
            currency,
            period_start,
            period_end,
            line_items: items,
            subtotal,
            tax,
            total,
            created_at,
            finalized_at: None,
        })
    }

    /// Rules pricing the period's usage: the closing plan's rules as of
    /// `period_end`, plus, for metrics with usage that plan no longer prices,
    /// the rule of the most recent earlier plan in the period that does.
    async fn usage_rules(
        &self,
        ctx: &TenantContext,
        closing_plan_id: Uuid,
        changes: &[PlanChange],
        events: &[UsageEvent],
        period_end: DateTime<Utc>,
    ) -> Result<Vec<PricingRule>, BillingError> {
        let mut rules = self
            .store
            .rules_as_of(ctx, closing_plan_id, period_end)
            .await?;

        let mut unpriced: BTreeSet<&str> = events.iter().map(|e| e.metric_name.as_str()).collect();
        for rule in &rules {
            unpriced.remove(rule.metric_name.as_str());
        }

        let mut visited = vec![closing_plan_id];
        for change in changes.iter().rev() {
            if unpriced.is_empty() {
                break;
            }
            if visited.contains(&change.old_plan_id) {
                continue;
            }
            visited.push(change.old_plan_id);

            let earlier = self
                .store
                .rules_as_of(ctx, change.old_plan_id, period_end)
                .await?;
            for rule in earlier {
                if unpriced.remove(rule.metric_name.as_str()) {
                    debug!(
                        metric = %rule.metric_name,
                        plan_id = %change.old_plan_id,
                        "Pricing usage with the rule of an earlier plan in the period"
                    );
                    rules.push(rule);
                }
            }
        }
        Ok(rules)
    }

    async fn load_plans(
        &self,
        ctx: &TenantContext,
        mut plan_ids: Vec<Uuid>,
    ) -> Result<HashMap<Uuid, Plan>, BillingError> {
        plan_ids.sort();
        plan_ids.dedup();
        let mut plans = HashMap::with_capacity(plan_ids.len());
        for plan_id in plan_ids {
            let plan = self
                .store
                .get_plan(ctx, plan_id)
                .await?
                .ok_or_else(|| BillingError::NotFound(format!("Plan {}", plan_id)))?;
            plans.insert(plan_id, plan);
        }
        Ok(plans)
    }
}

fn subscription_fee(
    plan: &Plan,
    quantity: Decimal,
    currency: &str,
) -> Result<LineItem, BillingError> {
    Ok(LineItem {
        kind: LineItemKind::SubscriptionFee,
        description: format!("{} subscription x {}", plan.name, quantity),
        metric_name: None,
        quantity,
        price_basis: PriceBasis::UnitPrice {
            unit_price: plan.base_price,
        },
        amount: round_money(plan.fee_for(quantity)?, currency),
    })
}

/// Usage and overage items for every metric the rules price.
///
/// Each metric is priced in one accumulation pass over its events in
/// `(occurred_at, received_at, event_id)` order and rounded once. With an
/// overage price on the rule, units flagged as overage are billed at that
/// price instead of the schedule. Usage for a metric none of `rules` prices
/// aborts the invoice rather than being left off it.
pub fn price_usage(
    rules: &[PricingRule],
    events: &[UsageEvent],
    currency: &str,
) -> Result<Vec<LineItem>, BillingError> {
    let mut by_metric: BTreeMap<&str, Vec<&UsageEvent>> = BTreeMap::new();
    for event in events {
        by_metric.entry(event.metric_name.as_str()).or_default().push(event);
    }

    let mut rules: Vec<&PricingRule> = rules.iter().collect();
    rules.sort_by(|a, b| a.metric_name.cmp(&b.metric_name));

    let mut evaluator = PricingEvaluator::new();
    let mut items = Vec::new();
    for rule in rules {
        let metric_events = by_metric.remove(rule.metric_name.as_str()).unwrap_or_default();
        if metric_events.is_empty() && !rule.model.has_period_fee() {
            continue;
        }

        let mut accumulated = Decimal::ZERO;
        let mut charge = Decimal::ZERO;
        let mut overage = Decimal::ZERO;
        for event in &metric_events {
            let scheduled = match rule.overage_unit_price {
                Some(_) => {
                    overage = checked_add(overage, event.overage_quantity)?;
                    checked_sub(event.quantity, event.overage_quantity)?
                }
                None => event.quantity,
            };
            let priced = evaluator.price(&rule.metric_name, accumulated, scheduled, rule)?;
            charge = checked_add(charge, priced)?;
            accumulated = checked_add(accumulated, scheduled)?;
        }
        if metric_events.is_empty() {
            let fee = evaluator.price(&rule.metric_name, Decimal::ZERO, Decimal::ZERO, rule)?;
            charge = checked_add(charge, fee)?;
        }

        let price_basis = match &rule.model {
            PricingModel::PerUnit { unit_price } => PriceBasis::UnitPrice {
                unit_price: *unit_price,
            },
            model => PriceBasis::Schedule {
                model: model.clone(),
            },
        };
        items.push(LineItem {
            kind: LineItemKind::Usage,
            description: format!(
                "{} ({}, {} {})",
                rule.metric_name,
                rule.pricing_type().as_str(),
                accumulated,
                rule.unit
            ),
            metric_name: Some(rule.metric_name.clone()),
            quantity: accumulated,
            price_basis,
            amount: round_money(charge, currency),
        });

        if let (Some(unit_price), true) = (rule.overage_unit_price, overage > Decimal::ZERO) {
            items.push(LineItem {
                kind: LineItemKind::Overage,
                description: format!("{} overage ({} {})", rule.metric_name, overage, rule.unit),
                metric_name: Some(rule.metric_name.clone()),
                quantity: overage,
                price_basis: PriceBasis::UnitPrice { unit_price },
                amount: round_money(checked_mul(overage, unit_price)?, currency),
            });
        }
    }

    if let Some((metric, unpriced)) = by_metric.iter().next() {
        error!(
            metric = %metric,
            events = unpriced.len(),
            "Usage recorded for a metric no rule in the period prices"
        );
        return Err(BillingError::ConsistencyViolation(format!(
            "{} usage event(s) for metric '{}' have no pricing rule in the period",
            unpriced.len(),
            metric
        )));
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Tier;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn rule(metric: &str, model: PricingModel, overage: Option<Decimal>) -> PricingRule {
        PricingRule {
            rule_id: Uuid::new_v4(),
            tenant_id: Uuid::nil(),
            plan_id: Uuid::nil(),
            metric_name: metric.to_string(),
            version: 1,
            unit: "unit".to_string(),
            model,
            overage_unit_price: overage,
            is_active: true,
            effective_from: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            superseded_at: None,
        }
    }

    fn event(metric: &str, quantity: Decimal, overage: Decimal, minute: u32) -> UsageEvent {
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 0, minute, 0).unwrap();
        UsageEvent {
            event_id: Uuid::new_v4(),
            tenant_id: Uuid::nil(),
            subscription_id: Some(Uuid::nil()),
            metric_name: metric.to_string(),
            quantity,
            overage_quantity: overage,
            unit: "unit".to_string(),
            occurred_at: at,
            received_at: at,
            idempotency_key: format!("{}-{}", metric, minute),
            properties: serde_json::json!({}),
        }
    }

    fn tiers() -> Vec<Tier> {
        vec![
            Tier::bounded(dec!(1000), dec!(0.01)),
            Tier::unbounded(dec!(0.005)),
        ]
    }

    #[test]
    fn test_tiered_and_volume_priced_in_one_pass() {
        let rules = vec![
            rule("requests", PricingModel::Tiered { tiers: tiers() }, None),
            rule("seats", PricingModel::Volume { tiers: tiers() }, None),
        ];
        let events = vec![
            event("requests", dec!(900), dec!(0), 1),
            event("requests", dec!(200), dec!(0), 2),
            event("seats", dec!(900), dec!(0), 1),
            event("seats", dec!(200), dec!(0), 2),
        ];
        let items = price_usage(&rules, &events, "USD").unwrap();
        assert_eq!(items.len(), 2);
        // 900 x 0.01 + 100 x 0.01 + 100 x 0.005
        assert_eq!(items[0].amount, dec!(10.50));
        // all 1100 at 0.005
        assert_eq!(items[1].amount, dec!(5.50));
    }

    #[test]
    fn test_flat_rule_charges_once_even_without_usage() {
        let rules = vec![rule("support", PricingModel::Flat { amount: dec!(49) }, None)];
        let items = price_usage(&rules, &[], "USD").unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].amount, dec!(49.00));

        let events = vec![
            event("support", dec!(1), dec!(0), 1),
            event("support", dec!(1), dec!(0), 2),
        ];
        let items = price_usage(&rules, &events, "USD").unwrap();
        assert_eq!(items[0].amount, dec!(49.00));
    }

    #[test]
    fn test_overage_units_billed_separately() {
        let rules = vec![rule(
            "api_calls",
            PricingModel::PerUnit {
                unit_price: dec!(0.01),
            },
            Some(dec!(0.05)),
        )];
        let events = vec![
            event("api_calls", dec!(80), dec!(0), 1),
            event("api_calls", dec!(40), dec!(20), 2),
        ];
        let items = price_usage(&rules, &events, "USD").unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].quantity, dec!(100));
        assert_eq!(items[0].amount, dec!(1.00));
        assert_eq!(items[1].kind, LineItemKind::Overage);
        assert_eq!(items[1].amount, dec!(1.00));
    }

    #[test]
    fn test_unpriced_usage_aborts_instead_of_dropping() {
        let rules = vec![rule(
            "storage_gb",
            PricingModel::PerUnit {
                unit_price: dec!(0.10),
            },
            None,
        )];
        let events = vec![event("api_calls", dec!(1000), dec!(0), 1)];
        let err = price_usage(&rules, &events, "USD").unwrap_err();
        match err {
            BillingError::ConsistencyViolation(message) => assert!(message.contains("api_calls")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_overflowing_usage_is_an_error() {
        let rules = vec![rule(
            "api_calls",
            PricingModel::PerUnit {
                unit_price: dec!(1000),
            },
            None,
        )];
        let events = vec![
            event("api_calls", Decimal::MAX, dec!(0), 1),
            event("api_calls", dec!(1), dec!(0), 2),
        ];
        assert!(matches!(
            price_usage(&rules, &events, "USD"),
            Err(BillingError::ConsistencyViolation(_))
        ));
    }

    #[test]
    fn test_rounds_once_per_metric() {
        let rules = vec![rule(
            "api_calls",
            PricingModel::PerUnit {
                unit_price: dec!(0.003),
            },
            None,
        )];
        let events: Vec<UsageEvent> = (0..3)
            .map(|m| event("api_calls", dec!(1), dec!(0), m))
            .collect();
        // Per-event rounding would give 0.00 + 0.00 + 0.00.
        let items = price_usage(&rules, &events, "USD").unwrap();
        assert_eq!(items[0].amount, dec!(0.01));
    }
}
