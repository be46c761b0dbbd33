//! Plan configuration: plans, rule versions, subscriptions, plan changes,
//! usage limits and adjustments.

use crate::error::BillingError;
use crate::models::{
    Adjustment, CreatePlan, CreateSubscription, Plan, PlanChange, PricingRule, PublishRule,
    RecordPlanChange, Subscription, UsageLimit,
};
use crate::services::clock::Clock;
use crate::services::money::is_currency_code;
use crate::services::pricing::validate_rule;
use crate::services::store::BillingStore;
use crate::services::tenant::{TenantContext, SCOPE_PLANS_WRITE};
use chrono::SubsecRound;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

pub struct CatalogService {
    store: Arc<dyn BillingStore>,
    clock: Arc<dyn Clock>,
}

impl CatalogService {
    pub fn new(store: Arc<dyn BillingStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    #[instrument(skip(self, ctx, input), fields(tenant_id = %ctx.tenant_id()))]
    pub async fn create_plan(
        &self,
        ctx: &TenantContext,
        input: CreatePlan,
    ) -> Result<Plan, BillingError> {
        ctx.require_scope(SCOPE_PLANS_WRITE)?;
        if !is_currency_code(&input.currency) {
            return Err(BillingError::InvalidRequest(format!(
                "currency '{}' is not an ISO 4217 code",
                input.currency
            )));
        }
        if input.base_price < Decimal::ZERO {
            return Err(BillingError::InvalidRequest(
                "base_price must be >= 0".to_string(),
            ));
        }
        Ok(self.store.create_plan(ctx, &input).await?)
    }

    /// Validate and publish the next rule version for a plan metric. The
    /// previous version is superseded, never overwritten.
    #[instrument(skip(self, ctx, input), fields(tenant_id = %ctx.tenant_id(), plan_id = %input.plan_id, metric = %input.metric_name))]
    pub async fn publish_rule(
        &self,
        ctx: &TenantContext,
        input: PublishRule,
    ) -> Result<PricingRule, BillingError> {
        ctx.require_scope(SCOPE_PLANS_WRITE)?;
        validate_rule(&input)?;
        let rule = self.store.publish_rule(ctx, &input).await?;
        info!(rule_id = %rule.rule_id, version = rule.version, "Rule version published");
        Ok(rule)
    }

    #[instrument(skip(self, ctx, input), fields(tenant_id = %ctx.tenant_id(), plan_id = %input.plan_id))]
    pub async fn create_subscription(
        &self,
        ctx: &TenantContext,
        mut input: CreateSubscription,
    ) -> Result<Subscription, BillingError> {
        ctx.require_scope(SCOPE_PLANS_WRITE)?;
        // Proration measures whole seconds.
        input.current_period_start = input.current_period_start.trunc_subsecs(0);
        input.current_period_end = input.current_period_end.trunc_subsecs(0);
        if input.current_period_start >= input.current_period_end {
            return Err(BillingError::InvalidRequest(
                "current_period_start must be before current_period_end".to_string(),
            ));
        }
        if input.quantity <= Decimal::ZERO {
            return Err(BillingError::InvalidRequest(
                "quantity must be > 0".to_string(),
            ));
        }
        Ok(self.store.create_subscription(ctx, &input).await?)
    }

    /// Record a plan or quantity change. Changes must fall inside the
    /// current period and arrive in `effective_at` order.
    #[instrument(skip(self, ctx, input), fields(tenant_id = %ctx.tenant_id(), subscription_id = %input.subscription_id))]
    pub async fn record_plan_change(
        &self,
        ctx: &TenantContext,
        mut input: RecordPlanChange,
    ) -> Result<Subscription, BillingError> {
        ctx.require_scope(SCOPE_PLANS_WRITE)?;
        input.effective_at = input.effective_at.trunc_subsecs(0);
        if input.new_quantity <= Decimal::ZERO {
            return Err(BillingError::InvalidRequest(
                "new_quantity must be > 0".to_string(),
            ));
        }

        let subscription = self
            .store
            .get_subscription(ctx, input.subscription_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("Subscription {}", input.subscription_id))
            })?;

        let period_start = subscription.current_period_start;
        let period_end = subscription.current_period_end;
        let last_effective = subscription.plan_changes.iter().map(|c| c.effective_at).max();
        if input.effective_at < period_start
            || input.effective_at >= period_end
            || last_effective.is_some_and(|last| input.effective_at < last)
        {
            return Err(BillingError::OutOfOrderPlanChange {
                effective_at: input.effective_at,
                period_start,
                period_end,
            });
        }

        if self
            .store
            .get_plan(ctx, input.new_plan_id)
            .await?
            .is_none()
        {
            return Err(BillingError::NotFound(format!("Plan {}", input.new_plan_id)));
        }

        if self
            .store
            .is_period_closed(ctx, subscription.subscription_id, input.effective_at)
            .await?
        {
            return Err(BillingError::PeriodClosed {
                metric_name: "subscription".to_string(),
                occurred_at: input.effective_at,
            });
        }

        // Changes are appended in order, so the current side is the one in
        // force at `effective_at`.
        let change = PlanChange {
            change_id: Uuid::new_v4(),
            subscription_id: subscription.subscription_id,
            effective_at: input.effective_at,
            old_plan_id: subscription.plan_id,
            old_quantity: subscription.quantity,
            new_plan_id: input.new_plan_id,
            new_quantity: input.new_quantity,
            recorded_at: self.clock.now(),
        };
        let updated = self.store.record_plan_change(ctx, &change).await?;
        info!(
            change_id = %change.change_id,
            old_plan_id = %change.old_plan_id,
            new_plan_id = %change.new_plan_id,
            "Plan change recorded"
        );
        Ok(updated)
    }

    #[instrument(skip(self, ctx, limit), fields(tenant_id = %ctx.tenant_id(), subscription_id = %limit.subscription_id))]
    pub async fn set_usage_limit(
        &self,
        ctx: &TenantContext,
        limit: UsageLimit,
    ) -> Result<UsageLimit, BillingError> {
        ctx.require_scope(SCOPE_PLANS_WRITE)?;
        if limit.limit_value < Decimal::ZERO {
            return Err(BillingError::InvalidRequest(
                "limit_value must be >= 0".to_string(),
            ));
        }
        Ok(self.store.set_usage_limit(ctx, &limit).await?)
    }

    #[instrument(skip(self, ctx, adjustment), fields(tenant_id = %ctx.tenant_id(), subscription_id = %adjustment.subscription_id))]
    pub async fn add_adjustment(
        &self,
        ctx: &TenantContext,
        adjustment: Adjustment,
    ) -> Result<Adjustment, BillingError> {
        ctx.require_scope(SCOPE_PLANS_WRITE)?;
        if adjustment.amount < Decimal::ZERO {
            return Err(BillingError::InvalidRequest(
                "adjustment amount must be >= 0".to_string(),
            ));
        }
        if adjustment.period_start >= adjustment.period_end {
            return Err(BillingError::InvalidRequest(
                "adjustment period_start must be before period_end".to_string(),
            ));
        }
        Ok(self.store.add_adjustment(ctx, &adjustment).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PricingModel, SubscriptionStatus, Tier};
    use crate::services::clock::ManualClock;
    use crate::services::memory::InMemoryStore;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    async fn setup() -> (CatalogService, TenantContext, Plan, Plan, Subscription) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 4, 10, 0, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryStore::new(clock.clone()));
        let catalog = CatalogService::new(store, clock);
        let ctx = TenantContext::for_tenant(Uuid::new_v4(), &[SCOPE_PLANS_WRITE]);

        let basic = catalog
            .create_plan(
                &ctx,
                CreatePlan {
                    name: "Basic".to_string(),
                    base_price: dec!(30),
                    currency: "USD".to_string(),
                },
            )
            .await
            .unwrap();
        let pro = catalog
            .create_plan(
                &ctx,
                CreatePlan {
                    name: "Pro".to_string(),
                    base_price: dec!(90),
                    currency: "USD".to_string(),
                },
            )
            .await
            .unwrap();
        let subscription = catalog
            .create_subscription(
                &ctx,
                CreateSubscription {
                    plan_id: basic.plan_id,
                    status: SubscriptionStatus::Active,
                    current_period_start: Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap(),
                    current_period_end: Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap(),
                    quantity: dec!(1),
                },
            )
            .await
            .unwrap();
        (catalog, ctx, basic, pro, subscription)
    }

    #[tokio::test]
    async fn test_plan_change_outside_period_rejected() {
        let (catalog, ctx, _, pro, subscription) = setup().await;
        let err = catalog
            .record_plan_change(
                &ctx,
                RecordPlanChange {
                    subscription_id: subscription.subscription_id,
                    effective_at: Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap(),
                    new_plan_id: pro.plan_id,
                    new_quantity: dec!(1),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::OutOfOrderPlanChange { .. }));
    }

    #[tokio::test]
    async fn test_plan_change_records_old_side() {
        let (catalog, ctx, basic, pro, subscription) = setup().await;
        let updated = catalog
            .record_plan_change(
                &ctx,
                RecordPlanChange {
                    subscription_id: subscription.subscription_id,
                    effective_at: Utc.with_ymd_and_hms(2026, 4, 16, 0, 0, 0).unwrap(),
                    new_plan_id: pro.plan_id,
                    new_quantity: dec!(2),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.plan_id, pro.plan_id);
        assert_eq!(updated.plan_changes.len(), 1);
        assert_eq!(updated.plan_changes[0].old_plan_id, basic.plan_id);

        // An earlier change after a later one is out of order.
        let err = catalog
            .record_plan_change(
                &ctx,
                RecordPlanChange {
                    subscription_id: subscription.subscription_id,
                    effective_at: Utc.with_ymd_and_hms(2026, 4, 5, 0, 0, 0).unwrap(),
                    new_plan_id: basic.plan_id,
                    new_quantity: dec!(1),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::OutOfOrderPlanChange { .. }));
    }

    #[tokio::test]
    async fn test_plan_change_times_are_whole_seconds() {
        let (catalog, ctx, _, pro, subscription) = setup().await;
        let effective_at = Utc.with_ymd_and_hms(2026, 4, 16, 0, 0, 0).unwrap();
        let updated = catalog
            .record_plan_change(
                &ctx,
                RecordPlanChange {
                    subscription_id: subscription.subscription_id,
                    effective_at: effective_at + chrono::Duration::milliseconds(500),
                    new_plan_id: pro.plan_id,
                    new_quantity: dec!(1),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.plan_changes[0].effective_at, effective_at);

        let created = catalog
            .create_subscription(
                &ctx,
                CreateSubscription {
                    plan_id: pro.plan_id,
                    status: SubscriptionStatus::Active,
                    current_period_start: Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap()
                        + chrono::Duration::milliseconds(250),
                    current_period_end: Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap(),
                    quantity: dec!(1),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            created.current_period_start,
            Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_invalid_rule_rejected_at_publish() {
        let (catalog, ctx, basic, _, _) = setup().await;
        let err = catalog
            .publish_rule(
                &ctx,
                PublishRule {
                    plan_id: basic.plan_id,
                    metric_name: "api_calls".to_string(),
                    unit: "call".to_string(),
                    model: PricingModel::Tiered {
                        tiers: vec![
                            Tier::bounded(dec!(1000), dec!(0.01)),
                            Tier::bounded(dec!(500), dec!(0.005)),
                        ],
                    },
                    overage_unit_price: None,
                    effective_from: Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidRule { .. }));
    }

    #[tokio::test]
    async fn test_plans_write_scope_required() {
        let (catalog, ctx, _, _, _) = setup().await;
        let reader = TenantContext::for_tenant(ctx.tenant_id(), &["invoices:read"]);
        let err = catalog
            .create_plan(
                &reader,
                CreatePlan {
                    name: "Nope".to_string(),
                    base_price: dec!(1),
                    currency: "USD".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Forbidden(_)));
    }
}
