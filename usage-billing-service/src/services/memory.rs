//! In-process billing store for tests and single-node development.

use crate::models::{
    Adjustment, CreatePlan, CreateSubscription, InsertOutcome, Invoice, InvoiceStatus, Plan,
    PlanChange, PricingRule, PublishRule, Subscription, UsageEvent, UsageLimit,
};
use crate::services::clock::Clock;
use crate::services::store::{BillingStore, CatalogStore, InvoiceStore, UsageEventStore};
use crate::services::tenant::TenantContext;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct State {
    events: Vec<UsageEvent>,
    event_keys: HashMap<(Uuid, String), Uuid>,
    plans: HashMap<Uuid, Plan>,
    rules: Vec<PricingRule>,
    subscriptions: HashMap<Uuid, Subscription>,
    limits: HashMap<(Uuid, String), UsageLimit>,
    adjustments: Vec<Adjustment>,
    invoices: HashMap<Uuid, Invoice>,
    usage_closed: HashSet<Uuid>,
}

impl State {
    fn owns_subscription(&self, tenant_id: Uuid, subscription_id: Uuid) -> bool {
        self.subscriptions
            .get(&subscription_id)
            .is_some_and(|s| s.tenant_id == tenant_id)
    }

    fn period_closed(&self, tenant_id: Uuid, subscription_id: Uuid, at: DateTime<Utc>) -> bool {
        self.invoices.values().any(|i| {
            i.tenant_id == tenant_id
                && i.subscription_id == subscription_id
                && (!i.status.is_draft() || self.usage_closed.contains(&i.invoice_id))
                && i.period_start <= at
                && at < i.period_end
        })
    }
}

pub struct InMemoryStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, AppError> {
        self.state
            .lock()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("Store lock poisoned: {}", e)))
    }

    /// Number of stored events across all tenants.
    pub fn event_count(&self) -> usize {
        self.state.lock().map(|s| s.events.len()).unwrap_or(0)
    }
}

#[async_trait]
impl UsageEventStore for InMemoryStore {
    async fn insert_event(
        &self,
        ctx: &TenantContext,
        event: &UsageEvent,
    ) -> Result<InsertOutcome, AppError> {
        if event.tenant_id != ctx.tenant_id() {
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "Event belongs to another tenant"
            )));
        }

        let mut state = self.state()?;
        let key = (event.tenant_id, event.idempotency_key.clone());
        if let Some(existing_id) = state.event_keys.get(&key).copied() {
            let existing = state
                .events
                .iter()
                .find(|e| e.event_id == existing_id)
                .cloned()
                .ok_or_else(|| {
                    AppError::InternalError(anyhow::anyhow!("Idempotency index out of sync"))
                })?;
            return Ok(InsertOutcome::Existing(existing));
        }
        if let Some(subscription_id) = event.subscription_id {
            if state.period_closed(event.tenant_id, subscription_id, event.occurred_at) {
                return Ok(InsertOutcome::PeriodClosed);
            }
        }

        state.event_keys.insert(key, event.event_id);
        state.events.push(event.clone());
        Ok(InsertOutcome::Inserted(event.clone()))
    }

    async fn find_event_by_key(
        &self,
        ctx: &TenantContext,
        idempotency_key: &str,
    ) -> Result<Option<UsageEvent>, AppError> {
        let state = self.state()?;
        let key = (ctx.tenant_id(), idempotency_key.to_string());
        Ok(state
            .event_keys
            .get(&key)
            .and_then(|id| state.events.iter().find(|e| e.event_id == *id))
            .cloned())
    }

    async fn list_period_events(
        &self,
        ctx: &TenantContext,
        subscription_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<UsageEvent>, AppError> {
        let state = self.state()?;
        let mut events: Vec<UsageEvent> = state
            .events
            .iter()
            .filter(|e| {
                e.tenant_id == ctx.tenant_id()
                    && e.subscription_id == Some(subscription_id)
                    && e.occurred_at >= start
                    && e.occurred_at < end
            })
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.occurred_at, e.received_at, e.event_id));
        Ok(events)
    }

    async fn purge_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let mut state = self.state()?;
        let before = state.events.len();
        state.events.retain(|e| e.occurred_at >= cutoff);
        let kept: std::collections::HashSet<Uuid> =
            state.events.iter().map(|e| e.event_id).collect();
        state.event_keys.retain(|_, id| kept.contains(id));
        Ok((before - state.events.len()) as u64)
    }
}

#[async_trait]
impl CatalogStore for InMemoryStore {
    async fn create_plan(
        &self,
        ctx: &TenantContext,
        input: &CreatePlan,
    ) -> Result<Plan, AppError> {
        let plan = Plan {
            plan_id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id(),
            name: input.name.clone(),
            base_price: input.base_price,
            currency: input.currency.clone(),
            is_active: true,
            created_utc: self.clock.now(),
        };
        self.state()?.plans.insert(plan.plan_id, plan.clone());
        Ok(plan)
    }

    async fn get_plan(
        &self,
        ctx: &TenantContext,
        plan_id: Uuid,
    ) -> Result<Option<Plan>, AppError> {
        Ok(self
            .state()?
            .plans
            .get(&plan_id)
            .filter(|p| p.tenant_id == ctx.tenant_id())
            .cloned())
    }

    async fn publish_rule(
        &self,
        ctx: &TenantContext,
        input: &PublishRule,
    ) -> Result<PricingRule, AppError> {
        let mut state = self.state()?;
        if !state
            .plans
            .get(&input.plan_id)
            .is_some_and(|p| p.tenant_id == ctx.tenant_id())
        {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Plan {} not found",
                input.plan_id
            )));
        }

        let mut version = 0;
        for rule in state
            .rules
            .iter_mut()
            .filter(|r| r.plan_id == input.plan_id && r.metric_name == input.metric_name)
        {
            version = version.max(rule.version);
            if rule.is_active {
                rule.is_active = false;
                rule.superseded_at = Some(input.effective_from);
            }
        }

        let rule = PricingRule {
            rule_id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id(),
            plan_id: input.plan_id,
            metric_name: input.metric_name.clone(),
            version: version + 1,
            unit: input.unit.clone(),
            model: input.model.clone(),
            overage_unit_price: input.overage_unit_price,
            is_active: true,
            effective_from: input.effective_from,
            superseded_at: None,
        };
        state.rules.push(rule.clone());
        Ok(rule)
    }

    async fn active_rule(
        &self,
        ctx: &TenantContext,
        plan_id: Uuid,
        metric_name: &str,
    ) -> Result<Option<PricingRule>, AppError> {
        Ok(self
            .state()?
            .rules
            .iter()
            .find(|r| {
                r.tenant_id == ctx.tenant_id()
                    && r.plan_id == plan_id
                    && r.metric_name == metric_name
                    && r.is_active
            })
            .cloned())
    }

    async fn rules_as_of(
        &self,
        ctx: &TenantContext,
        plan_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Vec<PricingRule>, AppError> {
        let state = self.state()?;
        let mut latest: HashMap<&str, &PricingRule> = HashMap::new();
        for rule in state.rules.iter().filter(|r| {
            r.tenant_id == ctx.tenant_id() && r.plan_id == plan_id && r.effective_from <= at
        }) {
            let entry = latest.entry(rule.metric_name.as_str()).or_insert(rule);
            if rule.version > entry.version {
                *entry = rule;
            }
        }
        let mut rules: Vec<PricingRule> = latest.into_values().cloned().collect();
        rules.sort_by(|a, b| a.metric_name.cmp(&b.metric_name));
        Ok(rules)
    }

    async fn create_subscription(
        &self,
        ctx: &TenantContext,
        input: &CreateSubscription,
    ) -> Result<Subscription, AppError> {
        let mut state = self.state()?;
        if !state
            .plans
            .get(&input.plan_id)
            .is_some_and(|p| p.tenant_id == ctx.tenant_id())
        {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Plan {} not found",
                input.plan_id
            )));
        }

        let subscription = Subscription {
            subscription_id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id(),
            plan_id: input.plan_id,
            status: input.status,
            current_period_start: input.current_period_start,
            current_period_end: input.current_period_end,
            quantity: input.quantity,
            plan_changes: Vec::new(),
            created_utc: self.clock.now(),
        };
        state
            .subscriptions
            .insert(subscription.subscription_id, subscription.clone());
        Ok(subscription)
    }

    async fn get_subscription(
        &self,
        ctx: &TenantContext,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        Ok(self
            .state()?
            .subscriptions
            .get(&subscription_id)
            .filter(|s| s.tenant_id == ctx.tenant_id())
            .cloned())
    }

    async fn list_active_subscriptions(
        &self,
        ctx: &TenantContext,
    ) -> Result<Vec<Subscription>, AppError> {
        let state = self.state()?;
        let mut subs: Vec<Subscription> = state
            .subscriptions
            .values()
            .filter(|s| s.tenant_id == ctx.tenant_id() && s.status.accepts_usage())
            .cloned()
            .collect();
        subs.sort_by_key(|s| (s.created_utc, s.subscription_id));
        Ok(subs)
    }

    async fn record_plan_change(
        &self,
        ctx: &TenantContext,
        change: &PlanChange,
    ) -> Result<Subscription, AppError> {
        let mut state = self.state()?;
        let subscription = state
            .subscriptions
            .get_mut(&change.subscription_id)
            .filter(|s| s.tenant_id == ctx.tenant_id())
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "Subscription {} not found",
                    change.subscription_id
                ))
            })?;

        subscription.plan_changes.push(change.clone());
        subscription.plan_id = change.new_plan_id;
        subscription.quantity = change.new_quantity;
        Ok(subscription.clone())
    }

    async fn set_usage_limit(
        &self,
        ctx: &TenantContext,
        limit: &UsageLimit,
    ) -> Result<UsageLimit, AppError> {
        let mut state = self.state()?;
        if !state.owns_subscription(ctx.tenant_id(), limit.subscription_id) {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Subscription {} not found",
                limit.subscription_id
            )));
        }
        state.limits.insert(
            (limit.subscription_id, limit.metric_name.clone()),
            limit.clone(),
        );
        Ok(limit.clone())
    }

    async fn get_usage_limit(
        &self,
        ctx: &TenantContext,
        subscription_id: Uuid,
        metric_name: &str,
    ) -> Result<Option<UsageLimit>, AppError> {
        let state = self.state()?;
        if !state.owns_subscription(ctx.tenant_id(), subscription_id) {
            return Ok(None);
        }
        Ok(state
            .limits
            .get(&(subscription_id, metric_name.to_string()))
            .cloned())
    }

    async fn add_adjustment(
        &self,
        ctx: &TenantContext,
        adjustment: &Adjustment,
    ) -> Result<Adjustment, AppError> {
        let mut state = self.state()?;
        if adjustment.tenant_id != ctx.tenant_id()
            || !state.owns_subscription(ctx.tenant_id(), adjustment.subscription_id)
        {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Subscription {} not found",
                adjustment.subscription_id
            )));
        }
        state.adjustments.push(adjustment.clone());
        Ok(adjustment.clone())
    }

    async fn list_adjustments(
        &self,
        ctx: &TenantContext,
        subscription_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Adjustment>, AppError> {
        Ok(self
            .state()?
            .adjustments
            .iter()
            .filter(|a| {
                a.tenant_id == ctx.tenant_id()
                    && a.subscription_id == subscription_id
                    && a.period_start < end
                    && a.period_end > start
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl InvoiceStore for InMemoryStore {
    async fn get_invoice(
        &self,
        ctx: &TenantContext,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, AppError> {
        Ok(self
            .state()?
            .invoices
            .get(&invoice_id)
            .filter(|i| i.tenant_id == ctx.tenant_id())
            .cloned())
    }

    async fn save_draft(
        &self,
        ctx: &TenantContext,
        invoice: &Invoice,
    ) -> Result<Invoice, AppError> {
        if invoice.tenant_id != ctx.tenant_id() || !invoice.status.is_draft() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Only drafts of the caller's tenant can be saved"
            )));
        }

        let mut state = self.state()?;
        if let Some(existing) = state.invoices.get(&invoice.invoice_id) {
            if existing.tenant_id != ctx.tenant_id() || !existing.status.is_draft() {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Invoice {} is no longer a draft",
                    invoice.invoice_id
                )));
            }
        }
        state.invoices.insert(invoice.invoice_id, invoice.clone());
        Ok(invoice.clone())
    }

    async fn mark_open(
        &self,
        ctx: &TenantContext,
        invoice_id: Uuid,
        finalized_at: DateTime<Utc>,
    ) -> Result<Option<Invoice>, AppError> {
        let mut state = self.state()?;
        match state.invoices.get_mut(&invoice_id) {
            Some(invoice) if invoice.tenant_id == ctx.tenant_id() && invoice.status.is_draft() => {
                invoice.status = InvoiceStatus::Open;
                invoice.finalized_at = Some(finalized_at);
                Ok(Some(invoice.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn close_period(
        &self,
        ctx: &TenantContext,
        invoice_id: Uuid,
        _closed_at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut state = self.state()?;
        let open_draft = state
            .invoices
            .get(&invoice_id)
            .is_some_and(|i| i.tenant_id == ctx.tenant_id() && i.status.is_draft());
        if open_draft {
            state.usage_closed.insert(invoice_id);
        }
        Ok(open_draft)
    }

    async fn is_period_closed(
        &self,
        ctx: &TenantContext,
        subscription_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        Ok(self
            .state()?
            .period_closed(ctx.tenant_id(), subscription_id, at))
    }
}

#[async_trait]
impl BillingStore for InMemoryStore {
    async fn health_check(&self) -> Result<(), AppError> {
        self.state().map(|_| ())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::SystemClock;
    use rust_decimal_macros::dec;

    fn store() -> InMemoryStore {
        InMemoryStore::new(Arc::new(SystemClock))
    }

    fn event(tenant_id: Uuid, key: &str) -> UsageEvent {
        let now = Utc::now();
        UsageEvent {
            event_id: Uuid::new_v4(),
            tenant_id,
            subscription_id: None,
            metric_name: "api_calls".to_string(),
            quantity: dec!(1),
            overage_quantity: dec!(0),
            unit: "call".to_string(),
            occurred_at: now,
            received_at: now,
            idempotency_key: key.to_string(),
            properties: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_insert_is_idempotent_per_tenant_key() {
        let store = store();
        let tenant = Uuid::new_v4();
        let ctx = TenantContext::for_tenant(tenant, &[]);

        let first = store.insert_event(&ctx, &event(tenant, "k1")).await.unwrap();
        let second = store.insert_event(&ctx, &event(tenant, "k1")).await.unwrap();

        assert!(matches!(first, InsertOutcome::Inserted(_)));
        match second {
            InsertOutcome::Existing(e) => assert_eq!(Some(&e), first.event()),
            other => panic!("expected existing, got {:?}", other),
        }
        assert_eq!(store.event_count(), 1);
    }

    #[tokio::test]
    async fn test_same_key_different_tenants_are_independent() {
        let store = store();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let ctx_a = TenantContext::for_tenant(a, &[]);
        let ctx_b = TenantContext::for_tenant(b, &[]);

        store.insert_event(&ctx_a, &event(a, "shared")).await.unwrap();
        store.insert_event(&ctx_b, &event(b, "shared")).await.unwrap();

        assert_eq!(store.event_count(), 2);
        let found = store.find_event_by_key(&ctx_b, "shared").await.unwrap().unwrap();
        assert_eq!(found.tenant_id, b);
    }

    #[tokio::test]
    async fn test_publish_rule_supersedes_previous_version() {
        let store = store();
        let ctx = TenantContext::for_tenant(Uuid::new_v4(), &[]);
        let plan = store
            .create_plan(
                &ctx,
                &CreatePlan {
                    name: "Starter".to_string(),
                    base_price: dec!(10),
                    currency: "USD".to_string(),
                },
            )
            .await
            .unwrap();

        let t0 = Utc::now();
        let publish = |price, effective_from| PublishRule {
            plan_id: plan.plan_id,
            metric_name: "api_calls".to_string(),
            unit: "call".to_string(),
            model: crate::models::PricingModel::PerUnit { unit_price: price },
            overage_unit_price: None,
            effective_from,
        };
        let v1 = store.publish_rule(&ctx, &publish(dec!(0.01), t0)).await.unwrap();
        let t1 = t0 + chrono::Duration::days(3);
        let v2 = store.publish_rule(&ctx, &publish(dec!(0.02), t1)).await.unwrap();

        assert_eq!(v2.version, 2);
        let active = store
            .active_rule(&ctx, plan.plan_id, "api_calls")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.rule_id, v2.rule_id);

        let as_of_t0 = store.rules_as_of(&ctx, plan.plan_id, t0).await.unwrap();
        assert_eq!(as_of_t0.len(), 1);
        assert_eq!(as_of_t0[0].rule_id, v1.rule_id);
        assert_eq!(as_of_t0[0].superseded_at, Some(t1));
    }

    #[tokio::test]
    async fn test_insert_refused_once_period_is_closed_for_usage() {
        let store = store();
        let tenant = Uuid::new_v4();
        let ctx = TenantContext::for_tenant(tenant, &[]);
        let subscription_id = Uuid::new_v4();
        let period_end = Utc::now();
        let period_start = period_end - chrono::Duration::days(30);
        let draft = Invoice {
            invoice_id: Uuid::new_v4(),
            tenant_id: tenant,
            subscription_id,
            status: InvoiceStatus::Draft,
            currency: "USD".to_string(),
            period_start,
            period_end,
            line_items: vec![],
            subtotal: dec!(0),
            tax: dec!(0),
            total: dec!(0),
            created_at: period_end,
            finalized_at: None,
        };
        store.save_draft(&ctx, &draft).await.unwrap();

        let in_period = |key: &str| UsageEvent {
            subscription_id: Some(subscription_id),
            occurred_at: period_start + chrono::Duration::days(1),
            ..event(tenant, key)
        };
        let before = store.insert_event(&ctx, &in_period("early")).await.unwrap();
        assert!(matches!(before, InsertOutcome::Inserted(_)));

        assert!(store.close_period(&ctx, draft.invoice_id, period_end).await.unwrap());
        let late = store.insert_event(&ctx, &in_period("late")).await.unwrap();
        assert!(matches!(late, InsertOutcome::PeriodClosed));
        assert!(store
            .is_period_closed(&ctx, subscription_id, period_start)
            .await
            .unwrap());

        // The next period is unaffected.
        let next = UsageEvent {
            subscription_id: Some(subscription_id),
            occurred_at: period_end,
            ..event(tenant, "next")
        };
        let next = store.insert_event(&ctx, &next).await.unwrap();
        assert!(matches!(next, InsertOutcome::Inserted(_)));
        assert_eq!(store.event_count(), 2);

        // An opened invoice cannot be closed again, and stays closed.
        store.mark_open(&ctx, draft.invoice_id, period_end).await.unwrap();
        assert!(!store.close_period(&ctx, draft.invoice_id, period_end).await.unwrap());
        let after_open = store.insert_event(&ctx, &in_period("after_open")).await.unwrap();
        assert!(matches!(after_open, InsertOutcome::PeriodClosed));
    }
}
