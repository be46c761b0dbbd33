//! Persistence interfaces.
//!
//! Every tenant-facing operation takes the caller's [`TenantContext`] and is
//! scoped to its tenant; rows belonging to other tenants are invisible.

use crate::models::{
    Adjustment, CreatePlan, CreateSubscription, InsertOutcome, Invoice, Plan, PlanChange,
    PricingRule, PublishRule, Subscription, UsageEvent, UsageLimit,
};
use crate::services::tenant::TenantContext;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use uuid::Uuid;

/// Append-only usage event log.
#[async_trait]
pub trait UsageEventStore: Send + Sync {
    /// Insert `event` unless `(tenant_id, idempotency_key)` already exists,
    /// in which case the stored event is returned unchanged. An event whose
    /// `occurred_at` falls in a closed period of its subscription is not
    /// written; the check and the write happen atomically.
    async fn insert_event(
        &self,
        ctx: &TenantContext,
        event: &UsageEvent,
    ) -> Result<InsertOutcome, AppError>;

    async fn find_event_by_key(
        &self,
        ctx: &TenantContext,
        idempotency_key: &str,
    ) -> Result<Option<UsageEvent>, AppError>;

    /// Events of a subscription with `occurred_at` in `[start, end)`, ordered
    /// by `(occurred_at, received_at, event_id)`.
    async fn list_period_events(
        &self,
        ctx: &TenantContext,
        subscription_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<UsageEvent>, AppError>;

    /// Retention sweep across all tenants. Returns the number of deleted events.
    async fn purge_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError>;
}

/// Plans, versioned pricing rules, subscriptions, limits and adjustments.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn create_plan(&self, ctx: &TenantContext, input: &CreatePlan)
        -> Result<Plan, AppError>;

    async fn get_plan(&self, ctx: &TenantContext, plan_id: Uuid)
        -> Result<Option<Plan>, AppError>;

    /// Store `input` as the next version for its `(plan_id, metric_name)`,
    /// superseding the active one. Old versions are kept.
    async fn publish_rule(
        &self,
        ctx: &TenantContext,
        input: &PublishRule,
    ) -> Result<PricingRule, AppError>;

    async fn active_rule(
        &self,
        ctx: &TenantContext,
        plan_id: Uuid,
        metric_name: &str,
    ) -> Result<Option<PricingRule>, AppError>;

    /// For each metric of the plan, the latest version effective at `at`.
    async fn rules_as_of(
        &self,
        ctx: &TenantContext,
        plan_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Vec<PricingRule>, AppError>;

    async fn create_subscription(
        &self,
        ctx: &TenantContext,
        input: &CreateSubscription,
    ) -> Result<Subscription, AppError>;

    async fn get_subscription(
        &self,
        ctx: &TenantContext,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError>;

    /// Subscriptions still metering usage, oldest first.
    async fn list_active_subscriptions(
        &self,
        ctx: &TenantContext,
    ) -> Result<Vec<Subscription>, AppError>;

    /// Append `change` to the history and move the subscription to its new side.
    async fn record_plan_change(
        &self,
        ctx: &TenantContext,
        change: &PlanChange,
    ) -> Result<Subscription, AppError>;

    async fn set_usage_limit(
        &self,
        ctx: &TenantContext,
        limit: &UsageLimit,
    ) -> Result<UsageLimit, AppError>;

    async fn get_usage_limit(
        &self,
        ctx: &TenantContext,
        subscription_id: Uuid,
        metric_name: &str,
    ) -> Result<Option<UsageLimit>, AppError>;

    async fn add_adjustment(
        &self,
        ctx: &TenantContext,
        adjustment: &Adjustment,
    ) -> Result<Adjustment, AppError>;

    /// Adjustments whose period overlaps `[start, end)`, in creation order.
    async fn list_adjustments(
        &self,
        ctx: &TenantContext,
        subscription_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Adjustment>, AppError>;
}

/// Invoices and their line items.
#[async_trait]
pub trait InvoiceStore: Send + Sync {
    async fn get_invoice(
        &self,
        ctx: &TenantContext,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, AppError>;

    /// Write `invoice` with all items and totals in one step, replacing an
    /// existing draft. Fails with `Conflict` if the stored invoice is no
    /// longer a draft.
    async fn save_draft(&self, ctx: &TenantContext, invoice: &Invoice)
        -> Result<Invoice, AppError>;

    /// Atomically move a draft to `open`. Returns `None` if the invoice is
    /// missing or not a draft.
    async fn mark_open(
        &self,
        ctx: &TenantContext,
        invoice_id: Uuid,
        finalized_at: DateTime<Utc>,
    ) -> Result<Option<Invoice>, AppError>;

    /// Refuse further usage inside the draft's period. Events already stored
    /// stay; inserts racing this call either land before it or see the period
    /// closed. Returns `false` if the invoice is missing or not a draft.
    async fn close_period(
        &self,
        ctx: &TenantContext,
        invoice_id: Uuid,
        closed_at: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    /// Whether `at` falls inside a period of the subscription that is already
    /// invoiced beyond draft or is being finalized.
    async fn is_period_closed(
        &self,
        ctx: &TenantContext,
        subscription_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, AppError>;
}

/// Everything the engine persists durably.
#[async_trait]
pub trait BillingStore: UsageEventStore + CatalogStore + InvoiceStore {
    async fn health_check(&self) -> Result<(), AppError>;

    fn backend(&self) -> &'static str;
}
