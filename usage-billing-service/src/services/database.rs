//! Database service for usage-billing-service.

use crate::models::{
    Adjustment, AdjustmentKind, CreatePlan, CreateSubscription, InsertOutcome, Invoice,
    InvoiceStatus, LimitAction, LimitPeriod, LineItem, LineItemKind, Plan, PlanChange,
    PriceBasis, PricingModel, PricingRule, PublishRule, Subscription, SubscriptionStatus,
    UsageEvent, UsageLimit,
};
use crate::services::clock::Clock;
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{BillingStore, CatalogStore, InvoiceStore, UsageEventStore};
use crate::services::tenant::TenantContext;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument};
use uuid::Uuid;

const EVENT_COLUMNS: &str = "event_id, tenant_id, subscription_id, metric_name, quantity, overage_quantity, unit, occurred_at, received_at, idempotency_key, properties";
const RULE_COLUMNS: &str = "rule_id, tenant_id, plan_id, metric_name, version, unit, model, overage_unit_price, is_active, effective_from, superseded_at";
const SUBSCRIPTION_COLUMNS: &str = "subscription_id, tenant_id, plan_id, status, current_period_start, current_period_end, quantity, created_utc";
const INVOICE_COLUMNS: &str = "invoice_id, tenant_id, subscription_id, status, currency, period_start, period_end, subtotal, tax, total, created_at, finalized_at";

#[derive(FromRow)]
struct EventRow {
    event_id: Uuid,
    tenant_id: Uuid,
    subscription_id: Option<Uuid>,
    metric_name: String,
    quantity: Decimal,
    overage_quantity: Decimal,
    unit: String,
    occurred_at: DateTime<Utc>,
    received_at: DateTime<Utc>,
    idempotency_key: String,
    properties: serde_json::Value,
}

impl From<EventRow> for UsageEvent {
    fn from(row: EventRow) -> Self {
        UsageEvent {
            event_id: row.event_id,
            tenant_id: row.tenant_id,
            subscription_id: row.subscription_id,
            metric_name: row.metric_name,
            quantity: row.quantity,
            overage_quantity: row.overage_quantity,
            unit: row.unit,
            occurred_at: row.occurred_at,
            received_at: row.received_at,
            idempotency_key: row.idempotency_key,
            properties: row.properties,
        }
    }
}

#[derive(FromRow)]
struct PlanRow {
    plan_id: Uuid,
    tenant_id: Uuid,
    name: String,
    base_price: Decimal,
    currency: String,
    is_active: bool,
    created_utc: DateTime<Utc>,
}

impl From<PlanRow> for Plan {
    fn from(row: PlanRow) -> Self {
        Plan {
            plan_id: row.plan_id,
            tenant_id: row.tenant_id,
            name: row.name,
            base_price: row.base_price,
            currency: row.currency,
            is_active: row.is_active,
            created_utc: row.created_utc,
        }
    }
}

#[derive(FromRow)]
struct RuleRow {
    rule_id: Uuid,
    tenant_id: Uuid,
    plan_id: Uuid,
    metric_name: String,
    version: i32,
    unit: String,
    model: Json<PricingModel>,
    overage_unit_price: Option<Decimal>,
    is_active: bool,
    effective_from: DateTime<Utc>,
    superseded_at: Option<DateTime<Utc>>,
}

impl From<RuleRow> for PricingRule {
    fn from(row: RuleRow) -> Self {
        PricingRule {
            rule_id: row.rule_id,
            tenant_id: row.tenant_id,
            plan_id: row.plan_id,
            metric_name: row.metric_name,
            version: row.version,
            unit: row.unit,
            model: row.model.0,
            overage_unit_price: row.overage_unit_price,
            is_active: row.is_active,
            effective_from: row.effective_from,
            superseded_at: row.superseded_at,
        }
    }
}

/// Parse a stored enum column. An unrecognized value means the row was
/// written by something this build does not understand; refuse to guess.
fn decode<T>(column: &str, value: &str, parse: fn(&str) -> Option<T>) -> Result<T, AppError> {
    parse(value).ok_or_else(|| {
        error!(column = column, value = value, "Unknown value in stored row");
        AppError::DatabaseError(anyhow::anyhow!("Unknown {} '{}' in stored row", column, value))
    })
}

#[derive(FromRow)]
struct SubscriptionRow {
    subscription_id: Uuid,
    tenant_id: Uuid,
    plan_id: Uuid,
    status: String,
    current_period_start: DateTime<Utc>,
    current_period_end: DateTime<Utc>,
    quantity: Decimal,
    created_utc: DateTime<Utc>,
}

impl SubscriptionRow {
    fn with_changes(self, plan_changes: Vec<PlanChange>) -> Result<Subscription, AppError> {
        Ok(Subscription {
            subscription_id: self.subscription_id,
            tenant_id: self.tenant_id,
            plan_id: self.plan_id,
            status: decode("subscription status", &self.status, SubscriptionStatus::from_string)?,
            current_period_start: self.current_period_start,
            current_period_end: self.current_period_end,
            quantity: self.quantity,
            plan_changes,
            created_utc: self.created_utc,
        })
    }
}

#[derive(FromRow)]
struct PlanChangeRow {
    change_id: Uuid,
    subscription_id: Uuid,
    effective_at: DateTime<Utc>,
    old_plan_id: Uuid,
    old_quantity: Decimal,
    new_plan_id: Uuid,
    new_quantity: Decimal,
    recorded_at: DateTime<Utc>,
}

impl From<PlanChangeRow> for PlanChange {
    fn from(row: PlanChangeRow) -> Self {
        PlanChange {
            change_id: row.change_id,
            subscription_id: row.subscription_id,
            effective_at: row.effective_at,
            old_plan_id: row.old_plan_id,
            old_quantity: row.old_quantity,
            new_plan_id: row.new_plan_id,
            new_quantity: row.new_quantity,
            recorded_at: row.recorded_at,
        }
    }
}

#[derive(FromRow)]
struct LimitRow {
    subscription_id: Uuid,
    metric_name: String,
    limit_value: Decimal,
    period: String,
    action_on_exceed: String,
}

impl TryFrom<LimitRow> for UsageLimit {
    type Error = AppError;

    fn try_from(row: LimitRow) -> Result<Self, AppError> {
        Ok(UsageLimit {
            subscription_id: row.subscription_id,
            metric_name: row.metric_name,
            limit_value: row.limit_value,
            period: decode("limit period", &row.period, LimitPeriod::from_string)?,
            action_on_exceed: decode(
                "limit action",
                &row.action_on_exceed,
                LimitAction::from_string,
            )?,
        })
    }
}

#[derive(FromRow)]
struct AdjustmentRow {
    adjustment_id: Uuid,
    tenant_id: Uuid,
    subscription_id: Uuid,
    kind: String,
    amount: Decimal,
    description: String,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
}

impl TryFrom<AdjustmentRow> for Adjustment {
    type Error = AppError;

    fn try_from(row: AdjustmentRow) -> Result<Self, AppError> {
        Ok(Adjustment {
            adjustment_id: row.adjustment_id,
            tenant_id: row.tenant_id,
            subscription_id: row.subscription_id,
            kind: decode("adjustment kind", &row.kind, AdjustmentKind::from_string)?,
            amount: row.amount,
            description: row.description,
            period_start: row.period_start,
            period_end: row.period_end,
        })
    }
}

#[derive(FromRow)]
struct InvoiceRow {
    invoice_id: Uuid,
    tenant_id: Uuid,
    subscription_id: Uuid,
    status: String,
    currency: String,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    subtotal: Decimal,
    tax: Decimal,
    total: Decimal,
    created_at: DateTime<Utc>,
    finalized_at: Option<DateTime<Utc>>,
}

impl InvoiceRow {
    fn with_items(self, line_items: Vec<LineItem>) -> Result<Invoice, AppError> {
        Ok(Invoice {
            invoice_id: self.invoice_id,
            tenant_id: self.tenant_id,
            subscription_id: self.subscription_id,
            status: decode("invoice status", &self.status, InvoiceStatus::from_string)?,
            currency: self.currency,
            period_start: self.period_start,
            period_end: self.period_end,
            line_items,
            subtotal: self.subtotal,
            tax: self.tax,
            total: self.total,
            created_at: self.created_at,
            finalized_at: self.finalized_at,
        })
    }
}

#[derive(FromRow)]
struct LineItemRow {
    kind: String,
    description: String,
    metric_name: Option<String>,
    quantity: Decimal,
    price_basis: Json<PriceBasis>,
    amount: Decimal,
}

impl TryFrom<LineItemRow> for LineItem {
    type Error = AppError;

    fn try_from(row: LineItemRow) -> Result<Self, AppError> {
        Ok(LineItem {
            kind: decode("line item kind", &row.kind, LineItemKind::from_string)?,
            description: row.description,
            metric_name: row.metric_name,
            quantity: row.quantity,
            price_basis: row.price_basis.0,
            amount: row.amount,
        })
    }
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url, clock), fields(service = "usage-billing-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool, clock })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn plan_changes_for(&self, subscription_ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<PlanChange>>, AppError> {
        let rows = sqlx::query_as::<_, PlanChangeRow>(
            r#"
            SELECT change_id, subscription_id, effective_at, old_plan_id, old_quantity, new_plan_id, new_quantity, recorded_at
            FROM plan_changes
            WHERE subscription_id = ANY($1)
            ORDER BY effective_at, recorded_at
            "#,
        )
        .bind(subscription_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load plan changes: {}", e)))?;

        let mut changes: HashMap<Uuid, Vec<PlanChange>> = HashMap::new();
        for row in rows {
            changes.entry(row.subscription_id).or_default().push(row.into());
        }
        Ok(changes)
    }

    async fn owns_plan(&self, tenant_id: Uuid, plan_id: Uuid) -> Result<bool, AppError> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM plans WHERE tenant_id = $1 AND plan_id = $2)",
        )
        .bind(tenant_id)
        .bind(plan_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to check plan: {}", e)))
    }

    async fn owns_subscription(&self, tenant_id: Uuid, subscription_id: Uuid) -> Result<bool, AppError> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM subscriptions WHERE tenant_id = $1 AND subscription_id = $2)",
        )
        .bind(tenant_id)
        .bind(subscription_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to check subscription: {}", e)))
    }

    async fn line_items_for(&self, invoice_id: Uuid) -> Result<Vec<LineItem>, AppError> {
        let rows = sqlx::query_as::<_, LineItemRow>(
            r#"
            SELECT kind, description, metric_name, quantity, price_basis, amount
            FROM invoice_line_items
            WHERE invoice_id = $1
            ORDER BY position
            "#,
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load line items: {}", e)))?;

        rows.into_iter().map(LineItem::try_from).collect()
    }
}

// =========================================================================
// Usage Events
// =========================================================================

#[async_trait]
impl UsageEventStore for Database {
    #[instrument(skip(self, ctx, event), fields(tenant_id = %ctx.tenant_id(), key = %event.idempotency_key))]
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

        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_event"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        // Share-lock the covering invoice so closing its period waits for this
        // insert, or this insert sees the period closed.
        if let Some(subscription_id) = event.subscription_id {
            let closed = sqlx::query_scalar::<_, bool>(
                r#"
                SELECT status <> 'draft' OR usage_closed_at IS NOT NULL
                FROM invoices
                WHERE tenant_id = $1 AND subscription_id = $2
                  AND period_start <= $3 AND $3 < period_end
                FOR SHARE
                "#,
            )
            .bind(event.tenant_id)
            .bind(subscription_id)
            .bind(event.occurred_at)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to check period: {}", e)))?;

            if closed.into_iter().any(|c| c) {
                tx.rollback().await.ok();
                timer.observe_duration();
                return Ok(match self.find_event_by_key(ctx, &event.idempotency_key).await? {
                    Some(existing) => InsertOutcome::Existing(existing),
                    None => InsertOutcome::PeriodClosed,
                });
            }
        }

        let query = format!(
            r#"
            INSERT INTO usage_events ({EVENT_COLUMNS}, time_bucket)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (tenant_id, idempotency_key) DO NOTHING
            RETURNING {EVENT_COLUMNS}
            "#
        );
        let inserted = sqlx::query_as::<_, EventRow>(&query)
            .bind(event.event_id)
            .bind(event.tenant_id)
            .bind(event.subscription_id)
            .bind(&event.metric_name)
            .bind(event.quantity)
            .bind(event.overage_quantity)
            .bind(&event.unit)
            .bind(event.occurred_at)
            .bind(event.received_at)
            .bind(&event.idempotency_key)
            .bind(&event.properties)
            .bind(event.time_bucket())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to insert event: {}", e)))?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit event: {}", e))
        })?;

        let outcome = match inserted {
            Some(row) => InsertOutcome::Inserted(row.into()),
            None => {
                let existing = self
                    .find_event_by_key(ctx, &event.idempotency_key)
                    .await?
                    .ok_or_else(|| {
                        AppError::InternalError(anyhow::anyhow!(
                            "Event with key {} vanished after conflict",
                            event.idempotency_key
                        ))
                    })?;
                InsertOutcome::Existing(existing)
            }
        };

        timer.observe_duration();
        Ok(outcome)
    }

    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id()))]
    async fn find_event_by_key(
        &self,
        ctx: &TenantContext,
        idempotency_key: &str,
    ) -> Result<Option<UsageEvent>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_event_by_key"])
            .start_timer();

        let query = format!(
            "SELECT {EVENT_COLUMNS} FROM usage_events WHERE tenant_id = $1 AND idempotency_key = $2"
        );
        let event = sqlx::query_as::<_, EventRow>(&query)
            .bind(ctx.tenant_id())
            .bind(idempotency_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to find event: {}", e)))?;

        timer.observe_duration();
        Ok(event.map(UsageEvent::from))
    }

    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id(), subscription_id = %subscription_id))]
    async fn list_period_events(
        &self,
        ctx: &TenantContext,
        subscription_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<UsageEvent>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_period_events"])
            .start_timer();

        // The bucket range lets the planner prune partitions before the exact bounds apply.
        let first_bucket: NaiveDate = start.date_naive();
        let last_bucket: NaiveDate = end.date_naive();
        let query = format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM usage_events
            WHERE tenant_id = $1 AND subscription_id = $2
              AND time_bucket BETWEEN $3 AND $4
              AND occurred_at >= $5 AND occurred_at < $6
            ORDER BY occurred_at, received_at, event_id
            "#
        );
        let rows = sqlx::query_as::<_, EventRow>(&query)
            .bind(ctx.tenant_id())
            .bind(subscription_id)
            .bind(first_bucket)
            .bind(last_bucket)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list events: {}", e)))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(UsageEvent::from).collect())
    }

    #[instrument(skip(self))]
    async fn purge_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["purge_events"])
            .start_timer();

        let result = sqlx::query("DELETE FROM usage_events WHERE occurred_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to purge events: {}", e)))?;

        timer.observe_duration();
        Ok(result.rows_affected())
    }
}

// =========================================================================
// Plans, Rules, Subscriptions, Limits, Adjustments
// =========================================================================

#[async_trait]
impl CatalogStore for Database {
    #[instrument(skip(self, ctx, input), fields(tenant_id = %ctx.tenant_id()))]
    async fn create_plan(&self, ctx: &TenantContext, input: &CreatePlan) -> Result<Plan, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_plan"])
            .start_timer();

        let plan = sqlx::query_as::<_, PlanRow>(
            r#"
            INSERT INTO plans (plan_id, tenant_id, name, base_price, currency, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING plan_id, tenant_id, name, base_price, currency, is_active, created_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(ctx.tenant_id())
        .bind(&input.name)
        .bind(input.base_price)
        .bind(&input.currency)
        .bind(self.clock.now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create plan: {}", e)))?;

        timer.observe_duration();
        info!(plan_id = %plan.plan_id, name = %plan.name, "Plan created");

        Ok(plan.into())
    }

    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id(), plan_id = %plan_id))]
    async fn get_plan(&self, ctx: &TenantContext, plan_id: Uuid) -> Result<Option<Plan>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_plan"])
            .start_timer();

        let plan = sqlx::query_as::<_, PlanRow>(
            r#"
            SELECT plan_id, tenant_id, name, base_price, currency, is_active, created_utc
            FROM plans
            WHERE tenant_id = $1 AND plan_id = $2
            "#,
        )
        .bind(ctx.tenant_id())
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get plan: {}", e)))?;

        timer.observe_duration();
        Ok(plan.map(Plan::from))
    }

    #[instrument(skip(self, ctx, input), fields(tenant_id = %ctx.tenant_id(), metric = %input.metric_name))]
    async fn publish_rule(
        &self,
        ctx: &TenantContext,
        input: &PublishRule,
    ) -> Result<PricingRule, AppError> {
        if !self.owns_plan(ctx.tenant_id(), input.plan_id).await? {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Plan {} not found",
                input.plan_id
            )));
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["publish_rule"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        sqlx::query(
            r#"
            UPDATE pricing_rules
            SET is_active = FALSE, superseded_at = $4
            WHERE tenant_id = $1 AND plan_id = $2 AND metric_name = $3 AND is_active
            "#,
        )
        .bind(ctx.tenant_id())
        .bind(input.plan_id)
        .bind(&input.metric_name)
        .bind(input.effective_from)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to supersede rule: {}", e)))?;

        let version = sqlx::query_scalar::<_, i32>(
            r#"
            SELECT COALESCE(MAX(version), 0) + 1
            FROM pricing_rules
            WHERE tenant_id = $1 AND plan_id = $2 AND metric_name = $3
            "#,
        )
        .bind(ctx.tenant_id())
        .bind(input.plan_id)
        .bind(&input.metric_name)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to read rule version: {}", e)))?;

        let query = format!(
            r#"
            INSERT INTO pricing_rules (rule_id, tenant_id, plan_id, metric_name, version, unit, pricing_type, model, overage_unit_price, effective_from)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {RULE_COLUMNS}
            "#
        );
        let result = sqlx::query_as::<_, RuleRow>(&query)
            .bind(Uuid::new_v4())
            .bind(ctx.tenant_id())
            .bind(input.plan_id)
            .bind(&input.metric_name)
            .bind(version)
            .bind(&input.unit)
            .bind(input.model.pricing_type().as_str())
            .bind(Json(&input.model))
            .bind(input.overage_unit_price)
            .bind(input.effective_from)
            .fetch_one(&mut *tx)
            .await;

        let rule = match result {
            Ok(row) => row,
            Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
                tx.rollback().await.ok();
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Concurrent publish for metric '{}'",
                    input.metric_name
                )));
            }
            Err(e) => {
                return Err(AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to insert rule: {}",
                    e
                )));
            }
        };

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit rule: {}", e))
        })?;

        timer.observe_duration();
        info!(rule_id = %rule.rule_id, version = rule.version, "Pricing rule published");

        Ok(rule.into())
    }

    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id(), plan_id = %plan_id))]
    async fn active_rule(
        &self,
        ctx: &TenantContext,
        plan_id: Uuid,
        metric_name: &str,
    ) -> Result<Option<PricingRule>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["active_rule"])
            .start_timer();

        let query = format!(
            r#"
            SELECT {RULE_COLUMNS}
            FROM pricing_rules
            WHERE tenant_id = $1 AND plan_id = $2 AND metric_name = $3 AND is_active
            "#
        );
        let rule = sqlx::query_as::<_, RuleRow>(&query)
            .bind(ctx.tenant_id())
            .bind(plan_id)
            .bind(metric_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get rule: {}", e)))?;

        timer.observe_duration();
        Ok(rule.map(PricingRule::from))
    }

    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id(), plan_id = %plan_id))]
    async fn rules_as_of(
        &self,
        ctx: &TenantContext,
        plan_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Vec<PricingRule>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["rules_as_of"])
            .start_timer();

        let query = format!(
            r#"
            SELECT DISTINCT ON (metric_name) {RULE_COLUMNS}
            FROM pricing_rules
            WHERE tenant_id = $1 AND plan_id = $2 AND effective_from <= $3
            ORDER BY metric_name, version DESC
            "#
        );
        let rows = sqlx::query_as::<_, RuleRow>(&query)
            .bind(ctx.tenant_id())
            .bind(plan_id)
            .bind(at)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list rules: {}", e)))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(PricingRule::from).collect())
    }

    #[instrument(skip(self, ctx, input), fields(tenant_id = %ctx.tenant_id(), plan_id = %input.plan_id))]
    async fn create_subscription(
        &self,
        ctx: &TenantContext,
        input: &CreateSubscription,
    ) -> Result<Subscription, AppError> {
        if !self.owns_plan(ctx.tenant_id(), input.plan_id).await? {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Plan {} not found",
                input.plan_id
            )));
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_subscription"])
            .start_timer();

        let query = format!(
            r#"
            INSERT INTO subscriptions (subscription_id, tenant_id, plan_id, status, current_period_start, current_period_end, quantity, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, SubscriptionRow>(&query)
            .bind(Uuid::new_v4())
            .bind(ctx.tenant_id())
            .bind(input.plan_id)
            .bind(input.status.as_str())
            .bind(input.current_period_start)
            .bind(input.current_period_end)
            .bind(input.quantity)
            .bind(self.clock.now())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to create subscription: {}", e))
            })?;

        timer.observe_duration();
        info!(subscription_id = %row.subscription_id, "Subscription created");

        row.with_changes(Vec::new())
    }

    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id(), subscription_id = %subscription_id))]
    async fn get_subscription(
        &self,
        ctx: &TenantContext,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_subscription"])
            .start_timer();

        let query = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE tenant_id = $1 AND subscription_id = $2"
        );
        let row = sqlx::query_as::<_, SubscriptionRow>(&query)
            .bind(ctx.tenant_id())
            .bind(subscription_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to get subscription: {}", e))
            })?;

        let Some(row) = row else {
            timer.observe_duration();
            return Ok(None);
        };

        let mut changes = self.plan_changes_for(&[row.subscription_id]).await?;
        timer.observe_duration();
        row.with_changes(changes.remove(&subscription_id).unwrap_or_default())
            .map(Some)
    }

    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id()))]
    async fn list_active_subscriptions(
        &self,
        ctx: &TenantContext,
    ) -> Result<Vec<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_active_subscriptions"])
            .start_timer();

        let query = format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM subscriptions
            WHERE tenant_id = $1 AND status IN ('trialing', 'active', 'past_due')
            ORDER BY created_utc, subscription_id
            "#
        );
        let rows = sqlx::query_as::<_, SubscriptionRow>(&query)
            .bind(ctx.tenant_id())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to list subscriptions: {}", e))
            })?;

        let ids: Vec<Uuid> = rows.iter().map(|r| r.subscription_id).collect();
        let mut changes = self.plan_changes_for(&ids).await?;

        timer.observe_duration();
        rows.into_iter()
            .map(|row| {
                let history = changes.remove(&row.subscription_id).unwrap_or_default();
                row.with_changes(history)
            })
            .collect()
    }

    #[instrument(skip(self, ctx, change), fields(tenant_id = %ctx.tenant_id(), subscription_id = %change.subscription_id))]
    async fn record_plan_change(
        &self,
        ctx: &TenantContext,
        change: &PlanChange,
    ) -> Result<Subscription, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_plan_change"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let updated = sqlx::query(
            r#"
            UPDATE subscriptions
            SET plan_id = $3, quantity = $4
            WHERE tenant_id = $1 AND subscription_id = $2
            "#,
        )
        .bind(ctx.tenant_id())
        .bind(change.subscription_id)
        .bind(change.new_plan_id)
        .bind(change.new_quantity)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update subscription: {}", e)))?;

        if updated.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Subscription {} not found",
                change.subscription_id
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO plan_changes (change_id, subscription_id, effective_at, old_plan_id, old_quantity, new_plan_id, new_quantity, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(change.change_id)
        .bind(change.subscription_id)
        .bind(change.effective_at)
        .bind(change.old_plan_id)
        .bind(change.old_quantity)
        .bind(change.new_plan_id)
        .bind(change.new_quantity)
        .bind(change.recorded_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to record plan change: {}", e)))?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit plan change: {}", e))
        })?;
        timer.observe_duration();

        self.get_subscription(ctx, change.subscription_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "Subscription {} not found",
                    change.subscription_id
                ))
            })
    }

    #[instrument(skip(self, ctx, limit), fields(tenant_id = %ctx.tenant_id(), subscription_id = %limit.subscription_id))]
    async fn set_usage_limit(
        &self,
        ctx: &TenantContext,
        limit: &UsageLimit,
    ) -> Result<UsageLimit, AppError> {
        if !self.owns_subscription(ctx.tenant_id(), limit.subscription_id).await? {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Subscription {} not found",
                limit.subscription_id
            )));
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_usage_limit"])
            .start_timer();

        let row = sqlx::query_as::<_, LimitRow>(
            r#"
            INSERT INTO usage_limits (subscription_id, metric_name, limit_value, period, action_on_exceed)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (subscription_id, metric_name)
            DO UPDATE SET limit_value = EXCLUDED.limit_value, period = EXCLUDED.period, action_on_exceed = EXCLUDED.action_on_exceed
            RETURNING subscription_id, metric_name, limit_value, period, action_on_exceed
            "#,
        )
        .bind(limit.subscription_id)
        .bind(&limit.metric_name)
        .bind(limit.limit_value)
        .bind(limit.period.as_str())
        .bind(limit.action_on_exceed.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to set usage limit: {}", e)))?;

        timer.observe_duration();
        row.try_into()
    }

    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id(), subscription_id = %subscription_id))]
    async fn get_usage_limit(
        &self,
        ctx: &TenantContext,
        subscription_id: Uuid,
        metric_name: &str,
    ) -> Result<Option<UsageLimit>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_usage_limit"])
            .start_timer();

        let row = sqlx::query_as::<_, LimitRow>(
            r#"
            SELECT l.subscription_id, l.metric_name, l.limit_value, l.period, l.action_on_exceed
            FROM usage_limits l
            JOIN subscriptions s ON s.subscription_id = l.subscription_id
            WHERE s.tenant_id = $1 AND l.subscription_id = $2 AND l.metric_name = $3
            "#,
        )
        .bind(ctx.tenant_id())
        .bind(subscription_id)
        .bind(metric_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get usage limit: {}", e)))?;

        timer.observe_duration();
        row.map(UsageLimit::try_from).transpose()
    }

    #[instrument(skip(self, ctx, adjustment), fields(tenant_id = %ctx.tenant_id(), subscription_id = %adjustment.subscription_id))]
    async fn add_adjustment(
        &self,
        ctx: &TenantContext,
        adjustment: &Adjustment,
    ) -> Result<Adjustment, AppError> {
        if adjustment.tenant_id != ctx.tenant_id()
            || !self
                .owns_subscription(ctx.tenant_id(), adjustment.subscription_id)
                .await?
        {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Subscription {} not found",
                adjustment.subscription_id
            )));
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["add_adjustment"])
            .start_timer();

        let row = sqlx::query_as::<_, AdjustmentRow>(
            r#"
            INSERT INTO adjustments (adjustment_id, tenant_id, subscription_id, kind, amount, description, period_start, period_end, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING adjustment_id, tenant_id, subscription_id, kind, amount, description, period_start, period_end
            "#,
        )
        .bind(adjustment.adjustment_id)
        .bind(adjustment.tenant_id)
        .bind(adjustment.subscription_id)
        .bind(adjustment.kind.as_str())
        .bind(adjustment.amount)
        .bind(&adjustment.description)
        .bind(adjustment.period_start)
        .bind(adjustment.period_end)
        .bind(self.clock.now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to add adjustment: {}", e)))?;

        timer.observe_duration();
        row.try_into()
    }

    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id(), subscription_id = %subscription_id))]
    async fn list_adjustments(
        &self,
        ctx: &TenantContext,
        subscription_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Adjustment>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_adjustments"])
            .start_timer();

        let rows = sqlx::query_as::<_, AdjustmentRow>(
            r#"
            SELECT adjustment_id, tenant_id, subscription_id, kind, amount, description, period_start, period_end
            FROM adjustments
            WHERE tenant_id = $1 AND subscription_id = $2 AND period_start < $4 AND period_end > $3
            ORDER BY created_utc, adjustment_id
            "#,
        )
        .bind(ctx.tenant_id())
        .bind(subscription_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list adjustments: {}", e)))?;

        timer.observe_duration();
        rows.into_iter().map(Adjustment::try_from).collect()
    }
}

// =========================================================================
// Invoices
// =========================================================================

#[async_trait]
impl InvoiceStore for Database {
    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id(), invoice_id = %invoice_id))]
    async fn get_invoice(
        &self,
        ctx: &TenantContext,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let query =
            format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE tenant_id = $1 AND invoice_id = $2");
        let row = sqlx::query_as::<_, InvoiceRow>(&query)
            .bind(ctx.tenant_id())
            .bind(invoice_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get invoice: {}", e)))?;

        let invoice = match row {
            Some(row) => {
                let items = self.line_items_for(row.invoice_id).await?;
                Some(row.with_items(items)?)
            }
            None => None,
        };

        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self, ctx, invoice), fields(tenant_id = %ctx.tenant_id(), invoice_id = %invoice.invoice_id))]
    async fn save_draft(&self, ctx: &TenantContext, invoice: &Invoice) -> Result<Invoice, AppError> {
        if invoice.tenant_id != ctx.tenant_id() || !invoice.status.is_draft() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Only drafts of the caller's tenant can be saved"
            )));
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["save_draft"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        // Upsert only while the stored row is still a draft.
        let written = sqlx::query(
            r#"
            INSERT INTO invoices (invoice_id, tenant_id, subscription_id, status, currency, period_start, period_end, subtotal, tax, total, created_at)
            VALUES ($1, $2, $3, 'draft', $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (invoice_id) DO UPDATE
            SET currency = EXCLUDED.currency, subtotal = EXCLUDED.subtotal, tax = EXCLUDED.tax, total = EXCLUDED.total
            WHERE invoices.status = 'draft' AND invoices.tenant_id = EXCLUDED.tenant_id
            "#,
        )
        .bind(invoice.invoice_id)
        .bind(invoice.tenant_id)
        .bind(invoice.subscription_id)
        .bind(&invoice.currency)
        .bind(invoice.period_start)
        .bind(invoice.period_end)
        .bind(invoice.subtotal)
        .bind(invoice.tax)
        .bind(invoice.total)
        .bind(invoice.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to save invoice: {}", e)))?;

        if written.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Invoice {} is no longer a draft",
                invoice.invoice_id
            )));
        }

        sqlx::query("DELETE FROM invoice_line_items WHERE invoice_id = $1")
            .bind(invoice.invoice_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to clear line items: {}", e))
            })?;

        for (position, item) in invoice.line_items.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO invoice_line_items (invoice_id, position, kind, description, metric_name, quantity, price_basis, amount)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(invoice.invoice_id)
            .bind(position as i32)
            .bind(item.kind.as_str())
            .bind(&item.description)
            .bind(&item.metric_name)
            .bind(item.quantity)
            .bind(Json(&item.price_basis))
            .bind(item.amount)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to insert line item: {}", e))
            })?;
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit invoice: {}", e))
        })?;

        timer.observe_duration();
        info!(total = %invoice.total, items = invoice.line_items.len(), "Draft invoice saved");

        Ok(invoice.clone())
    }

    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id(), invoice_id = %invoice_id))]
    async fn mark_open(
        &self,
        ctx: &TenantContext,
        invoice_id: Uuid,
        finalized_at: DateTime<Utc>,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_open"])
            .start_timer();

        let query = format!(
            r#"
            UPDATE invoices
            SET status = 'open', finalized_at = $3
            WHERE tenant_id = $1 AND invoice_id = $2 AND status = 'draft'
            RETURNING {INVOICE_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, InvoiceRow>(&query)
            .bind(ctx.tenant_id())
            .bind(invoice_id)
            .bind(finalized_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to open invoice: {}", e)))?;

        let invoice = match row {
            Some(row) => {
                let items = self.line_items_for(row.invoice_id).await?;
                Some(row.with_items(items)?)
            }
            None => None,
        };

        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id(), invoice_id = %invoice_id))]
    async fn close_period(
        &self,
        ctx: &TenantContext,
        invoice_id: Uuid,
        closed_at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["close_period"])
            .start_timer();

        // Blocks behind inserts holding a share lock on the row.
        let closed = sqlx::query(
            r#"
            UPDATE invoices
            SET usage_closed_at = COALESCE(usage_closed_at, $3)
            WHERE tenant_id = $1 AND invoice_id = $2 AND status = 'draft'
            "#,
        )
        .bind(ctx.tenant_id())
        .bind(invoice_id)
        .bind(closed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to close period: {}", e)))?;

        timer.observe_duration();
        Ok(closed.rows_affected() == 1)
    }

    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id(), subscription_id = %subscription_id))]
    async fn is_period_closed(
        &self,
        ctx: &TenantContext,
        subscription_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["is_period_closed"])
            .start_timer();

        let closed = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM invoices
                WHERE tenant_id = $1 AND subscription_id = $2
                  AND (status <> 'draft' OR usage_closed_at IS NOT NULL)
                  AND period_start <= $3 AND $3 < period_end
            )
            "#,
        )
        .bind(ctx.tenant_id())
        .bind(subscription_id)
        .bind(at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to check period: {}", e)))?;

        timer.observe_duration();
        Ok(closed)
    }
}

#[async_trait]
impl BillingStore for Database {
    /// Check database health.
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invoice_row(status: &str) -> InvoiceRow {
        let now = Utc::now();
        InvoiceRow {
            invoice_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            status: status.to_string(),
            currency: "USD".to_string(),
            period_start: now,
            period_end: now,
            subtotal: Decimal::ZERO,
            tax: Decimal::ZERO,
            total: Decimal::ZERO,
            created_at: now,
            finalized_at: None,
        }
    }

    #[test]
    fn test_unknown_stored_status_is_an_error() {
        let err = invoice_row("finalised").with_items(Vec::new()).unwrap_err();
        assert!(matches!(err, AppError::DatabaseError(_)));

        let paid = invoice_row("paid").with_items(Vec::new()).unwrap();
        assert_eq!(paid.status, InvoiceStatus::Paid);
        assert!(!paid.status.is_draft());
    }

    #[test]
    fn test_unknown_limit_action_is_not_read_as_block() {
        let row = LimitRow {
            subscription_id: Uuid::new_v4(),
            metric_name: "api_calls".to_string(),
            limit_value: Decimal::from(10),
            period: "monthly".to_string(),
            action_on_exceed: "throttle".to_string(),
        };
        assert!(UsageLimit::try_from(row).is_err());
    }

    // Postgres-backed tests run only when TEST_DATABASE_URL is set.

    async fn test_database() -> Option<Database> {
        let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
            eprintln!("TEST_DATABASE_URL not set, skipping Postgres test");
            return None;
        };
        let db = Database::new(&url, 2, 1, Arc::new(crate::services::clock::SystemClock))
            .await
            .expect("Failed to connect to test database");
        db.run_migrations().await.expect("Failed to run migrations");
        Some(db)
    }

    async fn seeded_subscription(db: &Database, ctx: &TenantContext) -> Subscription {
        let plan = db
            .create_plan(
                ctx,
                &CreatePlan {
                    name: "Starter".to_string(),
                    base_price: Decimal::from(10),
                    currency: "USD".to_string(),
                },
            )
            .await
            .unwrap();
        let start = chrono::TimeZone::with_ymd_and_hms(&Utc, 2026, 4, 1, 0, 0, 0).unwrap();
        db.create_subscription(
            ctx,
            &CreateSubscription {
                plan_id: plan.plan_id,
                status: SubscriptionStatus::Active,
                current_period_start: start,
                current_period_end: start + chrono::Duration::days(30),
                quantity: Decimal::ONE,
            },
        )
        .await
        .unwrap()
    }

    fn usage_event(ctx: &TenantContext, subscription: &Subscription, key: &str) -> UsageEvent {
        let occurred_at = subscription.current_period_start + chrono::Duration::days(1);
        UsageEvent {
            event_id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id(),
            subscription_id: Some(subscription.subscription_id),
            metric_name: "api_calls".to_string(),
            quantity: Decimal::from(3),
            overage_quantity: Decimal::ZERO,
            unit: "call".to_string(),
            occurred_at,
            received_at: occurred_at,
            idempotency_key: key.to_string(),
            properties: serde_json::json!({}),
        }
    }

    fn draft_for(ctx: &TenantContext, subscription: &Subscription) -> Invoice {
        Invoice {
            invoice_id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id(),
            subscription_id: subscription.subscription_id,
            status: InvoiceStatus::Draft,
            currency: "USD".to_string(),
            period_start: subscription.current_period_start,
            period_end: subscription.current_period_end,
            line_items: vec![],
            subtotal: Decimal::from(10),
            tax: Decimal::ZERO,
            total: Decimal::from(10),
            created_at: subscription.current_period_end,
            finalized_at: None,
        }
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn test_postgres_duplicate_key_returns_stored_event() {
        let Some(db) = test_database().await else { return };
        let ctx = TenantContext::for_tenant(Uuid::new_v4(), &[]);
        let subscription = seeded_subscription(&db, &ctx).await;

        let first = db
            .insert_event(&ctx, &usage_event(&ctx, &subscription, "dup-1"))
            .await
            .unwrap();
        let second = db
            .insert_event(&ctx, &usage_event(&ctx, &subscription, "dup-1"))
            .await
            .unwrap();

        let InsertOutcome::Inserted(stored) = first else {
            panic!("expected insert, got {:?}", first)
        };
        match second {
            InsertOutcome::Existing(existing) => assert_eq!(existing.event_id, stored.event_id),
            other => panic!("expected existing, got {:?}", other),
        }
        let events = db
            .list_period_events(
                &ctx,
                subscription.subscription_id,
                subscription.current_period_start,
                subscription.current_period_end,
            )
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn test_postgres_closed_period_refuses_usage_and_drafts() {
        let Some(db) = test_database().await else { return };
        let ctx = TenantContext::for_tenant(Uuid::new_v4(), &[]);
        let subscription = seeded_subscription(&db, &ctx).await;
        let draft = draft_for(&ctx, &subscription);
        db.save_draft(&ctx, &draft).await.unwrap();

        let early = db
            .insert_event(&ctx, &usage_event(&ctx, &subscription, "early"))
            .await
            .unwrap();
        assert!(matches!(early, InsertOutcome::Inserted(_)));

        let now = Utc::now();
        assert!(db.close_period(&ctx, draft.invoice_id, now).await.unwrap());
        let late = db
            .insert_event(&ctx, &usage_event(&ctx, &subscription, "late"))
            .await
            .unwrap();
        assert!(matches!(late, InsertOutcome::PeriodClosed));
        assert!(db
            .is_period_closed(&ctx, subscription.subscription_id, subscription.current_period_start)
            .await
            .unwrap());

        let opened = db.mark_open(&ctx, draft.invoice_id, now).await.unwrap().unwrap();
        assert_eq!(opened.status, InvoiceStatus::Open);
        let rewrite = db.save_draft(&ctx, &draft).await.unwrap_err();
        assert!(matches!(rewrite, AppError::Conflict(_)));
        assert!(db.mark_open(&ctx, draft.invoice_id, now).await.unwrap().is_none());
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn test_postgres_unknown_status_fails_the_read() {
        let Some(db) = test_database().await else { return };
        let ctx = TenantContext::for_tenant(Uuid::new_v4(), &[]);
        let subscription = seeded_subscription(&db, &ctx).await;
        let draft = draft_for(&ctx, &subscription);
        db.save_draft(&ctx, &draft).await.unwrap();

        sqlx::query("UPDATE invoices SET status = 'archived' WHERE invoice_id = $1")
            .bind(draft.invoice_id)
            .execute(db.pool())
            .await
            .unwrap();

        let err = db.get_invoice(&ctx, draft.invoice_id).await.unwrap_err();
        assert!(matches!(err, AppError::DatabaseError(_)));
    }
}
