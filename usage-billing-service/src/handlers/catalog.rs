use crate::dtos::{
    AddAdjustmentRequest, CreatePlanRequest, CreateSubscriptionRequest, PlanChangeRequest,
    PublishRuleRequest, SetLimitRequest,
};
use crate::error::BillingError;
use crate::models::{
    Adjustment, CreatePlan, CreateSubscription, Plan, PricingRule, PublishRule,
    RecordPlanChange, Subscription, UsageLimit,
};
use crate::services::tenant::TenantContext;
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;
use validator::Validate;

#[tracing::instrument(skip(state, ctx, request), fields(tenant_id = %ctx.tenant_id()))]
pub async fn create_plan(
    State(state): State<AppState>,
    ctx: TenantContext,
    Json(request): Json<CreatePlanRequest>,
) -> Result<(StatusCode, Json<Plan>), BillingError> {
    request.validate().map_err(|e| BillingError::from(e).recorded("create_plan"))?;

    let plan = state
        .catalog
        .create_plan(
            &ctx,
            CreatePlan {
                name: request.name,
                base_price: request.base_price,
                currency: request
                    .currency
                    .unwrap_or_else(|| state.default_currency.clone()),
            },
        )
        .await
        .map_err(|e| e.recorded("create_plan"))?;
    Ok((StatusCode::CREATED, Json(plan)))
}

/// Publish the next version of a plan's pricing rule for one metric.
#[tracing::instrument(skip(state, ctx, request), fields(tenant_id = %ctx.tenant_id()))]
pub async fn publish_rule(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(plan_id): Path<Uuid>,
    Json(request): Json<PublishRuleRequest>,
) -> Result<(StatusCode, Json<PricingRule>), BillingError> {
    request.validate().map_err(|e| BillingError::from(e).recorded("publish_rule"))?;

    let rule = state
        .catalog
        .publish_rule(
            &ctx,
            PublishRule {
                plan_id,
                metric_name: request.metric_name,
                unit: request.unit,
                model: request.model,
                overage_unit_price: request.overage_unit_price,
                effective_from: request.effective_from.unwrap_or_else(|| state.clock.now()),
            },
        )
        .await
        .map_err(|e| e.recorded("publish_rule"))?;
    Ok((StatusCode::CREATED, Json(rule)))
}

#[tracing::instrument(skip(state, ctx, request), fields(tenant_id = %ctx.tenant_id()))]
pub async fn create_subscription(
    State(state): State<AppState>,
    ctx: TenantContext,
    Json(request): Json<CreateSubscriptionRequest>,
) -> Result<(StatusCode, Json<Subscription>), BillingError> {
    let subscription = state
        .catalog
        .create_subscription(
            &ctx,
            CreateSubscription {
                plan_id: request.plan_id,
                status: request.status,
                current_period_start: request.current_period_start,
                current_period_end: request.current_period_end,
                quantity: request.quantity,
            },
        )
        .await
        .map_err(|e| e.recorded("create_subscription"))?;
    Ok((StatusCode::CREATED, Json(subscription)))
}

#[tracing::instrument(skip(state, ctx, request), fields(tenant_id = %ctx.tenant_id()))]
pub async fn record_plan_change(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(subscription_id): Path<Uuid>,
    Json(request): Json<PlanChangeRequest>,
) -> Result<(StatusCode, Json<Subscription>), BillingError> {
    let subscription = state
        .catalog
        .record_plan_change(
            &ctx,
            RecordPlanChange {
                subscription_id,
                effective_at: request.effective_at,
                new_plan_id: request.new_plan_id,
                new_quantity: request.new_quantity,
            },
        )
        .await
        .map_err(|e| e.recorded("record_plan_change"))?;
    Ok((StatusCode::CREATED, Json(subscription)))
}

#[tracing::instrument(skip(state, ctx, request), fields(tenant_id = %ctx.tenant_id()))]
pub async fn set_usage_limit(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(subscription_id): Path<Uuid>,
    Json(request): Json<SetLimitRequest>,
) -> Result<Json<UsageLimit>, BillingError> {
    request.validate().map_err(|e| BillingError::from(e).recorded("set_usage_limit"))?;

    let limit = state
        .catalog
        .set_usage_limit(
            &ctx,
            UsageLimit {
                subscription_id,
                metric_name: request.metric_name,
                limit_value: request.limit_value,
                period: request.period,
                action_on_exceed: request.action_on_exceed,
            },
        )
        .await
        .map_err(|e| e.recorded("set_usage_limit"))?;
    Ok(Json(limit))
}

#[tracing::instrument(skip(state, ctx, request), fields(tenant_id = %ctx.tenant_id()))]
pub async fn add_adjustment(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(subscription_id): Path<Uuid>,
    Json(request): Json<AddAdjustmentRequest>,
) -> Result<(StatusCode, Json<Adjustment>), BillingError> {
    request.validate().map_err(|e| BillingError::from(e).recorded("add_adjustment"))?;

    let adjustment = state
        .catalog
        .add_adjustment(
            &ctx,
            Adjustment {
                adjustment_id: Uuid::new_v4(),
                tenant_id: ctx.tenant_id(),
                subscription_id,
                kind: request.kind,
                amount: request.amount,
                description: request.description,
                period_start: request.period_start,
                period_end: request.period_end,
            },
        )
        .await
        .map_err(|e| e.recorded("add_adjustment"))?;
    Ok((StatusCode::CREATED, Json(adjustment)))
}
