use crate::dtos::GenerateInvoiceRequest;
use crate::error::BillingError;
use crate::models::Invoice;
use crate::services::tenant::{TenantContext, SCOPE_INVOICES_WRITE};
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use uuid::Uuid;

/// Build or rebuild the draft invoice of a subscription period. Without a
/// body the subscription's current period is used.
#[tracing::instrument(skip(state, ctx, request), fields(tenant_id = %ctx.tenant_id()))]
pub async fn generate_invoice(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(subscription_id): Path<Uuid>,
    request: Option<Json<GenerateInvoiceRequest>>,
) -> Result<Json<Invoice>, BillingError> {
    ctx.require_scope(SCOPE_INVOICES_WRITE)
        .map_err(|e| e.recorded("generate_invoice"))?;
    let request = request.map(|Json(r)| r).unwrap_or_default();

    let (period_start, period_end) = match (request.period_start, request.period_end) {
        (Some(start), Some(end)) => (start, end),
        (start, end) => {
            let subscription = state
                .store
                .get_subscription(&ctx, subscription_id)
                .await
                .map_err(|e| BillingError::from(e).recorded("generate_invoice"))?
                .ok_or_else(|| {
                    BillingError::NotFound(format!("Subscription {}", subscription_id))
                        .recorded("generate_invoice")
                })?;
            (
                start.unwrap_or(subscription.current_period_start),
                end.unwrap_or(subscription.current_period_end),
            )
        }
    };

    let invoice = state
        .invoices
        .generate(&ctx, subscription_id, period_start, period_end)
        .await
        .map_err(|e| e.recorded("generate_invoice"))?;
    Ok(Json(invoice))
}

#[tracing::instrument(skip(state, ctx), fields(tenant_id = %ctx.tenant_id()))]
pub async fn finalize_invoice(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<Invoice>, BillingError> {
    let invoice = state
        .invoices
        .finalize(&ctx, invoice_id)
        .await
        .map_err(|e| e.recorded("finalize_invoice"))?;
    Ok(Json(invoice))
}

#[tracing::instrument(skip(state, ctx), fields(tenant_id = %ctx.tenant_id()))]
pub async fn get_invoice(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<Invoice>, BillingError> {
    let invoice = state
        .invoices
        .get(&ctx, invoice_id)
        .await
        .map_err(|e| e.recorded("get_invoice"))?;
    Ok(Json(invoice))
}
