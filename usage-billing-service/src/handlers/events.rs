use crate::dtos::{
    BatchIngestRequest, BatchIngestResponse, BatchItemResponse, EventResponse,
    IngestEventRequest,
};
use crate::error::{BillingError, RATE_LIMIT_REMAINING_HEADER};
use crate::models::EventDraft;
use crate::services::gate::AdmissionStatus;
use crate::services::tenant::{TenantContext, SCOPE_USAGE_WRITE};
use crate::startup::AppState;
use axum::{
    extract::State,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use validator::Validate;

/// `201` for a fresh event, `200` with the original event for a duplicate.
#[tracing::instrument(skip(state, ctx, request), fields(tenant_id = %ctx.tenant_id()))]
pub async fn ingest_event(
    State(state): State<AppState>,
    ctx: TenantContext,
    Json(request): Json<IngestEventRequest>,
) -> Result<Response, BillingError> {
    request.validate().map_err(|e| BillingError::from(e).recorded("ingest_event"))?;

    let admission = state
        .gate
        .admit(&ctx, EventDraft::from(request))
        .await
        .map_err(|e| e.recorded("ingest_event"))?;

    let status = match admission.status {
        AdmissionStatus::Accepted => StatusCode::CREATED,
        AdmissionStatus::Duplicate => StatusCode::OK,
    };
    let remaining = admission.remaining;

    let mut response = (status, Json(EventResponse::from(admission))).into_response();
    if let Some(remaining) = remaining {
        response
            .headers_mut()
            .insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from(remaining));
    }
    Ok(response)
}

/// Each event is admitted independently; the response lists one result per
/// input event, in order.
#[tracing::instrument(skip(state, ctx, request), fields(tenant_id = %ctx.tenant_id(), count = request.events.len()))]
pub async fn ingest_batch(
    State(state): State<AppState>,
    ctx: TenantContext,
    Json(request): Json<BatchIngestRequest>,
) -> Result<Json<BatchIngestResponse>, BillingError> {
    ctx.require_scope(SCOPE_USAGE_WRITE)
        .map_err(|e| e.recorded("ingest_batch"))?;
    request.validate().map_err(|e| BillingError::from(e).recorded("ingest_batch"))?;
    let max_batch_size = state.gate.settings().max_batch_size;
    if request.events.len() > max_batch_size {
        return Err(BillingError::InvalidRequest(format!(
            "batch must contain between 1 and {} events",
            max_batch_size
        ))
        .recorded("ingest_batch"));
    }

    let mut drafts = Vec::with_capacity(request.events.len());
    let mut invalid = Vec::new();
    for (index, event) in request.events.into_iter().enumerate() {
        match event.validate() {
            Ok(()) => drafts.push((index, EventDraft::from(event))),
            Err(e) => invalid.push((index, BillingError::from(e))),
        }
    }

    let (indices, drafts): (Vec<usize>, Vec<EventDraft>) = drafts.into_iter().unzip();
    let admitted = if drafts.is_empty() {
        Vec::new()
    } else {
        state
            .gate
            .admit_batch(&ctx, drafts)
            .await
            .map_err(|e| e.recorded("ingest_batch"))?
    };

    let mut results: Vec<BatchItemResponse> = indices
        .into_iter()
        .zip(admitted)
        .map(|(index, result)| {
            BatchItemResponse::from_result(index, result.map_err(|e| e.recorded("ingest_batch")))
        })
        .chain(
            invalid
                .into_iter()
                .map(|(index, err)| BatchItemResponse::from_result(index, Err(err))),
        )
        .collect();
    results.sort_by_key(|r| r.index);

    Ok(Json(BatchIngestResponse::new(results)))
}
