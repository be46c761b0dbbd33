//! Usage event admission: validation, idempotency, rate limiting and usage
//! limits in front of the event store.

use crate::error::BillingError;
use crate::models::{
    EventDraft, InsertOutcome, LimitDecision, LimitOutcome, PricingRule, Subscription,
    UsageEvent, UsageLimit,
};
use crate::services::clock::Clock;
use crate::services::collaborators::{LimitAlert, LimitAlertSink};
use crate::services::counters::{
    AdmissionOutcome, AdmissionRequest, CounterStore, LimitCheck, RatePolicy,
};
use crate::services::metrics::{record_event, record_limit_decision, record_rate_limited};
use crate::services::store::BillingStore;
use crate::services::tenant::{TenantContext, SCOPE_USAGE_WRITE};
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub const MAX_METRIC_NAME_LEN: usize = 128;
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;
/// Largest quantity one event may carry. Scaled usage counters hold
/// `quantity × 10^6` in an `i64`, and pricing sums stay far from the decimal
/// range at this bound.
pub const MAX_EVENT_QUANTITY: i64 = 1_000_000_000_000;

/// Admission attempts when a concurrent first attempt is released under us.
const MAX_ADMIT_ATTEMPTS: usize = 3;
/// Polls of the event store while a concurrent first attempt is in flight.
const IN_FLIGHT_POLLS: usize = 5;
const IN_FLIGHT_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy)]
pub struct IngestionSettings {
    pub rate: RatePolicy,
    pub idempotency_ttl: Duration,
    pub admission_timeout: Duration,
    pub batch_concurrency: usize,
    pub max_batch_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionStatus {
    Accepted,
    Duplicate,
}

impl AdmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionStatus::Accepted => "accepted",
            AdmissionStatus::Duplicate => "duplicate",
        }
    }
}

/// Result of a successful admission. A duplicate carries the original event.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub event: UsageEvent,
    pub status: AdmissionStatus,
    /// Admissions left in the tenant's window; only known for fresh accepts.
    pub remaining: Option<u64>,
}

impl Admission {
    fn duplicate(event: UsageEvent) -> Self {
        Self {
            event,
            status: AdmissionStatus::Duplicate,
            remaining: None,
        }
    }
}

enum Attempt {
    Done(Admission),
    Retry,
}

pub struct IngestionGate {
    store: Arc<dyn BillingStore>,
    counters: Arc<dyn CounterStore>,
    alerts: Arc<dyn LimitAlertSink>,
    clock: Arc<dyn Clock>,
    settings: IngestionSettings,
}

impl IngestionGate {
    pub fn new(
        store: Arc<dyn BillingStore>,
        counters: Arc<dyn CounterStore>,
        alerts: Arc<dyn LimitAlertSink>,
        clock: Arc<dyn Clock>,
        settings: IngestionSettings,
    ) -> Self {
        Self {
            store,
            counters,
            alerts,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &IngestionSettings {
        &self.settings
    }

    /// Admit one usage event for the caller's tenant.
    #[instrument(skip(self, ctx, draft), fields(tenant_id = %ctx.tenant_id(), metric = %draft.metric_name, key = %draft.idempotency_key))]
    pub async fn admit(
        &self,
        ctx: &TenantContext,
        draft: EventDraft,
    ) -> Result<Admission, BillingError> {
        ctx.require_scope(SCOPE_USAGE_WRITE)?;
        validate_draft(&draft)?;
        let tenant = ctx.tenant_id().to_string();

        if let Some(existing) = self
            .store
            .find_event_by_key(ctx, &draft.idempotency_key)
            .await?
        {
            debug!(event_id = %existing.event_id, "Duplicate idempotency key");
            record_event(&tenant, AdmissionStatus::Duplicate.as_str());
            return Ok(Admission::duplicate(existing));
        }

        let (subscription, rule) = self.resolve_metric(ctx, &draft.metric_name).await?;

        if self
            .store
            .is_period_closed(ctx, subscription.subscription_id, draft.occurred_at)
            .await?
        {
            record_event(&tenant, "rejected");
            return Err(BillingError::PeriodClosed {
                metric_name: draft.metric_name,
                occurred_at: draft.occurred_at,
            });
        }

        let limit = self
            .store
            .get_usage_limit(ctx, subscription.subscription_id, &draft.metric_name)
            .await?;

        for attempt in 0..MAX_ADMIT_ATTEMPTS {
            let event = self.build_event(ctx, &subscription, &rule, &draft);
            match self.try_admit(ctx, event, limit.as_ref()).await {
                Ok(Attempt::Done(admission)) => {
                    record_event(&tenant, admission.status.as_str());
                    return Ok(admission);
                }
                Ok(Attempt::Retry) => {
                    debug!(attempt = attempt, "Concurrent attempt released, retrying");
                }
                Err(e) => {
                    record_event(&tenant, "rejected");
                    return Err(e);
                }
            }
        }

        record_event(&tenant, "rejected");
        Err(BillingError::AdmissionInProgress(draft.idempotency_key))
    }

    /// Admit many events concurrently. Results keep the input order and each
    /// event succeeds or fails on its own.
    #[instrument(skip(self, ctx, drafts), fields(tenant_id = %ctx.tenant_id(), count = drafts.len()))]
    pub async fn admit_batch(
        &self,
        ctx: &TenantContext,
        drafts: Vec<EventDraft>,
    ) -> Result<Vec<Result<Admission, BillingError>>, BillingError> {
        ctx.require_scope(SCOPE_USAGE_WRITE)?;
        if drafts.is_empty() || drafts.len() > self.settings.max_batch_size {
            return Err(BillingError::InvalidRequest(format!(
                "batch must contain between 1 and {} events",
                self.settings.max_batch_size
            )));
        }

        let mut results: Vec<(usize, Result<Admission, BillingError>)> =
            stream::iter(drafts.into_iter().enumerate())
                .map(|(index, draft)| async move { (index, self.admit(ctx, draft).await) })
                .buffer_unordered(self.settings.batch_concurrency.max(1))
                .collect()
                .await;
        results.sort_by_key(|(index, _)| *index);

        Ok(results.into_iter().map(|(_, result)| result).collect())
    }

    /// The tenant subscription still metering usage whose current plan prices
    /// `metric_name`.
    async fn resolve_metric(
        &self,
        ctx: &TenantContext,
        metric_name: &str,
    ) -> Result<(Subscription, PricingRule), BillingError> {
        for subscription in self.store.list_active_subscriptions(ctx).await? {
            if let Some(rule) = self
                .store
                .active_rule(ctx, subscription.plan_id, metric_name)
                .await?
            {
                return Ok((subscription, rule));
            }
        }
        Err(BillingError::UnknownMetric(metric_name.to_string()))
    }

    fn build_event(
        &self,
        ctx: &TenantContext,
        subscription: &Subscription,
        rule: &PricingRule,
        draft: &EventDraft,
    ) -> UsageEvent {
        UsageEvent {
            event_id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id(),
            subscription_id: Some(subscription.subscription_id),
            metric_name: draft.metric_name.clone(),
            quantity: draft.quantity,
            overage_quantity: Decimal::ZERO,
            unit: draft.unit.clone().unwrap_or_else(|| rule.unit.clone()),
            occurred_at: draft.occurred_at,
            received_at: self.clock.now(),
            idempotency_key: draft.idempotency_key.clone(),
            properties: match &draft.properties {
                serde_json::Value::Null => serde_json::json!({}),
                other => other.clone(),
            },
        }
    }

    async fn try_admit(
        &self,
        ctx: &TenantContext,
        mut event: UsageEvent,
        limit: Option<&UsageLimit>,
    ) -> Result<Attempt, BillingError> {
        let request = AdmissionRequest {
            tenant_id: ctx.tenant_id(),
            idempotency_key: event.idempotency_key.clone(),
            token: event.event_id.to_string(),
            reservation: event.event_id.to_string(),
            now: event.received_at,
            rate: self.settings.rate,
            idempotency_ttl: self.settings.idempotency_ttl,
            limit: limit.map(|limit| LimitCheck {
                limit: limit.clone(),
                quantity: event.quantity,
            }),
        };

        let outcome =
            match tokio::time::timeout(self.settings.admission_timeout, self.counters.admit(&request))
                .await
            {
                Ok(outcome) => outcome?,
                Err(_) => {
                    warn!(
                        timeout_ms = self.settings.admission_timeout.as_millis() as u64,
                        "Admission timed out, releasing reservation"
                    );
                    self.release(&request).await;
                    return Err(BillingError::AdmissionTimeout(
                        self.settings.admission_timeout.as_millis() as u64,
                    ));
                }
            };

        match outcome {
            AdmissionOutcome::RateLimited {
                retry_after,
                remaining,
            } => {
                record_rate_limited(&ctx.tenant_id().to_string());
                Err(BillingError::RateLimited {
                    retry_after_ms: (retry_after.as_millis() as u64).max(1),
                    remaining,
                })
            }
            AdmissionOutcome::LimitBlocked { outcome } => {
                let limit = request.limit.as_ref().map(|check| &check.limit);
                if let Some(limit) = limit {
                    self.raise_alert(ctx, &event, limit, &outcome).await;
                }
                Err(BillingError::UsageLimitExceeded {
                    metric_name: event.metric_name,
                    limit_value: limit.map(|l| l.limit_value).unwrap_or_default(),
                    current_usage: outcome.usage_before,
                })
            }
            AdmissionOutcome::Duplicate { .. } => self.await_in_flight(ctx, &event).await,
            AdmissionOutcome::Admitted {
                remaining,
                limit: limit_outcome,
            } => {
                if let Some(outcome) = &limit_outcome {
                    event.overage_quantity = outcome.decision.overage();
                }

                let stored = match self.store.insert_event(ctx, &event).await {
                    Ok(stored) => stored,
                    Err(e) => {
                        warn!(error = %e, "Durable insert failed, releasing reservation");
                        self.release(&request).await;
                        return Err(e.into());
                    }
                };

                match stored {
                    InsertOutcome::Inserted(stored) => {
                        if let (Some(outcome), Some(check)) = (&limit_outcome, &request.limit) {
                            record_limit_decision(
                                &ctx.tenant_id().to_string(),
                                &stored.metric_name,
                                outcome.decision.as_str(),
                            );
                            if outcome.decision == LimitDecision::Notify {
                                self.raise_alert(ctx, &stored, &check.limit, outcome).await;
                            }
                        }
                        info!(event_id = %stored.event_id, remaining = remaining, "Usage event accepted");
                        Ok(Attempt::Done(Admission {
                            event: stored,
                            status: AdmissionStatus::Accepted,
                            remaining: Some(remaining),
                        }))
                    }
                    InsertOutcome::Existing(existing) => {
                        // Counters had forgotten the key; undo what this attempt counted.
                        self.release(&request).await;
                        Ok(Attempt::Done(Admission::duplicate(existing)))
                    }
                    InsertOutcome::PeriodClosed => {
                        // Finalization closed the period after the early check.
                        warn!(occurred_at = %event.occurred_at, "Period closed during admission, releasing reservation");
                        self.release(&request).await;
                        Err(BillingError::PeriodClosed {
                            metric_name: event.metric_name,
                            occurred_at: event.occurred_at,
                        })
                    }
                }
            }
        }
    }

    /// The key is reserved by an attempt that has not reached the event store
    /// yet. Wait briefly for it to land.
    async fn await_in_flight(
        &self,
        ctx: &TenantContext,
        event: &UsageEvent,
    ) -> Result<Attempt, BillingError> {
        for _ in 0..IN_FLIGHT_POLLS {
            if let Some(existing) = self
                .store
                .find_event_by_key(ctx, &event.idempotency_key)
                .await?
            {
                return Ok(Attempt::Done(Admission::duplicate(existing)));
            }
            tokio::time::sleep(IN_FLIGHT_POLL_INTERVAL).await;
        }
        Ok(Attempt::Retry)
    }

    async fn release(&self, request: &AdmissionRequest) {
        if let Err(e) = self.counters.release(request).await {
            warn!(error = %e, key = %request.idempotency_key, "Failed to release admission");
        }
    }

    async fn raise_alert(
        &self,
        ctx: &TenantContext,
        event: &UsageEvent,
        limit: &UsageLimit,
        outcome: &LimitOutcome,
    ) {
        let alert = LimitAlert {
            tenant_id: ctx.tenant_id(),
            subscription_id: limit.subscription_id,
            metric_name: event.metric_name.clone(),
            decision: outcome.decision,
            limit_value: limit.limit_value,
            current_usage: outcome.usage_after,
            attempted_quantity: event.quantity,
            idempotency_key: event.idempotency_key.clone(),
            raised_at: self.clock.now(),
        };
        if outcome.decision == LimitDecision::Block {
            record_limit_decision(
                &ctx.tenant_id().to_string(),
                &event.metric_name,
                outcome.decision.as_str(),
            );
        }
        if let Err(e) = self.alerts.limit_alert(&alert).await {
            warn!(error = %e, metric = %alert.metric_name, "Failed to publish limit alert");
        }
    }
}

/// Permanent input checks, done before anything is reserved.
pub fn validate_draft(draft: &EventDraft) -> Result<(), BillingError> {
    let metric_len = draft.metric_name.chars().count();
    if metric_len == 0 || metric_len > MAX_METRIC_NAME_LEN {
        return Err(BillingError::InvalidRequest(format!(
            "metric_name must be 1 to {} characters",
            MAX_METRIC_NAME_LEN
        )));
    }
    let key_len = draft.idempotency_key.chars().count();
    if key_len == 0 || key_len > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(BillingError::InvalidRequest(format!(
            "idempotency_key must be 1 to {} characters",
            MAX_IDEMPOTENCY_KEY_LEN
        )));
    }
    if draft.quantity < Decimal::ZERO || draft.quantity > Decimal::from(MAX_EVENT_QUANTITY) {
        return Err(BillingError::InvalidQuantity {
            metric_name: draft.metric_name.clone(),
            quantity: draft.quantity,
        });
    }
    Ok(())
}
