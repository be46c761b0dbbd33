//! Atomic admission counters.
//!
//! One `admit` call performs the idempotency reservation, the sliding-window
//! rate check and the usage-limit step as a single atomic operation, so
//! concurrent admissions for a tenant can never over-admit.

use crate::models::{LimitDecision, LimitOutcome, LimitUsage, UsageLimit};
use crate::services::limits;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

/// Per-tenant sliding-window admission policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePolicy {
    pub max_events: u64,
    pub window: Duration,
}

/// Usage limit to apply atomically with the admission.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitCheck {
    pub limit: UsageLimit,
    pub quantity: Decimal,
}

#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    pub tenant_id: Uuid,
    pub idempotency_key: String,
    /// Unique member recorded in the rate window (the candidate event id).
    pub token: String,
    /// Value stored under the idempotency key (the serialized candidate event).
    pub reservation: String,
    pub now: DateTime<Utc>,
    pub rate: RatePolicy,
    pub idempotency_ttl: Duration,
    pub limit: Option<LimitCheck>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionOutcome {
    Admitted {
        remaining: u64,
        limit: Option<LimitOutcome>,
    },
    /// The key is already reserved; carries the stored reservation.
    Duplicate { reservation: String },
    RateLimited { retry_after: Duration, remaining: u64 },
    /// Rejected by a `block` usage limit. Nothing was mutated.
    LimitBlocked { outcome: LimitOutcome },
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn admit(&self, request: &AdmissionRequest) -> Result<AdmissionOutcome, AppError>;

    /// Undo an `Admitted` outcome for `request`. A no-op if the reservation
    /// under the key is not the one `request` made.
    async fn release(&self, request: &AdmissionRequest) -> Result<(), AppError>;

    async fn health_check(&self) -> Result<(), AppError>;

    fn backend(&self) -> &'static str;
}

#[derive(Default)]
struct CounterState {
    reservations: HashMap<(Uuid, String), (String, DateTime<Utc>)>,
    windows: HashMap<Uuid, VecDeque<(DateTime<Utc>, String)>>,
    usage: HashMap<(Uuid, String), LimitUsage>,
}

/// Single-process counter store. All state sits behind one lock, which is
/// the critical section every admission passes through.
#[derive(Default)]
pub struct InMemoryCounterStore {
    state: Mutex<CounterState>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, CounterState>, AppError> {
        self.state.lock().map_err(|e| {
            AppError::InternalError(anyhow::anyhow!("Counter lock poisoned: {}", e))
        })
    }

    /// Current usage counter for a subscription metric.
    pub fn usage(&self, subscription_id: Uuid, metric_name: &str) -> Option<LimitUsage> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.usage.get(&(subscription_id, metric_name.to_string())).copied())
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn admit(&self, request: &AdmissionRequest) -> Result<AdmissionOutcome, AppError> {
        let mut guard = self.state()?;
        let state = &mut *guard;
        let now = request.now;

        let key = (request.tenant_id, request.idempotency_key.clone());
        match state.reservations.get(&key).cloned() {
            Some((reservation, expires_at)) if expires_at > now => {
                return Ok(AdmissionOutcome::Duplicate { reservation });
            }
            Some(_) => {
                state.reservations.remove(&key);
            }
            None => {}
        }

        let window = to_chrono(request.rate.window);
        let entries = state.windows.entry(request.tenant_id).or_default();
        while entries.front().is_some_and(|(at, _)| *at <= now - window) {
            entries.pop_front();
        }
        let count = entries.len() as u64;
        if count >= request.rate.max_events {
            let retry_after = entries
                .front()
                .map(|(oldest, _)| (*oldest + window - now).to_std().unwrap_or_default())
                .unwrap_or(request.rate.window)
                .max(Duration::from_millis(1));
            return Ok(AdmissionOutcome::RateLimited {
                retry_after,
                remaining: 0,
            });
        }

        let mut limit_outcome = None;
        if let Some(check) = &request.limit {
            let usage_key = (check.limit.subscription_id, check.limit.metric_name.clone());
            let current = state.usage.get(&usage_key).copied().unwrap_or_default();
            let outcome = limits::evaluate(
                &check.limit,
                current.current_usage,
                current.reset_at,
                check.quantity,
                now,
            );
            if outcome.decision == LimitDecision::Block {
                return Ok(AdmissionOutcome::LimitBlocked { outcome });
            }
            state.usage.insert(
                usage_key,
                LimitUsage {
                    current_usage: outcome.usage_after,
                    reset_at: outcome.reset_at,
                },
            );
            limit_outcome = Some(outcome);
        }

        state
            .windows
            .entry(request.tenant_id)
            .or_default()
            .push_back((now, request.token.clone()));
        state.reservations.insert(
            key,
            (
                request.reservation.clone(),
                now + to_chrono(request.idempotency_ttl),
            ),
        );

        Ok(AdmissionOutcome::Admitted {
            remaining: request.rate.max_events - count - 1,
            limit: limit_outcome,
        })
    }

    async fn release(&self, request: &AdmissionRequest) -> Result<(), AppError> {
        let mut guard = self.state()?;
        let state = &mut *guard;
        let key = (request.tenant_id, request.idempotency_key.clone());
        if !state
            .reservations
            .get(&key)
            .is_some_and(|(reservation, _)| *reservation == request.reservation)
        {
            return Ok(());
        }
        state.reservations.remove(&key);

        if let Some(entries) = state.windows.get_mut(&request.tenant_id) {
            entries.retain(|(_, token)| *token != request.token);
        }

        if let Some(check) = &request.limit {
            let usage_key = (check.limit.subscription_id, check.limit.metric_name.clone());
            if let Some(usage) = state.usage.get_mut(&usage_key) {
                usage.current_usage = (usage.current_usage - check.quantity).max(Decimal::ZERO);
            }
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<(), AppError> {
        self.state().map(|_| ())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
