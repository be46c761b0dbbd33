//! Error type for billing operations.

use crate::services::metrics::record_error;
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

/// Header carrying the remaining admissions in the current window.
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Missing or invalid credential")]
    Unauthenticated,

    #[error("Credential expired")]
    CredentialExpired,

    #[error("Malformed credential: {0}")]
    MalformedCredential(String),

    #[error("Missing required scope '{0}'")]
    Forbidden(String),

    #[error(
        "Invalid quantity {quantity} for metric '{metric_name}': must be between 0 and {}",
        crate::services::gate::MAX_EVENT_QUANTITY
    )]
    InvalidQuantity {
        metric_name: String,
        quantity: Decimal,
    },

    #[error("Unknown metric '{0}': no active subscription prices it")]
    UnknownMetric(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid pricing rule for metric '{metric_name}': {reason}")]
    InvalidRule { metric_name: String, reason: String },

    #[error(
        "Plan change effective at {effective_at} is outside period [{period_start}, {period_end})"
    )]
    OutOfOrderPlanChange {
        effective_at: DateTime<Utc>,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    },

    #[error("Usage for metric '{metric_name}' at {occurred_at} falls in an invoiced period")]
    PeriodClosed {
        metric_name: String,
        occurred_at: DateTime<Utc>,
    },

    #[error("Billing period ending {period_end} has not closed yet")]
    PeriodNotClosed { period_end: DateTime<Utc> },

    #[error("Rate limit exceeded, retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64, remaining: u64 },

    #[error(
        "Usage limit {limit_value} for metric '{metric_name}' exceeded (current usage {current_usage})"
    )]
    UsageLimitExceeded {
        metric_name: String,
        limit_value: Decimal,
        current_usage: Decimal,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("Invoice {0} is not a draft")]
    InvoiceNotDraft(Uuid),

    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("Admission timed out after {0} ms")]
    AdmissionTimeout(u64),

    #[error("Admission for idempotency key '{0}' is still in progress")]
    AdmissionInProgress(String),

    #[error(transparent)]
    Store(#[from] AppError),
}

/// Coarse error category, used for retry decisions and response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transient,
    RateLimited,
    Validation,
    Consistency,
    Unauthenticated,
    Forbidden,
    NotFound,
    Conflict,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Consistency => "consistency",
            ErrorCategory::Unauthenticated => "unauthenticated",
            ErrorCategory::Forbidden => "forbidden",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Conflict => "conflict",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ErrorCategory::Transient => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCategory::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCategory::Validation => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCategory::Consistency => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCategory::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorCategory::Forbidden => StatusCode::FORBIDDEN,
            ErrorCategory::NotFound => StatusCode::NOT_FOUND,
            ErrorCategory::Conflict => StatusCode::CONFLICT,
        }
    }
}

impl BillingError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            BillingError::Unauthenticated
            | BillingError::CredentialExpired
            | BillingError::MalformedCredential(_) => ErrorCategory::Unauthenticated,
            BillingError::Forbidden(_) => ErrorCategory::Forbidden,
            BillingError::InvalidQuantity { .. }
            | BillingError::UnknownMetric(_)
            | BillingError::InvalidRequest(_)
            | BillingError::InvalidRule { .. }
            | BillingError::OutOfOrderPlanChange { .. } => ErrorCategory::Validation,
            BillingError::PeriodClosed { .. }
            | BillingError::PeriodNotClosed { .. }
            | BillingError::UsageLimitExceeded { .. }
            | BillingError::InvoiceNotDraft(_) => ErrorCategory::Conflict,
            BillingError::RateLimited { .. } => ErrorCategory::RateLimited,
            BillingError::NotFound(_) => ErrorCategory::NotFound,
            BillingError::ConsistencyViolation(_) => ErrorCategory::Consistency,
            BillingError::AdmissionTimeout(_) | BillingError::AdmissionInProgress(_) => {
                ErrorCategory::Transient
            }
            BillingError::Store(err) => match err {
                AppError::NotFound(_) => ErrorCategory::NotFound,
                AppError::Conflict(_) => ErrorCategory::Conflict,
                AppError::Forbidden(_) => ErrorCategory::Forbidden,
                AppError::BadRequest(_) | AppError::ValidationError(_) => {
                    ErrorCategory::Validation
                }
                _ => ErrorCategory::Transient,
            },
        }
    }

    /// Stable label for the error counter.
    pub fn error_type(&self) -> &'static str {
        match self {
            BillingError::Unauthenticated => "unauthenticated",
            BillingError::CredentialExpired => "credential_expired",
            BillingError::MalformedCredential(_) => "malformed_credential",
            BillingError::Forbidden(_) => "forbidden",
            BillingError::InvalidQuantity { .. } => "invalid_quantity",
            BillingError::UnknownMetric(_) => "unknown_metric",
            BillingError::InvalidRequest(_) => "invalid_request",
            BillingError::InvalidRule { .. } => "invalid_rule",
            BillingError::OutOfOrderPlanChange { .. } => "out_of_order_plan_change",
            BillingError::PeriodClosed { .. } => "period_closed",
            BillingError::PeriodNotClosed { .. } => "period_not_closed",
            BillingError::RateLimited { .. } => "rate_limited",
            BillingError::UsageLimitExceeded { .. } => "usage_limit_exceeded",
            BillingError::NotFound(_) => "not_found",
            BillingError::InvoiceNotDraft(_) => "invoice_not_draft",
            BillingError::ConsistencyViolation(_) => "consistency_violation",
            BillingError::AdmissionTimeout(_) => "admission_timeout",
            BillingError::AdmissionInProgress(_) => "admission_in_progress",
            BillingError::Store(_) => "store",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transient | ErrorCategory::RateLimited
        )
    }

    /// Count this error against `operation` and hand it back.
    pub fn recorded(self, operation: &str) -> Self {
        record_error(self.error_type(), operation);
        self
    }
}

impl From<validator::ValidationErrors> for BillingError {
    fn from(err: validator::ValidationErrors) -> Self {
        BillingError::InvalidRequest(err.to_string())
    }
}

impl IntoResponse for BillingError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
            category: ErrorCategory,
            #[serde(skip_serializing_if = "Option::is_none")]
            details: Option<serde_json::Value>,
        }

        let category = self.category();

        if let BillingError::RateLimited {
            retry_after_ms,
            remaining,
        } = &self
        {
            let body = json!({
                "error": self.to_string(),
                "category": category.as_str(),
                "retry_after_ms": retry_after_ms,
                "remaining": remaining,
            });
            let mut res = (category.status(), Json(body)).into_response();
            let retry_secs = retry_after_ms.div_ceil(1000).max(1);
            res.headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_secs));
            res.headers_mut()
                .insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from(*remaining));
            return res;
        }

        let (error, details) = match &self {
            BillingError::Store(err) if category != ErrorCategory::Transient => {
                (err.to_string(), None)
            }
            BillingError::Store(err) => {
                tracing::error!(error = %err, "Store failure");
                (
                    "Billing store unavailable".to_string(),
                    Some(json!(err.to_string())),
                )
            }
            BillingError::ConsistencyViolation(msg) => (
                "Consistency violation".to_string(),
                Some(json!(msg)),
            ),
            BillingError::UsageLimitExceeded {
                metric_name,
                limit_value,
                current_usage,
            } => (
                self.to_string(),
                Some(json!({
                    "metric_name": metric_name,
                    "limit_value": limit_value.to_string(),
                    "current_usage": current_usage.to_string(),
                })),
            ),
            _ => (self.to_string(), None),
        };

        (
            category.status(),
            Json(ErrorResponse {
                error,
                category,
                details,
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories_map_to_status() {
        assert_eq!(
            BillingError::UnknownMetric("api_calls".into()).category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            BillingError::ConsistencyViolation("x".into())
                .category()
                .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert!(BillingError::AdmissionTimeout(250).is_retryable());
        assert!(!BillingError::Forbidden("usage:write".into()).is_retryable());
    }

    #[test]
    fn test_store_errors_keep_their_meaning() {
        let missing = BillingError::from(AppError::NotFound(anyhow::anyhow!("Plan x not found")));
        assert_eq!(missing.category(), ErrorCategory::NotFound);
        let down = BillingError::from(AppError::DatabaseError(anyhow::anyhow!("timeout")));
        assert_eq!(down.category(), ErrorCategory::Transient);
        assert!(down.is_retryable());
    }

    #[test]
    fn test_rate_limited_response_headers() {
        let res = BillingError::RateLimited {
            retry_after_ms: 1500,
            remaining: 0,
        }
        .into_response();

        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(res.headers().get(header::RETRY_AFTER).unwrap(), "2");
        assert_eq!(
            res.headers().get(RATE_LIMIT_REMAINING_HEADER).unwrap(),
            "0"
        );
    }
}
