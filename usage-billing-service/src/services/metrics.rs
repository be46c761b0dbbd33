//! Metrics module for usage-billing-service.
//! Provides Prometheus metrics for admission, limit enforcement and invoicing.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "usage_billing_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Usage events by admission status (per-tenant metering)
pub static EVENTS_ADMITTED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Admissions rejected by the tenant rate window
pub static RATE_LIMITED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Usage limit decisions by metric
pub static LIMIT_DECISIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Invoices generated or regenerated
pub static INVOICES_GENERATED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Invoices moved to open
pub static INVOICES_FINALIZED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Invoice total amount by currency (monetary tracking)
pub static INVOICE_AMOUNT_TOTAL: OnceLock<prometheus::CounterVec> = OnceLock::new();

/// Initialize all metrics. Safe to call more than once.
pub fn init_metrics() {
    EVENTS_ADMITTED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "usage_billing_events_total",
                "Usage events by tenant and admission status"
            ),
            &["tenant_id", "status"]
        )
        .expect("Failed to register EVENTS_ADMITTED_TOTAL")
    });

    RATE_LIMITED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "usage_billing_rate_limited_total",
                "Admissions rejected by the rate window"
            ),
            &["tenant_id"]
        )
        .expect("Failed to register RATE_LIMITED_TOTAL")
    });

    LIMIT_DECISIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "usage_billing_limit_decisions_total",
                "Usage limit decisions by tenant, metric and decision"
            ),
            &["tenant_id", "metric_name", "decision"]
        )
        .expect("Failed to register LIMIT_DECISIONS_TOTAL")
    });

    INVOICES_GENERATED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "usage_billing_invoices_generated_total",
                "Invoice generations by tenant and result"
            ),
            &["tenant_id", "result"]
        )
        .expect("Failed to register INVOICES_GENERATED_TOTAL")
    });

    INVOICES_FINALIZED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "usage_billing_invoices_finalized_total",
                "Invoices finalized by tenant"
            ),
            &["tenant_id"]
        )
        .expect("Failed to register INVOICES_FINALIZED_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("usage_billing_errors_total", "Total errors by type for alerting"),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    INVOICE_AMOUNT_TOTAL.get_or_init(|| {
        prometheus::register_counter_vec!(
            opts!(
                "usage_billing_invoice_amount_total",
                "Total finalized invoice amount by currency"
            ),
            &["tenant_id", "currency"]
        )
        .expect("Failed to register INVOICE_AMOUNT_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record an admission result (`accepted`, `duplicate`, `rejected`).
pub fn record_event(tenant_id: &str, status: &str) {
    if let Some(counter) = EVENTS_ADMITTED_TOTAL.get() {
        counter.with_label_values(&[tenant_id, status]).inc();
    }
}

pub fn record_rate_limited(tenant_id: &str) {
    if let Some(counter) = RATE_LIMITED_TOTAL.get() {
        counter.with_label_values(&[tenant_id]).inc();
    }
}

pub fn record_limit_decision(tenant_id: &str, metric_name: &str, decision: &str) {
    if let Some(counter) = LIMIT_DECISIONS_TOTAL.get() {
        counter
            .with_label_values(&[tenant_id, metric_name, decision])
            .inc();
    }
}

/// Record an invoice generation (`created`, `regenerated`, `unchanged`).
pub fn record_invoice_generated(tenant_id: &str, result: &str) {
    if let Some(counter) = INVOICES_GENERATED_TOTAL.get() {
        counter.with_label_values(&[tenant_id, result]).inc();
    }
}

/// Record a finalized invoice and its total.
pub fn record_invoice_finalized(tenant_id: &str, currency: &str, amount: f64) {
    if let Some(counter) = INVOICES_FINALIZED_TOTAL.get() {
        counter.with_label_values(&[tenant_id]).inc();
    }
    if let Some(counter) = INVOICE_AMOUNT_TOTAL.get() {
        counter
            .with_label_values(&[tenant_id, currency])
            .inc_by(amount.abs());
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}
