use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Period to (re)build an invoice for. Both bounds default to the
/// subscription's current period.
#[derive(Debug, Default, Deserialize)]
pub struct GenerateInvoiceRequest {
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
}
