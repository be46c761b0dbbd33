//! Invoice model.

use super::pricing::PricingModel;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Invoice status. This service writes only `Draft` and `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Open,
    Paid,
    Void,
    Uncollectible,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Open => "open",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Void => "void",
            InvoiceStatus::Uncollectible => "uncollectible",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "open" => Some(InvoiceStatus::Open),
            "paid" => Some(InvoiceStatus::Paid),
            "void" => Some(InvoiceStatus::Void),
            "uncollectible" => Some(InvoiceStatus::Uncollectible),
            "draft" => Some(InvoiceStatus::Draft),
            _ => None,
        }
    }

    pub fn is_draft(&self) -> bool {
        matches!(self, InvoiceStatus::Draft)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineItemKind {
    SubscriptionFee,
    Usage,
    Overage,
    ProrationCredit,
    ProrationCharge,
    Discount,
    Credit,
}

impl LineItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineItemKind::SubscriptionFee => "subscription_fee",
            LineItemKind::Usage => "usage",
            LineItemKind::Overage => "overage",
            LineItemKind::ProrationCredit => "proration_credit",
            LineItemKind::ProrationCharge => "proration_charge",
            LineItemKind::Discount => "discount",
            LineItemKind::Credit => "credit",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "subscription_fee" => Some(LineItemKind::SubscriptionFee),
            "overage" => Some(LineItemKind::Overage),
            "proration_credit" => Some(LineItemKind::ProrationCredit),
            "proration_charge" => Some(LineItemKind::ProrationCharge),
            "discount" => Some(LineItemKind::Discount),
            "credit" => Some(LineItemKind::Credit),
            "usage" => Some(LineItemKind::Usage),
            _ => None,
        }
    }
}

/// How a line item amount was derived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "basis", rename_all = "snake_case")]
pub enum PriceBasis {
    UnitPrice {
        #[serde(with = "rust_decimal::serde::str")]
        unit_price: Decimal,
    },
    Schedule { model: PricingModel },
    /// `full_fee × numerator / denominator`, both in whole seconds.
    Prorated {
        #[serde(with = "rust_decimal::serde::str")]
        full_fee: Decimal,
        numerator: i64,
        denominator: i64,
    },
    Percent {
        #[serde(with = "rust_decimal::serde::str")]
        percent: Decimal,
    },
    Fixed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub kind: LineItemKind,
    pub description: String,
    pub metric_name: Option<String>,
    #[serde(with = "rust_decimal::serde::str")]
    pub quantity: Decimal,
    pub price_basis: PriceBasis,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub tenant_id: Uuid,
    pub subscription_id: Uuid,
    pub status: InvoiceStatus,
    pub currency: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub line_items: Vec<LineItem>,
    #[serde(with = "rust_decimal::serde::str")]
    pub subtotal: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub tax: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub total: Decimal,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl Invoice {
    /// Deterministic id for the invoice of one subscription period.
    pub fn derive_id(
        tenant_id: Uuid,
        subscription_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Uuid {
        let name = format!(
            "{}/{}/{}/{}",
            tenant_id,
            subscription_id,
            period_start.timestamp(),
            period_end.timestamp()
        );
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
    }

    /// True when the computed content (items and totals) matches `other`.
    pub fn same_content(&self, other: &Invoice) -> bool {
        self.currency == other.currency
            && self.line_items == other.line_items
            && self.subtotal == other.subtotal
            && self.tax == other.tax
            && self.total == other.total
    }
}
