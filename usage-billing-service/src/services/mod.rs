//! Services module for usage-billing-service.

pub mod catalog;
pub mod clock;
pub mod collaborators;
pub mod counters;
pub mod database;
pub mod gate;
pub mod invoice;
pub mod limits;
pub mod memory;
pub mod metrics;
pub mod money;
pub mod pricing;
pub mod proration;
pub mod redis;
pub mod store;
pub mod tenant;

pub use catalog::CatalogService;
pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborators::{
    FlatRateTax, LimitAlert, LimitAlertSink, PaymentCollector, TaxCalculator, WebhookPublisher,
};
pub use counters::{CounterStore, InMemoryCounterStore, RatePolicy};
pub use database::Database;
pub use gate::{Admission, AdmissionStatus, IngestionGate, IngestionSettings};
pub use invoice::InvoiceAggregator;
pub use memory::InMemoryStore;
pub use metrics::{get_metrics, init_metrics, record_error};
pub use pricing::PricingEvaluator;
pub use redis::RedisCounterStore;
pub use store::BillingStore;
pub use tenant::{TenantContext, TenantResolver};
