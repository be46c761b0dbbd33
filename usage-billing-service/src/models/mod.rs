//! Domain models for usage-billing-service.

mod adjustment;
mod invoice;
mod limit;
mod plan;
mod pricing;
mod subscription;
mod usage;

pub use adjustment::{Adjustment, AdjustmentKind};
pub use invoice::{Invoice, InvoiceStatus, LineItem, LineItemKind, PriceBasis};
pub use limit::{LimitAction, LimitDecision, LimitOutcome, LimitPeriod, LimitUsage, UsageLimit};
pub use plan::{CreatePlan, Plan};
pub use pricing::{PricingModel, PricingRule, PricingType, PublishRule, Tier};
pub use subscription::{
    CreateSubscription, PlanChange, PlanConfig, RecordPlanChange, Subscription,
    SubscriptionStatus,
};
pub use usage::{EventDraft, InsertOutcome, UsageEvent};
