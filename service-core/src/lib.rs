//! service-core: shared HTTP, configuration, error and observability
//! plumbing for the billing services.
pub mod config;
pub mod error;
pub mod middleware;
pub mod observability;
