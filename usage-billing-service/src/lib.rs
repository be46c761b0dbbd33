//! usage-billing-service: usage metering, pricing and invoicing for
//! multi-tenant subscriptions.

pub mod config;
pub mod dtos;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;
pub mod workers;
