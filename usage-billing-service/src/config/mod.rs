//! Configuration module for usage-billing-service.

use crate::services::counters::RatePolicy;
use crate::services::gate::IngestionSettings;
use rust_decimal::Decimal;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub auth: AuthConfig,
    pub ingestion: IngestionConfig,
    pub billing: BillingSettings,
    pub collaborators: CollaboratorConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Shared counter backend. Without a URL the process keeps counters in
/// memory, which only holds for a single instance.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub jwt_issuer: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IngestionConfig {
    pub rate_limit_max_events: u64,
    pub rate_limit_window_secs: u64,
    pub idempotency_ttl_secs: u64,
    pub admission_timeout_ms: u64,
    pub batch_concurrency: usize,
    pub max_batch_size: usize,
}

impl IngestionConfig {
    pub fn settings(&self) -> IngestionSettings {
        IngestionSettings {
            rate: RatePolicy {
                max_events: self.rate_limit_max_events,
                window: Duration::from_secs(self.rate_limit_window_secs),
            },
            idempotency_ttl: Duration::from_secs(self.idempotency_ttl_secs),
            admission_timeout: Duration::from_millis(self.admission_timeout_ms),
            batch_concurrency: self.batch_concurrency,
            max_batch_size: self.max_batch_size,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BillingSettings {
    pub default_currency: String,
    pub tax_rate: Decimal,
    pub event_retention_days: i64,
    /// Zero disables the retention sweeper.
    pub retention_sweep_secs: u64,
}

#[derive(Debug, Clone)]
pub struct CollaboratorConfig {
    pub payment_webhook_url: Option<String>,
    pub notification_webhook_url: Option<String>,
}

fn parsed_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl BillingConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let tax_rate = match env::var("TAX_RATE") {
            Ok(raw) => Decimal::from_str(raw.trim()).map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!("TAX_RATE '{}' is invalid: {}", raw, e))
            })?,
            Err(_) => Decimal::ZERO,
        };
        if tax_rate < Decimal::ZERO {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "TAX_RATE must be >= 0"
            )));
        }

        let rate_limit_max_events = parsed_or("RATE_LIMIT_MAX_EVENTS", 1000);
        let rate_limit_window_secs = parsed_or("RATE_LIMIT_WINDOW_SECS", 60);
        if rate_limit_max_events == 0 || rate_limit_window_secs == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "RATE_LIMIT_MAX_EVENTS and RATE_LIMIT_WINDOW_SECS must be > 0"
            )));
        }

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "usage-billing-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: parsed_or("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: parsed_or("DATABASE_MIN_CONNECTIONS", 2),
            },
            redis: RedisConfig {
                url: env::var("REDIS_URL").ok().filter(|u| !u.trim().is_empty()),
            },
            auth: AuthConfig {
                jwt_secret: env::var("JWT_SECRET")
                    .ok()
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| {
                        AppError::ConfigError(anyhow::anyhow!("JWT_SECRET is required"))
                    })?,
                jwt_issuer: env::var("JWT_ISSUER").ok().filter(|s| !s.is_empty()),
            },
            ingestion: IngestionConfig {
                rate_limit_max_events,
                rate_limit_window_secs,
                idempotency_ttl_secs: parsed_or("IDEMPOTENCY_TTL_SECS", 86_400),
                admission_timeout_ms: parsed_or("ADMISSION_TIMEOUT_MS", 2_000),
                batch_concurrency: parsed_or("INGEST_BATCH_CONCURRENCY", 16),
                max_batch_size: parsed_or("MAX_BATCH_SIZE", 500),
            },
            billing: BillingSettings {
                default_currency: env::var("BILLING_CURRENCY")
                    .unwrap_or_else(|_| "USD".to_string()),
                tax_rate,
                event_retention_days: parsed_or("EVENT_RETENTION_DAYS", 400),
                retention_sweep_secs: parsed_or("RETENTION_SWEEP_SECS", 3_600),
            },
            collaborators: CollaboratorConfig {
                payment_webhook_url: env::var("PAYMENT_WEBHOOK_URL").ok(),
                notification_webhook_url: env::var("NOTIFICATION_WEBHOOK_URL").ok(),
            },
        })
    }
}
