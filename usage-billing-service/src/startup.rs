//! Application startup and lifecycle management.

use crate::config::BillingConfig;
use crate::handlers::{catalog, events, health, invoices};
use crate::services::{
    init_metrics, BillingStore, CatalogService, Clock, CounterStore, Database, FlatRateTax,
    InMemoryCounterStore, IngestionGate, IngestionSettings, InvoiceAggregator, LimitAlertSink,
    PaymentCollector, RedisCounterStore, SystemClock, TaxCalculator, TenantResolver,
    WebhookPublisher,
};
use crate::workers::RetentionSweeper;
use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Downstream collaborators the engine hands results to.
#[derive(Clone)]
pub struct Collaborators {
    pub payments: Arc<dyn PaymentCollector>,
    pub alerts: Arc<dyn LimitAlertSink>,
    pub tax: Arc<dyn TaxCalculator>,
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<TenantResolver>,
    pub gate: Arc<IngestionGate>,
    pub invoices: Arc<InvoiceAggregator>,
    pub catalog: Arc<CatalogService>,
    pub store: Arc<dyn BillingStore>,
    pub counters: Arc<dyn CounterStore>,
    pub clock: Arc<dyn Clock>,
    pub default_currency: String,
}

impl AppState {
    /// Wire the billing services over the given backends.
    pub fn from_parts(
        resolver: TenantResolver,
        store: Arc<dyn BillingStore>,
        counters: Arc<dyn CounterStore>,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
        settings: IngestionSettings,
        default_currency: String,
    ) -> Self {
        let gate = IngestionGate::new(
            store.clone(),
            counters.clone(),
            collaborators.alerts,
            clock.clone(),
            settings,
        );
        let invoices = InvoiceAggregator::new(
            store.clone(),
            collaborators.tax,
            collaborators.payments,
            clock.clone(),
        );
        let catalog = CatalogService::new(store.clone(), clock.clone());

        Self {
            resolver: Arc::new(resolver),
            gate: Arc::new(gate),
            invoices: Arc::new(invoices),
            catalog: Arc::new(catalog),
            store,
            counters,
            clock,
            default_currency,
        }
    }
}

/// HTTP routes of the billing engine.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        .route("/metrics", get(health::metrics_handler))
        .route("/v1/events", post(events::ingest_event))
        .route("/v1/events/batch", post(events::ingest_batch))
        .route("/v1/plans", post(catalog::create_plan))
        .route("/v1/plans/:plan_id/rules", post(catalog::publish_rule))
        .route("/v1/subscriptions", post(catalog::create_subscription))
        .route(
            "/v1/subscriptions/:subscription_id/plan-changes",
            post(catalog::record_plan_change),
        )
        .route(
            "/v1/subscriptions/:subscription_id/limits",
            put(catalog::set_usage_limit),
        )
        .route(
            "/v1/subscriptions/:subscription_id/adjustments",
            post(catalog::add_adjustment),
        )
        .route(
            "/v1/subscriptions/:subscription_id/invoices",
            post(invoices::generate_invoice),
        )
        .route("/v1/invoices/:invoice_id", get(invoices::get_invoice))
        .route(
            "/v1/invoices/:invoice_id/finalize",
            post(invoices::finalize_invoice),
        )
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    state: AppState,
    sweeper: Arc<RetentionSweeper>,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: BillingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: BillingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: BillingConfig, run_migrations: bool) -> Result<Self, AppError> {
        init_metrics();

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
            clock.clone(),
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let store: Arc<dyn BillingStore> = Arc::new(db);

        let counters: Arc<dyn CounterStore> = match &config.redis.url {
            Some(url) => Arc::new(RedisCounterStore::new(url).await.map_err(|e| {
                tracing::error!(error = %e, "Failed to connect to Redis");
                e
            })?),
            None => {
                tracing::warn!(
                    "REDIS_URL not set, admission counters are local to this process"
                );
                Arc::new(InMemoryCounterStore::new())
            }
        };

        let collaborators = Collaborators {
            payments: Arc::new(WebhookPublisher::new(
                config.collaborators.payment_webhook_url.clone(),
                "payment",
            )?),
            alerts: Arc::new(WebhookPublisher::new(
                config.collaborators.notification_webhook_url.clone(),
                "notification",
            )?),
            tax: Arc::new(FlatRateTax::new(config.billing.tax_rate)),
        };

        let sweeper = Arc::new(RetentionSweeper::new(
            store.clone(),
            clock.clone(),
            config.billing.event_retention_days,
            Duration::from_secs(config.billing.retention_sweep_secs),
        ));

        let state = AppState::from_parts(
            TenantResolver::new(&config.auth.jwt_secret, config.auth.jwt_issuer.as_deref()),
            store,
            counters,
            collaborators,
            clock,
            config.ingestion.settings(),
            config.billing.default_currency.clone(),
        );

        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Usage billing listener bound");

        Ok(Self {
            http_port,
            http_listener,
            state,
            sweeper,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        self.sweeper.clone().start();

        tracing::info!(
            service = "usage-billing-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            store = self.state.store.backend(),
            counters = self.state.counters.backend(),
            "Service ready to accept connections"
        );

        let result = axum::serve(self.http_listener, router(self.state)).await;
        self.sweeper.shutdown();

        result.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
