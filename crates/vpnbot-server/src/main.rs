//! vpnbot HTTP Server
//!
//! Axum-based server exposing the payment API and the CloudPayments
//! webhook endpoint.

mod handlers;
mod state;

use std::sync::Arc;

use anyhow::Context;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vpnbot_payments::{
    CloudPaymentsClient, KeyIssuingActivator, PaymentService, ServiceConfig, SqliteStore,
    config::allow_unsigned_webhooks_from_env,
};

use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    // Storage
    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://bot.db?mode=rwc".into());
    let store = Arc::new(
        SqliteStore::connect(&database_url)
            .await
            .with_context(|| format!("opening database {database_url}"))?,
    );
    tracing::info!("✓ Database ready at {}", database_url);

    // Gateway
    let gateway = Arc::new(
        CloudPaymentsClient::from_env()
            .context("set CLOUDPAYMENTS_PUBLIC_ID and CLOUDPAYMENTS_API_SECRET in .env")?,
    );
    tracing::info!("✓ CloudPayments configured");

    let allow_unsigned_webhooks = allow_unsigned_webhooks_from_env();
    if allow_unsigned_webhooks {
        tracing::warn!("⚠ WEBHOOK_ALLOW_UNSIGNED is set - unsigned webhooks will be accepted");
    }

    let config = ServiceConfig::from_env();
    tracing::info!(currency = %config.currency, provider = %config.provider, "Payment settings");

    let activator = Arc::new(KeyIssuingActivator::new(store.clone()));
    let payments = PaymentService::new(store.clone(), gateway, activator, config);

    // Build application state
    let state = AppState {
        payments: Arc::new(payments),
        subscriptions: store,
        allow_unsigned_webhooks,
    };

    let app = handlers::router(state).layer(TraceLayer::new_for_http());

    // Start server
    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("🚀 vpnbot server running on http://{}", addr);
    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("");
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health                          - Health check");
    tracing::info!("  POST /api/payments                    - Create payment");
    tracing::info!("  GET  /api/payments?status=...         - List payments by status");
    tracing::info!("  GET  /api/payments/{{id}}               - Get payment");
    tracing::info!("  POST /api/payments/{{id}}/activate      - Retry subscription activation");
    tracing::info!("  GET  /api/users/{{chat_id}}/payments    - List user payments");
    tracing::info!("  POST /api/subscriptions               - Create subscription");
    tracing::info!("  GET  /api/users/{{chat_id}}/subscriptions - List active subscriptions");
    tracing::info!("  POST /webhook/cloudpayments           - CloudPayments webhook");
    tracing::info!("");

    axum::serve(listener, app).await?;

    Ok(())
}
