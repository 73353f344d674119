//! keygate HTTP Server
//!
//! Axum-based server exposing the checkout, webhook, and credential-key
//! endpoints. All durable state lives in the entitlement store; handlers
//! are independent, short-lived request/response functions.

mod handlers;
mod state;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keygate_core::{EntitlementStore, MemoryEntitlementStore, PlanCatalog};
use keygate_db::PgEntitlementStore;
use keygate_payments::{CheckoutService, CheckoutUrls, StripeClient};

use crate::handlers::{
    create_checkout, create_checkout_session, get_credential_key, health_check, link_profile,
    redeem, stripe_webhook,
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

    // Entitlement store: postgres when configured, memory otherwise
    let store: Arc<dyn EntitlementStore> = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let store = PgEntitlementStore::connect(&url).await?;
            store.migrate().await?;
            tracing::info!("✓ Connected to Postgres");
            Arc::new(store)
        }
        Err(_) => {
            tracing::warn!("⚠ DATABASE_URL not set - using in-memory store");
            tracing::warn!("  Entitlement state will not survive a restart");
            Arc::new(MemoryEntitlementStore::new())
        }
    };

    // Plan catalog with provider price references from the environment
    let plans = Arc::new(PlanCatalog::from_env());
    for plan in plans.plans() {
        tracing::info!(
            "  Plan: {} (monthly price: {}, yearly price: {})",
            plan.id,
            plan.monthly_price_id.as_deref().unwrap_or("unset"),
            plan.yearly_price_id.as_deref().unwrap_or("unset"),
        );
    }

    // Initialize payments
    let stripe = StripeClient::from_env().ok().map(Arc::new);

    let checkout = match &stripe {
        Some(stripe) => {
            tracing::info!("✓ Stripe configured");
            Some(Arc::new(CheckoutService::new(
                store.clone(),
                stripe.clone(),
                plans.as_ref().clone(),
                CheckoutUrls::from_env(),
            )))
        }
        None => {
            tracing::warn!("⚠ Stripe not configured - payments disabled");
            tracing::warn!("  Set STRIPE_SECRET_KEY and STRIPE_WEBHOOK_SECRET in .env");
            None
        }
    };

    // Build application state
    let app_state = AppState {
        store,
        plans,
        stripe,
        checkout,
    };

    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build router
    let app = Router::new()
        // Health & info
        .route("/health", get(health_check))
        // Checkout
        .route("/api/checkout", post(create_checkout))
        .route("/api/checkout/session", post(create_checkout_session))
        .route("/api/credential-key", get(get_credential_key))
        // Redemption & account linking
        .route("/api/auth/redeem", post(redeem))
        .route("/api/auth/link-profile", post(link_profile))
        // Provider events
        .route("/webhook/stripe", post(stripe_webhook))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    // Start server
    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("🚀 keygate server running on http://{}", addr);
    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("");
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health                  - Health check");
    tracing::info!("  POST /api/checkout            - Create checkout session");
    tracing::info!("  POST /api/checkout/session    - Create checkout (authenticated)");
    tracing::info!("  GET  /api/credential-key      - Resolve key by session id");
    tracing::info!("  POST /api/auth/redeem         - Redeem a credential key");
    tracing::info!("  POST /api/auth/link-profile   - Link profile to account");
    tracing::info!("  POST /webhook/stripe          - Stripe webhook");
    tracing::info!("");

    axum::serve(listener, app).await?;

    Ok(())
}
