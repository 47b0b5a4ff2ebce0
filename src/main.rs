// =============================================================================
// MARKETPLACE SERVICE - Main Entry Point
// =============================================================================
// WHAT THIS SERVICE DOES:
// - Sells digital goods: downloadable files and credential records
// - Keeps a wallet per user with an escrow hold for orders awaiting delivery
// - Pays referrers a commission on every purchase of the users they invited
// - Exposes Prometheus metrics for observability
// - Caches product read models in Redis
// =============================================================================

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use marketplace_service::accounts;
use marketplace_service::config::Config;
use marketplace_service::db::Database;
use marketplace_service::error::AppError;
use marketplace_service::handlers;
use marketplace_service::metrics::setup_metrics;
use marketplace_service::models::RegisterUserRequest;
use marketplace_service::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -------------------------------------------------------------------------
    // STEP 1: Load environment variables
    // -------------------------------------------------------------------------
    dotenvy::dotenv().ok(); // the .env file is optional

    // -------------------------------------------------------------------------
    // STEP 2: Initialize logging/tracing
    // -------------------------------------------------------------------------
    // RUST_LOG controls log levels, e.g. RUST_LOG=info,marketplace_service=debug
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,marketplace_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting Marketplace Service...");

    // -------------------------------------------------------------------------
    // STEP 3: Load configuration
    // -------------------------------------------------------------------------
    let config = Config::from_env()?;
    info!(
        port = config.port,
        max_connections = config.database_max_connections,
        "Configuration loaded"
    );

    // -------------------------------------------------------------------------
    // STEP 4: Set up Prometheus metrics
    // -------------------------------------------------------------------------
    let metrics_handle = setup_metrics()?;
    info!("Prometheus metrics initialized");

    // -------------------------------------------------------------------------
    // STEP 5: Connect to PostgreSQL database
    // -------------------------------------------------------------------------
    let db = Database::connect(&config.database_url, config.database_max_connections).await?;
    info!("Connected to PostgreSQL");

    db.run_migrations().await?;
    info!("Database migrations completed");

    if config.seed_demo_data {
        db.seed_demo_data().await?;
    }

    if let Some(email) = &config.admin_email {
        let request = RegisterUserRequest {
            name: "Administrator".to_string(),
            email: email.clone(),
            referral_code: None,
        };
        match accounts::register_admin(&db, request, config.referral_commission_rate).await {
            Ok(admin) => info!(user_id = %admin.user.id, "Admin account created"),
            // Already registered on an earlier start
            Err(AppError::BadRequest(reason)) => warn!(reason = %reason, "Admin account not created"),
            Err(err) => return Err(err.into()),
        }
    }

    // -------------------------------------------------------------------------
    // STEP 6: Connect to Redis
    // -------------------------------------------------------------------------
    // ConnectionManager handles reconnection automatically
    let redis_client = redis::Client::open(config.redis_url.as_str())?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client).await?;
    info!("Connected to Redis");

    // -------------------------------------------------------------------------
    // STEP 7: Create application state
    // -------------------------------------------------------------------------
    let port = config.port;
    let state = Arc::new(AppState {
        db,
        redis: redis_conn,
        metrics_handle,
        config,
    });

    // -------------------------------------------------------------------------
    // STEP 8: Define routes
    // -------------------------------------------------------------------------
    let app = Router::new()
        // ----- Health & Readiness Endpoints -----
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        // ----- Accounts -----
        .route("/api/v1/users", post(handlers::register_user))
        // ----- Catalog -----
        .route("/api/v1/products", get(handlers::list_products))
        .route("/api/v1/products/:id", get(handlers::get_product))
        // ----- Orders -----
        .route(
            "/api/v1/orders",
            get(handlers::list_orders).post(handlers::place_order),
        )
        .route("/api/v1/orders/:id", get(handlers::get_order))
        .route("/api/v1/orders/:id/download", get(handlers::download_order))
        .route("/api/v1/orders/:id/deliver", post(handlers::deliver_order))
        .route("/api/v1/orders/:id/refund", post(handlers::refund_order))
        // ----- Wallet -----
        .route("/api/v1/wallet", get(handlers::wallet_overview))
        .route("/api/v1/wallet/deposits", post(handlers::submit_deposit))
        // ----- Admin -----
        .route("/api/v1/admin/deposits", get(handlers::pending_deposits))
        .route(
            "/api/v1/admin/deposits/:id/approve",
            post(handlers::approve_deposit),
        )
        .route(
            "/api/v1/admin/deposits/:id/reject",
            post(handlers::reject_deposit),
        )
        // ----- Middleware Layers -----
        .layer(
            CorsLayer::new()
                .allow_origin(Any) // tighten for production
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // -------------------------------------------------------------------------
    // STEP 9: Start the HTTP server
    // -------------------------------------------------------------------------
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(address = %addr, "Marketplace Service is listening");

    axum::serve(listener, app).await?;

    Ok(())
}
