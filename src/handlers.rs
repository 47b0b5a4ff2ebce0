// =============================================================================
// HANDLERS MODULE
// =============================================================================
// This module contains all HTTP request handlers (controller layer).
//
// LEARNING NOTES:
// - Handlers parse the request, call one service function, and time it
// - The caller is identified by the X-User-Id header through the CurrentUser
//   extractor; a missing or unknown id is a 401
// - Product read models are cached in Redis. Cache errors are never fatal:
//   a failed GET is a miss, a failed SET or DEL is ignored
// =============================================================================

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{header, request::Parts, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::*;
use crate::{accounts, allocator, commission, db, deposits, fulfilment, metrics};
use crate::{orchestrator, orders, AppState};

pub const USER_ID_HEADER: &str = "x-user-id";

const PRODUCTS_PER_PAGE: i64 = 12;
const ORDERS_PER_PAGE: i64 = 10;
const TRANSACTIONS_PER_PAGE: i64 = 15;
const MAX_PER_PAGE: i64 = 100;

// =============================================================================
// REQUEST HELPERS
// =============================================================================

/// Record count and latency of one request, with the status its result maps to
fn observe<T>(method: &str, endpoint: &str, start: Instant, result: &AppResult<T>) {
    let status = match result {
        Ok(_) => 200,
        Err(err) => err.status_and_code().0.as_u16(),
    };
    metrics::record_http_request(method, endpoint, status, start.elapsed().as_secs_f64());
}

fn product_cache_key(id: Uuid) -> String {
    format!("product:{}", id)
}

/// Drop a product's cached read model after its stock changed
async fn invalidate_product(state: &AppState, id: Uuid) {
    let start = Instant::now();
    let _: Result<(), _> = redis::cmd("DEL")
        .arg(product_cache_key(id))
        .query_async(&mut state.redis.clone())
        .await;
    metrics::record_redis_operation("delete", start.elapsed().as_secs_f64());
}

/// The user making the request, resolved from the X-User-Id header
pub struct CurrentUser(pub User);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .ok_or(AppError::Unauthenticated)?;

        let user = state.db.find_user(id).await?.ok_or(AppError::Unauthenticated)?;
        Ok(CurrentUser(user))
    }
}

#[derive(Debug, Deserialize)]
pub struct PageParams {
    /// Page number (1-indexed, default: 1)
    pub page: Option<i64>,
}

impl PageParams {
    fn page(&self) -> i64 {
        self.page.unwrap_or(1).clamp(1, db::MAX_PAGE)
    }
}

// =============================================================================
// HEALTH CHECK ENDPOINTS
// =============================================================================

/// Liveness probe
///
/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "marketplace-service".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness probe: database and Redis must both answer
///
/// GET /ready
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReadinessResponse>, StatusCode> {
    let db_healthy = state.db.health_check().await;

    let redis_healthy = redis::cmd("PING")
        .query_async::<_, String>(&mut state.redis.clone())
        .await
        .is_ok();

    let all_healthy = db_healthy && redis_healthy;
    let status = if all_healthy { "ready" } else { "not_ready" };

    let response = ReadinessResponse {
        status: status.to_string(),
        checks: ReadinessChecks {
            database: db_healthy,
            redis: redis_healthy,
        },
    };

    if all_healthy {
        Ok(Json(response))
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

/// Prometheus metrics in text exposition format
///
/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

// =============================================================================
// ACCOUNTS
// =============================================================================

/// Register a user, their wallet and an optional referral
///
/// POST /api/v1/users
///
/// # Request Body
/// ```json
/// { "name": "Ada", "email": "ada@example.com", "referral_code": "K3J9QX2B" }
/// ```
pub async fn register_user(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterUserRequest>,
) -> AppResult<(StatusCode, Json<RegisteredUser>)> {
    let start = Instant::now();

    let result =
        accounts::register_user(&state.db, request, state.config.referral_commission_rate).await;
    observe("POST", "/api/v1/users", start, &result);

    Ok((StatusCode::CREATED, Json(result?)))
}

// =============================================================================
// CATALOG
// =============================================================================

/// Catalog query string
///
/// # Example
/// GET /api/v1/products?search=icons&type=downloadable&min_price=5&page=2
#[derive(Debug, Deserialize)]
pub struct ProductQuery {
    pub search: Option<String>,

    #[serde(rename = "type")]
    pub product_type: Option<ProductType>,

    pub min_price: Option<Decimal>,
    pub max_price: Option<Decimal>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

/// List active products, newest first
///
/// GET /api/v1/products
pub async fn list_products(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProductQuery>,
) -> AppResult<Json<ProductListResponse>> {
    let start = Instant::now();

    let page = query.page.unwrap_or(1).clamp(1, db::MAX_PAGE);
    let per_page = query.per_page.unwrap_or(PRODUCTS_PER_PAGE).clamp(1, MAX_PER_PAGE);
    let filter = ProductFilter {
        search: query.search,
        product_type: query.product_type,
        min_price: query.min_price,
        max_price: query.max_price,
    };

    let result = state.db.list_products(&filter, page, per_page).await;
    observe("GET", "/api/v1/products", start, &result);
    let (items, total) = result?;

    Ok(Json(ProductListResponse {
        items,
        total,
        page,
        per_page,
    }))
}

/// One active product with its available stock
///
/// GET /api/v1/products/:id
///
/// Served from Redis when cached; the entry is dropped whenever an order
/// changes the product's stock.
pub async fn get_product(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ProductView>> {
    let start = Instant::now();
    let result = load_product_view(&state, id).await;
    observe("GET", "/api/v1/products/:id", start, &result);
    result.map(Json)
}

async fn load_product_view(state: &AppState, id: Uuid) -> AppResult<ProductView> {
    let cache_key = product_cache_key(id);

    let redis_start = Instant::now();
    let cached = redis::cmd("GET")
        .arg(&cache_key)
        .query_async::<_, Option<String>>(&mut state.redis.clone())
        .await
        .ok()
        .flatten();
    metrics::record_redis_operation("get", redis_start.elapsed().as_secs_f64());

    if let Some(view) = cached.and_then(|json| serde_json::from_str::<ProductView>(&json).ok()) {
        return Ok(view);
    }

    let product = state
        .db
        .get_product(id)
        .await?
        .filter(|p| p.is_active)
        .ok_or_else(|| AppError::NotFound("Product not found".to_string()))?;

    let available_stock = state.db.available_stock(&product).await?;
    let view = ProductView {
        product,
        available_stock,
    };

    if let Ok(json) = serde_json::to_string(&view) {
        let redis_start = Instant::now();
        let _: Result<(), _> = redis::cmd("SETEX")
            .arg(&cache_key)
            .arg(state.config.product_cache_ttl_secs)
            .arg(json)
            .query_async(&mut state.redis.clone())
            .await;
        metrics::record_redis_operation("set", redis_start.elapsed().as_secs_f64());
    }

    Ok(view)
}

// =============================================================================
// ORDERS
// =============================================================================

/// Place an order
///
/// POST /api/v1/orders
///
/// # Response
/// - 201 Created: order placed (delivered for downloads, processing for credentials)
/// - 404 Not Found: product missing or inactive
/// - 409 Conflict: insufficient funds or stock, or no wallet
/// - 500: order processing failed, nothing was charged
pub async fn place_order(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Json(request): Json<PlaceOrderRequest>,
) -> AppResult<(StatusCode, Json<PlacedOrder>)> {
    let start = Instant::now();

    tracing::info!(
        user_id = %user.id,
        product_id = %request.product_id,
        quantity = request.quantity,
        "Placing order"
    );

    let result =
        orchestrator::place_order(&state.db, &user, request.product_id, request.quantity).await;
    observe("POST", "/api/v1/orders", start, &result);
    let placed = result?;

    // After commit, outside the transaction
    invalidate_product(&state, placed.order.product_id).await;

    Ok((StatusCode::CREATED, Json(placed)))
}

/// The caller's orders, newest first
///
/// GET /api/v1/orders?page=1
pub async fn list_orders(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Query(params): Query<PageParams>,
) -> AppResult<Json<OrderListResponse>> {
    let start = Instant::now();
    let page = params.page();

    let result = async {
        let items = orders::list_orders_for_user(
            state.db.pool(),
            user.id,
            ORDERS_PER_PAGE,
            db::page_offset(page, ORDERS_PER_PAGE),
        )
        .await?;
        let total = orders::count_orders_for_user(state.db.pool(), user.id).await?;
        Ok::<_, AppError>(OrderListResponse {
            items,
            total,
            page,
            per_page: ORDERS_PER_PAGE,
        })
    }
    .await;

    observe("GET", "/api/v1/orders", start, &result);
    result.map(Json)
}

async fn viewable_order(state: &AppState, user: &User, id: Uuid) -> AppResult<Order> {
    let order = orders::find_order(state.db.pool(), id)
        .await?
        .ok_or_else(|| AppError::NotFound("Order not found".to_string()))?;

    if !orders::can_view_order(user, &order) {
        return Err(AppError::AuthorizationDenied(
            "You cannot access this order".to_string(),
        ));
    }
    Ok(order)
}

/// Order detail with product, assigned credentials and warranty state
///
/// GET /api/v1/orders/:id
pub async fn get_order(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<OrderDetail>> {
    let start = Instant::now();

    let result = async {
        let order = viewable_order(&state, &user, id).await?;
        let product = db::find_product(state.db.pool(), order.product_id).await?;
        let inventory_items = allocator::items_for_order(state.db.pool(), order.id).await?;
        let warranty_expired = order.is_warranty_expired(Utc::now());
        Ok::<_, AppError>(OrderDetail {
            order,
            product,
            inventory_items,
            warranty_expired,
        })
    }
    .await;

    observe("GET", "/api/v1/orders/:id", start, &result);
    result.map(Json)
}

/// Stream the file of a delivered downloadable order
///
/// GET /api/v1/orders/:id/download
pub async fn download_order(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<Response> {
    let start = Instant::now();

    let result = async {
        let order = viewable_order(&state, &user, id).await?;
        let product = db::find_product(state.db.pool(), order.product_id).await?;

        let file_exists = match product.as_ref().and_then(|p| p.download_file.as_deref()) {
            Some(file) => tokio::fs::try_exists(state.config.download_dir.join(file))
                .await
                .unwrap_or(false),
            None => false,
        };

        let path = orders::authorize_download(
            &user,
            &order,
            product.as_ref(),
            &state.config.download_dir,
            file_exists,
        )?;

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|_| AppError::NotFound("File not found".to_string()))?;

        // authorize_download only succeeds with a product
        let file_name = product
            .as_ref()
            .map(orders::download_file_name)
            .unwrap_or_default()
            .replace('"', "");
        let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{file_name}\""))
            .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

        tracing::info!(order_number = %order.order_number, user_id = %user.id, "File downloaded");

        Ok::<_, AppError>(
            (
                [
                    (
                        header::CONTENT_TYPE,
                        HeaderValue::from_static("application/octet-stream"),
                    ),
                    (header::CONTENT_DISPOSITION, disposition),
                ],
                bytes,
            )
                .into_response(),
        )
    }
    .await;

    observe("GET", "/api/v1/orders/:id/download", start, &result);
    result
}

/// Admin: deliver a processing credential order
///
/// POST /api/v1/orders/:id/deliver
pub async fn deliver_order(
    State(state): State<Arc<AppState>>,
    CurrentUser(admin): CurrentUser,
    Path(id): Path<Uuid>,
    body: Option<Json<DeliverOrderRequest>>,
) -> AppResult<Json<Order>> {
    let start = Instant::now();
    let notes = body.and_then(|Json(b)| b.notes);

    let result = fulfilment::deliver_order(&state.db, &admin, id, notes).await;
    observe("POST", "/api/v1/orders/:id/deliver", start, &result);
    result.map(Json)
}

/// Admin: refund a processing credential order
///
/// POST /api/v1/orders/:id/refund
pub async fn refund_order(
    State(state): State<Arc<AppState>>,
    CurrentUser(admin): CurrentUser,
    Path(id): Path<Uuid>,
    body: Option<Json<RefundOrderRequest>>,
) -> AppResult<Json<Order>> {
    let start = Instant::now();
    let reason = body.and_then(|Json(b)| b.reason);

    let result = fulfilment::refund_order(&state.db, &admin, id, reason).await;
    observe("POST", "/api/v1/orders/:id/refund", start, &result);
    result.map(Json)
}

// =============================================================================
// WALLET
// =============================================================================

/// Balances, ledger rows and referral earnings of the caller
///
/// GET /api/v1/wallet?page=1
pub async fn wallet_overview(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Query(params): Query<PageParams>,
) -> AppResult<Json<WalletOverview>> {
    let start = Instant::now();
    let page = params.page();

    let result = async {
        let wallet = state
            .db
            .find_wallet(user.id)
            .await?
            .ok_or(AppError::WalletMissing)?;
        let (transactions, total_transactions) = state
            .db
            .list_transactions(user.id, page, TRANSACTIONS_PER_PAGE)
            .await?;
        let referral_earnings = commission::referral_earnings(state.db.pool(), user.id).await?;

        Ok::<_, AppError>(WalletOverview {
            available_balance: wallet.available(),
            wallet,
            transactions,
            total_transactions,
            page,
            per_page: TRANSACTIONS_PER_PAGE,
            referral_earnings,
        })
    }
    .await;

    observe("GET", "/api/v1/wallet", start, &result);
    result.map(Json)
}

/// Submit a deposit for admin review
///
/// POST /api/v1/wallet/deposits
pub async fn submit_deposit(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Json(request): Json<DepositRequest>,
) -> AppResult<(StatusCode, Json<WalletTransaction>)> {
    let start = Instant::now();

    let result = deposits::submit_deposit(&state.db, &user, request).await;
    observe("POST", "/api/v1/wallet/deposits", start, &result);

    Ok((StatusCode::CREATED, Json(result?)))
}

// =============================================================================
// ADMIN
// =============================================================================

/// GET /api/v1/admin/deposits
pub async fn pending_deposits(
    State(state): State<Arc<AppState>>,
    CurrentUser(admin): CurrentUser,
) -> AppResult<Json<Vec<WalletTransaction>>> {
    let start = Instant::now();
    let result = deposits::list_pending_deposits(&state.db, &admin).await;
    observe("GET", "/api/v1/admin/deposits", start, &result);
    result.map(Json)
}

/// POST /api/v1/admin/deposits/:id/approve
pub async fn approve_deposit(
    State(state): State<Arc<AppState>>,
    CurrentUser(admin): CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<WalletTransaction>> {
    let start = Instant::now();
    let result = deposits::review_deposit(&state.db, &admin, id, true).await;
    observe("POST", "/api/v1/admin/deposits/:id/approve", start, &result);
    result.map(Json)
}

/// POST /api/v1/admin/deposits/:id/reject
pub async fn reject_deposit(
    State(state): State<Arc<AppState>>,
    CurrentUser(admin): CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<WalletTransaction>> {
    let start = Instant::now();
    let result = deposits::review_deposit(&state.db, &admin, id, false).await;
    observe("POST", "/api/v1/admin/deposits/:id/reject", start, &result);
    result.map(Json)
}
