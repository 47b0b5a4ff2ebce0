// =============================================================================
// ORDER ORCHESTRATOR
// =============================================================================
// Places an order: checks preconditions, then runs one atomic section that
// creates the order, moves the money, takes the stock and pays the referral
// commission.
//
// FLOW:
// 1. Preconditions on unlocked reads. They fail fast with a specific error
//    and have no side effects.
// 2. Atomic section in a single transaction. Every check is repeated on
//    locked rows, so a precondition that went stale in between is caught.
//    Any failure rolls the whole section back and the caller sees
//    OrderProcessingFailed; the cause only goes to the log.
//
// LOCK ORDER: buyer wallet -> product row or inventory rows -> referral ->
// referrer wallet.
// =============================================================================

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::allocator;
use crate::commission;
use crate::db::{self, Database};
use crate::error::{AppError, AppResult};
use crate::ledger;
use crate::metrics;
use crate::models::{
    NewTransaction, Order, PlacedOrder, Product, ProductType, TransactionKind, User,
};
use crate::orders;

/// Order numbers are random; a clash just means drawing again
const MAX_ORDER_NUMBER_ATTEMPTS: u32 = 10;

/// Place an order for `quantity` units of `product_id` on behalf of `user`.
///
/// # Returns
/// * `Ok(PlacedOrder)` - committed order, assigned records, buyer's wallet after
/// * `Err(BadRequest | NotFound | WalletMissing | InsufficientFunds | InsufficientStock)`
///   - a precondition failed; nothing was written
/// * `Err(OrderProcessingFailed)` - the atomic section failed and was rolled back
pub async fn place_order(
    db: &Database,
    user: &User,
    product_id: Uuid,
    quantity: i32,
) -> AppResult<PlacedOrder> {
    let product = match load_product(db, product_id, quantity).await {
        Ok(product) => product,
        Err(err) => return Err(reject(user, product_id, quantity, None, err)),
    };

    if let Err(err) = check_affordable(db, user, &product, quantity).await {
        return Err(reject(user, product_id, quantity, Some(product.product_type), err));
    }

    execute(db, user, &product, quantity).await
}

/// Metric label for a rejected order; the type is unknown until the product loads
fn rejection_label(product_type: Option<ProductType>) -> &'static str {
    product_type.map_or("unknown", |t| t.as_str())
}

fn reject(
    user: &User,
    product_id: Uuid,
    quantity: i32,
    product_type: Option<ProductType>,
    err: AppError,
) -> AppError {
    let label = rejection_label(product_type);
    metrics::record_order(label, "rejected");
    tracing::info!(
        user_id = %user.id,
        product_id = %product_id,
        product_type = label,
        quantity,
        reason = %err,
        "Order rejected"
    );
    err
}

async fn load_product(db: &Database, product_id: Uuid, quantity: i32) -> AppResult<Product> {
    if quantity <= 0 {
        return Err(AppError::BadRequest("Quantity must be at least 1".to_string()));
    }

    db.get_product(product_id)
        .await?
        .filter(|p| p.is_active)
        .ok_or_else(|| AppError::NotFound("Product not found".to_string()))
}

async fn check_affordable(
    db: &Database,
    user: &User,
    product: &Product,
    quantity: i32,
) -> AppResult<()> {
    let wallet = db.find_wallet(user.id).await?.ok_or(AppError::WalletMissing)?;

    let total = product.price * Decimal::from(quantity);
    if wallet.available() < total {
        return Err(AppError::InsufficientFunds {
            available: wallet.available(),
            requested: total,
        });
    }

    let available = db.available_stock(product).await?;
    if available < i64::from(quantity) {
        return Err(AppError::InsufficientStock {
            available,
            requested: i64::from(quantity),
        });
    }

    Ok(())
}

/// Run the atomic section and turn every failure into OrderProcessingFailed
async fn execute(
    db: &Database,
    user: &User,
    product: &Product,
    quantity: i32,
) -> AppResult<PlacedOrder> {
    let product_type = product.product_type.as_str();

    let outcome = async {
        let mut tx = db.pool().begin().await?;
        let placed = atomic_section(&mut *tx, user, product, quantity).await?;
        tx.commit().await?;
        Ok::<_, AppError>(placed)
    }
    .await;

    // The transaction was dropped without commit on the error path, which
    // rolls it back.
    match outcome {
        Ok(placed) => {
            metrics::record_order(product_type, "success");
            metrics::record_order_value(
                product_type,
                placed.order.total_price.to_f64().unwrap_or_default(),
            );
            tracing::info!(
                order_number = %placed.order.order_number,
                user_id = %user.id,
                product_id = %product.id,
                quantity,
                total = %placed.order.total_price,
                status = placed.order.status.as_str(),
                "Order placed"
            );
            Ok(placed)
        }
        Err(err) => {
            metrics::record_order(product_type, "failed");
            tracing::error!(
                user_id = %user.id,
                product_id = %product.id,
                quantity,
                error = %err,
                "Order processing failed, transaction rolled back"
            );
            Err(AppError::OrderProcessingFailed)
        }
    }
}

async fn atomic_section(
    conn: &mut PgConnection,
    user: &User,
    product: &Product,
    quantity: i32,
) -> AppResult<PlacedOrder> {
    let mut order = insert_with_unique_number(conn, user.id, product, quantity).await?;
    let total = order.total_price;

    let mut wallet = ledger::lock_wallet(conn, user.id)
        .await?
        .ok_or(AppError::WalletMissing)?;

    let inventory_items = match product.product_type {
        ProductType::Downloadable => {
            let debited = wallet.debit(total);
            metrics::record_ledger_operation("debit", debited.is_ok());
            debited?;

            let locked = db::lock_product(conn, product.id)
                .await?
                .ok_or_else(|| AppError::NotFound("Product not found".to_string()))?;
            if locked.stock_quantity < quantity {
                return Err(AppError::InsufficientStock {
                    available: i64::from(locked.stock_quantity),
                    requested: i64::from(quantity),
                });
            }
            db::decrement_stock(conn, product.id, quantity).await?;

            order.mark_delivered(Some(locked.warranty_days), None, Utc::now())?;
            Vec::new()
        }
        ProductType::Credential => {
            let held = wallet.move_to_escrow(total);
            metrics::record_ledger_operation("escrow", held.is_ok());
            held?;

            let items = allocator::allocate(conn, product.id, order.id, quantity).await?;
            order.mark_processing()?;
            items
        }
    };

    let order = orders::save_order_state(conn, &order).await?;
    let wallet = ledger::store_wallet(conn, &wallet).await?;

    ledger::append_transaction(
        conn,
        &NewTransaction::completed(
            user.id,
            TransactionKind::Purchase,
            total,
            format!("Purchase of {} (Order: {})", product.title, order.order_number),
        ),
    )
    .await?;

    commission::pay_commission(conn, user, total).await?;

    Ok(PlacedOrder {
        order,
        inventory_items,
        wallet,
    })
}

/// Insert a pending order, drawing order numbers until one is free.
///
/// The UNIQUE constraint on `order_number` is the only arbiter, so this is
/// safe under any number of concurrent callers.
pub async fn insert_with_unique_number(
    conn: &mut PgConnection,
    user_id: Uuid,
    product: &Product,
    quantity: i32,
) -> AppResult<Order> {
    let year = orders::current_year();

    for attempt in 1..=MAX_ORDER_NUMBER_ATTEMPTS {
        let number = orders::generate_order_number(year);
        if let Some(order) = orders::insert_order(conn, &number, user_id, product, quantity).await?
        {
            return Ok(order);
        }
        tracing::debug!(attempt, order_number = %number, "Order number taken, drawing again");
    }

    Err(AppError::Internal(format!(
        "no free order number after {MAX_ORDER_NUMBER_ATTEMPTS} attempts"
    )))
}

// =============================================================================
// TESTS
// =============================================================================
// Needs a PostgreSQL database in TEST_DATABASE_URL; skipped otherwise.
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn test_db() -> Option<Database> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let db = Database::connect(&url, 5).await.expect("connect");
        db.run_migrations().await.expect("migrate");
        Some(db)
    }

    async fn funded_user(db: &Database, balance: Decimal) -> User {
        let suffix = Uuid::new_v4().simple().to_string();
        let user: User = sqlx::query_as(
            r#"
            INSERT INTO users (name, email, referral_code)
            VALUES ($1, $2, $3)
            RETURNING id, name, email, referral_code, is_admin, created_at
            "#,
        )
        .bind("Rollback Buyer")
        .bind(format!("{suffix}@example.com"))
        .bind(suffix[..8].to_uppercase())
        .fetch_one(db.pool())
        .await
        .expect("insert user");

        sqlx::query("INSERT INTO wallets (user_id, balance) VALUES ($1, $2)")
            .bind(user.id)
            .bind(balance)
            .execute(db.pool())
            .await
            .expect("insert wallet");

        user
    }

    async fn credential_product(db: &Database, price: Decimal, records: usize) -> Product {
        let id: Uuid = sqlx::query_scalar(
            "INSERT INTO products (title, price, product_type) VALUES ('Seat', $1, 'credential') RETURNING id",
        )
        .bind(price)
        .fetch_one(db.pool())
        .await
        .expect("insert product");

        for n in 0..records {
            sqlx::query("INSERT INTO inventory_items (product_id, credentials) VALUES ($1, $2)")
                .bind(id)
                .bind(format!("seat-{n}"))
                .execute(db.pool())
                .await
                .expect("insert item");
        }

        db.get_product(id).await.expect("load").expect("exists")
    }

    #[tokio::test]
    async fn failed_section_leaves_no_trace() {
        let Some(db) = test_db().await else {
            eprintln!("TEST_DATABASE_URL not set, skipping");
            return;
        };

        let user = funded_user(&db, dec!(100.00)).await;
        let product = credential_product(&db, dec!(10.00), 2).await;

        // Skip the preconditions so the shortfall is found inside the section
        let err = execute(&db, &user, &product, 3).await.unwrap_err();
        assert!(matches!(err, AppError::OrderProcessingFailed));

        let orders: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM orders WHERE user_id = $1")
            .bind(user.id)
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(orders, 0);

        let transactions: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM wallet_transactions WHERE user_id = $1")
                .bind(user.id)
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert_eq!(transactions, 0);

        let wallet = db.find_wallet(user.id).await.unwrap().unwrap();
        assert_eq!(wallet.balance, dec!(100.00));
        assert_eq!(wallet.escrow_balance, dec!(0.00));

        let free = allocator::count_available(db.pool(), product.id).await.unwrap();
        assert_eq!(free, 2);
    }

    #[test]
    fn rejections_are_labelled_with_the_product_type_once_known() {
        assert_eq!(rejection_label(None), "unknown");
        assert_eq!(rejection_label(Some(ProductType::Credential)), "credential");
        assert_eq!(rejection_label(Some(ProductType::Downloadable)), "downloadable");
    }

    #[tokio::test]
    async fn zero_quantity_is_rejected_before_any_io() {
        let Some(db) = test_db().await else {
            eprintln!("TEST_DATABASE_URL not set, skipping");
            return;
        };

        let user = funded_user(&db, dec!(10.00)).await;
        let err = place_order(&db, &user, Uuid::new_v4(), 0).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }
}
