mod common;

use chrono::Duration;
use marketplace_service::allocator;
use marketplace_service::db;
use marketplace_service::error::AppError;
use marketplace_service::models::{OrderStatus, ProductFilter, TransactionKind};
use marketplace_service::{ledger, orchestrator};
use rust_decimal_macros::dec;
use std::collections::HashSet;
use uuid::Uuid;

#[tokio::test]
async fn downloadable_purchase_debits_and_delivers_at_once() {
    let Some(db) = common::test_db().await else { return };
    let user = common::buyer(&db, dec!(100.00)).await;
    let product = common::downloadable(&db, dec!(20.00), 10, 30).await;

    let placed = orchestrator::place_order(&db, &user, product.id, 3).await.unwrap();

    assert_eq!(placed.order.status, OrderStatus::Delivered);
    assert_eq!(placed.order.total_price, dec!(60.00));
    assert!(placed.order.order_number.starts_with("ORD-"));
    assert!(placed.inventory_items.is_empty());
    assert_eq!(placed.wallet.balance, dec!(40.00));
    assert_eq!(placed.wallet.escrow_balance, dec!(0.00));

    let delivered = placed.order.delivered_at.unwrap();
    assert_eq!(placed.order.warranty_expires_at, Some(delivered + Duration::days(30)));

    let after = db.get_product(product.id).await.unwrap().unwrap();
    assert_eq!(after.stock_quantity, 7);

    let (rows, total) = db.list_transactions(user.id, 1, 15).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(rows[0].kind, TransactionKind::Purchase);
    assert_eq!(rows[0].amount, dec!(60.00));
    assert_eq!(
        rows[0].notes.as_deref(),
        Some(format!("Purchase of Icon Pack (Order: {})", placed.order.order_number).as_str())
    );
}

#[tokio::test]
async fn credential_purchase_holds_escrow_and_assigns_records() {
    let Some(db) = common::test_db().await else { return };
    let user = common::buyer(&db, dec!(50.00)).await;
    let product = common::credential(&db, dec!(15.00), 5, 0).await;

    let placed = orchestrator::place_order(&db, &user, product.id, 2).await.unwrap();

    assert_eq!(placed.order.status, OrderStatus::Processing);
    assert_eq!(placed.wallet.balance, dec!(50.00));
    assert_eq!(placed.wallet.escrow_balance, dec!(30.00));
    assert_eq!(placed.wallet.available(), dec!(20.00));

    assert_eq!(placed.inventory_items.len(), 2);
    assert!(placed
        .inventory_items
        .iter()
        .all(|i| i.is_used && i.order_id == Some(placed.order.id) && i.assigned_at.is_some()));

    let assigned = allocator::items_for_order(db.pool(), placed.order.id).await.unwrap();
    assert_eq!(assigned.len(), 2);
    assert_eq!(allocator::count_available(db.pool(), product.id).await.unwrap(), 3);
    assert_eq!(common::count_transactions(&db, user.id, "purchase").await, 1);
}

#[tokio::test]
async fn preconditions_fail_without_side_effects() {
    let Some(db) = common::test_db().await else { return };
    let user = common::buyer(&db, dec!(10.00)).await;
    let product = common::downloadable(&db, dec!(20.00), 10, 0).await;

    let err = orchestrator::place_order(&db, &user, product.id, 1).await.unwrap_err();
    assert!(matches!(err, AppError::InsufficientFunds { .. }));

    let rich = common::buyer(&db, dec!(1000.00)).await;
    let err = orchestrator::place_order(&db, &rich, product.id, 11).await.unwrap_err();
    match err {
        AppError::InsufficientStock { available, requested } => {
            assert_eq!(available, 10);
            assert_eq!(requested, 11);
        }
        other => panic!("expected InsufficientStock, got {other:?}"),
    }

    let err = orchestrator::place_order(&db, &rich, Uuid::new_v4(), 1).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let wallet = db.find_wallet(user.id).await.unwrap().unwrap();
    assert_eq!(wallet.balance, dec!(10.00));
    assert_eq!(db.get_product(product.id).await.unwrap().unwrap().stock_quantity, 10);
    assert_eq!(common::count_transactions(&db, user.id, "purchase").await, 0);
    assert_eq!(common::count_transactions(&db, rich.id, "purchase").await, 0);
}

#[tokio::test]
async fn inactive_products_cannot_be_bought() {
    let Some(db) = common::test_db().await else { return };
    let user = common::buyer(&db, dec!(100.00)).await;
    let product = common::downloadable(&db, dec!(5.00), 10, 0).await;

    sqlx::query("UPDATE products SET is_active = FALSE WHERE id = $1")
        .bind(product.id)
        .execute(db.pool())
        .await
        .unwrap();

    let err = orchestrator::place_order(&db, &user, product.id, 1).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn buyer_without_wallet_is_rejected() {
    let Some(db) = common::test_db().await else { return };
    let user = common::buyer(&db, dec!(100.00)).await;
    let product = common::downloadable(&db, dec!(5.00), 10, 0).await;

    sqlx::query("DELETE FROM wallets WHERE user_id = $1")
        .bind(user.id)
        .execute(db.pool())
        .await
        .unwrap();

    let err = orchestrator::place_order(&db, &user, product.id, 1).await.unwrap_err();
    assert!(matches!(err, AppError::WalletMissing));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_buyers_never_share_a_credential_record() {
    let Some(db) = common::test_db().await else { return };
    const BUYERS: usize = 8;
    let product = common::credential(&db, dec!(5.00), BUYERS - 1, 0).await;

    let mut buyers = Vec::new();
    for _ in 0..BUYERS {
        buyers.push(common::buyer(&db, dec!(50.00)).await);
    }

    let product_id = product.id;
    let handles: Vec<_> = buyers
        .into_iter()
        .map(|user| {
            let db = db.clone();
            tokio::spawn(async move { orchestrator::place_order(&db, &user, product_id, 1).await })
        })
        .collect();

    let mut placed = Vec::new();
    let mut failures = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(order) => placed.push(order),
            Err(err) => failures.push(err),
        }
    }

    assert_eq!(placed.len(), BUYERS - 1);
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        failures[0],
        AppError::InsufficientStock { .. } | AppError::OrderProcessingFailed
    ));

    let mut seen = HashSet::new();
    for order in &placed {
        assert_eq!(order.inventory_items.len(), 1);
        assert!(seen.insert(order.inventory_items[0].id), "record assigned twice");
    }

    let assigned_orders: i64 = sqlx::query_scalar(
        "SELECT COUNT(DISTINCT order_id) FROM inventory_items WHERE product_id = $1 AND is_used",
    )
    .bind(product.id)
    .fetch_one(db.pool())
    .await
    .unwrap();
    assert_eq!(assigned_orders, (BUYERS - 1) as i64);
    assert_eq!(allocator::count_available(db.pool(), product.id).await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_orders_from_one_wallet_never_overdraw() {
    let Some(db) = common::test_db().await else { return };
    let user = common::buyer(&db, dec!(50.00)).await;
    let product = common::downloadable(&db, dec!(20.00), 100, 0).await;

    let product_id = product.id;
    let handles: Vec<_> = (0..5)
        .map(|_| {
            let db = db.clone();
            let user = user.clone();
            tokio::spawn(async move { orchestrator::place_order(&db, &user, product_id, 1).await })
        })
        .collect();

    let mut succeeded = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            succeeded += 1;
        }
    }

    assert_eq!(succeeded, 2);
    let wallet = db.find_wallet(user.id).await.unwrap().unwrap();
    assert_eq!(wallet.balance, dec!(10.00));
    assert!(wallet.escrow_balance >= dec!(0) && wallet.escrow_balance <= wallet.balance);
    assert_eq!(db.get_product(product.id).await.unwrap().unwrap().stock_quantity, 98);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn thousand_concurrent_order_numbers_are_unique() {
    let Some(db) = common::test_db().await else { return };
    let user = common::buyer(&db, dec!(0.00)).await;
    let product = common::downloadable(&db, dec!(1.00), 0, 0).await;

    let user_id = user.id;
    let handles: Vec<_> = (0..1000)
        .map(|_| {
            let db = db.clone();
            let product = product.clone();
            tokio::spawn(async move {
                let mut tx = db.pool().begin().await.unwrap();
                let order =
                    orchestrator::insert_with_unique_number(&mut *tx, user_id, &product, 1)
                        .await
                        .unwrap();
                tx.commit().await.unwrap();
                order.order_number
            })
        })
        .collect();

    let mut numbers = HashSet::new();
    for handle in handles {
        numbers.insert(handle.await.unwrap());
    }
    assert_eq!(numbers.len(), 1000);
}

#[tokio::test]
async fn wallet_locking_round_trips_balances() {
    let Some(db) = common::test_db().await else { return };
    let user = common::buyer(&db, dec!(25.00)).await;

    let mut tx = db.pool().begin().await.unwrap();
    let mut wallet = ledger::lock_wallet(&mut *tx, user.id).await.unwrap().unwrap();
    wallet.move_to_escrow(dec!(5.00)).unwrap();
    ledger::store_wallet(&mut *tx, &wallet).await.unwrap();
    tx.rollback().await.unwrap();

    let wallet = db.find_wallet(user.id).await.unwrap().unwrap();
    assert_eq!(wallet.escrow_balance, dec!(0.00));
    assert_eq!(wallet.balance, dec!(25.00));
}

#[tokio::test]
async fn out_of_range_pages_come_back_empty() {
    let Some(db) = common::test_db().await else { return };
    let user = common::buyer(&db, dec!(0.00)).await;

    let (items, total) = db
        .list_products(&ProductFilter::default(), i64::MAX, 12)
        .await
        .unwrap();
    assert!(items.is_empty() || total > 12 * (db::MAX_PAGE - 1));

    let (rows, total) = db.list_transactions(user.id, i64::MAX, 15).await.unwrap();
    assert!(rows.is_empty());
    assert_eq!(total, 0);
}
