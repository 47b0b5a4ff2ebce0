mod common;

use chrono::Duration;
use marketplace_service::error::AppError;
use marketplace_service::models::{DepositRequest, OrderStatus, TransactionStatus};
use marketplace_service::{allocator, deposits, fulfilment, orchestrator};
use rust_decimal_macros::dec;

#[tokio::test]
async fn delivery_spends_the_escrow_hold_and_starts_the_warranty() {
    let Some(db) = common::test_db().await else { return };
    let admin = common::admin(&db).await;
    let user = common::buyer(&db, dec!(50.00)).await;
    let product = common::credential(&db, dec!(15.00), 5, 14).await;

    let placed = orchestrator::place_order(&db, &user, product.id, 2).await.unwrap();
    let order = fulfilment::deliver_order(&db, &admin, placed.order.id, Some("sent by email".into()))
        .await
        .unwrap();

    assert_eq!(order.status, OrderStatus::Delivered);
    assert_eq!(order.delivery_notes.as_deref(), Some("sent by email"));
    let delivered = order.delivered_at.unwrap();
    assert_eq!(order.warranty_expires_at, Some(delivered + Duration::days(14)));

    let wallet = db.find_wallet(user.id).await.unwrap().unwrap();
    assert_eq!(wallet.balance, dec!(20.00));
    assert_eq!(wallet.escrow_balance, dec!(0.00));

    let err = fulfilment::deliver_order(&db, &admin, order.id, None).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidOrderState(_)));
}

#[tokio::test]
async fn refund_returns_the_hold_and_keeps_records_assigned() {
    let Some(db) = common::test_db().await else { return };
    let admin = common::admin(&db).await;
    let user = common::buyer(&db, dec!(50.00)).await;
    let product = common::credential(&db, dec!(15.00), 5, 0).await;

    let placed = orchestrator::place_order(&db, &user, product.id, 2).await.unwrap();
    let order = fulfilment::refund_order(&db, &admin, placed.order.id, Some("dead seat".into()))
        .await
        .unwrap();

    assert_eq!(order.status, OrderStatus::Refunded);
    let wallet = db.find_wallet(user.id).await.unwrap().unwrap();
    assert_eq!(wallet.balance, dec!(50.00));
    assert_eq!(wallet.escrow_balance, dec!(0.00));
    assert_eq!(common::count_transactions(&db, user.id, "refund").await, 1);

    assert_eq!(allocator::items_for_order(db.pool(), order.id).await.unwrap().len(), 2);
    assert_eq!(allocator::count_available(db.pool(), product.id).await.unwrap(), 3);
}

#[tokio::test]
async fn buyers_cannot_fulfil_their_own_orders() {
    let Some(db) = common::test_db().await else { return };
    let user = common::buyer(&db, dec!(50.00)).await;
    let product = common::credential(&db, dec!(15.00), 1, 0).await;

    let placed = orchestrator::place_order(&db, &user, product.id, 1).await.unwrap();

    let err = fulfilment::deliver_order(&db, &user, placed.order.id, None).await.unwrap_err();
    assert!(matches!(err, AppError::AuthorizationDenied(_)));
    let err = fulfilment::refund_order(&db, &user, placed.order.id, None).await.unwrap_err();
    assert!(matches!(err, AppError::AuthorizationDenied(_)));
}

#[tokio::test]
async fn approved_deposit_credits_the_wallet_once() {
    let Some(db) = common::test_db().await else { return };
    let admin = common::admin(&db).await;
    let user = common::buyer(&db, dec!(0.00)).await;

    let pending = deposits::submit_deposit(
        &db,
        &user,
        DepositRequest {
            amount: dec!(75.00),
            external_reference: "BANK-991".into(),
            proof_reference: "receipt-991.png".into(),
            notes: None,
        },
    )
    .await
    .unwrap();
    assert_eq!(pending.status, TransactionStatus::Pending);

    let queue = deposits::list_pending_deposits(&db, &admin).await.unwrap();
    assert!(queue.iter().any(|t| t.id == pending.id));

    let approved = deposits::review_deposit(&db, &admin, pending.id, true).await.unwrap();
    assert_eq!(approved.status, TransactionStatus::Approved);
    assert_eq!(approved.processed_by, Some(admin.id));
    assert!(approved.processed_at.is_some());

    let wallet = db.find_wallet(user.id).await.unwrap().unwrap();
    assert_eq!(wallet.balance, dec!(75.00));

    let err = deposits::review_deposit(&db, &admin, pending.id, true).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidOrderState(_)));
    let wallet = db.find_wallet(user.id).await.unwrap().unwrap();
    assert_eq!(wallet.balance, dec!(75.00));
}

#[tokio::test]
async fn rejected_deposit_leaves_the_wallet_alone() {
    let Some(db) = common::test_db().await else { return };
    let admin = common::admin(&db).await;
    let user = common::buyer(&db, dec!(5.00)).await;

    let pending = deposits::submit_deposit(
        &db,
        &user,
        DepositRequest {
            amount: dec!(20.00),
            external_reference: "BANK-992".into(),
            proof_reference: "receipt-992.png".into(),
            notes: Some("second try".into()),
        },
    )
    .await
    .unwrap();

    let err = deposits::review_deposit(&db, &user, pending.id, true).await.unwrap_err();
    assert!(matches!(err, AppError::AuthorizationDenied(_)));

    let rejected = deposits::review_deposit(&db, &admin, pending.id, false).await.unwrap();
    assert_eq!(rejected.status, TransactionStatus::Rejected);

    let wallet = db.find_wallet(user.id).await.unwrap().unwrap();
    assert_eq!(wallet.balance, dec!(5.00));
}
