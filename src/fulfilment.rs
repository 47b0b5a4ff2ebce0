// =============================================================================
// FULFILMENT
// =============================================================================
// Admin side of credential orders: an order waiting in `processing` is
// either delivered (the escrow hold becomes a spend) or refunded (the hold
// goes back to the buyer).
//
// Both run in one transaction with the order row locked first, then the
// buyer's wallet. Assigned credential records are not returned to the pool
// on refund.
// =============================================================================

use chrono::Utc;
use uuid::Uuid;

use crate::db::{self, Database};
use crate::error::{AppError, AppResult};
use crate::ledger;
use crate::metrics;
use crate::models::{NewTransaction, Order, OrderStatus, TransactionKind, User};
use crate::orders;

fn require_admin(user: &User) -> AppResult<()> {
    if !user.is_admin {
        return Err(AppError::AuthorizationDenied(
            "Administrator access required".to_string(),
        ));
    }
    Ok(())
}

fn require_processing(order: &Order) -> AppResult<()> {
    if order.status != OrderStatus::Processing {
        return Err(AppError::InvalidOrderState(format!(
            "order {} is {}, expected processing",
            order.order_number,
            order.status.as_str()
        )));
    }
    Ok(())
}

/// Deliver a credential order: spend the escrow hold and start the warranty
pub async fn deliver_order(
    db: &Database,
    admin: &User,
    order_id: Uuid,
    notes: Option<String>,
) -> AppResult<Order> {
    require_admin(admin)?;

    let mut tx = db.pool().begin().await?;

    let mut order = orders::lock_order(&mut *tx, order_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Order not found".to_string()))?;
    require_processing(&order)?;

    let mut wallet = ledger::lock_wallet(&mut *tx, order.user_id)
        .await?
        .ok_or(AppError::WalletMissing)?;
    let released = wallet.release_from_escrow(order.total_price);
    metrics::record_ledger_operation("release", released.is_ok());
    released?;

    let warranty_days = db::find_product(&mut *tx, order.product_id)
        .await?
        .map(|p| p.warranty_days);
    order.mark_delivered(warranty_days, notes, Utc::now())?;

    let order = orders::save_order_state(&mut *tx, &order).await?;
    ledger::store_wallet(&mut *tx, &wallet).await?;

    tx.commit().await?;

    tracing::info!(
        order_number = %order.order_number,
        admin_id = %admin.id,
        "Order delivered"
    );
    Ok(order)
}

/// Refund a credential order: give the escrow hold back to the buyer
pub async fn refund_order(
    db: &Database,
    admin: &User,
    order_id: Uuid,
    reason: Option<String>,
) -> AppResult<Order> {
    require_admin(admin)?;

    let mut tx = db.pool().begin().await?;

    let mut order = orders::lock_order(&mut *tx, order_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Order not found".to_string()))?;
    require_processing(&order)?;

    let mut wallet = ledger::lock_wallet(&mut *tx, order.user_id)
        .await?
        .ok_or(AppError::WalletMissing)?;
    let returned = wallet.return_from_escrow(order.total_price);
    metrics::record_ledger_operation("return", returned.is_ok());
    returned?;

    order.mark_refunded()?;
    let order = orders::save_order_state(&mut *tx, &order).await?;
    ledger::store_wallet(&mut *tx, &wallet).await?;

    let notes = match reason.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
        Some(reason) => format!("Refund for order {}: {reason}", order.order_number),
        None => format!("Refund for order {}", order.order_number),
    };
    ledger::append_transaction(
        &mut *tx,
        &NewTransaction::completed(order.user_id, TransactionKind::Refund, order.total_price, notes),
    )
    .await?;

    tx.commit().await?;

    tracing::info!(
        order_number = %order.order_number,
        admin_id = %admin.id,
        amount = %order.total_price,
        "Order refunded"
    );
    Ok(order)
}
