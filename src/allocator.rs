// =============================================================================
// INVENTORY ALLOCATOR
// =============================================================================
// Hands out unused credential records to an order, exactly once.
//
// HOW CONCURRENT ALLOCATIONS STAY APART:
// 1. Candidates are selected with FOR UPDATE SKIP LOCKED, so two orders
//    running at the same time never lock the same row; each one just moves
//    on to the next free record.
// 2. The claim itself is a compare-and-set (WHERE is_used = FALSE). If the
//    number of rows it flips differs from the number selected, the whole
//    allocation fails.
// 3. Allocation is all-or-nothing: asking for 3 and finding 2 fails with
//    InsufficientStock and the caller's transaction rolls back.
//
// Assigned records are never returned to the pool, not even on refund.
// =============================================================================

use sqlx::{PgConnection, PgExecutor};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::InventoryItem;

const ITEM_COLUMNS: &str =
    "id, product_id, credentials, is_used, order_id, assigned_at, created_at";

/// Claim `quantity` unassigned records of `product_id` for `order_id`.
///
/// Must run inside the order's transaction: the row locks taken here are
/// what keep a concurrent allocation from seeing the same records.
///
/// # Returns
/// * `Ok(items)` - exactly `quantity` records, oldest first, now assigned
/// * `Err(InsufficientStock)` - fewer than `quantity` records were free
pub async fn allocate(
    conn: &mut PgConnection,
    product_id: Uuid,
    order_id: Uuid,
    quantity: i32,
) -> AppResult<Vec<InventoryItem>> {
    if quantity <= 0 {
        return Err(AppError::BadRequest("Quantity must be at least 1".to_string()));
    }

    let candidates: Vec<Uuid> = sqlx::query_scalar(
        r#"
        SELECT id
        FROM inventory_items
        WHERE product_id = $1 AND is_used = FALSE
        ORDER BY created_at ASC, id ASC
        LIMIT $2
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(product_id)
    .bind(i64::from(quantity))
    .fetch_all(&mut *conn)
    .await?;

    if let Err(err) = ensure_complete(candidates.len(), quantity) {
        metrics::record_allocation(false);
        return Err(err);
    }

    let mut items = sqlx::query_as::<_, InventoryItem>(&format!(
        r#"
        UPDATE inventory_items
        SET is_used = TRUE, order_id = $1, assigned_at = NOW()
        WHERE id = ANY($2) AND is_used = FALSE
        RETURNING {ITEM_COLUMNS}
        "#
    ))
    .bind(order_id)
    .bind(&candidates)
    .fetch_all(&mut *conn)
    .await?;

    if items.len() != candidates.len() {
        metrics::record_allocation(false);
        return Err(AppError::Internal(format!(
            "claimed {} of {} locked inventory records",
            items.len(),
            candidates.len()
        )));
    }

    items.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
    metrics::record_allocation(true);

    Ok(items)
}

/// Number of unassigned records for a credential product
pub async fn count_available<'e, E>(executor: E, product_id: Uuid) -> AppResult<i64>
where
    E: PgExecutor<'e>,
{
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM inventory_items WHERE product_id = $1 AND is_used = FALSE",
    )
    .bind(product_id)
    .fetch_one(executor)
    .await?;

    Ok(count)
}

/// Records assigned to an order, in assignment order
pub async fn items_for_order<'e, E>(executor: E, order_id: Uuid) -> AppResult<Vec<InventoryItem>>
where
    E: PgExecutor<'e>,
{
    let items = sqlx::query_as::<_, InventoryItem>(&format!(
        "SELECT {ITEM_COLUMNS} FROM inventory_items WHERE order_id = $1 ORDER BY created_at, id"
    ))
    .bind(order_id)
    .fetch_all(executor)
    .await?;

    Ok(items)
}

/// Partial allocation is never allowed
fn ensure_complete(found: usize, requested: i32) -> AppResult<()> {
    let found = found as i64;
    let requested = i64::from(requested);
    if found < requested {
        return Err(AppError::InsufficientStock {
            available: found,
            requested,
        });
    }
    Ok(())
}
