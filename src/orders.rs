// =============================================================================
// ORDERS MODULE
// =============================================================================
// Order lifecycle, order numbers and access rules.
//
// STATE MACHINE:
//
//   pending ──► delivered            (downloadable: paid and delivered at once)
//      │
//      └─────► processing ──► delivered   (credential: admin fulfils)
//                    │
//                    └──────► refunded    (credential: admin refunds)
//
// delivered and refunded are terminal.
// =============================================================================

use chrono::{DateTime, Datelike, Duration, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgExecutor};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{Order, OrderStatus, Product, User};

const ORDER_COLUMNS: &str = "id, order_number, user_id, product_id, quantity, unit_price, \
     total_price, status, delivered_at, warranty_expires_at, delivery_notes, created_at, updated_at";

// =============================================================================
// TRANSITIONS
// =============================================================================

impl OrderStatus {
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (OrderStatus::Pending, OrderStatus::Delivered)
                | (OrderStatus::Pending, OrderStatus::Processing)
                | (OrderStatus::Processing, OrderStatus::Delivered)
                | (OrderStatus::Processing, OrderStatus::Refunded)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Refunded)
    }
}

impl Order {
    fn transition(&mut self, next: OrderStatus) -> AppResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::InvalidOrderState(format!(
                "order {} cannot go from {} to {}",
                self.order_number,
                self.status.as_str(),
                next.as_str()
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Credential orders wait here until an admin fulfils or refunds them
    pub fn mark_processing(&mut self) -> AppResult<()> {
        self.transition(OrderStatus::Processing)
    }

    /// Mark the order delivered at `now`.
    ///
    /// `warranty_days` comes from the product; `None` (product row missing)
    /// is treated as no warranty.
    pub fn mark_delivered(
        &mut self,
        warranty_days: Option<i32>,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        self.transition(OrderStatus::Delivered)?;
        let warranty_days = warranty_days.unwrap_or(0);

        self.delivered_at = Some(now);
        self.warranty_expires_at =
            (warranty_days > 0).then(|| now + Duration::days(i64::from(warranty_days)));
        self.delivery_notes = notes;
        Ok(())
    }

    pub fn mark_refunded(&mut self) -> AppResult<()> {
        self.transition(OrderStatus::Refunded)
    }

    pub fn is_warranty_expired(&self, now: DateTime<Utc>) -> bool {
        self.warranty_expires_at.is_some_and(|expires| now > expires)
    }
}

// =============================================================================
// ORDER NUMBERS
// =============================================================================

/// Candidate order number `ORD-<year>-<6 digits>`.
///
/// Only a candidate: uniqueness is decided by the UNIQUE constraint when the
/// order row is inserted (see `insert_order`).
pub fn generate_order_number(year: i32) -> String {
    let n: u32 = rand::thread_rng().gen_range(1..=999_999);
    format!("ORD-{year:04}-{n:06}")
}

pub fn current_year() -> i32 {
    Utc::now().year()
}

// =============================================================================
// ACCESS RULES
// =============================================================================

/// Owners see their own orders; admins see every order
pub fn can_view_order(user: &User, order: &Order) -> bool {
    user.id == order.user_id || user.is_admin
}

/// Decide whether `user` may download the file of `order`.
///
/// `file_exists` is checked by the caller (it is file-system I/O); this
/// function only applies the rules.
///
/// # Returns
/// * `Ok(path)` - full path of the file to stream
/// * `Err(AuthorizationDenied)` - not the owner, not delivered, or not a download
/// * `Err(NotFound)` - the product's file is missing from storage
pub fn authorize_download(
    user: &User,
    order: &Order,
    product: Option<&Product>,
    download_dir: &Path,
    file_exists: bool,
) -> AppResult<PathBuf> {
    if !can_view_order(user, order) {
        return Err(AppError::AuthorizationDenied(
            "You cannot access this order".to_string(),
        ));
    }

    let unavailable =
        || AppError::AuthorizationDenied("Download not available for this order".to_string());

    let product = product.ok_or_else(unavailable)?;
    if order.status != OrderStatus::Delivered || !product.is_downloadable() {
        return Err(unavailable());
    }
    let file = product.download_file.as_deref().ok_or_else(unavailable)?;

    // Stored names are plain file names; anything path-like is refused
    if file.is_empty() || file.contains(['/', '\\']) || file.contains("..") {
        return Err(unavailable());
    }

    if !file_exists {
        return Err(AppError::NotFound("File not found".to_string()));
    }

    Ok(download_dir.join(file))
}

/// Name offered to the browser: product title plus the stored file's extension
pub fn download_file_name(product: &Product) -> String {
    let extension = product
        .download_file
        .as_deref()
        .and_then(|f| Path::new(f).extension())
        .and_then(|e| e.to_str());

    match extension {
        Some(ext) => format!("{}.{}", product.title, ext),
        None => product.title.clone(),
    }
}

// =============================================================================
// PERSISTENCE
// =============================================================================

/// Insert a pending order with `order_number`.
///
/// Returns `None` when the number is already taken. ON CONFLICT DO NOTHING
/// keeps the surrounding transaction usable, so the caller can retry with a
/// fresh candidate.
pub async fn insert_order(
    conn: &mut PgConnection,
    order_number: &str,
    user_id: Uuid,
    product: &Product,
    quantity: i32,
) -> AppResult<Option<Order>> {
    let total_price = product.price * Decimal::from(quantity);

    let order = sqlx::query_as::<_, Order>(&format!(
        r#"
        INSERT INTO orders
            (order_number, user_id, product_id, quantity, unit_price, total_price, status)
        VALUES ($1, $2, $3, $4, $5, $6, 'pending')
        ON CONFLICT (order_number) DO NOTHING
        RETURNING {ORDER_COLUMNS}
        "#
    ))
    .bind(order_number)
    .bind(user_id)
    .bind(product.id)
    .bind(quantity)
    .bind(product.price)
    .bind(total_price)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(order)
}

/// Persist status, delivery and warranty fields after a transition
pub async fn save_order_state(conn: &mut PgConnection, order: &Order) -> AppResult<Order> {
    let saved = sqlx::query_as::<_, Order>(&format!(
        r#"
        UPDATE orders
        SET status = $1, delivered_at = $2, warranty_expires_at = $3,
            delivery_notes = $4, updated_at = NOW()
        WHERE id = $5
        RETURNING {ORDER_COLUMNS}
        "#
    ))
    .bind(order.status)
    .bind(order.delivered_at)
    .bind(order.warranty_expires_at)
    .bind(&order.delivery_notes)
    .bind(order.id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(saved)
}

/// Lock an order row for an administrative transition
pub async fn lock_order(conn: &mut PgConnection, order_id: Uuid) -> AppResult<Option<Order>> {
    let order = sqlx::query_as::<_, Order>(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 FOR UPDATE"
    ))
    .bind(order_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(order)
}

pub async fn find_order<'e, E>(executor: E, order_id: Uuid) -> AppResult<Option<Order>>
where
    E: PgExecutor<'e>,
{
    let order = sqlx::query_as::<_, Order>(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"
    ))
    .bind(order_id)
    .fetch_optional(executor)
    .await?;

    Ok(order)
}

/// A user's orders, newest first
pub async fn list_orders_for_user<'e, E>(
    executor: E,
    user_id: Uuid,
    limit: i64,
    offset: i64,
) -> AppResult<Vec<Order>>
where
    E: PgExecutor<'e>,
{
    let orders = sqlx::query_as::<_, Order>(&format!(
        r#"
        SELECT {ORDER_COLUMNS}
        FROM orders
        WHERE user_id = $1
        ORDER BY created_at DESC, id DESC
        LIMIT $2 OFFSET $3
        "#
    ))
    .bind(user_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(executor)
    .await?;

    Ok(orders)
}

pub async fn count_orders_for_user<'e, E>(executor: E, user_id: Uuid) -> AppResult<i64>
where
    E: PgExecutor<'e>,
{
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM orders WHERE user_id = $1")
        .bind(user_id)
        .fetch_one(executor)
        .await?;

    Ok(total)
}

// =============================================================================
// TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProductType;
    use rust_decimal_macros::dec;

    fn user(is_admin: bool) -> User {
        User {
            id: Uuid::new_v4(),
            name: "buyer".into(),
            email: "buyer@example.com".into(),
            referral_code: "ABCD1234".into(),
            is_admin,
            created_at: Utc::now(),
        }
    }

    fn order(owner: &User, status: OrderStatus) -> Order {
        Order {
            id: Uuid::new_v4(),
            order_number: "ORD-2026-000042".into(),
            user_id: owner.id,
            product_id: Uuid::new_v4(),
            quantity: 1,
            unit_price: dec!(20.00),
            total_price: dec!(20.00),
            status,
            delivered_at: None,
            warranty_expires_at: None,
            delivery_notes: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn product(product_type: ProductType, file: Option<&str>) -> Product {
        Product {
            id: Uuid::new_v4(),
            title: "Icon Pack".into(),
            description: "icons".into(),
            price: dec!(20.00),
            stock_quantity: 10,
            warranty_days: 0,
            product_type,
            download_file: file.map(str::to_string),
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn transitions_follow_the_lifecycle() {
        use OrderStatus::*;
        assert!(Pending.can_transition_to(Delivered));
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Delivered));
        assert!(Processing.can_transition_to(Refunded));

        assert!(!Pending.can_transition_to(Refunded));
        assert!(!Delivered.can_transition_to(Refunded));
        assert!(!Refunded.can_transition_to(Delivered));
        assert!(!Processing.can_transition_to(Pending));

        assert!(Delivered.is_terminal());
        assert!(Refunded.is_terminal());
        assert!(!Processing.is_terminal());
    }

    #[test]
    fn delivery_with_warranty_expires_exactly_thirty_days_later() {
        let owner = user(false);
        let mut o = order(&owner, OrderStatus::Pending);
        let now = Utc::now();

        o.mark_delivered(Some(30), Some("enjoy".into()), now).unwrap();

        assert_eq!(o.status, OrderStatus::Delivered);
        assert_eq!(o.delivered_at, Some(now));
        assert_eq!(o.warranty_expires_at, Some(now + Duration::days(30)));
        assert_eq!(o.delivery_notes.as_deref(), Some("enjoy"));
    }

    #[test]
    fn delivery_without_warranty_leaves_expiry_empty() {
        let owner = user(false);
        let now = Utc::now();

        let mut o = order(&owner, OrderStatus::Pending);
        o.mark_delivered(Some(0), None, now).unwrap();
        assert_eq!(o.warranty_expires_at, None);

        // Missing product row
        let mut o = order(&owner, OrderStatus::Processing);
        o.mark_delivered(None, None, now).unwrap();
        assert_eq!(o.warranty_expires_at, None);
        assert!(!o.is_warranty_expired(now + Duration::days(3650)));
    }

    #[test]
    fn delivered_orders_cannot_be_delivered_twice() {
        let owner = user(false);
        let mut o = order(&owner, OrderStatus::Delivered);
        assert!(matches!(
            o.mark_delivered(Some(1), None, Utc::now()),
            Err(AppError::InvalidOrderState(_))
        ));
        assert!(o.mark_refunded().is_err());
        assert_eq!(o.status, OrderStatus::Delivered);
    }

    #[test]
    fn warranty_expiry_is_strictly_after_the_deadline() {
        let owner = user(false);
        let mut o = order(&owner, OrderStatus::Pending);
        let delivered = Utc::now();
        o.mark_delivered(Some(7), None, delivered).unwrap();

        let deadline = delivered + Duration::days(7);
        assert!(!o.is_warranty_expired(delivered));
        assert!(!o.is_warranty_expired(deadline));
        assert!(o.is_warranty_expired(deadline + Duration::seconds(1)));
    }

    #[test]
    fn order_numbers_have_the_published_shape() {
        for _ in 0..500 {
            let n = generate_order_number(2026);
            assert_eq!(n.len(), "ORD-2026-000000".len());
            assert!(n.starts_with("ORD-2026-"));
            let digits = &n["ORD-2026-".len()..];
            assert!(digits.chars().all(|c| c.is_ascii_digit()));
            assert_ne!(digits, "000000");
        }
    }

    #[test]
    fn only_owner_or_admin_can_view() {
        let owner = user(false);
        let stranger = user(false);
        let admin = user(true);
        let o = order(&owner, OrderStatus::Pending);

        assert!(can_view_order(&owner, &o));
        assert!(can_view_order(&admin, &o));
        assert!(!can_view_order(&stranger, &o));
    }

    #[test]
    fn download_requires_delivered_downloadable_with_file() {
        let owner = user(false);
        let dir = Path::new("/srv/files");
        let file = product(ProductType::Downloadable, Some("icons.zip"));

        let delivered = order(&owner, OrderStatus::Delivered);
        let path = authorize_download(&owner, &delivered, Some(&file), dir, true).unwrap();
        assert_eq!(path, PathBuf::from("/srv/files/icons.zip"));

        let processing = order(&owner, OrderStatus::Processing);
        assert!(matches!(
            authorize_download(&owner, &processing, Some(&file), dir, true),
            Err(AppError::AuthorizationDenied(_))
        ));

        let credential = product(ProductType::Credential, Some("icons.zip"));
        assert!(matches!(
            authorize_download(&owner, &delivered, Some(&credential), dir, true),
            Err(AppError::AuthorizationDenied(_))
        ));

        let no_file = product(ProductType::Downloadable, None);
        assert!(matches!(
            authorize_download(&owner, &delivered, Some(&no_file), dir, true),
            Err(AppError::AuthorizationDenied(_))
        ));

        assert!(matches!(
            authorize_download(&owner, &delivered, None, dir, true),
            Err(AppError::AuthorizationDenied(_))
        ));
    }

    #[test]
    fn download_denied_to_strangers_and_missing_files_are_not_found() {
        let owner = user(false);
        let stranger = user(false);
        let dir = Path::new("/srv/files");
        let file = product(ProductType::Downloadable, Some("icons.zip"));
        let delivered = order(&owner, OrderStatus::Delivered);

        assert!(matches!(
            authorize_download(&stranger, &delivered, Some(&file), dir, true),
            Err(AppError::AuthorizationDenied(_))
        ));
        assert!(matches!(
            authorize_download(&owner, &delivered, Some(&file), dir, false),
            Err(AppError::NotFound(_))
        ));

        let sneaky = product(ProductType::Downloadable, Some("../secrets.env"));
        assert!(authorize_download(&owner, &delivered, Some(&sneaky), dir, true).is_err());
    }

    #[test]
    fn download_name_uses_title_and_extension() {
        let p = product(ProductType::Downloadable, Some("a1b2c3.zip"));
        assert_eq!(download_file_name(&p), "Icon Pack.zip");

        let p = product(ProductType::Downloadable, Some("README"));
        assert_eq!(download_file_name(&p), "Icon Pack");
    }
}
