// =============================================================================
// DATABASE MODULE
// =============================================================================
// This module owns the PostgreSQL pool, the schema, and the read models the
// HTTP layer displays.
//
// LEARNING NOTES:
// - Read-only queries run straight on the pool
// - Anything that changes money or stock runs inside a transaction opened
//   by the orchestrator, fulfilment, deposits or accounts modules, which
//   call the free functions at the bottom of this file with `&mut *tx`
// =============================================================================

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgConnection, PgExecutor, PgPool, Postgres, QueryBuilder};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::allocator;
use crate::error::AppResult;
use crate::ledger::TRANSACTION_COLUMNS;
use crate::metrics;
use crate::models::{Product, ProductFilter, ProductType, User, Wallet, WalletTransaction};

pub(crate) const PRODUCT_COLUMNS: &str = "id, title, description, price, stock_quantity, \
     warranty_days, product_type, download_file, is_active, created_at, updated_at";

pub(crate) const USER_COLUMNS: &str = "id, name, email, referral_code, is_admin, created_at";

/// Highest page number a listing will serve
pub const MAX_PAGE: i64 = 10_000;

/// Key for pg_advisory_lock while the schema is created
const MIGRATION_LOCK_KEY: i64 = 0x4d41_524b_4554; // "MARKET"

// -----------------------------------------------------------------------------
// SCHEMA
// -----------------------------------------------------------------------------
// Every statement is idempotent so the service can run them on each start.
// PostgreSQL has no CREATE TYPE IF NOT EXISTS, hence the DO blocks.
const SCHEMA: &[(&str, &str)] = &[
    (
        "product_type enum",
        r#"DO $$ BEGIN
            CREATE TYPE product_type AS ENUM ('downloadable', 'credential');
        EXCEPTION WHEN duplicate_object THEN NULL; END $$"#,
    ),
    (
        "order_status enum",
        r#"DO $$ BEGIN
            CREATE TYPE order_status AS ENUM ('pending', 'processing', 'delivered', 'refunded');
        EXCEPTION WHEN duplicate_object THEN NULL; END $$"#,
    ),
    (
        "transaction_kind enum",
        r#"DO $$ BEGIN
            CREATE TYPE transaction_kind AS ENUM
                ('deposit', 'withdrawal', 'purchase', 'refund', 'commission');
        EXCEPTION WHEN duplicate_object THEN NULL; END $$"#,
    ),
    (
        "transaction_status enum",
        r#"DO $$ BEGIN
            CREATE TYPE transaction_status AS ENUM ('pending', 'approved', 'rejected', 'completed');
        EXCEPTION WHEN duplicate_object THEN NULL; END $$"#,
    ),
    (
        "users table",
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            name VARCHAR(255) NOT NULL,
            email VARCHAR(255) UNIQUE NOT NULL,
            referral_code CHAR(8) UNIQUE NOT NULL,
            is_admin BOOLEAN NOT NULL DEFAULT FALSE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "wallets table",
        r#"
        CREATE TABLE IF NOT EXISTS wallets (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            user_id UUID UNIQUE NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            balance NUMERIC(15, 2) NOT NULL DEFAULT 0,
            escrow_balance NUMERIC(15, 2) NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

            -- available = balance - escrow_balance can never go negative
            CONSTRAINT valid_escrow CHECK (escrow_balance >= 0 AND escrow_balance <= balance)
        )
        "#,
    ),
    (
        "products table",
        r#"
        CREATE TABLE IF NOT EXISTS products (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            title VARCHAR(255) NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            price NUMERIC(10, 2) NOT NULL CHECK (price > 0),
            stock_quantity INTEGER NOT NULL DEFAULT 0 CHECK (stock_quantity >= 0),
            warranty_days INTEGER NOT NULL DEFAULT 0 CHECK (warranty_days >= 0),
            product_type product_type NOT NULL,
            download_file VARCHAR(255),
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "orders table",
        r#"
        CREATE TABLE IF NOT EXISTS orders (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            order_number VARCHAR(20) UNIQUE NOT NULL,
            user_id UUID NOT NULL REFERENCES users(id),
            product_id UUID NOT NULL REFERENCES products(id),
            quantity INTEGER NOT NULL CHECK (quantity > 0),
            unit_price NUMERIC(10, 2) NOT NULL,
            total_price NUMERIC(15, 2) NOT NULL,
            status order_status NOT NULL DEFAULT 'pending',
            delivered_at TIMESTAMPTZ,
            warranty_expires_at TIMESTAMPTZ,
            delivery_notes TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "inventory_items table",
        r#"
        CREATE TABLE IF NOT EXISTS inventory_items (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            product_id UUID NOT NULL REFERENCES products(id) ON DELETE CASCADE,
            credentials TEXT NOT NULL,
            is_used BOOLEAN NOT NULL DEFAULT FALSE,
            order_id UUID REFERENCES orders(id),
            assigned_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

            -- assigned records always point at exactly one order
            CONSTRAINT assignment_consistent CHECK (
                (is_used AND order_id IS NOT NULL AND assigned_at IS NOT NULL)
                OR (NOT is_used AND order_id IS NULL AND assigned_at IS NULL)
            )
        )
        "#,
    ),
    (
        "wallet_transactions table",
        r#"
        CREATE TABLE IF NOT EXISTS wallet_transactions (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            kind transaction_kind NOT NULL,
            status transaction_status NOT NULL,
            amount NUMERIC(15, 2) NOT NULL CHECK (amount > 0),
            external_reference VARCHAR(255),
            proof_reference VARCHAR(255),
            notes TEXT,
            processed_by UUID REFERENCES users(id),
            processed_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "referrals table",
        r#"
        CREATE TABLE IF NOT EXISTS referrals (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            referrer_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            referred_id UUID UNIQUE NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            commission_rate NUMERIC(5, 2) NOT NULL CHECK (commission_rate BETWEEN 0 AND 100),
            total_earned NUMERIC(15, 2) NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            CONSTRAINT no_self_referral CHECK (referrer_id <> referred_id)
        )
        "#,
    ),
    (
        "inventory availability index",
        "CREATE INDEX IF NOT EXISTS idx_inventory_available ON inventory_items(product_id, is_used, created_at)",
    ),
    (
        "inventory order index",
        "CREATE INDEX IF NOT EXISTS idx_inventory_order ON inventory_items(order_id)",
    ),
    (
        "orders by user index",
        "CREATE INDEX IF NOT EXISTS idx_orders_user ON orders(user_id, created_at DESC)",
    ),
    (
        "transactions by user index",
        "CREATE INDEX IF NOT EXISTS idx_wallet_transactions_user ON wallet_transactions(user_id, created_at DESC)",
    ),
    (
        "transactions by status index",
        "CREATE INDEX IF NOT EXISTS idx_wallet_transactions_status ON wallet_transactions(status, created_at)",
    ),
    (
        "catalog index",
        "CREATE INDEX IF NOT EXISTS idx_products_catalog ON products(is_active, product_type, price)",
    ),
];

// -----------------------------------------------------------------------------
// DATABASE WRAPPER
// -----------------------------------------------------------------------------
#[derive(Clone)]
pub struct Database {
    /// SQLx PostgreSQL connection pool
    pool: PgPool,
}

impl Database {
    // -------------------------------------------------------------------------
    // CONNECTION
    // -------------------------------------------------------------------------
    /// Create a new database connection pool
    ///
    /// # Arguments
    /// * `database_url` - PostgreSQL connection string
    /// * `max_connections` - pool size; concurrent orders each hold one
    ///   connection for the length of their transaction
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(2.min(max_connections))
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(300))
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // -------------------------------------------------------------------------
    // MIGRATIONS
    // -------------------------------------------------------------------------
    /// Create types, tables and indexes if they don't exist.
    ///
    /// Holds a session advisory lock while running, so several instances (or
    /// test binaries) starting at once don't race on CREATE TYPE.
    pub async fn run_migrations(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await
            .context("Failed to take migration lock")?;

        let mut outcome = Ok(());
        for (name, statement) in SCHEMA {
            if let Err(err) = sqlx::query(statement).execute(&mut *conn).await {
                outcome = Err(err).with_context(|| format!("Failed to create {name}"));
                break;
            }
        }

        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await
            .context("Failed to release migration lock")?;

        outcome
    }

    /// Seed a small demo catalog if there are no products yet
    pub async fn seed_demo_data(&self) -> Result<()> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM products")
            .fetch_one(&self.pool)
            .await?;

        if count.0 > 0 {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        let downloads = [
            ("Minimal Icon Pack", "450 line icons in SVG and PNG", "12.00", 250, 0, "icon-pack.zip"),
            ("Rust Async Handbook", "PDF and EPUB editions", "29.00", 500, 0, "async-handbook.zip"),
            ("Lo-fi Sample Library", "1.2 GB of royalty-free loops", "45.00", 120, 30, "lofi-samples.zip"),
        ];
        for (title, description, price, stock, warranty, file) in downloads {
            sqlx::query(
                r#"
                INSERT INTO products
                    (title, description, price, stock_quantity, warranty_days, product_type, download_file)
                VALUES ($1, $2, $3::NUMERIC, $4, $5, 'downloadable', $6)
                "#,
            )
            .bind(title)
            .bind(description)
            .bind(price)
            .bind(stock)
            .bind(warranty)
            .bind(file)
            .execute(&mut *tx)
            .await?;
        }

        let credentials = [
            ("Streaming Premium - 1 Month", "Shared family slot", "6.50", 30, 12),
            ("Cloud IDE Pro Seat", "Annual seat on a team plan", "39.00", 90, 6),
        ];
        for (title, description, price, warranty, records) in credentials {
            let product_id: Uuid = sqlx::query_scalar(
                r#"
                INSERT INTO products (title, description, price, warranty_days, product_type)
                VALUES ($1, $2, $3::NUMERIC, $4, 'credential')
                RETURNING id
                "#,
            )
            .bind(title)
            .bind(description)
            .bind(price)
            .bind(warranty)
            .fetch_one(&mut *tx)
            .await?;

            for n in 1..=records {
                sqlx::query("INSERT INTO inventory_items (product_id, credentials) VALUES ($1, $2)")
                    .bind(product_id)
                    .bind(format!("login: demo{n:03}@example.com\npassword: {}", Uuid::new_v4()))
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        tracing::info!("Seeded demo catalog");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // USERS & WALLETS
    // -------------------------------------------------------------------------

    pub async fn find_user(&self, id: Uuid) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    /// Unlocked read of a wallet, for display and fast-fail checks
    pub async fn find_wallet(&self, user_id: Uuid) -> AppResult<Option<Wallet>> {
        let wallet = sqlx::query_as::<_, Wallet>(
            r#"
            SELECT id, user_id, balance, escrow_balance, created_at, updated_at
            FROM wallets
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(wallet)
    }

    /// A user's ledger rows, newest first, with the total row count
    pub async fn list_transactions(
        &self,
        user_id: Uuid,
        page: i64,
        per_page: i64,
    ) -> AppResult<(Vec<WalletTransaction>, i64)> {
        let offset = page_offset(page, per_page);

        let rows = sqlx::query_as::<_, WalletTransaction>(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM wallet_transactions
            WHERE user_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(user_id)
        .bind(per_page)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM wallet_transactions WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;

        Ok((rows, total))
    }

    /// Deposits waiting for an admin, oldest first
    pub async fn list_pending_deposits(&self) -> AppResult<Vec<WalletTransaction>> {
        let rows = sqlx::query_as::<_, WalletTransaction>(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM wallet_transactions
            WHERE kind = 'deposit' AND status = 'pending'
            ORDER BY created_at ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    // -------------------------------------------------------------------------
    // PRODUCTS
    // -------------------------------------------------------------------------

    pub async fn get_product(&self, id: Uuid) -> AppResult<Option<Product>> {
        let start = Instant::now();
        let product = find_product(&self.pool, id).await?;
        metrics::record_db_query("select", start.elapsed().as_secs_f64());
        Ok(product)
    }

    /// Active products matching `filter`, newest first, with the total count
    pub async fn list_products(
        &self,
        filter: &ProductFilter,
        page: i64,
        per_page: i64,
    ) -> AppResult<(Vec<Product>, i64)> {
        let start = Instant::now();
        let offset = page_offset(page, per_page);

        let mut query = QueryBuilder::<Postgres>::new(format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE is_active = TRUE"
        ));
        push_product_filters(&mut query, filter);
        query
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(per_page)
            .push(" OFFSET ")
            .push_bind(offset);
        let items = query.build_query_as::<Product>().fetch_all(&self.pool).await?;

        let mut count = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) FROM products WHERE is_active = TRUE",
        );
        push_product_filters(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        metrics::record_db_query("select", start.elapsed().as_secs_f64());
        Ok((items, total))
    }

    /// Units that can be sold right now
    pub async fn available_stock(&self, product: &Product) -> AppResult<i64> {
        match product.product_type {
            ProductType::Downloadable => Ok(i64::from(product.stock_quantity)),
            ProductType::Credential => {
                let available = allocator::count_available(&self.pool, product.id).await?;
                metrics::set_inventory_available(&product.id.to_string(), available);
                Ok(available)
            }
        }
    }

    // -------------------------------------------------------------------------
    // HEALTH CHECK
    // -------------------------------------------------------------------------

    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }
}

/// Row offset of a 1-indexed page. Pages are clamped to `1..=MAX_PAGE` so a
/// page number from a query string can never overflow the multiplication.
pub fn page_offset(page: i64, per_page: i64) -> i64 {
    (page.clamp(1, MAX_PAGE) - 1).saturating_mul(per_page.max(0))
}

fn push_product_filters(query: &mut QueryBuilder<'_, Postgres>, filter: &ProductFilter) {
    if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let pattern = format!("%{}%", search.replace('%', "\\%").replace('_', "\\_"));
        query
            .push(" AND (title ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR description ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
    if let Some(product_type) = filter.product_type {
        query.push(" AND product_type = ").push_bind(product_type);
    }
    if let Some(min) = filter.min_price {
        query.push(" AND price >= ").push_bind(min);
    }
    if let Some(max) = filter.max_price {
        query.push(" AND price <= ").push_bind(max);
    }
}

// =============================================================================
// TRANSACTION-SCOPED PRODUCT OPERATIONS
// =============================================================================

pub async fn find_product<'e, E>(executor: E, id: Uuid) -> AppResult<Option<Product>>
where
    E: PgExecutor<'e>,
{
    let product = sqlx::query_as::<_, Product>(&format!(
        "SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(executor)
    .await?;

    Ok(product)
}

/// Lock a product row so its stock counter can be re-checked and changed.
///
/// NO KEY UPDATE, not UPDATE: the order row inserted earlier in the same
/// transaction holds a KEY SHARE lock on the product through its foreign key,
/// and a full UPDATE lock would deadlock two buyers of the same product.
pub async fn lock_product(conn: &mut PgConnection, id: Uuid) -> AppResult<Option<Product>> {
    let product = sqlx::query_as::<_, Product>(&format!(
        "SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1 FOR NO KEY UPDATE"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(product)
}

/// Take `quantity` units off a downloadable product's stock counter
pub async fn decrement_stock(conn: &mut PgConnection, id: Uuid, quantity: i32) -> AppResult<i32> {
    let remaining: i32 = sqlx::query_scalar(
        r#"
        UPDATE products
        SET stock_quantity = stock_quantity - $1, updated_at = NOW()
        WHERE id = $2
        RETURNING stock_quantity
        "#,
    )
    .bind(quantity)
    .bind(id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_offsets_are_capped() {
        assert_eq!(page_offset(1, 12), 0);
        assert_eq!(page_offset(3, 12), 24);
        assert_eq!(page_offset(0, 12), 0);
        assert_eq!(page_offset(-7, 12), 0);
        assert_eq!(page_offset(i64::MAX, 12), (MAX_PAGE - 1) * 12);
        assert_eq!(page_offset(i64::MAX, i64::MAX), i64::MAX);
        assert!(page_offset(i64::MIN, i64::MIN) >= 0);
    }
}
