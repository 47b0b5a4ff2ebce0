// Shared fixtures for the database-backed tests.
//
// Every test needs PostgreSQL in TEST_DATABASE_URL and is skipped (passes
// with a note on stderr) when it is unset. Rows are keyed by fresh UUIDs and
// emails, so tests can share one database and run in parallel.

#![allow(dead_code)]

use marketplace_service::accounts;
use marketplace_service::db::Database;
use marketplace_service::models::{Product, RegisterUserRequest, RegisteredUser, User};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

pub async fn test_db() -> Option<Database> {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return None;
    };

    let db = Database::connect(&url, 10).await.expect("connect to test database");
    db.run_migrations().await.expect("run migrations");
    Some(db)
}

fn unique_email(label: &str) -> String {
    format!("{label}-{}@example.com", Uuid::new_v4().simple())
}

pub async fn register(db: &Database, label: &str, referral_code: Option<&str>) -> RegisteredUser {
    accounts::register_user(
        db,
        RegisterUserRequest {
            name: label.to_string(),
            email: unique_email(label),
            referral_code: referral_code.map(str::to_string),
        },
        dec!(10.00),
    )
    .await
    .expect("register user")
}

pub async fn admin(db: &Database) -> User {
    accounts::register_admin(
        db,
        RegisterUserRequest {
            name: "admin".to_string(),
            email: unique_email("admin"),
            referral_code: None,
        },
        dec!(10.00),
    )
    .await
    .expect("register admin")
    .user
}

/// Registered user whose wallet holds `balance`
pub async fn buyer(db: &Database, balance: Decimal) -> User {
    let registered = register(db, "buyer", None).await;
    fund(db, registered.user.id, balance).await;
    registered.user
}

pub async fn fund(db: &Database, user_id: Uuid, balance: Decimal) {
    sqlx::query("UPDATE wallets SET balance = $1 WHERE user_id = $2")
        .bind(balance)
        .bind(user_id)
        .execute(db.pool())
        .await
        .expect("fund wallet");
}

pub async fn downloadable(db: &Database, price: Decimal, stock: i32, warranty_days: i32) -> Product {
    let id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO products (title, price, stock_quantity, warranty_days, product_type, download_file)
        VALUES ('Icon Pack', $1, $2, $3, 'downloadable', 'icons.zip')
        RETURNING id
        "#,
    )
    .bind(price)
    .bind(stock)
    .bind(warranty_days)
    .fetch_one(db.pool())
    .await
    .expect("insert downloadable product");

    db.get_product(id).await.expect("load product").expect("product exists")
}

pub async fn credential(db: &Database, price: Decimal, records: usize, warranty_days: i32) -> Product {
    let id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO products (title, price, warranty_days, product_type)
        VALUES ('Streaming Seat', $1, $2, 'credential')
        RETURNING id
        "#,
    )
    .bind(price)
    .bind(warranty_days)
    .fetch_one(db.pool())
    .await
    .expect("insert credential product");

    for n in 0..records {
        sqlx::query("INSERT INTO inventory_items (product_id, credentials) VALUES ($1, $2)")
            .bind(id)
            .bind(format!("user{n}:secret{n}"))
            .execute(db.pool())
            .await
            .expect("insert inventory item");
    }

    db.get_product(id).await.expect("load product").expect("product exists")
}

pub async fn count_transactions(db: &Database, user_id: Uuid, kind: &str) -> i64 {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM wallet_transactions WHERE user_id = $1 AND kind::TEXT = $2",
    )
    .bind(user_id)
    .bind(kind)
    .fetch_one(db.pool())
    .await
    .expect("count transactions")
}
