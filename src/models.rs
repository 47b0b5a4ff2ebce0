// =============================================================================
// MODELS MODULE
// =============================================================================
// This module defines the data structures used throughout the service:
// database rows (FromRow), the status enums stored as PostgreSQL ENUM types,
// and the API request/response shapes.
//
// LEARNING NOTES:
// - Money is rust_decimal::Decimal end to end (NUMERIC in PostgreSQL)
// - Derive sqlx::Type on an enum to map it onto a PostgreSQL ENUM type
// - Serde handles JSON serialization/deserialization
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// =============================================================================
// ENUMS
// =============================================================================

/// How a product is fulfilled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "product_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProductType {
    /// A stored file, delivered instantly; stock is a counter
    Downloadable,
    /// Finite credential records; stock is the count of unassigned items
    Credential,
}

impl ProductType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductType::Downloadable => "downloadable",
            ProductType::Credential => "credential",
        }
    }
}

/// Order lifecycle. See `orders.rs` for the allowed transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "order_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Processing,
    Delivered,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Processing => "processing",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Refunded => "refunded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "transaction_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Deposit,
    Withdrawal,
    Purchase,
    Refund,
    Commission,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "transaction_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Approved,
    Rejected,
    Completed,
}

// =============================================================================
// DATABASE ROWS
// =============================================================================

// -----------------------------------------------------------------------------
// USER
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,

    /// 8-character uppercase alphanumeric code other users redeem at signup
    pub referral_code: String,

    /// Admins review deposits, fulfil/refund orders and see every order
    pub is_admin: bool,

    pub created_at: DateTime<Utc>,
}

// -----------------------------------------------------------------------------
// WALLET
// -----------------------------------------------------------------------------
/// Custodial wallet; exactly one per user.
///
/// `escrow_balance` is the part of `balance` held for credential orders that
/// are still being fulfilled. The arithmetic lives in `ledger.rs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Wallet {
    pub id: Uuid,
    pub user_id: Uuid,
    pub balance: Decimal,
    pub escrow_balance: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// -----------------------------------------------------------------------------
// PRODUCT
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Product {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub price: Decimal,

    /// Only meaningful for downloadable products
    pub stock_quantity: i32,

    /// 0 means no warranty
    pub warranty_days: i32,

    pub product_type: ProductType,

    /// File name under the configured download directory
    pub download_file: Option<String>,

    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    pub fn is_downloadable(&self) -> bool {
        self.product_type == ProductType::Downloadable
    }
}

// -----------------------------------------------------------------------------
// INVENTORY ITEM
// -----------------------------------------------------------------------------
/// One credential record. `credentials` is an opaque secret and never parsed.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InventoryItem {
    pub id: Uuid,
    pub product_id: Uuid,
    pub credentials: String,
    pub is_used: bool,
    pub order_id: Option<Uuid>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// -----------------------------------------------------------------------------
// ORDER
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub id: Uuid,

    /// Human-readable, globally unique: ORD-<year>-<6 digits>
    pub order_number: String,

    pub user_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,

    /// Product price at purchase time, decoupled from later price changes
    pub unit_price: Decimal,

    pub total_price: Decimal,
    pub status: OrderStatus,
    pub delivered_at: Option<DateTime<Utc>>,
    pub warranty_expires_at: Option<DateTime<Utc>>,
    pub delivery_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// -----------------------------------------------------------------------------
// WALLET TRANSACTION
// -----------------------------------------------------------------------------
/// Append-only ledger row
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WalletTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub amount: Decimal,

    /// Transfer id the payer quoted for a deposit
    pub external_reference: Option<String>,

    /// Stored proof-of-payment file for a deposit
    pub proof_reference: Option<String>,

    pub notes: Option<String>,
    pub processed_by: Option<Uuid>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for a ledger row about to be appended
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub user_id: Uuid,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub amount: Decimal,
    pub external_reference: Option<String>,
    pub proof_reference: Option<String>,
    pub notes: Option<String>,
}

impl NewTransaction {
    /// A settled ledger row (purchase, refund, commission)
    pub fn completed(
        user_id: Uuid,
        kind: TransactionKind,
        amount: Decimal,
        notes: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            kind,
            status: TransactionStatus::Completed,
            amount,
            external_reference: None,
            proof_reference: None,
            notes: Some(notes.into()),
        }
    }
}

// -----------------------------------------------------------------------------
// REFERRAL
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Referral {
    pub id: Uuid,
    pub referrer_id: Uuid,
    pub referred_id: Uuid,

    /// Percentage, e.g. 10.00 for 10%
    pub commission_rate: Decimal,

    pub total_earned: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// API REQUEST/RESPONSE STRUCTURES
// =============================================================================

/// Request body for `POST /api/v1/users`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterUserRequest {
    pub name: String,
    pub email: String,

    /// Code of the user who referred this one, if any
    #[serde(default)]
    pub referral_code: Option<String>,
}

/// A user together with the wallet created alongside it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredUser {
    pub user: User,
    pub wallet: Wallet,
    pub referral: Option<Referral>,
}

/// Request body for `POST /api/v1/orders`
///
/// # Example JSON
/// ```json
/// { "product_id": "6f1c...", "quantity": 2 }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOrderRequest {
    pub product_id: Uuid,
    pub quantity: i32,
}

/// Result of a successful order placement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacedOrder {
    pub order: Order,

    /// Credential records assigned to the order (empty for downloads)
    pub inventory_items: Vec<InventoryItem>,

    /// Buyer's wallet after the purchase
    pub wallet: Wallet,
}

/// Order detail with its product and assigned credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDetail {
    pub order: Order,
    pub product: Option<Product>,
    pub inventory_items: Vec<InventoryItem>,
    pub warranty_expired: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderListResponse {
    pub items: Vec<Order>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
}

/// Request body for `POST /api/v1/orders/:id/deliver`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliverOrderRequest {
    #[serde(default)]
    pub notes: Option<String>,
}

/// Request body for `POST /api/v1/orders/:id/refund`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefundOrderRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Product read model shown in the catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductView {
    #[serde(flatten)]
    pub product: Product,
    pub available_stock: i64,
}

/// Catalog filters; all optional, combined with AND
#[derive(Debug, Clone, Default)]
pub struct ProductFilter {
    pub search: Option<String>,
    pub product_type: Option<ProductType>,

    pub min_price: Option<Decimal>,
    pub max_price: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductListResponse {
    pub items: Vec<Product>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
}

/// Request body for `POST /api/v1/wallet/deposits`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositRequest {
    pub amount: Decimal,
    pub external_reference: String,
    pub proof_reference: String,

    #[serde(default)]
    pub notes: Option<String>,
}

/// Wallet page: balances, recent ledger rows and referral earnings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletOverview {
    pub wallet: Wallet,
    pub available_balance: Decimal,
    pub transactions: Vec<WalletTransaction>,
    pub total_transactions: i64,
    pub page: i64,
    pub per_page: i64,
    pub referral_earnings: Decimal,
}

// =============================================================================
// HEALTH CHECK RESPONSES
// =============================================================================

/// Simple health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Detailed readiness check response
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub checks: ReadinessChecks,
}

/// Individual dependency health checks
#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    pub database: bool,
    pub redis: bool,
}

// =============================================================================
// ERROR RESPONSES
// =============================================================================

/// API error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error type/code
    pub error: String,

    /// Human-readable error message
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}
