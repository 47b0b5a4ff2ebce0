// =============================================================================
// ERROR MODULE
// =============================================================================
// This module defines the marketplace error taxonomy and its HTTP responses.
//
// ERROR HANDLING PHILOSOPHY:
// - Precondition failures (funds, stock, missing wallet) are specific and
//   safe to show to the buyer
// - Anything that breaks inside an order's atomic section is logged in full
//   and surfaced only as OrderProcessingFailed
// - Database errors never leak their text into a response
// =============================================================================

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::ErrorResponse;

// =============================================================================
// CUSTOM ERROR TYPE
// =============================================================================
#[derive(Debug, Error)]
pub enum AppError {
    // -------------------------------------------------------------------------
    // INFRASTRUCTURE ERRORS
    // -------------------------------------------------------------------------
    /// Database query failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // -------------------------------------------------------------------------
    // LEDGER ERRORS
    // -------------------------------------------------------------------------
    /// Monetary amount was zero or negative
    #[error("Amount must be greater than zero")]
    InvalidAmount,

    /// Available balance (balance - escrow) does not cover the request
    #[error("Insufficient funds: available {available}, requested {requested}")]
    InsufficientFunds {
        available: Decimal,
        requested: Decimal,
    },

    /// The user has no wallet row
    #[error("Wallet not found")]
    WalletMissing,

    // -------------------------------------------------------------------------
    // ORDER ERRORS
    // -------------------------------------------------------------------------
    /// Not enough stock (downloadable) or unassigned records (credential)
    #[error("Insufficient stock: available {available}, requested {requested}")]
    InsufficientStock { available: i64, requested: i64 },

    /// Order or ledger row is not in a state that allows the operation
    #[error("Invalid state: {0}")]
    InvalidOrderState(String),

    /// Something failed inside the order's atomic section.
    /// The cause is logged where it happens and deliberately not carried here.
    #[error("Order processing failed")]
    OrderProcessingFailed,

    // -------------------------------------------------------------------------
    // ACCESS ERRORS
    // -------------------------------------------------------------------------
    /// No (or an unknown) caller identity
    #[error("Authentication required")]
    Unauthenticated,

    /// Caller may not see or act on the resource
    #[error("Access denied: {0}")]
    AuthorizationDenied(String),

    /// Order, product, ledger row or file does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid request data
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // -------------------------------------------------------------------------
    // INTERNAL ERRORS
    // -------------------------------------------------------------------------
    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// HTTP status and stable machine-readable code for this error
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::InvalidAmount => (StatusCode::BAD_REQUEST, "INVALID_AMOUNT"),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            AppError::Unauthenticated => (StatusCode::UNAUTHORIZED, "UNAUTHENTICATED"),
            AppError::AuthorizationDenied(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            AppError::InsufficientFunds { .. } => (StatusCode::CONFLICT, "INSUFFICIENT_FUNDS"),
            AppError::InsufficientStock { .. } => (StatusCode::CONFLICT, "INSUFFICIENT_STOCK"),
            AppError::WalletMissing => (StatusCode::CONFLICT, "WALLET_MISSING"),
            AppError::InvalidOrderState(_) => (StatusCode::CONFLICT, "INVALID_STATE"),
            AppError::OrderProcessingFailed => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "ORDER_PROCESSING_FAILED",
            ),
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }

    /// Message that is safe to put in a response body
    pub fn public_message(&self) -> String {
        match self {
            AppError::Database(_) => "A database error occurred".to_string(),
            AppError::Internal(_) => "An internal error occurred".to_string(),
            AppError::OrderProcessingFailed => {
                "Order processing failed. Please try again.".to_string()
            }
            other => other.to_string(),
        }
    }
}

// =============================================================================
// HTTP RESPONSE CONVERSION
// =============================================================================
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code) = self.status_and_code();
        let message = self.public_message();

        if status.is_server_error() {
            // Full detail goes to the log, never to the client
            tracing::error!(error_code = error_code, error = %self, "Request failed");
        } else {
            tracing::warn!(error_code = error_code, message = %message, "Request rejected");
        }

        let body = ErrorResponse::new(error_code, message);
        (status, Json(body)).into_response()
    }
}

// =============================================================================
// RESULT TYPE ALIAS
// =============================================================================
pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}
