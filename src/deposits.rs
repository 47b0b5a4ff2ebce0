// =============================================================================
// DEPOSITS
// =============================================================================
// Wallet top-ups are paid outside the system, so they are two-step: the user
// submits a pending deposit with a payment reference and proof, and an admin
// approves (wallet credited) or rejects it.
// =============================================================================

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::db::Database;
use crate::error::{AppError, AppResult};
use crate::ledger;
use crate::models::{
    DepositRequest, NewTransaction, TransactionKind, TransactionStatus, User, WalletTransaction,
};

/// Record a pending deposit for admin review
pub async fn submit_deposit(
    db: &Database,
    user: &User,
    request: DepositRequest,
) -> AppResult<WalletTransaction> {
    validate(&request)?;

    let mut conn = db.pool().acquire().await?;
    let entry = NewTransaction {
        user_id: user.id,
        kind: TransactionKind::Deposit,
        status: TransactionStatus::Pending,
        amount: request.amount,
        external_reference: Some(request.external_reference.trim().to_string()),
        proof_reference: Some(request.proof_reference.trim().to_string()),
        notes: request.notes,
    };
    let row = ledger::append_transaction(&mut *conn, &entry).await?;

    tracing::info!(
        transaction_id = %row.id,
        user_id = %user.id,
        amount = %row.amount,
        "Deposit submitted"
    );
    Ok(row)
}

fn validate(request: &DepositRequest) -> AppResult<()> {
    if request.amount <= Decimal::ZERO {
        return Err(AppError::InvalidAmount);
    }
    if request.amount != request.amount.round_dp(2) {
        return Err(AppError::BadRequest(
            "Amount cannot have more than two decimal places".to_string(),
        ));
    }
    if request.external_reference.trim().is_empty() {
        return Err(AppError::BadRequest("Payment reference is required".to_string()));
    }
    if request.proof_reference.trim().is_empty() {
        return Err(AppError::BadRequest("Proof of payment is required".to_string()));
    }
    Ok(())
}

/// Approve or reject a pending deposit
pub async fn review_deposit(
    db: &Database,
    admin: &User,
    transaction_id: Uuid,
    approve: bool,
) -> AppResult<WalletTransaction> {
    if !admin.is_admin {
        return Err(AppError::AuthorizationDenied(
            "Administrator access required".to_string(),
        ));
    }

    let mut tx = db.pool().begin().await?;

    let row = ledger::lock_transaction(&mut *tx, transaction_id)
        .await?
        .filter(|t| t.kind == TransactionKind::Deposit)
        .ok_or_else(|| AppError::NotFound("Deposit not found".to_string()))?;

    if row.status != TransactionStatus::Pending {
        return Err(AppError::InvalidOrderState(
            "Deposit has already been processed".to_string(),
        ));
    }

    let status = if approve {
        TransactionStatus::Approved
    } else {
        TransactionStatus::Rejected
    };

    let reviewed = ledger::record_review(&mut *tx, row.id, status, admin.id).await?;

    if approve {
        ledger::credit_wallet(&mut *tx, row.user_id, row.amount).await?;
    }

    tx.commit().await?;

    tracing::info!(
        transaction_id = %reviewed.id,
        admin_id = %admin.id,
        approved = approve,
        amount = %reviewed.amount,
        "Deposit reviewed"
    );
    Ok(reviewed)
}

/// Deposits awaiting review, oldest first
pub async fn list_pending_deposits(
    db: &Database,
    admin: &User,
) -> AppResult<Vec<WalletTransaction>> {
    if !admin.is_admin {
        return Err(AppError::AuthorizationDenied(
            "Administrator access required".to_string(),
        ));
    }
    db.list_pending_deposits().await
}
