// =============================================================================
// LEDGER MODULE
// =============================================================================
// Wallet arithmetic and the append-only transaction ledger.
//
// Every balance change follows the same three steps inside the caller's
// database transaction:
//   1. lock_wallet()       SELECT ... FOR UPDATE on the wallet row
//   2. wallet.debit(..)    pure arithmetic on the locked copy
//   3. store_wallet()      write the new balances back
//
// Because the row stays locked until the transaction ends, two concurrent
// orders from the same user are serialized and cannot both pass the
// available-funds check.
//
// INVARIANT (checked here and by a CHECK constraint on the table):
//   0 <= escrow_balance <= balance
// =============================================================================

use rust_decimal::Decimal;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{NewTransaction, TransactionStatus, Wallet, WalletTransaction};

const WALLET_COLUMNS: &str = "id, user_id, balance, escrow_balance, created_at, updated_at";

pub(crate) const TRANSACTION_COLUMNS: &str = "id, user_id, kind, status, amount, external_reference, \
     proof_reference, notes, processed_by, processed_at, created_at, updated_at";

// =============================================================================
// BALANCE ARITHMETIC
// =============================================================================
// None of these methods touch the database. On error the wallet is left
// exactly as it was.
impl Wallet {
    /// Funds the owner can spend right now
    pub fn available(&self) -> Decimal {
        self.balance - self.escrow_balance
    }

    /// Add funds (approved deposit, referral commission)
    pub fn credit(&mut self, amount: Decimal) -> AppResult<()> {
        require_positive(amount)?;
        self.balance += amount;
        Ok(())
    }

    /// Spend from the available balance
    pub fn debit(&mut self, amount: Decimal) -> AppResult<()> {
        require_positive(amount)?;
        self.require_available(amount)?;
        self.balance -= amount;
        Ok(())
    }

    /// Earmark part of the available balance for an in-flight order
    pub fn move_to_escrow(&mut self, amount: Decimal) -> AppResult<()> {
        require_positive(amount)?;
        self.require_available(amount)?;
        self.escrow_balance += amount;
        Ok(())
    }

    /// Turn an escrow hold into an actual spend.
    ///
    /// Escrow shrinks by `min(amount, escrow_balance)` while the balance
    /// shrinks by the full `amount`. This does NOT give money back to the
    /// user; use [`Wallet::return_from_escrow`] for refunds.
    pub fn release_from_escrow(&mut self, amount: Decimal) -> AppResult<()> {
        require_positive(amount)?;
        let escrow = self.escrow_balance - amount.min(self.escrow_balance);
        let balance = self.balance - amount;

        // Spending more than was held must still be covered by available funds
        if balance < escrow {
            return Err(AppError::InsufficientFunds {
                available: self.available(),
                requested: amount - (self.escrow_balance - escrow),
            });
        }

        self.escrow_balance = escrow;
        self.balance = balance;
        Ok(())
    }

    /// Give an escrow hold back to the available balance (refund path)
    pub fn return_from_escrow(&mut self, amount: Decimal) -> AppResult<()> {
        require_positive(amount)?;
        if amount > self.escrow_balance {
            return Err(AppError::InsufficientFunds {
                available: self.escrow_balance,
                requested: amount,
            });
        }
        self.escrow_balance -= amount;
        Ok(())
    }

    fn require_available(&self, amount: Decimal) -> AppResult<()> {
        let available = self.available();
        if available < amount {
            return Err(AppError::InsufficientFunds {
                available,
                requested: amount,
            });
        }
        Ok(())
    }
}

fn require_positive(amount: Decimal) -> AppResult<()> {
    if amount <= Decimal::ZERO {
        return Err(AppError::InvalidAmount);
    }
    Ok(())
}

// =============================================================================
// PERSISTENCE
// =============================================================================
// These take a bare connection so they can run on `&mut *tx` inside any
// transaction the caller has opened.

/// Lock and load a user's wallet for the rest of the transaction
pub async fn lock_wallet(conn: &mut PgConnection, user_id: Uuid) -> AppResult<Option<Wallet>> {
    let wallet = sqlx::query_as::<_, Wallet>(&format!(
        "SELECT {WALLET_COLUMNS} FROM wallets WHERE user_id = $1 FOR UPDATE"
    ))
    .bind(user_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(wallet)
}

/// Write back balances of a wallet previously loaded with [`lock_wallet`]
pub async fn store_wallet(conn: &mut PgConnection, wallet: &Wallet) -> AppResult<Wallet> {
    let stored = sqlx::query_as::<_, Wallet>(&format!(
        r#"
        UPDATE wallets
        SET balance = $1, escrow_balance = $2, updated_at = NOW()
        WHERE id = $3
        RETURNING {WALLET_COLUMNS}
        "#
    ))
    .bind(wallet.balance)
    .bind(wallet.escrow_balance)
    .bind(wallet.id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(stored)
}

/// Create the zeroed wallet of a freshly inserted user
pub async fn create_wallet(conn: &mut PgConnection, user_id: Uuid) -> AppResult<Wallet> {
    let wallet = sqlx::query_as::<_, Wallet>(&format!(
        "INSERT INTO wallets (user_id) VALUES ($1) RETURNING {WALLET_COLUMNS}"
    ))
    .bind(user_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(wallet)
}

/// Append a ledger row
pub async fn append_transaction(
    conn: &mut PgConnection,
    entry: &NewTransaction,
) -> AppResult<WalletTransaction> {
    let row = sqlx::query_as::<_, WalletTransaction>(&format!(
        r#"
        INSERT INTO wallet_transactions
            (user_id, kind, status, amount, external_reference, proof_reference, notes)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING {TRANSACTION_COLUMNS}
        "#
    ))
    .bind(entry.user_id)
    .bind(entry.kind)
    .bind(entry.status)
    .bind(entry.amount)
    .bind(&entry.external_reference)
    .bind(&entry.proof_reference)
    .bind(&entry.notes)
    .fetch_one(&mut *conn)
    .await?;

    Ok(row)
}

/// Lock a ledger row, used by the deposit review workflow
pub async fn lock_transaction(
    conn: &mut PgConnection,
    id: Uuid,
) -> AppResult<Option<WalletTransaction>> {
    let row = sqlx::query_as::<_, WalletTransaction>(&format!(
        "SELECT {TRANSACTION_COLUMNS} FROM wallet_transactions WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row)
}

/// Close a reviewed ledger row with its outcome and reviewer
pub async fn record_review(
    conn: &mut PgConnection,
    id: Uuid,
    status: TransactionStatus,
    processed_by: Uuid,
) -> AppResult<WalletTransaction> {
    let row = sqlx::query_as::<_, WalletTransaction>(&format!(
        r#"
        UPDATE wallet_transactions
        SET status = $1, processed_by = $2, processed_at = NOW(), updated_at = NOW()
        WHERE id = $3
        RETURNING {TRANSACTION_COLUMNS}
        "#
    ))
    .bind(status)
    .bind(processed_by)
    .bind(id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(row)
}

/// Lock a wallet, credit it and write it back in one step
pub async fn credit_wallet(
    conn: &mut PgConnection,
    user_id: Uuid,
    amount: Decimal,
) -> AppResult<Wallet> {
    let mut wallet = lock_wallet(conn, user_id)
        .await?
        .ok_or(AppError::WalletMissing)?;

    let outcome = wallet.credit(amount);
    metrics::record_ledger_operation("credit", outcome.is_ok());
    outcome?;

    store_wallet(conn, &wallet).await
}
