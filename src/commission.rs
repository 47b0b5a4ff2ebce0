// =============================================================================
// REFERRAL COMMISSION ENGINE
// =============================================================================
// Pays the referrer of a buyer a percentage of every purchase.
//
// Runs inside the order's transaction, but in its own SAVEPOINT: a failure
// here is rolled back to the savepoint and logged, and the order itself
// still commits. Most buyers have no referrer, which is a plain no-op.
// =============================================================================

use rust_decimal::Decimal;
use sqlx::{Connection, PgConnection, PgExecutor};
use uuid::Uuid;

use crate::error::AppResult;
use crate::ledger;
use crate::metrics;
use crate::models::{NewTransaction, Referral, TransactionKind, User};

const REFERRAL_COLUMNS: &str =
    "id, referrer_id, referred_id, commission_rate, total_earned, created_at, updated_at";

/// What happened to the commission of one purchase
#[derive(Debug, Clone, PartialEq)]
pub enum CommissionOutcome {
    /// The buyer was not referred by anyone
    NoReferral,
    /// Commission credited to the referrer's wallet
    Paid { referrer_id: Uuid, amount: Decimal },
    /// Commission rounds to zero cents
    ZeroAmount,
    /// Referral bookkeeping done, but the referrer has no wallet to credit
    ReferrerWalletMissing,
    /// Rolled back to the savepoint; see the warning in the log
    Failed,
}

/// `total × rate / 100`, rounded to cents
pub fn commission_for(total_price: Decimal, commission_rate: Decimal) -> Decimal {
    (total_price * commission_rate / Decimal::ONE_HUNDRED).round_dp(2)
}

/// Pay the referral commission for a purchase of `total_price` by `purchaser`.
///
/// Only fails if the savepoint itself cannot be managed (the connection is
/// gone); every business or query failure becomes `CommissionOutcome::Failed`.
pub async fn pay_commission(
    conn: &mut PgConnection,
    purchaser: &User,
    total_price: Decimal,
) -> AppResult<CommissionOutcome> {
    let mut savepoint = conn.begin().await?;

    match settle(&mut *savepoint, purchaser, total_price).await {
        Ok(outcome) => {
            savepoint.commit().await?;
            let label = match &outcome {
                CommissionOutcome::Paid { .. } => "paid",
                CommissionOutcome::NoReferral => "none",
                _ => "skipped",
            };
            metrics::record_commission(label);
            Ok(outcome)
        }
        Err(err) => {
            tracing::warn!(
                purchaser_id = %purchaser.id,
                error = %err,
                "Referral commission failed; order continues without it"
            );
            savepoint.rollback().await?;
            metrics::record_commission("failed");
            Ok(CommissionOutcome::Failed)
        }
    }
}

async fn settle(
    conn: &mut PgConnection,
    purchaser: &User,
    total_price: Decimal,
) -> AppResult<CommissionOutcome> {
    let Some(referral) = sqlx::query_as::<_, Referral>(&format!(
        "SELECT {REFERRAL_COLUMNS} FROM referrals WHERE referred_id = $1 FOR UPDATE"
    ))
    .bind(purchaser.id)
    .fetch_optional(&mut *conn)
    .await?
    else {
        return Ok(CommissionOutcome::NoReferral);
    };

    let commission = commission_for(total_price, referral.commission_rate);
    if commission <= Decimal::ZERO {
        return Ok(CommissionOutcome::ZeroAmount);
    }

    // total_earned tracks the commission, the same figure credited below
    sqlx::query(
        "UPDATE referrals SET total_earned = total_earned + $1, updated_at = NOW() WHERE id = $2",
    )
    .bind(commission)
    .bind(referral.id)
    .execute(&mut *conn)
    .await?;

    let Some(mut wallet) = ledger::lock_wallet(conn, referral.referrer_id).await? else {
        tracing::warn!(
            referrer_id = %referral.referrer_id,
            "Referrer has no wallet; commission not credited"
        );
        return Ok(CommissionOutcome::ReferrerWalletMissing);
    };

    wallet.credit(commission)?;
    ledger::store_wallet(conn, &wallet).await?;
    metrics::record_ledger_operation("credit", true);

    ledger::append_transaction(
        conn,
        &NewTransaction::completed(
            referral.referrer_id,
            TransactionKind::Commission,
            commission,
            format!("Referral commission from {}'s purchase", purchaser.name),
        ),
    )
    .await?;

    tracing::info!(
        referrer_id = %referral.referrer_id,
        purchaser_id = %purchaser.id,
        amount = %commission,
        "Referral commission paid"
    );

    Ok(CommissionOutcome::Paid {
        referrer_id: referral.referrer_id,
        amount: commission,
    })
}

/// Link `referred_id` to `referrer_id`; each user can be referred only once
pub async fn create_referral(
    conn: &mut PgConnection,
    referrer_id: Uuid,
    referred_id: Uuid,
    commission_rate: Decimal,
) -> AppResult<Referral> {
    let referral = sqlx::query_as::<_, Referral>(&format!(
        r#"
        INSERT INTO referrals (referrer_id, referred_id, commission_rate)
        VALUES ($1, $2, $3)
        RETURNING {REFERRAL_COLUMNS}
        "#
    ))
    .bind(referrer_id)
    .bind(referred_id)
    .bind(commission_rate)
    .fetch_one(&mut *conn)
    .await?;

    Ok(referral)
}

/// Referral a buyer came in through, if any
pub async fn find_referral_for<'e, E>(executor: E, referred_id: Uuid) -> AppResult<Option<Referral>>
where
    E: PgExecutor<'e>,
{
    let referral = sqlx::query_as::<_, Referral>(&format!(
        "SELECT {REFERRAL_COLUMNS} FROM referrals WHERE referred_id = $1"
    ))
    .bind(referred_id)
    .fetch_optional(executor)
    .await?;

    Ok(referral)
}

/// Sum of `total_earned` over every referral the user made
pub async fn referral_earnings<'e, E>(executor: E, referrer_id: Uuid) -> AppResult<Decimal>
where
    E: PgExecutor<'e>,
{
    let total: Option<Decimal> =
        sqlx::query_scalar("SELECT SUM(total_earned) FROM referrals WHERE referrer_id = $1")
            .bind(referrer_id)
            .fetch_one(executor)
            .await?;

    Ok(total.unwrap_or(Decimal::ZERO))
}
