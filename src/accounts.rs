// =============================================================================
// ACCOUNTS
// =============================================================================
// Registration: a user, their zeroed wallet and, optionally, the referral
// that links them to whoever invited them. All three rows are written in one
// transaction.
// =============================================================================

use rand::Rng;
use rust_decimal::Decimal;
use sqlx::PgConnection;

use crate::commission;
use crate::db::{Database, USER_COLUMNS};
use crate::error::{AppError, AppResult};
use crate::ledger;
use crate::models::{RegisterUserRequest, RegisteredUser, User};

const REFERRAL_CODE_LEN: usize = 8;
const REFERRAL_CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const MAX_REFERRAL_CODE_ATTEMPTS: u32 = 10;

/// Candidate referral code; the UNIQUE constraint decides if it is free
pub fn generate_referral_code() -> String {
    let mut rng = rand::thread_rng();
    (0..REFERRAL_CODE_LEN)
        .map(|_| REFERRAL_CODE_CHARSET[rng.gen_range(0..REFERRAL_CODE_CHARSET.len())] as char)
        .collect()
}

/// Register a user with a wallet, linking them to a referrer if a code is given
///
/// Public sign-up always creates a plain buyer.
///
/// # Arguments
/// * `commission_rate` - percentage the referrer earns on this user's purchases
pub async fn register_user(
    db: &Database,
    request: RegisterUserRequest,
    commission_rate: Decimal,
) -> AppResult<RegisteredUser> {
    register(db, request, commission_rate, false).await
}

/// Register an administrator. Not reachable over HTTP; used by startup
/// provisioning.
pub async fn register_admin(
    db: &Database,
    request: RegisterUserRequest,
    commission_rate: Decimal,
) -> AppResult<RegisteredUser> {
    register(db, request, commission_rate, true).await
}

async fn register(
    db: &Database,
    request: RegisterUserRequest,
    commission_rate: Decimal,
    is_admin: bool,
) -> AppResult<RegisteredUser> {
    let name = request.name.trim().to_string();
    let email = request.email.trim().to_lowercase();

    if name.is_empty() {
        return Err(AppError::BadRequest("Name is required".to_string()));
    }
    if email.is_empty() || !email.contains('@') {
        return Err(AppError::BadRequest("Invalid email".to_string()));
    }

    let mut tx = db.pool().begin().await?;

    let taken: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE email = $1)")
        .bind(&email)
        .fetch_one(&mut *tx)
        .await?;
    if taken {
        return Err(AppError::BadRequest("Email already registered".to_string()));
    }

    // Resolve the inviter before inserting so an unknown code writes nothing
    let referrer = match request.referral_code.as_deref().map(str::trim) {
        Some(code) if !code.is_empty() => Some(
            find_by_referral_code(&mut *tx, &code.to_uppercase())
                .await?
                .ok_or_else(|| AppError::NotFound("Referral code not found".to_string()))?,
        ),
        _ => None,
    };

    let user = insert_with_unique_code(&mut *tx, &name, &email, is_admin).await?;
    let wallet = ledger::create_wallet(&mut *tx, user.id).await?;

    let referral = match referrer {
        Some(referrer) => {
            Some(commission::create_referral(&mut *tx, referrer.id, user.id, commission_rate).await?)
        }
        None => None,
    };

    tx.commit().await?;

    tracing::info!(
        user_id = %user.id,
        is_admin,
        referred = referral.is_some(),
        "User registered"
    );

    Ok(RegisteredUser {
        user,
        wallet,
        referral,
    })
}

async fn insert_with_unique_code(
    conn: &mut PgConnection,
    name: &str,
    email: &str,
    is_admin: bool,
) -> AppResult<User> {
    for _ in 0..MAX_REFERRAL_CODE_ATTEMPTS {
        let code = generate_referral_code();
        let inserted = sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (name, email, referral_code, is_admin)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (referral_code) DO NOTHING
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(name)
        .bind(email)
        .bind(&code)
        .bind(is_admin)
        .fetch_optional(&mut *conn)
        .await;

        match inserted {
            Ok(Some(user)) => return Ok(user),
            Ok(None) => continue,
            // A concurrent registration took the same email
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                return Err(AppError::BadRequest("Email already registered".to_string()));
            }
            Err(err) => return Err(err.into()),
        }
    }

    Err(AppError::Internal(format!(
        "no free referral code after {MAX_REFERRAL_CODE_ATTEMPTS} attempts"
    )))
}

async fn find_by_referral_code(conn: &mut PgConnection, code: &str) -> AppResult<Option<User>> {
    let user = sqlx::query_as::<_, User>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE referral_code = $1"
    ))
    .bind(code)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(user)
}
