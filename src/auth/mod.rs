//! Authentication: API keys, session tokens, magic links, Telegram login
//! and Google OAuth, plus idempotent account resolution.

pub mod api_keys;
pub mod extract;
pub mod oauth;
pub mod telegram;
pub mod tokens;

use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::models::Account;
use crate::store::KvError;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    Invalid,
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error("token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
    #[error("oauth: {0}")]
    OAuth(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub(crate) const ACCOUNT_COLUMNS: &str = "id, telegram_id, email, oauth_sub, balance_usd, \
     auto_recharge_threshold, auto_recharge_amount, opt_in_debug, \
     email_auth_token, email_auth_expires, created_at, last_active_at";

pub async fn account_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Account>, AuthError> {
    Ok(
        sqlx::query_as(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"))
            .bind(id)
            .fetch_optional(pool)
            .await?,
    )
}

/// Idempotent on the Telegram id; bumps `last_active_at` on revisit.
pub async fn get_or_create_by_telegram(
    pool: &PgPool,
    telegram_id: i64,
) -> Result<Account, AuthError> {
    Ok(sqlx::query_as(&format!(
        "INSERT INTO accounts (telegram_id) VALUES ($1)
         ON CONFLICT (telegram_id) DO UPDATE SET last_active_at = now()
         RETURNING {ACCOUNT_COLUMNS}"
    ))
    .bind(telegram_id)
    .fetch_one(pool)
    .await?)
}

/// Idempotent on the lowercased email.
pub async fn get_or_create_by_email(pool: &PgPool, email: &str) -> Result<Account, AuthError> {
    let email = email.trim().to_lowercase();
    Ok(sqlx::query_as(&format!(
        "INSERT INTO accounts (email) VALUES ($1)
         ON CONFLICT (email) DO UPDATE SET last_active_at = now()
         RETURNING {ACCOUNT_COLUMNS}"
    ))
    .bind(email)
    .fetch_one(pool)
    .await?)
}

/// Idempotent on the OAuth subject. An existing email-only account with a
/// matching address is linked rather than duplicated.
pub async fn get_or_create_by_oauth(
    pool: &PgPool,
    subject: &str,
    email: &str,
) -> Result<Account, AuthError> {
    let email = email.trim().to_lowercase();

    let linked: Option<Account> = sqlx::query_as(&format!(
        "UPDATE accounts SET oauth_sub = $1, last_active_at = now()
         WHERE email = $2 AND (oauth_sub IS NULL OR oauth_sub = $1)
         RETURNING {ACCOUNT_COLUMNS}"
    ))
    .bind(subject)
    .bind(&email)
    .fetch_optional(pool)
    .await?;
    if let Some(account) = linked {
        return Ok(account);
    }

    Ok(sqlx::query_as(&format!(
        "INSERT INTO accounts (oauth_sub, email) VALUES ($1, $2)
         ON CONFLICT (oauth_sub) DO UPDATE SET last_active_at = now()
         RETURNING {ACCOUNT_COLUMNS}"
    ))
    .bind(subject)
    .bind(&email)
    .fetch_one(pool)
    .await?)
}

/// Mint and store a single-use magic-link token with a 15-minute absolute
/// expiry. Any previous token on the account is replaced.
pub async fn set_magic_link(pool: &PgPool, account_id: Uuid) -> Result<String, AuthError> {
    let token = tokens::new_url_safe_token();
    sqlx::query(
        "UPDATE accounts
         SET email_auth_token = $2, email_auth_expires = now() + interval '15 minutes'
         WHERE id = $1",
    )
    .bind(account_id)
    .bind(&token)
    .execute(pool)
    .await?;
    Ok(token)
}

/// Atomically consume an unexpired magic-link token.
pub async fn verify_magic_link(pool: &PgPool, token: &str) -> Result<Option<Account>, AuthError> {
    Ok(sqlx::query_as(&format!(
        "UPDATE accounts
         SET email_auth_token = NULL, email_auth_expires = NULL, last_active_at = now()
         WHERE email_auth_token = $1 AND email_auth_expires > now()
         RETURNING {ACCOUNT_COLUMNS}"
    ))
    .bind(token)
    .fetch_optional(pool)
    .await?)
}
