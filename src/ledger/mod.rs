//! Transactional balance store.
//!
//! Source of truth for account balances. Every mutation happens inside a
//! database transaction holding a row-level lock on the account, and is
//! paired with an append-only `transactions` row whose unique idempotency
//! key turns duplicate submissions into a benign read of the current
//! balance.

mod cache;

pub use cache::{BalanceCache, CircuitBreaker};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::{Value, json};
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Transaction, TransactionKind};
use crate::store::KvStore;
use crate::trace;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient balance: required {required}, available {balance}")]
    InsufficientBalance { balance: Decimal, required: Decimal },
    #[error("account not found")]
    AccountNotFound,
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

pub struct CreditOutcome {
    pub transaction_id: Uuid,
    pub balance: Decimal,
    /// True when the idempotency key had already been processed.
    pub duplicate: bool,
}

#[derive(Debug, sqlx::FromRow)]
pub struct UsageStat {
    pub product_id: String,
    pub units: i64,
    pub cost_usd: Decimal,
}

pub struct Ledger {
    pool: PgPool,
    cache: BalanceCache,
}

fn quantize(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(8, RoundingStrategy::MidpointNearestEven)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

impl Ledger {
    pub fn new(pool: PgPool, kv: Arc<dyn KvStore>) -> Self {
        Self {
            pool,
            cache: BalanceCache::new(kv),
        }
    }

    /// Add (or, for refunds, remove) funds. Replays with a known
    /// idempotency key return the existing transaction unchanged.
    pub async fn credit(
        &self,
        account_id: Uuid,
        amount: Decimal,
        idempotency_key: &str,
        kind: TransactionKind,
        description: &str,
    ) -> Result<CreditOutcome, LedgerError> {
        let amount = quantize(amount);
        let mut tx = self.pool.begin().await?;

        let inserted: Option<Uuid> = sqlx::query_scalar(
            "INSERT INTO transactions (account_id, amount_usd, type, idempotency_key, description)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (idempotency_key) DO NOTHING
             RETURNING id",
        )
        .bind(account_id)
        .bind(amount)
        .bind(kind.as_str())
        .bind(idempotency_key)
        .bind(description)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(transaction_id) = inserted else {
            tx.rollback().await?;
            let existing: Uuid =
                sqlx::query_scalar("SELECT id FROM transactions WHERE idempotency_key = $1")
                    .bind(idempotency_key)
                    .fetch_one(&self.pool)
                    .await?;
            let balance = self.balance_from_db(account_id).await?;
            return Ok(CreditOutcome {
                transaction_id: existing,
                balance,
                duplicate: true,
            });
        };

        // Row lock serializes concurrent mutations on the same account.
        sqlx::query("SELECT 1 FROM accounts WHERE id = $1 FOR UPDATE")
            .bind(account_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(LedgerError::AccountNotFound)?;

        let balance: Decimal = sqlx::query_scalar(
            "UPDATE accounts SET balance_usd = balance_usd + $2 WHERE id = $1
             RETURNING balance_usd",
        )
        .bind(account_id)
        .bind(amount)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        self.cache.put(account_id, balance).await;

        Ok(CreditOutcome {
            transaction_id,
            balance,
            duplicate: false,
        })
    }

    /// Charge for product usage: writes the usage log and the USAGE
    /// transaction, and deducts the cost, all in one database transaction.
    /// Returns the new balance.
    pub async fn debit(
        &self,
        account_id: Uuid,
        product_id: &str,
        units: i64,
        cost: Decimal,
        idempotency_key: &str,
        metadata: Value,
    ) -> Result<Decimal, LedgerError> {
        let cost = quantize(cost);
        let mut tx = self.pool.begin().await?;

        // Retry short-circuit: a metered endpoint replaying its key gets
        // the current balance back without a second charge.
        let seen: Option<i32> =
            sqlx::query_scalar("SELECT 1 FROM transactions WHERE idempotency_key = $1")
                .bind(idempotency_key)
                .fetch_optional(&mut *tx)
                .await?;
        if seen.is_some() {
            tx.rollback().await?;
            return self.balance_from_db(account_id).await;
        }

        let row: Option<(Decimal, Option<Decimal>)> = sqlx::query_as(
            "SELECT balance_usd, auto_recharge_threshold FROM accounts
             WHERE id = $1 FOR UPDATE",
        )
        .bind(account_id)
        .fetch_optional(&mut *tx)
        .await?;
        let (balance, recharge_threshold) = row.ok_or(LedgerError::AccountNotFound)?;

        if balance < cost {
            return Err(LedgerError::InsufficientBalance {
                balance,
                required: cost,
            });
        }

        sqlx::query(
            "INSERT INTO usage_logs (account_id, product_id, units_consumed, cost_usd, metadata_json)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(account_id)
        .bind(product_id)
        .bind(units)
        .bind(cost)
        .bind(&metadata)
        .execute(&mut *tx)
        .await?;

        let description = format!("Usage: {product_id} ({units} units)");
        let insert = sqlx::query(
            "INSERT INTO transactions (account_id, amount_usd, type, product_id, idempotency_key, description)
             VALUES ($1, $2, 'usage', $3, $4, $5)",
        )
        .bind(account_id)
        .bind(-cost)
        .bind(product_id)
        .bind(idempotency_key)
        .bind(&description)
        .execute(&mut *tx)
        .await;

        if let Err(err) = insert {
            // Lost a duplicate-submission race; the winner's outcome stands.
            if is_unique_violation(&err) {
                tx.rollback().await?;
                return self.balance_from_db(account_id).await;
            }
            return Err(err.into());
        }

        let new_balance: Decimal = sqlx::query_scalar(
            "UPDATE accounts
             SET balance_usd = balance_usd - $2, last_active_at = now()
             WHERE id = $1
             RETURNING balance_usd",
        )
        .bind(account_id)
        .bind(cost)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        // Best-effort post-commit work; failures must not fail the charge.
        if let Some(threshold) = recharge_threshold
            && new_balance <= threshold
        {
            self.record_audit(
                account_id,
                "AUTO_RECHARGE_TRIGGERED",
                json!({
                    "balance": new_balance.to_string(),
                    "threshold": threshold.to_string(),
                }),
            )
            .await;
        }
        self.cache.put(account_id, new_balance).await;

        Ok(new_balance)
    }

    pub async fn transaction_by_key(&self, key: &str) -> Result<Option<Uuid>, LedgerError> {
        Ok(
            sqlx::query_scalar("SELECT id FROM transactions WHERE idempotency_key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// Cache-first balance read; misses fall back to Postgres and
    /// repopulate the mirror.
    pub async fn get_balance(&self, account_id: Uuid) -> Result<Decimal, LedgerError> {
        if let Some(balance) = self.cache.get(account_id).await {
            return Ok(balance);
        }
        let balance = self.balance_from_db(account_id).await?;
        self.cache.put(account_id, balance).await;
        Ok(balance)
    }

    async fn balance_from_db(&self, account_id: Uuid) -> Result<Decimal, LedgerError> {
        sqlx::query_scalar("SELECT balance_usd FROM accounts WHERE id = $1")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(LedgerError::AccountNotFound)
    }

    pub async fn history(
        &self,
        account_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Transaction>, LedgerError> {
        Ok(sqlx::query_as(
            "SELECT id, account_id, amount_usd, type, product_id, idempotency_key, description, created_at
             FROM transactions
             WHERE account_id = $1
             ORDER BY created_at DESC
             LIMIT $2",
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn usage_stats(
        &self,
        account_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<UsageStat>, LedgerError> {
        Ok(sqlx::query_as(
            "SELECT product_id,
                    COALESCE(SUM(units_consumed), 0)::BIGINT AS units,
                    COALESCE(SUM(cost_usd), 0) AS cost_usd
             FROM usage_logs
             WHERE account_id = $1 AND timestamp >= $2 AND timestamp < $3
             GROUP BY product_id
             ORDER BY product_id",
        )
        .bind(account_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Security/audit event, stamped with the current request context.
    /// Best-effort: failures are logged and swallowed.
    pub async fn record_audit(&self, account_id: Uuid, action: &str, metadata: Value) {
        let result = sqlx::query(
            "INSERT INTO audit_logs (account_id, action, request_id, ip_address, user_agent, metadata_json)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(account_id)
        .bind(action)
        .bind(trace::current_request_id())
        .bind(trace::client_ip())
        .bind(trace::user_agent())
        .bind(metadata)
        .execute(&self.pool)
        .await;

        if let Err(err) = result {
            tracing::warn!(%account_id, action, error = %err, "failed to write audit log");
        }
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn cost_quantized_to_eight_digits_bankers() {
        assert_eq!(quantize(dec!(0.000000005)), dec!(0.00000000));
        assert_eq!(quantize(dec!(0.000000015)), dec!(0.00000002));
        assert_eq!(quantize(dec!(0.001)), dec!(0.001));
    }
}
