use anyhow::{Context, Result};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::credits;

pub async fn connect(url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("connecting to postgres")
}

/// Idempotent schema setup plus product seeding. Price changes in the
/// catalogue propagate on redeploy; past transactions are untouched.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(
        "
        CREATE TABLE IF NOT EXISTS accounts (
            id                      UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            telegram_id             BIGINT UNIQUE,
            email                   TEXT UNIQUE,
            oauth_sub               TEXT UNIQUE,
            balance_usd             NUMERIC(18, 8) NOT NULL DEFAULT 0,
            auto_recharge_threshold NUMERIC(18, 8),
            auto_recharge_amount    NUMERIC(18, 8),
            opt_in_debug            BOOLEAN NOT NULL DEFAULT FALSE,
            email_auth_token        TEXT UNIQUE,
            email_auth_expires      TIMESTAMPTZ,
            created_at              TIMESTAMPTZ NOT NULL DEFAULT now(),
            last_active_at          TIMESTAMPTZ NOT NULL DEFAULT now()
        );

        CREATE TABLE IF NOT EXISTS products (
            id                  TEXT PRIMARY KEY,
            name                TEXT NOT NULL,
            base_price_per_unit NUMERIC(18, 8) NOT NULL,
            unit_name           TEXT NOT NULL DEFAULT 'request',
            is_active           BOOLEAN NOT NULL DEFAULT TRUE
        );

        CREATE TABLE IF NOT EXISTS api_keys (
            id           UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            account_id   UUID NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            key_prefix   TEXT NOT NULL,
            key_hash     TEXT UNIQUE NOT NULL,
            label        TEXT,
            scopes       TEXT[] NOT NULL DEFAULT '{}',
            is_active    BOOLEAN NOT NULL DEFAULT TRUE,
            created_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
            last_used_at TIMESTAMPTZ
        );
        CREATE INDEX IF NOT EXISTS api_keys_prefix_idx ON api_keys (key_prefix);

        CREATE TABLE IF NOT EXISTS transactions (
            id              UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            account_id      UUID NOT NULL REFERENCES accounts(id) ON DELETE RESTRICT,
            amount_usd      NUMERIC(18, 8) NOT NULL,
            type            TEXT NOT NULL,
            product_id      TEXT REFERENCES products(id),
            idempotency_key TEXT UNIQUE NOT NULL,
            description     TEXT,
            created_at      TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        CREATE INDEX IF NOT EXISTS transactions_account_idx
            ON transactions (account_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS usage_logs (
            id             UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            account_id     UUID NOT NULL REFERENCES accounts(id) ON DELETE RESTRICT,
            product_id     TEXT NOT NULL REFERENCES products(id),
            units_consumed BIGINT NOT NULL,
            cost_usd       NUMERIC(18, 8) NOT NULL,
            metadata_json  JSONB,
            timestamp      TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        CREATE INDEX IF NOT EXISTS usage_logs_account_idx
            ON usage_logs (account_id, timestamp DESC);

        CREATE TABLE IF NOT EXISTS audit_logs (
            id            UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            account_id    UUID NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            action        TEXT NOT NULL,
            actor_id      TEXT,
            request_id    TEXT,
            ip_address    TEXT,
            user_agent    TEXT,
            metadata_json JSONB,
            timestamp     TIMESTAMPTZ NOT NULL DEFAULT now()
        );

        CREATE TABLE IF NOT EXISTS debug_logs (
            id            UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            account_id    UUID NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            request_id    TEXT,
            path          TEXT NOT NULL,
            method        TEXT NOT NULL,
            request_body  TEXT,
            response_body TEXT,
            status_code   INT NOT NULL,
            timestamp     TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        ",
    )
    .execute(pool)
    .await
    .context("running schema migration")?;

    for product in credits::CATALOGUE {
        let price = credits::price_usd(product.id, 1).expect("catalogue product");
        sqlx::query(
            "INSERT INTO products (id, name, base_price_per_unit, unit_name)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO UPDATE
                 SET name = EXCLUDED.name,
                     base_price_per_unit = EXCLUDED.base_price_per_unit,
                     unit_name = EXCLUDED.unit_name",
        )
        .bind(product.id)
        .bind(product.name)
        .bind(price)
        .bind(product.unit)
        .execute(pool)
        .await
        .with_context(|| format!("seeding product {}", product.id))?;
    }

    Ok(())
}
