use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// A billable account. Balance is only ever mutated inside a committed
/// ledger transaction.
#[derive(Debug, Clone, FromRow)]
pub struct Account {
    pub id: Uuid,
    pub telegram_id: Option<i64>,
    pub email: Option<String>,
    pub oauth_sub: Option<String>,
    pub balance_usd: Decimal,
    pub auto_recharge_threshold: Option<Decimal>,
    pub auto_recharge_amount: Option<Decimal>,
    pub opt_in_debug: bool,
    pub email_auth_token: Option<String>,
    pub email_auth_expires: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ApiKey {
    pub id: Uuid,
    pub account_id: Uuid,
    pub key_prefix: String,
    pub key_hash: String,
    pub label: Option<String>,
    pub scopes: Vec<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiKey {
    /// Empty scope set means unrestricted.
    pub fn allows(&self, scope: &str) -> bool {
        self.scopes.is_empty() || self.scopes.iter().any(|s| s == scope)
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub base_price_per_unit: Decimal,
    pub unit_name: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Topup,
    Usage,
    Refund,
    Adjustment,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionKind::Topup => "topup",
            TransactionKind::Usage => "usage",
            TransactionKind::Refund => "refund",
            TransactionKind::Adjustment => "adjustment",
        }
    }
}

/// Append-only ledger entry. Positive amount = credit, negative = debit.
#[derive(Debug, Clone, FromRow)]
pub struct Transaction {
    pub id: Uuid,
    pub account_id: Uuid,
    pub amount_usd: Decimal,
    #[sqlx(rename = "type")]
    pub kind: String,
    pub product_id: Option<String>,
    pub idempotency_key: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}
