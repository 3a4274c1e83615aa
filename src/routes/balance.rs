//! Account surfaces: balance, usage aggregation, transaction history.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Query, State};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::extract::TokenOrKey;
use crate::credits;
use crate::error::ApiError;
use crate::quota::{FreeTierUsage, QuotaSubject};
use crate::state::AppState;

#[derive(Serialize)]
pub struct BalanceResponse {
    pub balance_usd: String,
    pub balance_credits: i64,
    /// Per-product free-tier usage; omitted when the quota store is down.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub free_tier: Option<BTreeMap<&'static str, FreeTierUsage>>,
}

pub async fn balance(
    State(state): State<AppState>,
    TokenOrKey(account): TokenOrKey,
) -> Result<Json<BalanceResponse>, ApiError> {
    let balance = state
        .ledger
        .get_balance(account.id)
        .await
        .map_err(|e| ApiError::Internal(format!("balance read: {e}")))?;

    let subject = QuotaSubject::account(account.id, account.created_at);
    let free_tier = match state.quota.remaining_all(&subject).await {
        Ok(map) => Some(map),
        Err(err) => {
            tracing::warn!(error = %err, "free tier summary unavailable");
            None
        }
    };

    Ok(Json(BalanceResponse {
        balance_usd: balance.to_string(),
        balance_credits: credits::usd_to_credits(balance.max(Decimal::ZERO)).unwrap_or(0),
        free_tier,
    }))
}

#[derive(Deserialize)]
pub struct UsageQuery {
    /// `YYYY-MM`; defaults to the current UTC month.
    pub month: Option<String>,
}

#[derive(Serialize)]
pub struct UsageStatResponse {
    pub product_id: String,
    pub units: i64,
    pub cost_usd: f64,
}

#[derive(Serialize)]
pub struct UsageResponse {
    pub period: String,
    pub balance_usd: String,
    pub usage: Vec<UsageStatResponse>,
}

pub async fn usage(
    State(state): State<AppState>,
    Query(query): Query<UsageQuery>,
    TokenOrKey(account): TokenOrKey,
) -> Result<Json<UsageResponse>, ApiError> {
    let (period, from, to) = month_range(query.month.as_deref())?;

    let stats = state
        .ledger
        .usage_stats(account.id, from, to)
        .await
        .map_err(|e| ApiError::Internal(format!("usage stats: {e}")))?;

    Ok(Json(UsageResponse {
        period,
        balance_usd: account.balance_usd.to_string(),
        usage: stats
            .into_iter()
            .map(|s| UsageStatResponse {
                product_id: s.product_id,
                units: s.units,
                cost_usd: s.cost_usd.to_f64().unwrap_or(0.0),
            })
            .collect(),
    }))
}

/// Flat per-product unit counts for the current month, zero-filled for
/// dashboards.
pub async fn usage_summary(
    State(state): State<AppState>,
    TokenOrKey(account): TokenOrKey,
) -> Result<Json<BTreeMap<String, i64>>, ApiError> {
    let (_, from, to) = month_range(None)?;
    let stats = state
        .ledger
        .usage_stats(account.id, from, to)
        .await
        .map_err(|e| ApiError::Internal(format!("usage stats: {e}")))?;

    let mut summary: BTreeMap<String, i64> = credits::CATALOGUE
        .iter()
        .map(|p| (p.id.to_string(), 0))
        .collect();
    for stat in stats {
        summary.insert(stat.product_id, stat.units);
    }
    Ok(Json(summary))
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

#[derive(Serialize)]
pub struct TransactionResponse {
    pub id: Uuid,
    pub amount_usd: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub product_id: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub async fn history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
    TokenOrKey(account): TokenOrKey,
) -> Result<Json<Vec<TransactionResponse>>, ApiError> {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let transactions = state
        .ledger
        .history(account.id, limit)
        .await
        .map_err(|e| ApiError::Internal(format!("history: {e}")))?;

    Ok(Json(
        transactions
            .into_iter()
            .map(|tx| TransactionResponse {
                id: tx.id,
                amount_usd: tx.amount_usd.to_string(),
                kind: tx.kind,
                product_id: tx.product_id,
                description: tx.description,
                created_at: tx.created_at,
            })
            .collect(),
    ))
}

fn month_range(month: Option<&str>) -> Result<(String, DateTime<Utc>, DateTime<Utc>), ApiError> {
    let now = Utc::now();
    let first = match month {
        Some(month) => NaiveDate::parse_from_str(&format!("{month}-01"), "%Y-%m-%d")
            .map_err(|_| ApiError::Validation("month must be formatted YYYY-MM".into()))?,
        None => NaiveDate::from_ymd_opt(now.year(), now.month(), 1).expect("current month"),
    };
    let next = if first.month() == 12 {
        NaiveDate::from_ymd_opt(first.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(first.year(), first.month() + 1, 1)
    }
    .expect("next month");

    Ok((
        first.format("%Y-%m").to_string(),
        first.and_hms_opt(0, 0, 0).expect("midnight").and_utc(),
        next.and_hms_opt(0, 0, 0).expect("midnight").and_utc(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_range_parses_and_wraps_december() {
        let (period, from, to) = month_range(Some("2026-12")).unwrap();
        assert_eq!(period, "2026-12");
        assert_eq!(from.to_rfc3339(), "2026-12-01T00:00:00+00:00");
        assert_eq!(to.to_rfc3339(), "2027-01-01T00:00:00+00:00");
    }

    #[test]
    fn malformed_month_rejected() {
        assert!(month_range(Some("december")).is_err());
        assert!(month_range(Some("2026-13")).is_err());
    }
}
