//! The metered-request pipeline shared by all product endpoints:
//! admission (credits or free quota), upstream dispatch helpers, post-
//! success metering, and response annotation.
//!
//! Ordering is the contract: nothing is debited or counted until the
//! upstream call has succeeded, so upstream failures never consume
//! credits or quota.

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::auth::extract::Caller;
use crate::credits;
use crate::error::ApiError;
use crate::quota::FreeTierUsage;
use crate::state::AppState;

/// Pre-dispatch admission. Side-effect free in both arms.
pub async fn admit(
    state: &AppState,
    caller: &Caller,
    product: &str,
    units: i64,
) -> Result<(), ApiError> {
    match caller {
        Caller::Account(account) => {
            let price = credits::price_usd(product, units)
                .ok_or_else(|| ApiError::Internal(format!("unknown product {product}")))?;
            let balance = state
                .ledger
                .get_balance(account.id)
                .await
                .map_err(|e| ApiError::Internal(format!("balance read: {e}")))?;
            if balance < price {
                return Err(ApiError::InsufficientCredits {
                    balance_credits: credits::usd_to_credits(balance.max(Decimal::ZERO))
                        .unwrap_or(0),
                    required_credits: credits::credits_for(product, units)
                        .unwrap_or(Decimal::ZERO),
                    topup_url: state.settings.topup_url.clone(),
                });
            }
            Ok(())
        }
        Caller::Anonymous { .. } => {
            let decision = state
                .quota
                .check(product, &caller.quota_subject(), units)
                .await?;
            if !decision.allowed {
                return Err(ApiError::QuotaExceeded {
                    message: "Free tier limit exceeded. Sign in to continue.".into(),
                    decision,
                });
            }
            Ok(())
        }
    }
}

/// What the post-success metering produced, for response annotation.
pub enum Metered {
    Billed {
        credits_used: Decimal,
        credits_remaining: i64,
    },
    Free(FreeTierUsage),
}

/// Meter a successful call: debit the ledger for accounts, bump the free
/// counters for anonymous callers. Ledger failures here are real
/// inconsistencies (the upstream work already happened) and surface as 500.
pub async fn meter(
    state: &AppState,
    caller: &Caller,
    product: &str,
    units: i64,
    cost_override: Option<Decimal>,
    idempotency_key: Option<String>,
    metadata: Value,
) -> Result<Metered, ApiError> {
    match caller {
        Caller::Account(account) => {
            let cost = match cost_override {
                Some(cost) => cost,
                None => credits::price_usd(product, units)
                    .ok_or_else(|| ApiError::Internal(format!("unknown product {product}")))?,
            };
            let key = idempotency_key.unwrap_or_else(|| derive_key(product, account.id));
            let balance = state
                .ledger
                .debit(account.id, product, units, cost, &key, metadata)
                .await?;
            Ok(Metered::Billed {
                credits_used: credits::credits_for(product, units).unwrap_or(Decimal::ZERO),
                credits_remaining: credits::usd_to_credits(balance.max(Decimal::ZERO))
                    .unwrap_or(0),
            })
        }
        Caller::Anonymous { .. } => {
            let subject = caller.quota_subject();
            state.quota.record(product, &subject, units).await?;
            Ok(Metered::Free(state.quota.remaining(product, &subject).await?))
        }
    }
}

/// Default debit key: `<product>_<account>_<16 hex chars>`. Callers may
/// supply their own to make retries idempotent.
pub fn derive_key(product: &str, account_id: Uuid) -> String {
    use rand::Rng;
    let bytes: [u8; 8] = rand::rng().random();
    format!("{product}_{account_id}_{}", hex::encode(bytes))
}

/// Merge billing information into the upstream body and stamp the credit
/// headers.
pub fn annotate(mut body: Value, metered: &Metered) -> Response {
    let mut headers = HeaderMap::new();
    match metered {
        Metered::Billed {
            credits_used,
            credits_remaining,
        } => {
            if let Ok(value) = HeaderValue::from_str(&credits_used.normalize().to_string()) {
                headers.insert("x-credits-used", value);
            }
            if let Ok(value) = HeaderValue::from_str(&credits_remaining.to_string()) {
                headers.insert("x-credits-balance", value);
            }
            body["billing"] = json!({
                "credits_used": credits_used.to_f64(),
                "credits_remaining": credits_remaining,
            });
        }
        Metered::Free(usage) => {
            body["free_tier"] = json!(usage);
        }
    }
    (StatusCode::OK, headers, axum::Json(body)).into_response()
}

// ── Upstream dispatch ──────────────────────────────────

/// Map an upstream response to its JSON body, or to the pipeline's error
/// mapping: transport errors and 5xx become 503, other non-2xx pass
/// through with the upstream body.
pub async fn into_value(upstream: &str, response: reqwest::Response) -> Result<Value, ApiError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| ApiError::Upstream(format!("{upstream} returned invalid JSON: {e}")));
    }
    let bytes = response.bytes().await.unwrap_or_default();
    Err(passthrough_error(upstream, status.as_u16(), &bytes))
}

pub fn unreachable_error(upstream: &str, err: reqwest::Error) -> ApiError {
    ApiError::Upstream(format!("{upstream} service unavailable: {err}"))
}

fn passthrough_error(upstream: &str, status: u16, body: &[u8]) -> ApiError {
    if status >= 500 {
        return ApiError::Upstream(format!("{upstream} returned {status}"));
    }
    let body = serde_json::from_slice(body).unwrap_or_else(|_| {
        json!({
            "error": {
                "code": "UPSTREAM_ERROR",
                "message": String::from_utf8_lossy(body),
            }
        })
    });
    ApiError::UpstreamStatus {
        status: StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
        body,
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn derived_keys_are_prefixed_and_unique() {
        let account_id = Uuid::new_v4();
        let a = derive_key("masker", account_id);
        let b = derive_key("masker", account_id);
        assert!(a.starts_with(&format!("masker_{account_id}_")));
        assert_ne!(a, b);
        assert_eq!(a.rsplit('_').next().unwrap().len(), 16);
    }

    #[test]
    fn upstream_5xx_maps_to_service_unavailable() {
        let err = passthrough_error("masker", 502, b"bad gateway");
        assert!(matches!(err, ApiError::Upstream(_)));
    }

    #[test]
    fn upstream_4xx_passes_json_body_through() {
        let err = passthrough_error("masker", 422, br#"{"detail":"bad input"}"#);
        match err {
            ApiError::UpstreamStatus { status, body } => {
                assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
                assert_eq!(body["detail"], "bad input");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn upstream_4xx_wraps_text_bodies() {
        let err = passthrough_error("masker", 404, b"not found");
        match err {
            ApiError::UpstreamStatus { status, body } => {
                assert_eq!(status, StatusCode::NOT_FOUND);
                assert_eq!(body["error"]["message"], "not found");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn billing_annotation_carries_headers_and_body() {
        let metered = Metered::Billed {
            credits_used: dec!(1),
            credits_remaining: 9999,
        };
        let response = annotate(json!({"ok": true}), &metered);
        assert_eq!(response.headers()["x-credits-used"], "1");
        assert_eq!(response.headers()["x-credits-balance"], "9999");
    }
}
