//! Checkout creation. No money moves here; the ledger is touched only by
//! webhook processing.

use axum::Json;
use axum::extract::State;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::auth::extract::AuthAccount;
use crate::error::ApiError;
use crate::payments::engine::EngineError;
use crate::payments::{CheckoutUrls, PaymentRequest, PaymentResult};
use crate::routes::gateway;
use crate::state::AppState;

const MIN_TOPUP: Decimal = dec!(1);
const MAX_TOPUP: Decimal = dec!(10_000);

#[derive(Deserialize)]
pub struct CheckoutRequest {
    pub provider: String,
    pub amount_usd: Decimal,
    pub idempotency_key: Option<String>,
    pub success_url: Option<String>,
    pub cancel_url: Option<String>,
}

#[derive(Serialize)]
pub struct CheckoutResponse {
    pub provider: String,
    #[serde(flatten)]
    pub result: PaymentResult,
}

pub async fn checkout(
    State(state): State<AppState>,
    AuthAccount(account): AuthAccount,
    Json(req): Json<CheckoutRequest>,
) -> Result<Json<CheckoutResponse>, ApiError> {
    if req.amount_usd < MIN_TOPUP || req.amount_usd > MAX_TOPUP {
        return Err(ApiError::Validation(format!(
            "amount must be between {MIN_TOPUP} and {MAX_TOPUP} USD"
        )));
    }

    let request = PaymentRequest {
        account_id: account.id,
        amount_usd: req.amount_usd,
        idempotency_key: req
            .idempotency_key
            .unwrap_or_else(|| gateway::derive_key("topup", account.id)),
    };
    let urls = CheckoutUrls {
        success: req.success_url,
        cancel: req.cancel_url,
    };

    let result = state
        .payments
        .create_payment(&req.provider, &request, &urls)
        .await
        .map_err(|err| match err {
            EngineError::UnknownProvider(tag) => {
                ApiError::Validation(format!("unknown payment provider: {tag}"))
            }
            EngineError::Provider(e) if e.is_transient() => {
                ApiError::Upstream(format!("payment provider unavailable: {e}"))
            }
            EngineError::Provider(e) => ApiError::Validation(format!("checkout rejected: {e}")),
            EngineError::Ledger(e) => ApiError::Internal(format!("ledger: {e}")),
        })?;

    Ok(Json(CheckoutResponse {
        provider: req.provider,
        result,
    }))
}
