//! ReliAPI proxy gateway. Requires an API key with the matching scope.
//! These are the variable-cost products: the upstream reports the actual
//! cost, which is what gets debited, while the nominal unit count is what
//! gets recorded.

use axum::Json;
use axum::extract::State;
use axum::response::Response;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::auth::extract::{Caller, KeyAccount};
use crate::credits;
use crate::error::ApiError;
use crate::routes::gateway;
use crate::state::AppState;

const PRODUCT: &str = "reliapi";

const DEFAULT_LLM_COST: Decimal = dec!(0.001);
const DEFAULT_HTTP_COST: Decimal = dec!(0.0005);

#[derive(Deserialize)]
pub struct LlmProxyRequest {
    pub target: String,
    pub model: String,
    pub messages: Vec<Value>,
    #[serde(default = "default_cache")]
    pub cache: u64,
    pub idempotency_key: Option<String>,
    #[serde(default = "default_retries")]
    pub max_retries: u32,
}

#[derive(Deserialize)]
pub struct HttpProxyRequest {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: Map<String, Value>,
    pub body: Option<Value>,
    #[serde(default = "default_cache")]
    pub cache: u64,
    pub idempotency_key: Option<String>,
    #[serde(default = "default_retries")]
    pub max_retries: u32,
}

fn default_cache() -> u64 {
    3600
}

fn default_retries() -> u32 {
    3
}

fn default_method() -> String {
    "GET".into()
}

pub async fn llm(
    State(state): State<AppState>,
    key: KeyAccount,
    Json(req): Json<LlmProxyRequest>,
) -> Result<Response, ApiError> {
    key.require_scope("reliapi:llm")?;
    if req.messages.is_empty() {
        return Err(ApiError::Validation("messages must not be empty".into()));
    }

    let caller = Caller::Account(key.account);
    gateway::admit(&state, &caller, PRODUCT, 1).await?;

    if let Some(response) = replay_short_circuit(&state, &caller, req.idempotency_key.as_deref()).await? {
        return Ok(response);
    }

    let body = json!({
        "target": req.target,
        "model": req.model,
        "messages": req.messages,
        "cache": req.cache,
        "max_retries": req.max_retries,
    });
    let response = state
        .http
        .post(format!("{}/v1/llm", state.settings.reliapi_url))
        .json(&body)
        .send()
        .await
        .map_err(|e| gateway::unreachable_error(PRODUCT, e))?;
    let result = gateway::into_value(PRODUCT, response).await?;

    let actual_cost = reported_cost(&result).unwrap_or(DEFAULT_LLM_COST);
    let metered = gateway::meter(
        &state,
        &caller,
        PRODUCT,
        1,
        Some(actual_cost),
        req.idempotency_key,
        json!({
            "endpoint": "proxy/llm",
            "target": req.target,
            "model": req.model,
            "actual_cost": actual_cost.to_string(),
        }),
    )
    .await?;

    Ok(gateway::annotate(result, &metered))
}

pub async fn http(
    State(state): State<AppState>,
    key: KeyAccount,
    Json(req): Json<HttpProxyRequest>,
) -> Result<Response, ApiError> {
    key.require_scope("reliapi:http")?;

    let caller = Caller::Account(key.account);
    gateway::admit(&state, &caller, PRODUCT, 1).await?;

    if let Some(response) = replay_short_circuit(&state, &caller, req.idempotency_key.as_deref()).await? {
        return Ok(response);
    }

    let body = json!({
        "url": req.url,
        "method": req.method,
        "headers": req.headers,
        "body": req.body,
        "cache": req.cache,
        "max_retries": req.max_retries,
    });
    let response = state
        .http
        .post(format!("{}/v1/http", state.settings.reliapi_url))
        .json(&body)
        .send()
        .await
        .map_err(|e| gateway::unreachable_error(PRODUCT, e))?;
    let result = gateway::into_value(PRODUCT, response).await?;

    let actual_cost = reported_cost(&result).unwrap_or(DEFAULT_HTTP_COST);
    let metered = gateway::meter(
        &state,
        &caller,
        PRODUCT,
        1,
        Some(actual_cost),
        req.idempotency_key,
        json!({
            "endpoint": "proxy/http",
            "method": req.method,
            "url": req.url,
            "actual_cost": actual_cost.to_string(),
        }),
    )
    .await?;

    Ok(gateway::annotate(result, &metered))
}

/// A caller-supplied idempotency key that already has a ledger row means a
/// completed earlier attempt: answer with the standing balance instead of
/// re-running the upstream call or charging again.
async fn replay_short_circuit(
    state: &AppState,
    caller: &Caller,
    idempotency_key: Option<&str>,
) -> Result<Option<Response>, ApiError> {
    let (Some(key), Caller::Account(account)) = (idempotency_key, caller) else {
        return Ok(None);
    };
    let existing = state
        .ledger
        .transaction_by_key(key)
        .await
        .map_err(|e| ApiError::Internal(format!("ledger: {e}")))?;
    if existing.is_none() {
        return Ok(None);
    }

    let balance = state
        .ledger
        .get_balance(account.id)
        .await
        .map_err(|e| ApiError::Internal(format!("balance read: {e}")))?;
    let metered = gateway::Metered::Billed {
        credits_used: Decimal::ZERO,
        credits_remaining: credits::usd_to_credits(balance.max(Decimal::ZERO)).unwrap_or(0),
    };
    Ok(Some(gateway::annotate(
        json!({ "status": "duplicate", "idempotency_key": key }),
        &metered,
    )))
}

/// `meta.cost_usd` from the upstream response, as string or number.
fn reported_cost(result: &Value) -> Option<Decimal> {
    let cost = &result["meta"]["cost_usd"];
    match cost {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => Decimal::try_from(n.as_f64()?).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_cost_parses_from_string_or_number() {
        assert_eq!(
            reported_cost(&json!({"meta": {"cost_usd": "0.00123"}})),
            Some(dec!(0.00123))
        );
        assert_eq!(
            reported_cost(&json!({"meta": {"cost_usd": 0.5}})),
            Some(dec!(0.5))
        );
        assert_eq!(reported_cost(&json!({"meta": {}})), None);
        assert_eq!(reported_cost(&json!({})), None);
    }
}
