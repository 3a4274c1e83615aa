//! Webhook intake. Each handler adapts one provider's envelope to a
//! `WebhookEvent` and maps the engine outcome to the response contract:
//! 200 for processed/ignored, 403 for signature failures (200 with an
//! error body for retry-hostile providers), 500 for transient failures so
//! the provider redelivers.

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use serde_json::{Value, json};

use crate::error::ApiError;
use crate::payments::engine::EngineError;
use crate::payments::{WebhookEvent, WebhookOutcome};
use crate::state::AppState;

fn header(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn parse_body(body: &Bytes) -> Result<Value, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::Validation(format!("invalid JSON payload: {e}")))
}

async fn dispatch(
    state: &AppState,
    provider: &str,
    event: WebhookEvent,
) -> Result<Json<Value>, ApiError> {
    let event_id = event.event_id.clone();
    let outcome = state
        .payments
        .process_webhook(provider, &event)
        .await
        .map_err(|err| match err {
            EngineError::UnknownProvider(tag) => {
                ApiError::NotFound(format!("unknown provider: {tag}"))
            }
            // Transient: answer 5xx so the provider retries the event.
            other => {
                tracing::error!(provider, event_id = %event_id, error = %other, "webhook processing failed");
                ApiError::Internal(format!("webhook processing: {other}"))
            }
        })?;

    match outcome {
        WebhookOutcome::Processed { transaction_id } => Ok(Json(json!({
            "status": "processed",
            "transaction_id": transaction_id,
        }))),
        WebhookOutcome::Ignored => Ok(Json(json!({
            "status": "ignored",
            "message": "Event already processed or not applicable",
        }))),
        WebhookOutcome::InvalidSignature { silent: true } => Ok(Json(json!({
            "status": "error",
            "message": "invalid signature",
        }))),
        WebhookOutcome::InvalidSignature { silent: false } => Err(ApiError::InvalidSignature),
    }
}

pub async fn paddle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let parsed = parse_body(&body)?;
    let event = WebhookEvent {
        event_type: parsed["event_type"].as_str().unwrap_or("unknown").to_string(),
        event_id: parsed["event_id"].as_str().unwrap_or_default().to_string(),
        data: parsed,
        raw_body: body.to_vec(),
        signature: header(&headers, "paddle-signature"),
    };
    dispatch(&state, "paddle", event).await
}

pub async fn lemonsqueezy(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let parsed = parse_body(&body)?;
    let meta = &parsed["meta"];
    let event = WebhookEvent {
        event_type: meta["event_name"].as_str().unwrap_or("unknown").to_string(),
        event_id: meta["event_id"]
            .as_str()
            .or_else(|| parsed["data"]["id"].as_str())
            .unwrap_or_default()
            .to_string(),
        data: parsed,
        raw_body: body.to_vec(),
        signature: header(&headers, "x-signature"),
    };
    dispatch(&state, "lemonsqueezy", event).await
}

/// Posted by the bot process on `successful_payment`; Telegram transport
/// is trusted end-to-end, so there is no signature to check.
pub async fn telegram_stars(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let parsed = parse_body(&body)?;
    let event_id = parsed["telegram_payment_charge_id"]
        .as_str()
        .or_else(|| parsed["event_id"].as_str())
        .unwrap_or_default()
        .to_string();
    let event = WebhookEvent {
        event_type: "successful_payment".to_string(),
        event_id,
        data: parsed,
        raw_body: body.to_vec(),
        signature: String::new(),
    };
    dispatch(&state, "telegram_stars", event).await
}
