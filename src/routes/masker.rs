//! PII redaction gateway, metered at 1 credit per request.

use axum::Json;
use axum::extract::State;
use axum::response::Response;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::auth::extract::Caller;
use crate::error::ApiError;
use crate::routes::gateway;
use crate::state::AppState;

const PRODUCT: &str = "masker";

#[derive(Deserialize)]
pub struct RedactRequest {
    pub text: Option<String>,
    pub json: Option<Value>,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_language")]
    pub language: String,
    pub entities: Option<Vec<String>>,
}

fn default_mode() -> String {
    "mask".into()
}

fn default_language() -> String {
    "en".into()
}

pub async fn redact(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<RedactRequest>,
) -> Result<Response, ApiError> {
    if req.text.is_none() && req.json.is_none() {
        return Err(ApiError::Validation("either text or json is required".into()));
    }

    gateway::admit(&state, &caller, PRODUCT, 1).await?;

    let mut body = json!({ "mode": req.mode, "language": req.language });
    if let Some(text) = &req.text {
        body["text"] = json!(text);
    }
    if let Some(payload) = &req.json {
        body["json"] = payload.clone();
    }
    if let Some(entities) = &req.entities {
        body["entities"] = json!(entities);
    }

    let response = state
        .http
        .post(format!("{}/api/v1/mask", state.settings.masker_url))
        .json(&body)
        .send()
        .await
        .map_err(|e| gateway::unreachable_error(PRODUCT, e))?;
    let result = gateway::into_value(PRODUCT, response).await?;

    let metered = gateway::meter(
        &state,
        &caller,
        PRODUCT,
        1,
        None,
        None,
        json!({ "endpoint": "redact", "mode": req.mode }),
    )
    .await?;

    Ok(gateway::annotate(result, &metered))
}
