//! Spam analysis gateway. Units are messages: admission, free-tier
//! accounting and billing all scale with the batch size.

use axum::Json;
use axum::extract::State;
use axum::response::Response;
use serde::Deserialize;
use serde_json::json;

use crate::auth::extract::Caller;
use crate::error::ApiError;
use crate::routes::gateway;
use crate::state::AppState;

const PRODUCT: &str = "patas";
const MAX_MESSAGES: usize = 1_000;

#[derive(Deserialize)]
pub struct AnalyzeRequest {
    pub messages: Vec<String>,
    pub context: Option<String>,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

fn default_threshold() -> f64 {
    0.7
}

pub async fn analyze(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<AnalyzeRequest>,
) -> Result<Response, ApiError> {
    if req.messages.is_empty() || req.messages.len() > MAX_MESSAGES {
        return Err(ApiError::Validation(format!(
            "messages must contain between 1 and {MAX_MESSAGES} entries"
        )));
    }
    if !(0.0..=1.0).contains(&req.threshold) {
        return Err(ApiError::Validation("threshold must be within [0, 1]".into()));
    }
    let units = req.messages.len() as i64;

    gateway::admit(&state, &caller, PRODUCT, units).await?;

    let mut body = json!({ "messages": req.messages, "threshold": req.threshold });
    if let Some(context) = &req.context {
        body["context"] = json!(context);
    }

    let response = state
        .http
        .post(format!("{}/api/v1/analyze", state.settings.patas_url))
        .json(&body)
        .send()
        .await
        .map_err(|e| gateway::unreachable_error(PRODUCT, e))?;
    let result = gateway::into_value(PRODUCT, response).await?;

    let spam_count = result["spam_count"].clone();
    let metered = gateway::meter(
        &state,
        &caller,
        PRODUCT,
        units,
        None,
        None,
        json!({
            "endpoint": "analyze",
            "message_count": units,
            "spam_count": spam_count,
        }),
    )
    .await?;

    Ok(gateway::annotate(result, &metered))
}
