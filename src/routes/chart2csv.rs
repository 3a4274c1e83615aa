//! Chart extraction gateway: multipart upload forwarded to the
//! extraction service, metered at 50 credits per extraction.

use axum::extract::{Multipart, State};
use axum::response::Response;
use serde_json::json;

use crate::auth::extract::Caller;
use crate::error::ApiError;
use crate::routes::gateway;
use crate::state::AppState;

const PRODUCT: &str = "chart2csv";
const MAX_UPLOAD: usize = 20 * 1024 * 1024;

pub async fn extract(
    State(state): State<AppState>,
    caller: Caller,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    gateway::admit(&state, &caller, PRODUCT, 1).await?;

    let mut file = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(format!("invalid multipart body: {e}")))?
    {
        if field.name() == Some("file") {
            let filename = field.file_name().unwrap_or("chart.png").to_string();
            let content_type = field
                .content_type()
                .unwrap_or("application/octet-stream")
                .to_string();
            let data = field
                .bytes()
                .await
                .map_err(|e| ApiError::Validation(format!("reading upload: {e}")))?;
            if data.len() > MAX_UPLOAD {
                return Err(ApiError::Validation("file exceeds 20 MiB".into()));
            }
            file = Some((filename, content_type, data));
        }
    }
    let (filename, content_type, data) =
        file.ok_or_else(|| ApiError::Validation("file field is required".into()))?;

    let part = reqwest::multipart::Part::bytes(data.to_vec())
        .file_name(filename)
        .mime_str(&content_type)
        .map_err(|e| ApiError::Validation(format!("invalid content type: {e}")))?;
    let form = reqwest::multipart::Form::new().part("file", part);

    let response = state
        .http_long
        .post(format!("{}/v1/extract", state.settings.chart2csv_url))
        .multipart(form)
        .send()
        .await
        .map_err(|e| gateway::unreachable_error(PRODUCT, e))?;
    let result = gateway::into_value(PRODUCT, response).await?;

    let chart_type = result["chart_type"].clone();
    let metered = gateway::meter(
        &state,
        &caller,
        PRODUCT,
        1,
        None,
        None,
        json!({ "endpoint": "extract", "chart_type": chart_type }),
    )
    .await?;

    Ok(gateway::annotate(result, &metered))
}
