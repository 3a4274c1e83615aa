//! API key management. The raw secret appears exactly once, in the
//! creation response; afterwards only the prefix identifies the key.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::auth::api_keys;
use crate::auth::extract::AuthAccount;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateKeyRequest {
    pub label: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Serialize)]
pub struct CreatedKeyResponse {
    pub id: Uuid,
    /// Full key, shown once. The server keeps only a keyed hash.
    pub key: String,
    pub prefix: String,
    pub label: Option<String>,
    pub scopes: Vec<String>,
}

pub async fn create(
    State(state): State<AppState>,
    AuthAccount(account): AuthAccount,
    Json(req): Json<CreateKeyRequest>,
) -> Result<(StatusCode, Json<CreatedKeyResponse>), ApiError> {
    if let Some(label) = &req.label
        && label.len() > 64
    {
        return Err(ApiError::Validation("label must be at most 64 characters".into()));
    }

    let generated = api_keys::generate(&state.settings.server_secret);
    let id: Uuid = sqlx::query_scalar(
        "INSERT INTO api_keys (account_id, key_prefix, key_hash, label, scopes)
         VALUES ($1, $2, $3, $4, $5)
         RETURNING id",
    )
    .bind(account.id)
    .bind(&generated.prefix)
    .bind(&generated.hash)
    .bind(&req.label)
    .bind(&req.scopes)
    .fetch_one(&state.db)
    .await?;

    state
        .ledger
        .record_audit(account.id, "CREATE_KEY", json!({ "key_id": id, "prefix": generated.prefix }))
        .await;

    Ok((
        StatusCode::CREATED,
        Json(CreatedKeyResponse {
            id,
            key: generated.full_key,
            prefix: generated.prefix,
            label: req.label,
            scopes: req.scopes,
        }),
    ))
}

#[derive(Serialize)]
pub struct KeyInfo {
    pub id: Uuid,
    pub prefix: String,
    pub label: Option<String>,
    pub scopes: Vec<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

pub async fn list(
    State(state): State<AppState>,
    AuthAccount(account): AuthAccount,
) -> Result<Json<Vec<KeyInfo>>, ApiError> {
    let rows: Vec<crate::models::ApiKey> = sqlx::query_as(
        "SELECT id, account_id, key_prefix, key_hash, label, scopes, is_active,
                created_at, last_used_at
         FROM api_keys
         WHERE account_id = $1
         ORDER BY created_at DESC",
    )
    .bind(account.id)
    .fetch_all(&state.db)
    .await?;

    Ok(Json(
        rows.into_iter()
            .map(|key| KeyInfo {
                id: key.id,
                prefix: key.key_prefix,
                label: key.label,
                scopes: key.scopes,
                is_active: key.is_active,
                created_at: key.created_at,
                last_used_at: key.last_used_at,
            })
            .collect(),
    ))
}

#[derive(Serialize)]
pub struct RevokeResponse {
    pub status: &'static str,
}

/// Soft delete: the key row stays for the audit trail, `is_active` gates
/// verification.
pub async fn revoke(
    State(state): State<AppState>,
    AuthAccount(account): AuthAccount,
    Path(key_id): Path<Uuid>,
) -> Result<Json<RevokeResponse>, ApiError> {
    let updated = sqlx::query(
        "UPDATE api_keys SET is_active = FALSE WHERE id = $1 AND account_id = $2",
    )
    .bind(key_id)
    .bind(account.id)
    .execute(&state.db)
    .await?;

    if updated.rows_affected() == 0 {
        return Err(ApiError::NotFound("API key not found".into()));
    }

    state
        .ledger
        .record_audit(account.id, "REVOKE_KEY", json!({ "key_id": key_id }))
        .await;

    Ok(Json(RevokeResponse { status: "revoked" }))
}
