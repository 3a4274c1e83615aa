//! Auth surface: magic link, Telegram widget, Google OAuth (both
//! variants), token refresh/logout, and the session profile.

use std::time::Duration;

use axum::Json;
use axum::extract::{Query, State};
use axum::response::Redirect;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::extract::AuthAccount;
use crate::auth::telegram::TelegramLogin;
use crate::auth::{self, tokens};
use crate::auth::tokens::TokenPair;
use crate::error::ApiError;
use crate::state::AppState;

const OAUTH_STATE_TTL: Duration = Duration::from_secs(600);

#[derive(Deserialize)]
pub struct MagicLinkRequest {
    pub email: String,
}

#[derive(Serialize)]
pub struct MagicLinkResponse {
    pub status: &'static str,
    pub message: &'static str,
}

/// Always answers with a generic success so the endpoint cannot be used
/// to probe which addresses hold accounts. Creates the account if absent.
pub async fn magic_link(
    State(state): State<AppState>,
    Json(req): Json<MagicLinkRequest>,
) -> Result<Json<MagicLinkResponse>, ApiError> {
    let email = req.email.trim().to_lowercase();
    if !email.contains('@') || email.len() > 254 {
        return Err(ApiError::Validation("invalid email address".into()));
    }

    let account = auth::get_or_create_by_email(&state.db, &email)
        .await
        .map_err(|e| ApiError::Internal(format!("account resolution: {e}")))?;
    let token = auth::set_magic_link(&state.db, account.id)
        .await
        .map_err(|e| ApiError::Internal(format!("magic link: {e}")))?;

    let link = format!("{}/auth/verify?token={token}", state.settings.frontend_url);
    if !state.mailer.send_magic_link(&email, &link).await {
        tracing::warn!("magic link delivery failed");
    }

    Ok(Json(MagicLinkResponse {
        status: "success",
        message: "If the email is registered, a magic link has been sent.",
    }))
}

#[derive(Deserialize)]
pub struct VerifyRequest {
    pub token: String,
}

pub async fn verify(
    State(state): State<AppState>,
    Json(req): Json<VerifyRequest>,
) -> Result<Json<TokenPair>, ApiError> {
    let account = auth::verify_magic_link(&state.db, &req.token)
        .await
        .map_err(|e| ApiError::Internal(format!("magic link verify: {e}")))?
        .ok_or_else(|| ApiError::Validation("invalid or expired magic link".into()))?;

    issue_pair(&state, &account).await
}

pub async fn telegram(
    State(state): State<AppState>,
    Json(login): Json<TelegramLogin>,
) -> Result<Json<TokenPair>, ApiError> {
    let bot_token = state
        .settings
        .telegram_bot_token
        .as_deref()
        .ok_or_else(|| ApiError::Internal("Telegram login not configured".into()))?;

    if !crate::auth::telegram::verify_login(bot_token, &login) {
        return Err(ApiError::Unauthorized("invalid Telegram authentication".into()));
    }

    let account = auth::get_or_create_by_telegram(&state.db, login.id)
        .await
        .map_err(|e| ApiError::Internal(format!("account resolution: {e}")))?;
    issue_pair(&state, &account).await
}

#[derive(Deserialize)]
pub struct GoogleAuthRequest {
    /// ID token from Google Sign-In on the frontend.
    pub credential: String,
}

pub async fn google(
    State(state): State<AppState>,
    Json(req): Json<GoogleAuthRequest>,
) -> Result<Json<TokenPair>, ApiError> {
    let verifier = state
        .google
        .as_ref()
        .ok_or_else(|| ApiError::Internal("Google OAuth not configured".into()))?;

    let identity = verifier
        .verify_credential(&req.credential)
        .await
        .map_err(|e| {
            tracing::warn!(error = %e, "google token verification failed");
            ApiError::Unauthorized("invalid Google token".into())
        })?;

    let account = auth::get_or_create_by_oauth(&state.db, &identity.sub, &identity.email)
        .await
        .map_err(|e| ApiError::Internal(format!("account resolution: {e}")))?;
    issue_pair(&state, &account).await
}

fn oauth_state_key(token: &str) -> String {
    format!("oauth_state:{token}")
}

fn google_redirect_uri(state: &AppState) -> String {
    format!("{}/api/v1/auth/google/callback", state.settings.public_url)
}

pub async fn google_init(State(state): State<AppState>) -> Result<Redirect, ApiError> {
    let verifier = state
        .google
        .as_ref()
        .ok_or_else(|| ApiError::Internal("Google OAuth not configured".into()))?;

    let csrf = tokens::new_url_safe_token();
    state
        .kv
        .set_ex(&oauth_state_key(&csrf), "1", OAUTH_STATE_TTL)
        .await
        .map_err(|e| ApiError::Internal(format!("oauth state store: {e}")))?;

    Ok(Redirect::temporary(
        &verifier.authorize_url(&google_redirect_uri(&state), &csrf),
    ))
}

#[derive(Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// Completes the redirect flow. All failures land back on the frontend
/// with an `error` query parameter; tokens travel in the URL fragment.
pub async fn google_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Redirect {
    let frontend = &state.settings.frontend_url;
    let fail = |reason: &str| Redirect::temporary(&format!("{frontend}/auth/callback?error={reason}"));

    if query.error.is_some() {
        return fail("provider_denied");
    }
    let (Some(code), Some(csrf)) = (query.code, query.state) else {
        return fail("missing_parameters");
    };

    match state.kv.get_del(&oauth_state_key(&csrf)).await {
        Ok(Some(_)) => {}
        Ok(None) => return fail("invalid_state"),
        Err(err) => {
            tracing::error!(error = %err, "oauth state lookup failed");
            return fail("state_unavailable");
        }
    }

    let Some(verifier) = state.google.as_ref() else {
        return fail("not_configured");
    };
    let identity = match verifier.exchange_code(&code, &google_redirect_uri(&state)).await {
        Ok(identity) => identity,
        Err(err) => {
            tracing::warn!(error = %err, "oauth code exchange failed");
            return fail("exchange_failed");
        }
    };

    let account =
        match auth::get_or_create_by_oauth(&state.db, &identity.sub, &identity.email).await {
            Ok(account) => account,
            Err(err) => {
                tracing::error!(error = %err, "oauth account resolution failed");
                return fail("account_failed");
            }
        };
    let pair = match tokens::issue_pair(
        state.kv.as_ref(),
        &state.settings.server_secret,
        &account,
    )
    .await
    {
        Ok(pair) => pair,
        Err(err) => {
            tracing::error!(error = %err, "token issuance failed");
            return fail("token_failed");
        }
    };

    Redirect::temporary(&format!(
        "{frontend}/auth/callback#access_token={}&refresh_token={}",
        pair.access_token, pair.refresh_token
    ))
}

#[derive(Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

pub async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<TokenPair>, ApiError> {
    let account_id = tokens::consume_refresh(state.kv.as_ref(), &req.refresh_token)
        .await
        .map_err(|e| ApiError::Internal(format!("refresh lookup: {e}")))?
        .ok_or_else(|| ApiError::Unauthorized("invalid or expired refresh token".into()))?;

    let account = auth::account_by_id(&state.db, account_id)
        .await
        .map_err(|e| ApiError::Internal(format!("account lookup: {e}")))?
        .ok_or_else(|| ApiError::Unauthorized("account not found".into()))?;

    issue_pair(&state, &account).await
}

#[derive(Serialize)]
pub struct LogoutResponse {
    pub status: &'static str,
}

pub async fn logout(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<LogoutResponse>, ApiError> {
    tokens::revoke_refresh(state.kv.as_ref(), &req.refresh_token)
        .await
        .map_err(|e| ApiError::Internal(format!("refresh revoke: {e}")))?;
    Ok(Json(LogoutResponse { status: "success" }))
}

#[derive(Serialize)]
pub struct MeResponse {
    pub id: Uuid,
    pub email: Option<String>,
    pub telegram_id: Option<i64>,
    pub balance_usd: String,
    pub created_at: DateTime<Utc>,
}

pub async fn me(AuthAccount(account): AuthAccount) -> Json<MeResponse> {
    Json(MeResponse {
        id: account.id,
        email: account.email,
        telegram_id: account.telegram_id,
        balance_usd: account.balance_usd.to_string(),
        created_at: account.created_at,
    })
}

async fn issue_pair(state: &AppState, account: &crate::models::Account) -> Result<Json<TokenPair>, ApiError> {
    tokens::issue_pair(state.kv.as_ref(), &state.settings.server_secret, account)
        .await
        .map(Json)
        .map_err(|e| ApiError::Internal(format!("token issuance: {e}")))
}
