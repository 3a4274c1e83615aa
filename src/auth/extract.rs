//! Request extractors for the three caller shapes: access-token sessions,
//! API-key callers, and the metered-endpoint caller that may be anonymous.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use super::{api_keys, tokens};
use crate::error::ApiError;
use crate::models::{Account, ApiKey};
use crate::quota::QuotaSubject;
use crate::state::AppState;
use crate::trace;

fn note_debug_opt_in(account: &Account) {
    if account.opt_in_debug {
        trace::mark_debug(account.id);
    }
}

/// Dashboard-session caller: `Authorization: Bearer <access token>`.
pub struct AuthAccount(pub Account);

impl FromRequestParts<AppState> for AuthAccount {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let account = account_from_bearer(parts, state)
            .await?
            .ok_or_else(|| ApiError::Unauthorized("missing authorization header".into()))?;
        Ok(AuthAccount(account))
    }
}

/// Programmatic caller: `X-API-Key` required.
pub struct KeyAccount {
    pub account: Account,
    pub key: ApiKey,
}

impl KeyAccount {
    pub fn require_scope(&self, scope: &str) -> Result<(), ApiError> {
        if self.key.allows(scope) {
            Ok(())
        } else {
            Err(ApiError::Forbidden(format!("API key lacks scope {scope}")))
        }
    }
}

impl FromRequestParts<AppState> for KeyAccount {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let presented = parts
            .headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("missing API key".into()))?;

        let (account, key) =
            api_keys::verify(&state.db, &state.settings.server_secret, presented)
                .await
                .map_err(|e| ApiError::Internal(format!("key verification: {e}")))?
                .ok_or_else(|| ApiError::Unauthorized("invalid API key".into()))?;

        note_debug_opt_in(&account);
        Ok(KeyAccount { account, key })
    }
}

/// Metered-endpoint caller. An invalid presented key never silently
/// downgrades: the attempt is logged, and the request continues as
/// anonymous only because these endpoints permit anonymous traffic.
pub enum Caller {
    Account(Account),
    Anonymous { ip: String },
}

impl Caller {
    pub fn quota_subject(&self) -> QuotaSubject {
        match self {
            Caller::Account(account) => QuotaSubject::account(account.id, account.created_at),
            Caller::Anonymous { ip } => QuotaSubject::ip(ip),
        }
    }
}

impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if let Some(presented) = parts.headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
            match api_keys::verify(&state.db, &state.settings.server_secret, presented)
                .await
                .map_err(|e| ApiError::Internal(format!("key verification: {e}")))?
            {
                Some((account, _key)) => {
                    note_debug_opt_in(&account);
                    return Ok(Caller::Account(account));
                }
                None => {
                    metrics::counter!("api_key_invalid_total").increment(1);
                    tracing::warn!(
                        prefix = presented.split('_').next().unwrap_or(""),
                        "invalid API key presented, continuing as anonymous"
                    );
                }
            }
        }

        let ip = trace::client_ip()
            .or_else(|| trace::client_ip_from_headers(&parts.headers))
            .unwrap_or_else(|| "unknown".to_string());
        Ok(Caller::Anonymous { ip })
    }
}

/// Account surfaces accept either a session token or an API key.
pub struct TokenOrKey(pub Account);

impl FromRequestParts<AppState> for TokenOrKey {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if let Some(account) = account_from_bearer(parts, state).await? {
            return Ok(TokenOrKey(account));
        }
        if parts.headers.contains_key("x-api-key") {
            let KeyAccount { account, .. } = KeyAccount::from_request_parts(parts, state).await?;
            return Ok(TokenOrKey(account));
        }
        Err(ApiError::Unauthorized("missing credentials".into()))
    }
}

/// Resolve a Bearer access token to its account, or `None` when the header
/// is absent. Invalid tokens are an error, not an absence.
async fn account_from_bearer(
    parts: &Parts,
    state: &AppState,
) -> Result<Option<Account>, ApiError> {
    let Some(header) = parts.headers.get("authorization").and_then(|v| v.to_str().ok()) else {
        return Ok(None);
    };
    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::Unauthorized("invalid authorization format".into()))?;

    let identity = tokens::verify_access_token(&state.settings.server_secret, token)
        .ok_or_else(|| ApiError::Unauthorized("invalid or expired token".into()))?;

    let account = super::account_by_id(&state.db, identity.account_id)
        .await
        .map_err(|e| ApiError::Internal(format!("account lookup: {e}")))?
        .ok_or_else(|| ApiError::Unauthorized("account not found".into()))?;

    note_debug_opt_in(&account);
    Ok(Some(account))
}
