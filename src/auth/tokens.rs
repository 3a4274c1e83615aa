//! Session tokens: short-lived signed access tokens plus opaque rotating
//! refresh tokens held only in the key/value store.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::AuthError;
use crate::models::Account;
use crate::store::KvStore;

const ACCESS_EXPIRY_SECS: i64 = 15 * 60;
const REFRESH_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tid: Option<i64>,
    #[serde(rename = "type")]
    kind: String,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub token_type: &'static str,
}

#[derive(Debug)]
pub struct AccessIdentity {
    pub account_id: Uuid,
    pub telegram_id: Option<i64>,
}

/// 256-bit URL-safe random token (refresh tokens, magic links, OAuth state).
pub fn new_url_safe_token() -> String {
    use rand::Rng;
    let bytes: [u8; 32] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

pub fn create_access_token(
    secret: &str,
    account_id: Uuid,
    telegram_id: Option<i64>,
) -> Result<String, AuthError> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: account_id.to_string(),
        tid: telegram_id,
        kind: "access".to_string(),
        iat: now,
        exp: now + ACCESS_EXPIRY_SECS,
    };
    Ok(encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?)
}

pub fn verify_access_token(secret: &str, token: &str) -> Option<AccessIdentity> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .ok()?;

    if data.claims.kind != "access" {
        return None;
    }
    Some(AccessIdentity {
        account_id: data.claims.sub.parse().ok()?,
        telegram_id: data.claims.tid,
    })
}

fn refresh_key(token: &str) -> String {
    format!("refresh_token:{}", sha256_hex(token))
}

/// Mint an access + refresh pair, storing the refresh hash with a 7-day TTL.
pub async fn issue_pair(
    kv: &dyn KvStore,
    secret: &str,
    account: &Account,
) -> Result<TokenPair, AuthError> {
    let access_token = create_access_token(secret, account.id, account.telegram_id)?;
    let refresh_token = new_url_safe_token();

    kv.set_ex(
        &refresh_key(&refresh_token),
        &json!({ "account_id": account.id }).to_string(),
        REFRESH_TTL,
    )
    .await?;

    Ok(TokenPair {
        access_token,
        refresh_token,
        expires_in: ACCESS_EXPIRY_SECS,
        token_type: "Bearer",
    })
}

/// Single-use redemption: the stored hash is deleted as it is read, so a
/// replayed refresh token fails.
pub async fn consume_refresh(kv: &dyn KvStore, token: &str) -> Result<Option<Uuid>, AuthError> {
    let Some(raw) = kv.get_del(&refresh_key(token)).await? else {
        return Ok(None);
    };
    let parsed: serde_json::Value = serde_json::from_str(&raw).map_err(|_| AuthError::Invalid)?;
    Ok(parsed
        .get("account_id")
        .and_then(|v| v.as_str())
        .and_then(|v| v.parse().ok()))
}

pub async fn revoke_refresh(kv: &dyn KvStore, token: &str) -> Result<(), AuthError> {
    Ok(kv.del(&refresh_key(token)).await?)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn account() -> Account {
        Account {
            id: Uuid::new_v4(),
            telegram_id: Some(42),
            email: None,
            oauth_sub: None,
            balance_usd: rust_decimal::Decimal::ZERO,
            auto_recharge_threshold: None,
            auto_recharge_amount: None,
            opt_in_debug: false,
            email_auth_token: None,
            email_auth_expires: None,
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            last_active_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn access_token_round_trip() {
        let account = account();
        let token = create_access_token("secret", account.id, account.telegram_id).unwrap();

        let identity = verify_access_token("secret", &token).unwrap();
        assert_eq!(identity.account_id, account.id);
        assert_eq!(identity.telegram_id, Some(42));

        assert!(verify_access_token("other-secret", &token).is_none());
    }

    #[tokio::test]
    async fn refresh_tokens_are_single_use() {
        let kv = crate::store::mem::MemoryKv::new();
        let account = account();

        let pair = issue_pair(&kv, "secret", &account).await.unwrap();
        assert_eq!(
            consume_refresh(&kv, &pair.refresh_token).await.unwrap(),
            Some(account.id)
        );
        // Rotated away: the same token no longer resolves.
        assert_eq!(consume_refresh(&kv, &pair.refresh_token).await.unwrap(), None);
    }

    #[tokio::test]
    async fn logout_revokes_refresh() {
        let kv = crate::store::mem::MemoryKv::new();
        let account = account();

        let pair = issue_pair(&kv, "secret", &account).await.unwrap();
        revoke_refresh(&kv, &pair.refresh_token).await.unwrap();
        assert_eq!(consume_refresh(&kv, &pair.refresh_token).await.unwrap(), None);
    }

    #[test]
    fn url_safe_tokens_have_enough_entropy() {
        let token = new_url_safe_token();
        // 32 bytes base64url without padding.
        assert_eq!(token.len(), 43);
        assert_ne!(token, new_url_safe_token());
    }
}
