//! Telegram Login Widget verification.
//!
//! The widget payload is authenticated by recomputing
//! `HMAC-SHA256(sha256(bot_token), data_check_string)` where the data
//! check string is the alphabetically sorted `k=v` payload (minus `hash`
//! and absent fields) joined with newlines.

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Widget payloads older than a day are rejected.
const MAX_AGE_SECS: i64 = 86_400;

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramLogin {
    pub id: i64,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub photo_url: Option<String>,
    pub auth_date: i64,
    pub hash: String,
}

pub fn verify_login(bot_token: &str, login: &TelegramLogin) -> bool {
    verify_login_at(bot_token, login, Utc::now().timestamp())
}

fn verify_login_at(bot_token: &str, login: &TelegramLogin, now: i64) -> bool {
    if now - login.auth_date > MAX_AGE_SECS {
        return false;
    }

    let expected = expected_hash(bot_token, login);
    expected.len() == login.hash.len()
        && bool::from(expected.as_bytes().ct_eq(login.hash.as_bytes()))
}

fn expected_hash(bot_token: &str, login: &TelegramLogin) -> String {
    let secret_key = Sha256::digest(bot_token.as_bytes());
    let mut mac =
        HmacSha256::new_from_slice(&secret_key).expect("hmac accepts any key length");
    mac.update(data_check_string(login).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn data_check_string(login: &TelegramLogin) -> String {
    let mut pairs = vec![
        ("auth_date", login.auth_date.to_string()),
        ("id", login.id.to_string()),
    ];
    let optional = [
        ("first_name", &login.first_name),
        ("last_name", &login.last_name),
        ("photo_url", &login.photo_url),
        ("username", &login.username),
    ];
    for (key, value) in optional {
        if let Some(value) = value {
            pairs.push((key, value.clone()));
        }
    }
    pairs.sort_by(|a, b| a.0.cmp(b.0));

    pairs
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOT_TOKEN: &str = "123456:test-bot-token";

    fn login(auth_date: i64) -> TelegramLogin {
        let mut login = TelegramLogin {
            id: 99,
            first_name: Some("Ann".into()),
            last_name: None,
            username: Some("ann".into()),
            photo_url: None,
            auth_date,
            hash: String::new(),
        };
        login.hash = expected_hash(BOT_TOKEN, &login);
        login
    }

    #[test]
    fn absent_fields_are_excluded_and_keys_sorted() {
        let login = login(1_700_000_000);
        assert_eq!(
            data_check_string(&login),
            "auth_date=1700000000\nfirst_name=Ann\nid=99\nusername=ann"
        );
    }

    #[test]
    fn valid_payload_accepted() {
        let auth_date = Utc::now().timestamp() - 60;
        let login = login(auth_date);
        assert!(verify_login(BOT_TOKEN, &login));
    }

    #[test]
    fn tampered_payload_rejected() {
        let auth_date = Utc::now().timestamp() - 60;
        let mut login = login(auth_date);
        login.id = 100;
        assert!(!verify_login(BOT_TOKEN, &login));
    }

    #[test]
    fn wrong_bot_token_rejected() {
        let login = login(Utc::now().timestamp());
        assert!(!verify_login("other-token", &login));
    }

    #[test]
    fn stale_auth_date_rejected() {
        let auth_date = Utc::now().timestamp() - MAX_AGE_SECS - 10;
        let login = login(auth_date);
        assert!(!verify_login(BOT_TOKEN, &login));
    }
}
