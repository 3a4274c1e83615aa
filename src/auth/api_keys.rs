//! API keys: `<prefix>_<secret>` where only a keyed hash of the secret is
//! stored. Verification is prefix-scoped lookup plus a constant-time MAC
//! compare.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use super::{ACCOUNT_COLUMNS, AuthError};
use crate::models::{Account, ApiKey};

type HmacSha256 = Hmac<Sha256>;

/// A freshly minted key. The full secret exists only here; callers must
/// show it to the owner once and store only `prefix` + `hash`.
#[derive(Debug)]
pub struct GeneratedKey {
    pub prefix: String,
    pub full_key: String,
    pub hash: String,
}

pub fn generate(server_secret: &str) -> GeneratedKey {
    use rand::Rng;
    let suffix: String = rand::rng()
        .sample_iter(rand::distr::Alphanumeric)
        .take(6)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect();
    let prefix = format!("mg{suffix}");
    let secret = super::tokens::new_url_safe_token();
    let hash = mac_hex(server_secret, &secret);
    GeneratedKey {
        full_key: format!("{prefix}_{secret}"),
        prefix,
        hash,
    }
}

pub fn mac_hex(server_secret: &str, secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(server_secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(secret.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn macs_match(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// Verify a presented key. Returns the owning account and the key row, or
/// `None` for malformed, unknown, or revoked keys. Bumps `last_used_at`
/// off the request path.
pub async fn verify(
    pool: &PgPool,
    server_secret: &str,
    presented: &str,
) -> Result<Option<(Account, ApiKey)>, AuthError> {
    let Some((prefix, secret)) = presented.split_once('_') else {
        return Ok(None);
    };
    let expected = mac_hex(server_secret, secret);

    let candidates: Vec<ApiKey> = sqlx::query_as(
        "SELECT id, account_id, key_prefix, key_hash, label, scopes, is_active,
                created_at, last_used_at
         FROM api_keys
         WHERE key_prefix = $1 AND is_active",
    )
    .bind(prefix)
    .fetch_all(pool)
    .await?;

    for key in candidates {
        if !macs_match(&key.key_hash, &expected) {
            continue;
        }
        let account: Account =
            sqlx::query_as(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"))
                .bind(key.account_id)
                .fetch_one(pool)
                .await?;
        touch_last_used(pool.clone(), key.id);
        return Ok(Some((account, key)));
    }
    Ok(None)
}

fn touch_last_used(pool: PgPool, key_id: Uuid) {
    tokio::spawn(async move {
        let result = sqlx::query("UPDATE api_keys SET last_used_at = now() WHERE id = $1")
            .bind(key_id)
            .execute(&pool)
            .await;
        if let Err(err) = result {
            tracing::debug!(%key_id, error = %err, "failed to update last_used_at");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_have_prefix_and_secret() {
        let key = generate("server-secret");
        let (prefix, secret) = key.full_key.split_once('_').unwrap();
        assert_eq!(prefix, key.prefix);
        assert!(prefix.starts_with("mg"));
        assert_eq!(prefix.len(), 8);
        assert_eq!(key.hash, mac_hex("server-secret", secret));
    }

    #[test]
    fn mac_depends_on_server_secret() {
        assert_ne!(mac_hex("a", "secret"), mac_hex("b", "secret"));
        assert_eq!(mac_hex("a", "secret"), mac_hex("a", "secret"));
    }

    #[test]
    fn compare_rejects_mismatch() {
        let good = mac_hex("server", "secret");
        assert!(macs_match(&good, &good));
        assert!(!macs_match(&good, &mac_hex("server", "other")));
        assert!(!macs_match(&good, "short"));
    }
}
