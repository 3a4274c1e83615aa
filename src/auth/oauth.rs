//! Google OAuth: ID-token verification against Google's JWKs plus the
//! server-side redirect flow (CSRF state lives in the key/value store).

use std::time::{Duration, Instant};

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use tokio::sync::RwLock;

use super::AuthError;

const CERTS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";

const JWKS_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug)]
pub struct GoogleIdentity {
    pub sub: String,
    pub email: String,
}

#[derive(Debug, Deserialize)]
struct IdClaims {
    sub: String,
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    id_token: String,
}

struct CachedJwks {
    set: JwkSet,
    fetched_at: Instant,
}

pub struct GoogleVerifier {
    client_id: String,
    client_secret: Option<String>,
    http: reqwest::Client,
    jwks: RwLock<Option<CachedJwks>>,
}

impl GoogleVerifier {
    pub fn new(client_id: String, client_secret: Option<String>, http: reqwest::Client) -> Self {
        Self {
            client_id,
            client_secret,
            http,
            jwks: RwLock::new(None),
        }
    }

    /// Verify a frontend-posted ID token: RS256 signature against Google's
    /// published keys, audience = our client id.
    pub async fn verify_credential(&self, credential: &str) -> Result<GoogleIdentity, AuthError> {
        let header = decode_header(credential)?;
        let kid = header
            .kid
            .ok_or_else(|| AuthError::OAuth("id token missing kid".into()))?;

        let jwks = self.jwks().await?;
        let jwk = jwks
            .find(&kid)
            .ok_or_else(|| AuthError::OAuth(format!("no JWK for kid {kid}")))?;
        let key = DecodingKey::from_jwk(jwk)
            .map_err(|e| AuthError::OAuth(format!("bad JWK: {e}")))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[&self.client_id]);
        validation.set_issuer(&["https://accounts.google.com", "accounts.google.com"]);

        let data = decode::<IdClaims>(credential, &key, &validation)?;
        let email = data
            .claims
            .email
            .ok_or_else(|| AuthError::OAuth("email not provided".into()))?;
        Ok(GoogleIdentity {
            sub: data.claims.sub,
            email,
        })
    }

    /// Provider authorization URL for the redirect flow.
    pub fn authorize_url(&self, redirect_uri: &str, state: &str) -> String {
        reqwest::Url::parse_with_params(
            AUTH_URL,
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("response_type", "code"),
                ("scope", "openid email"),
                ("state", state),
            ],
        )
        .expect("static auth url parses")
        .to_string()
    }

    /// Exchange an authorization code for a verified identity.
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<GoogleIdentity, AuthError> {
        let client_secret = self
            .client_secret
            .as_deref()
            .ok_or_else(|| AuthError::OAuth("client secret not configured".into()))?;

        let response = self
            .http
            .post(TOKEN_URL)
            .form(&[
                ("code", code),
                ("client_id", self.client_id.as_str()),
                ("client_secret", client_secret),
                ("redirect_uri", redirect_uri),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(AuthError::OAuth(format!("token exchange failed: {status}")));
        }

        let token: TokenResponse = response.json().await?;
        self.verify_credential(&token.id_token).await
    }

    async fn jwks(&self) -> Result<JwkSet, AuthError> {
        {
            let cached = self.jwks.read().await;
            if let Some(cached) = cached.as_ref()
                && cached.fetched_at.elapsed() < JWKS_TTL
            {
                return Ok(cached.set.clone());
            }
        }

        let set: JwkSet = self.http.get(CERTS_URL).send().await?.json().await?;
        let mut cached = self.jwks.write().await;
        *cached = Some(CachedJwks {
            set: set.clone(),
            fetched_at: Instant::now(),
        });
        Ok(set)
    }
}
