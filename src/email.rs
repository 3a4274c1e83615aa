//! Magic-link email delivery seam. Transport and content are external
//! concerns; the gateway only needs "send this link to this address".

use async_trait::async_trait;
use serde_json::json;

const SEND_URL: &str = "https://api.brevo.com/v3/smtp/email";
const FROM_EMAIL: &str = "noreply@metergate.dev";
const FROM_NAME: &str = "Metergate";

#[async_trait]
pub trait Mailer: Send + Sync {
    /// Returns whether delivery was accepted. Callers never surface the
    /// outcome to the requester (account enumeration).
    async fn send_magic_link(&self, to_email: &str, link: &str) -> bool;
}

/// Transactional-email HTTP API client.
pub struct HttpMailer {
    api_key: String,
    http: reqwest::Client,
}

impl HttpMailer {
    pub fn new(api_key: String, http: reqwest::Client) -> Self {
        Self { api_key, http }
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send_magic_link(&self, to_email: &str, link: &str) -> bool {
        let body = json!({
            "sender": { "name": FROM_NAME, "email": FROM_EMAIL },
            "to": [{ "email": to_email }],
            "subject": "Your login link",
            "textContent": format!(
                "Click to sign in:\n{link}\n\nThis link can be used once and expires in 15 minutes."
            ),
        });

        let result = self
            .http
            .post(SEND_URL)
            .header("api-key", &self.api_key)
            .json(&body)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                tracing::info!(to_email, "magic link email sent");
                true
            }
            Ok(response) => {
                tracing::error!(to_email, status = %response.status(), "email API rejected send");
                false
            }
            Err(err) => {
                tracing::error!(to_email, error = %err, "email send failed");
                false
            }
        }
    }
}

/// Used when no email API key is configured; the link is only logged.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_magic_link(&self, to_email: &str, link: &str) -> bool {
        tracing::warn!(to_email, link, "email disabled, magic link not delivered");
        false
    }
}
