//! Payment providers.
//!
//! Provider-agnostic capability set plus concrete adapters: card-payment
//! processors reached over HTTP (Paddle, Lemon Squeezy) and the Telegram
//! Stars invoice flow that never calls out. Providers parse money events;
//! only the engine touches the ledger.

pub mod engine;
mod http;
pub mod lemonsqueezy;
pub mod paddle;
pub mod stars;

pub use engine::{PaymentEngine, WebhookOutcome};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;

use crate::models::TransactionKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Refunded,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub account_id: Uuid,
    pub amount_usd: Decimal,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Default)]
pub struct CheckoutUrls {
    pub success: Option<String>,
    pub cancel: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentResult {
    pub payment_id: String,
    pub status: PaymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout_url: Option<String>,
    /// Data the bot process needs to raise a star-currency invoice.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_payload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// A webhook delivery: parsed envelope plus the exact bytes that were
/// signed.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub event_type: String,
    pub event_id: String,
    pub data: Value,
    pub raw_body: Vec<u8>,
    pub signature: String,
}

/// A money movement a provider extracted from a webhook. Amounts are
/// positive; the engine signs refunds.
#[derive(Debug, Clone)]
pub struct Charge {
    pub account_id: Uuid,
    pub amount_usd: Decimal,
    pub kind: TransactionKind,
    pub external_id: String,
    pub description: String,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider not configured: {0}")]
    Config(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("provider API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("unprocessable webhook: {0}")]
    Parse(String),
    #[error("operation not supported")]
    Unsupported,
}

impl ProviderError {
    /// Transient failures surface as 5xx so the provider redelivers;
    /// permanent ones are acknowledged to stop retry storms.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Http(_) => true,
            ProviderError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Providers that redeliver invalid signatures forever are answered
    /// 200 with an error body instead of 403.
    fn retry_hostile(&self) -> bool {
        false
    }

    async fn create_checkout(
        &self,
        request: &PaymentRequest,
        urls: &CheckoutUrls,
    ) -> Result<PaymentResult, ProviderError>;

    fn verify_webhook(&self, event: &WebhookEvent) -> bool;

    /// Extract the money movement from a verified event; `None` for event
    /// types that carry no charge.
    async fn process_webhook(&self, event: &WebhookEvent)
    -> Result<Option<Charge>, ProviderError>;

    async fn payment_status(&self, payment_id: &str) -> Result<PaymentStatus, ProviderError>;

    async fn refund(
        &self,
        _payment_id: &str,
        _amount: Option<Decimal>,
    ) -> Result<bool, ProviderError> {
        Err(ProviderError::Unsupported)
    }
}

// ── Shared signature helpers ───────────────────────────

pub(crate) fn hmac_hex(secret: &str, payload: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time comparison against a provided hex signature, tolerating
/// an optional `sha256=` prefix.
pub(crate) fn signatures_match(expected_hex: &str, provided: &str) -> bool {
    let provided = provided.strip_prefix("sha256=").unwrap_or(provided);
    expected_hex.len() == provided.len()
        && bool::from(expected_hex.as_bytes().ct_eq(provided.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_signature_scheme() {
        let expected = hmac_hex("secret", b"payload");
        assert!(signatures_match(&expected, &expected));
        assert!(signatures_match(&expected, &format!("sha256={expected}")));
        assert!(!signatures_match(&expected, &hmac_hex("secret", b"tampered")));
        assert!(!signatures_match(&expected, ""));
    }

    #[test]
    fn transient_classification() {
        assert!(ProviderError::Api { status: 503, body: String::new() }.is_transient());
        assert!(ProviderError::Api { status: 429, body: String::new() }.is_transient());
        assert!(!ProviderError::Api { status: 400, body: String::new() }.is_transient());
        assert!(!ProviderError::Parse("bad".into()).is_transient());
    }
}
