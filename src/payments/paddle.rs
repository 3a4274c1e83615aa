//! Paddle adapter.
//!
//! Webhooks carry a timestamped signature (`Paddle-Signature:
//! ts=…;h1=…`) over `<ts>:<raw_body>`, rejected outside a ±300 s window.
//! Paddle redelivers invalid signatures indefinitely, so verification
//! failures are acknowledged with 200 + an error body.

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::{Value, json};

use super::{
    Charge, CheckoutUrls, PaymentProvider, PaymentRequest, PaymentResult, PaymentStatus,
    ProviderError, WebhookEvent, hmac_hex, http, signatures_match,
};
use crate::credits;
use crate::models::TransactionKind;

const SIGNATURE_WINDOW_SECS: i64 = 300;

pub struct PaddleProvider {
    api_key: String,
    webhook_secret: String,
    base_url: &'static str,
    http: reqwest::Client,
}

impl PaddleProvider {
    pub fn new(api_key: String, webhook_secret: String, sandbox: bool) -> Self {
        Self {
            api_key,
            webhook_secret,
            base_url: if sandbox {
                "https://sandbox-api.paddle.com"
            } else {
                "https://api.paddle.com"
            },
            http: http::client(),
        }
    }

    fn verify_at(&self, event: &WebhookEvent, now: i64) -> bool {
        let Some((ts, h1)) = parse_signature(&event.signature) else {
            return false;
        };
        if (now - ts).abs() > SIGNATURE_WINDOW_SECS {
            return false;
        }
        let mut signed = ts.to_string().into_bytes();
        signed.push(b':');
        signed.extend_from_slice(&event.raw_body);
        signatures_match(&hmac_hex(&self.webhook_secret, &signed), h1)
    }
}

/// `ts=1700000000;h1=abcdef…`
fn parse_signature(header: &str) -> Option<(i64, &str)> {
    let mut ts = None;
    let mut h1 = None;
    for part in header.split(';') {
        match part.trim().split_once('=') {
            Some(("ts", v)) => ts = v.parse().ok(),
            Some(("h1", v)) => h1 = Some(v),
            _ => {}
        }
    }
    Some((ts?, h1?))
}

fn cents_to_usd(value: &Value) -> Option<Decimal> {
    let cents: Decimal = match value {
        Value::String(s) => s.parse().ok()?,
        Value::Number(n) => Decimal::try_from(n.as_f64()?).ok()?,
        _ => return None,
    };
    Some(cents / Decimal::from(100))
}

#[async_trait::async_trait]
impl PaymentProvider for PaddleProvider {
    fn name(&self) -> &'static str {
        "paddle"
    }

    fn retry_hostile(&self) -> bool {
        true
    }

    async fn create_checkout(
        &self,
        request: &PaymentRequest,
        urls: &CheckoutUrls,
    ) -> Result<PaymentResult, ProviderError> {
        let cents = (request.amount_usd * Decimal::from(100)).trunc();
        let mut body = json!({
            "items": [{
                "quantity": 1,
                "price": {
                    "name": "Credits top-up",
                    "description": credits::format_credits(request.amount_usd)
                        .unwrap_or_else(|_| "Credits top-up".into()),
                    "unit_price": { "amount": cents.to_string(), "currency_code": "USD" },
                },
            }],
            "custom_data": {
                "account_id": request.account_id,
                "idempotency_key": request.idempotency_key,
            },
        });
        if let Some(success) = &urls.success {
            body["checkout"] = json!({ "success_url": success });
        }

        let response = http::send_with_retry("paddle", "transactions", || {
            self.http
                .post(format!("{}/transactions", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&body)
        })
        .await?;

        let parsed: Value = response.json().await?;
        let data = &parsed["data"];
        let payment_id = data["id"]
            .as_str()
            .ok_or_else(|| ProviderError::Parse("transaction id missing".into()))?
            .to_string();

        Ok(PaymentResult {
            payment_id,
            status: PaymentStatus::Pending,
            checkout_url: data["checkout"]["url"].as_str().map(str::to_string),
            invoice_payload: None,
            expires_at: None,
        })
    }

    fn verify_webhook(&self, event: &WebhookEvent) -> bool {
        self.verify_at(event, Utc::now().timestamp())
    }

    async fn process_webhook(
        &self,
        event: &WebhookEvent,
    ) -> Result<Option<Charge>, ProviderError> {
        let data = &event.data["data"];
        let kind = match event.event_type.as_str() {
            "transaction.completed" => TransactionKind::Topup,
            "adjustment.updated" if data["action"] == "refund" => TransactionKind::Refund,
            _ => return Ok(None),
        };

        let account_id = data["custom_data"]["account_id"]
            .as_str()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| ProviderError::Parse("custom_data.account_id missing".into()))?;

        let totals = &data["details"]["totals"];
        let amount_usd = cents_to_usd(&totals["grand_total"])
            .or_else(|| cents_to_usd(&totals["total"]))
            .ok_or_else(|| ProviderError::Parse("totals missing".into()))?;

        let external_id = data["id"].as_str().unwrap_or(&event.event_id).to_string();
        let description = match kind {
            TransactionKind::Refund => format!("Paddle refund {external_id}"),
            _ => format!("Paddle top-up {external_id}"),
        };

        Ok(Some(Charge {
            account_id,
            amount_usd,
            kind,
            external_id,
            description,
        }))
    }

    async fn payment_status(&self, payment_id: &str) -> Result<PaymentStatus, ProviderError> {
        let response = http::send_with_retry("paddle", "get_transaction", || {
            self.http
                .get(format!("{}/transactions/{payment_id}", self.base_url))
                .bearer_auth(&self.api_key)
        })
        .await?;

        let parsed: Value = response.json().await?;
        Ok(match parsed["data"]["status"].as_str() {
            Some("completed") => PaymentStatus::Completed,
            Some("billed") | Some("paid") => PaymentStatus::Processing,
            Some("canceled") => PaymentStatus::Cancelled,
            _ => PaymentStatus::Pending,
        })
    }

    async fn refund(
        &self,
        payment_id: &str,
        amount: Option<Decimal>,
    ) -> Result<bool, ProviderError> {
        let mut body = json!({
            "action": "refund",
            "transaction_id": payment_id,
            "reason": "requested_by_customer",
        });
        if let Some(amount) = amount {
            body["amount"] = json!((amount * Decimal::from(100)).trunc().to_string());
        }

        let response = http::send_with_retry("paddle", "adjustments", || {
            self.http
                .post(format!("{}/adjustments", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&body)
        })
        .await;

        match response {
            Ok(_) => Ok(true),
            Err(err) if err.is_transient() => Err(err),
            Err(err) => {
                tracing::error!(payment_id, error = %err, "paddle refund rejected");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn provider() -> PaddleProvider {
        PaddleProvider::new("key".into(), "whsec".into(), true)
    }

    fn signed_event(provider: &PaddleProvider, body: &str, ts: i64) -> WebhookEvent {
        let mut signed = ts.to_string().into_bytes();
        signed.push(b':');
        signed.extend_from_slice(body.as_bytes());
        let h1 = hmac_hex(&provider.webhook_secret, &signed);
        WebhookEvent {
            event_type: "transaction.completed".into(),
            event_id: "evt_42".into(),
            data: serde_json::from_str(body).unwrap(),
            raw_body: body.as_bytes().to_vec(),
            signature: format!("ts={ts};h1={h1}"),
        }
    }

    #[test]
    fn signature_header_parses() {
        assert_eq!(parse_signature("ts=1700000000;h1=abc"), Some((1_700_000_000, "abc")));
        assert_eq!(parse_signature("h1=abc"), None);
        assert_eq!(parse_signature("garbage"), None);
    }

    #[test]
    fn valid_signature_inside_window() {
        let provider = provider();
        let event = signed_event(&provider, r#"{"data":{}}"#, 1_700_000_000);
        assert!(provider.verify_at(&event, 1_700_000_100));
    }

    #[test]
    fn tampered_body_rejected() {
        let provider = provider();
        let mut event = signed_event(&provider, r#"{"data":{}}"#, 1_700_000_000);
        event.raw_body = br#"{"data":{"amount":"99999"}}"#.to_vec();
        assert!(!provider.verify_at(&event, 1_700_000_100));
    }

    #[test]
    fn stale_timestamp_rejected() {
        let provider = provider();
        let event = signed_event(&provider, r#"{"data":{}}"#, 1_700_000_000);
        assert!(!provider.verify_at(&event, 1_700_000_000 + 301));
    }

    #[tokio::test]
    async fn completed_transaction_parses_to_topup() {
        let provider = provider();
        let account_id = uuid::Uuid::new_v4();
        let body = json!({
            "data": {
                "id": "txn_1",
                "custom_data": { "account_id": account_id },
                "details": { "totals": { "grand_total": "1000" } },
            }
        });
        let event = WebhookEvent {
            event_type: "transaction.completed".into(),
            event_id: "evt_42".into(),
            data: body,
            raw_body: Vec::new(),
            signature: String::new(),
        };

        let charge = provider.process_webhook(&event).await.unwrap().unwrap();
        assert_eq!(charge.account_id, account_id);
        assert_eq!(charge.amount_usd, dec!(10));
        assert_eq!(charge.kind, TransactionKind::Topup);
        assert_eq!(charge.external_id, "txn_1");
    }

    #[tokio::test]
    async fn unrelated_events_ignored() {
        let provider = provider();
        let event = WebhookEvent {
            event_type: "subscription.created".into(),
            event_id: "evt_43".into(),
            data: json!({"data": {}}),
            raw_body: Vec::new(),
            signature: String::new(),
        };
        assert!(provider.process_webhook(&event).await.unwrap().is_none());
    }
}
